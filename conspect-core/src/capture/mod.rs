//! Frame source: permission-gated, rate-limited screen frame acquisition.
//!
//! ## State machine
//!
//! ```text
//! Idle → Starting → Capturing ⇄ Degraded
//!                      │  ⇅ Suspended (permission revoked / restored)
//!                      └─► Stopped
//! ```
//!
//! Three consecutive capture failures enter `Degraded`, which doubles the
//! effective interval (capped at `frame_interval_max`); the first subsequent
//! success returns to `Capturing`. While `Suspended` the source emits no
//! frames at all.

pub mod frame;

use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::Result;
use frame::{CapturedImage, Frame};

/// Collaborator that produces raw screen images.
///
/// The OS capture call is the suspension point of the screen lane; the
/// contract is that one call completes (or fails) within the 2 s capture
/// timeout. Implementations are platform-specific; the core is agnostic.
pub trait ScreenCapturer: Send + 'static {
    fn capture(&mut self) -> Result<CapturedImage>;
}

/// Collaborator answering permission requests and reporting revocation.
///
/// `screen_capture_granted` is polled once per cadence so a mid-run
/// revocation suspends the frame source within one interval.
pub trait PermissionGate: Send + Sync + 'static {
    fn request_screen_capture(&self) -> PermissionDecision;
    fn request_microphone(&self) -> PermissionDecision;
    fn screen_capture_granted(&self) -> bool;
    fn microphone_granted(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    Granted,
    Denied,
}

impl PermissionDecision {
    pub fn is_granted(self) -> bool {
        self == PermissionDecision::Granted
    }
}

/// Lifecycle state of the frame source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Idle,
    Starting,
    Capturing,
    /// Repeated capture failures — interval doubled, retrying with jitter.
    Degraded,
    /// Screen permission revoked — zero frames until restored.
    Suspended,
    Stopped,
}

/// Consecutive failures before the lane transitions to `Degraded`.
const DEGRADE_AFTER_FAILURES: u32 = 3;

/// Permission-gated frame producer with failure backoff.
///
/// Owned and driven by the scheduler's screen lane; one `next_frame` call
/// per cadence tick.
pub struct FrameSource {
    capturer: Box<dyn ScreenCapturer>,
    state: SourceState,
    next_id: u64,
    consecutive_failures: u32,
    base_interval: Duration,
    max_interval: Duration,
}

impl FrameSource {
    pub fn new(
        capturer: Box<dyn ScreenCapturer>,
        base_interval: Duration,
        max_interval: Duration,
    ) -> Self {
        Self {
            capturer,
            state: SourceState::Idle,
            next_id: 0,
            consecutive_failures: 0,
            base_interval,
            max_interval,
        }
    }

    /// Transition `Idle → Starting → Capturing` once permission is confirmed.
    /// Idempotent: calling on an already-capturing source is a no-op.
    pub fn start(&mut self, gate: &dyn PermissionGate) -> Result<()> {
        if matches!(self.state, SourceState::Capturing | SourceState::Degraded) {
            return Ok(());
        }
        self.state = SourceState::Starting;
        if !gate.request_screen_capture().is_granted() {
            self.state = SourceState::Suspended;
            return Err(crate::error::ConspectError::PermissionDenied { modality: "screen" });
        }
        self.state = SourceState::Capturing;
        info!("frame source capturing");
        Ok(())
    }

    pub fn stop(&mut self) {
        self.state = SourceState::Stopped;
    }

    pub fn state(&self) -> SourceState {
        self.state
    }

    /// Id that will be assigned to the next emitted frame.
    pub fn latest_frame_id(&self) -> u64 {
        self.next_id
    }

    /// Effective interval for the current state (doubled while `Degraded`,
    /// capped at `max_interval`).
    pub fn effective_interval(&self) -> Duration {
        match self.state {
            SourceState::Degraded => self.base_interval.saturating_mul(2).min(self.max_interval),
            _ => self.base_interval,
        }
    }

    /// Attempt one capture. Returns:
    /// - `Some(frame)` on success;
    /// - `None` while suspended, stopped, or on a transient failure.
    ///
    /// Permission is re-checked on every call; revocation suspends the
    /// source, restoration resumes it.
    pub fn next_frame(&mut self, gate: &dyn PermissionGate) -> Option<Frame> {
        match self.state {
            SourceState::Capturing | SourceState::Degraded => {}
            SourceState::Suspended => {
                if gate.screen_capture_granted() {
                    info!("screen permission restored — resuming capture");
                    self.state = SourceState::Capturing;
                } else {
                    return None;
                }
            }
            _ => return None,
        }

        if !gate.screen_capture_granted() {
            warn!("screen permission revoked — suspending frame source");
            self.state = SourceState::Suspended;
            return None;
        }

        let started = Instant::now();
        match self.capturer.capture() {
            Ok(CapturedImage { pixels }) => {
                if self.state == SourceState::Degraded {
                    info!("capture recovered — leaving degraded state");
                }
                self.state = SourceState::Capturing;
                self.consecutive_failures = 0;

                let id = self.next_id;
                self.next_id += 1;
                let frame = Frame {
                    id,
                    timestamp: Utc::now(),
                    pixels,
                    capture_latency: started.elapsed(),
                };
                debug!(
                    frame_id = id,
                    width = frame.width(),
                    height = frame.height(),
                    latency_ms = frame.capture_latency.as_millis() as u64,
                    "frame captured"
                );
                Some(frame)
            }
            Err(e) => {
                self.consecutive_failures += 1;
                warn!(
                    consecutive = self.consecutive_failures,
                    error = %e,
                    "capture failed"
                );
                if self.consecutive_failures >= DEGRADE_AFTER_FAILURES {
                    if self.state != SourceState::Degraded {
                        warn!(
                            interval_ms = self.effective_interval().as_millis() as u64,
                            "entering degraded capture state"
                        );
                    }
                    self.state = SourceState::Degraded;
                }
                None
            }
        }
    }
}
