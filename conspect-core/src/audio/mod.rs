//! System-audio probing.
//!
//! The OS side (media session queries, audio-session process lists, mixer
//! volume) is platform-specific and hidden behind `AudioProbeProvider`. A
//! dedicated worker thread runs the provider calls so the audio lane's
//! `poll` can enforce the 500 ms budget: on timeout the lane proceeds with
//! an `incomplete` probe instead of blocking the cadence.

pub mod classifier;
pub mod device;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use device::DeviceInfo;

/// Media metadata the OS exposes for the foreground media session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaInfo {
    pub app: Option<String>,
    pub title: Option<String>,
}

/// Collaborator fulfilling the platform audio queries.
///
/// Each method is one OS call; the combined probe must not need more than
/// the 500 ms poll budget on a healthy system. `category_hint` and
/// `microphone_level` have conservative defaults so minimal providers (and
/// test mocks) stay small.
pub trait AudioProbeProvider: Send + 'static {
    fn current_media(&mut self) -> Option<MediaInfo>;
    fn active_audio_processes(&mut self) -> Vec<String>;
    /// Mixer volume in 0–100.
    fn system_volume(&mut self) -> u8;
    /// OS-declared session category (e.g. `"call"`), when available.
    fn category_hint(&mut self) -> Option<String> {
        None
    }
    /// Microphone input level in [0, 1]; only queried when mic permission
    /// is granted.
    fn microphone_level(&mut self) -> Option<f32> {
        None
    }
}

/// Raw reading from the OS at one instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioProbe {
    pub timestamp: DateTime<Utc>,
    /// Mixer volume 0–100.
    pub volume: u8,
    pub media_app: Option<String>,
    pub media_title: Option<String>,
    pub category_hint: Option<String>,
    /// Processes holding active audio sessions.
    pub audio_processes: Vec<String>,
    pub mic_level: Option<f32>,
    pub devices: Vec<DeviceInfo>,
    /// Set when the poll budget expired before all fields were gathered.
    pub incomplete: bool,
}

impl AudioProbe {
    /// Probe carrying no data, marked incomplete. Returned when the poll
    /// budget expires or the worker is gone.
    pub fn incomplete_now() -> Self {
        Self {
            timestamp: Utc::now(),
            volume: 0,
            media_app: None,
            media_title: None,
            category_hint: None,
            audio_processes: Vec::new(),
            mic_level: None,
            devices: Vec::new(),
            incomplete: true,
        }
    }
}

/// Dedicated provider thread plus the request/response channel pair.
///
/// Requests carry a sequence number that the worker echoes back, so a
/// round that completes after its deadline can never be mistaken for the
/// current one.
pub struct ProbeWorker {
    request_tx: Sender<u64>,
    response_rx: Receiver<(u64, AudioProbe)>,
    seq: AtomicU64,
}

impl ProbeWorker {
    /// Spawn the worker thread around `provider`. `mic_enabled` gates the
    /// microphone query and may flip at runtime (permission changes).
    pub fn spawn(mut provider: Box<dyn AudioProbeProvider>, mic_enabled: Arc<AtomicBool>) -> Self {
        let (request_tx, request_rx) = bounded::<u64>(1);
        // One stale response plus the current one can be in flight.
        let (response_tx, response_rx) = bounded::<(u64, AudioProbe)>(2);

        std::thread::Builder::new()
            .name("conspect-audio-probe".into())
            .spawn(move || {
                while let Ok(seq) = request_rx.recv() {
                    let probe = gather(provider.as_mut(), mic_enabled.load(Ordering::Relaxed));
                    if response_tx.send((seq, probe)).is_err() {
                        break;
                    }
                }
                debug!("probe worker exiting");
            })
            .expect("spawn probe worker thread");

        Self {
            request_tx,
            response_rx,
            seq: AtomicU64::new(0),
        }
    }

    /// Poll once, waiting at most `timeout` for the provider round.
    pub fn poll(&self, timeout: Duration) -> AudioProbe {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;

        // Discard responses left over from timed-out rounds.
        while self.response_rx.try_recv().is_ok() {}

        if self.request_tx.try_send(seq).is_err() {
            // Worker still busy with the previous request or gone.
            warn!("probe worker unavailable — returning incomplete probe");
            return AudioProbe::incomplete_now();
        }

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.response_rx.recv_timeout(remaining) {
                Ok((response_seq, probe)) if response_seq == seq => return probe,
                Ok(_) => continue, // stale round finishing late
                Err(_) => break,
            }
        }

        warn!(
            timeout_ms = timeout.as_millis() as u64,
            "audio poll exceeded budget — returning incomplete probe"
        );
        AudioProbe::incomplete_now()
    }
}

fn gather(provider: &mut dyn AudioProbeProvider, include_mic: bool) -> AudioProbe {
    let timestamp = Utc::now();
    let media = provider.current_media().unwrap_or_default();
    let audio_processes = provider.active_audio_processes();
    let volume = provider.system_volume().min(100);
    let category_hint = provider.category_hint();
    let mic_level = if include_mic {
        provider.microphone_level()
    } else {
        None
    };

    AudioProbe {
        timestamp,
        volume,
        media_app: media.app,
        media_title: media.title,
        category_hint,
        audio_processes,
        mic_level,
        devices: device::snapshot(),
        incomplete: false,
    }
}
