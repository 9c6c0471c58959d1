//! `ConspectEngine` — top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! ConspectEngine::new()
//!     └─► request_permissions() → screen/mic granted or denied
//!         └─► start()           → three lanes spawned, status = Observing
//!             ├─► pause()/resume()
//!             └─► stop()        → running=false, lanes drain, terminal
//!                                 snapshot published, status = Stopped
//! ```
//!
//! `start()`/`stop()` are idempotent: calling them in the wrong state
//! returns an error rather than panicking. One engine instance drives one
//! observation run; the collaborators move into the lanes at `start()`.
//!
//! ## Threading
//!
//! All lanes are blocking loops in `spawn_blocking`; the async executor
//! stays free for consumers. The engine handle itself is `Send + Sync` —
//! all fields use interior mutability — so it can live in an
//! `Arc<ConspectEngine>` shared with subscriber tasks.

pub mod scheduler;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use crossbeam_channel::bounded;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::audio::classifier::AudioClassifier;
use crate::audio::{AudioProbeProvider, ProbeWorker};
use crate::broker::{
    BackpressurePolicy, BrokerConfig, FilterPredicate, Subscription, SubscriptionBroker,
};
use crate::capture::{FrameSource, PermissionDecision, PermissionGate, ScreenCapturer};
use crate::error::{ConspectError, Result};
use crate::fusion::context::ContextSnapshot;
use crate::fusion::{FusionConfig, FusionEngine};
use crate::ocr::{OcrHandle, OcrStage};
use crate::preprocess::{PreprocessConfig, Preprocessor};
use scheduler::{Diagnostics, MetricsSink};

/// Channel depth between the producer lanes and fusion.
const LANE_CHANNEL_CAP: usize = 4;
/// Status broadcast capacity.
const STATUS_BROADCAST_CAP: usize = 64;

/// Configuration for `ConspectEngine`. Every field has a working default.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Nominal frame cadence. Default: 5 s.
    pub frame_interval: Duration,
    /// Upper bound on the frame cadence while degraded. Default: 15 s.
    pub frame_interval_max: Duration,
    /// Audio poll cadence. Default: 3 s.
    pub audio_interval: Duration,
    /// Budget for one audio poll round. Default: 500 ms.
    pub audio_poll_budget: Duration,
    /// Image preprocessing parameters.
    pub preprocess: PreprocessConfig,
    /// OCR language passed to the engine at initialization. Default: "eng".
    pub ocr_language: String,
    /// Fusion parameters, including the keyword/stopword sets.
    pub fusion: FusionConfig,
    /// Broker parameters (history depth, default backpressure policy).
    pub broker: BrokerConfig,
    /// Process names treated as media players.
    pub known_media_apps: Vec<String>,
    /// Process names treated as call applications.
    pub known_call_apps: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_millis(5_000),
            frame_interval_max: Duration::from_millis(15_000),
            audio_interval: Duration::from_millis(3_000),
            audio_poll_budget: Duration::from_millis(500),
            preprocess: PreprocessConfig::default(),
            ocr_language: "eng".into(),
            fusion: FusionConfig::default(),
            broker: BrokerConfig::default(),
            known_media_apps: names(&[
                "spotify", "vlc", "itunes", "music", "tidal", "deezer", "foobar",
            ]),
            known_call_apps: names(&[
                "zoom", "teams", "meet", "discord", "slack", "webex", "facetime", "skype",
            ]),
        }
    }
}

fn names(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// The external collaborators the engine is wired to at construction.
pub struct Collaborators {
    pub capturer: Box<dyn ScreenCapturer>,
    pub ocr: OcrHandle,
    pub audio: Box<dyn AudioProbeProvider>,
    pub permissions: Arc<dyn PermissionGate>,
    /// Optional once-per-minute counter sink; counters stay in memory only
    /// when absent.
    pub metrics_sink: Option<Box<dyn MetricsSink>>,
}

/// Current state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    /// Created but `start()` not yet called.
    Idle,
    Starting,
    /// Lanes running, snapshots flowing.
    Observing,
    /// Acquisition suspended; heartbeats continue.
    Paused,
    Stopped,
    /// Unrecoverable error — a new engine instance is required.
    Error,
}

/// Broadcast on every status transition.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatusEvent {
    pub status: EngineStatus,
    pub detail: Option<String>,
}

/// Outcome of `request_permissions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionsOutcome {
    pub screen: PermissionDecision,
    pub microphone: PermissionDecision,
}

/// Consumer-facing rate counters.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub frames_per_minute: f32,
    pub ocr_avg_confidence: f32,
    pub emissions_per_minute: f32,
    pub slow_subscribers: usize,
}

/// Seeds consumed when the lanes spawn.
struct LaneSeeds {
    capturer: Box<dyn ScreenCapturer>,
    ocr: OcrHandle,
    audio: Box<dyn AudioProbeProvider>,
    metrics_sink: Option<Box<dyn MetricsSink>>,
}

/// The top-level engine handle.
pub struct ConspectEngine {
    config: EngineConfig,
    seeds: Mutex<Option<LaneSeeds>>,
    permissions: Arc<dyn PermissionGate>,
    running: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    mic_enabled: Arc<AtomicBool>,
    status: Arc<Mutex<EngineStatus>>,
    status_tx: broadcast::Sender<EngineStatusEvent>,
    broker: Arc<SubscriptionBroker>,
    diagnostics: Arc<Diagnostics>,
    started_at: Mutex<Option<Instant>>,
}

impl ConspectEngine {
    /// Create a new engine. Does not touch the OS — call
    /// `request_permissions()` then `start()`.
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_BROADCAST_CAP);
        let broker = Arc::new(SubscriptionBroker::new(config.broker.clone()));

        Self {
            seeds: Mutex::new(Some(LaneSeeds {
                capturer: collaborators.capturer,
                ocr: collaborators.ocr,
                audio: collaborators.audio,
                metrics_sink: collaborators.metrics_sink,
            })),
            permissions: collaborators.permissions,
            config,
            running: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(AtomicBool::new(false)),
            mic_enabled: Arc::new(AtomicBool::new(false)),
            status: Arc::new(Mutex::new(EngineStatus::Idle)),
            status_tx,
            broker,
            diagnostics: Arc::new(Diagnostics::default()),
            started_at: Mutex::new(None),
        }
    }

    /// Ask the permission gate for both capture permissions.
    ///
    /// Screen denial is surfaced to the caller; microphone denial only
    /// means probes carry no mic level.
    pub fn request_permissions(&self) -> PermissionsOutcome {
        let screen = self.permissions.request_screen_capture();
        let microphone = self.permissions.request_microphone();
        self.mic_enabled
            .store(microphone.is_granted(), Ordering::Relaxed);
        info!(?screen, ?microphone, "permissions requested");
        PermissionsOutcome { screen, microphone }
    }

    /// Spawn the three lanes and begin observing.
    ///
    /// OCR initialization failure and screen-permission denial do not fail
    /// the start: the pipeline runs with the surviving modality and the
    /// condition is reported through status events and metrics.
    ///
    /// # Errors
    /// - `ConspectError::AlreadyRunning` if already started.
    /// - `ConspectError::NotRunning` if this instance already completed a
    ///   run (collaborators were consumed).
    pub fn start(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(ConspectError::AlreadyRunning);
        }

        let seeds = self
            .seeds
            .lock()
            .take()
            .ok_or(ConspectError::NotRunning)?;

        self.set_status(EngineStatus::Starting, None);
        self.diagnostics.reset();

        // OCR init failure is fatal to that lane only: the pipeline runs
        // audio-only for the process lifetime.
        let ocr_stage = OcrStage::new(seeds.ocr);
        let ocr_stage = match ocr_stage.initialize(&self.config.ocr_language) {
            Ok(()) => Some(ocr_stage),
            Err(e) => {
                warn!(error = %e, "OCR initialization failed — continuing audio-only");
                let _ = self.status_tx.send(EngineStatusEvent {
                    status: EngineStatus::Starting,
                    detail: Some(format!("OCR disabled: {e}")),
                });
                None
            }
        };

        let mut source = FrameSource::new(
            seeds.capturer,
            self.config.frame_interval,
            self.config.frame_interval_max,
        );
        if let Err(e) = source.start(self.permissions.as_ref()) {
            // Frame source stays suspended; audio continues. Screen
            // permission denial is the one capture error the caller sees.
            warn!(error = %e, "frame source start failed — screen lane suspended");
        }

        self.running.store(true, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
        *self.started_at.lock() = Some(Instant::now());

        let (ocr_tx, ocr_rx) = bounded(LANE_CHANNEL_CAP);
        let (audio_tx, audio_rx) = bounded(LANE_CHANNEL_CAP);

        // ── Screen lane ──────────────────────────────────────────────────
        let screen_ctx = scheduler::ScreenLaneContext {
            source,
            gate: Arc::clone(&self.permissions),
            preprocessor: Preprocessor::new(self.config.preprocess.clone()),
            ocr: ocr_stage,
            ocr_tx,
            running: Arc::clone(&self.running),
            paused: Arc::clone(&self.paused),
            diagnostics: Arc::clone(&self.diagnostics),
        };
        tokio::task::spawn_blocking(move || scheduler::run_screen_lane(screen_ctx));

        // ── Audio lane ───────────────────────────────────────────────────
        let audio_ctx = scheduler::AudioLaneContext {
            worker: ProbeWorker::spawn(seeds.audio, Arc::clone(&self.mic_enabled)),
            classifier: AudioClassifier::new(
                self.config.known_media_apps.clone(),
                self.config.known_call_apps.clone(),
            ),
            audio_tx,
            running: Arc::clone(&self.running),
            paused: Arc::clone(&self.paused),
            gate: Arc::clone(&self.permissions),
            mic_enabled: Arc::clone(&self.mic_enabled),
            interval: self.config.audio_interval,
            poll_budget: self.config.audio_poll_budget,
            diagnostics: Arc::clone(&self.diagnostics),
        };
        tokio::task::spawn_blocking(move || scheduler::run_audio_lane(audio_ctx));

        // ── Fusion lane ──────────────────────────────────────────────────
        // The decay step tracks the configured frame cadence.
        let mut fusion_config = self.config.fusion.clone();
        fusion_config.frame_cadence = self.config.frame_interval;
        let fusion_ctx = scheduler::FusionLaneContext {
            fusion: FusionEngine::new(fusion_config),
            broker: Arc::clone(&self.broker),
            ocr_rx,
            audio_rx,
            running: Arc::clone(&self.running),
            diagnostics: Arc::clone(&self.diagnostics),
            metrics_sink: seeds.metrics_sink,
        };
        tokio::task::spawn_blocking(move || scheduler::run_fusion_lane(fusion_ctx));

        self.set_status(EngineStatus::Observing, None);
        info!("engine started — observing");
        Ok(())
    }

    /// Request cooperative shutdown. Lanes unwind within one cadence
    /// interval; subscribers receive a terminal snapshot.
    ///
    /// # Errors
    /// - `ConspectError::NotRunning` if not currently running.
    pub fn stop(&self) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(ConspectError::NotRunning);
        }
        self.running.store(false, Ordering::SeqCst);
        self.set_status(EngineStatus::Stopped, None);
        info!("engine stop requested");
        Ok(())
    }

    /// Suspend acquisition without tearing lanes down. Heartbeats continue
    /// so subscribers still observe liveness.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.set_status(EngineStatus::Paused, None);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.set_status(EngineStatus::Observing, None);
    }

    pub fn status(&self) -> EngineStatus {
        *self.status.lock()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<EngineStatusEvent> {
        self.status_tx.subscribe()
    }

    // ── Consumer API ─────────────────────────────────────────────────────

    /// Register a snapshot subscriber.
    pub fn subscribe(
        &self,
        filter: Option<FilterPredicate>,
        policy: Option<BackpressurePolicy>,
    ) -> Subscription {
        self.broker.subscribe(filter, policy)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.broker.unsubscribe(id);
    }

    /// Last emitted snapshot; `None` until the first emission.
    pub fn latest(&self) -> Option<Arc<ContextSnapshot>> {
        self.broker.latest()
    }

    /// Up to the `n` most recent snapshots, oldest first.
    pub fn history(&self, n: usize) -> Vec<Arc<ContextSnapshot>> {
        self.broker.history(n)
    }

    /// Rates over the current run plus the slow-subscriber count.
    pub fn metrics(&self) -> Metrics {
        let snap = self.diagnostics.snapshot();
        let minutes = self
            .started_at
            .lock()
            .map(|at| at.elapsed().as_secs_f32() / 60.0)
            .unwrap_or(0.0)
            .max(1.0 / 60.0); // floor at one second of run time

        Metrics {
            frames_per_minute: snap.frames_captured as f32 / minutes,
            ocr_avg_confidence: snap.ocr_avg_confidence(),
            emissions_per_minute: snap.emissions as f32 / minutes,
            slow_subscribers: self.broker.slow_subscriber_count(),
        }
    }

    /// Raw counter snapshot for diagnostics.
    pub fn diagnostics_snapshot(&self) -> scheduler::DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    // ── Internal helpers ─────────────────────────────────────────────────

    fn set_status(&self, new_status: EngineStatus, detail: Option<String>) {
        *self.status.lock() = new_status;
        let _ = self.status_tx.send(EngineStatusEvent {
            status: new_status,
            detail,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.frame_interval, Duration::from_millis(5_000));
        assert_eq!(config.frame_interval_max, Duration::from_millis(15_000));
        assert_eq!(config.audio_interval, Duration::from_millis(3_000));
        assert_eq!(config.audio_poll_budget, Duration::from_millis(500));
        assert_eq!(config.ocr_language, "eng");
        assert!((config.fusion.min_ocr_confidence - 0.3).abs() < 1e-6);
        assert_eq!(config.fusion.heartbeat, Duration::from_millis(30_000));
        assert!((config.fusion.confidence_delta - 0.15).abs() < 1e-6);
        assert_eq!(config.broker.history_size, 100);
        assert_eq!(
            config.broker.default_policy,
            BackpressurePolicy::CoalesceLatest
        );
        assert!(config.known_media_apps.iter().any(|a| a == "spotify"));
        assert!(config.known_call_apps.iter().any(|a| a == "zoom"));
    }

    #[test]
    fn status_event_serializes_lowercase() {
        let event = EngineStatusEvent {
            status: EngineStatus::Observing,
            detail: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["status"], "observing");
    }
}
