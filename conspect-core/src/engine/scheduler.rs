//! Worker lanes and cadence control.
//!
//! ## Lanes (all blocking loops under `spawn_blocking`)
//!
//! ```text
//! screen lane : capture → preprocess → OCR  ──┐
//!                                             ├─► fusion lane → broker
//! audio lane  : probe → classify  ────────────┘
//! ```
//!
//! Lanes communicate over bounded crossbeam channels and share no mutable
//! state; the fusion lane is the sole publisher. Each lane checks the
//! running flag at least every `SLEEP_STEP`, so a shutdown unwinds within
//! one cadence interval. Cadences carry ±10% jitter to avoid lockstep with
//! other periodic work on the host.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use crossbeam_channel::{never, select, tick, Receiver, Sender, TrySendError};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::audio::classifier::{AudioClassification, AudioClassifier};
use crate::audio::ProbeWorker;
use crate::broker::SubscriptionBroker;
use crate::capture::{FrameSource, PermissionGate, SourceState};
use crate::fusion::FusionEngine;
use crate::ocr::{OcrResult, OcrStage};
use crate::preprocess::Preprocessor;

/// Granularity of cancellable sleeps and of the fusion ticker.
const SLEEP_STEP: Duration = Duration::from_millis(50);
const FUSION_TICK: Duration = Duration::from_millis(200);

/// Interval between pushes to the observability sink.
const SINK_INTERVAL: Duration = Duration::from_secs(60);

/// Optional write-only observability endpoint. Receives one counter
/// snapshot per minute while the engine runs.
pub trait MetricsSink: Send + 'static {
    fn record(&self, snapshot: &DiagnosticsSnapshot);
}

/// Shared pipeline counters, written by the lanes.
#[derive(Default)]
pub struct Diagnostics {
    pub frames_captured: AtomicUsize,
    pub capture_failures: AtomicUsize,
    pub ocr_results: AtomicUsize,
    pub ocr_empty_results: AtomicUsize,
    /// Sum of OCR confidences in milli-units, for the running average.
    pub ocr_confidence_milli_sum: AtomicU64,
    pub audio_probes: AtomicUsize,
    pub incomplete_probes: AtomicUsize,
    pub emissions: AtomicUsize,
}

impl Diagnostics {
    pub fn reset(&self) {
        self.frames_captured.store(0, Ordering::Relaxed);
        self.capture_failures.store(0, Ordering::Relaxed);
        self.ocr_results.store(0, Ordering::Relaxed);
        self.ocr_empty_results.store(0, Ordering::Relaxed);
        self.ocr_confidence_milli_sum.store(0, Ordering::Relaxed);
        self.audio_probes.store(0, Ordering::Relaxed);
        self.incomplete_probes.store(0, Ordering::Relaxed);
        self.emissions.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            capture_failures: self.capture_failures.load(Ordering::Relaxed),
            ocr_results: self.ocr_results.load(Ordering::Relaxed),
            ocr_empty_results: self.ocr_empty_results.load(Ordering::Relaxed),
            ocr_confidence_milli_sum: self.ocr_confidence_milli_sum.load(Ordering::Relaxed),
            audio_probes: self.audio_probes.load(Ordering::Relaxed),
            incomplete_probes: self.incomplete_probes.load(Ordering::Relaxed),
            emissions: self.emissions.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DiagnosticsSnapshot {
    pub frames_captured: usize,
    pub capture_failures: usize,
    pub ocr_results: usize,
    pub ocr_empty_results: usize,
    pub ocr_confidence_milli_sum: u64,
    pub audio_probes: usize,
    pub incomplete_probes: usize,
    pub emissions: usize,
}

impl DiagnosticsSnapshot {
    /// Average OCR confidence in [0, 1] over the run so far.
    pub fn ocr_avg_confidence(&self) -> f32 {
        if self.ocr_results == 0 {
            return 0.0;
        }
        (self.ocr_confidence_milli_sum as f32 / 1000.0) / self.ocr_results as f32
    }
}

/// ±10% jitter so periodic lanes do not lock step.
fn with_jitter(interval: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(0.9..=1.1);
    interval.mul_f64(factor)
}

/// Sleep in `SLEEP_STEP` increments so cancellation is observed promptly.
fn cancellable_sleep(running: &AtomicBool, total: Duration) {
    let deadline = Instant::now() + total;
    while running.load(Ordering::Relaxed) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return;
        }
        std::thread::sleep(remaining.min(SLEEP_STEP));
    }
}

// ── Screen lane ──────────────────────────────────────────────────────────

pub struct ScreenLaneContext {
    pub source: FrameSource,
    pub gate: Arc<dyn PermissionGate>,
    pub preprocessor: Preprocessor,
    /// `None` when OCR initialization failed: frames are still captured for
    /// cadence/permission bookkeeping but recognition is skipped.
    pub ocr: Option<OcrStage>,
    pub ocr_tx: Sender<OcrResult>,
    pub running: Arc<AtomicBool>,
    pub paused: Arc<AtomicBool>,
    pub diagnostics: Arc<Diagnostics>,
}

/// Run the screen lane until the running flag clears.
pub fn run_screen_lane(mut ctx: ScreenLaneContext) {
    info!("screen lane started");

    while ctx.running.load(Ordering::Relaxed) {
        if ctx.paused.load(Ordering::Relaxed) {
            std::thread::sleep(SLEEP_STEP);
            continue;
        }

        if let Some(frame) = ctx.source.next_frame(ctx.gate.as_ref()) {
            ctx.diagnostics
                .frames_captured
                .fetch_add(1, Ordering::Relaxed);

            if let Some(ocr) = &ctx.ocr {
                let processed = ctx.preprocessor.process(&frame.pixels);
                let result = ocr.recognize(frame.id, &processed);

                ctx.diagnostics.ocr_results.fetch_add(1, Ordering::Relaxed);
                if result.text.is_empty() {
                    ctx.diagnostics
                        .ocr_empty_results
                        .fetch_add(1, Ordering::Relaxed);
                }
                ctx.diagnostics
                    .ocr_confidence_milli_sum
                    .fetch_add((result.confidence * 1000.0) as u64, Ordering::Relaxed);

                match ctx.ocr_tx.try_send(result) {
                    Ok(()) => {}
                    Err(TrySendError::Full(result)) => {
                        // Fusion lane is behind; this frame's text is stale
                        // by the next cadence anyway.
                        debug!(frame_id = result.frame_id, "fusion busy — OCR result dropped");
                    }
                    Err(TrySendError::Disconnected(_)) => break,
                }
            }
            // Frame dropped here: never retained past its OCR result.
        } else if matches!(
            ctx.source.state(),
            SourceState::Capturing | SourceState::Degraded
        ) {
            // A None from an active source is a transient capture failure;
            // Suspended and Stopped produce None without attempting capture.
            ctx.diagnostics
                .capture_failures
                .fetch_add(1, Ordering::Relaxed);
        }

        let interval = with_jitter(ctx.source.effective_interval());
        cancellable_sleep(&ctx.running, interval);
    }

    if let Some(ocr) = &ctx.ocr {
        ocr.terminate();
    }
    ctx.source.stop();
    info!("screen lane stopped");
}

// ── Audio lane ───────────────────────────────────────────────────────────

pub struct AudioLaneContext {
    pub worker: ProbeWorker,
    pub classifier: AudioClassifier,
    pub audio_tx: Sender<AudioClassification>,
    pub running: Arc<AtomicBool>,
    pub paused: Arc<AtomicBool>,
    pub gate: Arc<dyn PermissionGate>,
    pub mic_enabled: Arc<AtomicBool>,
    pub interval: Duration,
    pub poll_budget: Duration,
    pub diagnostics: Arc<Diagnostics>,
}

/// Run the audio lane until the running flag clears.
pub fn run_audio_lane(mut ctx: AudioLaneContext) {
    info!("audio lane started");

    while ctx.running.load(Ordering::Relaxed) {
        if ctx.paused.load(Ordering::Relaxed) {
            std::thread::sleep(SLEEP_STEP);
            continue;
        }

        // Permission may change mid-run; the probe worker reads this flag
        // before each microphone query.
        ctx.mic_enabled
            .store(ctx.gate.microphone_granted(), Ordering::Relaxed);

        let probe = ctx.worker.poll(ctx.poll_budget);
        ctx.diagnostics.audio_probes.fetch_add(1, Ordering::Relaxed);
        if probe.incomplete {
            ctx.diagnostics
                .incomplete_probes
                .fetch_add(1, Ordering::Relaxed);
        }

        let classification = ctx.classifier.classify(&probe);
        match ctx.audio_tx.try_send(classification) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!("fusion busy — audio classification dropped");
            }
            Err(TrySendError::Disconnected(_)) => break,
        }

        cancellable_sleep(&ctx.running, with_jitter(ctx.interval));
    }

    info!("audio lane stopped");
}

// ── Fusion lane ──────────────────────────────────────────────────────────

pub struct FusionLaneContext {
    pub fusion: FusionEngine,
    pub broker: Arc<SubscriptionBroker>,
    pub ocr_rx: Receiver<OcrResult>,
    pub audio_rx: Receiver<AudioClassification>,
    pub running: Arc<AtomicBool>,
    pub diagnostics: Arc<Diagnostics>,
    pub metrics_sink: Option<Box<dyn MetricsSink>>,
}

/// Run the fusion lane until the running flag clears, then publish the
/// terminal shutdown snapshot.
pub fn run_fusion_lane(mut ctx: FusionLaneContext) {
    info!("fusion lane started");

    let ticker = tick(FUSION_TICK);
    let never_ocr = never::<OcrResult>();
    let never_audio = never::<AudioClassification>();
    let mut ocr_alive = true;
    let mut audio_alive = true;
    let mut last_sink_push = Instant::now();

    while ctx.running.load(Ordering::Relaxed) {
        let ocr_ch = if ocr_alive { &ctx.ocr_rx } else { &never_ocr };
        let audio_ch = if audio_alive {
            &ctx.audio_rx
        } else {
            &never_audio
        };

        select! {
            recv(ocr_ch) -> msg => match msg {
                Ok(result) => {
                    if let Some(snapshot) = ctx.fusion.ingest_ocr(result) {
                        ctx.diagnostics.emissions.fetch_add(1, Ordering::Relaxed);
                        ctx.broker.publish(snapshot);
                    }
                }
                Err(_) => {
                    warn!("OCR channel closed — fusion continues audio-only");
                    ocr_alive = false;
                }
            },
            recv(audio_ch) -> msg => match msg {
                Ok(classification) => {
                    if let Some(snapshot) = ctx.fusion.ingest_audio(classification) {
                        ctx.diagnostics.emissions.fetch_add(1, Ordering::Relaxed);
                        ctx.broker.publish(snapshot);
                    }
                }
                Err(_) => {
                    warn!("audio channel closed — fusion continues screen-only");
                    audio_alive = false;
                }
            },
            recv(ticker) -> _ => {
                if let Some(snapshot) = ctx.fusion.on_tick() {
                    ctx.diagnostics.emissions.fetch_add(1, Ordering::Relaxed);
                    ctx.broker.publish(snapshot);
                }
                if let Some(sink) = &ctx.metrics_sink {
                    if last_sink_push.elapsed() >= SINK_INTERVAL {
                        sink.record(&ctx.diagnostics.snapshot());
                        last_sink_push = Instant::now();
                    }
                }
            },
        }
    }

    // Cooperative shutdown: every subscriber sees the terminal snapshot.
    let terminal = ctx.fusion.terminal();
    ctx.diagnostics.emissions.fetch_add(1, Ordering::Relaxed);
    ctx.broker.publish(terminal);

    let snap = ctx.diagnostics.snapshot();
    info!(
        frames_captured = snap.frames_captured,
        capture_failures = snap.capture_failures,
        ocr_results = snap.ocr_results,
        ocr_empty_results = snap.ocr_empty_results,
        audio_probes = snap.audio_probes,
        incomplete_probes = snap.incomplete_probes,
        emissions = snap.emissions,
        "fusion lane stopped — diagnostics"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_ten_percent() {
        let base = Duration::from_millis(1000);
        for _ in 0..100 {
            let jittered = with_jitter(base);
            assert!(jittered >= Duration::from_millis(900));
            assert!(jittered <= Duration::from_millis(1100));
        }
    }

    #[test]
    fn cancellable_sleep_returns_promptly_on_cancel() {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let handle = std::thread::spawn(move || {
            let start = Instant::now();
            cancellable_sleep(&flag, Duration::from_secs(10));
            start.elapsed()
        });
        std::thread::sleep(Duration::from_millis(30));
        running.store(false, Ordering::SeqCst);
        let elapsed = handle.join().unwrap();
        assert!(elapsed < Duration::from_secs(1), "slept {elapsed:?}");
    }

    #[test]
    fn diagnostics_average_confidence() {
        let d = Diagnostics::default();
        d.ocr_results.store(4, Ordering::Relaxed);
        d.ocr_confidence_milli_sum.store(2600, Ordering::Relaxed);
        let snap = d.snapshot();
        assert!((snap.ocr_avg_confidence() - 0.65).abs() < 1e-3);
    }

    #[test]
    fn diagnostics_reset_zeroes_counters() {
        let d = Diagnostics::default();
        d.frames_captured.store(10, Ordering::Relaxed);
        d.emissions.store(5, Ordering::Relaxed);
        d.reset();
        let snap = d.snapshot();
        assert_eq!(snap.frames_captured, 0);
        assert_eq!(snap.emissions, 0);
    }
}
