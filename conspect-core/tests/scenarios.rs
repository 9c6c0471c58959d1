//! End-to-end pipeline scenarios driven by scripted collaborators.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::{GrayImage, Rgba, RgbaImage};
use parking_lot::Mutex;

use conspect_core::capture::frame::CapturedImage;
use conspect_core::error::Result;
use conspect_core::ocr::{OcrEngine, RawRecognition};
use conspect_core::{
    AudioClass, AudioProbeProvider, BackpressurePolicy, Collaborators, ConspectEngine,
    ConspectError, ContextSnapshot, ContextTag, EngineConfig, MediaInfo, OcrHandle,
    PermissionDecision, PermissionGate, ScreenCapturer, SnapshotKind, Subscription,
};

// ── Scripted collaborators ───────────────────────────────────────────────

struct StaticScreen;

impl ScreenCapturer for StaticScreen {
    fn capture(&mut self) -> Result<CapturedImage> {
        let mut img = RgbaImage::from_pixel(24, 24, Rgba([20, 20, 20, 255]));
        for x in 4..20 {
            img.put_pixel(x, 12, Rgba([240, 240, 240, 255]));
        }
        Ok(CapturedImage::new(img))
    }
}

/// OCR backend whose output is swappable mid-run.
#[derive(Clone)]
struct ScriptedOcr {
    output: Arc<Mutex<(String, f32)>>,
    fail_init: bool,
}

impl ScriptedOcr {
    fn new(text: &str, confidence: f32) -> (Self, Arc<Mutex<(String, f32)>>) {
        let output = Arc::new(Mutex::new((text.to_string(), confidence)));
        (
            Self {
                output: Arc::clone(&output),
                fail_init: false,
            },
            output,
        )
    }
}

impl OcrEngine for ScriptedOcr {
    fn initialize(&mut self, _language: &str) -> Result<()> {
        if self.fail_init {
            return Err(ConspectError::OcrInit("scripted init failure".into()));
        }
        Ok(())
    }

    fn recognize(&mut self, _image: &GrayImage) -> Result<RawRecognition> {
        let (text, confidence) = self.output.lock().clone();
        Ok(RawRecognition {
            text,
            confidence,
            regions: vec![],
        })
    }

    fn terminate(&mut self) {}
}

/// Audio provider whose probe fields are swappable mid-run.
#[derive(Clone, Default)]
struct AudioScript {
    volume: u8,
    media_app: Option<String>,
    media_title: Option<String>,
    processes: Vec<String>,
    /// Alternate between the scripted state and near-silence per poll.
    alternate: bool,
}

struct ScriptedAudio {
    script: Arc<Mutex<AudioScript>>,
    tick: AtomicU32,
}

impl ScriptedAudio {
    fn new(script: AudioScript) -> (Self, Arc<Mutex<AudioScript>>) {
        let script = Arc::new(Mutex::new(script));
        (
            Self {
                script: Arc::clone(&script),
                tick: AtomicU32::new(0),
            },
            script,
        )
    }

    fn muted_phase(&self) -> bool {
        self.script.lock().alternate && self.tick.load(Ordering::Relaxed) % 2 == 1
    }
}

impl AudioProbeProvider for ScriptedAudio {
    fn current_media(&mut self) -> Option<MediaInfo> {
        self.tick.fetch_add(1, Ordering::Relaxed);
        if self.muted_phase() {
            return None;
        }
        let script = self.script.lock();
        if script.media_app.is_none() && script.media_title.is_none() {
            None
        } else {
            Some(MediaInfo {
                app: script.media_app.clone(),
                title: script.media_title.clone(),
            })
        }
    }

    fn active_audio_processes(&mut self) -> Vec<String> {
        if self.muted_phase() {
            return Vec::new();
        }
        self.script.lock().processes.clone()
    }

    fn system_volume(&mut self) -> u8 {
        if self.muted_phase() {
            return 3;
        }
        self.script.lock().volume
    }
}

struct TestGate {
    screen: Arc<AtomicBool>,
}

impl TestGate {
    fn new(granted: bool) -> (Arc<Self>, Arc<AtomicBool>) {
        let screen = Arc::new(AtomicBool::new(granted));
        (
            Arc::new(Self {
                screen: Arc::clone(&screen),
            }),
            screen,
        )
    }
}

impl PermissionGate for TestGate {
    fn request_screen_capture(&self) -> PermissionDecision {
        if self.screen.load(Ordering::SeqCst) {
            PermissionDecision::Granted
        } else {
            PermissionDecision::Denied
        }
    }

    fn request_microphone(&self) -> PermissionDecision {
        PermissionDecision::Denied
    }

    fn screen_capture_granted(&self) -> bool {
        self.screen.load(Ordering::SeqCst)
    }

    fn microphone_granted(&self) -> bool {
        false
    }
}

// ── Harness ──────────────────────────────────────────────────────────────

fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.frame_interval = Duration::from_millis(40);
    config.frame_interval_max = Duration::from_millis(120);
    config.audio_interval = Duration::from_millis(30);
    config.fusion.heartbeat = Duration::from_millis(300);
    config.fusion.modality_timeout = Duration::from_millis(400);
    config
}

fn build_engine(
    ocr: ScriptedOcr,
    audio: ScriptedAudio,
    gate: Arc<TestGate>,
    config: EngineConfig,
) -> Arc<ConspectEngine> {
    Arc::new(ConspectEngine::new(
        config,
        Collaborators {
            capturer: Box::new(StaticScreen),
            ocr: OcrHandle::new(ocr),
            audio: Box::new(audio),
            permissions: gate,
            metrics_sink: None,
        },
    ))
}

/// Stops the engine when a test unwinds, so the lanes cannot outlive a
/// failed assertion and wedge the runtime shutdown.
struct EngineGuard(Arc<ConspectEngine>);

impl Drop for EngineGuard {
    fn drop(&mut self) {
        let _ = self.0.stop();
    }
}

fn wait_for_snapshot<F>(
    subscription: &Subscription,
    timeout: Duration,
    mut predicate: F,
) -> Arc<ContextSnapshot>
where
    F: FnMut(&ContextSnapshot) -> bool,
{
    let deadline = Instant::now() + timeout;
    let mut last: Option<Arc<ContextSnapshot>> = None;
    while Instant::now() < deadline {
        if let Some(snapshot) = subscription.recv_timeout(Duration::from_millis(50)) {
            if predicate(&snapshot) {
                return snapshot;
            }
            last = Some(snapshot);
        }
    }
    panic!("timed out waiting for matching snapshot; last seen: {last:?}");
}

// ── End-to-end scenarios ─────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn music_session_from_spotify_probe_and_blank_screen() {
    let (ocr, _) = ScriptedOcr::new("", 0.05);
    let (audio, _) = ScriptedAudio::new(AudioScript {
        volume: 72,
        media_app: Some("Spotify".into()),
        media_title: Some("X".into()),
        ..AudioScript::default()
    });
    let (gate, _) = TestGate::new(true);
    let engine = build_engine(ocr, audio, gate, fast_config());

    let _guard = EngineGuard(Arc::clone(&engine));
    engine.request_permissions();
    engine.start().expect("engine starts");
    let sub = engine.subscribe(None, Some(BackpressurePolicy::DropOldest));

    let snap = wait_for_snapshot(&sub, Duration::from_secs(3), |s| {
        s.primary == ContextTag::MusicSession
    });
    assert_eq!(snap.audio.class, AudioClass::Music);
    assert!(snap.screen.digest.is_empty());
    assert!(
        (0.35..=0.42).contains(&snap.confidence),
        "confidence {} outside the expected band",
        snap.confidence
    );

    engine.stop().expect("engine stops");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn focused_work_from_editor_text_and_silence() {
    let (ocr, _) = ScriptedOcr::new("fn main() { import parser; } >>> run", 0.78);
    let (audio, _) = ScriptedAudio::new(AudioScript {
        volume: 3,
        ..AudioScript::default()
    });
    let (gate, _) = TestGate::new(true);
    let engine = build_engine(ocr, audio, gate, fast_config());

    let _guard = EngineGuard(Arc::clone(&engine));
    engine.request_permissions();
    engine.start().expect("engine starts");
    let sub = engine.subscribe(None, Some(BackpressurePolicy::DropOldest));

    // Wait for an emission computed from a fresh (undecayed) screen
    // summary: 0.6·0.78 + 0.4·(0.90..=0.95 with streak boost).
    let snap = wait_for_snapshot(&sub, Duration::from_secs(4), |s| {
        s.primary == ContextTag::FocusedWork
            && !s.screen.digest.is_empty()
            && (0.80..=0.87).contains(&s.confidence)
    });
    assert_eq!(snap.audio.class, AudioClass::Silence);
    assert!((snap.correlation - 1.0).abs() < 1e-6);

    engine.stop().expect("engine stops");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn meeting_from_call_audio_and_meeting_keywords() {
    let (ocr, _) = ScriptedOcr::new("Mute  Leave meeting  Participants (4)", 0.85);
    let (audio, _) = ScriptedAudio::new(AudioScript {
        volume: 40,
        processes: vec!["zoom.us".into()],
        ..AudioScript::default()
    });
    let (gate, _) = TestGate::new(true);
    let engine = build_engine(ocr, audio, gate, fast_config());

    let _guard = EngineGuard(Arc::clone(&engine));
    engine.request_permissions();
    engine.start().expect("engine starts");
    let sub = engine.subscribe(None, Some(BackpressurePolicy::DropOldest));

    // Both modalities agree once call audio and meeting text are in; wait
    // for an emission where the screen summary is fresh.
    let snap = wait_for_snapshot(&sub, Duration::from_secs(4), |s| {
        s.primary == ContextTag::Meeting
            && s.audio.class == AudioClass::Call
            && !s.screen.digest.is_empty()
            && s.confidence >= 0.8
    });
    assert!((snap.correlation - 1.0).abs() < 1e-6);

    engine.stop().expect("engine stops");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn conflicting_modalities_yield_meeting_with_zero_correlation() {
    let (ocr, _) = ScriptedOcr::new("fn main() { import parser; }", 0.7);
    let (audio, _) = ScriptedAudio::new(AudioScript {
        volume: 40,
        processes: vec!["zoom.us".into()],
        ..AudioScript::default()
    });
    let (gate, _) = TestGate::new(true);
    let engine = build_engine(ocr, audio, gate, fast_config());

    let _guard = EngineGuard(Arc::clone(&engine));
    engine.request_permissions();
    engine.start().expect("engine starts");
    let sub = engine.subscribe(None, Some(BackpressurePolicy::DropOldest));

    let snap = wait_for_snapshot(&sub, Duration::from_secs(3), |s| {
        s.primary == ContextTag::Meeting && !s.screen.digest.is_empty()
    });
    assert!((snap.correlation - 0.0).abs() < 1e-6);
    assert!(snap.confidence <= 0.3, "confidence {}", snap.confidence);

    engine.stop().expect("engine stops");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn screen_permission_revoked_mid_run_continues_audio_only() {
    let (ocr, _) = ScriptedOcr::new("fn main() { import parser; }", 0.8);
    let (audio, _) = ScriptedAudio::new(AudioScript {
        volume: 72,
        media_app: Some("Spotify".into()),
        media_title: Some("X".into()),
        ..AudioScript::default()
    });
    let (gate, screen_flag) = TestGate::new(true);
    let engine = build_engine(ocr, audio, gate, fast_config());

    let _guard = EngineGuard(Arc::clone(&engine));
    engine.request_permissions();
    engine.start().expect("engine starts");
    let sub = engine.subscribe(None, Some(BackpressurePolicy::DropOldest));

    // Observe the screen modality first.
    wait_for_snapshot(&sub, Duration::from_secs(3), |s| !s.screen.digest.is_empty());

    screen_flag.store(false, Ordering::SeqCst);

    // After the modality timeout the screen summary empties while audio
    // keeps the stream alive.
    let snap = wait_for_snapshot(&sub, Duration::from_secs(4), |s| {
        s.screen.digest.is_empty() && s.audio.class == AudioClass::Music
    });
    assert_eq!(snap.primary, ContextTag::MusicSession);
    assert!(snap.confidence > 0.0);

    // Heartbeats continue while suspended.
    let hb = wait_for_snapshot(&sub, Duration::from_secs(4), |s| {
        s.kind == SnapshotKind::Heartbeat
    });
    assert!(hb.seq > snap.seq);

    engine.stop().expect("engine stops");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_block_up_to_subscriber_is_demoted() {
    let (ocr, _) = ScriptedOcr::new("", 0.0);
    // Alternating music/silence flips the tag on every classification, so
    // every poll produces a material emission.
    let (audio, _) = ScriptedAudio::new(AudioScript {
        volume: 72,
        media_app: Some("Spotify".into()),
        media_title: Some("X".into()),
        alternate: true,
        ..AudioScript::default()
    });
    let (gate, _) = TestGate::new(true);
    let mut config = fast_config();
    config.audio_interval = Duration::from_millis(20);
    let engine = build_engine(ocr, audio, gate, config);

    let _guard = EngineGuard(Arc::clone(&engine));
    engine.request_permissions();
    engine.start().expect("engine starts");

    // Never consumed: the queue fills, then three timed-out deliveries
    // demote the subscriber.
    let _stalled = engine.subscribe(None, Some(BackpressurePolicy::BlockUpTo(Duration::from_millis(30))));

    let deadline = Instant::now() + Duration::from_secs(10);
    while engine.metrics().slow_subscribers == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(engine.metrics().slow_subscribers, 1);

    engine.stop().expect("engine stops");
}

// ── Lifecycle and invariants ─────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn subscribers_see_strictly_increasing_sequences_and_terminal_snapshot() {
    let (ocr, _) = ScriptedOcr::new("", 0.0);
    let (audio, _) = ScriptedAudio::new(AudioScript {
        volume: 72,
        media_app: Some("Spotify".into()),
        media_title: Some("X".into()),
        alternate: true,
        ..AudioScript::default()
    });
    let (gate, _) = TestGate::new(true);
    let engine = build_engine(ocr, audio, gate, fast_config());

    let _guard = EngineGuard(Arc::clone(&engine));
    engine.request_permissions();
    engine.start().expect("engine starts");
    let sub = engine.subscribe(None, Some(BackpressurePolicy::DropOldest));

    let mut seen: Vec<u64> = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(3);
    while seen.len() < 4 && Instant::now() < deadline {
        if let Some(s) = sub.recv_timeout(Duration::from_millis(100)) {
            assert!(s.confidence >= 0.0 && s.confidence <= 1.0);
            if let (Some(ocr_ts), ts) = (s.ocr_timestamp, s.timestamp) {
                assert!(ocr_ts <= ts);
            }
            if let Some(prev) = seen.last() {
                assert!(s.seq > *prev, "sequence went backwards: {} after {prev}", s.seq);
                assert_eq!(s.parent_seq, Some(*prev));
            }
            seen.push(s.seq);
        }
    }
    assert!(seen.len() >= 4, "only saw {} snapshots", seen.len());

    engine.stop().expect("engine stops");
    let terminal = wait_for_snapshot(&sub, Duration::from_secs(2), |s| {
        s.kind == SnapshotKind::Shutdown
    });
    assert_eq!(terminal.confidence, 0.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn start_twice_errors_and_stop_without_start_errors() {
    let (ocr, _) = ScriptedOcr::new("", 0.0);
    let (audio, _) = ScriptedAudio::new(AudioScript::default());
    let (gate, _) = TestGate::new(true);
    let engine = build_engine(ocr, audio, gate, fast_config());

    assert!(matches!(engine.stop(), Err(ConspectError::NotRunning)));
    let _guard = EngineGuard(Arc::clone(&engine));
    engine.request_permissions();
    engine.start().expect("first start succeeds");
    assert!(matches!(engine.start(), Err(ConspectError::AlreadyRunning)));
    engine.stop().expect("stop succeeds");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ocr_init_failure_degrades_to_audio_only() {
    let (mut ocr, _) = ScriptedOcr::new("never seen", 0.9);
    ocr.fail_init = true;
    let (audio, _) = ScriptedAudio::new(AudioScript {
        volume: 72,
        media_app: Some("Spotify".into()),
        media_title: Some("X".into()),
        ..AudioScript::default()
    });
    let (gate, _) = TestGate::new(true);
    let engine = build_engine(ocr, audio, gate, fast_config());

    let _guard = EngineGuard(Arc::clone(&engine));
    engine.request_permissions();
    engine.start().expect("start succeeds despite OCR failure");
    let sub = engine.subscribe(None, Some(BackpressurePolicy::DropOldest));

    let snap = wait_for_snapshot(&sub, Duration::from_secs(3), |s| {
        s.primary == ContextTag::MusicSession
    });
    assert!(snap.screen.digest.is_empty(), "screen text must never appear");

    engine.stop().expect("engine stops");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn metrics_report_frame_and_emission_rates() {
    let (ocr, _) = ScriptedOcr::new("chapter one introduction", 0.8);
    let (audio, _) = ScriptedAudio::new(AudioScript {
        volume: 3,
        ..AudioScript::default()
    });
    let (gate, _) = TestGate::new(true);
    let engine = build_engine(ocr, audio, gate, fast_config());

    let _guard = EngineGuard(Arc::clone(&engine));
    engine.request_permissions();
    engine.start().expect("engine starts");
    let sub = engine.subscribe(None, Some(BackpressurePolicy::DropOldest));
    wait_for_snapshot(&sub, Duration::from_secs(3), |s| {
        s.primary == ContextTag::Reading
    });

    let metrics = engine.metrics();
    assert!(metrics.frames_per_minute > 0.0);
    assert!(metrics.emissions_per_minute > 0.0);
    assert!(metrics.ocr_avg_confidence > 0.5);
    assert_eq!(metrics.slow_subscribers, 0);

    engine.stop().expect("engine stops");
}
