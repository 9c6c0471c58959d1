//! Diagnostic runner: drives the full pipeline against synthetic
//! collaborators and prints every emitted snapshot as JSON.
//!
//! ```text
//! cargo run --bin observe -- --duration 20 --frame-ms 500 --audio-ms 300
//! ```

use std::sync::Arc;
use std::time::Duration;

use conspect_core::capture::frame::CapturedImage;
use conspect_core::capture::{PermissionDecision, PermissionGate, ScreenCapturer};
use conspect_core::error::Result;
use conspect_core::ocr::stub::StubOcr;
use conspect_core::{
    AudioProbeProvider, BackpressurePolicy, Collaborators, ConspectEngine, EngineConfig,
    MediaInfo, OcrHandle,
};
use image::{Rgba, RgbaImage};

struct Args {
    duration: Duration,
    frame_interval: Duration,
    audio_interval: Duration,
}

fn parse_args() -> std::result::Result<Args, String> {
    let mut duration = Duration::from_secs(15);
    let mut frame_interval = Duration::from_millis(1_000);
    let mut audio_interval = Duration::from_millis(600);

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--duration" => {
                let v = it.next().ok_or("missing value for --duration")?;
                let secs: u64 = v.parse().map_err(|_| "invalid value for --duration")?;
                duration = Duration::from_secs(secs.clamp(1, 600));
            }
            "--frame-ms" => {
                let v = it.next().ok_or("missing value for --frame-ms")?;
                let ms: u64 = v.parse().map_err(|_| "invalid value for --frame-ms")?;
                frame_interval = Duration::from_millis(ms.clamp(50, 30_000));
            }
            "--audio-ms" => {
                let v = it.next().ok_or("missing value for --audio-ms")?;
                let ms: u64 = v.parse().map_err(|_| "invalid value for --audio-ms")?;
                audio_interval = Duration::from_millis(ms.clamp(50, 30_000));
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }

    Ok(Args {
        duration,
        frame_interval,
        audio_interval,
    })
}

/// Renders alternating light/dark stripes so the stub OCR sees varying
/// content frame to frame.
struct SyntheticScreen {
    counter: u32,
}

impl ScreenCapturer for SyntheticScreen {
    fn capture(&mut self) -> Result<CapturedImage> {
        self.counter += 1;
        let phase = self.counter % 4;
        let mut img = RgbaImage::from_pixel(160, 90, Rgba([30, 30, 30, 255]));
        for y in (0..90).step_by(8 + phase as usize) {
            for x in 0..160 {
                img.put_pixel(x, y, Rgba([230, 230, 230, 255]));
            }
        }
        Ok(CapturedImage::new(img))
    }
}

/// Cycles through quiet → music → call phases.
struct SyntheticAudio {
    tick: u32,
}

impl AudioProbeProvider for SyntheticAudio {
    fn current_media(&mut self) -> Option<MediaInfo> {
        if (self.tick / 10) % 3 == 1 {
            Some(MediaInfo {
                app: Some("Spotify".into()),
                title: Some("Synthetic Groove".into()),
            })
        } else {
            None
        }
    }

    fn active_audio_processes(&mut self) -> Vec<String> {
        self.tick += 1;
        match (self.tick / 10) % 3 {
            1 => vec!["Spotify".into()],
            2 => vec!["zoom.us".into()],
            _ => Vec::new(),
        }
    }

    fn system_volume(&mut self) -> u8 {
        match (self.tick / 10) % 3 {
            1 => 65,
            2 => 40,
            _ => 4,
        }
    }
}

struct OpenGate;

impl PermissionGate for OpenGate {
    fn request_screen_capture(&self) -> PermissionDecision {
        PermissionDecision::Granted
    }

    fn request_microphone(&self) -> PermissionDecision {
        PermissionDecision::Denied
    }

    fn screen_capture_granted(&self) -> bool {
        true
    }

    fn microphone_granted(&self) -> bool {
        false
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("observe: {e}");
            std::process::exit(2);
        }
    };

    let mut config = EngineConfig::default();
    config.frame_interval = args.frame_interval;
    config.frame_interval_max = args.frame_interval * 3;
    config.audio_interval = args.audio_interval;
    config.fusion.heartbeat = Duration::from_secs(5);

    let engine = Arc::new(ConspectEngine::new(
        config,
        Collaborators {
            capturer: Box::new(SyntheticScreen { counter: 0 }),
            ocr: OcrHandle::new(StubOcr::new()),
            audio: Box::new(SyntheticAudio { tick: 0 }),
            permissions: Arc::new(OpenGate),
            metrics_sink: None,
        },
    ));

    engine.request_permissions();
    if let Err(e) = engine.start() {
        eprintln!("observe: engine failed to start: {e}");
        std::process::exit(1);
    }

    let subscription = engine.subscribe(None, Some(BackpressurePolicy::DropOldest));
    let deadline = std::time::Instant::now() + args.duration;

    while std::time::Instant::now() < deadline {
        if let Some(snapshot) = subscription.recv_timeout(Duration::from_millis(250)) {
            match serde_json::to_string(&*snapshot) {
                Ok(line) => println!("{line}"),
                Err(e) => eprintln!("observe: serialize failed: {e}"),
            }
        }
    }

    let metrics = engine.metrics();
    if let Err(e) = engine.stop() {
        eprintln!("observe: stop failed: {e}");
    }
    eprintln!(
        "observe: frames/min={:.1} ocr_avg_conf={:.2} emissions/min={:.1} slow_subs={}",
        metrics.frames_per_minute,
        metrics.ocr_avg_confidence,
        metrics.emissions_per_minute,
        metrics.slow_subscribers
    );

    // Give the lanes a moment to publish the terminal snapshot.
    tokio::time::sleep(Duration::from_millis(300)).await;
    if let Some(last) = engine.latest() {
        eprintln!("observe: final snapshot kind={:?} seq={}", last.kind, last.seq);
    }
}
