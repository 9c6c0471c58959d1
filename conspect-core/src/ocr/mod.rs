//! OCR engine abstraction and result wrapper.
//!
//! The `OcrEngine` trait decouples the pipeline from any specific
//! recognition library (Tesseract bindings, a cloud endpoint, the test
//! stub). The library is an opaque collaborator with the capability set
//! {initialize, recognize, terminate}.
//!
//! `&mut self` on `recognize` intentionally expresses that engines are
//! stateful — loaded language models, internal caches. All mutation is
//! serialised through `OcrHandle`'s `parking_lot::Mutex`, confining the
//! heavyweight engine to one lane at a time.

pub mod cleanup;
pub mod stub;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use image::GrayImage;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;

/// Contract for OCR backends.
pub trait OcrEngine: Send + 'static {
    /// One-time setup: load language data, allocate the recognition session.
    ///
    /// # Errors
    /// An error here is fatal to the OCR lane for the process lifetime; the
    /// fusion engine continues audio-only.
    fn initialize(&mut self, language: &str) -> Result<()>;

    /// Recognize text in a preprocessed (binarized grayscale) image.
    fn recognize(&mut self, image: &GrayImage) -> Result<RawRecognition>;

    /// Release engine resources. Called once at shutdown.
    fn terminate(&mut self);
}

/// Untreated output of an OCR backend, before post-correction.
#[derive(Debug, Clone, Default)]
pub struct RawRecognition {
    pub text: String,
    /// Library-reported aggregate confidence, on the library's own scale
    /// (commonly 0–100). Scaled to [0, 1] by the wrapper.
    pub confidence: f32,
    /// Per-region results, if the library reports them.
    pub regions: Vec<RawRegion>,
}

#[derive(Debug, Clone)]
pub struct RawRegion {
    pub text: String,
    pub confidence: f32,
    pub bounds: Option<RegionBounds>,
}

/// Pixel-space bounding box of a detected text region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionBounds {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// A recognized text region after post-correction and confidence scaling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextRegion {
    pub text: String,
    /// In [0, 1].
    pub confidence: f32,
    pub bounds: Option<RegionBounds>,
}

/// Derived from one frame; immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OcrResult {
    /// Originating frame id.
    pub frame_id: u64,
    /// Cleaned UTF-8 text.
    pub text: String,
    /// Aggregate confidence in [0, 1].
    pub confidence: f32,
    /// Per-line confidences in [0, 1]; the aggregate fanned out when the
    /// library reports no per-region values.
    pub line_confidences: Vec<f32>,
    pub regions: Vec<TextRegion>,
    /// Recognition wall time.
    #[serde(skip, default)]
    pub processing: Duration,
    pub timestamp: DateTime<Utc>,
}

impl OcrResult {
    /// Empty result with zero confidence, used on per-frame recognition
    /// failure so the fusion engine sees the frame rather than a stall.
    pub fn empty(frame_id: u64) -> Self {
        Self {
            frame_id,
            text: String::new(),
            confidence: 0.0,
            line_confidences: Vec::new(),
            regions: Vec::new(),
            processing: Duration::ZERO,
            timestamp: Utc::now(),
        }
    }
}

/// Thread-safe reference-counted handle to any `OcrEngine` implementor.
#[derive(Clone)]
pub struct OcrHandle(pub Arc<Mutex<dyn OcrEngine>>);

impl OcrHandle {
    pub fn new<E: OcrEngine>(engine: E) -> Self {
        Self(Arc::new(Mutex::new(engine)))
    }
}

impl std::fmt::Debug for OcrHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OcrHandle").finish_non_exhaustive()
    }
}

/// Wraps an engine with post-correction and confidence normalization.
pub struct OcrStage {
    engine: OcrHandle,
}

impl OcrStage {
    pub fn new(engine: OcrHandle) -> Self {
        Self { engine }
    }

    /// Initialize the underlying engine for `language`.
    ///
    /// # Errors
    /// Propagates the backend failure; the caller disables the OCR lane.
    pub fn initialize(&self, language: &str) -> Result<()> {
        self.engine.0.lock().initialize(language)
    }

    pub fn terminate(&self) {
        self.engine.0.lock().terminate();
    }

    /// Recognize one preprocessed frame.
    ///
    /// Transient failure is absorbed: the result is `OcrResult::empty` with
    /// confidence 0, never an error.
    pub fn recognize(&self, frame_id: u64, image: &GrayImage) -> OcrResult {
        let started = Instant::now();
        let raw = match self.engine.0.lock().recognize(image) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(frame_id, error = %e, "recognition failed — emitting empty result");
                return OcrResult::empty(frame_id);
            }
        };

        let text = cleanup::apply(&raw.text);
        let confidence = scale_confidence(raw.confidence);

        let regions: Vec<TextRegion> = raw
            .regions
            .iter()
            .map(|r| TextRegion {
                text: cleanup::apply(&r.text),
                confidence: scale_confidence(r.confidence),
                bounds: r.bounds,
            })
            .collect();

        // Per-line confidences: per-region values when reported, otherwise
        // the aggregate reused for every line of the cleaned text.
        let line_confidences: Vec<f32> = if regions.is_empty() {
            text.lines().map(|_| confidence).collect()
        } else {
            regions.iter().map(|r| r.confidence).collect()
        };

        let result = OcrResult {
            frame_id,
            text,
            confidence,
            line_confidences,
            regions,
            processing: started.elapsed(),
            timestamp: Utc::now(),
        };
        debug!(
            frame_id,
            confidence = format_args!("{:.2}", result.confidence),
            chars = result.text.len(),
            elapsed_ms = result.processing.as_millis() as u64,
            "recognition complete"
        );
        result
    }
}

/// Map a library-reported confidence to [0, 1]. Values above 1 are assumed
/// to be percentages.
fn scale_confidence(raw: f32) -> f32 {
    let scaled = if raw > 1.0 { raw / 100.0 } else { raw };
    scaled.clamp(0.0, 1.0)
}
