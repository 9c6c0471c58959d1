//! Typed screen frame passed from the frame source to the preprocessing
//! and OCR stages.

use chrono::{DateTime, Utc};
use image::RgbaImage;
use std::time::Duration;

/// One captured screen image.
///
/// Exclusively owned by the capture → preprocess → OCR chain; dropped once
/// an `OcrResult` has been derived. Never exposed to subscribers.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonic frame id, unique and ascending within one engine run.
    pub id: u64,
    /// Wall-clock capture time.
    pub timestamp: DateTime<Utc>,
    /// RGBA pixel buffer at source resolution.
    pub pixels: RgbaImage,
    /// How long the OS capture call took.
    pub capture_latency: Duration,
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }
}

/// Raw output of a `ScreenCapturer` before the frame source stamps identity.
#[derive(Debug, Clone)]
pub struct CapturedImage {
    pub pixels: RgbaImage,
}

impl CapturedImage {
    pub fn new(pixels: RgbaImage) -> Self {
        Self { pixels }
    }
}
