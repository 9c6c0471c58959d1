//! `StubOcr` — placeholder backend that reports image metadata without real
//! recognition.
//!
//! Used in development and in the diagnostic binary so the full pipeline can
//! be exercised end-to-end before a real OCR library is wired in.

use image::GrayImage;
use tracing::debug;

use crate::error::Result;
use crate::ocr::{OcrEngine, RawRecognition};

/// Echo-style stub engine.
///
/// Reports the fraction of lit pixels as text and a fixed mid confidence.
/// An all-black image yields empty text with confidence 0.
pub struct StubOcr {
    initialized: bool,
    frame_count: u32,
}

impl StubOcr {
    pub fn new() -> Self {
        Self {
            initialized: false,
            frame_count: 0,
        }
    }
}

impl Default for StubOcr {
    fn default() -> Self {
        Self::new()
    }
}

impl OcrEngine for StubOcr {
    fn initialize(&mut self, language: &str) -> Result<()> {
        debug!(language, "StubOcr::initialize");
        self.initialized = true;
        Ok(())
    }

    fn recognize(&mut self, image: &GrayImage) -> Result<RawRecognition> {
        if !self.initialized {
            return Err(crate::error::ConspectError::OcrRecognize(
                "stub engine not initialized".into(),
            ));
        }
        self.frame_count += 1;
        let total = image.as_raw().len().max(1);
        let lit = image.as_raw().iter().filter(|&&v| v > 0).count();

        if lit == 0 {
            return Ok(RawRecognition::default());
        }

        Ok(RawRecognition {
            text: format!(
                "[stub frame {}: {}x{} px, {:.0}% lit]",
                self.frame_count,
                image.width(),
                image.height(),
                100.0 * lit as f32 / total as f32
            ),
            confidence: 50.0,
            regions: vec![],
        })
    }

    fn terminate(&mut self) {
        debug!("StubOcr::terminate");
        self.initialized = false;
    }
}
