//! Image preprocessing ahead of OCR.
//!
//! ## Pipeline stages (per frame)
//!
//! ```text
//! 1. Weighted grayscale  (R·0.299 + G·0.587 + B·0.114)
//! 2. Linear contrast stretch about 128 (factor 1.2–1.8)
//! 3. One pass of the 3×3 sharpen kernel [[0,-1,0],[-1,5,-1],[0,-1,0]]
//! 4. Adaptive binarization: local mean over a B×B block minus offset C
//! ```
//!
//! Deterministic for identical input. The source frame buffer is never
//! mutated; one scratch buffer equal in size to the frame is allocated per
//! call and reused across stages.

use image::{GrayImage, RgbaImage};

/// Stage parameters. Field defaults mirror `EngineConfig`.
#[derive(Debug, Clone)]
pub struct PreprocessConfig {
    /// Contrast stretch factor, clamped to [1.2, 1.8] at use.
    pub contrast: f32,
    /// Side of the adaptive-threshold neighborhood in pixels (odd).
    pub adaptive_block: u32,
    /// Subtracted from the local mean before comparison.
    pub adaptive_offset: i16,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            contrast: 1.5,
            adaptive_block: 15,
            adaptive_offset: 10,
        }
    }
}

/// Runs the full preprocessing chain on one frame.
#[derive(Debug, Clone, Default)]
pub struct Preprocessor {
    config: PreprocessConfig,
}

impl Preprocessor {
    pub fn new(config: PreprocessConfig) -> Self {
        Self { config }
    }

    /// Produce a binarized grayscale image ready for OCR.
    ///
    /// `pixels` is read-only; the result is a new buffer of equal dimensions.
    pub fn process(&self, pixels: &RgbaImage) -> GrayImage {
        let (w, h) = (pixels.width(), pixels.height());
        let factor = self.config.contrast.clamp(1.2, 1.8);

        // Stage 1 + 2 fused: grayscale and contrast stretch per pixel.
        let mut out: Vec<u8> = Vec::with_capacity((w * h) as usize);
        for p in pixels.pixels() {
            let [r, g, b, _] = p.0;
            let gray = 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
            let stretched = (gray - 128.0) * factor + 128.0;
            out.push(stretched.clamp(0.0, 255.0) as u8);
        }

        // Stage 3: sharpen. Scratch holds the pre-sharpen image.
        let mut scratch = out.clone();
        sharpen_3x3(&scratch, &mut out, w as usize, h as usize);

        // Stage 4: adaptive mean threshold. Reuse the scratch as the source.
        scratch.copy_from_slice(&out);
        adaptive_threshold(
            &scratch,
            &mut out,
            w as usize,
            h as usize,
            self.config.adaptive_block.max(3) as usize,
            self.config.adaptive_offset,
        );

        GrayImage::from_raw(w, h, out).expect("buffer matches dimensions")
    }
}

/// 3×3 sharpening kernel [[0,-1,0],[-1,5,-1],[0,-1,0]], border pixels copied
/// unchanged.
fn sharpen_3x3(src: &[u8], dst: &mut [u8], w: usize, h: usize) {
    if w < 3 || h < 3 {
        dst.copy_from_slice(src);
        return;
    }
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let i = y * w + x;
            let acc = 5 * src[i] as i32
                - src[i - 1] as i32
                - src[i + 1] as i32
                - src[i - w] as i32
                - src[i + w] as i32;
            dst[i] = acc.clamp(0, 255) as u8;
        }
    }
    // Borders
    for x in 0..w {
        dst[x] = src[x];
        dst[(h - 1) * w + x] = src[(h - 1) * w + x];
    }
    for y in 0..h {
        dst[y * w] = src[y * w];
        dst[y * w + (w - 1)] = src[y * w + (w - 1)];
    }
}

/// Binarize against the mean of the surrounding `block`×`block` window minus
/// `offset`. The window is clipped at image borders.
fn adaptive_threshold(src: &[u8], dst: &mut [u8], w: usize, h: usize, block: usize, offset: i16) {
    let half = block / 2;
    for y in 0..h {
        let y0 = y.saturating_sub(half);
        let y1 = (y + half).min(h - 1);
        for x in 0..w {
            let x0 = x.saturating_sub(half);
            let x1 = (x + half).min(w - 1);

            let mut sum: u32 = 0;
            for yy in y0..=y1 {
                let row = yy * w;
                for xx in x0..=x1 {
                    sum += src[row + xx] as u32;
                }
            }
            let count = ((y1 - y0 + 1) * (x1 - x0 + 1)) as u32;
            let mean = (sum / count) as i16;
            let threshold = mean - offset;
            dst[y * w + x] = if (src[y * w + x] as i16) > threshold {
                255
            } else {
                0
            };
        }
    }
}
