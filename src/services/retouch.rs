use std::io::Cursor;

use garde::Validate;
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::models::job::ImagePayload;
use crate::services::validation::writable_format;

/// Light adjustments applied to a processed image before it is saved back.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Validate)]
pub struct RetouchParams {
    /// Percent, 100 leaves the image unchanged.
    #[garde(range(min = 0, max = 200))]
    #[serde(default = "neutral")]
    pub brightness: u32,

    /// Percent, 100 leaves the image unchanged.
    #[garde(range(min = 0, max = 200))]
    #[serde(default = "neutral")]
    pub contrast: u32,

    /// Centre zoom; each edge loses `min(w, h) * zoom / 200` pixels.
    #[garde(range(min = 0, max = 40))]
    #[serde(default)]
    pub zoom: u32,
}

fn neutral() -> u32 {
    100
}

impl Default for RetouchParams {
    fn default() -> Self {
        Self {
            brightness: 100,
            contrast: 100,
            zoom: 0,
        }
    }
}

impl RetouchParams {
    pub fn is_identity(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetouchError {
    #[error("failed to decode image: {0}")]
    Decode(image::ImageError),

    #[error("failed to encode image: {0}")]
    Encode(image::ImageError),
}

/// Apply `params` to `payload`, re-encoding in the same format where possible.
pub fn apply(payload: &ImagePayload, params: &RetouchParams) -> Result<ImagePayload, RetouchError> {
    let decoded = image::load_from_memory(&payload.bytes).map_err(RetouchError::Decode)?;
    let mut pixels = zoom(decoded.to_rgba8(), params.zoom);
    adjust(&mut pixels, params.brightness, params.contrast);

    let format = writable_format(&payload.mime_type).unwrap_or(ImageFormat::Png);
    let dynamic = DynamicImage::ImageRgba8(pixels);
    let mut out = Cursor::new(Vec::new());
    match format {
        ImageFormat::Jpeg => dynamic.to_rgb8().write_to(&mut out, format),
        _ => dynamic.write_to(&mut out, format),
    }
    .map_err(RetouchError::Encode)?;

    Ok(ImagePayload::new(out.into_inner(), format.to_mime_type()))
}

fn zoom(pixels: RgbaImage, amount: u32) -> RgbaImage {
    let (width, height) = pixels.dimensions();
    let crop = width.min(height) * amount / 200;
    if crop == 0 || crop * 2 >= width || crop * 2 >= height {
        return pixels;
    }

    let region = imageops::crop_imm(&pixels, crop, crop, width - crop * 2, height - crop * 2)
        .to_image();
    imageops::resize(&region, width, height, FilterType::Triangle)
}

/// Brightness then contrast, matching the order of CSS filter functions.
fn adjust(pixels: &mut RgbaImage, brightness: u32, contrast: u32) {
    if brightness == 100 && contrast == 100 {
        return;
    }
    #[allow(clippy::cast_precision_loss)]
    let (b, c) = (brightness as f32 / 100.0, contrast as f32 / 100.0);

    for px in pixels.pixels_mut() {
        for ch in 0..3 {
            let value = f32::from(px[ch]) / 255.0 * b;
            let value = (value - 0.5) * c + 0.5;
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                px[ch] = (value * 255.0).round().clamp(0.0, 255.0) as u8;
            }
        }
    }
}
