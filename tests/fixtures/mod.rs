//! Generated image fixtures. Nothing is read from disk.

#![allow(dead_code)]

use std::io::Cursor;

use clearwell::models::job::{ImagePayload, SourceImage};
use image::{ImageFormat, Rgba, RgbaImage};

/// Solid PNG of the given size.
pub fn solid_png(width: u32, height: u32, color: [u8; 4]) -> Vec<u8> {
    encode(&RgbaImage::from_pixel(width, height, Rgba(color)), ImageFormat::Png)
}

/// PNG whose pixels all differ, so it does not compress to almost nothing.
pub fn noisy_png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_fn(width, height, |x, y| {
        let seed = x.wrapping_mul(2_654_435_761) ^ y.wrapping_mul(40_503);
        Rgba([
            (seed & 0xff) as u8,
            ((seed >> 8) & 0xff) as u8,
            ((seed >> 16) & 0xff) as u8,
            255,
        ])
    });
    encode(&img, ImageFormat::Png)
}

pub fn encode(img: &RgbaImage, format: ImageFormat) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, format).expect("encode fixture");
    out.into_inner()
}

/// A validated source whose single byte tag identifies it in client requests.
pub fn tagged_source(name: &str, tag: u8) -> SourceImage {
    SourceImage {
        payload: ImagePayload::new(vec![tag], "image/png"),
        display_name: name.to_string(),
        width: 1,
        height: 1,
    }
}

/// What the fake service hands back.
pub fn cleaned_image() -> ImagePayload {
    ImagePayload::new(solid_png(4, 4, [250, 250, 250, 255]), "image/png")
}
