//! src/services/imaging.rs
//!
//! Pure image derivations: header decode + metadata, the fast thumbnail the
//! creation path needs synchronously, and the ten stylistic variants the
//! transform worker produces out-of-band. Every function here is
//! buffer-in/buffer-out and CPU-bound; callers run them behind
//! `tokio::task::spawn_blocking`.
//!
//! Tints are applied as a luminance-preserving recolor (the pixel's luma
//! scaled by the tint's chroma). The client-side preview filters are computed
//! independently and are a known approximation of these transforms, not a
//! pixel-exact match.

use crate::keys::VariantTag;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader, Rgb, RgbImage};
use std::io::Cursor;
use thiserror::Error;

/// Maximum width when thumbnailing.
const THUMB_WIDTH: u32 = 640;
/// Upscale never exceeds this width.
const UPSCALE_MAX_WIDTH: u32 = 4096;

const THUMB_QUALITY: u8 = 78;
const VARIANT_QUALITY: u8 = 85;
const UPSCALE_QUALITY: u8 = 90;

#[derive(Debug, Error)]
pub enum ImagingError {
    #[error("unreadable image: {0}")]
    Unreadable(String),
    #[error("jpeg encoding failed: {0}")]
    Encode(String),
}

/// Metadata read from the buffer header, with the MIME type normalized from
/// the detected format rather than trusted from the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMeta {
    pub width: u32,
    pub height: u32,
    pub mime: String,
    pub ext: String,
}

/// Decode a buffer, detecting the format from its magic bytes.
pub fn decode(bytes: &[u8]) -> Result<(DynamicImage, ImageMeta), ImagingError> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| ImagingError::Unreadable(format!("cannot sniff format: {}", e)))?;
    let format = reader
        .format()
        .ok_or_else(|| ImagingError::Unreadable("unknown image format".to_string()))?;
    let image = reader
        .decode()
        .map_err(|e| ImagingError::Unreadable(e.to_string()))?;

    let ext = format
        .extensions_str()
        .first()
        .copied()
        .unwrap_or("jpg")
        .to_string();
    let meta = ImageMeta {
        width: image.width(),
        height: image.height(),
        mime: format.to_mime_type().to_string(),
        ext,
    };
    Ok((image, meta))
}

/// Thumbnail: width capped at 640, never enlarged, JPEG q78.
pub fn make_thumb(image: &DynamicImage) -> Result<Vec<u8>, ImagingError> {
    let (w, h) = (image.width(), image.height());
    if w <= THUMB_WIDTH {
        return encode_jpeg(&image.to_rgb8(), THUMB_QUALITY);
    }
    let new_h = scaled_height(w, h, THUMB_WIDTH);
    let resized = image.resize_exact(THUMB_WIDTH, new_h, FilterType::Triangle);
    encode_jpeg(&resized.to_rgb8(), THUMB_QUALITY)
}

/// Compute one stylistic variant. Pure and deterministic, so re-running a
/// delivery produces byte-identical output for the same original.
pub fn make_variant(tag: VariantTag, image: &DynamicImage) -> Result<Vec<u8>, ImagingError> {
    match tag {
        // Grayscale
        VariantTag::T1 => encode_jpeg(&image.grayscale().to_rgb8(), VARIANT_QUALITY),
        // Sepia: desaturate, lift brightness, recolor toward a vintage brown
        VariantTag::T2 => {
            let mut rgb = image.to_rgb8();
            scale_saturation(&mut rgb, 0.5);
            scale_brightness(&mut rgb, 1.1);
            tint(&mut rgb, 112, 66, 20);
            encode_jpeg(&rgb, VARIANT_QUALITY)
        }
        // Gaussian-style blur
        VariantTag::T3 => encode_jpeg(&image.blur(3.0).to_rgb8(), VARIANT_QUALITY),
        // 2x upscale, width capped at 4096
        VariantTag::T4 => {
            let (w, h) = (image.width(), image.height());
            let new_w = (w.saturating_mul(2)).min(UPSCALE_MAX_WIDTH);
            let new_h = scaled_height(w, h, new_w);
            let resized = image.resize_exact(new_w, new_h, FilterType::Lanczos3);
            encode_jpeg(&resized.to_rgb8(), UPSCALE_QUALITY)
        }
        // Brightness + contrast boost
        VariantTag::T5 => {
            let mut rgb = image.to_rgb8();
            scale_brightness(&mut rgb, 1.4);
            linear(&mut rgb, 1.1, 0.0);
            encode_jpeg(&rgb, VARIANT_QUALITY)
        }
        // Darkened, high contrast
        VariantTag::T6 => {
            let mut rgb = image.to_rgb8();
            scale_brightness(&mut rgb, 0.7);
            linear(&mut rgb, 1.3, -10.0);
            encode_jpeg(&rgb, VARIANT_QUALITY)
        }
        // Saturation boost
        VariantTag::T7 => {
            let mut rgb = image.to_rgb8();
            scale_saturation(&mut rgb, 1.8);
            linear(&mut rgb, 1.1, 0.0);
            encode_jpeg(&rgb, VARIANT_QUALITY)
        }
        // Warm tint
        VariantTag::T8 => {
            let mut rgb = image.to_rgb8();
            scale_brightness(&mut rgb, 1.05);
            tint(&mut rgb, 255, 200, 150);
            linear(&mut rgb, 1.05, 0.0);
            encode_jpeg(&rgb, VARIANT_QUALITY)
        }
        // Cool tint
        VariantTag::T9 => {
            let mut rgb = image.to_rgb8();
            scale_brightness(&mut rgb, 0.98);
            tint(&mut rgb, 150, 180, 255);
            linear(&mut rgb, 1.05, 0.0);
            encode_jpeg(&rgb, VARIANT_QUALITY)
        }
        // Color inversion
        VariantTag::T10 => {
            let mut inverted = image.clone();
            inverted.invert();
            encode_jpeg(&inverted.to_rgb8(), VARIANT_QUALITY)
        }
    }
}

/// Proportional height for a target width, never below one pixel.
fn scaled_height(w: u32, h: u32, new_w: u32) -> u32 {
    let ratio = new_w as f32 / w as f32;
    ((h as f32 * ratio).round() as u32).max(1)
}

fn encode_jpeg(rgb: &RgbImage, quality: u8) -> Result<Vec<u8>, ImagingError> {
    let mut buf = Vec::new();
    let mut cursor = Cursor::new(&mut buf);
    let mut encoder = JpegEncoder::new_with_quality(&mut cursor, quality);
    encoder
        .encode_image(rgb)
        .map_err(|e| ImagingError::Encode(e.to_string()))?;
    Ok(buf)
}

fn clamp_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

fn luma(p: &Rgb<u8>) -> f32 {
    0.299 * p.0[0] as f32 + 0.587 * p.0[1] as f32 + 0.114 * p.0[2] as f32
}

/// Multiply all channels by `factor`.
fn scale_brightness(img: &mut RgbImage, factor: f32) {
    for p in img.pixels_mut() {
        for c in &mut p.0 {
            *c = clamp_u8(*c as f32 * factor);
        }
    }
}

/// Move each channel away from (or toward) the pixel's luma.
fn scale_saturation(img: &mut RgbImage, factor: f32) {
    for p in img.pixels_mut() {
        let l = luma(p);
        for c in &mut p.0 {
            *c = clamp_u8(l + (*c as f32 - l) * factor);
        }
    }
}

/// Per-channel linear adjustment: `c' = a * c + b`.
fn linear(img: &mut RgbImage, a: f32, b: f32) {
    for p in img.pixels_mut() {
        for c in &mut p.0 {
            *c = clamp_u8(a * *c as f32 + b);
        }
    }
}

/// Recolor toward `(r, g, b)` while preserving each pixel's luminance.
fn tint(img: &mut RgbImage, r: u8, g: u8, b: u8) {
    let tint_px = Rgb([r, g, b]);
    let tint_luma = luma(&tint_px).max(1.0);
    let scale = [
        r as f32 / tint_luma,
        g as f32 / tint_luma,
        b as f32 / tint_luma,
    ];
    for p in img.pixels_mut() {
        let l = luma(p);
        for (c, s) in p.0.iter_mut().zip(scale) {
            *c = clamp_u8(l * s);
        }
    }
}
