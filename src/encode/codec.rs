//! Quality-parameterised image codecs.
//!
//! Both codecs take an already decoded (and resized) image and a quality in
//! `1..=100`, and return encoded bytes.
//!
//! # Monotonicity contract
//!
//! For a fixed input image, the encoded size must be non-increasing as quality
//! decreases. The quality search relies on this to stop at the first quality
//! that fits the budget. It is a contract on the codec and is not re-verified
//! per call; the search enforces its own iteration cap regardless.
//!
//! - **JPEG**: quality is the libjpeg-style quantisation quality.
//! - **PNG**: PNG is lossless, so quality selects a posterisation depth. At
//!   quality 88 and above every sample keeps its 8 bits; below that, low-order
//!   bits are dropped (down to 1 bit per sample at the bottom of the range),
//!   which shrinks the deflate stream.

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{ColorType, DynamicImage};

use crate::error::CompressionError;

/// Minimum allowed encoder quality.
pub const MIN_QUALITY: u8 = 1;

/// Maximum allowed encoder quality.
pub const MAX_QUALITY: u8 = 100;

// =============================================================================
// Output Format
// =============================================================================

/// Raster formats the encoder can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Jpeg,
    Png,
}

impl OutputFormat {
    /// Pick the output format for a declared MIME type.
    ///
    /// Anything mentioning "png" stays PNG; every other image type is
    /// re-encoded as JPEG.
    pub fn from_mime(mime_type: &str) -> Self {
        if mime_type.to_ascii_lowercase().contains("png") {
            OutputFormat::Png
        } else {
            OutputFormat::Jpeg
        }
    }

    /// MIME type of the encoded bytes.
    pub fn mime_type(self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Png => "image/png",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpeg",
            OutputFormat::Png => "png",
        }
    }
}

// =============================================================================
// Codec Trait
// =============================================================================

/// An encoder whose output size is controlled by a quality parameter.
pub trait QualityCodec: Send + Sync {
    /// Convert the image once into the pixel layout the codec accepts.
    ///
    /// Called before the search loop so repeated encodes do not reconvert.
    fn prepare(&self, image: DynamicImage) -> DynamicImage {
        image
    }

    /// Encode at `quality` (clamped to 1-100).
    fn encode(&self, image: &DynamicImage, quality: u8) -> Result<Vec<u8>, CompressionError>;
}

/// Clamp quality to the valid range.
#[inline]
pub fn clamp_quality(quality: u8) -> u8 {
    quality.clamp(MIN_QUALITY, MAX_QUALITY)
}

// =============================================================================
// JPEG
// =============================================================================

/// Baseline JPEG encoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct JpegCodec;

impl QualityCodec for JpegCodec {
    fn prepare(&self, image: DynamicImage) -> DynamicImage {
        // JPEG has no alpha channel and only 8-bit samples
        match image.color() {
            ColorType::L8 | ColorType::Rgb8 => image,
            _ => DynamicImage::ImageRgb8(image.to_rgb8()),
        }
    }

    fn encode(&self, image: &DynamicImage, quality: u8) -> Result<Vec<u8>, CompressionError> {
        let mut output = Vec::new();
        let encoder = JpegEncoder::new_with_quality(&mut output, clamp_quality(quality));

        image
            .write_with_encoder(encoder)
            .map_err(|e| CompressionError::Encode {
                message: e.to_string(),
            })?;

        Ok(output)
    }
}

// =============================================================================
// PNG
// =============================================================================

/// PNG encoder with quality mapped to posterisation depth.
#[derive(Debug, Clone, Copy, Default)]
pub struct PngCodec;

impl PngCodec {
    /// Bits kept per 8-bit sample at `quality`.
    pub fn bits_for_quality(quality: u8) -> u8 {
        let quality = clamp_quality(quality) as u32;
        ((quality * 8 + 99) / 100).clamp(1, 8) as u8
    }
}

impl QualityCodec for PngCodec {
    fn prepare(&self, image: DynamicImage) -> DynamicImage {
        match image.color() {
            ColorType::Rgb8 | ColorType::Rgba8 => image,
            color if color.has_alpha() => DynamicImage::ImageRgba8(image.to_rgba8()),
            _ => DynamicImage::ImageRgb8(image.to_rgb8()),
        }
    }

    fn encode(&self, image: &DynamicImage, quality: u8) -> Result<Vec<u8>, CompressionError> {
        let bits = Self::bits_for_quality(quality);

        let mut output = Vec::new();
        let encoder =
            PngEncoder::new_with_quality(&mut output, CompressionType::Best, FilterType::Adaptive);

        let result = if bits == 8 {
            image.write_with_encoder(encoder)
        } else {
            posterize(image, bits).write_with_encoder(encoder)
        };

        result.map_err(|e| CompressionError::Encode {
            message: e.to_string(),
        })?;

        Ok(output)
    }
}

/// Keep only the `bits` high-order bits of every 8-bit sample.
fn posterize(image: &DynamicImage, bits: u8) -> DynamicImage {
    let mask = u8::MAX << (8 - bits);
    let mut out = image.clone();

    match &mut out {
        DynamicImage::ImageRgb8(buffer) => mask_samples(buffer, mask),
        DynamicImage::ImageRgba8(buffer) => mask_samples(buffer, mask),
        DynamicImage::ImageLuma8(buffer) => mask_samples(buffer, mask),
        DynamicImage::ImageLumaA8(buffer) => mask_samples(buffer, mask),
        _ => {}
    }

    out
}

fn mask_samples(samples: &mut [u8], mask: u8) {
    for sample in samples.iter_mut() {
        *sample &= mask;
    }
}

// =============================================================================
// Tests
// =============================================================================
