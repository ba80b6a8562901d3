//! Size-bounded quality search.
//!
//! [`compress_to_target`] decodes an image, downsizes it to fit inside a
//! square of `max_dimension_px` and then walks the quality down from
//! `start_quality` in `quality_step` decrements until the encoded output fits
//! in `target_size_bytes` or the `quality_floor` is reached.
//!
//! The walk visits at most `⌈(start − floor) / step⌉ + 1` qualities. That cap
//! is computed up front and enforced by the loop itself, so a codec that
//! violates the monotonic size contract still terminates.

use std::io::Cursor;

use bytes::Bytes;
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};
use tracing::debug;

use crate::error::CompressionError;

use super::codec::{OutputFormat, QualityCodec, JpegCodec, PngCodec, MAX_QUALITY, MIN_QUALITY};

/// Default bound on the longest output side, in pixels.
pub const DEFAULT_MAX_DIMENSION: u32 = 1024;

/// Default output byte budget (3 MiB).
pub const DEFAULT_TARGET_SIZE: usize = 3 * 1024 * 1024;

/// Default first quality tried.
pub const DEFAULT_START_QUALITY: u8 = 90;

/// Default lowest quality tried.
pub const DEFAULT_QUALITY_FLOOR: u8 = 10;

/// Default quality decrement between attempts.
pub const DEFAULT_QUALITY_STEP: u8 = 5;

// =============================================================================
// Compression Target
// =============================================================================

/// Immutable compression settings.
///
/// Built through [`CompressionTarget::new`], which enforces
/// `1 <= floor <= start <= 100`, `step >= 1`, and non-zero size bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionTarget {
    max_dimension_px: u32,
    target_size_bytes: usize,
    format: OutputFormat,
    start_quality: u8,
    quality_floor: u8,
    quality_step: u8,
}

impl CompressionTarget {
    pub fn new(
        max_dimension_px: u32,
        target_size_bytes: usize,
        start_quality: u8,
        quality_floor: u8,
        quality_step: u8,
    ) -> Result<Self, CompressionError> {
        if max_dimension_px == 0 {
            return Err(CompressionError::InvalidTarget(
                "max dimension must be at least 1 pixel".to_string(),
            ));
        }
        if target_size_bytes == 0 {
            return Err(CompressionError::InvalidTarget(
                "target size must be at least 1 byte".to_string(),
            ));
        }
        if quality_step == 0 {
            return Err(CompressionError::InvalidTarget(
                "quality step must be at least 1".to_string(),
            ));
        }
        if quality_floor < MIN_QUALITY || start_quality > MAX_QUALITY {
            return Err(CompressionError::InvalidTarget(format!(
                "qualities must be within {}-{}",
                MIN_QUALITY, MAX_QUALITY
            )));
        }
        if quality_floor > start_quality {
            return Err(CompressionError::InvalidTarget(format!(
                "quality floor {} is above start quality {}",
                quality_floor, start_quality
            )));
        }

        Ok(Self {
            max_dimension_px,
            target_size_bytes,
            format: OutputFormat::Jpeg,
            start_quality,
            quality_floor,
            quality_step,
        })
    }

    /// Same settings, different output format.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn max_dimension_px(&self) -> u32 {
        self.max_dimension_px
    }

    pub fn target_size_bytes(&self) -> usize {
        self.target_size_bytes
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn start_quality(&self) -> u8 {
        self.start_quality
    }

    pub fn quality_floor(&self) -> u8 {
        self.quality_floor
    }

    pub fn quality_step(&self) -> u8 {
        self.quality_step
    }

    /// Hard cap on encode attempts: `⌈(start − floor) / step⌉ + 1`.
    pub fn max_attempts(&self) -> u32 {
        let span = (self.start_quality - self.quality_floor) as u32;
        let step = self.quality_step as u32;
        span.div_ceil(step) + 1
    }
}

impl Default for CompressionTarget {
    fn default() -> Self {
        Self {
            max_dimension_px: DEFAULT_MAX_DIMENSION,
            target_size_bytes: DEFAULT_TARGET_SIZE,
            format: OutputFormat::Jpeg,
            start_quality: DEFAULT_START_QUALITY,
            quality_floor: DEFAULT_QUALITY_FLOOR,
            quality_step: DEFAULT_QUALITY_STEP,
        }
    }
}

// =============================================================================
// Compression Result
// =============================================================================

/// Output of one compression run.
#[derive(Debug, Clone)]
pub struct CompressionResult {
    /// Encoded bytes
    pub bytes: Bytes,

    /// Quality of the returned encoding
    pub achieved_quality: u8,

    /// Whether `bytes` fits in the target size. `false` means the floor was
    /// reached and the floor-quality encoding was returned.
    pub target_met: bool,

    /// Output width in pixels
    pub width: u32,

    /// Output height in pixels
    pub height: u32,

    /// Output format
    pub format: OutputFormat,

    /// Number of encodes performed
    pub attempts: u32,
}

// =============================================================================
// Geometry
// =============================================================================

/// Fit-inside dimensions for a `max_dimension` bound.
///
/// Never upscales. Both results are rounded and at least 1.
pub fn fit_inside(width: u32, height: u32, max_dimension: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= max_dimension {
        return (width, height);
    }

    let factor = max_dimension as f64 / longest as f64;
    let scale = |side: u32| ((side as f64 * factor).round() as u32).clamp(1, max_dimension);
    (scale(width), scale(height))
}

/// Read intrinsic dimensions from the image header.
///
/// # Errors
///
/// [`CompressionError::InvalidImage`] when the format is unrecognised, the
/// header is unreadable, or either dimension is zero.
pub fn read_dimensions(source: &[u8]) -> Result<(u32, u32), CompressionError> {
    let reader = ImageReader::new(Cursor::new(source))
        .with_guessed_format()
        .map_err(|e| CompressionError::InvalidImage {
            message: e.to_string(),
        })?;

    let (width, height) = reader
        .into_dimensions()
        .map_err(|e| CompressionError::InvalidImage {
            message: e.to_string(),
        })?;

    if width == 0 || height == 0 {
        return Err(CompressionError::InvalidImage {
            message: format!("zero dimension ({}x{})", width, height),
        });
    }

    Ok((width, height))
}

fn decode(source: &[u8]) -> Result<DynamicImage, CompressionError> {
    ImageReader::new(Cursor::new(source))
        .with_guessed_format()
        .map_err(|e| CompressionError::Decode {
            message: e.to_string(),
        })?
        .decode()
        .map_err(|e| CompressionError::Decode {
            message: e.to_string(),
        })
}

// =============================================================================
// Search
// =============================================================================

/// Compress `source` to fit `target` using the target's output format.
///
/// Synchronous and CPU-bound; call it from a blocking context.
pub fn compress_to_target(
    source: &[u8],
    target: &CompressionTarget,
) -> Result<CompressionResult, CompressionError> {
    match target.format() {
        OutputFormat::Jpeg => compress_with_codec(source, target, &JpegCodec),
        OutputFormat::Png => compress_with_codec(source, target, &PngCodec),
    }
}

/// Compress `source` with an explicit codec.
pub fn compress_with_codec<C: QualityCodec + ?Sized>(
    source: &[u8],
    target: &CompressionTarget,
    codec: &C,
) -> Result<CompressionResult, CompressionError> {
    let (width, height) = read_dimensions(source)?;
    let (out_width, out_height) = fit_inside(width, height, target.max_dimension_px());

    let mut image = decode(source)?;
    if (out_width, out_height) != (image.width(), image.height()) {
        image = image.resize_exact(out_width, out_height, FilterType::Triangle);
    }
    let image = codec.prepare(image);

    debug!(
        width,
        height,
        out_width,
        out_height,
        format = target.format().as_str(),
        "Resized image for quality search"
    );

    search_quality(&image, target, codec)
}

/// Walk quality down until the encoding fits the budget.
///
/// The final attempt is always made exactly at the floor, and the loop never
/// runs more than [`CompressionTarget::max_attempts`] times.
pub fn search_quality<C: QualityCodec + ?Sized>(
    image: &DynamicImage,
    target: &CompressionTarget,
    codec: &C,
) -> Result<CompressionResult, CompressionError> {
    let max_attempts = target.max_attempts();
    let floor = target.quality_floor();
    let mut quality = target.start_quality();
    let mut attempts = 0;

    loop {
        let encoded = codec.encode(image, quality)?;
        attempts += 1;

        let fits = encoded.len() <= target.target_size_bytes();
        if fits || quality <= floor || attempts >= max_attempts {
            debug!(
                quality,
                attempts,
                size = encoded.len(),
                target = target.target_size_bytes(),
                target_met = fits,
                "Quality search finished"
            );

            return Ok(CompressionResult {
                bytes: Bytes::from(encoded),
                achieved_quality: quality,
                target_met: fits,
                width: image.width(),
                height: image.height(),
                format: target.format(),
                attempts,
            });
        }

        quality = quality.saturating_sub(target.quality_step()).max(floor);
    }
}

// =============================================================================
// Tests
// =============================================================================
