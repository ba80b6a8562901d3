//! Size-bounded image encoding.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          compress_to_target()           │
//! │  1. read header dimensions              │
//! │  2. decode + fit-inside resize          │
//! │  3. quality search (capped attempts)    │
//! └────────────────────┬────────────────────┘
//!                      │
//!          ┌───────────┴───────────┐
//!          ▼                       ▼
//! ┌─────────────────┐    ┌─────────────────────┐
//! │   JpegCodec     │    │     PngCodec        │
//! │ (quantisation)  │    │  (posterisation)    │
//! └─────────────────┘    └─────────────────────┘
//! ```
//!
//! The search is a pure, synchronous function. The ingestion pipeline runs it
//! on the blocking thread pool.
//!
//! # Example
//!
//! ```no_run
//! use image_ingest::encode::{compress_to_target, CompressionTarget, OutputFormat};
//!
//! let bytes = std::fs::read("photo.jpg").unwrap();
//! let target = CompressionTarget::new(1024, 300 * 1024, 90, 10, 5)
//!     .unwrap()
//!     .with_format(OutputFormat::Jpeg);
//!
//! let result = compress_to_target(&bytes, &target).unwrap();
//! println!("{}x{} at q{} (fits: {})", result.width, result.height,
//!     result.achieved_quality, result.target_met);
//! ```

mod codec;
mod search;

pub use codec::{
    clamp_quality, JpegCodec, OutputFormat, PngCodec, QualityCodec, MAX_QUALITY, MIN_QUALITY,
};
pub use search::{
    compress_to_target, compress_with_codec, fit_inside, read_dimensions, search_quality,
    CompressionResult, CompressionTarget, DEFAULT_MAX_DIMENSION, DEFAULT_QUALITY_FLOOR,
    DEFAULT_QUALITY_STEP, DEFAULT_START_QUALITY, DEFAULT_TARGET_SIZE,
};
