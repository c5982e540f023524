//! Image transform stage: local file → re-encoded, size-bounded JPEG bytes.
//!
//! ## Crate mapping
//!
//! | Operation | Crate / function |
//! |---|---|
//! | Decode (JPEG, PNG, WebP) | `image` crate (pure Rust decoders) |
//! | Resize | `image::DynamicImage::resize` with `Lanczos3` filter |
//! | Encode → JPEG | `image::codecs::jpeg::JpegEncoder` |
//!
//! The stage is a pure function of the file contents: no network, no
//! shared state. Everything IO-related beyond reading the source file
//! (uploading, unlinking temp files) belongs to the pipeline crate.

pub mod transform;

pub use transform::{ImageOptimizer, TransformError, DEFAULT_JPEG_QUALITY, DEFAULT_MAX_DIMENSION};
