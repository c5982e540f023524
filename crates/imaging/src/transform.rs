//! Decode → bounded resize → JPEG re-encode.

use std::io::Cursor;
use std::path::Path;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::ImageReader;

/// Neither output dimension exceeds this bound.
pub const DEFAULT_MAX_DIMENSION: u32 = 800;

/// Fixed lossy re-encode quality (1-100).
pub const DEFAULT_JPEG_QUALITY: u8 = 70;

/// Per-file transform failure. Recorded against the file, never aborts the
/// rest of the envelope.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to encode {path}: {source}")]
    Encode {
        path: String,
        #[source]
        source: image::ImageError,
    },
}

/// Re-encodes images to size-bounded JPEGs.
#[derive(Debug, Clone)]
pub struct ImageOptimizer {
    max_dimension: u32,
    quality: u8,
}

impl Default for ImageOptimizer {
    fn default() -> Self {
        Self {
            max_dimension: DEFAULT_MAX_DIMENSION,
            quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

impl ImageOptimizer {
    pub fn new(max_dimension: u32, quality: u8) -> Self {
        Self {
            max_dimension,
            quality: quality.clamp(1, 100),
        }
    }

    pub fn max_dimension(&self) -> u32 {
        self.max_dimension
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Decode the image at `path`, shrink it so neither dimension exceeds
    /// the bound (aspect ratio preserved, never upscaled), and re-encode as
    /// JPEG at the configured quality.
    pub fn optimize(&self, path: &Path) -> Result<Vec<u8>, TransformError> {
        let path_str = path.display().to_string();

        let reader = ImageReader::open(path).map_err(|source| TransformError::Open {
            path: path_str.clone(),
            source,
        })?;

        let img = reader
            .with_guessed_format()
            .map_err(|source| TransformError::Open {
                path: path_str.clone(),
                source,
            })?
            .decode()
            .map_err(|source| TransformError::Decode {
                path: path_str.clone(),
                source,
            })?;

        let (w, h) = (img.width(), img.height());
        let img = if w > self.max_dimension || h > self.max_dimension {
            img.resize(self.max_dimension, self.max_dimension, FilterType::Lanczos3)
        } else {
            img
        };

        tracing::debug!(
            path = %path_str,
            source_width = w,
            source_height = h,
            width = img.width(),
            height = img.height(),
            "image transformed"
        );

        // JPEG has no alpha channel; flatten to RGB before encoding.
        let rgb = img.to_rgb8();
        let mut out = Cursor::new(Vec::new());
        JpegEncoder::new_with_quality(&mut out, self.quality)
            .encode_image(&rgb)
            .map_err(|source| TransformError::Encode {
                path: path_str,
                source,
            })?;

        Ok(out.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    use image::{ImageFormat, RgbImage};

    /// Write a synthetic gradient PNG of the given size to `dir`.
    fn synthetic_png(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
        let img = RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        });
        let path = dir.join(name);
        img.save_with_format(&path, ImageFormat::Png).unwrap();
        path
    }

    #[test]
    fn shrinks_oversized_images_preserving_aspect() {
        let tmp = tempfile::tempdir().unwrap();
        let path = synthetic_png(tmp.path(), "big.png", 1600, 1200);

        let bytes = ImageOptimizer::default().optimize(&path).unwrap();
        let out = image::load_from_memory(&bytes).unwrap();

        assert_eq!(out.width(), 800);
        assert_eq!(out.height(), 600);
    }

    #[test]
    fn output_is_jpeg() {
        let tmp = tempfile::tempdir().unwrap();
        let path = synthetic_png(tmp.path(), "img.png", 900, 900);

        let bytes = ImageOptimizer::default().optimize(&path).unwrap();
        let format = image::guess_format(&bytes).unwrap();
        assert_eq!(format, ImageFormat::Jpeg);
    }

    #[test]
    fn never_upscales_small_images() {
        let tmp = tempfile::tempdir().unwrap();
        let path = synthetic_png(tmp.path(), "small.png", 320, 240);

        let bytes = ImageOptimizer::default().optimize(&path).unwrap();
        let out = image::load_from_memory(&bytes).unwrap();

        assert_eq!((out.width(), out.height()), (320, 240));
    }

    #[test]
    fn missing_file_is_an_open_error() {
        let err = ImageOptimizer::default()
            .optimize(Path::new("/definitely/not/here.jpg"))
            .unwrap_err();
        assert!(matches!(err, TransformError::Open { .. }));
    }

    #[test]
    fn garbage_bytes_are_a_decode_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("junk.jpg");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"this is not an image")
            .unwrap();

        let err = ImageOptimizer::default().optimize(&path).unwrap_err();
        assert!(matches!(err, TransformError::Decode { .. }));
    }

    #[test]
    fn quality_is_clamped_to_valid_range() {
        let opt = ImageOptimizer::new(800, 0);
        assert_eq!(opt.quality(), 1);
        let opt = ImageOptimizer::new(800, 255);
        assert_eq!(opt.quality(), 100);
    }
}
