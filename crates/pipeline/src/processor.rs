//! Per-file transform + upload stage.

use tracing::{debug, warn};

use cropcart_imaging::ImageOptimizer;
use cropcart_products::ImageRecord;
use cropcart_queue::JobEnvelope;
use cropcart_storage::ObjectStorage;

use crate::outcome::{FailedFile, JobOutcome};

/// Runs the transform/upload stage for every file in an envelope.
///
/// Files are processed independently: one bad image never aborts the rest
/// of the batch. All per-file errors are absorbed into the outcome.
#[derive(Debug, Clone)]
pub struct ImageProcessor<S> {
    storage: S,
    optimizer: ImageOptimizer,
    folder: String,
}

impl<S: ObjectStorage> ImageProcessor<S> {
    pub fn new(storage: S, folder: impl Into<String>) -> Self {
        Self {
            storage,
            optimizer: ImageOptimizer::default(),
            folder: folder.into(),
        }
    }

    pub fn with_optimizer(mut self, optimizer: ImageOptimizer) -> Self {
        self.optimizer = optimizer;
        self
    }

    /// Transform and upload each file in the envelope, partitioning the
    /// results. `previous` and `product_version` are the product's image
    /// list and version as read before processing started; they ride along
    /// for the reconciler.
    pub fn process(
        &self,
        envelope: &JobEnvelope,
        previous: Vec<ImageRecord>,
        product_version: u64,
    ) -> JobOutcome {
        let mut successes = Vec::new();
        let mut failures = Vec::new();

        for path in &envelope.file_paths {
            let bytes = match self.optimizer.optimize(path) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(job_id = %envelope.job_id, path = %path.display(), error = %err, "transform failed");
                    failures.push(FailedFile {
                        path: path.clone(),
                        reason: err.to_string(),
                    });
                    continue;
                }
            };

            let stored = match self.storage.upload(&bytes, &self.folder) {
                Ok(stored) => stored,
                Err(err) => {
                    warn!(job_id = %envelope.job_id, path = %path.display(), error = %err, "upload failed");
                    failures.push(FailedFile {
                        path: path.clone(),
                        reason: err.to_string(),
                    });
                    continue;
                }
            };

            // Local temp cleanup is best-effort; the file served its purpose.
            if let Err(err) = std::fs::remove_file(path) {
                warn!(path = %path.display(), error = %err, "failed to remove local temp file");
            }

            debug!(job_id = %envelope.job_id, path = %path.display(), url = %stored.url, "file processed");
            successes.push(ImageRecord::new(stored.url, stored.deletion_handle));
        }

        JobOutcome {
            successes,
            failures,
            previous,
            product_version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use cropcart_core::EntityId;
    use cropcart_products::ProductId;
    use cropcart_storage::{InMemoryObjectStorage, StorageError, StoredObject};
    use image::{ImageFormat, RgbImage};

    fn synthetic_jpeg(dir: &Path, name: &str) -> PathBuf {
        let img = RgbImage::from_fn(1024, 768, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 64])
        });
        let path = dir.join(name);
        img.save_with_format(&path, ImageFormat::Jpeg).unwrap();
        path
    }

    fn envelope(paths: Vec<PathBuf>) -> JobEnvelope {
        JobEnvelope::new(ProductId::new(EntityId::new()), paths).unwrap()
    }

    #[test]
    fn uploads_every_good_file_and_unlinks_it() {
        let tmp = tempfile::tempdir().unwrap();
        let a = synthetic_jpeg(tmp.path(), "a.jpg");
        let b = synthetic_jpeg(tmp.path(), "b.jpg");

        let storage = InMemoryObjectStorage::arc("https://cdn.test");
        let processor = ImageProcessor::new(storage.clone(), "products");

        let outcome = processor.process(&envelope(vec![a.clone(), b.clone()]), vec![], 1);

        assert_eq!(outcome.successes.len(), 2);
        assert!(outcome.failures.is_empty());
        assert_eq!(storage.object_count(), 2);
        // Locals are gone after success.
        assert!(!a.exists());
        assert!(!b.exists());
    }

    #[test]
    fn one_bad_file_does_not_abort_the_batch() {
        let tmp = tempfile::tempdir().unwrap();
        let good = synthetic_jpeg(tmp.path(), "good.jpg");
        let missing = tmp.path().join("missing.jpg");

        let storage = InMemoryObjectStorage::arc("https://cdn.test");
        let processor = ImageProcessor::new(storage, "products");

        let outcome = processor.process(&envelope(vec![missing.clone(), good]), vec![], 1);

        assert_eq!(outcome.successes.len(), 1);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].path, missing);
    }

    /// Storage stub whose uploads always fail.
    struct BrokenStorage;

    impl ObjectStorage for BrokenStorage {
        fn upload(&self, _bytes: &[u8], _folder: &str) -> Result<StoredObject, StorageError> {
            Err(StorageError::Upload("remote unreachable".to_string()))
        }

        fn delete(&self, _handle: &str) -> Result<(), StorageError> {
            Ok(())
        }
    }

    #[test]
    fn upload_failure_keeps_the_local_file_for_the_retry() {
        let tmp = tempfile::tempdir().unwrap();
        let path = synthetic_jpeg(tmp.path(), "a.jpg");

        let processor = ImageProcessor::new(Arc::new(BrokenStorage), "products");
        let outcome = processor.process(&envelope(vec![path.clone()]), vec![], 1);

        assert!(outcome.all_failed());
        assert!(outcome.failures[0].reason.contains("remote unreachable"));
        // File path must stay valid until the job reaches a terminal state.
        assert!(path.exists());
    }
}
