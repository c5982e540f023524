//! Applies a job's aggregated outcome to the owning product record.

use tracing::{info, warn};

use cropcart_products::ProductId;
use cropcart_storage::{ObjectStorage, ProductStore, ProductStoreError, ProductUpdate};

use crate::outcome::JobOutcome;

/// Reconciliation error taxonomy.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReconcileError {
    /// The product is missing, was concurrently deleted, or changed under
    /// us (version mismatch). Retrying the job cannot help; callers log and
    /// acknowledge.
    #[error("reconcile conflict: {0}")]
    Conflict(String),

    /// The product store itself failed; the whole envelope is eligible for
    /// retry.
    #[error("product store error: {0}")]
    Store(String),
}

/// Applies job outcomes under a single conditional update, then cleans up
/// superseded remote images.
#[derive(Debug, Clone)]
pub struct Reconciler<P, S> {
    products: P,
    storage: S,
}

impl<P: ProductStore, S: ObjectStorage> Reconciler<P, S> {
    pub fn new(products: P, storage: S) -> Self {
        Self { products, storage }
    }

    /// Apply `outcome` to the product:
    ///
    /// - at least one success → status `ready`, image list replaced by the
    ///   successful set
    /// - all files failed → status `failed`, image list untouched
    ///
    /// Superseded images are deleted only *after* the new list is durably
    /// written; deleting first could leave the product with no recoverable
    /// images if the write subsequently failed. Deletion failures are
    /// logged and never roll back the status transition (a stale remote
    /// object is a recoverable leak, not a consistency violation).
    pub fn reconcile(
        &self,
        entity_id: ProductId,
        outcome: JobOutcome,
        is_update: bool,
    ) -> Result<(), ReconcileError> {
        if outcome.attempted() == 0 {
            warn!(product_id = %entity_id, "no-op outcome: envelope carried no attempted files");
            return Ok(());
        }

        let update = if outcome.any_success() {
            ProductUpdate::ready(outcome.successes.clone())
        } else {
            ProductUpdate::failed()
        };

        let updated = self
            .products
            .update_if_version(entity_id, outcome.product_version, update)
            .map_err(|err| match err {
                ProductStoreError::NotFound(_)
                | ProductStoreError::VersionConflict { .. }
                | ProductStoreError::IllegalUpdate(_) => ReconcileError::Conflict(err.to_string()),
                ProductStoreError::Unavailable(msg) => ReconcileError::Store(msg),
            })?;

        info!(
            product_id = %entity_id,
            status = ?updated.status(),
            images = updated.images().len(),
            failed_files = outcome.failures.len(),
            "product reconciled"
        );

        // The replacement set is committed; superseded remote images can go.
        if is_update && outcome.any_success() && !outcome.previous.is_empty() {
            let handles: Vec<String> = outcome
                .previous
                .iter()
                .map(|img| img.deletion_handle.clone())
                .collect();
            if let Err(err) = self.storage.delete_many(&handles) {
                warn!(product_id = %entity_id, error = %err, "superseded image cleanup failed");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex, RwLock};

    use cropcart_core::EntityId;
    use cropcart_products::{ImageRecord, Product, ProductStatus};
    use cropcart_storage::{InMemoryObjectStorage, InMemoryProductStore, StorageError, StoredObject};

    use crate::outcome::FailedFile;

    fn seeded_store() -> (Arc<InMemoryProductStore>, ProductId) {
        let store = InMemoryProductStore::arc();
        let id = ProductId::new(EntityId::new());
        store.insert(Product::new(id, "fresh eggs")).unwrap();
        (store, id)
    }

    fn outcome(
        successes: Vec<ImageRecord>,
        failed: usize,
        previous: Vec<ImageRecord>,
        version: u64,
    ) -> JobOutcome {
        JobOutcome {
            successes,
            failures: (0..failed)
                .map(|i| FailedFile {
                    path: PathBuf::from(format!("{i}.jpg")),
                    reason: "decode failed".to_string(),
                })
                .collect(),
            previous,
            product_version: version,
        }
    }

    #[test]
    fn success_confirms_exactly_the_successful_set() {
        let (products, id) = seeded_store();
        let storage = InMemoryObjectStorage::arc("https://cdn.test");
        let reconciler = Reconciler::new(products.clone(), storage);

        let images = vec![ImageRecord::new("https://cdn/x1", "x1")];
        reconciler
            .reconcile(id, outcome(images.clone(), 1, vec![], 1), false)
            .unwrap();

        let product = products.get(id).unwrap().unwrap();
        assert_eq!(product.status(), ProductStatus::Ready);
        // Failed entries never leak into the confirmed set.
        assert_eq!(product.images(), images.as_slice());
    }

    #[test]
    fn total_failure_marks_failed_and_keeps_images() {
        let (products, id) = seeded_store();
        let storage = InMemoryObjectStorage::arc("https://cdn.test");
        let reconciler = Reconciler::new(products.clone(), storage);

        reconciler
            .reconcile(id, outcome(vec![], 2, vec![], 1), false)
            .unwrap();

        let product = products.get(id).unwrap().unwrap();
        assert_eq!(product.status(), ProductStatus::Failed);
        assert!(product.images().is_empty());
    }

    #[test]
    fn update_deletes_superseded_images_after_the_write() {
        let (products, id) = seeded_store();
        let storage = InMemoryObjectStorage::arc("https://cdn.test");

        // Previous image set lives in remote storage.
        let old = storage.upload(b"old", "products").unwrap();
        let previous = vec![ImageRecord::new(old.url.clone(), old.deletion_handle.clone())];
        products
            .update_if_version(id, 1, ProductUpdate::ready(previous.clone()))
            .unwrap();
        products
            .update_if_version(
                id,
                2,
                ProductUpdate {
                    status: ProductStatus::Processing,
                    images: None,
                },
            )
            .unwrap();

        let reconciler = Reconciler::new(products.clone(), storage.clone());
        let new_images = vec![ImageRecord::new("https://cdn/new", "new")];
        reconciler
            .reconcile(id, outcome(new_images.clone(), 0, previous, 3), true)
            .unwrap();

        let product = products.get(id).unwrap().unwrap();
        assert_eq!(product.images(), new_images.as_slice());
        assert!(!storage.contains(&old.deletion_handle));
    }

    #[test]
    fn failed_attempt_then_successful_retry_reaches_ready() {
        let (products, id) = seeded_store();
        let storage = InMemoryObjectStorage::arc("https://cdn.test");
        let reconciler = Reconciler::new(products.clone(), storage);

        // Attempt 1: zero successes.
        reconciler
            .reconcile(id, outcome(vec![], 2, vec![], 1), false)
            .unwrap();
        assert_eq!(
            products.get(id).unwrap().unwrap().status(),
            ProductStatus::Failed
        );

        // Attempt 2 re-reads the product (version advanced) and succeeds.
        let images = vec![ImageRecord::new("https://cdn/x1", "x1")];
        reconciler
            .reconcile(id, outcome(images.clone(), 0, vec![], 2), false)
            .unwrap();

        let product = products.get(id).unwrap().unwrap();
        assert_eq!(product.status(), ProductStatus::Ready);
        assert_eq!(product.images(), images.as_slice());
    }

    #[test]
    fn version_mismatch_is_a_conflict() {
        let (products, id) = seeded_store();
        let storage = InMemoryObjectStorage::arc("https://cdn.test");
        let reconciler = Reconciler::new(products, storage);

        let err = reconciler
            .reconcile(id, outcome(vec![ImageRecord::new("u", "h")], 0, vec![], 99), false)
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Conflict(_)));
    }

    #[test]
    fn missing_product_is_a_conflict() {
        let storage = InMemoryObjectStorage::arc("https://cdn.test");
        let reconciler = Reconciler::new(InMemoryProductStore::arc(), storage);

        let err = reconciler
            .reconcile(
                ProductId::new(EntityId::new()),
                outcome(vec![], 1, vec![], 1),
                false,
            )
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Conflict(_)));
    }

    /// Storage that records operation order and can be told to fail deletes.
    #[derive(Default)]
    struct RecordingStorage {
        ops: Mutex<Vec<String>>,
        fail_deletes: bool,
    }

    impl ObjectStorage for RecordingStorage {
        fn upload(&self, _bytes: &[u8], folder: &str) -> Result<StoredObject, StorageError> {
            self.ops.lock().unwrap().push("upload".to_string());
            Ok(StoredObject {
                url: format!("https://cdn/{folder}/x"),
                deletion_handle: format!("{folder}/x"),
            })
        }

        fn delete(&self, handle: &str) -> Result<(), StorageError> {
            if self.fail_deletes {
                return Err(StorageError::Delete("simulated crash".to_string()));
            }
            self.ops.lock().unwrap().push(format!("delete {handle}"));
            Ok(())
        }
    }

    /// Product store wrapper that records when the write lands relative to
    /// storage deletes.
    struct OrderedStore {
        inner: Arc<InMemoryProductStore>,
        log: Arc<RwLock<Vec<String>>>,
    }

    impl ProductStore for OrderedStore {
        fn get(&self, id: ProductId) -> Result<Option<Product>, ProductStoreError> {
            self.inner.get(id)
        }

        fn insert(&self, product: Product) -> Result<(), ProductStoreError> {
            self.inner.insert(product)
        }

        fn update_if_version(
            &self,
            id: ProductId,
            expected_version: u64,
            update: ProductUpdate,
        ) -> Result<Product, ProductStoreError> {
            let result = self.inner.update_if_version(id, expected_version, update);
            if result.is_ok() {
                self.log.write().unwrap().push("write".to_string());
            }
            result
        }
    }

    /// Storage wrapper sharing the same ordered log.
    struct OrderedStorage {
        log: Arc<RwLock<Vec<String>>>,
    }

    impl ObjectStorage for OrderedStorage {
        fn upload(&self, _bytes: &[u8], _folder: &str) -> Result<StoredObject, StorageError> {
            unreachable!("reconciler never uploads")
        }

        fn delete(&self, _handle: &str) -> Result<(), StorageError> {
            self.log.write().unwrap().push("delete".to_string());
            Ok(())
        }
    }

    #[test]
    fn superseded_deletes_never_precede_the_durable_write() {
        let (inner, id) = seeded_store();
        let previous = vec![ImageRecord::new("https://cdn/old", "old")];
        inner
            .update_if_version(id, 1, ProductUpdate::ready(previous.clone()))
            .unwrap();
        inner
            .update_if_version(
                id,
                2,
                ProductUpdate {
                    status: ProductStatus::Processing,
                    images: None,
                },
            )
            .unwrap();

        let log = Arc::new(RwLock::new(Vec::new()));
        let reconciler = Reconciler::new(
            OrderedStore {
                inner,
                log: log.clone(),
            },
            OrderedStorage { log: log.clone() },
        );

        reconciler
            .reconcile(
                id,
                outcome(vec![ImageRecord::new("https://cdn/new", "new")], 0, previous, 3),
                true,
            )
            .unwrap();

        let log = log.read().unwrap();
        assert_eq!(log.first().map(String::as_str), Some("write"));
        assert!(log.iter().skip(1).all(|op| op == "delete"));
    }

    #[test]
    fn crash_between_write_and_delete_leaks_old_handles_but_keeps_the_new_list() {
        let (products, id) = seeded_store();
        let previous = vec![ImageRecord::new("https://cdn/old", "old")];
        products
            .update_if_version(id, 1, ProductUpdate::ready(previous.clone()))
            .unwrap();
        products
            .update_if_version(
                id,
                2,
                ProductUpdate {
                    status: ProductStatus::Processing,
                    images: None,
                },
            )
            .unwrap();

        let storage = Arc::new(RecordingStorage {
            fail_deletes: true,
            ..RecordingStorage::default()
        });
        let reconciler = Reconciler::new(products.clone(), storage);

        let new_images = vec![ImageRecord::new("https://cdn/new", "new")];
        // Deletion failure must not surface or roll anything back.
        reconciler
            .reconcile(id, outcome(new_images.clone(), 0, previous, 3), true)
            .unwrap();

        let product = products.get(id).unwrap().unwrap();
        assert_eq!(product.status(), ProductStatus::Ready);
        assert_eq!(product.images(), new_images.as_slice());
    }

    #[test]
    fn create_path_never_issues_deletes() {
        let (products, id) = seeded_store();
        let storage = Arc::new(RecordingStorage::default());
        let reconciler = Reconciler::new(products, storage.clone());

        reconciler
            .reconcile(
                id,
                outcome(vec![ImageRecord::new("https://cdn/a", "a")], 0, vec![], 1),
                false,
            )
            .unwrap();

        assert!(storage.ops.lock().unwrap().is_empty());
    }
}
