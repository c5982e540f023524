//! Remote object storage abstraction (content-addressed, delete-by-handle).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::warn;
use uuid::Uuid;

/// Result of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Publicly resolvable URL.
    pub url: String,
    /// Opaque token required to delete the object later.
    pub deletion_handle: String,
}

/// Object storage error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("upload failed: {0}")]
    Upload(String),
    #[error("delete failed: {0}")]
    Delete(String),
}

/// Remote object store contract.
///
/// Both operations must be idempotent under retry: re-uploading the same
/// bytes produces a fresh handle, and deleting an already-deleted handle is
/// a no-op, not an error.
pub trait ObjectStorage: Send + Sync {
    /// Upload `bytes` under the given logical folder.
    fn upload(&self, bytes: &[u8], folder: &str) -> Result<StoredObject, StorageError>;

    /// Delete a previously uploaded object. Unknown handles are a no-op.
    fn delete(&self, deletion_handle: &str) -> Result<(), StorageError>;

    /// Bulk-delete. The default implementation keeps going past individual
    /// failures and reports them as one error; callers treat deletion
    /// failures as a recoverable leak, not a consistency violation.
    fn delete_many(&self, deletion_handles: &[String]) -> Result<(), StorageError> {
        let mut failed = Vec::new();
        for handle in deletion_handles {
            if let Err(err) = self.delete(handle) {
                warn!(handle = %handle, error = %err, "object delete failed");
                failed.push(handle.clone());
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(StorageError::Delete(format!(
                "{} of {} handles failed: {}",
                failed.len(),
                deletion_handles.len(),
                failed.join(", ")
            )))
        }
    }
}

impl<S> ObjectStorage for Arc<S>
where
    S: ObjectStorage + ?Sized,
{
    fn upload(&self, bytes: &[u8], folder: &str) -> Result<StoredObject, StorageError> {
        (**self).upload(bytes, folder)
    }

    fn delete(&self, deletion_handle: &str) -> Result<(), StorageError> {
        (**self).delete(deletion_handle)
    }

    fn delete_many(&self, deletion_handles: &[String]) -> Result<(), StorageError> {
        (**self).delete_many(deletion_handles)
    }
}

/// In-memory object store for tests/dev.
#[derive(Debug)]
pub struct InMemoryObjectStorage {
    base_url: String,
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryObjectStorage {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            objects: RwLock::new(HashMap::new()),
        }
    }

    pub fn arc(base_url: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(base_url))
    }

    /// Number of live objects (test visibility).
    pub fn object_count(&self) -> usize {
        self.objects.read().map(|m| m.len()).unwrap_or(0)
    }

    /// Whether a handle still resolves to stored bytes (test visibility).
    pub fn contains(&self, deletion_handle: &str) -> bool {
        self.objects
            .read()
            .map(|m| m.contains_key(deletion_handle))
            .unwrap_or(false)
    }
}

impl Default for InMemoryObjectStorage {
    fn default() -> Self {
        Self::new("https://cdn.test")
    }
}

impl ObjectStorage for InMemoryObjectStorage {
    fn upload(&self, bytes: &[u8], folder: &str) -> Result<StoredObject, StorageError> {
        let handle = format!("{}/{}", folder, Uuid::now_v7());
        let url = format!("{}/{}", self.base_url, handle);

        let mut objects = self
            .objects
            .write()
            .map_err(|_| StorageError::Upload("store poisoned".to_string()))?;
        objects.insert(handle.clone(), bytes.to_vec());

        Ok(StoredObject {
            url,
            deletion_handle: handle,
        })
    }

    fn delete(&self, deletion_handle: &str) -> Result<(), StorageError> {
        let mut objects = self
            .objects
            .write()
            .map_err(|_| StorageError::Delete("store poisoned".to_string()))?;
        // Double-delete is a no-op by contract.
        objects.remove(deletion_handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_returns_url_and_handle_under_folder() {
        let store = InMemoryObjectStorage::default();
        let obj = store.upload(b"bytes", "products").unwrap();

        assert!(obj.url.starts_with("https://cdn.test/products/"));
        assert!(obj.deletion_handle.starts_with("products/"));
        assert!(store.contains(&obj.deletion_handle));
    }

    #[test]
    fn reupload_produces_a_fresh_handle() {
        let store = InMemoryObjectStorage::default();
        let a = store.upload(b"same", "products").unwrap();
        let b = store.upload(b"same", "products").unwrap();
        assert_ne!(a.deletion_handle, b.deletion_handle);
        assert_eq!(store.object_count(), 2);
    }

    #[test]
    fn double_delete_is_a_noop() {
        let store = InMemoryObjectStorage::default();
        let obj = store.upload(b"bytes", "products").unwrap();

        store.delete(&obj.deletion_handle).unwrap();
        store.delete(&obj.deletion_handle).unwrap();
        assert!(!store.contains(&obj.deletion_handle));
    }

    #[test]
    fn delete_many_removes_all_handles() {
        let store = InMemoryObjectStorage::default();
        let handles: Vec<String> = (0..3)
            .map(|_| store.upload(b"x", "products").unwrap().deletion_handle)
            .collect();

        store.delete_many(&handles).unwrap();
        assert_eq!(store.object_count(), 0);
    }
}
