//! Infrastructure storage abstractions: remote object storage and the
//! product record store.
//!
//! Both are traits with in-memory implementations for tests/dev; a
//! production deployment supplies adapters for its CDN-backed object store
//! and its database behind the same seams.

pub mod object_store;
pub mod product_store;

pub use object_store::{InMemoryObjectStorage, ObjectStorage, StorageError, StoredObject};
pub use product_store::{InMemoryProductStore, ProductStore, ProductStoreError, ProductUpdate};
