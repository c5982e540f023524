//! Product record store with optimistic-concurrency writes.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use cropcart_products::{ImageRecord, Product, ProductId, ProductStatus};

/// Product store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProductStoreError {
    #[error("product not found: {0}")]
    NotFound(ProductId),
    #[error("version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: u64, actual: u64 },
    #[error("illegal update: {0}")]
    IllegalUpdate(String),
    #[error("storage error: {0}")]
    Unavailable(String),
}

/// The slice of a product the reconciler is allowed to change in one write.
#[derive(Debug, Clone)]
pub struct ProductUpdate {
    pub status: ProductStatus,
    /// `Some` replaces the image list wholesale; `None` leaves it untouched.
    pub images: Option<Vec<ImageRecord>>,
}

impl ProductUpdate {
    pub fn ready(images: Vec<ImageRecord>) -> Self {
        Self {
            status: ProductStatus::Ready,
            images: Some(images),
        }
    }

    pub fn failed() -> Self {
        Self {
            status: ProductStatus::Failed,
            images: None,
        }
    }
}

/// Product record store abstraction.
pub trait ProductStore: Send + Sync {
    fn get(&self, id: ProductId) -> Result<Option<Product>, ProductStoreError>;

    fn insert(&self, product: Product) -> Result<(), ProductStoreError>;

    /// Apply `update` as a single conditional write: it takes effect only if
    /// the stored version still equals `expected_version`, and the version
    /// advances atomically with the change. This is the only mutation path
    /// the reconciler uses.
    fn update_if_version(
        &self,
        id: ProductId,
        expected_version: u64,
        update: ProductUpdate,
    ) -> Result<Product, ProductStoreError>;
}

impl<S> ProductStore for Arc<S>
where
    S: ProductStore + ?Sized,
{
    fn get(&self, id: ProductId) -> Result<Option<Product>, ProductStoreError> {
        (**self).get(id)
    }

    fn insert(&self, product: Product) -> Result<(), ProductStoreError> {
        (**self).insert(product)
    }

    fn update_if_version(
        &self,
        id: ProductId,
        expected_version: u64,
        update: ProductUpdate,
    ) -> Result<Product, ProductStoreError> {
        (**self).update_if_version(id, expected_version, update)
    }
}

/// In-memory product store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryProductStore {
    products: RwLock<HashMap<ProductId, Product>>,
}

impl InMemoryProductStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl ProductStore for InMemoryProductStore {
    fn get(&self, id: ProductId) -> Result<Option<Product>, ProductStoreError> {
        let products = self
            .products
            .read()
            .map_err(|_| ProductStoreError::Unavailable("store poisoned".to_string()))?;
        Ok(products.get(&id).cloned())
    }

    fn insert(&self, product: Product) -> Result<(), ProductStoreError> {
        let mut products = self
            .products
            .write()
            .map_err(|_| ProductStoreError::Unavailable("store poisoned".to_string()))?;
        products.insert(product.id(), product);
        Ok(())
    }

    fn update_if_version(
        &self,
        id: ProductId,
        expected_version: u64,
        update: ProductUpdate,
    ) -> Result<Product, ProductStoreError> {
        let mut products = self
            .products
            .write()
            .map_err(|_| ProductStoreError::Unavailable("store poisoned".to_string()))?;

        let product = products.get_mut(&id).ok_or(ProductStoreError::NotFound(id))?;

        if product.version() != expected_version {
            return Err(ProductStoreError::VersionConflict {
                expected: expected_version,
                actual: product.version(),
            });
        }

        match update.images {
            Some(images) => product
                .confirm_images(images)
                .map_err(|e| ProductStoreError::IllegalUpdate(e.to_string()))?,
            None => match update.status {
                ProductStatus::Failed => product
                    .mark_failed()
                    .map_err(|e| ProductStoreError::IllegalUpdate(e.to_string()))?,
                ProductStatus::Processing => product.begin_processing(),
                ProductStatus::Ready => {
                    return Err(ProductStoreError::IllegalUpdate(
                        "ready requires a confirmed image set".to_string(),
                    ));
                }
            },
        }

        Ok(product.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cropcart_core::EntityId;

    fn seeded() -> (InMemoryProductStore, ProductId) {
        let store = InMemoryProductStore::new();
        let id = ProductId::new(EntityId::new());
        store.insert(Product::new(id, "raw honey")).unwrap();
        (store, id)
    }

    #[test]
    fn conditional_update_applies_on_matching_version() {
        let (store, id) = seeded();

        let updated = store
            .update_if_version(id, 1, ProductUpdate::ready(vec![ImageRecord::new("u", "h")]))
            .unwrap();

        assert_eq!(updated.status(), ProductStatus::Ready);
        assert_eq!(updated.version(), 2);
        assert_eq!(updated.images().len(), 1);
    }

    #[test]
    fn stale_version_is_rejected() {
        let (store, id) = seeded();

        store
            .update_if_version(id, 1, ProductUpdate::ready(vec![]))
            .unwrap();

        let err = store
            .update_if_version(id, 1, ProductUpdate::failed())
            .unwrap_err();
        assert!(matches!(
            err,
            ProductStoreError::VersionConflict { expected: 1, actual: 2 }
        ));
    }

    #[test]
    fn failed_update_keeps_the_image_list() {
        let (store, id) = seeded();
        store
            .update_if_version(id, 1, ProductUpdate::ready(vec![ImageRecord::new("u", "h")]))
            .unwrap();
        // Next batch: back to processing, then the attempt fails.
        store
            .update_if_version(
                id,
                2,
                ProductUpdate {
                    status: ProductStatus::Processing,
                    images: None,
                },
            )
            .unwrap();

        let failed = store
            .update_if_version(id, 3, ProductUpdate::failed())
            .unwrap();

        assert_eq!(failed.status(), ProductStatus::Failed);
        assert_eq!(failed.images().len(), 1);
    }

    #[test]
    fn missing_product_is_not_found() {
        let store = InMemoryProductStore::new();
        let err = store
            .update_if_version(ProductId::new(EntityId::new()), 1, ProductUpdate::failed())
            .unwrap_err();
        assert!(matches!(err, ProductStoreError::NotFound(_)));
    }
}
