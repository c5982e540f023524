use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cropcart_core::{DomainError, DomainResult, EntityId};

/// Product identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(pub EntityId);

impl ProductId {
    pub fn new(id: EntityId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for ProductId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Product image lifecycle status.
///
/// Transitions out of `Processing` are driven only by the reconciler; the
/// submission layer never observes the outcome of asynchronous work
/// directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductStatus {
    /// Record exists, no confirmed final image set yet.
    Processing,
    /// Image set confirmed (may be empty).
    Ready,
    /// All transform/upload attempts exhausted with zero successes.
    Failed,
}

impl ProductStatus {
    /// Whether a transition to `next` is allowed.
    ///
    /// `Ready` and `Failed` re-enter `Processing` when a new upload batch is
    /// submitted; repeated `Ready`/`Failed` writes are allowed because retried
    /// attempts of the same job may reconcile more than once (at-least-once
    /// delivery). `Failed -> Ready` is allowed for the same reason: an
    /// attempt with zero successes marks the product `Failed` while the job
    /// waits out its backoff, and a later attempt that succeeds must be able
    /// to confirm. Only `Ready -> Failed` is forbidden: a confirmed image
    /// set never regresses without a new batch re-entering `Processing`.
    pub fn can_transition(self, next: ProductStatus) -> bool {
        !matches!((self, next), (ProductStatus::Ready, ProductStatus::Failed))
    }
}

/// A remotely stored product image.
///
/// The `deletion_handle` is an opaque token required to remove the object
/// from remote storage later. It is persisted alongside the URL but must
/// never be exposed outside the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub url: String,
    pub deletion_handle: String,
}

impl ImageRecord {
    pub fn new(url: impl Into<String>, deletion_handle: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            deletion_handle: deletion_handle.into(),
        }
    }
}

/// The product record the pipeline reconciles against.
///
/// `version` increases by one on every successful write and is the token
/// for optimistic-concurrency checks in the product store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    id: ProductId,
    name: String,
    status: ProductStatus,
    images: Vec<ImageRecord>,
    version: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Product {
    /// Create a freshly submitted product: no images, `Processing` status.
    pub fn new(id: ProductId, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            status: ProductStatus::Processing,
            images: Vec::new(),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> ProductId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> ProductStatus {
        self.status
    }

    pub fn images(&self) -> &[ImageRecord] {
        &self.images
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Re-enter `Processing` when a new upload batch is submitted for an
    /// existing product.
    pub fn begin_processing(&mut self) {
        self.status = ProductStatus::Processing;
        self.bump();
    }

    /// Confirm a new image set: status becomes `Ready` and the image list is
    /// replaced wholesale by the successful records.
    pub fn confirm_images(&mut self, images: Vec<ImageRecord>) -> DomainResult<()> {
        self.transition(ProductStatus::Ready)?;
        self.images = images;
        self.bump();
        Ok(())
    }

    /// Mark the product `Failed` after an attempt with zero successes. The
    /// image list is deliberately left untouched.
    pub fn mark_failed(&mut self) -> DomainResult<()> {
        self.transition(ProductStatus::Failed)?;
        self.bump();
        Ok(())
    }

    fn transition(&mut self, next: ProductStatus) -> DomainResult<()> {
        if !self.status.can_transition(next) {
            return Err(DomainError::invariant(format!(
                "illegal status transition: {:?} -> {:?}",
                self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    fn bump(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }
}
