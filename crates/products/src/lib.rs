//! Products domain module.
//!
//! This crate contains the product record the image pipeline reconciles
//! against, implemented purely as deterministic domain logic (no IO, no
//! HTTP, no storage).

pub mod product;

pub use product::{ImageRecord, Product, ProductId, ProductStatus};
