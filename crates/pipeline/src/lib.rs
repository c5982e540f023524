//! The asynchronous image-processing pipeline.
//!
//! Ties the other crates together: a bounded pool of workers leases job
//! envelopes from the queue, runs the transform/upload stage for every
//! file in the envelope, and hands the aggregated outcome to the state
//! reconciler, which applies it to the owning product record and cleans
//! up superseded remote images.
//!
//! The queue client, product store, and object storage are passed in at
//! start-up (no globals), so the whole pipeline runs against in-memory
//! implementations in tests.

pub mod config;
pub mod outcome;
pub mod processor;
pub mod reconciler;
pub mod worker;


pub use config::PipelineConfig;
pub use outcome::{FailedFile, JobOutcome};
pub use processor::ImageProcessor;
pub use reconciler::{ReconcileError, Reconciler};
pub use worker::{PoolStats, WorkerPool, WorkerPoolHandle};
