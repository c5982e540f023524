//! Durable job queue with lease semantics, fixed-delay retry, and
//! dead-letter retention.
//!
//! ## Design
//!
//! - One `JobEnvelope` per image-upload batch, enqueued by the submission
//!   layer at request time
//! - At-least-once delivery: a lease grants temporary, revocable ownership
//!   of a job to one worker; only the current lease token may acknowledge
//!   or fail it
//! - A failed attempt re-queues the job after the envelope's fixed backoff
//!   delay until `max_attempts` is exhausted
//! - Exhausted jobs move to a retained dead-letter area for operator
//!   inspection, never silently dropped
//!
//! ## Components
//!
//! - `JobEnvelope`: the immutable unit of work (wire schema in JSON)
//! - `JobQueue`: the queue contract (enqueue / lease / acknowledge / fail)
//! - `InMemoryJobQueue`: non-durable implementation for tests/dev
//! - `RedisJobQueue` (feature `redis`): durable implementation on Redis
//!   Streams

pub mod envelope;
pub mod in_memory;
pub mod queue;
#[cfg(feature = "redis")]
pub mod redis_queue;

pub use envelope::{
    JobEnvelope, JobId, DEFAULT_BACKOFF_DELAY_MS, DEFAULT_MAX_ATTEMPTS, MAX_FILES_PER_JOB,
};
pub use in_memory::InMemoryJobQueue;
pub use queue::{
    DeadLetterEntry, FailOutcome, JobQueue, LeaseToken, LeasedJob, QueueError, QueueStats,
};
#[cfg(feature = "redis")]
pub use redis_queue::RedisJobQueue;
