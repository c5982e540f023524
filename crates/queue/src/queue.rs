//! The queue contract shared by all backends.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cropcart_core::WorkerId;

use super::envelope::{JobEnvelope, JobId};

/// Queue error taxonomy.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    /// The backing store cannot accept reads/writes. Surfaced to the caller
    /// of `enqueue`, not retried internally.
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    /// A stale acknowledge/fail call: the token no longer matches the
    /// current lease (another worker may already hold it). Logged and
    /// ignored by callers.
    #[error("lease expired for job {0}")]
    LeaseExpired(JobId),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job serialization failed: {0}")]
    Serialization(String),
}

/// Temporary, revocable ownership of a leased job. Opaque; only the holder
/// of the current token may acknowledge or fail the job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseToken(String);

impl LeaseToken {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

/// A job handed to a worker together with its lease token.
#[derive(Debug, Clone)]
pub struct LeasedJob {
    pub envelope: JobEnvelope,
    pub lease_token: LeaseToken,
}

/// What `fail` did with the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Re-queued; leasable again once the backoff delay elapses.
    Retrying { attempt: u32 },
    /// Attempts exhausted; moved to the dead-letter area.
    DeadLettered { attempts: u32 },
}

/// A job that exhausted all attempts, retained for operator inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub envelope: JobEnvelope,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(envelope: JobEnvelope, reason: impl Into<String>) -> Self {
        Self {
            envelope,
            reason: reason.into(),
            dead_lettered_at: Utc::now(),
        }
    }
}

/// Queue depth snapshot (operator visibility).
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    /// Leasable now.
    pub ready: usize,
    /// Waiting out a backoff delay.
    pub delayed: usize,
    /// Currently leased by a worker.
    pub leased: usize,
    /// Retained after exhausting attempts.
    pub dead_lettered: usize,
}

/// Durable, at-least-once job queue with lease/retry semantics.
///
/// Acknowledged jobs are purged immediately; dead-lettered jobs are
/// retained. A job may be leased and partially processed more than once,
/// so downstream stages must tolerate duplicate uploads.
pub trait JobQueue: Send + Sync {
    /// Durably store the envelope and make it leasable.
    fn enqueue(&self, envelope: JobEnvelope) -> Result<JobId, QueueError>;

    /// Lease the oldest ready job, if any. Non-blocking; callers poll.
    fn lease(&self, worker_id: &WorkerId) -> Result<Option<LeasedJob>, QueueError>;

    /// Permanently remove a completed job.
    fn acknowledge(&self, job_id: JobId, token: &LeaseToken) -> Result<(), QueueError>;

    /// Record a failed attempt: re-queue after the envelope's backoff delay
    /// while attempts remain, otherwise dead-letter.
    fn fail(
        &self,
        job_id: JobId,
        token: &LeaseToken,
        reason: &str,
    ) -> Result<FailOutcome, QueueError>;

    /// Dead-lettered jobs, oldest first.
    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError>;

    /// Move a dead-lettered job back to the ready queue with a fresh
    /// attempt budget (operator re-drive).
    fn retry_dead_letter(&self, job_id: JobId) -> Result<JobEnvelope, QueueError>;

    /// Queue depth snapshot.
    fn stats(&self) -> Result<QueueStats, QueueError>;
}

impl<Q> JobQueue for Arc<Q>
where
    Q: JobQueue + ?Sized,
{
    fn enqueue(&self, envelope: JobEnvelope) -> Result<JobId, QueueError> {
        (**self).enqueue(envelope)
    }

    fn lease(&self, worker_id: &WorkerId) -> Result<Option<LeasedJob>, QueueError> {
        (**self).lease(worker_id)
    }

    fn acknowledge(&self, job_id: JobId, token: &LeaseToken) -> Result<(), QueueError> {
        (**self).acknowledge(job_id, token)
    }

    fn fail(
        &self,
        job_id: JobId,
        token: &LeaseToken,
        reason: &str,
    ) -> Result<FailOutcome, QueueError> {
        (**self).fail(job_id, token, reason)
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        (**self).list_dead_letters(limit)
    }

    fn retry_dead_letter(&self, job_id: JobId) -> Result<JobEnvelope, QueueError> {
        (**self).retry_dead_letter(job_id)
    }

    fn stats(&self) -> Result<QueueStats, QueueError> {
        (**self).stats()
    }
}
