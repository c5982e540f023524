//! In-memory job queue for tests/dev.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use cropcart_core::WorkerId;

use super::envelope::{JobEnvelope, JobId};
use super::queue::{
    DeadLetterEntry, FailOutcome, JobQueue, LeaseToken, LeasedJob, QueueError, QueueStats,
};

#[derive(Debug, Clone)]
enum JobState {
    /// Leasable once `ready_at` has passed.
    Ready { ready_at: DateTime<Utc> },
    /// Held by a worker.
    Leased {
        token: LeaseToken,
        leased_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone)]
struct QueuedJob {
    envelope: JobEnvelope,
    state: JobState,
}

/// Non-durable queue with the same lease/retry/dead-letter semantics as the
/// Redis backend. Intended for isolated tests and local development.
#[derive(Debug)]
pub struct InMemoryJobQueue {
    jobs: RwLock<HashMap<JobId, QueuedJob>>,
    dead_letters: RwLock<HashMap<JobId, DeadLetterEntry>>,
    /// Leases older than this are reclaimed on the next `lease` call,
    /// simulating visibility-timeout expiry after a worker crash.
    lease_timeout: Option<Duration>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            dead_letters: RwLock::new(HashMap::new()),
            lease_timeout: None,
        }
    }

    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = Some(timeout);
        self
    }

    pub fn arc() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::new())
    }

    /// Reclaim expired leases. Each reclaim counts as a failed attempt: the
    /// worker holding the lease died mid-processing.
    fn reclaim_expired(
        &self,
        jobs: &mut HashMap<JobId, QueuedJob>,
        dead_letters: &mut HashMap<JobId, DeadLetterEntry>,
        now: DateTime<Utc>,
    ) {
        let Some(timeout) = self.lease_timeout else {
            return;
        };
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::zero());

        let expired: Vec<JobId> = jobs
            .iter()
            .filter(|(_, job)| {
                matches!(&job.state, JobState::Leased { leased_at, .. } if *leased_at + timeout <= now)
            })
            .map(|(id, _)| *id)
            .collect();

        for job_id in expired {
            let Some(mut job) = jobs.remove(&job_id) else {
                continue;
            };
            job.envelope.attempt += 1;
            warn!(job_id = %job_id, attempt = job.envelope.attempt, "lease expired, reclaiming job");

            if job.envelope.attempts_exhausted() {
                dead_letters.insert(
                    job_id,
                    DeadLetterEntry::new(job.envelope, "lease expired after final attempt"),
                );
            } else {
                // A crashed worker is not a backoff-worthy failure; the job
                // becomes leasable again immediately.
                job.state = JobState::Ready { ready_at: now };
                jobs.insert(job_id, job);
            }
        }
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue for InMemoryJobQueue {
    fn enqueue(&self, envelope: JobEnvelope) -> Result<JobId, QueueError> {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|_| QueueError::Unavailable("queue poisoned".to_string()))?;

        let job_id = envelope.job_id;
        jobs.insert(
            job_id,
            QueuedJob {
                envelope,
                state: JobState::Ready { ready_at: Utc::now() },
            },
        );
        Ok(job_id)
    }

    fn lease(&self, _worker_id: &WorkerId) -> Result<Option<LeasedJob>, QueueError> {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|_| QueueError::Unavailable("queue poisoned".to_string()))?;
        let mut dead_letters = self
            .dead_letters
            .write()
            .map_err(|_| QueueError::Unavailable("queue poisoned".to_string()))?;

        let now = Utc::now();
        self.reclaim_expired(&mut jobs, &mut dead_letters, now);

        // Oldest ready job first (FIFO-ish; retries re-enter after a delay).
        let candidate = jobs
            .values()
            .filter(|job| matches!(&job.state, JobState::Ready { ready_at } if *ready_at <= now))
            .min_by_key(|job| job.envelope.enqueued_at)
            .map(|job| job.envelope.job_id);

        let Some(job_id) = candidate else {
            return Ok(None);
        };

        let token = LeaseToken::new();
        let job = jobs
            .get_mut(&job_id)
            .ok_or(QueueError::NotFound(job_id))?;
        job.state = JobState::Leased {
            token: token.clone(),
            leased_at: now,
        };

        Ok(Some(LeasedJob {
            envelope: job.envelope.clone(),
            lease_token: token,
        }))
    }

    fn acknowledge(&self, job_id: JobId, token: &LeaseToken) -> Result<(), QueueError> {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|_| QueueError::Unavailable("queue poisoned".to_string()))?;

        let job = jobs.get(&job_id).ok_or(QueueError::NotFound(job_id))?;
        match &job.state {
            JobState::Leased { token: current, .. } if current == token => {
                jobs.remove(&job_id);
                Ok(())
            }
            _ => Err(QueueError::LeaseExpired(job_id)),
        }
    }

    fn fail(
        &self,
        job_id: JobId,
        token: &LeaseToken,
        reason: &str,
    ) -> Result<FailOutcome, QueueError> {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|_| QueueError::Unavailable("queue poisoned".to_string()))?;
        let mut dead_letters = self
            .dead_letters
            .write()
            .map_err(|_| QueueError::Unavailable("queue poisoned".to_string()))?;

        let job = jobs.get(&job_id).ok_or(QueueError::NotFound(job_id))?;
        match &job.state {
            JobState::Leased { token: current, .. } if current == token => {}
            _ => return Err(QueueError::LeaseExpired(job_id)),
        }

        let mut job = jobs
            .remove(&job_id)
            .ok_or(QueueError::NotFound(job_id))?;
        job.envelope.attempt += 1;

        if job.envelope.attempts_exhausted() {
            let attempts = job.envelope.attempt;
            dead_letters.insert(job_id, DeadLetterEntry::new(job.envelope, reason));
            Ok(FailOutcome::DeadLettered { attempts })
        } else {
            let backoff = chrono::Duration::from_std(job.envelope.backoff_delay)
                .unwrap_or(chrono::Duration::zero());
            let attempt = job.envelope.attempt;
            job.state = JobState::Ready {
                ready_at: Utc::now() + backoff,
            };
            jobs.insert(job_id, job);
            Ok(FailOutcome::Retrying { attempt })
        }
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        let dead_letters = self
            .dead_letters
            .read()
            .map_err(|_| QueueError::Unavailable("queue poisoned".to_string()))?;

        let mut entries: Vec<DeadLetterEntry> = dead_letters.values().cloned().collect();
        entries.sort_by_key(|e| e.dead_lettered_at);
        entries.truncate(limit);
        Ok(entries)
    }

    fn retry_dead_letter(&self, job_id: JobId) -> Result<JobEnvelope, QueueError> {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|_| QueueError::Unavailable("queue poisoned".to_string()))?;
        let mut dead_letters = self
            .dead_letters
            .write()
            .map_err(|_| QueueError::Unavailable("queue poisoned".to_string()))?;

        let entry = dead_letters
            .remove(&job_id)
            .ok_or(QueueError::NotFound(job_id))?;

        let mut envelope = entry.envelope;
        envelope.attempt = 0;

        jobs.insert(
            job_id,
            QueuedJob {
                envelope: envelope.clone(),
                state: JobState::Ready { ready_at: Utc::now() },
            },
        );
        Ok(envelope)
    }

    fn stats(&self) -> Result<QueueStats, QueueError> {
        let jobs = self
            .jobs
            .read()
            .map_err(|_| QueueError::Unavailable("queue poisoned".to_string()))?;
        let dead_letters = self
            .dead_letters
            .read()
            .map_err(|_| QueueError::Unavailable("queue poisoned".to_string()))?;

        let now = Utc::now();
        let mut stats = QueueStats {
            dead_lettered: dead_letters.len(),
            ..QueueStats::default()
        };
        for job in jobs.values() {
            match &job.state {
                JobState::Ready { ready_at } if *ready_at <= now => stats.ready += 1,
                JobState::Ready { .. } => stats.delayed += 1,
                JobState::Leased { .. } => stats.leased += 1,
            }
        }
        Ok(stats)
    }
}
