//! Redis Streams-backed job queue (durable, at-least-once delivery).
//!
//! This implementation uses Redis Streams (XADD/XREADGROUP/XACK) plus a
//! sorted set for backoff scheduling:
//!
//! - **Stream key**: `cropcart:jobs` — ready jobs, one consumer group shared
//!   by all workers, each worker a named consumer
//! - **Delayed set**: `cropcart:jobs:delayed` — failed jobs parked until
//!   their backoff deadline (score = ready-at epoch millis); due members are
//!   promoted back onto the stream on the next `lease` call
//! - **Dead-letter stream**: `cropcart:jobs:dlq` — exhausted jobs, retained
//!   for operator inspection and re-drive
//!
//! The lease token is the stream entry id: XACK/XDEL against a stale id
//! affect zero entries, which surfaces as `LeaseExpired`. Entries pending
//! longer than the visibility timeout (a crashed worker) are reclaimed via
//! XPENDING/XCLAIM before new entries are read; a reclaimed delivery reuses
//! the attempt recorded in its payload, so exhaustion is enforced when the
//! new holder fails the job.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::warn;

use cropcart_core::WorkerId;

use super::envelope::{JobEnvelope, JobId};
use super::queue::{
    DeadLetterEntry, FailOutcome, JobQueue, LeaseToken, LeasedJob, QueueError, QueueStats,
};

const DEFAULT_STREAM_KEY: &str = "cropcart:jobs";
const DEFAULT_DELAYED_KEY: &str = "cropcart:jobs:delayed";
const DEFAULT_DLQ_KEY: &str = "cropcart:jobs:dlq";
const DEFAULT_GROUP: &str = "image-workers";

/// Leases pending longer than this are reclaimed (crashed worker).
const DEFAULT_PENDING_TIMEOUT_MS: u64 = 60_000;

/// How many due delayed jobs to promote per lease call.
const PROMOTE_BATCH: usize = 16;

#[derive(Debug, Clone)]
pub struct RedisJobQueue {
    client: Arc<redis::Client>,
    stream_key: String,
    delayed_key: String,
    dlq_key: String,
    group: String,
    pending_timeout_ms: u64,
}

impl RedisJobQueue {
    /// Connect to the broker and ensure the consumer group exists.
    ///
    /// `redis_url` is e.g. `redis://127.0.0.1:6379`.
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        let queue = Self {
            client: Arc::new(client),
            stream_key: DEFAULT_STREAM_KEY.to_string(),
            delayed_key: DEFAULT_DELAYED_KEY.to_string(),
            dlq_key: DEFAULT_DLQ_KEY.to_string(),
            group: DEFAULT_GROUP.to_string(),
            pending_timeout_ms: DEFAULT_PENDING_TIMEOUT_MS,
        };
        queue.ensure_consumer_group()?;
        Ok(queue)
    }

    pub fn with_pending_timeout(mut self, timeout: Duration) -> Self {
        self.pending_timeout_ms = timeout.as_millis() as u64;
        self
    }

    fn connection(&self) -> Result<redis::Connection, QueueError> {
        self.client
            .get_connection()
            .map_err(|e| QueueError::Unavailable(e.to_string()))
    }

    /// XGROUP CREATE with MKSTREAM is idempotent for our purposes: the
    /// BUSYGROUP error when the group already exists is ignored.
    fn ensure_consumer_group(&self) -> Result<(), QueueError> {
        let mut conn = self.connection()?;
        let _: Result<String, _> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query(&mut conn);
        Ok(())
    }

    fn add_to_stream(
        &self,
        conn: &mut redis::Connection,
        envelope: &JobEnvelope,
    ) -> Result<String, QueueError> {
        let payload = serde_json::to_string(envelope)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;

        redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg("job_id")
            .arg(envelope.job_id.to_string())
            .arg("attempt")
            .arg(envelope.attempt.to_string())
            .arg("payload")
            .arg(&payload)
            .query(conn)
            .map_err(|e| QueueError::Unavailable(format!("XADD failed: {e}")))
    }

    /// Move due members of the delayed set back onto the stream.
    fn promote_due(&self, conn: &mut redis::Connection) -> Result<(), QueueError> {
        let now_ms = Utc::now().timestamp_millis();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.delayed_key)
            .arg("-inf")
            .arg(now_ms)
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTE_BATCH)
            .query(conn)
            .map_err(|e| QueueError::Unavailable(format!("ZRANGEBYSCORE failed: {e}")))?;

        for payload in due {
            // Remove first so a concurrent worker cannot promote the same
            // member twice; only the remover re-adds it to the stream.
            let removed: u64 = redis::cmd("ZREM")
                .arg(&self.delayed_key)
                .arg(&payload)
                .query(conn)
                .map_err(|e| QueueError::Unavailable(format!("ZREM failed: {e}")))?;
            if removed == 0 {
                continue;
            }

            let envelope: JobEnvelope = serde_json::from_str(&payload)
                .map_err(|e| QueueError::Serialization(e.to_string()))?;
            self.add_to_stream(conn, &envelope)?;
        }
        Ok(())
    }

    /// Reclaim entries another consumer has held past the visibility
    /// timeout (worker crash), then read a new entry for this consumer.
    fn read_one(
        &self,
        conn: &mut redis::Connection,
        consumer: &str,
    ) -> Result<Option<(String, JobEnvelope)>, QueueError> {
        // XPENDING with IDLE filters to entries idle long enough to reclaim.
        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("IDLE")
            .arg(self.pending_timeout_ms)
            .arg("-")
            .arg("+")
            .arg(1)
            .query(conn)
            .unwrap_or_default();

        if let Some((entry_id, _, _, _)) = pending.into_iter().next() {
            let claimed: Vec<redis::Value> = redis::cmd("XCLAIM")
                .arg(&self.stream_key)
                .arg(&self.group)
                .arg(consumer)
                .arg(self.pending_timeout_ms)
                .arg(&entry_id)
                .query(conn)
                .map_err(|e| QueueError::Unavailable(format!("XCLAIM failed: {e}")))?;

            for entry in claimed {
                if let Some(parsed) = self.parse_entry(entry)? {
                    warn!(entry_id = %parsed.0, "reclaimed job from expired lease");
                    return Ok(Some(parsed));
                }
            }
        }

        // New entries for this consumer group.
        let reply: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(consumer)
            .arg("COUNT")
            .arg(1)
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(">")
            .query(conn)
            .map_err(|e| QueueError::Unavailable(format!("XREADGROUP failed: {e}")))?;

        // Reply shape: [[stream_key, [[entry_id, [field, value, ...]], ...]]]
        let redis::Value::Bulk(streams) = reply else {
            return Ok(None);
        };
        for stream in streams {
            let redis::Value::Bulk(parts) = stream else {
                continue;
            };
            let Some(redis::Value::Bulk(entries)) = parts.into_iter().nth(1) else {
                continue;
            };
            for entry in entries {
                if let Some(parsed) = self.parse_entry(entry)? {
                    return Ok(Some(parsed));
                }
            }
        }
        Ok(None)
    }

    /// Parse a stream entry `[entry_id, [field, value, ...]]` into the
    /// entry id and the envelope stored in its `payload` field.
    fn parse_entry(
        &self,
        entry: redis::Value,
    ) -> Result<Option<(String, JobEnvelope)>, QueueError> {
        let redis::Value::Bulk(parts) = entry else {
            return Ok(None);
        };
        let mut parts = parts.into_iter();

        let entry_id = match parts.next() {
            Some(redis::Value::Data(data)) => String::from_utf8_lossy(&data).to_string(),
            _ => return Ok(None),
        };
        let Some(redis::Value::Bulk(fields)) = parts.next() else {
            return Ok(None);
        };

        let mut payload = None;
        let mut iter = fields.into_iter();
        while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
            if let (redis::Value::Data(k), redis::Value::Data(v)) = (key, value) {
                if k.as_slice() == b"payload" {
                    payload = Some(String::from_utf8_lossy(&v).to_string());
                }
            }
        }

        let Some(payload) = payload else {
            return Ok(None);
        };
        let envelope: JobEnvelope = serde_json::from_str(&payload)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        Ok(Some((entry_id, envelope)))
    }

    /// XACK + XDEL; zero acknowledged entries means the lease is stale.
    fn remove_entry(
        &self,
        conn: &mut redis::Connection,
        job_id: JobId,
        token: &LeaseToken,
    ) -> Result<(), QueueError> {
        let acked: u64 = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(token.as_str())
            .query(conn)
            .map_err(|e| QueueError::Unavailable(format!("XACK failed: {e}")))?;
        if acked == 0 {
            return Err(QueueError::LeaseExpired(job_id));
        }

        let _: u64 = redis::cmd("XDEL")
            .arg(&self.stream_key)
            .arg(token.as_str())
            .query(conn)
            .map_err(|e| QueueError::Unavailable(format!("XDEL failed: {e}")))?;
        Ok(())
    }

    fn park_delayed(
        &self,
        conn: &mut redis::Connection,
        envelope: &JobEnvelope,
    ) -> Result<(), QueueError> {
        let payload = serde_json::to_string(envelope)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        let ready_at = Utc::now().timestamp_millis() + envelope.backoff_delay.as_millis() as i64;

        let _: u64 = redis::cmd("ZADD")
            .arg(&self.delayed_key)
            .arg(ready_at)
            .arg(&payload)
            .query(conn)
            .map_err(|e| QueueError::Unavailable(format!("ZADD failed: {e}")))?;
        Ok(())
    }

    fn push_dead_letter(
        &self,
        conn: &mut redis::Connection,
        envelope: &JobEnvelope,
        reason: &str,
    ) -> Result<(), QueueError> {
        let payload = serde_json::to_string(envelope)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;

        let _: String = redis::cmd("XADD")
            .arg(&self.dlq_key)
            .arg("*")
            .arg("job_id")
            .arg(envelope.job_id.to_string())
            .arg("reason")
            .arg(reason)
            .arg("failed_at")
            .arg(Utc::now().to_rfc3339())
            .arg("payload")
            .arg(&payload)
            .query(conn)
            .map_err(|e| QueueError::Unavailable(format!("DLQ XADD failed: {e}")))?;

        warn!(
            job_id = %envelope.job_id,
            attempts = envelope.attempt,
            reason = reason,
            "job dead-lettered"
        );
        Ok(())
    }

    /// Scan the dead-letter stream for an entry describing `job_id`.
    fn find_dead_letter(
        &self,
        conn: &mut redis::Connection,
        job_id: JobId,
    ) -> Result<Option<(String, DeadLetterEntry)>, QueueError> {
        for entry in self.dead_letter_entries(conn, usize::MAX)? {
            if entry.1.envelope.job_id == job_id {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    fn dead_letter_entries(
        &self,
        conn: &mut redis::Connection,
        limit: usize,
    ) -> Result<Vec<(String, DeadLetterEntry)>, QueueError> {
        let mut cmd = redis::cmd("XRANGE");
        cmd.arg(&self.dlq_key).arg("-").arg("+");
        if limit != usize::MAX {
            cmd.arg("COUNT").arg(limit);
        }
        let reply: redis::Value = cmd
            .query(conn)
            .map_err(|e| QueueError::Unavailable(format!("XRANGE failed: {e}")))?;

        let redis::Value::Bulk(entries) = reply else {
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        for entry in entries {
            let redis::Value::Bulk(parts) = entry else {
                continue;
            };
            let mut parts = parts.into_iter();
            let entry_id = match parts.next() {
                Some(redis::Value::Data(data)) => String::from_utf8_lossy(&data).to_string(),
                _ => continue,
            };
            let Some(redis::Value::Bulk(fields)) = parts.next() else {
                continue;
            };

            let mut payload = None;
            let mut reason = String::new();
            let mut failed_at = Utc::now();
            let mut iter = fields.into_iter();
            while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
                let (redis::Value::Data(k), redis::Value::Data(v)) = (key, value) else {
                    continue;
                };
                match k.as_slice() {
                    b"payload" => payload = Some(String::from_utf8_lossy(&v).to_string()),
                    b"reason" => reason = String::from_utf8_lossy(&v).to_string(),
                    b"failed_at" => {
                        if let Ok(ts) =
                            chrono::DateTime::parse_from_rfc3339(&String::from_utf8_lossy(&v))
                        {
                            failed_at = ts.with_timezone(&Utc);
                        }
                    }
                    _ => {}
                }
            }

            let Some(payload) = payload else {
                continue;
            };
            let envelope: JobEnvelope = serde_json::from_str(&payload)
                .map_err(|e| QueueError::Serialization(e.to_string()))?;
            out.push((
                entry_id,
                DeadLetterEntry {
                    envelope,
                    reason,
                    dead_lettered_at: failed_at,
                },
            ));
        }
        Ok(out)
    }
}

impl JobQueue for RedisJobQueue {
    fn enqueue(&self, envelope: JobEnvelope) -> Result<JobId, QueueError> {
        let mut conn = self.connection()?;
        let job_id = envelope.job_id;
        self.add_to_stream(&mut conn, &envelope)?;
        Ok(job_id)
    }

    fn lease(&self, worker_id: &WorkerId) -> Result<Option<LeasedJob>, QueueError> {
        let mut conn = self.connection()?;
        self.promote_due(&mut conn)?;

        let consumer = worker_id.to_string();
        match self.read_one(&mut conn, &consumer)? {
            Some((entry_id, envelope)) => Ok(Some(LeasedJob {
                envelope,
                lease_token: LeaseToken::from_raw(entry_id),
            })),
            None => Ok(None),
        }
    }

    fn acknowledge(&self, job_id: JobId, token: &LeaseToken) -> Result<(), QueueError> {
        let mut conn = self.connection()?;
        self.remove_entry(&mut conn, job_id, token)
    }

    fn fail(
        &self,
        job_id: JobId,
        token: &LeaseToken,
        reason: &str,
    ) -> Result<FailOutcome, QueueError> {
        let mut conn = self.connection()?;

        // The current payload is needed before the entry disappears.
        let claimed: Vec<redis::Value> = redis::cmd("XRANGE")
            .arg(&self.stream_key)
            .arg(token.as_str())
            .arg(token.as_str())
            .query(&mut conn)
            .map_err(|e| QueueError::Unavailable(format!("XRANGE failed: {e}")))?;
        let mut envelope = None;
        for entry in claimed {
            if let Some((_, env)) = self.parse_entry(entry)? {
                envelope = Some(env);
            }
        }
        let Some(mut envelope) = envelope else {
            return Err(QueueError::LeaseExpired(job_id));
        };

        self.remove_entry(&mut conn, job_id, token)?;
        envelope.attempt += 1;

        if envelope.attempts_exhausted() {
            self.push_dead_letter(&mut conn, &envelope, reason)?;
            Ok(FailOutcome::DeadLettered {
                attempts: envelope.attempt,
            })
        } else {
            self.park_delayed(&mut conn, &envelope)?;
            Ok(FailOutcome::Retrying {
                attempt: envelope.attempt,
            })
        }
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        let mut conn = self.connection()?;
        Ok(self
            .dead_letter_entries(&mut conn, limit)?
            .into_iter()
            .map(|(_, entry)| entry)
            .collect())
    }

    fn retry_dead_letter(&self, job_id: JobId) -> Result<JobEnvelope, QueueError> {
        let mut conn = self.connection()?;

        let (entry_id, entry) = self
            .find_dead_letter(&mut conn, job_id)?
            .ok_or(QueueError::NotFound(job_id))?;

        let _: u64 = redis::cmd("XDEL")
            .arg(&self.dlq_key)
            .arg(&entry_id)
            .query(&mut conn)
            .map_err(|e| QueueError::Unavailable(format!("XDEL failed: {e}")))?;

        let mut envelope = entry.envelope;
        envelope.attempt = 0;
        self.add_to_stream(&mut conn, &envelope)?;
        Ok(envelope)
    }

    fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.connection()?;

        let total: usize = redis::cmd("XLEN")
            .arg(&self.stream_key)
            .query(&mut conn)
            .map_err(|e| QueueError::Unavailable(format!("XLEN failed: {e}")))?;

        // XPENDING summary reply starts with the pending entry count.
        let leased: usize = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .query::<redis::Value>(&mut conn)
            .ok()
            .and_then(|reply| match reply {
                redis::Value::Bulk(parts) => match parts.first() {
                    Some(redis::Value::Int(n)) => Some(*n as usize),
                    _ => None,
                },
                _ => None,
            })
            .unwrap_or(0);

        let delayed: usize = redis::cmd("ZCARD")
            .arg(&self.delayed_key)
            .query(&mut conn)
            .map_err(|e| QueueError::Unavailable(format!("ZCARD failed: {e}")))?;

        let dead_lettered: usize = redis::cmd("XLEN")
            .arg(&self.dlq_key)
            .query(&mut conn)
            .map_err(|e| QueueError::Unavailable(format!("XLEN failed: {e}")))?;

        Ok(QueueStats {
            ready: total.saturating_sub(leased),
            delayed,
            leased,
            dead_lettered,
        })
    }
}
