//! The job envelope and its wire schema.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cropcart_core::{DomainError, DomainResult};
use cropcart_products::ProductId;

/// Upper bound on files per envelope; the submission layer enforces the
/// same bound on the multi-part request.
pub const MAX_FILES_PER_JOB: usize = 5;

/// Attempts before a job is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Fixed delay before a failed job becomes leasable again.
pub const DEFAULT_BACKOFF_DELAY_MS: u64 = 5000;

/// Unique job identifier, generated at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The immutable unit of deferred work: one batch of local files to
/// transform and upload for one product.
///
/// Immutable except for `attempt`, which the queue increments on each
/// failed attempt. The referenced file paths must stay valid until the job
/// reaches a terminal state (acknowledged or dead-lettered).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEnvelope {
    pub job_id: JobId,
    pub entity_id: ProductId,
    pub file_paths: Vec<PathBuf>,
    pub attempt: u32,
    pub max_attempts: u32,
    #[serde(rename = "backoffDelayMs", with = "duration_millis")]
    pub backoff_delay: Duration,
    pub enqueued_at: DateTime<Utc>,
}

impl JobEnvelope {
    /// Build an envelope with default retry settings. Fails when the file
    /// list is empty or exceeds [`MAX_FILES_PER_JOB`].
    pub fn new(entity_id: ProductId, file_paths: Vec<PathBuf>) -> DomainResult<Self> {
        if file_paths.is_empty() {
            return Err(DomainError::validation("job requires at least one file"));
        }
        if file_paths.len() > MAX_FILES_PER_JOB {
            return Err(DomainError::validation(format!(
                "job holds {} files, at most {} allowed",
                file_paths.len(),
                MAX_FILES_PER_JOB
            )));
        }

        Ok(Self {
            job_id: JobId::new(),
            entity_id,
            file_paths,
            attempt: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_delay: Duration::from_millis(DEFAULT_BACKOFF_DELAY_MS),
            enqueued_at: Utc::now(),
        })
    }

    /// Override the retry settings (operator knobs; tests use short delays).
    pub fn with_retry(mut self, max_attempts: u32, backoff_delay: Duration) -> Self {
        self.max_attempts = max_attempts;
        self.backoff_delay = backoff_delay;
        self
    }

    /// Whether another failure would exhaust this envelope.
    pub fn attempts_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(de)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cropcart_core::EntityId;

    fn paths(n: usize) -> Vec<PathBuf> {
        (0..n).map(|i| PathBuf::from(format!("/tmp/{i}.jpg"))).collect()
    }

    #[test]
    fn rejects_empty_file_list() {
        let err = JobEnvelope::new(ProductId::new(EntityId::new()), vec![]).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn rejects_more_than_five_files() {
        let err = JobEnvelope::new(ProductId::new(EntityId::new()), paths(6)).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn defaults_match_the_operational_contract() {
        let env = JobEnvelope::new(ProductId::new(EntityId::new()), paths(2)).unwrap();
        assert_eq!(env.attempt, 0);
        assert_eq!(env.max_attempts, 3);
        assert_eq!(env.backoff_delay, Duration::from_millis(5000));
    }

    #[test]
    fn wire_schema_uses_camel_case_field_names() {
        let env = JobEnvelope::new(ProductId::new(EntityId::new()), paths(1)).unwrap();
        let json = serde_json::to_value(&env).unwrap();
        let obj = json.as_object().unwrap();

        for field in [
            "jobId",
            "entityId",
            "filePaths",
            "attempt",
            "maxAttempts",
            "backoffDelayMs",
            "enqueuedAt",
        ] {
            assert!(obj.contains_key(field), "missing wire field {field}");
        }
        assert_eq!(json["backoffDelayMs"], 5000);
    }

    #[test]
    fn wire_schema_round_trips() {
        let env = JobEnvelope::new(ProductId::new(EntityId::new()), paths(3)).unwrap();
        let json = serde_json::to_string(&env).unwrap();
        let back: JobEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(env, back);
    }

    #[test]
    fn exhaustion_tracks_attempt_against_max() {
        let mut env = JobEnvelope::new(ProductId::new(EntityId::new()), paths(1))
            .unwrap()
            .with_retry(2, Duration::from_millis(10));
        assert!(!env.attempts_exhausted());
        env.attempt = 2;
        assert!(env.attempts_exhausted());
    }
}
