//! The transient per-job outcome handed from the processor to the
//! reconciler. Never persisted; consumed exactly once.

use std::path::PathBuf;

use cropcart_products::ImageRecord;

/// A file that failed transform or upload, with the reason.
#[derive(Debug, Clone)]
pub struct FailedFile {
    pub path: PathBuf,
    pub reason: String,
}

/// Aggregated result of processing one job envelope.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    /// Records for files that were transformed and uploaded.
    pub successes: Vec<ImageRecord>,
    /// Files that failed, with reasons. Does not abort the envelope.
    pub failures: Vec<FailedFile>,
    /// The product's image list before this job ran; superseded records are
    /// deleted after the replacement set is committed.
    pub previous: Vec<ImageRecord>,
    /// The product version the job was computed against; the reconciler's
    /// conditional update checks it.
    pub product_version: u64,
}

impl JobOutcome {
    pub fn attempted(&self) -> usize {
        self.successes.len() + self.failures.len()
    }

    pub fn any_success(&self) -> bool {
        !self.successes.is_empty()
    }

    pub fn all_failed(&self) -> bool {
        self.successes.is_empty() && !self.failures.is_empty()
    }

    /// One-line failure summary for queue `fail` reasons and logs.
    pub fn failure_summary(&self) -> String {
        self.failures
            .iter()
            .map(|f| format!("{}: {}", f.path.display(), f.reason))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitions_are_reported_correctly() {
        let outcome = JobOutcome {
            successes: vec![ImageRecord::new("https://cdn/x1", "x1")],
            failures: vec![FailedFile {
                path: PathBuf::from("b.jpg"),
                reason: "decode failed".to_string(),
            }],
            previous: vec![],
            product_version: 1,
        };

        assert_eq!(outcome.attempted(), 2);
        assert!(outcome.any_success());
        assert!(!outcome.all_failed());
        assert!(outcome.failure_summary().contains("b.jpg"));
    }

    #[test]
    fn all_failed_requires_at_least_one_failure() {
        let empty = JobOutcome {
            successes: vec![],
            failures: vec![],
            previous: vec![],
            product_version: 1,
        };
        assert!(!empty.all_failed());
        assert_eq!(empty.attempted(), 0);
    }
}
