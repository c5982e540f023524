//! Operator-facing pipeline configuration.

use std::time::Duration;

use tracing::warn;

/// Default number of concurrently leased jobs.
pub const DEFAULT_WORKER_CONCURRENCY: usize = 3;

/// Default idle poll interval between lease attempts.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Default remote-storage folder for product images.
pub const DEFAULT_UPLOAD_FOLDER: &str = "products";

/// Pipeline configuration.
///
/// Loaded from the environment at the composition root; all fields have
/// safe defaults so local development works without any variables set.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Fixed worker concurrency `W`: at most this many jobs in flight.
    pub worker_concurrency: usize,
    /// Sleep between lease attempts when the queue is empty.
    pub poll_interval: Duration,
    /// Logical remote-storage folder uploads land in.
    pub upload_folder: String,
    /// Broker address for the Redis-backed queue, when one is used.
    pub redis_url: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: DEFAULT_WORKER_CONCURRENCY,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            upload_folder: DEFAULT_UPLOAD_FOLDER.to_string(),
            redis_url: None,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from `CROPCART_*` environment variables, warning
    /// and falling back to defaults on missing or unparseable values.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var("CROPCART_WORKER_CONCURRENCY") {
            match raw.parse::<usize>() {
                Ok(n) if n > 0 => config.worker_concurrency = n,
                _ => warn!(value = %raw, "invalid CROPCART_WORKER_CONCURRENCY; using default"),
            }
        }

        if let Ok(raw) = std::env::var("CROPCART_POLL_INTERVAL_MS") {
            match raw.parse::<u64>() {
                Ok(ms) => config.poll_interval = Duration::from_millis(ms),
                Err(_) => warn!(value = %raw, "invalid CROPCART_POLL_INTERVAL_MS; using default"),
            }
        }

        if let Ok(folder) = std::env::var("CROPCART_UPLOAD_FOLDER") {
            if !folder.is_empty() {
                config.upload_folder = folder;
            }
        }

        config.redis_url = std::env::var("CROPCART_REDIS_URL").ok();

        config
    }

    pub fn with_worker_concurrency(mut self, w: usize) -> Self {
        self.worker_concurrency = w;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_operational_contract() {
        let config = PipelineConfig::default();
        assert_eq!(config.worker_concurrency, 3);
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.upload_folder, "products");
        assert!(config.redis_url.is_none());
    }
}
