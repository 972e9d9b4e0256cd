//! Pipeline configuration from environment variables

use std::env;
use std::time::Duration;

/// Configuration for the remitflow runtime
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Path to SQLite database file
    pub db_path: String,

    /// Logical feed consumer identifier (one checkpoint row per consumer)
    pub consumer_id: String,

    /// Feed poll interval in milliseconds
    pub poll_interval_ms: u64,

    /// Maximum change events pulled per poll
    pub batch_size: usize,

    /// Upper bound on any single store call made by the consumer
    pub store_timeout_ms: u64,

    /// How long a configuration snapshot may be reused
    pub config_cache_ttl_ms: u64,

    /// Interval of the TIME-threshold sweep over accumulating buckets
    pub time_sweep_interval_ms: u64,

    /// Release notice channel buffer size
    pub release_channel_buffer: usize,

    /// Adjudication statuses that count as settled (upper-case)
    pub settled_statuses: Vec<String>,

    /// Master enable flag for the runtime
    pub enabled: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            db_path: "remitflow.db".to_string(),
            consumer_id: "claims-feed".to_string(),
            poll_interval_ms: 5_000,
            batch_size: 100,
            store_timeout_ms: 10_000,
            config_cache_ttl_ms: 5_000,
            time_sweep_interval_ms: 60_000,
            release_channel_buffer: 1_000,
            settled_statuses: default_settled_statuses(),
            enabled: false,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `REMITFLOW_DB_PATH` (default: remitflow.db)
    /// - `REMITFLOW_CONSUMER_ID` (default: claims-feed)
    /// - `FEED_POLL_INTERVAL_MS` (default: 5000)
    /// - `FEED_BATCH_SIZE` (default: 100)
    /// - `STORE_TIMEOUT_MS` (default: 10000)
    /// - `CONFIG_CACHE_TTL_MS` (default: 5000)
    /// - `TIME_SWEEP_INTERVAL_MS` (default: 60000)
    /// - `RELEASE_CHANNEL_BUFFER` (default: 1000)
    /// - `SETTLED_CLAIM_STATUSES` (default: PAID,ADJUDICATED)
    /// - `ENABLE_PIPELINE` (default: false)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            db_path: env::var("REMITFLOW_DB_PATH").unwrap_or(defaults.db_path),

            consumer_id: env::var("REMITFLOW_CONSUMER_ID")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.consumer_id),

            poll_interval_ms: parse_var("FEED_POLL_INTERVAL_MS", defaults.poll_interval_ms),

            batch_size: parse_var("FEED_BATCH_SIZE", defaults.batch_size).max(1),

            store_timeout_ms: parse_var("STORE_TIMEOUT_MS", defaults.store_timeout_ms),

            config_cache_ttl_ms: parse_var("CONFIG_CACHE_TTL_MS", defaults.config_cache_ttl_ms),

            time_sweep_interval_ms: parse_var("TIME_SWEEP_INTERVAL_MS", defaults.time_sweep_interval_ms),

            release_channel_buffer: parse_var("RELEASE_CHANNEL_BUFFER", defaults.release_channel_buffer)
                .max(1),

            settled_statuses: env::var("SETTLED_CLAIM_STATUSES")
                .map(|s| parse_status_list(&s))
                .ok()
                .filter(|list| !list.is_empty())
                .unwrap_or(defaults.settled_statuses),

            enabled: parse_var("ENABLE_PIPELINE", defaults.enabled),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn config_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.config_cache_ttl_ms)
    }

    pub fn time_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.time_sweep_interval_ms)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

/// Comma-separated, case-insensitive, blanks dropped
pub fn parse_status_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_ascii_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

pub fn default_settled_statuses() -> Vec<String> {
    vec!["PAID".to_string(), "ADJUDICATED".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    // Both cases live in one test: env vars are process-global and tests run in parallel
    #[test]
    fn test_config_from_env() {
        // Test: Default configuration when no env vars set
        for var in [
            "REMITFLOW_DB_PATH",
            "REMITFLOW_CONSUMER_ID",
            "FEED_POLL_INTERVAL_MS",
            "FEED_BATCH_SIZE",
            "SETTLED_CLAIM_STATUSES",
            "ENABLE_PIPELINE",
        ] {
            env::remove_var(var);
        }

        let config = PipelineConfig::from_env();

        assert_eq!(config.db_path, "remitflow.db");
        assert_eq!(config.consumer_id, "claims-feed");
        assert_eq!(config.poll_interval_ms, 5_000);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.store_timeout_ms, 10_000);
        assert_eq!(config.settled_statuses, vec!["PAID", "ADJUDICATED"]);
        assert!(!config.enabled);

        // Test: Custom configuration from env vars
        env::set_var("REMITFLOW_DB_PATH", "/tmp/remit.db");
        env::set_var("FEED_BATCH_SIZE", "25");
        env::set_var("FEED_POLL_INTERVAL_MS", "not-a-number");
        env::set_var("SETTLED_CLAIM_STATUSES", " paid , settled,, ");
        env::set_var("ENABLE_PIPELINE", "true");

        let config = PipelineConfig::from_env();

        assert_eq!(config.db_path, "/tmp/remit.db");
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.poll_interval_ms, 5_000);
        assert_eq!(config.settled_statuses, vec!["PAID", "SETTLED"]);
        assert!(config.enabled);

        // Cleanup
        for var in [
            "REMITFLOW_DB_PATH",
            "FEED_BATCH_SIZE",
            "FEED_POLL_INTERVAL_MS",
            "SETTLED_CLAIM_STATUSES",
            "ENABLE_PIPELINE",
        ] {
            env::remove_var(var);
        }
    }
}
