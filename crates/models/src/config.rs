use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration recognized by the scheduling core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct Config {
    /// Failed transformation attempts tolerated before a view is parked in
    /// the failed state.
    #[serde(default = "Config::default_max_retries")]
    pub max_retries: u32,
    /// Upper bound on the exponential retry backoff, in seconds.
    #[serde(default = "Config::default_retry_backoff_cap_seconds")]
    pub retry_backoff_cap_seconds: u64,
    /// How long a metadata fetch for an external view may take before it is
    /// treated as a failed materialization.
    #[serde(default = "Config::default_metadata_fetch_timeout_seconds")]
    pub metadata_fetch_timeout_seconds: u64,
    /// How many view supervisor inboxes may be drained concurrently.
    #[serde(default = "Config::default_views_dispatcher_parallelism")]
    pub views_dispatcher_parallelism: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_retries: Self::default_max_retries(),
            retry_backoff_cap_seconds: Self::default_retry_backoff_cap_seconds(),
            metadata_fetch_timeout_seconds: Self::default_metadata_fetch_timeout_seconds(),
            views_dispatcher_parallelism: Self::default_views_dispatcher_parallelism(),
        }
    }
}

impl Config {
    fn default_max_retries() -> u32 {
        5
    }
    fn default_retry_backoff_cap_seconds() -> u64 {
        60
    }
    fn default_metadata_fetch_timeout_seconds() -> u64 {
        10
    }
    fn default_views_dispatcher_parallelism() -> usize {
        8
    }

    /// Backoff before the attempt following `retry` failures:
    /// `2^retry` seconds, capped.
    pub fn retry_backoff(&self, retry: u32) -> Duration {
        let exp = 1u64 << retry.min(63);
        Duration::from_secs(exp.min(self.retry_backoff_cap_seconds))
    }

    pub fn metadata_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_fetch_timeout_seconds)
    }
}
