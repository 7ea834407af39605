//! Task store configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry budget, staleness thresholds and record lifetimes for the task store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Prefix for every store key the task store writes.
    pub key_prefix: String,
    /// Counted failures after which a task fails permanently.
    pub max_retries: u32,
    /// Seconds a task may wait in pending before it is reaped.
    pub stale_pending_secs: u64,
    /// Seconds a task may wait in retry (since its last failure) before it is reaped.
    pub stale_retry_secs: u64,
    /// Seconds a task may stay claimed before it is reaped.
    pub stale_processing_secs: u64,
    /// Lifetime of task records.
    pub task_ttl_secs: u64,
    /// Lifetime of stored results.
    pub result_ttl_secs: u64,
    /// Lifetime of job membership and dependency records.
    pub job_ttl_secs: u64,
    /// Candidates examined per state on a single pull.
    pub pull_scan_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            key_prefix: "imgq".into(),
            max_retries: 3,
            stale_pending_secs: 2 * 3600,
            stale_retry_secs: 3600,
            stale_processing_secs: 1800,
            task_ttl_secs: 24 * 3600,
            result_ttl_secs: 24 * 3600,
            job_ttl_secs: 24 * 3600,
            pull_scan_limit: 500,
        }
    }
}

impl QueueConfig {
    /// Override the key prefix.
    #[must_use]
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Override the retry budget.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Override the three staleness thresholds.
    #[must_use]
    pub const fn with_staleness(mut self, pending: Duration, retry: Duration, processing: Duration) -> Self {
        self.stale_pending_secs = pending.as_secs();
        self.stale_retry_secs = retry.as_secs();
        self.stale_processing_secs = processing.as_secs();
        self
    }

    /// Pending staleness threshold.
    pub const fn stale_pending(&self) -> Duration {
        Duration::from_secs(self.stale_pending_secs)
    }

    /// Retry staleness threshold.
    pub const fn stale_retry(&self) -> Duration {
        Duration::from_secs(self.stale_retry_secs)
    }

    /// Processing staleness threshold.
    pub const fn stale_processing(&self) -> Duration {
        Duration::from_secs(self.stale_processing_secs)
    }

    /// Task record lifetime.
    pub const fn task_ttl(&self) -> Duration {
        Duration::from_secs(self.task_ttl_secs)
    }

    /// Result lifetime.
    pub const fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }

    /// Job and dependency record lifetime.
    pub const fn job_ttl(&self) -> Duration {
        Duration::from_secs(self.job_ttl_secs)
    }

    /// Validate queue configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.key_prefix.trim().is_empty() {
            return Err("key_prefix must not be empty".into());
        }
        if self.max_retries == 0 {
            return Err("max_retries must be greater than 0".into());
        }
        if self.stale_pending_secs == 0 || self.stale_retry_secs == 0 || self.stale_processing_secs == 0 {
            return Err("staleness thresholds must be greater than 0".into());
        }
        if self.task_ttl_secs == 0 || self.result_ttl_secs == 0 || self.job_ttl_secs == 0 {
            return Err("ttls must be greater than 0".into());
        }
        if self.pull_scan_limit == 0 {
            return Err("pull_scan_limit must be greater than 0".into());
        }
        Ok(())
    }
}
