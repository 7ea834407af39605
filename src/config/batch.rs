//! Batch scheduler configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Batch size, pacing and backpressure settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Tasks pulled per batch.
    pub batch_size: usize,
    /// Seconds between batch starts.
    pub interval_secs: u64,
    /// Milliseconds between consecutive dispatches within a batch.
    pub stagger_delay_ms: u64,
    /// Concurrent generation calls per batch.
    pub max_workers: usize,
    /// Seconds before a single generation call is abandoned.
    pub generation_timeout_secs: u64,
    /// Capability every generation call consumes.
    pub capability: String,
    /// Whether credential exhaustion pauses pulling.
    pub pause_on_rate_limit: bool,
    /// Seconds pulling is paused after credential exhaustion.
    pub rate_limit_pause_secs: u64,
    /// Consecutive exhausted batches that open the circuit.
    pub circuit_threshold: u32,
    /// Seconds the circuit stays open.
    pub circuit_cooldown_secs: u64,
    /// Reap after this many batches.
    pub reap_every_batches: u32,
    /// Lifetime of the heartbeat record.
    pub heartbeat_ttl_secs: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 18,
            interval_secs: 60,
            stagger_delay_ms: 500,
            max_workers: 18,
            generation_timeout_secs: 120,
            capability: "image".into(),
            pause_on_rate_limit: true,
            // one quota window plus a small buffer
            rate_limit_pause_secs: 70,
            circuit_threshold: 3,
            circuit_cooldown_secs: 300,
            reap_every_batches: 10,
            heartbeat_ttl_secs: 180,
        }
    }
}

impl BatchConfig {
    /// Override batch size and worker count together.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self.max_workers = batch_size;
        self
    }

    /// Override the worker count.
    #[must_use]
    pub const fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// Override the stagger delay.
    #[must_use]
    pub const fn with_stagger_delay(mut self, delay: Duration) -> Self {
        self.stagger_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Override the per-call timeout.
    #[must_use]
    pub const fn with_generation_timeout(mut self, timeout: Duration) -> Self {
        self.generation_timeout_secs = timeout.as_secs();
        self
    }

    /// Override the circuit breaker.
    #[must_use]
    pub const fn with_circuit(mut self, threshold: u32, cooldown: Duration) -> Self {
        self.circuit_threshold = threshold;
        self.circuit_cooldown_secs = cooldown.as_secs();
        self
    }

    /// Override the reap cadence.
    #[must_use]
    pub const fn with_reap_every(mut self, batches: u32) -> Self {
        self.reap_every_batches = batches;
        self
    }

    /// Time between batch starts.
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Delay between dispatches.
    pub const fn stagger_delay(&self) -> Duration {
        Duration::from_millis(self.stagger_delay_ms)
    }

    /// Per-call timeout.
    pub const fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }

    /// Pause after exhaustion.
    pub const fn rate_limit_pause(&self) -> Duration {
        Duration::from_secs(self.rate_limit_pause_secs)
    }

    /// Circuit cooldown.
    pub const fn circuit_cooldown(&self) -> Duration {
        Duration::from_secs(self.circuit_cooldown_secs)
    }

    /// Heartbeat lifetime.
    pub const fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_ttl_secs)
    }

    /// Validate batch configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size == 0 {
            return Err("batch_size must be greater than 0".into());
        }
        if self.max_workers == 0 {
            return Err("max_workers must be greater than 0".into());
        }
        if self.interval_secs == 0 {
            return Err("interval_secs must be greater than 0".into());
        }
        if self.generation_timeout_secs == 0 {
            return Err("generation_timeout_secs must be greater than 0".into());
        }
        if self.capability.trim().is_empty() {
            return Err("capability must not be empty".into());
        }
        if self.circuit_threshold == 0 {
            return Err("circuit_threshold must be greater than 0".into());
        }
        if self.reap_every_batches == 0 {
            return Err("reap_every_batches must be greater than 0".into());
        }
        if self.circuit_cooldown_secs < self.rate_limit_pause_secs {
            return Err("circuit_cooldown_secs must not be shorter than rate_limit_pause_secs".into());
        }
        Ok(())
    }
}
