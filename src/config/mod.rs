//! Configuration models for the task store, credential pool and scheduler.
//!
//! Every section validates itself; [`AppConfig`] can be parsed from JSON or
//! assembled from environment variables (a `.env` file is honoured).

pub mod batch;
pub mod credentials;
pub mod queue;

use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use batch::BatchConfig;
pub use credentials::{CapabilityLimits, CredentialConfig};
pub use queue::QueueConfig;

/// Shared store backend selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StoreBackendConfig {
    /// Process-local store; state is lost on exit.
    InMemory,
    /// Redis at `url`.
    Redis {
        /// Connection URL, e.g. `redis://localhost:6379/1`.
        url: String,
    },
}

impl Default for StoreBackendConfig {
    fn default() -> Self {
        Self::Redis {
            url: "redis://127.0.0.1:6379/1".into(),
        }
    }
}

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Store backend.
    pub store: StoreBackendConfig,
    /// Task store settings.
    pub queue: QueueConfig,
    /// Scheduler settings.
    pub batch: BatchConfig,
    /// Credential pool settings.
    pub credentials: CredentialConfig,
}

impl AppConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        if let StoreBackendConfig::Redis { url } = &self.store {
            if url.trim().is_empty() {
                return Err("store url must not be empty".into());
            }
        }
        self.queue.validate().map_err(|e| format!("queue invalid: {e}"))?;
        self.batch.validate().map_err(|e| format!("batch invalid: {e}"))?;
        self.credentials
            .validate()
            .map_err(|e| format!("credentials invalid: {e}"))?;
        if !self.credentials.limits.contains_key(&self.batch.capability) {
            return Err(format!(
                "batch capability `{}` has no credential limits",
                self.batch.capability
            ));
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load `.env` if present, then build from the process environment.
    ///
    /// # Environment Variables
    ///
    /// - `REDIS_URL`, or `REDIS_HOST` / `REDIS_PORT` / `REDIS_QUEUE_DB`; `memory` selects the in-memory store
    /// - `QUEUE_KEY_PREFIX`, `QUEUE_MAX_RETRIES`
    /// - `QUEUE_STALE_PENDING_HOURS`, `QUEUE_STALE_RETRY_HOURS`, `QUEUE_STALE_PROCESSING_HOURS`
    /// - `QUEUE_TASK_TTL`, `QUEUE_RESULT_TTL`, `QUEUE_JOB_TTL` (seconds)
    /// - `QUEUE_BATCH_SIZE`, `QUEUE_MAX_WORKERS`, `QUEUE_BATCH_INTERVAL`, `QUEUE_BATCH_TIMEOUT`
    /// - `QUEUE_STAGGER_DELAY` (seconds, fractional)
    /// - `QUEUE_PAUSE_ON_RATE_LIMIT`, `QUEUE_RATE_LIMIT_PAUSE`, `QUEUE_CLEANUP_INTERVAL`
    /// - `CIRCUIT_BREAKER_THRESHOLD`, `CIRCUIT_BREAKER_RESET_TIME`
    /// - `CREDENTIAL_KEYS` (comma-separated)
    /// - `IMAGE_RPM`, `IMAGE_DAILY`, `TEXT_RPM`, `TEXT_DAILY`
    /// - `QUOTA_RESET_TZ` (IANA time-zone name)
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup, then validate.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(url) = lookup("REDIS_URL") {
            cfg.store = if url.eq_ignore_ascii_case("memory") {
                StoreBackendConfig::InMemory
            } else {
                StoreBackendConfig::Redis { url }
            };
        } else if let Some(host) = lookup("REDIS_HOST") {
            let port: u16 = parse_or(&lookup, "REDIS_PORT", 6379)?;
            let db: u32 = parse_or(&lookup, "REDIS_QUEUE_DB", 1)?;
            cfg.store = StoreBackendConfig::Redis {
                url: format!("redis://{host}:{port}/{db}"),
            };
        }

        let queue = &mut cfg.queue;
        if let Some(prefix) = lookup("QUEUE_KEY_PREFIX") {
            queue.key_prefix = prefix;
        }
        queue.max_retries = parse_or(&lookup, "QUEUE_MAX_RETRIES", queue.max_retries)?;
        queue.stale_pending_secs = hours_or(&lookup, "QUEUE_STALE_PENDING_HOURS", queue.stale_pending_secs)?;
        queue.stale_retry_secs = hours_or(&lookup, "QUEUE_STALE_RETRY_HOURS", queue.stale_retry_secs)?;
        queue.stale_processing_secs =
            hours_or(&lookup, "QUEUE_STALE_PROCESSING_HOURS", queue.stale_processing_secs)?;
        queue.task_ttl_secs = parse_or(&lookup, "QUEUE_TASK_TTL", queue.task_ttl_secs)?;
        queue.result_ttl_secs = parse_or(&lookup, "QUEUE_RESULT_TTL", queue.result_ttl_secs)?;
        queue.job_ttl_secs = parse_or(&lookup, "QUEUE_JOB_TTL", queue.job_ttl_secs)?;

        let batch = &mut cfg.batch;
        batch.batch_size = parse_or(&lookup, "QUEUE_BATCH_SIZE", batch.batch_size)?;
        batch.max_workers = parse_or(&lookup, "QUEUE_MAX_WORKERS", batch.batch_size)?;
        batch.interval_secs = parse_or(&lookup, "QUEUE_BATCH_INTERVAL", batch.interval_secs)?;
        batch.generation_timeout_secs =
            parse_or(&lookup, "QUEUE_BATCH_TIMEOUT", batch.generation_timeout_secs)?;
        if let Some(raw) = lookup("QUEUE_STAGGER_DELAY") {
            let secs: f64 = parse_value(&raw, "QUEUE_STAGGER_DELAY")?;
            batch.stagger_delay_ms = secs_to_millis(secs, "QUEUE_STAGGER_DELAY")?;
        }
        if let Some(raw) = lookup("QUEUE_PAUSE_ON_RATE_LIMIT") {
            batch.pause_on_rate_limit = parse_bool(&raw, "QUEUE_PAUSE_ON_RATE_LIMIT")?;
        }
        batch.rate_limit_pause_secs =
            parse_or(&lookup, "QUEUE_RATE_LIMIT_PAUSE", batch.rate_limit_pause_secs)?;
        batch.reap_every_batches = parse_or(&lookup, "QUEUE_CLEANUP_INTERVAL", batch.reap_every_batches)?;
        batch.circuit_threshold = parse_or(&lookup, "CIRCUIT_BREAKER_THRESHOLD", batch.circuit_threshold)?;
        batch.circuit_cooldown_secs =
            parse_or(&lookup, "CIRCUIT_BREAKER_RESET_TIME", batch.circuit_cooldown_secs)?;

        let creds = &mut cfg.credentials;
        if let Some(raw) = lookup("CREDENTIAL_KEYS") {
            creds.keys = raw
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_owned)
                .collect();
        }
        for (capability, prefix) in [("image", "IMAGE"), ("text", "TEXT")] {
            if let Some(limits) = creds.limits.get_mut(capability) {
                limits.per_window = parse_or(&lookup, &format!("{prefix}_RPM"), limits.per_window)?;
                limits.per_day = parse_or(&lookup, &format!("{prefix}_DAILY"), limits.per_day)?;
            }
        }
        creds.daily_reset_tz = parse_or(&lookup, "QUOTA_RESET_TZ", creds.daily_reset_tz)?;

        cfg.validate()?;
        Ok(cfg)
    }
}

fn parse_value<T: FromStr>(raw: &str, name: &str) -> Result<T, String>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| format!("invalid value for {name}: {e}"))
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> Result<T, String>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(name).map_or(Ok(default), |raw| parse_value(&raw, name))
}

fn parse_bool(raw: &str, name: &str) -> Result<bool, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(format!("invalid value for {name}: `{other}` is not a boolean")),
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn secs_to_millis(secs: f64, name: &str) -> Result<u64, String> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("invalid value for {name}: must be a non-negative number"));
    }
    Ok((secs * 1000.0).round() as u64)
}

fn hours_or<F>(lookup: &F, name: &str, default_secs: u64) -> Result<u64, String>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(default_secs),
        Some(raw) => {
            let hours: f64 = parse_value(&raw, name)?;
            Ok(secs_to_millis(hours * 3600.0, name)? / 1000)
        }
    }
}
