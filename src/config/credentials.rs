//! Credential pool configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Quota of one capability on one credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityLimits {
    /// Calls allowed per short window.
    pub per_window: u32,
    /// Calls allowed per day.
    pub per_day: u32,
}

/// Credentials, quotas and the daily reset boundary.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    /// Credential secrets, in rotation order.
    pub keys: Vec<String>,
    /// Prefix for every store key the credential pool writes.
    pub key_prefix: String,
    /// Limits per capability name.
    pub limits: BTreeMap<String, CapabilityLimits>,
    /// Length of the short quota window in seconds.
    pub window_secs: u64,
    /// Seconds a rate-limited credential stays quarantined.
    pub cooldown_secs: u64,
    /// Time zone whose local midnight resets daily quotas.
    pub daily_reset_tz: Tz,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        let mut limits = BTreeMap::new();
        limits.insert(
            "image".to_owned(),
            CapabilityLimits {
                per_window: 18,
                per_day: 240,
            },
        );
        limits.insert(
            "text".to_owned(),
            CapabilityLimits {
                per_window: 900,
                per_day: 9000,
            },
        );
        Self {
            keys: Vec::new(),
            key_prefix: "quota".into(),
            limits,
            window_secs: 60,
            cooldown_secs: 60,
            daily_reset_tz: Tz::America__Los_Angeles,
        }
    }
}

impl fmt::Debug for CredentialConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialConfig")
            .field("keys", &format_args!("[{} redacted]", self.keys.len()))
            .field("key_prefix", &self.key_prefix)
            .field("limits", &self.limits)
            .field("window_secs", &self.window_secs)
            .field("cooldown_secs", &self.cooldown_secs)
            .field("daily_reset_tz", &self.daily_reset_tz)
            .finish()
    }
}

impl CredentialConfig {
    /// Replace the credential list.
    #[must_use]
    pub fn with_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Set the limits of one capability.
    #[must_use]
    pub fn with_limits(mut self, capability: impl Into<String>, per_window: u32, per_day: u32) -> Self {
        self.limits.insert(
            capability.into(),
            CapabilityLimits {
                per_window,
                per_day,
            },
        );
        self
    }

    /// Short window length.
    pub const fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Rate-limit quarantine length.
    pub const fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    /// Validate credential configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.keys.is_empty() {
            return Err("at least one credential must be configured".into());
        }
        if self.keys.iter().any(|k| k.trim().is_empty()) {
            return Err("credentials must not be blank".into());
        }
        if self.key_prefix.trim().is_empty() {
            return Err("key_prefix must not be empty".into());
        }
        if self.limits.is_empty() {
            return Err("at least one capability must have limits".into());
        }
        for (name, limits) in &self.limits {
            if limits.per_window == 0 || limits.per_day == 0 {
                return Err(format!("capability `{name}` limits must be greater than 0"));
            }
        }
        if self.window_secs == 0 || self.cooldown_secs == 0 {
            return Err("window_secs and cooldown_secs must be greater than 0".into());
        }
        Ok(())
    }
}
