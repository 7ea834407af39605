//! Credential rotation under per-capability quotas.
//!
//! Each credential has, per capability, a short-window counter that expires
//! with its window and a daily counter that expires at the next local
//! midnight of the configured time zone. A credential is available while both
//! are below their limits and it has not been marked permanently unusable.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Days, LocalResult, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::config::{CapabilityLimits, CredentialConfig};
use crate::core::error::CredentialError;
use crate::infra::store::{read_counter, SharedStore};
use crate::util::clock::{Clock, SystemClock};

const NO_SELECTION: usize = usize::MAX;

/// An API credential. The secret never appears in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    id: String,
    secret: String,
}

impl Credential {
    /// Wrap a secret; the id is a stable fingerprint of it.
    pub fn new(secret: impl Into<String>) -> Self {
        let secret = secret.into();
        Self {
            id: fingerprint(&secret),
            secret,
        }
    }

    /// Stable identifier safe to log.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The secret to hand to the provider.
    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// First 8 bytes of the secret's SHA-256, hex encoded.
fn fingerprint(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

/// Which credentials an administrative reset applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetTarget {
    /// Every credential in the pool.
    All,
    /// One credential by id.
    Credential(String),
}

/// Quota usage of one credential for one capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialUsage {
    /// Credential id.
    pub credential_id: String,
    /// Capability name.
    pub capability: String,
    /// Calls in the current short window.
    pub window_count: u64,
    /// Calls today.
    pub daily_count: u64,
    /// Short-window limit.
    pub window_limit: u32,
    /// Daily limit.
    pub daily_limit: u32,
    /// Marked permanently unusable.
    pub unusable: bool,
    /// Below both limits and not unusable.
    pub available: bool,
}

/// Pool-wide headroom for one capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSummary {
    /// Capability name.
    pub capability: String,
    /// Credentials in the pool.
    pub total: usize,
    /// Credentials acquire could return right now.
    pub available: usize,
    /// Credentials marked permanently unusable.
    pub unusable: usize,
    /// Calls left in the current window across usable credentials.
    pub window_remaining: u64,
    /// Calls left today across usable credentials.
    pub daily_remaining: u64,
    /// Seconds until daily counters reset.
    pub secs_until_daily_reset: i64,
    /// Per-credential detail.
    pub credentials: Vec<CredentialUsage>,
}

/// First instant after `now` at which the wall clock in `tz` reads midnight.
///
/// On a day whose midnight is skipped by a daylight-saving jump the boundary
/// is the first instant of that local day.
pub fn next_daily_reset(now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let fallback = now + chrono::Duration::days(1);
    let Some(day) = now.with_timezone(&tz).date_naive().checked_add_days(Days::new(1)) else {
        return fallback;
    };
    let mut local = day.and_time(chrono::NaiveTime::MIN);
    for _ in 0..24 {
        match local.and_local_timezone(tz) {
            LocalResult::Single(at) | LocalResult::Ambiguous(at, _) => return at.with_timezone(&Utc),
            LocalResult::None => local += chrono::Duration::minutes(15),
        }
    }
    fallback
}

/// Round-robin credential selector backed by the shared store.
#[derive(Clone)]
pub struct CredentialPool {
    store: Arc<dyn SharedStore>,
    credentials: Arc<Vec<Credential>>,
    config: CredentialConfig,
    clock: Arc<dyn Clock>,
    cursor: Arc<AtomicUsize>,
}

impl CredentialPool {
    /// Pool over the credentials listed in `config`.
    pub fn new(store: Arc<dyn SharedStore>, config: CredentialConfig) -> Result<Self, CredentialError> {
        if config.keys.is_empty() {
            return Err(CredentialError::NoCredentials);
        }
        let mut credentials: Vec<Credential> = Vec::with_capacity(config.keys.len());
        for secret in &config.keys {
            let credential = Credential::new(secret.clone());
            if credentials.iter().any(|c| c.id == credential.id) {
                warn!(credential = %credential.id, "Duplicate credential ignored");
                continue;
            }
            credentials.push(credential);
        }
        info!(credentials = credentials.len(), "Credential pool ready");
        Ok(Self {
            store,
            credentials: Arc::new(credentials),
            config,
            clock: Arc::new(SystemClock),
            cursor: Arc::new(AtomicUsize::new(NO_SELECTION)),
        })
    }

    /// Replace the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Credentials in rotation order.
    pub fn credentials(&self) -> &[Credential] {
        &self.credentials
    }

    /// Number of credentials.
    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    /// Whether the pool has no credentials.
    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// Current usage and availability of one credential.
    pub async fn usage(&self, credential_id: &str, capability: &str) -> Result<CredentialUsage, CredentialError> {
        let limits = self.limits(capability)?;
        self.ensure_known(credential_id)?;
        let window = read_counter(self.store.as_ref(), &self.key(credential_id, capability, "window")).await?;
        let daily = read_counter(self.store.as_ref(), &self.key(credential_id, capability, "daily")).await?;
        let unusable = self
            .store
            .get(&self.key(credential_id, capability, "unusable"))
            .await?
            .is_some();
        let window_count = u64::try_from(window).unwrap_or(0);
        let daily_count = u64::try_from(daily).unwrap_or(0);
        Ok(CredentialUsage {
            credential_id: credential_id.to_owned(),
            capability: capability.to_owned(),
            window_count,
            daily_count,
            window_limit: limits.per_window,
            daily_limit: limits.per_day,
            unusable,
            available: !unusable
                && window_count < u64::from(limits.per_window)
                && daily_count < u64::from(limits.per_day),
        })
    }

    /// Next available credential after the last one selected.
    pub async fn acquire(&self, capability: &str) -> Result<Credential, CredentialError> {
        self.limits(capability)?;
        let total = self.credentials.len();
        if total == 0 {
            return Err(CredentialError::NoCredentials);
        }
        let last = self.cursor.load(Ordering::Acquire);
        let start = if last == NO_SELECTION { 0 } else { (last + 1) % total };

        let mut statuses = Vec::with_capacity(total);
        for step in 0..total {
            let index = (start + step) % total;
            let credential = &self.credentials[index];
            let usage = self.usage(credential.id(), capability).await?;
            if usage.available {
                self.cursor.store(index, Ordering::Release);
                debug!(
                    credential = %credential.id(),
                    capability = %capability,
                    window = usage.window_count,
                    daily = usage.daily_count,
                    "Credential acquired"
                );
                return Ok(credential.clone());
            }
            statuses.push(usage);
        }

        for usage in &statuses {
            debug!(
                credential = %usage.credential_id,
                window = usage.window_count,
                window_limit = usage.window_limit,
                daily = usage.daily_count,
                daily_limit = usage.daily_limit,
                unusable = usage.unusable,
                "Credential unavailable"
            );
        }
        error!(capability = %capability, total, "All credentials exhausted");
        Err(CredentialError::AllKeysExhausted {
            capability: capability.to_owned(),
            total,
        })
    }

    /// Count a successful call against both quotas.
    pub async fn record_success(&self, credential_id: &str, capability: &str) -> Result<(), CredentialError> {
        self.limits(capability)?;
        self.ensure_known(credential_id)?;

        let window_key = self.key(credential_id, capability, "window");
        let count = self.store.incr(&window_key).await?;
        if count == 1 || self.store.ttl(&window_key).await?.is_none() {
            self.store.expire(&window_key, self.config.window()).await?;
        }

        let daily_key = self.key(credential_id, capability, "daily");
        self.store.incr(&daily_key).await?;
        if self.store.ttl(&daily_key).await?.is_none() {
            self.store.expire_at(&daily_key, self.next_reset()).await?;
        }
        Ok(())
    }

    /// Count a call whose outcome is unknown. The provider may have served and
    /// billed it, so it consumes quota like a success.
    pub async fn record_timeout(&self, credential_id: &str, capability: &str) -> Result<(), CredentialError> {
        self.record_success(credential_id, capability).await?;
        warn!(credential = %credential_id, capability = %capability, "Credential call timed out");
        Ok(())
    }

    /// Record a failed call. Rate-limited failures quarantine the credential
    /// for the configured cooldown; others leave quotas untouched.
    pub async fn record_failure(
        &self,
        credential_id: &str,
        capability: &str,
        rate_limited: bool,
    ) -> Result<(), CredentialError> {
        if rate_limited {
            self.record_rate_limit(credential_id, capability, None).await
        } else {
            self.limits(capability)?;
            self.ensure_known(credential_id)?;
            debug!(credential = %credential_id, capability = %capability, "Credential call failed");
            Ok(())
        }
    }

    /// Force the short-window counter to its limit for the cooldown, or for
    /// `retry_after` when the provider asked for longer.
    pub async fn record_rate_limit(
        &self,
        credential_id: &str,
        capability: &str,
        retry_after: Option<Duration>,
    ) -> Result<(), CredentialError> {
        let limits = self.limits(capability)?;
        self.ensure_known(credential_id)?;
        let cooldown = retry_after.map_or(self.config.cooldown(), |hint| hint.max(self.config.cooldown()));
        self.store
            .put(
                &self.key(credential_id, capability, "window"),
                &limits.per_window.to_string(),
                Some(cooldown),
            )
            .await?;
        warn!(
            credential = %credential_id,
            capability = %capability,
            cooldown_secs = cooldown.as_secs(),
            "Credential rate limited"
        );
        Ok(())
    }

    /// Mark the credential exhausted until the next daily boundary.
    pub async fn record_daily_exhaustion(&self, credential_id: &str, capability: &str) -> Result<(), CredentialError> {
        let limits = self.limits(capability)?;
        self.ensure_known(credential_id)?;
        let key = self.key(credential_id, capability, "daily");
        let now = self.clock.now();
        let reset_at = next_daily_reset(now, self.config.daily_reset_tz);
        let ttl = (reset_at - now).to_std().unwrap_or(Duration::from_secs(1));
        self.store.put(&key, &limits.per_day.to_string(), Some(ttl)).await?;
        warn!(
            credential = %credential_id,
            capability = %capability,
            reset_at = %reset_at,
            "Credential daily quota exhausted"
        );
        Ok(())
    }

    /// Exclude the credential from this capability until cleared by an operator.
    pub async fn mark_permanently_unusable(&self, credential_id: &str, capability: &str) -> Result<(), CredentialError> {
        self.limits(capability)?;
        self.ensure_known(credential_id)?;
        self.store
            .put(&self.key(credential_id, capability, "unusable"), "1", None)
            .await?;
        error!(credential = %credential_id, capability = %capability, "Credential marked permanently unusable");
        Ok(())
    }

    /// Lift a permanent unusable mark.
    pub async fn clear_unusable(&self, credential_id: &str, capability: &str) -> Result<bool, CredentialError> {
        self.limits(capability)?;
        self.ensure_known(credential_id)?;
        let removed = self
            .store
            .delete(&[self.key(credential_id, capability, "unusable")])
            .await?;
        Ok(removed > 0)
    }

    /// Clear window and daily counters. Unusable marks survive a reset.
    ///
    /// Returns the number of counters removed.
    pub async fn reset(&self, target: &ResetTarget, capability: Option<&str>) -> Result<usize, CredentialError> {
        let capabilities: Vec<&str> = match capability {
            Some(name) => {
                self.limits(name)?;
                vec![name]
            }
            None => self.config.limits.keys().map(String::as_str).collect(),
        };
        let ids: Vec<&str> = match target {
            ResetTarget::All => self.credentials.iter().map(Credential::id).collect(),
            ResetTarget::Credential(id) => {
                self.ensure_known(id)?;
                vec![id.as_str()]
            }
        };
        let mut keys = Vec::with_capacity(ids.len() * capabilities.len() * 2);
        for id in &ids {
            for cap in &capabilities {
                keys.push(self.key(id, cap, "window"));
                keys.push(self.key(id, cap, "daily"));
            }
        }
        let removed = self.store.delete(&keys).await?;
        info!(target = ?target, capability = ?capability, removed, "Credential counters reset");
        Ok(removed)
    }

    /// Headroom of the whole pool for one capability.
    pub async fn summary(&self, capability: &str) -> Result<PoolSummary, CredentialError> {
        self.limits(capability)?;
        let mut summary = PoolSummary {
            capability: capability.to_owned(),
            total: self.credentials.len(),
            available: 0,
            unusable: 0,
            window_remaining: 0,
            daily_remaining: 0,
            secs_until_daily_reset: (self.next_reset() - self.clock.now()).num_seconds(),
            credentials: Vec::with_capacity(self.credentials.len()),
        };
        for credential in self.credentials.iter() {
            let usage = self.usage(credential.id(), capability).await?;
            if usage.unusable {
                summary.unusable += 1;
            } else {
                summary.window_remaining += u64::from(usage.window_limit).saturating_sub(usage.window_count);
                summary.daily_remaining += u64::from(usage.daily_limit).saturating_sub(usage.daily_count);
            }
            if usage.available {
                summary.available += 1;
            }
            summary.credentials.push(usage);
        }
        Ok(summary)
    }

    fn next_reset(&self) -> DateTime<Utc> {
        next_daily_reset(self.clock.now(), self.config.daily_reset_tz)
    }

    fn limits(&self, capability: &str) -> Result<CapabilityLimits, CredentialError> {
        self.config
            .limits
            .get(capability)
            .copied()
            .ok_or_else(|| CredentialError::UnknownCapability(capability.to_owned()))
    }

    fn ensure_known(&self, credential_id: &str) -> Result<(), CredentialError> {
        if self.credentials.iter().any(|c| c.id == credential_id) {
            Ok(())
        } else {
            Err(CredentialError::UnknownCredential(credential_id.to_owned()))
        }
    }

    fn key(&self, credential_id: &str, capability: &str, counter: &str) -> String {
        format!("{}:{credential_id}:{capability}:{counter}", self.config.key_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn debug_output_hides_secret() {
        let credential = Credential::new("super-secret-value");
        let rendered = format!("{credential:?}");
        assert!(!rendered.contains("super-secret-value"));
        assert!(rendered.contains(credential.id()));
    }

    #[test]
    fn fingerprint_is_truncated_sha256() {
        // sha256("abc") = ba7816bf8f01cfea414140de5dae2223...
        assert_eq!(fingerprint("abc"), "ba7816bf8f01cfea");
        assert_ne!(fingerprint("AIzaSyAAAA1"), fingerprint("AIzaSyAAAA2"));
        assert_eq!(fingerprint("a").len(), 16);
    }

    #[test]
    fn daily_reset_is_next_pacific_midnight_in_winter() {
        // 2024-01-15 07:59 UTC is 23:59 PST on the 14th.
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 7, 59, 0).unwrap();
        assert_eq!(
            next_daily_reset(now, Tz::America__Los_Angeles),
            Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0).unwrap()
        );

        let now = Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0).unwrap();
        assert_eq!(
            next_daily_reset(now, Tz::America__Los_Angeles),
            Utc.with_ymd_and_hms(2024, 1, 16, 8, 0, 0).unwrap()
        );
    }

    #[test]
    fn daily_reset_follows_daylight_saving() {
        let now = Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap();
        assert_eq!(
            next_daily_reset(now, Tz::America__Los_Angeles),
            Utc.with_ymd_and_hms(2024, 7, 2, 7, 0, 0).unwrap()
        );

        // Day after the spring-forward switch: midnight PDT.
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        assert_eq!(
            next_daily_reset(now, Tz::America__Los_Angeles),
            Utc.with_ymd_and_hms(2024, 3, 11, 7, 0, 0).unwrap()
        );
    }

    #[test]
    fn daily_reset_skips_missing_midnight() {
        // Santiago springs forward at local midnight: 2024-09-08 starts at 01:00 -03.
        let now = Utc.with_ymd_and_hms(2024, 9, 7, 12, 0, 0).unwrap();
        assert_eq!(
            next_daily_reset(now, Tz::America__Santiago),
            Utc.with_ymd_and_hms(2024, 9, 8, 4, 0, 0).unwrap()
        );
    }

    #[test]
    fn daily_reset_at_utc() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(
            next_daily_reset(now, Tz::UTC),
            Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap()
        );
    }
}
