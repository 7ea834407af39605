//! One task attempt: input check, credential rotation, generation.

use std::time::Duration;

use tracing::{debug, warn};

use crate::core::credential_pool::CredentialPool;
use crate::core::error::{CredentialError, FailureKind, GenerationError};
use crate::core::executor::{ImageGenerator, InputProbe};
use crate::core::task::Task;
use crate::core::task_store::inputs_present;

/// Terminal result of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    /// The generator produced an image.
    Completed {
        /// Where the image was written.
        output: String,
        /// Credential that produced it.
        credential: String,
    },
    /// Every credential was limited before any produced an image.
    Exhausted {
        /// What the last credential reported.
        message: String,
        /// Longest provider retry hint seen.
        retry_after: Option<Duration>,
    },
    /// Any other failure.
    Failed {
        /// Classification.
        kind: FailureKind,
        /// Error text.
        message: String,
    },
}

/// Settings for a single attempt.
#[derive(Debug, Clone)]
pub struct AttemptSettings {
    /// Capability consumed by the call.
    pub capability: String,
    /// Ceiling for one generation call.
    pub timeout: Duration,
}

/// Run one attempt of `task`, rotating through at most every credential once.
pub async fn attempt<G: ImageGenerator>(
    generator: &G,
    pool: &CredentialPool,
    probe: &dyn InputProbe,
    task: &Task,
    settings: &AttemptSettings,
) -> Attempt {
    if let Err(message) = inputs_present(probe, task) {
        return Attempt::Failed {
            kind: FailureKind::MissingInput,
            message,
        };
    }

    let capability = settings.capability.as_str();
    let mut retry_after: Option<Duration> = None;
    let mut last_message = String::from("no credential available");

    for _ in 0..pool.len() {
        let credential = match pool.acquire(capability).await {
            Ok(credential) => credential,
            Err(CredentialError::AllKeysExhausted { .. }) => break,
            Err(e) => {
                return Attempt::Failed {
                    kind: FailureKind::Unclassified,
                    message: e.to_string(),
                }
            }
        };
        let id = credential.id().to_owned();

        let result = tokio::time::timeout(settings.timeout, generator.generate(&credential, task)).await;
        let error = match result {
            Err(_) => {
                if let Err(e) = pool.record_timeout(&id, capability).await {
                    warn!(credential = %id, error = %e, "Failed to record credential usage");
                }
                return Attempt::Failed {
                    kind: FailureKind::Timeout,
                    message: format!("generation timed out after {}s", settings.timeout.as_secs()),
                }
            }
            Ok(Ok(output)) => {
                if let Err(e) = pool.record_success(&id, capability).await {
                    warn!(credential = %id, error = %e, "Failed to record credential usage");
                }
                return Attempt::Completed {
                    output,
                    credential: id,
                };
            }
            Ok(Err(error)) => error,
        };

        let bookkeeping = match &error {
            GenerationError::RateLimited { retry_after: hint, .. } => {
                retry_after = max_hint(retry_after, *hint);
                pool.record_rate_limit(&id, capability, *hint).await
            }
            GenerationError::DailyQuotaExhausted(_) => pool.record_daily_exhaustion(&id, capability).await,
            GenerationError::Unentitled(_) => pool.mark_permanently_unusable(&id, capability).await,
            GenerationError::Permanent(message) => {
                return Attempt::Failed {
                    kind: FailureKind::Rejected,
                    message: message.clone(),
                }
            }
            GenerationError::Transient(message) => {
                if let Err(e) = pool.record_failure(&id, capability, false).await {
                    warn!(credential = %id, error = %e, "Failed to record credential failure");
                }
                return Attempt::Failed {
                    kind: FailureKind::Unclassified,
                    message: message.clone(),
                }
            }
        };
        if let Err(e) = bookkeeping {
            warn!(credential = %id, error = %e, "Failed to record credential state");
        }
        debug!(task_id = %task.id, credential = %id, error = %error, "Rotating to next credential");
        last_message = error.to_string();
    }

    Attempt::Exhausted {
        message: last_message,
        retry_after,
    }
}

fn max_hint(current: Option<Duration>, hint: Option<Duration>) -> Option<Duration> {
    match (current, hint) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_hint_keeps_longest() {
        let s = Duration::from_secs;
        assert_eq!(max_hint(None, None), None);
        assert_eq!(max_hint(Some(s(3)), None), Some(s(3)));
        assert_eq!(max_hint(None, Some(s(4))), Some(s(4)));
        assert_eq!(max_hint(Some(s(3)), Some(s(9))), Some(s(9)));
    }
}
