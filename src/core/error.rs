//! Error types for store, queue, credential and scheduler operations.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::task::TaskId;

/// Errors raised by a shared store adapter.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A stored value could not be interpreted.
    #[error("corrupt value at `{key}`: {reason}")]
    Corrupt {
        /// Key holding the bad value.
        key: String,
        /// What was wrong with it.
        reason: String,
    },
    /// Redis driver failure.
    #[cfg(feature = "redis-store")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Errors produced by the task store.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Underlying store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Task record could not be encoded or decoded.
    #[error("task codec error: {0}")]
    Codec(#[from] serde_json::Error),
    /// Task rejected at enqueue time.
    #[error("invalid task: {0}")]
    InvalidTask(String),
    /// A task with this id already exists.
    #[error("duplicate task: {0}")]
    DuplicateTask(TaskId),
    /// Task is not currently in the processing state.
    #[error("task not processing: {0}")]
    NotProcessing(TaskId),
}

/// Errors produced by the credential pool.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// Every credential is unusable or over quota for the capability.
    #[error("all {total} credentials exhausted for capability `{capability}`")]
    AllKeysExhausted {
        /// Capability that was requested.
        capability: String,
        /// Number of credentials in the pool.
        total: usize,
    },
    /// The credential id is not part of this pool.
    #[error("unknown credential: {0}")]
    UnknownCredential(String),
    /// No limits are configured for the capability.
    #[error("unknown capability: {0}")]
    UnknownCapability(String),
    /// The pool was built without credentials.
    #[error("credential pool is empty")]
    NoCredentials,
    /// Underlying store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors surfaced by the batch scheduler loop itself (never per-task errors).
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Task store failure outside of a single task's outcome.
    #[error(transparent)]
    Queue(#[from] QueueError),
    /// Credential pool failure outside of a single task's outcome.
    #[error(transparent)]
    Credential(#[from] CredentialError),
    /// Store failure, e.g. while writing the heartbeat.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Configuration rejected while wiring components.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Classified failure returned by an image generator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerationError {
    /// The credential hit its short-window limit.
    #[error("rate limited: {message}")]
    RateLimited {
        /// Provider message.
        message: String,
        /// Provider hint for when to try again.
        retry_after: Option<Duration>,
    },
    /// The credential used up its daily quota.
    #[error("daily quota exhausted: {0}")]
    DailyQuotaExhausted(String),
    /// The credential is not entitled to this capability at all.
    #[error("credential not entitled: {0}")]
    Unentitled(String),
    /// The request can never succeed.
    #[error("rejected: {0}")]
    Permanent(String),
    /// Anything else; worth retrying later.
    #[error("{0}")]
    Transient(String),
}

/// Why a task attempt failed, recorded on the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A referenced input file is gone.
    MissingInput,
    /// A credential reported a rate limit.
    RateLimited,
    /// The generation call exceeded its time budget.
    Timeout,
    /// Every credential was limited for the capability.
    CredentialPoolExhausted,
    /// The generator refused the request permanently.
    Rejected,
    /// Unexpected failure.
    Unclassified,
    /// The producer this task depends on failed.
    DependencyFailed,
    /// The owning job was cancelled.
    Cancelled,
    /// The task sat in one state for too long.
    Stale,
    /// Membership entry had no backing record.
    Orphaned,
}

impl FailureKind {
    /// Whether the failure should not count toward the retry budget.
    pub const fn is_rate_limited(self) -> bool {
        matches!(self, Self::RateLimited | Self::CredentialPoolExhausted)
    }

    /// Whether the failure can never be retried.
    pub const fn is_permanent(self) -> bool {
        matches!(
            self,
            Self::MissingInput
                | Self::Rejected
                | Self::DependencyFailed
                | Self::Cancelled
                | Self::Stale
                | Self::Orphaned
        )
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
