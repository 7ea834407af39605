//! Task records, the task store, the credential pool and the batch scheduler.

pub mod credential_pool;
pub mod error;
pub mod executor;
pub mod scheduler;
pub mod task;
pub mod task_store;

pub use credential_pool::{
    next_daily_reset, Credential, CredentialPool, CredentialUsage, PoolSummary, ResetTarget,
};
pub use error::{
    AppResult, CredentialError, FailureKind, GenerationError, QueueError, SchedulerError,
    StoreError,
};
pub use executor::{ImageGenerator, InputProbe};
pub use scheduler::{
    Attempt, BatchReport, BatchScheduler, CycleReport, Gate, Phase, SchedulerStats, Transition,
};
pub use task::{
    DependencyRecord, DependencyRole, DependencyState, JobId, JobKind, QueueState, SlideKind,
    SlideParams, SplitConfig, SplitOrientation, SplitScreenParams, Task, TaskId, TaskParams,
};
pub use task_store::{
    CancelReport, FailOptions, FailOutcome, JobStatus, QueueKeys, QueueStats, ReapReport,
    TaskFailure, TaskResult, TaskStore,
};
