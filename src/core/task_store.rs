//! Persistent task queue with dependency gating.
//!
//! Every task lives in exactly one of five ordered collections (pending,
//! processing, retry, completed, failed). State changes go through
//! [`SharedStore::move_member`], so two schedulers racing for the same task
//! cannot both claim it.
//!
//! # Key layout
//!
//! | key                              | kind    | contents                          |
//! |----------------------------------|---------|-----------------------------------|
//! | `{prefix}:{state}`               | ordered | task ids, scored by FIFO sequence |
//! | `{prefix}:task:{id}`             | value   | JSON [`Task`]                     |
//! | `{prefix}:result:{id}`           | value   | result location                   |
//! | `{prefix}:job:{job}`             | set     | task ids of the job               |
//! | `{prefix}:dep:{group}`           | value   | JSON [`DependencyRecord`]         |
//! | `{prefix}:dep:{group}:consumers` | set     | consumer task ids of the group    |
//! | `{prefix}:scheduler:heartbeat`   | value   | JSON scheduler liveness record    |

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::core::error::{FailureKind, QueueError};
use crate::core::executor::InputProbe;
use crate::core::task::{
    DependencyRecord, DependencyRole, DependencyState, JobId, QueueState, Task, TaskId,
};
use crate::infra::probe::FsInputProbe;
use crate::infra::store::SharedStore;
use crate::util::clock::{Clock, SystemClock};

/// Sub-millisecond slots in a FIFO score.
const FIFO_SLOTS: u64 = 1000;

/// Store keys derived from the configured prefix.
#[derive(Debug, Clone)]
pub struct QueueKeys {
    prefix: String,
}

impl QueueKeys {
    /// Keys under `prefix`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Ordered collection holding tasks in `state`.
    pub fn state(&self, state: QueueState) -> String {
        format!("{}:{}", self.prefix, state.as_str())
    }

    /// Task record.
    pub fn task(&self, id: &str) -> String {
        format!("{}:task:{id}", self.prefix)
    }

    /// Stored result of a completed task.
    pub fn result(&self, id: &str) -> String {
        format!("{}:result:{id}", self.prefix)
    }

    /// Task ids belonging to a job.
    pub fn job(&self, job: &str) -> String {
        format!("{}:job:{job}", self.prefix)
    }

    /// Dependency record of a group.
    pub fn dependency(&self, group: &str) -> String {
        format!("{}:dep:{group}", self.prefix)
    }

    /// Consumer index of a group.
    pub fn consumers(&self, group: &str) -> String {
        format!("{}:dep:{group}:consumers", self.prefix)
    }

    /// Liveness record written by the scheduler after every cycle.
    pub fn heartbeat(&self) -> String {
        format!("{}:scheduler:heartbeat", self.prefix)
    }
}

/// How a failure should be accounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailOptions {
    /// Rate-limited failures do not count toward the retry budget.
    pub rate_limited: bool,
    /// Permanent failures skip the retry state entirely.
    pub permanent: bool,
    /// Classification recorded on the task.
    pub kind: FailureKind,
}

impl FailOptions {
    /// Ordinary failure that counts toward the retry budget.
    pub const fn retryable() -> Self {
        Self {
            rate_limited: false,
            permanent: false,
            kind: FailureKind::Unclassified,
        }
    }

    /// Failure caused by credential rate limits.
    pub const fn rate_limited() -> Self {
        Self {
            rate_limited: true,
            permanent: false,
            kind: FailureKind::RateLimited,
        }
    }

    /// Failure that can never succeed on retry.
    pub const fn permanent() -> Self {
        Self {
            rate_limited: false,
            permanent: true,
            kind: FailureKind::Rejected,
        }
    }

    /// Options implied by a failure classification.
    pub const fn from_kind(kind: FailureKind) -> Self {
        Self {
            rate_limited: kind.is_rate_limited(),
            permanent: kind.is_permanent(),
            kind,
        }
    }

    /// Override the recorded classification.
    #[must_use]
    pub const fn with_kind(mut self, kind: FailureKind) -> Self {
        self.kind = kind;
        self
    }
}

impl Default for FailOptions {
    fn default() -> Self {
        Self::retryable()
    }
}

/// Where a failed task ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Re-enqueued for another attempt.
    Retry {
        /// Retry count after this failure.
        retry_count: u32,
    },
    /// Moved to failed for good.
    Failed {
        /// Retry count after this failure.
        retry_count: u32,
        /// Consumers failed along with this producer.
        cascaded: usize,
    },
}

/// Completed task of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Task id.
    pub task_id: TaskId,
    /// Result location.
    pub output: String,
}

/// Failed task of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Task id.
    pub task_id: TaskId,
    /// Terminal error text.
    pub error: String,
    /// Classification, when known.
    pub kind: Option<FailureKind>,
}

/// Aggregate view of a job, recomputed from membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    /// Job id.
    pub job_id: JobId,
    /// Tasks located in any state.
    pub total: usize,
    /// Tasks waiting for a first attempt.
    pub pending: usize,
    /// Tasks claimed by a scheduler.
    pub processing: usize,
    /// Tasks waiting for another attempt.
    pub retry: usize,
    /// Tasks finished successfully.
    pub completed: usize,
    /// Tasks finished unsuccessfully.
    pub failed: usize,
    /// No task is pending, processing or waiting to retry.
    pub is_complete: bool,
    /// Results of completed tasks.
    pub results: Vec<TaskResult>,
    /// Errors of failed tasks.
    pub errors: Vec<TaskFailure>,
}

/// Outcome of cancelling a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelReport {
    /// Undispatched tasks moved to failed.
    pub cancelled: usize,
    /// Consumers failed because their producer was cancelled.
    pub cascaded: usize,
    /// Tasks already claimed; they will report normally.
    pub in_flight: usize,
}

/// Outcome of a reap pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReapReport {
    /// Membership entries without a record.
    pub orphaned: usize,
    /// Tasks whose inputs vanished.
    pub missing_input: usize,
    /// Tasks over their staleness threshold.
    pub stale: usize,
    /// Consumers failed because a reaped producer failed.
    pub cascaded: usize,
}

impl ReapReport {
    /// Tasks moved to failed by this pass.
    pub const fn total(&self) -> usize {
        self.orphaned + self.missing_input + self.stale + self.cascaded
    }
}

/// Queue-wide membership counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Pending tasks.
    pub pending: usize,
    /// Processing tasks.
    pub processing: usize,
    /// Retry tasks.
    pub retry: usize,
    /// Completed tasks.
    pub completed: usize,
    /// Failed tasks.
    pub failed: usize,
}

impl QueueStats {
    /// Tasks not yet terminal.
    pub const fn outstanding(&self) -> usize {
        self.pending + self.processing + self.retry
    }
}

/// Task queue over a shared store.
#[derive(Clone)]
pub struct TaskStore {
    store: Arc<dyn SharedStore>,
    config: QueueConfig,
    keys: QueueKeys,
    clock: Arc<dyn Clock>,
    probe: Arc<dyn InputProbe>,
    sequence: Arc<AtomicU64>,
}

impl TaskStore {
    /// Task store using the system clock and filesystem probe.
    pub fn new(store: Arc<dyn SharedStore>, config: QueueConfig) -> Self {
        let keys = QueueKeys::new(config.key_prefix.clone());
        Self {
            store,
            config,
            keys,
            clock: Arc::new(SystemClock),
            probe: Arc::new(FsInputProbe),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Replace the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the input probe.
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn InputProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Active configuration.
    pub const fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Store keys in use.
    pub const fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    /// Input probe in use.
    pub fn probe(&self) -> &dyn InputProbe {
        self.probe.as_ref()
    }

    /// Underlying shared store.
    pub fn store(&self) -> &Arc<dyn SharedStore> {
        &self.store
    }

    /// Add a task to pending.
    ///
    /// Producers create their group's dependency record; consumers are indexed
    /// under their group so a failing producer can find them.
    pub async fn enqueue(&self, mut task: Task) -> Result<TaskId, QueueError> {
        task.validate().map_err(QueueError::InvalidTask)?;
        let now = self.clock.now();
        task.created_at = now;
        task.started_at = None;
        task.completed_at = None;
        task.last_failed_at = None;
        task.producer_result = None;

        if let DependencyRole::Producer { group } = &task.dependency {
            if self.store.get(&self.keys.dependency(group)).await?.is_some() {
                return Err(QueueError::InvalidTask(format!(
                    "dependency group `{group}` already has a producer"
                )));
            }
        }

        let json = serde_json::to_string(&task)?;
        let id = task.id.as_str();
        if !self
            .store
            .put_if_absent(&self.keys.task(id), &json, Some(self.config.task_ttl()))
            .await?
        {
            return Err(QueueError::DuplicateTask(task.id));
        }

        match &task.dependency {
            DependencyRole::Producer { group } => {
                let record = DependencyRecord {
                    producer: task.id.clone(),
                    state: DependencyState::Pending,
                    result: None,
                };
                self.store
                    .put(
                        &self.keys.dependency(group),
                        &serde_json::to_string(&record)?,
                        Some(self.config.job_ttl()),
                    )
                    .await?;
            }
            DependencyRole::Consumer { group } => {
                let key = self.keys.consumers(group);
                self.store.sadd(&key, id).await?;
                self.store.expire(&key, self.config.job_ttl()).await?;
            }
            DependencyRole::Independent => {}
        }

        let job_key = self.keys.job(task.job_id.as_str());
        self.store.sadd(&job_key, id).await?;
        self.store.expire(&job_key, self.config.job_ttl()).await?;

        self.store
            .zadd(&self.keys.state(QueueState::Pending), id, self.fifo_score(now))
            .await?;

        debug!(task_id = %task.id, job_id = %task.job_id, dependency = ?task.dependency, "Task enqueued");
        Ok(task.id)
    }

    /// Claim up to `limit` eligible tasks, retry before pending.
    ///
    /// Consumers whose producer has not completed are skipped (and their group
    /// is not probed again during this call). Consumers whose producer failed
    /// are failed on the spot. Pulled consumers carry the producer's result.
    pub async fn pull(&self, limit: usize) -> Result<Vec<Task>, QueueError> {
        let mut claimed = Vec::with_capacity(limit);
        let mut skipped_groups: HashSet<String> = HashSet::new();
        let mut dependencies: HashMap<String, Option<DependencyRecord>> = HashMap::new();

        for state in [QueueState::Retry, QueueState::Pending] {
            let key = self.keys.state(state);
            let mut offset = 0;
            let mut scanned = 0;

            while claimed.len() < limit && scanned < self.config.pull_scan_limit {
                let page = ((limit - claimed.len()) * 2)
                    .max(16)
                    .min(self.config.pull_scan_limit - scanned);
                let ids = self.store.zrange(&key, offset, page).await?;
                if ids.is_empty() {
                    break;
                }
                scanned += ids.len();
                let fetched = ids.len();
                let mut left = 0;

                for id in ids {
                    if claimed.len() >= limit {
                        break;
                    }
                    let Some(mut task) = self.load_lenient(&id).await? else {
                        self.heal_orphan(state, &id).await?;
                        left += 1;
                        continue;
                    };

                    if let DependencyRole::Consumer { group } = &task.dependency {
                        if skipped_groups.contains(group) {
                            continue;
                        }
                        if !dependencies.contains_key(group) {
                            let record = self.load_dependency(group).await?;
                            dependencies.insert(group.clone(), record);
                        }
                        match dependencies.get(group).and_then(Option::as_ref) {
                            Some(record) if record.state == DependencyState::Satisfied => {
                                task.producer_result.clone_from(&record.result);
                            }
                            Some(record) if record.state == DependencyState::Failed => {
                                let message = format!("dependency failed: producer {}", record.producer);
                                if self
                                    .fail_in_place(state, &id, Some(task.clone()), FailureKind::DependencyFailed, &message)
                                    .await?
                                    .is_some()
                                {
                                    warn!(task_id = %id, group = %group, "Consumer failed at pull, producer already failed");
                                }
                                left += 1;
                                continue;
                            }
                            _ => {
                                skipped_groups.insert(group.clone());
                                continue;
                            }
                        }
                    }

                    let now = self.clock.now();
                    let processing = self.keys.state(QueueState::Processing);
                    left += 1;
                    if self
                        .store
                        .move_member(&key, &processing, &id, self.fifo_score(now))
                        .await?
                    {
                        task.started_at = Some(now);
                        self.save(&task).await?;
                        claimed.push(task);
                    } else {
                        debug!(task_id = %id, "Task claimed by another puller");
                    }
                }

                offset += fetched - left;
                if fetched < page {
                    break;
                }
            }
            if claimed.len() >= limit {
                break;
            }
        }

        if !claimed.is_empty() || !skipped_groups.is_empty() {
            debug!(
                claimed = claimed.len(),
                skipped_groups = skipped_groups.len(),
                "Pulled batch"
            );
        }
        Ok(claimed)
    }

    /// Mark a claimed task completed with `result`.
    ///
    /// A producer's dependency record becomes satisfied, unblocking its
    /// consumers on the next pull.
    pub async fn complete(&self, id: &TaskId, result: &str) -> Result<(), QueueError> {
        let processing = self.keys.state(QueueState::Processing);
        if self.store.zscore(&processing, id.as_str()).await?.is_none() {
            return Err(QueueError::NotProcessing(id.clone()));
        }
        let now = self.clock.now();
        let task = self.load_lenient(id.as_str()).await?;
        if let Some(mut task) = task.clone() {
            task.completed_at = Some(now);
            self.save(&task).await?;
        }
        if !self
            .store
            .move_member(
                &processing,
                &self.keys.state(QueueState::Completed),
                id.as_str(),
                self.fifo_score(now),
            )
            .await?
        {
            return Err(QueueError::NotProcessing(id.clone()));
        }
        self.store
            .put(&self.keys.result(id.as_str()), result, Some(self.config.result_ttl()))
            .await?;

        match task {
            None => warn!(task_id = %id, "Completed task had no record"),
            Some(task) => {
                if let DependencyRole::Producer { group } = &task.dependency {
                    self.resolve_dependency(group, DependencyState::Satisfied, Some(result.to_owned()))
                        .await?;
                    info!(task_id = %id, group = %group, "Producer completed, consumers unblocked");
                } else {
                    debug!(task_id = %id, "Task completed");
                }
            }
        }
        Ok(())
    }

    /// Record a failed attempt of a claimed task.
    ///
    /// Rate-limited and permanent failures leave `retry_count` alone; every
    /// other failure increments it. The task fails for good when `options.permanent` is set
    /// or the retry budget is spent; a failing producer takes its pending and
    /// retrying consumers with it.
    pub async fn fail(
        &self,
        id: &TaskId,
        error: &str,
        options: FailOptions,
    ) -> Result<FailOutcome, QueueError> {
        let processing = self.keys.state(QueueState::Processing);
        if self.store.zscore(&processing, id.as_str()).await?.is_none() {
            return Err(QueueError::NotProcessing(id.clone()));
        }
        let now = self.clock.now();
        let Some(mut task) = self.load_lenient(id.as_str()).await? else {
            self.heal_orphan(QueueState::Processing, id.as_str()).await?;
            return Ok(FailOutcome::Failed {
                retry_count: 0,
                cascaded: 0,
            });
        };

        if !options.rate_limited && !options.permanent {
            task.retry_count += 1;
        }
        task.last_error = Some(error.to_owned());
        task.last_failure = Some(options.kind);
        task.last_failed_at = Some(now);

        let terminal = options.permanent || task.retry_count >= self.config.max_retries;
        let target = if terminal {
            task.completed_at = Some(now);
            QueueState::Failed
        } else {
            QueueState::Retry
        };
        self.save(&task).await?;
        if !self
            .store
            .move_member(&processing, &self.keys.state(target), id.as_str(), self.fifo_score(now))
            .await?
        {
            return Err(QueueError::NotProcessing(id.clone()));
        }

        if !terminal {
            warn!(
                task_id = %id,
                retry_count = task.retry_count,
                max_retries = self.config.max_retries,
                rate_limited = options.rate_limited,
                error = %error,
                "Task queued for retry"
            );
            return Ok(FailOutcome::Retry {
                retry_count: task.retry_count,
            });
        }

        error!(
            task_id = %id,
            retry_count = task.retry_count,
            kind = ?options.kind,
            error = %error,
            "Task failed permanently"
        );
        let cascaded = match &task.dependency {
            DependencyRole::Producer { group } => self.fail_group(group, &task.id).await?,
            _ => 0,
        };
        Ok(FailOutcome::Failed {
            retry_count: task.retry_count,
            cascaded,
        })
    }

    /// Aggregate counts, results and errors of a job.
    ///
    /// An unknown job reports zero tasks and counts as complete.
    pub async fn status(&self, job_id: &JobId) -> Result<JobStatus, QueueError> {
        let mut ids = self.store.smembers(&self.keys.job(job_id.as_str())).await?;
        ids.sort();
        let mut status = JobStatus {
            job_id: job_id.clone(),
            total: 0,
            pending: 0,
            processing: 0,
            retry: 0,
            completed: 0,
            failed: 0,
            is_complete: true,
            results: Vec::new(),
            errors: Vec::new(),
        };

        for id in ids {
            let Some(state) = self.locate(&id).await? else {
                continue;
            };
            status.total += 1;
            match state {
                QueueState::Pending => status.pending += 1,
                QueueState::Processing => status.processing += 1,
                QueueState::Retry => status.retry += 1,
                QueueState::Completed => {
                    status.completed += 1;
                    let output = match self.store.get(&self.keys.result(&id)).await? {
                        Some(output) => Some(output),
                        None => self
                            .load_lenient(&id)
                            .await?
                            .map(|t| t.output_path.display().to_string()),
                    };
                    if let Some(output) = output {
                        status.results.push(TaskResult {
                            task_id: TaskId::from(id),
                            output,
                        });
                    }
                }
                QueueState::Failed => {
                    status.failed += 1;
                    let (error, kind) = match self.load_lenient(&id).await? {
                        Some(task) => (
                            task.last_error.unwrap_or_else(|| "unknown error".into()),
                            task.last_failure,
                        ),
                        None => ("task record missing".into(), Some(FailureKind::Orphaned)),
                    };
                    status.errors.push(TaskFailure {
                        error,
                        kind,
                        task_id: TaskId::from(id),
                    });
                }
            }
        }
        status.is_complete = status.pending == 0 && status.processing == 0 && status.retry == 0;
        Ok(status)
    }

    /// Fail every undispatched task of a job. Claimed tasks keep running.
    pub async fn cancel(&self, job_id: &JobId) -> Result<CancelReport, QueueError> {
        let ids = self.store.smembers(&self.keys.job(job_id.as_str())).await?;
        let mut report = CancelReport::default();

        for id in ids {
            match self.locate(&id).await? {
                Some(state @ (QueueState::Pending | QueueState::Retry)) => {
                    if let Some(task) = self
                        .fail_in_place(state, &id, None, FailureKind::Cancelled, "job cancelled")
                        .await?
                    {
                        report.cancelled += 1;
                        if let DependencyRole::Producer { group } = &task.dependency {
                            report.cascaded += self.fail_group(group, &task.id).await?;
                        }
                    }
                }
                Some(QueueState::Processing) => report.in_flight += 1,
                _ => {}
            }
        }

        info!(
            job_id = %job_id,
            cancelled = report.cancelled,
            in_flight = report.in_flight,
            "Job cancelled"
        );
        Ok(report)
    }

    /// Fail orphaned entries, tasks with vanished inputs and stale tasks.
    ///
    /// Staleness is measured per state: pending from creation, retry from the
    /// last failure, processing from the claim.
    pub async fn reap(&self) -> Result<ReapReport, QueueError> {
        let now = self.clock.now();
        let mut report = ReapReport::default();

        for state in [QueueState::Pending, QueueState::Retry, QueueState::Processing] {
            let entries = self.store.zrange_with_scores(&self.keys.state(state)).await?;
            for (id, _) in entries {
                let Some(task) = self.load_lenient(&id).await? else {
                    if self.heal_orphan(state, &id).await? {
                        report.orphaned += 1;
                    }
                    continue;
                };

                let verdict = if state == QueueState::Processing {
                    None
                } else {
                    let task = self.with_producer_result(task.clone()).await?;
                    inputs_present(self.probe.as_ref(), &task)
                        .err()
                        .map(|message| (FailureKind::MissingInput, message))
                };
                let verdict = verdict.or_else(|| {
                    self.stale_since(state, &task, now).map(|age| {
                        (
                            FailureKind::Stale,
                            format!("stale in {state} for {}s", age.num_seconds()),
                        )
                    })
                });
                let Some((kind, message)) = verdict else {
                    continue;
                };

                let Some(task) = self.fail_in_place(state, &id, Some(task), kind, &message).await? else {
                    continue;
                };
                match kind {
                    FailureKind::MissingInput => report.missing_input += 1,
                    _ => report.stale += 1,
                }
                warn!(task_id = %id, state = %state, reason = %message, "Task reaped");
                if let DependencyRole::Producer { group } = &task.dependency {
                    report.cascaded += self.fail_group(group, &task.id).await?;
                }
            }
        }

        if report.total() > 0 {
            info!(
                orphaned = report.orphaned,
                missing_input = report.missing_input,
                stale = report.stale,
                cascaded = report.cascaded,
                "Reap pass failed tasks"
            );
        }
        Ok(report)
    }

    /// Membership counts across the whole queue.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        Ok(QueueStats {
            pending: self.store.zcard(&self.keys.state(QueueState::Pending)).await?,
            processing: self.store.zcard(&self.keys.state(QueueState::Processing)).await?,
            retry: self.store.zcard(&self.keys.state(QueueState::Retry)).await?,
            completed: self.store.zcard(&self.keys.state(QueueState::Completed)).await?,
            failed: self.store.zcard(&self.keys.state(QueueState::Failed)).await?,
        })
    }

    /// Delete every record of a finished job. Returns the number of tasks removed.
    ///
    /// Jobs with outstanding tasks are left untouched and report zero.
    pub async fn purge_job(&self, job_id: &JobId) -> Result<usize, QueueError> {
        let status = self.status(job_id).await?;
        if !status.is_complete {
            warn!(job_id = %job_id, "Refusing to purge job with outstanding tasks");
            return Ok(0);
        }
        let ids = self.store.smembers(&self.keys.job(job_id.as_str())).await?;
        let mut keys = vec![self.keys.job(job_id.as_str())];
        for id in &ids {
            if let Some(task) = self.load_lenient(id).await? {
                if let DependencyRole::Producer { group } = &task.dependency {
                    keys.push(self.keys.dependency(group));
                    keys.push(self.keys.consumers(group));
                }
            }
            for state in [QueueState::Completed, QueueState::Failed] {
                self.store.zrem(&self.keys.state(state), id).await?;
            }
            keys.push(self.keys.task(id));
            keys.push(self.keys.result(id));
        }
        self.store.delete(&keys).await?;
        info!(job_id = %job_id, tasks = ids.len(), "Job purged");
        Ok(ids.len())
    }

    /// Read a task record.
    pub async fn get(&self, id: &TaskId) -> Result<Option<Task>, QueueError> {
        match self.store.get(&self.keys.task(id.as_str())).await? {
            None => Ok(None),
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        }
    }

    /// State a task is currently in.
    pub async fn state_of(&self, id: &TaskId) -> Result<Option<QueueState>, QueueError> {
        self.locate(id.as_str()).await
    }

    /// Dependency record of a group.
    pub async fn dependency(&self, group: &str) -> Result<Option<DependencyRecord>, QueueError> {
        self.load_dependency(group).await
    }

    fn fifo_score(&self, at: DateTime<Utc>) -> i64 {
        let slot = self.sequence.fetch_add(1, Ordering::Relaxed) % FIFO_SLOTS;
        at.timestamp_millis() * FIFO_SLOTS as i64 + slot as i64
    }

    fn stale_since(&self, state: QueueState, task: &Task, now: DateTime<Utc>) -> Option<chrono::Duration> {
        let (since, limit) = match state {
            QueueState::Pending => (task.created_at, self.config.stale_pending()),
            QueueState::Retry => (
                task.last_failed_at.unwrap_or(task.created_at),
                self.config.stale_retry(),
            ),
            QueueState::Processing => (
                task.started_at.unwrap_or(task.created_at),
                self.config.stale_processing(),
            ),
            QueueState::Completed | QueueState::Failed => return None,
        };
        let age = now - since;
        let limit = chrono::Duration::from_std(limit).ok()?;
        (age > limit).then_some(age)
    }

    async fn locate(&self, id: &str) -> Result<Option<QueueState>, QueueError> {
        for state in QueueState::ALL {
            if self.store.zscore(&self.keys.state(state), id).await?.is_some() {
                return Ok(Some(state));
            }
        }
        Ok(None)
    }

    async fn save(&self, task: &Task) -> Result<(), QueueError> {
        let json = serde_json::to_string(task)?;
        self.store
            .put(&self.keys.task(task.id.as_str()), &json, Some(self.config.task_ttl()))
            .await?;
        Ok(())
    }

    /// Read a task record, treating an undecodable one as missing.
    async fn load_lenient(&self, id: &str) -> Result<Option<Task>, QueueError> {
        let Some(raw) = self.store.get(&self.keys.task(id)).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(task) => Ok(Some(task)),
            Err(e) => {
                warn!(task_id = %id, error = %e, "Undecodable task record");
                Ok(None)
            }
        }
    }

    async fn load_dependency(&self, group: &str) -> Result<Option<DependencyRecord>, QueueError> {
        match self.store.get(&self.keys.dependency(group)).await? {
            None => Ok(None),
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        }
    }

    /// Attach the producer's result to a consumer that has not been pulled
    /// since its producer completed.
    async fn with_producer_result(&self, mut task: Task) -> Result<Task, QueueError> {
        if task.producer_result.is_none() {
            if let DependencyRole::Consumer { group } = &task.dependency {
                if let Some(record) = self.load_dependency(group).await? {
                    if record.state == DependencyState::Satisfied {
                        task.producer_result = record.result;
                    }
                }
            }
        }
        Ok(task)
    }

    /// Move a pending dependency record to a terminal state.
    async fn resolve_dependency(
        &self,
        group: &str,
        state: DependencyState,
        result: Option<String>,
    ) -> Result<(), QueueError> {
        let Some(mut record) = self.load_dependency(group).await? else {
            warn!(group = %group, "Dependency record missing on resolve");
            return Ok(());
        };
        if record.state != DependencyState::Pending {
            return Ok(());
        }
        record.state = state;
        record.result = result;
        self.store
            .put(
                &self.keys.dependency(group),
                &serde_json::to_string(&record)?,
                Some(self.config.job_ttl()),
            )
            .await?;
        Ok(())
    }

    /// Mark a group failed and fail its undispatched consumers.
    async fn fail_group(&self, group: &str, producer: &TaskId) -> Result<usize, QueueError> {
        self.resolve_dependency(group, DependencyState::Failed, None).await?;
        let consumers = self.store.smembers(&self.keys.consumers(group)).await?;
        let message = format!("dependency failed: producer {producer}");
        let mut cascaded = 0;
        for id in consumers {
            for state in [QueueState::Pending, QueueState::Retry] {
                if self
                    .fail_in_place(state, &id, None, FailureKind::DependencyFailed, &message)
                    .await?
                    .is_some()
                {
                    cascaded += 1;
                    break;
                }
            }
        }
        if cascaded > 0 {
            warn!(group = %group, producer = %producer, cascaded, "Producer failure cascaded to consumers");
        }
        Ok(cascaded)
    }

    /// Move an unclaimed task from `state` straight to failed.
    ///
    /// Returns the updated record, or `None` when the task was no longer in
    /// `state`.
    async fn fail_in_place(
        &self,
        state: QueueState,
        id: &str,
        task: Option<Task>,
        kind: FailureKind,
        message: &str,
    ) -> Result<Option<Task>, QueueError> {
        let from = self.keys.state(state);
        if self.store.zscore(&from, id).await?.is_none() {
            return Ok(None);
        }
        let task = match task {
            Some(task) => Some(task),
            None => self.load_lenient(id).await?,
        };
        let now = self.clock.now();
        let task = task.map(|mut task| {
            task.last_error = Some(message.to_owned());
            task.last_failure = Some(kind);
            task.completed_at = Some(now);
            task
        });
        if let Some(task) = &task {
            self.save(task).await?;
        }
        let moved = self
            .store
            .move_member(&from, &self.keys.state(QueueState::Failed), id, self.fifo_score(now))
            .await?;
        Ok(if moved { task } else { None })
    }

    /// Fail a membership entry that has no record.
    async fn heal_orphan(&self, state: QueueState, id: &str) -> Result<bool, QueueError> {
        let now = self.clock.now();
        let moved = self
            .store
            .move_member(
                &self.keys.state(state),
                &self.keys.state(QueueState::Failed),
                id,
                self.fifo_score(now),
            )
            .await?;
        if moved {
            warn!(task_id = %id, state = %state, "Orphaned queue entry moved to failed");
        }
        Ok(moved)
    }
}

/// Whether every input of `task` exists according to `probe`.
pub fn inputs_present(probe: &dyn InputProbe, task: &Task) -> Result<(), String> {
    let paths: Vec<&Path> = task.input_paths();
    probe
        .first_missing(&paths)
        .map_or(Ok(()), |p| Err(format!("input missing: {}", p.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::{JobKind, SlideKind, SlideParams, TaskParams};
    use crate::infra::store::InMemoryStore;
    use crate::util::clock::ManualClock;

    #[derive(Debug)]
    struct AllPresent;

    impl InputProbe for AllPresent {
        fn exists(&self, _path: &Path) -> bool {
            true
        }
    }

    fn fixture() -> (TaskStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_millis(1_700_000_000_000));
        let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
        let tasks = TaskStore::new(store, QueueConfig::default())
            .with_clock(clock.clone())
            .with_probe(Arc::new(AllPresent));
        (tasks, clock)
    }

    fn task(id: &str) -> Task {
        Task::new(
            "job",
            JobKind::Single,
            TaskParams::Single(SlideParams::new(SlideKind::Body, 0, "scene")),
            format!("/out/{id}.png"),
        )
        .with_id(id)
    }

    #[test]
    fn keys_use_prefix() {
        let keys = QueueKeys::new("q");
        assert_eq!(keys.state(QueueState::Retry), "q:retry");
        assert_eq!(keys.task("t1"), "q:task:t1");
        assert_eq!(keys.consumers("g"), "q:dep:g:consumers");
    }

    #[test]
    fn fail_options_follow_kind() {
        let opts = FailOptions::from_kind(FailureKind::MissingInput);
        assert!(opts.permanent);
        assert!(!opts.rate_limited);
        let opts = FailOptions::from_kind(FailureKind::CredentialPoolExhausted);
        assert!(opts.rate_limited);
        assert!(!opts.permanent);
    }

    #[tokio::test]
    async fn fifo_within_same_millisecond() {
        let (tasks, _) = fixture();
        for id in ["a", "b", "c"] {
            tasks.enqueue(task(id)).await.unwrap();
        }
        let pulled: Vec<String> = tasks
            .pull(3)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id.to_string())
            .collect();
        assert_eq!(pulled, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_rejected() {
        let (tasks, _) = fixture();
        tasks.enqueue(task("a")).await.unwrap();
        let err = tasks.enqueue(task("a")).await.unwrap_err();
        assert!(matches!(err, QueueError::DuplicateTask(_)));
    }

    #[tokio::test]
    async fn second_producer_for_group_is_rejected() {
        let (tasks, _) = fixture();
        tasks.enqueue(task("p1").producer_of("g")).await.unwrap();
        let err = tasks.enqueue(task("p2").producer_of("g")).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidTask(_)));
    }

    #[tokio::test]
    async fn complete_requires_processing() {
        let (tasks, _) = fixture();
        let id = tasks.enqueue(task("a")).await.unwrap();
        let err = tasks.complete(&id, "r").await.unwrap_err();
        assert!(matches!(err, QueueError::NotProcessing(_)));
    }

    #[tokio::test]
    async fn orphan_in_pending_is_healed_on_pull() {
        let (tasks, _) = fixture();
        tasks
            .store
            .zadd(&tasks.keys.state(QueueState::Pending), "ghost", 1)
            .await
            .unwrap();
        assert!(tasks.pull(5).await.unwrap().is_empty());
        assert_eq!(
            tasks.state_of(&TaskId::from("ghost")).await.unwrap(),
            Some(QueueState::Failed)
        );
    }
}
