//! Periodic batch scheduler.
//!
//! Each cycle checks the backpressure gate, pulls up to `batch_size` tasks,
//! fans them out to at most `max_workers` concurrent attempts with a fixed
//! stagger between starts, waits for every outcome and applies it to the task
//! store. Cycles are timed from their start; an overrunning cycle is followed
//! immediately by the next.
//!
//! ```rust,ignore
//! let scheduler = BatchScheduler::new(tasks, pool, generator, BatchConfig::default());
//! let shutdown = Shutdown::new();
//! shutdown.listen_for_ctrl_c();
//! scheduler.run(shutdown.subscribe()).await?;
//! ```

pub mod backpressure;
pub mod dispatch;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::BatchConfig;
use crate::core::credential_pool::CredentialPool;
use crate::core::error::{FailureKind, QueueError, SchedulerError};
use crate::core::executor::{ImageGenerator, InputProbe};
use crate::core::task::Task;
use crate::core::task_store::{FailOptions, FailOutcome, ReapReport, TaskStore};
use crate::infra::probe::FsInputProbe;
use crate::util::clock::{Clock, SystemClock};

pub use backpressure::{Backpressure, BatchSignal, Gate, Transition};
pub use dispatch::{attempt, Attempt, AttemptSettings};

/// Where the scheduler is within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Between cycles.
    Idle,
    /// Claiming tasks.
    Pulling,
    /// Starting attempts.
    Dispatching,
    /// Waiting for outcomes.
    Collecting,
    /// Skipping cycles until a pause deadline.
    Paused,
    /// Skipping cycles until the circuit closes.
    CircuitOpen,
}

/// Counts from one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Tasks claimed.
    pub pulled: usize,
    /// Tasks completed.
    pub completed: usize,
    /// Tasks sent back to retry.
    pub retried: usize,
    /// Tasks failed for good.
    pub failed: usize,
    /// Consumers failed by cascade.
    pub cascaded: usize,
    /// Whether any task found every credential exhausted.
    pub exhausted: bool,
    /// Effect on the backpressure gate.
    pub transition: Option<Transition>,
    /// Reap pass run at the start of this cycle, if any.
    pub reaped: Option<ReapReport>,
}

/// What a call to [`BatchScheduler::run_cycle`] did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cycle", rename_all = "snake_case")]
pub enum CycleReport {
    /// Gate closed; nothing pulled.
    Skipped {
        /// The closed gate.
        gate: Gate,
    },
    /// A batch ran (possibly empty).
    Ran(BatchReport),
}

/// Scheduler counters since start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Cycles that pulled.
    pub batches: u64,
    /// Cycles skipped while paused.
    pub skipped_paused: u64,
    /// Cycles skipped while the circuit was open.
    pub skipped_circuit: u64,
    /// Tasks claimed.
    pub pulled: u64,
    /// Tasks completed.
    pub completed: u64,
    /// Tasks sent back to retry.
    pub retried: u64,
    /// Tasks failed for good, cascades included.
    pub failed: u64,
    /// Tasks failed by reap passes.
    pub reaped: u64,
}

#[derive(Debug, Default)]
struct SchedulerCounters {
    batches: AtomicU64,
    skipped_paused: AtomicU64,
    skipped_circuit: AtomicU64,
    pulled: AtomicU64,
    completed: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    reaped: AtomicU64,
}

impl SchedulerCounters {
    fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SchedulerStats {
        SchedulerStats {
            batches: self.batches.load(Ordering::Relaxed),
            skipped_paused: self.skipped_paused.load(Ordering::Relaxed),
            skipped_circuit: self.skipped_circuit.load(Ordering::Relaxed),
            pulled: self.pulled.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            reaped: self.reaped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Serialize)]
struct Heartbeat<'a> {
    at: DateTime<Utc>,
    phase: Phase,
    stats: &'a SchedulerStats,
}

/// Drives batches of tasks from the task store through the generator.
pub struct BatchScheduler<G: ImageGenerator> {
    tasks: TaskStore,
    pool: CredentialPool,
    generator: G,
    config: BatchConfig,
    clock: Arc<dyn Clock>,
    probe: Arc<dyn InputProbe>,
    backpressure: Mutex<Backpressure>,
    phase: Mutex<Phase>,
    counters: SchedulerCounters,
}

impl<G: ImageGenerator> BatchScheduler<G> {
    /// Scheduler with the system clock and filesystem probe.
    pub fn new(tasks: TaskStore, pool: CredentialPool, generator: G, config: BatchConfig) -> Self {
        let backpressure = Mutex::new(Backpressure::new(&config));
        Self {
            tasks,
            pool,
            generator,
            config,
            clock: Arc::new(SystemClock),
            probe: Arc::new(FsInputProbe),
            backpressure,
            phase: Mutex::new(Phase::Idle),
            counters: SchedulerCounters::default(),
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

    /// Task store in use.
    pub const fn tasks(&self) -> &TaskStore {
        &self.tasks
    }

    /// Credential pool in use.
    pub const fn pool(&self) -> &CredentialPool {
        &self.pool
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    /// Backpressure gate at the current time.
    pub fn gate(&self) -> Gate {
        self.backpressure.lock().peek(self.clock.now())
    }

    /// Counters since start.
    pub fn stats(&self) -> SchedulerStats {
        self.counters.snapshot()
    }

    /// Run cycles until `shutdown` flips to `true` or its sender is dropped.
    ///
    /// A reap pass runs once before the first cycle. The batch in flight when
    /// the signal arrives is drained before returning.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), SchedulerError> {
        info!(
            batch_size = self.config.batch_size,
            max_workers = self.config.max_workers,
            interval_secs = self.config.interval_secs,
            credentials = self.pool.len(),
            "Batch scheduler started"
        );
        self.reap().await;

        loop {
            if *shutdown.borrow() {
                break;
            }
            let started = tokio::time::Instant::now();
            match self.run_cycle().await {
                Ok(CycleReport::Ran(report)) if report.pulled > 0 => info!(
                    pulled = report.pulled,
                    completed = report.completed,
                    retried = report.retried,
                    failed = report.failed,
                    exhausted = report.exhausted,
                    "Batch finished"
                ),
                Ok(_) => {}
                Err(e) => error!(error = %e, "Batch cycle failed"),
            }

            let wait = self.config.interval().saturating_sub(started.elapsed());
            tokio::select! {
                () = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.set_phase(Phase::Idle);
        info!(stats = ?self.stats(), "Batch scheduler stopped");
        Ok(())
    }

    /// Run a single cycle now.
    pub async fn run_cycle(&self) -> Result<CycleReport, SchedulerError> {
        let gate = self.backpressure.lock().check(self.clock.now());
        match gate {
            Gate::Paused { until } => {
                self.counters.skipped_paused.fetch_add(1, Ordering::Relaxed);
                self.set_phase(Phase::Paused);
                debug!(until = %until, "Cycle skipped, paused");
                self.heartbeat().await;
                return Ok(CycleReport::Skipped { gate });
            }
            Gate::CircuitOpen { until } => {
                self.counters.skipped_circuit.fetch_add(1, Ordering::Relaxed);
                self.set_phase(Phase::CircuitOpen);
                debug!(until = %until, "Cycle skipped, circuit open");
                self.heartbeat().await;
                return Ok(CycleReport::Skipped { gate });
            }
            Gate::Open => {}
        }

        let batch_no = self.counters.batches.fetch_add(1, Ordering::Relaxed) + 1;
        let mut report = BatchReport::default();
        if batch_no % u64::from(self.config.reap_every_batches.max(1)) == 0 {
            report.reaped = Some(self.reap().await);
        }

        self.set_phase(Phase::Pulling);
        let batch = match self.tasks.pull(self.config.batch_size).await {
            Ok(batch) => batch,
            Err(e) => {
                self.set_phase(Phase::Idle);
                return Err(e.into());
            }
        };
        report.pulled = batch.len();
        SchedulerCounters::add(&self.counters.pulled, batch.len());

        if !batch.is_empty() {
            let outcomes = self.dispatch(batch).await;
            let mut signal = BatchSignal::default();
            for (task, outcome) in outcomes {
                self.apply(&task, outcome, &mut report, &mut signal).await;
            }
            report.exhausted = signal.exhausted;
            let transition = self.backpressure.lock().record_batch(self.clock.now(), signal);
            if transition != Transition::None {
                report.transition = Some(transition);
            }
        }

        self.set_phase(Phase::Idle);
        self.heartbeat().await;
        Ok(CycleReport::Ran(report))
    }

    /// Reap now, logging instead of propagating store errors.
    pub async fn reap(&self) -> ReapReport {
        match self.tasks.reap().await {
            Ok(report) => {
                SchedulerCounters::add(&self.counters.reaped, report.total());
                report
            }
            Err(e) => {
                error!(error = %e, "Reap pass failed");
                ReapReport::default()
            }
        }
    }

    async fn dispatch(&self, batch: Vec<Task>) -> Vec<(Task, Attempt)> {
        self.set_phase(Phase::Dispatching);
        let permits = Arc::new(Semaphore::new(self.config.max_workers));
        let settings = Arc::new(AttemptSettings {
            capability: self.config.capability.clone(),
            timeout: self.config.generation_timeout(),
        });
        let stagger = self.config.stagger_delay();
        let mut workers = JoinSet::new();

        for (index, task) in batch.into_iter().enumerate() {
            if index > 0 && !stagger.is_zero() {
                tokio::time::sleep(stagger).await;
            }
            let Ok(permit) = permits.clone().acquire_owned().await else {
                error!("Worker semaphore closed");
                break;
            };
            let generator = self.generator.clone();
            let pool = self.pool.clone();
            let probe = self.probe.clone();
            let settings = settings.clone();
            debug!(task_id = %task.id, "Dispatching task");
            workers.spawn(async move {
                let outcome = attempt(&generator, &pool, probe.as_ref(), &task, &settings).await;
                drop(permit);
                (task, outcome)
            });
        }

        self.set_phase(Phase::Collecting);
        let mut outcomes = Vec::with_capacity(workers.len());
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                // The task stays in processing until reaped.
                Err(e) => error!(error = %e, "Generation worker panicked"),
            }
        }
        outcomes
    }

    async fn apply(&self, task: &Task, outcome: Attempt, report: &mut BatchReport, signal: &mut BatchSignal) {
        let result = match outcome {
            Attempt::Completed { output, credential } => {
                signal.succeeded += 1;
                debug!(task_id = %task.id, credential = %credential, output = %output, "Generation succeeded");
                match self.tasks.complete(&task.id, &output).await {
                    Ok(()) => {
                        report.completed += 1;
                        self.counters.completed.fetch_add(1, Ordering::Relaxed);
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            Attempt::Exhausted { message, retry_after } => {
                signal.exhausted = true;
                signal.retry_after = signal.retry_after.max(retry_after);
                self.record_failure(task, &message, FailureKind::CredentialPoolExhausted, report)
                    .await
            }
            Attempt::Failed { kind, message } => {
                if kind == FailureKind::RateLimited {
                    signal.exhausted = true;
                }
                self.record_failure(task, &message, kind, report).await
            }
        };

        match result {
            Ok(()) => {}
            Err(QueueError::NotProcessing(id)) => {
                warn!(task_id = %id, "Outcome dropped, task no longer processing");
            }
            Err(e) => error!(task_id = %task.id, error = %e, "Failed to apply task outcome"),
        }
    }

    async fn record_failure(
        &self,
        task: &Task,
        message: &str,
        kind: FailureKind,
        report: &mut BatchReport,
    ) -> Result<(), QueueError> {
        match self.tasks.fail(&task.id, message, FailOptions::from_kind(kind)).await? {
            FailOutcome::Retry { .. } => {
                report.retried += 1;
                self.counters.retried.fetch_add(1, Ordering::Relaxed);
            }
            FailOutcome::Failed { cascaded, .. } => {
                report.failed += 1;
                report.cascaded += cascaded;
                SchedulerCounters::add(&self.counters.failed, 1 + cascaded);
            }
        }
        Ok(())
    }

    async fn heartbeat(&self) {
        let stats = self.stats();
        let beat = Heartbeat {
            at: self.clock.now(),
            phase: self.phase(),
            stats: &stats,
        };
        let Ok(json) = serde_json::to_string(&beat) else {
            return;
        };
        let key = self.tasks.keys().heartbeat();
        if let Err(e) = self.tasks.store().put(&key, &json, Some(self.config.heartbeat_ttl())).await {
            warn!(error = %e, "Failed to write heartbeat");
        }
    }

    fn set_phase(&self, phase: Phase) {
        *self.phase.lock() = phase;
    }
}
