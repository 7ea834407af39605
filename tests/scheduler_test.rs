//! Integration tests for the batch scheduler
//!
//! These tests run real cycles against the in-memory store with a scripted
//! generator:
//! - Successful batches, dependency hand-off and heartbeat
//! - Credential rotation on rate limits, daily exhaustion and entitlement errors
//! - Timeouts, rejections and missing inputs
//! - Pause and circuit breaker behaviour
//! - The periodic run loop and its stop signal

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use quota_scheduler::builders::build_components;
use quota_scheduler::config::{AppConfig, BatchConfig, StoreBackendConfig};
use quota_scheduler::core::{
    BatchReport, BatchScheduler, Credential, CycleReport, FailureKind, Gate, GenerationError,
    ImageGenerator, JobId, JobKind, QueueState, SlideKind, SlideParams, Task, TaskId, TaskParams,
    Transition,
};
use quota_scheduler::infra::SharedStore;
use quota_scheduler::runtime::{validate_startup, Shutdown};

use common::{fixture, pool, slide_task, Fixture};

// ============================================================================
// SCRIPTED GENERATOR
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behavior {
    Succeed,
    RateLimit,
    DailyQuota,
    Unentitled,
    Reject,
    Flaky,
    Hang,
}

#[derive(Debug, Clone)]
struct Call {
    secret: String,
    task: String,
    producer_result: Option<String>,
}

/// Answers per credential secret; unscripted secrets use the default.
#[derive(Clone)]
struct ScriptedGenerator {
    default: Arc<Mutex<Behavior>>,
    by_secret: Arc<Mutex<HashMap<String, Behavior>>>,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl ScriptedGenerator {
    fn new(default: Behavior) -> Self {
        Self {
            default: Arc::new(Mutex::new(default)),
            by_secret: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn script(&self, secret: &str, behavior: Behavior) {
        self.by_secret.lock().insert(secret.to_owned(), behavior);
    }

    fn set_default(&self, behavior: Behavior) {
        *self.default.lock() = behavior;
        self.by_secret.lock().clear();
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ImageGenerator for ScriptedGenerator {
    async fn generate(&self, credential: &Credential, task: &Task) -> Result<String, GenerationError> {
        let behavior = self
            .by_secret
            .lock()
            .get(credential.secret())
            .copied()
            .unwrap_or_else(|| *self.default.lock());
        self.calls.lock().push(Call {
            secret: credential.secret().to_owned(),
            task: task.id.to_string(),
            producer_result: task.producer_result.clone(),
        });

        match behavior {
            Behavior::Succeed => Ok(format!("gen://{}", task.id)),
            Behavior::RateLimit => Err(GenerationError::RateLimited {
                message: "429 resource exhausted".into(),
                retry_after: None,
            }),
            Behavior::DailyQuota => Err(GenerationError::DailyQuotaExhausted(
                "requests per day exceeded".into(),
            )),
            Behavior::Unentitled => Err(GenerationError::Unentitled("model not enabled".into())),
            Behavior::Reject => Err(GenerationError::Permanent("prompt blocked".into())),
            Behavior::Flaky => Err(GenerationError::Transient("503 backend error".into())),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(600)).await;
                Ok(format!("gen://{}", task.id))
            }
        }
    }
}

// ============================================================================
// HELPERS
// ============================================================================

struct Harness {
    fx: Fixture,
    generator: ScriptedGenerator,
    scheduler: BatchScheduler<ScriptedGenerator>,
}

fn quick() -> BatchConfig {
    BatchConfig::default().with_stagger_delay(Duration::ZERO)
}

fn harness(keys: &[&str], default: Behavior, config: BatchConfig) -> Harness {
    let fx = fixture();
    let generator = ScriptedGenerator::new(default);
    let scheduler = BatchScheduler::new(fx.tasks.clone(), pool(&fx, keys, 18, 240), generator.clone(), config)
        .with_clock(fx.clock.clone())
        .with_probe(fx.probe.clone());
    Harness {
        fx,
        generator,
        scheduler,
    }
}

async fn ran(h: &Harness) -> BatchReport {
    match h.scheduler.run_cycle().await.unwrap() {
        CycleReport::Ran(report) => report,
        CycleReport::Skipped { gate } => panic!("cycle skipped: {gate:?}"),
    }
}

async fn state(h: &Harness, id: &str) -> Option<QueueState> {
    h.fx.tasks.state_of(&TaskId::from(id)).await.unwrap()
}

// ============================================================================
// HAPPY PATH
// ============================================================================

#[tokio::test]
async fn batch_completes_every_task() {
    let h = harness(&["k-a", "k-b"], Behavior::Succeed, quick());
    for id in ["s1", "s2", "s3"] {
        h.fx.tasks.enqueue(slide_task("job", id)).await.unwrap();
    }

    let report = ran(&h).await;
    assert_eq!(report.pulled, 3);
    assert_eq!(report.completed, 3);
    assert!(!report.exhausted);
    assert_eq!(report.transition, None);

    let status = h.fx.tasks.status(&JobId::from("job")).await.unwrap();
    assert!(status.is_complete);
    assert_eq!(status.completed, 3);
    assert!(status.results.iter().any(|r| r.output == "gen://s2"));

    let stats = h.scheduler.stats();
    assert_eq!((stats.batches, stats.pulled, stats.completed), (1, 3, 3));

    let beat = h.fx.store.get(&h.fx.tasks.keys().heartbeat()).await.unwrap().unwrap();
    let beat: serde_json::Value = serde_json::from_str(&beat).unwrap();
    assert_eq!(beat["phase"], "idle");
    assert_eq!(beat["stats"]["completed"], 3);
}

#[tokio::test]
async fn batch_size_bounds_each_cycle() {
    let h = harness(&["k-a"], Behavior::Succeed, quick().with_batch_size(2));
    for n in 0..5 {
        h.fx.tasks.enqueue(slide_task("job", &format!("t{n}"))).await.unwrap();
    }
    assert_eq!(ran(&h).await.pulled, 2);
    assert_eq!(ran(&h).await.pulled, 2);
    assert_eq!(ran(&h).await.pulled, 1);
    assert_eq!(ran(&h).await.pulled, 0);
}

#[tokio::test]
async fn consumers_run_after_producer_with_its_result() {
    let h = harness(&["k-a"], Behavior::Succeed, quick());
    h.fx.tasks.enqueue(slide_task("job", "p").producer_of("persona")).await.unwrap();
    h.fx.tasks.enqueue(slide_task("job", "c1").consumer_of("persona")).await.unwrap();
    h.fx.tasks.enqueue(slide_task("job", "c2").consumer_of("persona")).await.unwrap();

    assert_eq!(ran(&h).await.completed, 1);
    assert_eq!(ran(&h).await.completed, 2);

    let consumer_calls: Vec<Call> = h
        .generator
        .calls()
        .into_iter()
        .filter(|c| c.task != "p")
        .collect();
    assert_eq!(consumer_calls.len(), 2);
    assert!(consumer_calls
        .iter()
        .all(|c| c.producer_result.as_deref() == Some("gen://p")));
}

// ============================================================================
// CREDENTIAL ROTATION
// ============================================================================

#[tokio::test]
async fn rate_limited_credential_rotates_to_next() {
    let h = harness(&["k-a", "k-b"], Behavior::Succeed, quick());
    h.generator.script("k-a", Behavior::RateLimit);
    h.fx.tasks.enqueue(slide_task("job", "t")).await.unwrap();

    let report = ran(&h).await;
    assert_eq!(report.completed, 1);
    assert!(!report.exhausted);

    let secrets: Vec<String> = h.generator.calls().into_iter().map(|c| c.secret).collect();
    assert_eq!(secrets, vec!["k-a", "k-b"]);

    let pool = h.scheduler.pool();
    let a = pool.credentials()[0].id().to_owned();
    let b = pool.credentials()[1].id().to_owned();
    assert!(!pool.usage(&a, "image").await.unwrap().available);
    assert_eq!(pool.usage(&b, "image").await.unwrap().window_count, 1);
}

#[tokio::test]
async fn daily_exhaustion_and_entitlement_errors_rotate() {
    let h = harness(&["k-a", "k-b", "k-c"], Behavior::Succeed, quick().with_max_workers(1));
    h.generator.script("k-a", Behavior::DailyQuota);
    h.generator.script("k-b", Behavior::Unentitled);
    h.fx.tasks.enqueue(slide_task("job", "t1")).await.unwrap();
    h.fx.tasks.enqueue(slide_task("job", "t2")).await.unwrap();

    assert_eq!(ran(&h).await.completed, 2);

    let pool = h.scheduler.pool();
    let ids: Vec<String> = pool.credentials().iter().map(|c| c.id().to_owned()).collect();
    let a = pool.usage(&ids[0], "image").await.unwrap();
    assert_eq!(a.daily_count, 240);
    assert!(pool.usage(&ids[1], "image").await.unwrap().unusable);
    assert_eq!(pool.usage(&ids[2], "image").await.unwrap().daily_count, 2);

    let calls_to_bad: usize = h
        .generator
        .calls()
        .iter()
        .filter(|c| c.secret != "k-c")
        .count();
    assert_eq!(calls_to_bad, 2);
}

// ============================================================================
// FAILURES
// ============================================================================

#[tokio::test]
async fn missing_input_fails_without_calling_generator() {
    let h = harness(&["k-a"], Behavior::Succeed, quick());
    let task = Task::new(
        "job",
        JobKind::Single,
        TaskParams::Single(
            SlideParams::new(SlideKind::Product, 3, "product on desk").with_product_image("/in/product.png"),
        ),
        "/out/p.png",
    )
    .with_id("needs-input");
    h.fx.tasks.enqueue(task).await.unwrap();
    h.fx.probe.remove("/in/product.png");

    let report = ran(&h).await;
    assert_eq!(report.failed, 1);
    assert!(h.generator.calls().is_empty());
    let task = h.fx.tasks.get(&TaskId::from("needs-input")).await.unwrap().unwrap();
    assert_eq!(task.last_failure, Some(FailureKind::MissingInput));
}

#[tokio::test]
async fn rejection_fails_and_transient_error_retries() {
    let h = harness(&["k-a"], Behavior::Reject, quick());
    h.fx.tasks.enqueue(slide_task("job", "blocked")).await.unwrap();
    let report = ran(&h).await;
    assert_eq!(report.failed, 1);
    let blocked = h.fx.tasks.get(&TaskId::from("blocked")).await.unwrap().unwrap();
    assert_eq!(blocked.last_failure, Some(FailureKind::Rejected));
    assert_eq!(blocked.retry_count, 0);

    h.generator.set_default(Behavior::Flaky);
    h.fx.tasks.enqueue(slide_task("job", "flaky")).await.unwrap();
    let report = ran(&h).await;
    assert_eq!(report.retried, 1);
    let flaky = h.fx.tasks.get(&TaskId::from("flaky")).await.unwrap().unwrap();
    assert_eq!(flaky.retry_count, 1);
    assert_eq!(state(&h, "flaky").await, Some(QueueState::Retry));
}

#[tokio::test]
async fn failed_producer_cascades_through_scheduler() {
    let h = harness(&["k-a"], Behavior::Reject, quick());
    h.fx.tasks.enqueue(slide_task("job", "p").producer_of("g")).await.unwrap();
    h.fx.tasks.enqueue(slide_task("job", "c").consumer_of("g")).await.unwrap();

    let report = ran(&h).await;
    assert_eq!((report.failed, report.cascaded), (1, 1));
    assert_eq!(state(&h, "c").await, Some(QueueState::Failed));
    assert_eq!(h.scheduler.stats().failed, 2);
}

#[tokio::test(start_paused = true)]
async fn hung_generation_times_out() {
    let config = quick().with_generation_timeout(Duration::from_secs(1));
    let h = harness(&["k-a"], Behavior::Hang, config);
    h.fx.tasks.enqueue(slide_task("job", "slow")).await.unwrap();

    let report = ran(&h).await;
    assert_eq!(report.retried, 1);
    let task = h.fx.tasks.get(&TaskId::from("slow")).await.unwrap().unwrap();
    assert_eq!(task.last_failure, Some(FailureKind::Timeout));
    assert_eq!(task.retry_count, 1);

    let credential = h.scheduler.pool().credentials()[0].id().to_owned();
    let usage = h.scheduler.pool().usage(&credential, "image").await.unwrap();
    assert_eq!((usage.window_count, usage.daily_count), (1, 1));
}

#[tokio::test]
async fn consumer_fails_when_producer_image_disappears() {
    let h = harness(&["k-a"], Behavior::Succeed, quick());
    h.fx.tasks.enqueue(slide_task("job", "p").producer_of("persona")).await.unwrap();
    h.fx.tasks.enqueue(slide_task("job", "c1").consumer_of("persona")).await.unwrap();

    assert_eq!(ran(&h).await.completed, 1);
    h.fx.probe.remove("gen://p");

    let report = ran(&h).await;
    assert_eq!((report.completed, report.failed), (0, 1));
    assert_eq!(h.generator.calls().len(), 1);
    let task = h.fx.tasks.get(&TaskId::from("c1")).await.unwrap().unwrap();
    assert_eq!(task.last_failure, Some(FailureKind::MissingInput));
    assert_eq!(state(&h, "c1").await, Some(QueueState::Failed));
}

// ============================================================================
// BACKPRESSURE
// ============================================================================

#[tokio::test]
async fn exhausted_batches_pause_then_open_circuit() {
    let config = quick().with_circuit(3, Duration::from_secs(300));
    let h = harness(&["k-a", "k-b"], Behavior::RateLimit, config);
    h.fx.tasks.enqueue(slide_task("job", "t1")).await.unwrap();
    h.fx.tasks.enqueue(slide_task("job", "t2")).await.unwrap();
    let pause = Duration::from_secs(70);

    for round in 1..=2 {
        let report = ran(&h).await;
        assert_eq!(report.pulled, 2, "round {round}");
        assert!(report.exhausted);
        assert!(matches!(report.transition, Some(Transition::Paused { .. })));

        assert!(matches!(
            h.scheduler.run_cycle().await.unwrap(),
            CycleReport::Skipped {
                gate: Gate::Paused { .. }
            }
        ));
        h.fx.clock.advance(pause);
    }

    let report = ran(&h).await;
    assert!(matches!(report.transition, Some(Transition::CircuitOpened { .. })));

    h.fx.clock.advance(Duration::from_secs(299));
    assert!(matches!(
        h.scheduler.run_cycle().await.unwrap(),
        CycleReport::Skipped {
            gate: Gate::CircuitOpen { .. }
        }
    ));
    let stats = h.fx.tasks.stats().await.unwrap();
    assert_eq!(stats.retry, 2);
    for id in ["t1", "t2"] {
        let task = h.fx.tasks.get(&TaskId::from(id)).await.unwrap().unwrap();
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.last_failure, Some(FailureKind::CredentialPoolExhausted));
    }

    h.fx.clock.advance(Duration::from_secs(1));
    h.generator.set_default(Behavior::Succeed);
    let report = ran(&h).await;
    assert_eq!(report.completed, 2);
    assert_eq!(h.scheduler.gate(), Gate::Open);

    let stats = h.scheduler.stats();
    assert_eq!(stats.skipped_paused, 2);
    assert_eq!(stats.skipped_circuit, 1);
}

#[tokio::test]
async fn heartbeat_stays_fresh_while_circuit_is_open() {
    let config = quick().with_circuit(1, Duration::from_secs(300));
    let h = harness(&["k-a"], Behavior::RateLimit, config);
    h.fx.tasks.enqueue(slide_task("job", "t")).await.unwrap();

    let report = ran(&h).await;
    assert!(matches!(report.transition, Some(Transition::CircuitOpened { .. })));

    let key = h.fx.tasks.keys().heartbeat();
    for _ in 0..4 {
        h.fx.clock.advance(Duration::from_secs(60));
        assert!(matches!(
            h.scheduler.run_cycle().await.unwrap(),
            CycleReport::Skipped {
                gate: Gate::CircuitOpen { .. }
            }
        ));
        let raw = h.fx.store.get(&key).await.unwrap().expect("heartbeat present");
        let beat: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(beat["phase"], "circuit_open");
    }
}

#[tokio::test]
async fn pause_can_be_disabled() {
    let mut config = quick();
    config.pause_on_rate_limit = false;
    let h = harness(&["k-a"], Behavior::RateLimit, config);
    h.fx.tasks.enqueue(slide_task("job", "t")).await.unwrap();

    let report = ran(&h).await;
    assert!(report.exhausted);
    assert_eq!(report.transition, None);
    assert_eq!(h.scheduler.gate(), Gate::Open);
}

#[tokio::test]
async fn reap_runs_on_configured_cadence() {
    let h = harness(&["k-a"], Behavior::Succeed, quick().with_reap_every(2));
    assert!(ran(&h).await.reaped.is_none());
    assert!(ran(&h).await.reaped.is_some());
    assert!(ran(&h).await.reaped.is_none());
}

// ============================================================================
// RUN LOOP AND WIRING
// ============================================================================

#[tokio::test(start_paused = true)]
async fn run_loop_stops_on_shutdown() {
    let h = harness(&["k-a"], Behavior::Succeed, quick());
    for id in ["a", "b", "c"] {
        h.fx.tasks.enqueue(slide_task("job", id)).await.unwrap();
    }

    let shutdown = Shutdown::new();
    let stopper = async {
        tokio::time::sleep(Duration::from_secs(150)).await;
        shutdown.trigger();
    };
    let (result, ()) = tokio::join!(h.scheduler.run(shutdown.subscribe()), stopper);
    result.unwrap();

    let stats = h.scheduler.stats();
    assert!(stats.batches >= 2);
    assert_eq!(stats.completed, 3);
    assert!(shutdown.is_triggered());
}

#[tokio::test]
async fn components_share_store_and_pass_startup_checks() {
    let mut cfg = AppConfig::default();
    cfg.store = StoreBackendConfig::InMemory;
    cfg.credentials = cfg.credentials.with_keys(["k-a", "k-b"]);
    cfg.batch = quick();

    let fx = fixture();
    let components = build_components(
        &cfg,
        fx.store.clone(),
        ScriptedGenerator::new(Behavior::Succeed),
        fx.clock.clone(),
        fx.probe.clone(),
    )
    .unwrap();

    validate_startup(components.store.as_ref(), &components.pool, "image")
        .await
        .unwrap();

    components.tasks.enqueue(slide_task("job", "t")).await.unwrap();
    match components.scheduler.run_cycle().await.unwrap() {
        CycleReport::Ran(report) => assert_eq!(report.completed, 1),
        CycleReport::Skipped { gate } => panic!("unexpected gate {gate:?}"),
    }

    for credential in components.pool.credentials() {
        components
            .pool
            .mark_permanently_unusable(credential.id(), "image")
            .await
            .unwrap();
    }
    assert!(validate_startup(components.store.as_ref(), &components.pool, "image")
        .await
        .is_err());
}
