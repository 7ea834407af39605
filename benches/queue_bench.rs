//! Benchmarks for the quota scheduler over the in-memory store.
//!
//! Benchmarks cover:
//! - Task store enqueue and the full claim/complete lifecycle
//! - Pull cost when many consumers are blocked behind a producer
//! - Credential acquisition with round-robin rotation
//! - End-to-end scheduler cycles

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quota_scheduler::config::{BatchConfig, CredentialConfig, QueueConfig};
use quota_scheduler::core::{
    BatchScheduler, Credential, CredentialPool, GenerationError, ImageGenerator, InputProbe,
    JobKind, SlideKind, SlideParams, Task, TaskParams, TaskStore,
};
use quota_scheduler::infra::InMemoryStore;
use tokio::runtime::Runtime;

// ============================================================================
// Test Fixtures
// ============================================================================

#[derive(Debug)]
struct AllPresent;

impl InputProbe for AllPresent {
    fn exists(&self, _path: &std::path::Path) -> bool {
        true
    }
}

#[derive(Clone)]
struct InstantGenerator;

#[async_trait]
impl ImageGenerator for InstantGenerator {
    async fn generate(&self, _credential: &Credential, task: &Task) -> Result<String, GenerationError> {
        Ok(task.output_path.display().to_string())
    }
}

fn task_store() -> (TaskStore, Arc<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::new());
    let tasks = TaskStore::new(store.clone(), QueueConfig::default()).with_probe(Arc::new(AllPresent));
    (tasks, store)
}

fn build_task(i: u64) -> Task {
    Task::new(
        "bench-job",
        JobKind::Batch,
        TaskParams::Single(SlideParams::new(SlideKind::Body, 0, "scene")),
        format!("/out/{i}.png"),
    )
    .with_id(format!("t{i}"))
}

fn credential_pool(store: Arc<InMemoryStore>, keys: usize) -> CredentialPool {
    let config = CredentialConfig::default()
        .with_keys((0..keys).map(|i| format!("key-{i}")))
        .with_limits("image", 1_000_000, 1_000_000);
    CredentialPool::new(store, config).unwrap()
}

// ============================================================================
// Task Store Benchmarks
// ============================================================================

fn bench_enqueue(c: &mut Criterion) {
    let mut group = c.benchmark_group("task_store_enqueue");

    for size in [100u64, 1_000] {
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.to_async(Runtime::new().unwrap()).iter(|| async move {
                let (tasks, _) = task_store();
                for i in 0..size {
                    black_box(tasks.enqueue(build_task(i)).await.unwrap());
                }
            });
        });
    }
    group.finish();
}

fn bench_lifecycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("task_store_lifecycle");

    for size in [100u64, 1_000] {
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.to_async(Runtime::new().unwrap()).iter(|| async move {
                let (tasks, _) = task_store();
                for i in 0..size {
                    tasks.enqueue(build_task(i)).await.unwrap();
                }
                loop {
                    let batch = tasks.pull(18).await.unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    for task in batch {
                        tasks.complete(&task.id, "done").await.unwrap();
                    }
                }
            });
        });
    }
    group.finish();
}

fn bench_blocked_consumers(c: &mut Criterion) {
    let mut group = c.benchmark_group("task_store_pull_blocked_consumers");

    for consumers in [50u64, 400] {
        group.bench_with_input(
            BenchmarkId::from_parameter(consumers),
            &consumers,
            |b, &consumers| {
                let rt = Runtime::new().unwrap();
                let (tasks, _) = task_store();
                rt.block_on(async {
                    tasks.enqueue(build_task(0).producer_of("g")).await.unwrap();
                    tasks.pull(1).await.unwrap();
                    for i in 1..=consumers {
                        tasks.enqueue(build_task(i).consumer_of("g")).await.unwrap();
                    }
                });
                b.to_async(rt).iter(|| async {
                    black_box(tasks.pull(18).await.unwrap());
                });
            },
        );
    }
    group.finish();
}

// ============================================================================
// Credential Pool Benchmarks
// ============================================================================

fn bench_acquire(c: &mut Criterion) {
    let mut group = c.benchmark_group("credential_acquire_record");

    for keys in [1usize, 8, 32] {
        group.bench_with_input(BenchmarkId::from_parameter(keys), &keys, |b, &keys| {
            let pool = credential_pool(Arc::new(InMemoryStore::new()), keys);
            b.to_async(Runtime::new().unwrap()).iter(|| async {
                let credential = pool.acquire("image").await.unwrap();
                pool.record_success(credential.id(), "image").await.unwrap();
                black_box(credential);
            });
        });
    }
    group.finish();
}

// ============================================================================
// End-to-End Scenario
// ============================================================================

fn bench_scheduler_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler_cycle");
    group.throughput(Throughput::Elements(18));

    group.bench_function("batch_of_18", |b| {
        b.to_async(Runtime::new().unwrap()).iter(|| async {
            let (tasks, store) = task_store();
            let pool = credential_pool(store, 4);
            let config = BatchConfig::default().with_stagger_delay(Duration::ZERO);
            let scheduler = BatchScheduler::new(tasks.clone(), pool, InstantGenerator, config)
                .with_probe(Arc::new(AllPresent));
            for i in 0..18 {
                tasks.enqueue(build_task(i)).await.unwrap();
            }
            black_box(scheduler.run_cycle().await.unwrap());
        });
    });
    group.finish();
}

// ============================================================================
// Benchmark Groups
// ============================================================================

criterion_group!(
    task_store_benches,
    bench_enqueue,
    bench_lifecycle,
    bench_blocked_consumers
);

criterion_group!(credential_benches, bench_acquire);

criterion_group!(scenario_benches, bench_scheduler_cycle);

criterion_main!(task_store_benches, credential_benches, scenario_benches);
