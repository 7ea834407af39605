//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use quota_scheduler::config::{CredentialConfig, QueueConfig};
use quota_scheduler::core::{
    CredentialPool, InputProbe, JobKind, SlideKind, SlideParams, Task, TaskParams, TaskStore,
};
use quota_scheduler::infra::InMemoryStore;
use quota_scheduler::util::ManualClock;

/// Epoch used by every test clock: 2023-11-14T22:13:20Z.
pub const T0_MS: i64 = 1_700_000_000_000;

/// Probe whose set of missing paths tests can edit.
#[derive(Debug, Default)]
pub struct FakeProbe {
    missing: Mutex<HashSet<String>>,
}

impl FakeProbe {
    pub fn remove(&self, path: &str) {
        self.missing.lock().insert(path.to_owned());
    }
}

impl InputProbe for FakeProbe {
    fn exists(&self, path: &Path) -> bool {
        !self.missing.lock().contains(&path.display().to_string())
    }
}

pub struct Fixture {
    pub clock: Arc<ManualClock>,
    pub store: Arc<InMemoryStore>,
    pub probe: Arc<FakeProbe>,
    pub tasks: TaskStore,
}

pub fn fixture() -> Fixture {
    fixture_with(QueueConfig::default())
}

pub fn fixture_with(config: QueueConfig) -> Fixture {
    let clock = Arc::new(ManualClock::at_millis(T0_MS));
    let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
    let probe = Arc::new(FakeProbe::default());
    let tasks = TaskStore::new(store.clone(), config)
        .with_clock(clock.clone())
        .with_probe(probe.clone());
    Fixture {
        clock,
        store,
        probe,
        tasks,
    }
}

pub fn pool(fx: &Fixture, keys: &[&str], per_window: u32, per_day: u32) -> CredentialPool {
    let config = CredentialConfig::default()
        .with_keys(keys.iter().copied())
        .with_limits("image", per_window, per_day);
    CredentialPool::new(fx.store.clone(), config)
        .unwrap()
        .with_clock(fx.clock.clone())
}

pub fn slide_task(job: &str, id: &str) -> Task {
    Task::new(
        job,
        JobKind::Batch,
        TaskParams::Single(SlideParams::new(SlideKind::Body, 0, format!("scene for {id}"))),
        format!("/out/{id}.png"),
    )
    .with_id(id)
}

pub fn ids(tasks: &[Task]) -> Vec<String> {
    tasks.iter().map(|t| t.id.to_string()).collect()
}
