//! Wire the store, task store, credential pool and scheduler from configuration.

use std::sync::Arc;

use tracing::info;

use crate::config::{AppConfig, StoreBackendConfig};
use crate::core::{BatchScheduler, CredentialPool, ImageGenerator, InputProbe, SchedulerError, TaskStore};
use crate::infra::store::{InMemoryStore, SharedStore};
use crate::util::clock::Clock;

/// Everything a scheduler process needs, sharing one store and clock.
pub struct Components<G: ImageGenerator> {
    /// Shared store.
    pub store: Arc<dyn SharedStore>,
    /// Task store, also used by submitters.
    pub tasks: TaskStore,
    /// Credential pool.
    pub pool: CredentialPool,
    /// Batch scheduler.
    pub scheduler: BatchScheduler<G>,
}

/// Open the configured store backend.
pub async fn connect_store(
    cfg: &StoreBackendConfig,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn SharedStore>, SchedulerError> {
    match cfg {
        StoreBackendConfig::InMemory => {
            info!("Using in-memory store");
            Ok(Arc::new(InMemoryStore::with_clock(clock)))
        }
        #[cfg(feature = "redis-store")]
        StoreBackendConfig::Redis { url } => {
            let store = crate::infra::store::RedisStore::connect(url).await?;
            info!("Connected to redis store");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis-store"))]
        StoreBackendConfig::Redis { .. } => Err(SchedulerError::InvalidConfig(
            "redis backend requires the `redis-store` feature".into(),
        )),
    }
}

/// Validate `cfg` and build every component over `store`.
pub fn build_components<G: ImageGenerator>(
    cfg: &AppConfig,
    store: Arc<dyn SharedStore>,
    generator: G,
    clock: Arc<dyn Clock>,
    probe: Arc<dyn InputProbe>,
) -> Result<Components<G>, SchedulerError> {
    cfg.validate().map_err(SchedulerError::InvalidConfig)?;

    let tasks = TaskStore::new(store.clone(), cfg.queue.clone())
        .with_clock(clock.clone())
        .with_probe(probe.clone());
    let pool = CredentialPool::new(store.clone(), cfg.credentials.clone())?.with_clock(clock.clone());
    let scheduler = BatchScheduler::new(tasks.clone(), pool.clone(), generator, cfg.batch.clone())
        .with_clock(clock)
        .with_probe(probe);

    Ok(Components {
        store,
        tasks,
        pool,
        scheduler,
    })
}
