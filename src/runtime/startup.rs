//! Startup checks and the service entry point.

use std::sync::Arc;

use anyhow::{bail, Context};
use tracing::{info, warn};

use crate::builders::{build_components, connect_store};
use crate::config::AppConfig;
use crate::core::{AppResult, CredentialPool, ImageGenerator};
use crate::infra::probe::FsInputProbe;
use crate::infra::store::SharedStore;
use crate::runtime::shutdown::Shutdown;
use crate::util::clock::SystemClock;
use crate::util::telemetry::init_tracing;

/// Check the store answers and at least one credential can serve `capability`.
pub async fn validate_startup(
    store: &dyn SharedStore,
    pool: &CredentialPool,
    capability: &str,
) -> AppResult<()> {
    store.ping().await.context("shared store unreachable")?;

    let summary = pool
        .summary(capability)
        .await
        .with_context(|| format!("reading credential usage for `{capability}`"))?;
    if summary.unusable == summary.total {
        bail!("all {} credentials are unusable for `{capability}`", summary.total);
    }
    if summary.available == 0 {
        warn!(
            capability = %capability,
            secs_until_daily_reset = summary.secs_until_daily_reset,
            "No credential has quota left; scheduler will pause until one recovers"
        );
    }
    info!(
        capability = %capability,
        total = summary.total,
        available = summary.available,
        daily_remaining = summary.daily_remaining,
        "Startup checks passed"
    );
    Ok(())
}

/// Build everything from `cfg`, validate, and run until Ctrl-C.
pub async fn run_service<G: ImageGenerator>(cfg: AppConfig, generator: G) -> AppResult<()> {
    init_tracing();
    cfg.validate()
        .map_err(anyhow::Error::msg)
        .context("invalid configuration")?;

    let clock = Arc::new(SystemClock);
    let store = connect_store(&cfg.store, clock.clone())
        .await
        .context("connecting to shared store")?;
    let components = build_components(&cfg, store, generator, clock, Arc::new(FsInputProbe))?;
    validate_startup(components.store.as_ref(), &components.pool, &cfg.batch.capability).await?;

    let shutdown = Shutdown::new();
    shutdown.listen_for_ctrl_c();
    components.scheduler.run(shutdown.subscribe()).await?;
    Ok(())
}
