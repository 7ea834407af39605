//! # Quota Scheduler
//!
//! A persistent task queue and batch scheduler for AI image generation under
//! strict per-credential rate limits.
//!
//! Generation providers cap every API key per minute and per day. Large jobs
//! (hundreds of slides, many of them waiting on a shared "persona" image)
//! have to be spread across several keys without tripping those caps, without
//! losing work across restarts and without deadlocking when a prerequisite
//! image can never be produced.
//!
//! ## Components
//!
//! - **[`core::TaskStore`]**: tasks move between pending, processing, retry,
//!   completed and failed through atomic store operations. Producer/consumer
//!   dependency groups gate consumers until their producer completes, and a
//!   permanently failed producer fails its consumers.
//! - **[`core::CredentialPool`]**: per-credential, per-capability window and
//!   daily counters with round-robin selection.
//! - **[`core::BatchScheduler`]**: a periodic loop that pulls bounded batches,
//!   fans them out to a bounded worker pool with staggered starts, rotates
//!   credentials on rate limits and pauses or opens a circuit breaker when
//!   every credential is exhausted.
//!
//! All shared state lives behind [`infra::SharedStore`]: Redis in production,
//! an in-memory store for tests and development.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use quota_scheduler::builders::build_components;
//! use quota_scheduler::config::{AppConfig, StoreBackendConfig};
//! use quota_scheduler::infra::{FsInputProbe, InMemoryStore};
//! use quota_scheduler::runtime::Shutdown;
//! use quota_scheduler::util::SystemClock;
//!
//! let mut cfg = AppConfig::default();
//! cfg.store = StoreBackendConfig::InMemory;
//! cfg.credentials = cfg.credentials.with_keys(["key-a", "key-b"]);
//!
//! let clock = Arc::new(SystemClock);
//! let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
//! let components = build_components(&cfg, store, my_generator, clock, Arc::new(FsInputProbe))?;
//!
//! components.tasks.enqueue(task).await?;
//!
//! let shutdown = Shutdown::new();
//! shutdown.listen_for_ctrl_c();
//! components.scheduler.run(shutdown.subscribe()).await?;
//! ```
//!
//! For complete scenarios, see:
//! - `tests/task_store_test.rs` - queue states, dependencies and reaping
//! - `tests/scheduler_test.rs` - batches, rotation and backpressure

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Task records, task store, credential pool and batch scheduler.
pub mod core;
/// Configuration models for the store, queue, credentials and scheduler.
pub mod config;
/// Builders to construct scheduler components from configuration.
pub mod builders;
/// Infrastructure adapters for the shared store and input probing.
pub mod infra;
/// Process wiring: stop signal, startup checks, service entry point.
pub mod runtime;
/// Shared utilities.
pub mod util;
