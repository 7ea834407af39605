//! Shared store contract and its backends.
//!
//! The task store and credential pool keep all mutable state behind
//! [`SharedStore`]. Backends must serialize conflicting operations themselves:
//! in particular [`SharedStore::move_member`] is the only way a task changes
//! state, and it must succeed for exactly one caller when several race for the
//! same member.

pub mod memory;
#[cfg(feature = "redis-store")]
pub mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::core::error::StoreError;

pub use memory::InMemoryStore;
#[cfg(feature = "redis-store")]
pub use redis_store::RedisStore;

/// Key/value, ordered-collection, set and counter primitives.
///
/// Ordered collections rank members by an integer score (millisecond
/// timestamps in practice), ties broken by member.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Add or rescore a member of an ordered collection.
    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<(), StoreError>;

    /// Remove a member from an ordered collection. Returns whether it was present.
    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Up to `count` members in ascending score order, skipping the first `offset`.
    async fn zrange(&self, key: &str, offset: usize, count: usize)
        -> Result<Vec<String>, StoreError>;

    /// Members with their scores, ascending.
    async fn zrange_with_scores(&self, key: &str) -> Result<Vec<(String, i64)>, StoreError>;

    /// Score of a member, if present.
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<i64>, StoreError>;

    /// Number of members in an ordered collection.
    async fn zcard(&self, key: &str) -> Result<usize, StoreError>;

    /// Atomically remove `member` from ordered collection `from` and add it to
    /// `to` with `score`. Returns `false` and changes nothing when `member` was
    /// not in `from`.
    async fn move_member(
        &self,
        from: &str,
        to: &str,
        member: &str,
        score: i64,
    ) -> Result<bool, StoreError>;

    /// Add a member to a set. Returns whether it was newly added.
    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Remove a member from a set. Returns whether it was present.
    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// All members of a set, in no particular order.
    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Store a string value, optionally expiring after `ttl`.
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Store a string value only if the key is absent. Returns whether it was written.
    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// Read a string value.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Delete keys of any kind. Returns how many existed.
    async fn delete(&self, keys: &[String]) -> Result<usize, StoreError>;

    /// Increment an integer counter, creating it at zero. Returns the new value.
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    /// Expire a key after `ttl`. Returns whether the key exists.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Expire a key at an absolute instant. Returns whether the key exists.
    async fn expire_at(&self, key: &str, at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Remaining lifetime of a key; `None` when missing or persistent.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    /// Round-trip to the backend.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Read an integer counter, treating a missing key as zero.
pub async fn read_counter(store: &dyn SharedStore, key: &str) -> Result<i64, StoreError> {
    match store.get(key).await? {
        None => Ok(0),
        Some(raw) => raw.trim().parse::<i64>().map_err(|e| StoreError::Corrupt {
            key: key.to_owned(),
            reason: e.to_string(),
        }),
    }
}
