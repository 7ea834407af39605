//! In-memory shared store for development and tests.
//!
//! A single mutex guards all data, so every operation (including
//! `move_member`) is atomic with respect to the others. Expiry is evaluated
//! lazily against the injected clock.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::core::error::StoreError;
use crate::infra::store::SharedStore;
use crate::util::clock::{Clock, SystemClock};

/// Ordered collection indexed both ways.
#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<String, i64>,
    order: BTreeSet<(i64, String)>,
}

impl SortedSet {
    fn insert(&mut self, member: &str, score: i64) {
        if let Some(old) = self.scores.insert(member.to_owned(), score) {
            self.order.remove(&(old, member.to_owned()));
        }
        self.order.insert((score, member.to_owned()));
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(old) => {
                self.order.remove(&(old, member.to_owned()));
                true
            }
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.scores.len()
    }
}

#[derive(Debug, Default)]
struct Inner {
    values: HashMap<String, String>,
    sorted: HashMap<String, SortedSet>,
    sets: HashMap<String, HashSet<String>>,
    expiry: HashMap<String, DateTime<Utc>>,
}

impl Inner {
    fn exists(&self, key: &str) -> bool {
        self.values.contains_key(key) || self.sorted.contains_key(key) || self.sets.contains_key(key)
    }

    fn remove_key(&mut self, key: &str) -> bool {
        self.expiry.remove(key);
        let a = self.values.remove(key).is_some();
        let b = self.sorted.remove(key).is_some();
        let c = self.sets.remove(key).is_some();
        a || b || c
    }

    /// Drop `key` if its deadline has passed.
    fn purge(&mut self, key: &str, now: DateTime<Utc>) {
        if self.expiry.get(key).is_some_and(|at| *at <= now) {
            self.remove_key(key);
        }
    }

    fn prune_empty(&mut self, key: &str) {
        if self.sorted.get(key).is_some_and(|z| z.len() == 0) {
            self.sorted.remove(key);
            self.expiry.remove(key);
        }
        if self.sets.get(key).is_some_and(HashSet::is_empty) {
            self.sets.remove(key);
            self.expiry.remove(key);
        }
    }
}

/// Shared store kept in process memory.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    inner: Arc<Mutex<Inner>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    /// Store using the system clock for expiry.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Store evaluating expiry against `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            clock,
        }
    }

    /// Number of live keys of any kind.
    pub fn key_count(&self) -> usize {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let keys: Vec<String> = inner.expiry.keys().cloned().collect();
        for key in keys {
            inner.purge(&key, now);
        }
        inner.values.len() + inner.sorted.len() + inner.sets.len()
    }

    fn locked(&self, key: &str) -> parking_lot::MutexGuard<'_, Inner> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.purge(key, now);
        inner
    }

    fn deadline(&self, ttl: Duration) -> DateTime<Utc> {
        let delta = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        self.clock.now() + delta
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for InMemoryStore {
    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<(), StoreError> {
        let mut inner = self.locked(key);
        inner
            .sorted
            .entry(key.to_owned())
            .or_default()
            .insert(member, score);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut inner = self.locked(key);
        let removed = inner
            .sorted
            .get_mut(key)
            .is_some_and(|z| z.remove(member));
        inner.prune_empty(key);
        Ok(removed)
    }

    async fn zrange(
        &self,
        key: &str,
        offset: usize,
        count: usize,
    ) -> Result<Vec<String>, StoreError> {
        let inner = self.locked(key);
        Ok(inner
            .sorted
            .get(key)
            .map(|z| {
                z.order
                    .iter()
                    .skip(offset)
                    .take(count)
                    .map(|(_, m)| m.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn zrange_with_scores(&self, key: &str) -> Result<Vec<(String, i64)>, StoreError> {
        let inner = self.locked(key);
        Ok(inner
            .sorted
            .get(key)
            .map(|z| z.order.iter().map(|(s, m)| (m.clone(), *s)).collect())
            .unwrap_or_default())
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<i64>, StoreError> {
        let inner = self.locked(key);
        Ok(inner
            .sorted
            .get(key)
            .and_then(|z| z.scores.get(member).copied()))
    }

    async fn zcard(&self, key: &str) -> Result<usize, StoreError> {
        let inner = self.locked(key);
        Ok(inner.sorted.get(key).map_or(0, SortedSet::len))
    }

    async fn move_member(
        &self,
        from: &str,
        to: &str,
        member: &str,
        score: i64,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.purge(from, now);
        inner.purge(to, now);
        let removed = inner
            .sorted
            .get_mut(from)
            .is_some_and(|z| z.remove(member));
        if !removed {
            return Ok(false);
        }
        inner.prune_empty(from);
        inner
            .sorted
            .entry(to.to_owned())
            .or_default()
            .insert(member, score);
        Ok(true)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut inner = self.locked(key);
        Ok(inner
            .sets
            .entry(key.to_owned())
            .or_default()
            .insert(member.to_owned()))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut inner = self.locked(key);
        let removed = inner.sets.get_mut(key).is_some_and(|s| s.remove(member));
        inner.prune_empty(key);
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.locked(key);
        Ok(inner
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let deadline = ttl.map(|ttl| self.deadline(ttl));
        let mut inner = self.locked(key);
        inner.values.insert(key.to_owned(), value.to_owned());
        match deadline {
            Some(at) => inner.expiry.insert(key.to_owned(), at),
            None => inner.expiry.remove(key),
        };
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let deadline = ttl.map(|ttl| self.deadline(ttl));
        let mut inner = self.locked(key);
        if inner.values.contains_key(key) {
            return Ok(false);
        }
        inner.values.insert(key.to_owned(), value.to_owned());
        if let Some(at) = deadline {
            inner.expiry.insert(key.to_owned(), at);
        }
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let inner = self.locked(key);
        Ok(inner.values.get(key).cloned())
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let mut removed = 0;
        for key in keys {
            inner.purge(key, now);
            if inner.remove_key(key) {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut inner = self.locked(key);
        let current = match inner.values.get(key) {
            None => 0,
            Some(raw) => raw.parse::<i64>().map_err(|e| StoreError::Corrupt {
                key: key.to_owned(),
                reason: e.to_string(),
            })?,
        };
        let next = current + 1;
        inner.values.insert(key.to_owned(), next.to_string());
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let at = self.deadline(ttl);
        self.expire_at(key, at).await
    }

    async fn expire_at(&self, key: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut inner = self.locked(key);
        if !inner.exists(key) {
            return Ok(false);
        }
        if at <= now {
            inner.remove_key(key);
        } else {
            inner.expiry.insert(key.to_owned(), at);
        }
        Ok(true)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let now = self.clock.now();
        let inner = self.locked(key);
        Ok(inner
            .expiry
            .get(key)
            .and_then(|at| (*at - now).to_std().ok()))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
