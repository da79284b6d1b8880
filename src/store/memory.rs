//! In-process store with the same semantics as the Redis backend.
//!
//! All state sits behind one mutex, so every trait method is atomic. Expiries
//! use `tokio::time::Instant`, which lets tests drive lease expiry with a
//! paused clock. The store can be taken offline to simulate an unreachable
//! server, or slowed down to simulate round-trip latency.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{sort_by_score_then_sequence, CasOutcome, FieldGuard, KeyExpiry, Store};
use crate::error::StoreError;

#[derive(Debug, Default)]
struct Inner {
    strings: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
    ordered: HashMap<String, HashMap<String, (f64, u64)>>,
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, BTreeSet<String>>,
    expiries: HashMap<String, Instant>,
    sequence: u64,
}

impl Inner {
    /// Drops `key` from every keyspace if its expiry has passed.
    fn purge_if_expired(&mut self, key: &str) {
        let expired = self
            .expiries
            .get(key)
            .is_some_and(|deadline| *deadline <= Instant::now());
        if expired {
            self.remove_key(key);
        }
    }

    fn remove_key(&mut self, key: &str) -> bool {
        self.expiries.remove(key);
        let mut existed = self.strings.remove(key).is_some();
        existed |= self.hashes.remove(key).is_some();
        existed |= self.ordered.remove(key).is_some();
        existed |= self.lists.remove(key).is_some();
        existed |= self.sets.remove(key).is_some();
        existed
    }

    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn sorted_range(&self, key: &str, max_score: f64) -> Vec<(String, f64)> {
        let Some(members) = self.ordered.get(key) else {
            return Vec::new();
        };
        let mut entries: Vec<(String, f64, u64)> = members
            .iter()
            .filter(|(_, (score, _))| *score <= max_score)
            .map(|(member, (score, seq))| (member.clone(), *score, *seq))
            .collect();
        sort_by_score_then_sequence(&mut entries);
        entries
            .into_iter()
            .map(|(member, score, _)| (member, score))
            .collect()
    }
}

/// Store kept entirely in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    offline: AtomicBool,
    failures_pending: AtomicUsize,
    latency_ms: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every call fails with `StoreError::Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Makes the next `count` calls fail with `StoreError::Unavailable`.
    pub fn fail_next(&self, count: usize) {
        self.failures_pending.store(count, Ordering::SeqCst);
    }

    /// Delays every subsequent call by `latency` before it touches any state.
    pub fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(ms, Ordering::SeqCst);
    }

    async fn lock(&self, key: &str) -> Result<MutexGuard<'_, Inner>, StoreError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".to_string()));
        }
        let injected = self
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.purge_if_expired(key);
        Ok(inner)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.lock("").await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let inner = self.lock(key).await?;
        Ok(inner.strings.get(key).cloned())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock(key).await?;
        if inner.strings.contains_key(key) {
            return Ok(false);
        }
        inner.strings.insert(key.to_string(), value.to_string());
        inner.expiries.insert(key.to_string(), Instant::now() + ttl);
        Ok(true)
    }

    async fn expire_if_equals(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock(key).await?;
        if inner.strings.get(key).map(String::as_str) != Some(value) {
            return Ok(false);
        }
        inner.expiries.insert(key.to_string(), Instant::now() + ttl);
        Ok(true)
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock(key).await?;
        if inner.strings.get(key).map(String::as_str) != Some(value) {
            return Ok(false);
        }
        Ok(inner.remove_key(key))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock(key).await?;
        Ok(inner.remove_key(key))
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError> {
        let mut inner = self.lock(key).await?;
        let hash = inner.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hash_create(
        &self,
        key: &str,
        fields: &[(String, String)],
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock(key).await?;
        if inner.hashes.get(key).is_some_and(|h| !h.is_empty()) {
            return Ok(false);
        }
        inner.hashes.insert(key.to_string(), fields.iter().cloned().collect());
        Ok(true)
    }

    async fn hash_get_all(
        &self,
        key: &str,
    ) -> Result<Option<HashMap<String, String>>, StoreError> {
        let inner = self.lock(key).await?;
        Ok(inner.hashes.get(key).filter(|h| !h.is_empty()).cloned())
    }

    async fn hash_compare_and_set(
        &self,
        key: &str,
        field: &str,
        expected: &[String],
        updates: &[(String, String)],
        expiry: KeyExpiry,
    ) -> Result<CasOutcome, StoreError> {
        let mut inner = self.lock(key).await?;
        let Some(hash) = inner.hashes.get_mut(key) else {
            return Ok(CasOutcome::Missing);
        };
        let Some(current) = hash.get(field).cloned() else {
            return Ok(CasOutcome::Missing);
        };
        if !expected.contains(&current) {
            return Ok(CasOutcome::Mismatch { current });
        }

        for (name, value) in updates {
            hash.insert(name.clone(), value.clone());
        }
        match expiry {
            KeyExpiry::Keep => {}
            KeyExpiry::After(ttl) if ttl.is_zero() => {
                inner.remove_key(key);
            }
            KeyExpiry::After(ttl) => {
                inner.expiries.insert(key.to_string(), Instant::now() + ttl);
            }
        }
        Ok(CasOutcome::Applied { previous: current })
    }

    async fn ordered_insert(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let mut inner = self.lock(key).await?;
        let seq = inner.next_sequence();
        inner
            .ordered
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), (score, seq));
        Ok(())
    }

    async fn ordered_insert_guarded(
        &self,
        key: &str,
        member: &str,
        score: f64,
        guard: FieldGuard<'_>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock(key).await?;
        inner.purge_if_expired(guard.key);
        let holds = inner
            .hashes
            .get(guard.key)
            .and_then(|hash| hash.get(guard.field))
            .is_some_and(|value| value == guard.value);
        if !holds {
            return Ok(false);
        }

        let seq = inner.next_sequence();
        inner
            .ordered
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), (score, seq));
        Ok(true)
    }

    async fn ordered_range(
        &self,
        key: &str,
        max_score: f64,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        let inner = self.lock(key).await?;
        Ok(inner.sorted_range(key, max_score))
    }

    async fn ordered_all(&self, key: &str) -> Result<Vec<(String, f64)>, StoreError> {
        let inner = self.lock(key).await?;
        Ok(inner.sorted_range(key, f64::INFINITY))
    }

    async fn ordered_score(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError> {
        let inner = self.lock(key).await?;
        Ok(inner
            .ordered
            .get(key)
            .and_then(|members| members.get(member))
            .map(|(score, _)| *score))
    }

    async fn ordered_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock(key).await?;
        let removed = inner
            .ordered
            .get_mut(key)
            .and_then(|members| members.remove(member))
            .is_some();
        if inner.ordered.get(key).is_some_and(|m| m.is_empty()) {
            inner.ordered.remove(key);
        }
        Ok(removed)
    }

    async fn ordered_len(&self, key: &str) -> Result<usize, StoreError> {
        let inner = self.lock(key).await?;
        Ok(inner.ordered.get(key).map_or(0, |m| m.len()))
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.lock(key).await?;
        inner
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        Ok(())
    }

    async fn list_remove(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        let mut inner = self.lock(key).await?;
        let Some(list) = inner.lists.get_mut(key) else {
            return Ok(0);
        };
        let before = list.len();
        list.retain(|item| item != value);
        Ok(before - list.len())
    }

    async fn list_range(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.lock(key).await?;
        Ok(inner
            .lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        let inner = self.lock(key).await?;
        Ok(inner.lists.get(key).map_or(0, |list| list.len()))
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut inner = self.lock(key).await?;
        inner
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.lock(key).await?;
        Ok(inner
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }
}
