//! Backing store abstraction.
//!
//! The store is the only state shared between scheduler instances, so every
//! mutating method here maps to a single atomic primitive on the server: a
//! plain command (`SET NX PX`, `HSET`, `RPUSH`) or a Lua script. No caller
//! ever reads a value and then writes it unconditionally.
//!
//! Two implementations are provided:
//!
//! - [`RedisStore`]: production backend on a `redis` connection manager
//! - [`MemoryStore`]: in-process backend with identical semantics, used by
//!   tests and single-process deployments

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Result of a conditional hash update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// The guarded field matched and the update was written.
    Applied { previous: String },
    /// The guarded field held a value outside the expected set.
    Mismatch { current: String },
    /// The hash or the guarded field does not exist.
    Missing,
}

/// Expiry applied to a hash as part of a conditional update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyExpiry {
    /// Leave any existing expiry untouched.
    Keep,
    /// Expire the key after the given duration. Zero deletes it immediately.
    After(Duration),
}

/// Condition on one hash field, checked atomically with the write it guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldGuard<'a> {
    pub key: &'a str,
    pub field: &'a str,
    pub value: &'a str,
}

/// Atomic primitives the scheduler needs from its backing store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Round-trips to the store.
    async fn ping(&self) -> Result<(), StoreError>;

    // Plain keys

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Sets `key` only if it is absent (or expired). Returns whether it was set.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    /// Resets the expiry of `key` only if it currently holds `value`.
    async fn expire_if_equals(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Deletes `key` only if it currently holds `value`.
    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError>;

    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    // Hashes

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError>;

    /// Writes `fields` only if `key` does not exist yet. Returns whether it was created.
    async fn hash_create(&self, key: &str, fields: &[(String, String)])
        -> Result<bool, StoreError>;

    /// Returns `None` when the hash does not exist.
    async fn hash_get_all(&self, key: &str)
        -> Result<Option<HashMap<String, String>>, StoreError>;

    /// Writes `updates` only if `field` currently holds one of `expected`.
    async fn hash_compare_and_set(
        &self,
        key: &str,
        field: &str,
        expected: &[String],
        updates: &[(String, String)],
        expiry: KeyExpiry,
    ) -> Result<CasOutcome, StoreError>;

    // Ordered index. Ties on score keep insertion order; re-inserting a
    // member updates its score and moves it behind existing ties.

    async fn ordered_insert(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError>;

    /// Like [`ordered_insert`](Self::ordered_insert), but only while `guard`
    /// holds. Returns whether the member was written.
    async fn ordered_insert_guarded(
        &self,
        key: &str,
        member: &str,
        score: f64,
        guard: FieldGuard<'_>,
    ) -> Result<bool, StoreError>;

    /// Members with score `<= max_score`, ascending.
    async fn ordered_range(
        &self,
        key: &str,
        max_score: f64,
    ) -> Result<Vec<(String, f64)>, StoreError>;

    async fn ordered_all(&self, key: &str) -> Result<Vec<(String, f64)>, StoreError>;

    async fn ordered_score(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError>;

    async fn ordered_remove(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn ordered_len(&self, key: &str) -> Result<usize, StoreError>;

    // Lists and sets

    async fn list_push(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Removes every occurrence of `value`. Returns how many were removed.
    async fn list_remove(&self, key: &str, value: &str) -> Result<usize, StoreError>;

    async fn list_range(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn list_len(&self, key: &str) -> Result<usize, StoreError>;

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;
}

/// Orders `(member, score, sequence)` triples by score, then insertion sequence.
pub(crate) fn sort_by_score_then_sequence(entries: &mut [(String, f64, u64)]) {
    entries.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.2.cmp(&b.2)));
}
