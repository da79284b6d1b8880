//! Time-ordered index of scheduled jobs.
//!
//! Each entry maps a job id to its due time. Entries due at the same instant
//! come back in the order they were registered.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::store::{FieldGuard, Store};

/// One registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueEntry {
    pub job_id: String,
    pub due_at: DateTime<Utc>,
}

/// Entries returned by a single [`Registry::due`] poll.
///
/// Finite and consumed once; callers poll again for later entries.
#[derive(Debug)]
pub struct DueJobs {
    entries: std::vec::IntoIter<DueEntry>,
}

impl DueJobs {
    fn new(entries: Vec<DueEntry>) -> Self {
        Self {
            entries: entries.into_iter(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.len() == 0
    }
}

impl Iterator for DueJobs {
    type Item = DueEntry;

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.entries.size_hint()
    }
}

impl ExactSizeIterator for DueJobs {}

#[async_trait]
pub trait Registry: Send + Sync {
    /// Inserts `job_id`, or moves it to `due_at` if already present.
    async fn add(&self, job_id: &str, due_at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Like [`add`](Self::add), but only while `guard` holds. Returns whether
    /// the entry was written.
    async fn add_guarded(
        &self,
        job_id: &str,
        due_at: DateTime<Utc>,
        guard: FieldGuard<'_>,
    ) -> Result<bool, StoreError>;

    /// Entries due at or before `now`, earliest first.
    async fn due(&self, now: DateTime<Utc>) -> Result<DueJobs, StoreError>;

    /// Removes `job_id`. Returns `false` if it was not registered.
    async fn remove(&self, job_id: &str) -> Result<bool, StoreError>;

    /// Every entry, earliest first.
    async fn entries(&self) -> Result<Vec<DueEntry>, StoreError>;

    async fn due_at(&self, job_id: &str) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn count(&self) -> Result<usize, StoreError>;
}

/// Registry stored as an ordered index scored by due time in epoch millis.
#[derive(Clone)]
pub struct StoreRegistry {
    store: Arc<dyn Store>,
    key: String,
}

impl StoreRegistry {
    pub fn new(store: Arc<dyn Store>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

fn to_score(ts: DateTime<Utc>) -> f64 {
    ts.timestamp_millis() as f64
}

fn from_score(score: f64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(score as i64).unwrap_or_default()
}

fn to_entries(raw: Vec<(String, f64)>) -> Vec<DueEntry> {
    raw.into_iter()
        .map(|(job_id, score)| DueEntry {
            job_id,
            due_at: from_score(score),
        })
        .collect()
}

#[async_trait]
impl Registry for StoreRegistry {
    async fn add(&self, job_id: &str, due_at: DateTime<Utc>) -> Result<(), StoreError> {
        self.store
            .ordered_insert(&self.key, job_id, to_score(due_at))
            .await
    }

    async fn add_guarded(
        &self,
        job_id: &str,
        due_at: DateTime<Utc>,
        guard: FieldGuard<'_>,
    ) -> Result<bool, StoreError> {
        self.store
            .ordered_insert_guarded(&self.key, job_id, to_score(due_at), guard)
            .await
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<DueJobs, StoreError> {
        let raw = self.store.ordered_range(&self.key, to_score(now)).await?;
        let entries = to_entries(raw)
            .into_iter()
            .filter(|entry| entry.due_at <= now)
            .collect();
        Ok(DueJobs::new(entries))
    }

    async fn remove(&self, job_id: &str) -> Result<bool, StoreError> {
        self.store.ordered_remove(&self.key, job_id).await
    }

    async fn entries(&self) -> Result<Vec<DueEntry>, StoreError> {
        Ok(to_entries(self.store.ordered_all(&self.key).await?))
    }

    async fn due_at(&self, job_id: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .store
            .ordered_score(&self.key, job_id)
            .await?
            .map(from_score))
    }

    async fn count(&self) -> Result<usize, StoreError> {
        self.store.ordered_len(&self.key).await
    }
}
