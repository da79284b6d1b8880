//! Execution queues.
//!
//! An execution queue is a list of job ids under `{prefix}{name}` that
//! external workers pop from. Every queue that has received a job is also
//! recorded in a set of known queues so workers can discover it.
//!
//! # Key Structure
//!
//! With the default prefix `rq:queue:`:
//!
//! - `rq:queue:{name}`: job ids, oldest first
//! - `rq:queues`: keys of every known queue

use std::sync::Arc;

use crate::error::StoreError;
use crate::store::Store;

/// Producer side of the execution queues.
#[derive(Clone)]
pub struct ExecutionQueue {
    store: Arc<dyn Store>,
    prefix: String,
    known_queues_key: String,
}

impl ExecutionQueue {
    pub fn new(store: Arc<dyn Store>, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let known_queues_key = format!("{}s", prefix.trim_end_matches(':'));
        Self {
            store,
            prefix,
            known_queues_key,
        }
    }

    /// Store key of the queue called `name`.
    pub fn key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    pub fn known_queues_key(&self) -> &str {
        &self.known_queues_key
    }

    /// Appends `job_id` to the tail of queue `name`.
    pub async fn push(&self, name: &str, job_id: &str) -> Result<(), StoreError> {
        let key = self.key(name);
        self.store.list_push(&key, job_id).await?;
        self.store.set_add(&self.known_queues_key, &key).await?;
        tracing::debug!(queue = %name, job_id = %job_id, "Job pushed to queue");
        Ok(())
    }

    /// Removes every occurrence of `job_id` from queue `name`.
    pub async fn remove(&self, name: &str, job_id: &str) -> Result<usize, StoreError> {
        self.store.list_remove(&self.key(name), job_id).await
    }

    pub async fn len(&self, name: &str) -> Result<usize, StoreError> {
        self.store.list_len(&self.key(name)).await
    }

    pub async fn is_empty(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.len(name).await? == 0)
    }

    /// Job ids in queue `name`, head first.
    pub async fn job_ids(&self, name: &str) -> Result<Vec<String>, StoreError> {
        self.store.list_range(&self.key(name)).await
    }

    /// Drops every job id from queue `name`. The job records are untouched.
    pub async fn clear(&self, name: &str) -> Result<usize, StoreError> {
        let key = self.key(name);
        let count = self.store.list_len(&key).await?;
        self.store.delete(&key).await?;
        Ok(count)
    }

    /// Names of every queue that has received a job, sorted.
    pub async fn queues(&self) -> Result<Vec<String>, StoreError> {
        let mut names: Vec<String> = self
            .store
            .set_members(&self.known_queues_key)
            .await?
            .into_iter()
            .filter_map(|key| key.strip_prefix(&self.prefix).map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }
}
