//! Job record persistence.

use std::sync::Arc;

use crate::error::JobError;
use crate::store::Store;

use super::record::JobRecord;

/// Reads and writes job records as hashes under a key prefix.
#[derive(Clone)]
pub struct JobRepository {
    store: Arc<dyn Store>,
    prefix: String,
}

impl JobRepository {
    pub fn new(store: Arc<dyn Store>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    /// Store key of a job record.
    pub fn key(&self, job_id: &str) -> String {
        format!("{}{}", self.prefix, job_id)
    }

    /// Writes a new record in a single conditional hash write.
    ///
    /// # Errors
    ///
    /// `JobError::AlreadyExists` if a record with this id is already stored,
    /// whatever its status. The stored record is left untouched.
    pub async fn create(&self, record: &JobRecord) -> Result<(), JobError> {
        let fields = record.to_fields()?;
        if !self.store.hash_create(&self.key(&record.id), &fields).await? {
            return Err(JobError::AlreadyExists(record.id.clone()));
        }
        Ok(())
    }

    /// Loads a record.
    ///
    /// # Errors
    ///
    /// - `JobError::NotFound` if no record exists (never created, or expired)
    /// - `JobError::Deserialization` if the stored fields are unreadable
    pub async fn load(&self, job_id: &str) -> Result<JobRecord, JobError> {
        let fields = self
            .store
            .hash_get_all(&self.key(job_id))
            .await?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
        JobRecord::from_fields(job_id, &fields)
    }

    /// Like [`load`](Self::load) but maps a missing record to `None`.
    pub async fn find(&self, job_id: &str) -> Result<Option<JobRecord>, JobError> {
        match self.load(job_id).await {
            Ok(record) => Ok(Some(record)),
            Err(JobError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn delete(&self, job_id: &str) -> Result<bool, JobError> {
        Ok(self.store.delete(&self.key(job_id)).await?)
    }

    pub(crate) fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }
}
