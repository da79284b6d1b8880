//! Job status transitions.
//!
//! Legal transitions:
//!
//! ```text
//! scheduled -> queued -> started -> finished | failed | stopped
//!     \           \
//!      +-----------+--> cancelled
//! ```
//!
//! Nothing ever returns to `scheduled` and terminal statuses accept no
//! further writes. The current-status check and the write happen in one
//! conditional store update, so competing writers cannot interleave.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use crate::error::JobError;
use crate::job::record::{format_time, retention_field, status_field, timestamp_field};
use crate::job::{JobRepository, JobStatus};
use crate::metrics::MetricsCollector;
use crate::store::{CasOutcome, KeyExpiry};

/// Table of legal status transitions.
#[derive(Debug, Clone)]
pub struct TransitionTable {
    valid_transitions: HashMap<JobStatus, Vec<JobStatus>>,
}

impl TransitionTable {
    pub fn new() -> Self {
        let mut valid_transitions = HashMap::new();

        valid_transitions.insert(
            JobStatus::Scheduled,
            vec![JobStatus::Queued, JobStatus::Cancelled],
        );

        valid_transitions.insert(
            JobStatus::Queued,
            vec![JobStatus::Started, JobStatus::Cancelled],
        );

        valid_transitions.insert(
            JobStatus::Started,
            vec![JobStatus::Finished, JobStatus::Failed, JobStatus::Stopped],
        );

        for terminal in JobStatus::ALL.into_iter().filter(JobStatus::is_terminal) {
            valid_transitions.insert(terminal, vec![]);
        }

        Self { valid_transitions }
    }

    pub fn can_transition(&self, from: JobStatus, to: JobStatus) -> bool {
        self.valid_transitions
            .get(&from)
            .map(|targets| targets.contains(&to))
            .unwrap_or(false)
    }

    pub fn targets(&self, from: JobStatus) -> &[JobStatus] {
        self.valid_transitions
            .get(&from)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The members of `from` that may legally move to `to`.
    pub fn legal_sources(&self, from: &[JobStatus], to: JobStatus) -> Vec<JobStatus> {
        from.iter()
            .copied()
            .filter(|status| self.can_transition(*status, to))
            .collect()
    }
}

impl Default for TransitionTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Moves jobs between statuses.
#[async_trait]
pub trait StateMachine: Send + Sync {
    /// Moves `job_id` to `to` if its stored status is one of `from`.
    ///
    /// Returns the status the job held before the write.
    ///
    /// # Errors
    ///
    /// - `JobError::IllegalTransition` if the stored status is outside `from`,
    ///   or the move is not in the transition table
    /// - `JobError::NotFound` if the job record does not exist
    async fn transition(
        &self,
        job_id: &str,
        from: &[JobStatus],
        to: JobStatus,
    ) -> Result<JobStatus, JobError>;

    /// `scheduled -> queued`
    async fn promote(&self, job_id: &str) -> Result<JobStatus, JobError> {
        self.transition(job_id, &[JobStatus::Scheduled], JobStatus::Queued)
            .await
    }

    /// `queued -> started`
    async fn start(&self, job_id: &str) -> Result<JobStatus, JobError> {
        self.transition(job_id, &[JobStatus::Queued], JobStatus::Started)
            .await
    }

    async fn finish(&self, job_id: &str) -> Result<JobStatus, JobError> {
        self.transition(job_id, &[JobStatus::Started], JobStatus::Finished)
            .await
    }

    async fn fail(&self, job_id: &str) -> Result<JobStatus, JobError> {
        self.transition(job_id, &[JobStatus::Started], JobStatus::Failed)
            .await
    }

    /// `started -> stopped`, an externally requested interruption.
    async fn stop(&self, job_id: &str) -> Result<JobStatus, JobError> {
        self.transition(job_id, &[JobStatus::Started], JobStatus::Stopped)
            .await
    }

    /// `scheduled | queued -> cancelled`
    async fn cancel(&self, job_id: &str) -> Result<JobStatus, JobError> {
        self.transition(
            job_id,
            &[JobStatus::Scheduled, JobStatus::Queued],
            JobStatus::Cancelled,
        )
        .await
    }
}

/// State machine writing through conditional hash updates on job records.
#[derive(Clone)]
pub struct StoreStateMachine {
    jobs: JobRepository,
    table: TransitionTable,
    metrics: MetricsCollector,
}

impl StoreStateMachine {
    pub fn new(jobs: JobRepository) -> Self {
        Self {
            jobs,
            table: TransitionTable::new(),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn table(&self) -> &TransitionTable {
        &self.table
    }

    /// Expiry applied when a job enters `to`, taken from the record's own
    /// retention settings.
    async fn expiry_for(&self, job_id: &str, to: JobStatus) -> Result<KeyExpiry, JobError> {
        if retention_field(to).is_none() {
            return Ok(KeyExpiry::Keep);
        }

        let record = self.jobs.load(job_id).await?;
        Ok(record
            .retention_for(to)
            .map_or(KeyExpiry::Keep, KeyExpiry::After))
    }
}

#[async_trait]
impl StateMachine for StoreStateMachine {
    async fn transition(
        &self,
        job_id: &str,
        from: &[JobStatus],
        to: JobStatus,
    ) -> Result<JobStatus, JobError> {
        // Sources the table rejects are dropped from the guard, so the store
        // reports the actual status when nothing legal remains.
        let expected: Vec<String> = self
            .table
            .legal_sources(from, to)
            .into_iter()
            .map(|status| status.to_string())
            .collect();

        let expiry = self.expiry_for(job_id, to).await?;

        let mut updates = vec![(status_field().to_string(), to.to_string())];
        if let Some(field) = timestamp_field(to) {
            updates.push((field.to_string(), format_time(&Utc::now())));
        }

        let outcome = self
            .jobs
            .store()
            .hash_compare_and_set(&self.jobs.key(job_id), status_field(), &expected, &updates, expiry)
            .await?;

        let parse = |raw: String| -> Result<JobStatus, JobError> {
            raw.parse().map_err(|reason| JobError::Deserialization {
                job_id: job_id.to_string(),
                reason,
            })
        };

        match outcome {
            CasOutcome::Applied { previous } => {
                let previous = parse(previous)?;
                self.metrics.record_transition(previous, to);
                debug!(job_id = %job_id, from = %previous, to = %to, "Job status changed");
                Ok(previous)
            }
            CasOutcome::Mismatch { current } => Err(JobError::IllegalTransition {
                job_id: job_id.to_string(),
                from: parse(current)?,
                to,
            }),
            CasOutcome::Missing => Err(JobError::NotFound(job_id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{CallableRef, JobDefaults, JobRecord};
    use crate::store::{MemoryStore, Store};
    use std::sync::Arc;
    use std::time::Duration;

    fn defaults() -> JobDefaults {
        JobDefaults {
            queue: "default".to_string(),
            timeout: Duration::from_secs(180),
            result_ttl: Some(Duration::from_secs(500)),
            failure_ttl: None,
        }
    }

    async fn setup(status: JobStatus) -> (Arc<MemoryStore>, StoreStateMachine, JobRecord) {
        let store = Arc::new(MemoryStore::new());
        let jobs = JobRepository::new(store.clone(), "rq:job:");
        let mut record = JobRecord::new(CallableRef::new("app.jobs.sleep"), &defaults());
        record.status = status;
        jobs.create(&record).await.expect("create");
        (store, StoreStateMachine::new(jobs.clone()), record)
    }

    #[test]
    fn test_transition_table() {
        let table = TransitionTable::new();

        assert!(table.can_transition(JobStatus::Scheduled, JobStatus::Queued));
        assert!(table.can_transition(JobStatus::Queued, JobStatus::Started));
        assert!(table.can_transition(JobStatus::Started, JobStatus::Stopped));
        assert!(table.can_transition(JobStatus::Queued, JobStatus::Cancelled));

        assert!(!table.can_transition(JobStatus::Queued, JobStatus::Scheduled));
        assert!(!table.can_transition(JobStatus::Started, JobStatus::Cancelled));
        assert!(!table.can_transition(JobStatus::Scheduled, JobStatus::Started));
    }

    #[test]
    fn test_nothing_returns_to_scheduled() {
        let table = TransitionTable::new();
        for from in JobStatus::ALL {
            assert!(!table.can_transition(from, JobStatus::Scheduled));
        }
    }

    #[test]
    fn test_terminal_has_no_targets() {
        let table = TransitionTable::new();
        for status in JobStatus::ALL.into_iter().filter(JobStatus::is_terminal) {
            assert!(table.targets(status).is_empty());
        }
    }

    #[tokio::test]
    async fn test_promote_stamps_enqueued_at() {
        let (_, machine, record) = setup(JobStatus::Scheduled).await;

        let previous = machine.promote(&record.id).await.expect("promote");
        assert_eq!(previous, JobStatus::Scheduled);

        let loaded = machine.jobs.load(&record.id).await.expect("load");
        assert_eq!(loaded.status, JobStatus::Queued);
        assert!(loaded.enqueued_at.is_some());
    }

    #[tokio::test]
    async fn test_second_promotion_is_illegal() {
        let (_, machine, record) = setup(JobStatus::Scheduled).await;
        machine.promote(&record.id).await.expect("first promotion");

        let err = machine.promote(&record.id).await.expect_err("already queued");
        assert!(matches!(
            err,
            JobError::IllegalTransition {
                from: JobStatus::Queued,
                to: JobStatus::Queued,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_regression_to_scheduled_rejected() {
        let (_, machine, record) = setup(JobStatus::Queued).await;

        let err = machine
            .transition(&record.id, &[JobStatus::Queued], JobStatus::Scheduled)
            .await
            .expect_err("regression");
        assert!(matches!(
            err,
            JobError::IllegalTransition {
                from: JobStatus::Queued,
                to: JobStatus::Scheduled,
                ..
            }
        ));
        let loaded = machine.jobs.load(&record.id).await.expect("load");
        assert_eq!(loaded.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_terminal_is_final() {
        let (_, machine, record) = setup(JobStatus::Finished).await;

        for to in JobStatus::ALL {
            let err = machine
                .transition(&record.id, &JobStatus::ALL, to)
                .await
                .expect_err("terminal");
            assert!(matches!(err, JobError::IllegalTransition { .. }));
        }
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let (_, machine, record) = setup(JobStatus::Scheduled).await;

        machine.promote(&record.id).await.expect("promote");
        machine.start(&record.id).await.expect("start");
        machine.fail(&record.id).await.expect("fail");

        let loaded = machine.jobs.load(&record.id).await.expect("load");
        assert_eq!(loaded.status, JobStatus::Failed);
        assert!(loaded.started_at.is_some());
        assert!(loaded.ended_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_applies_result_ttl() {
        let (store, machine, record) = setup(JobStatus::Queued).await;

        machine.cancel(&record.id).await.expect("cancel");
        assert!(store
            .hash_get_all(&machine.jobs.key(&record.id))
            .await
            .expect("read")
            .is_some());

        tokio::time::advance(Duration::from_secs(501)).await;
        assert!(store
            .hash_get_all(&machine.jobs.key(&record.id))
            .await
            .expect("read")
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_failure_ttl_keeps_record() {
        let (store, machine, record) = setup(JobStatus::Started).await;

        machine.stop(&record.id).await.expect("stop");
        tokio::time::advance(Duration::from_secs(365 * 24 * 3600)).await;

        assert!(store
            .hash_get_all(&machine.jobs.key(&record.id))
            .await
            .expect("read")
            .is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_applies_record_failure_ttl() {
        let store = Arc::new(MemoryStore::new());
        let jobs = JobRepository::new(store.clone(), "rq:job:");
        let mut record = JobRecord::new(CallableRef::new("app.jobs.sleep"), &defaults());
        record.status = JobStatus::Started;
        record.failure_ttl = Some(Duration::from_secs(60));
        jobs.create(&record).await.expect("create");
        let machine = StoreStateMachine::new(jobs.clone());

        machine.fail(&record.id).await.expect("fail");
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(jobs.find(&record.id).await.expect("find").is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(jobs.find(&record.id).await.expect("find").is_none());
    }

    #[tokio::test]
    async fn test_missing_job() {
        let (_, machine, _) = setup(JobStatus::Scheduled).await;
        assert!(matches!(
            machine.promote("missing").await,
            Err(JobError::NotFound(_))
        ));
        assert!(matches!(
            machine.cancel("missing").await,
            Err(JobError::NotFound(_))
        ));
    }
}
