//! Submission and control façade.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{debug, info};

use super::{run_at_after, Components};
use crate::config::SchedulerConfig;
use crate::error::{JobError, SchedulerError};
use crate::job::record::status_field;
use crate::job::{CallableRef, JobDefaults, JobOptions, JobRecord, JobStatus};
use crate::queue::ExecutionQueue;
use crate::registry::{DueEntry, Registry};
use crate::state::StateMachine;
use crate::store::{FieldGuard, Store};

/// Result of a cancel or stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    Applied,
    /// The job had already left a state the request applies to.
    Unchanged { current: JobStatus },
}

impl ControlOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ControlOutcome::Applied)
    }
}

/// Result of a requeue request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequeueOutcome {
    /// A copy of a finished or failed job was enqueued under a new id.
    Enqueued { job_id: String },
    /// A scheduled job was promoted ahead of its due time.
    Promoted,
    Unchanged { current: JobStatus },
}

/// A registry entry with its job record, for listings.
#[derive(Debug)]
pub struct ScheduledJob {
    pub entry: DueEntry,
    /// `NotFound` for stale entries, `Deserialization` for unpromotable ones.
    pub record: Result<JobRecord, JobError>,
}

/// Schedules, inspects and controls jobs.
#[derive(Clone)]
pub struct Scheduler {
    components: Components,
    defaults: JobDefaults,
}

impl Scheduler {
    pub fn new(components: Components, config: &SchedulerConfig) -> Self {
        Self {
            components,
            defaults: JobDefaults::from(config),
        }
    }

    pub fn from_store(store: Arc<dyn Store>, config: &SchedulerConfig) -> Self {
        Self::new(Components::from_store(store, config), config)
    }

    pub fn defaults(&self) -> &JobDefaults {
        &self.defaults
    }

    pub fn components(&self) -> &Components {
        &self.components
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.components.registry
    }

    pub fn queues(&self) -> &ExecutionQueue {
        &self.components.queues
    }

    /// Creates a job that becomes due at `run_at`. Returns its id.
    pub async fn schedule(
        &self,
        callable: CallableRef,
        run_at: DateTime<Utc>,
        options: JobOptions,
    ) -> Result<String, SchedulerError> {
        let record = options.build(callable, &self.defaults);
        self.schedule_job(record, run_at).await
    }

    /// Registers a prepared record for `run_at`.
    ///
    /// The record is written before its registry entry so a scan never finds
    /// an entry without a record.
    ///
    /// # Errors
    ///
    /// `JobError::AlreadyExists` if the record's id is taken.
    pub async fn schedule_job(
        &self,
        mut record: JobRecord,
        run_at: DateTime<Utc>,
    ) -> Result<String, SchedulerError> {
        record.status = JobStatus::Scheduled;
        record.scheduled_on = Some(Utc::now());

        self.components.jobs.create(&record).await?;
        self.components.registry.add(&record.id, run_at).await?;

        info!(
            job_id = %record.id,
            queue = %record.origin,
            run_at = %run_at,
            "Job scheduled"
        );
        Ok(record.id)
    }

    /// Creates a job that becomes due after `delay`.
    pub async fn enqueue_in(
        &self,
        delay: Duration,
        callable: CallableRef,
        options: JobOptions,
    ) -> Result<String, SchedulerError> {
        self.schedule(callable, run_at_after(delay), options).await
    }

    /// Pushes a record straight onto its execution queue.
    ///
    /// # Errors
    ///
    /// `JobError::AlreadyExists` if the record's id is taken.
    pub async fn enqueue_now(&self, mut record: JobRecord) -> Result<String, SchedulerError> {
        record.status = JobStatus::Queued;
        record.enqueued_at = Some(Utc::now());

        self.components.jobs.create(&record).await?;
        self.components
            .queues
            .push(&record.origin, &record.id)
            .await?;

        info!(job_id = %record.id, queue = %record.origin, "Job enqueued");
        Ok(record.id)
    }

    /// Moves a scheduled job to a new due time.
    ///
    /// # Errors
    ///
    /// `JobError::IllegalTransition` if the job has already left `scheduled`.
    pub async fn reschedule(
        &self,
        job_id: &str,
        run_at: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let record_key = self.components.jobs.key(job_id);
        let guard = FieldGuard {
            key: &record_key,
            field: status_field(),
            value: JobStatus::Scheduled.as_str(),
        };
        if self
            .components
            .registry
            .add_guarded(job_id, run_at, guard)
            .await?
        {
            debug!(job_id = %job_id, run_at = %run_at, "Job rescheduled");
            return Ok(());
        }

        let record = self.components.jobs.load(job_id).await?;
        Err(JobError::IllegalTransition {
            job_id: job_id.to_string(),
            from: record.status,
            to: JobStatus::Scheduled,
        }
        .into())
    }

    /// Withdraws a scheduled or queued job.
    ///
    /// Removes its registry entry and its execution queue entry. A job that
    /// has already started or ended is left alone.
    pub async fn cancel(&self, job_id: &str) -> Result<ControlOutcome, SchedulerError> {
        let record = self.components.jobs.load(job_id).await?;

        match self.components.states.cancel(job_id).await {
            Ok(_) => {
                self.components.registry.remove(job_id).await?;
                self.components.queues.remove(&record.origin, job_id).await?;
                info!(job_id = %job_id, "Job cancelled");
                Ok(ControlOutcome::Applied)
            }
            Err(JobError::IllegalTransition { from, .. }) => {
                debug!(job_id = %job_id, status = %from, "Cancel ignored");
                Ok(ControlOutcome::Unchanged { current: from })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Marks a running job as stopped.
    ///
    /// Interrupting the worker process itself is up to the worker, which
    /// observes the status change.
    pub async fn stop(&self, job_id: &str) -> Result<ControlOutcome, SchedulerError> {
        match self.components.states.stop(job_id).await {
            Ok(_) => {
                info!(job_id = %job_id, "Job stopped");
                Ok(ControlOutcome::Applied)
            }
            Err(JobError::IllegalTransition { from, .. }) => {
                debug!(job_id = %job_id, status = %from, "Stop ignored");
                Ok(ControlOutcome::Unchanged { current: from })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Runs a job again.
    ///
    /// Finished and failed jobs are copied under a new id and enqueued now,
    /// with `meta.original_job` pointing at the old id. Scheduled jobs are
    /// promoted immediately. Other statuses are left alone.
    pub async fn requeue(&self, job_id: &str) -> Result<RequeueOutcome, SchedulerError> {
        let record = self.components.jobs.load(job_id).await?;

        match record.status {
            JobStatus::Finished | JobStatus::Failed => {
                let options = JobOptions {
                    queue: Some(record.origin.clone()),
                    timeout: Some(record.timeout),
                    result_ttl: Some(record.result_ttl),
                    failure_ttl: Some(record.failure_ttl),
                    description: Some(record.description.clone()),
                    meta: record.meta.clone(),
                    ..JobOptions::default()
                }
                .meta("original_job", serde_json::Value::from(job_id));

                let copy = options.build(record.callable.clone(), &self.defaults);
                let new_id = self.enqueue_now(copy).await?;
                info!(job_id = %job_id, new_job_id = %new_id, "Job requeued");
                Ok(RequeueOutcome::Enqueued { job_id: new_id })
            }
            JobStatus::Scheduled => match self.components.promote(&record).await {
                Ok(_) => {
                    info!(job_id = %job_id, queue = %record.origin, "Job promoted early");
                    Ok(RequeueOutcome::Promoted)
                }
                // The loop got there first.
                Err(SchedulerError::Job(JobError::IllegalTransition { from, .. })) => {
                    Ok(RequeueOutcome::Unchanged { current: from })
                }
                Err(e) => Err(e),
            },
            current => Ok(RequeueOutcome::Unchanged { current }),
        }
    }

    pub async fn fetch(&self, job_id: &str) -> Result<Option<JobRecord>, SchedulerError> {
        Ok(self.components.jobs.find(job_id).await?)
    }

    /// Every registry entry with its record, earliest first.
    pub async fn scheduled_jobs(&self) -> Result<Vec<ScheduledJob>, SchedulerError> {
        let entries = self.components.registry.entries().await?;
        let records = join_all(
            entries
                .iter()
                .map(|entry| self.components.jobs.load(&entry.job_id)),
        )
        .await;

        entries
            .into_iter()
            .zip(records)
            .map(|(entry, record)| match record {
                Err(JobError::Store(e)) => Err(e.into()),
                record => Ok(ScheduledJob { entry, record }),
            })
            .collect()
    }

    /// Removes a job from the registry and deletes its record.
    ///
    /// This is the administrative way out for unpromotable entries.
    pub async fn discard(&self, job_id: &str) -> Result<bool, SchedulerError> {
        let removed = self.components.registry.remove(job_id).await?;
        let deleted = self.components.jobs.delete(job_id).await?;
        if removed || deleted {
            info!(job_id = %job_id, "Job discarded");
        }
        Ok(removed || deleted)
    }

    /// Empties an execution queue. Returns how many job ids were dropped.
    pub async fn clear_queue(&self, name: &str) -> Result<usize, SchedulerError> {
        let count = self.components.queues.clear(name).await?;
        info!(queue = %name, count = count, "Queue cleared");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn scheduler() -> (Arc<MemoryStore>, Scheduler) {
        let store = Arc::new(MemoryStore::new());
        let scheduler = Scheduler::from_store(store.clone(), &SchedulerConfig::default());
        (store, scheduler)
    }

    fn sleep_job() -> CallableRef {
        CallableRef::new("app.jobs.sleep").with_args(vec![json!(1)])
    }

    #[tokio::test]
    async fn test_schedule_creates_record_and_entry() {
        let (_, scheduler) = scheduler();
        let run_at = Utc::now() + chrono::Duration::minutes(5);

        let id = scheduler
            .schedule(sleep_job(), run_at, JobOptions::new().queue("paper:default"))
            .await
            .expect("schedule");

        let record = scheduler.fetch(&id).await.expect("fetch").expect("exists");
        assert_eq!(record.status, JobStatus::Scheduled);
        assert_eq!(record.origin, "paper:default");
        assert!(record.scheduled_on.is_some());

        let due_at = scheduler
            .registry()
            .due_at(&id)
            .await
            .expect("due_at")
            .expect("registered");
        assert_eq!(due_at.timestamp_millis(), run_at.timestamp_millis());
    }

    #[tokio::test]
    async fn test_enqueue_now_pushes_to_queue() {
        let (_, scheduler) = scheduler();
        let record = JobOptions::new().build(sleep_job(), scheduler.defaults());

        let id = scheduler.enqueue_now(record).await.expect("enqueue");

        assert_eq!(
            scheduler.queues().job_ids("default").await.expect("range"),
            vec![id.clone()]
        );
        let record = scheduler.fetch(&id).await.expect("fetch").expect("exists");
        assert_eq!(record.status, JobStatus::Queued);
        assert!(record.enqueued_at.is_some());
    }

    #[tokio::test]
    async fn test_reschedule_only_while_scheduled() {
        let (_, scheduler) = scheduler();
        let id = scheduler
            .enqueue_in(Duration::from_secs(60), sleep_job(), JobOptions::new())
            .await
            .expect("schedule");

        let later = Utc::now() + chrono::Duration::hours(2);
        scheduler.reschedule(&id, later).await.expect("reschedule");
        let due_at = scheduler
            .registry()
            .due_at(&id)
            .await
            .expect("due_at")
            .expect("registered");
        assert_eq!(due_at.timestamp_millis(), later.timestamp_millis());

        scheduler.cancel(&id).await.expect("cancel");
        let err = scheduler.reschedule(&id, later).await.expect_err("cancelled");
        assert!(matches!(
            err,
            SchedulerError::Job(JobError::IllegalTransition {
                from: JobStatus::Cancelled,
                ..
            })
        ));
        assert_eq!(scheduler.registry().count().await.expect("count"), 0);

        assert!(matches!(
            scheduler.reschedule("missing", later).await,
            Err(SchedulerError::Job(JobError::NotFound(_)))
        ));
        assert_eq!(scheduler.registry().count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn test_reschedule_checks_status_at_write() {
        let (store, scheduler) = scheduler();
        let run_at = Utc::now() + chrono::Duration::minutes(5);
        let id = scheduler
            .schedule(sleep_job(), run_at, JobOptions::new())
            .await
            .expect("schedule");

        // Status moves on while the registry entry is still present, as it
        // does halfway through a promotion.
        store
            .hash_set(
                &scheduler.components().jobs.key(&id),
                &[("status".to_string(), "queued".to_string())],
            )
            .await
            .expect("status");

        let err = scheduler
            .reschedule(&id, Utc::now() + chrono::Duration::hours(2))
            .await
            .expect_err("no longer scheduled");
        assert!(matches!(
            err,
            SchedulerError::Job(JobError::IllegalTransition {
                from: JobStatus::Queued,
                ..
            })
        ));
        let due_at = scheduler
            .registry()
            .due_at(&id)
            .await
            .expect("due_at")
            .expect("registered");
        assert_eq!(due_at.timestamp_millis(), run_at.timestamp_millis());
    }

    #[tokio::test]
    async fn test_enqueue_now_refuses_taken_id() {
        let (_, scheduler) = scheduler();
        let first = JobOptions::new()
            .id("import")
            .build(sleep_job(), scheduler.defaults());
        scheduler.enqueue_now(first).await.expect("enqueue");

        let second = JobOptions::new()
            .id("import")
            .queue("other")
            .build(sleep_job(), scheduler.defaults());
        assert!(matches!(
            scheduler.enqueue_now(second).await,
            Err(SchedulerError::Job(JobError::AlreadyExists(_)))
        ));

        let record = scheduler.fetch("import").await.expect("fetch").expect("kept");
        assert_eq!(record.origin, "default");
        assert_eq!(
            scheduler.queues().job_ids("default").await.expect("range"),
            vec!["import".to_string()]
        );
        assert!(scheduler.queues().is_empty("other").await.expect("len"));
    }

    #[tokio::test]
    async fn test_cancel_scheduled_job() {
        let (_, scheduler) = scheduler();
        let id = scheduler
            .enqueue_in(Duration::from_secs(60), sleep_job(), JobOptions::new())
            .await
            .expect("schedule");

        assert_eq!(
            scheduler.cancel(&id).await.expect("cancel"),
            ControlOutcome::Applied
        );
        assert_eq!(scheduler.registry().count().await.expect("count"), 0);

        let record = scheduler.fetch(&id).await.expect("fetch").expect("kept");
        assert_eq!(record.status, JobStatus::Cancelled);
        assert!(record.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_cancel_queued_job_leaves_queue() {
        let (_, scheduler) = scheduler();
        let record = JobOptions::new().build(sleep_job(), scheduler.defaults());
        let id = scheduler.enqueue_now(record).await.expect("enqueue");

        assert!(scheduler.cancel(&id).await.expect("cancel").is_applied());
        assert!(scheduler
            .queues()
            .is_empty("default")
            .await
            .expect("len"));
    }

    #[tokio::test]
    async fn test_cancel_finished_is_noop() {
        let (_, scheduler) = scheduler();
        let record = JobOptions::new().build(sleep_job(), scheduler.defaults());
        let id = scheduler.enqueue_now(record).await.expect("enqueue");
        let states = &scheduler.components().states;
        states.start(&id).await.expect("start");
        states.finish(&id).await.expect("finish");

        assert_eq!(
            scheduler.cancel(&id).await.expect("no error"),
            ControlOutcome::Unchanged {
                current: JobStatus::Finished
            }
        );
    }

    #[tokio::test]
    async fn test_stop() {
        let (_, scheduler) = scheduler();
        let record = JobOptions::new().build(sleep_job(), scheduler.defaults());
        let id = scheduler.enqueue_now(record).await.expect("enqueue");

        assert_eq!(
            scheduler.stop(&id).await.expect("stop"),
            ControlOutcome::Unchanged {
                current: JobStatus::Queued
            }
        );

        scheduler
            .components()
            .states
            .start(&id)
            .await
            .expect("start");
        assert!(scheduler.stop(&id).await.expect("stop").is_applied());
        assert_eq!(
            scheduler.stop(&id).await.expect("stop again"),
            ControlOutcome::Unchanged {
                current: JobStatus::Stopped
            }
        );
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let (_, scheduler) = scheduler();
        assert!(scheduler.fetch("missing").await.expect("fetch").is_none());
        assert!(matches!(
            scheduler.cancel("missing").await,
            Err(SchedulerError::Job(JobError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_requeue_failed_job() {
        let (_, scheduler) = scheduler();
        let record = JobOptions::new()
            .timeout(Duration::from_secs(30))
            .build(sleep_job(), scheduler.defaults());
        let id = scheduler.enqueue_now(record).await.expect("enqueue");
        let states = &scheduler.components().states;
        states.start(&id).await.expect("start");
        states.fail(&id).await.expect("fail");

        let outcome = scheduler.requeue(&id).await.expect("requeue");
        let RequeueOutcome::Enqueued { job_id: new_id } = outcome else {
            panic!("expected a new job, got {:?}", outcome);
        };
        assert_ne!(new_id, id);

        let copy = scheduler.fetch(&new_id).await.expect("fetch").expect("exists");
        assert_eq!(copy.status, JobStatus::Queued);
        assert_eq!(copy.timeout, Duration::from_secs(30));
        assert_eq!(copy.meta.get("original_job"), Some(&json!(id)));
        assert!(copy.started_at.is_none());
    }

    #[tokio::test]
    async fn test_requeue_scheduled_job_promotes() {
        let (_, scheduler) = scheduler();
        let id = scheduler
            .enqueue_in(Duration::from_secs(3600), sleep_job(), JobOptions::new())
            .await
            .expect("schedule");

        assert_eq!(
            scheduler.requeue(&id).await.expect("requeue"),
            RequeueOutcome::Promoted
        );
        assert_eq!(scheduler.registry().count().await.expect("count"), 0);
        assert_eq!(
            scheduler.queues().job_ids("default").await.expect("range"),
            vec![id.clone()]
        );

        assert_eq!(
            scheduler.requeue(&id).await.expect("requeue"),
            RequeueOutcome::Unchanged {
                current: JobStatus::Queued
            }
        );
    }

    #[tokio::test]
    async fn test_scheduled_jobs_listing() {
        let (store, scheduler) = scheduler();
        let first = scheduler
            .enqueue_in(Duration::from_secs(10), sleep_job(), JobOptions::new())
            .await
            .expect("schedule");
        let second = scheduler
            .enqueue_in(Duration::from_secs(20), sleep_job(), JobOptions::new())
            .await
            .expect("schedule");
        store
            .hash_set(
                &scheduler.components().jobs.key(&second),
                &[("data".to_string(), "not json".to_string())],
            )
            .await
            .expect("corrupt");

        let listing = scheduler.scheduled_jobs().await.expect("list");
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0].entry.job_id, first);
        assert!(listing[0].record.is_ok());
        assert!(matches!(
            listing[1].record,
            Err(JobError::Deserialization { .. })
        ));
    }

    #[tokio::test]
    async fn test_discard() {
        let (_, scheduler) = scheduler();
        let id = scheduler
            .enqueue_in(Duration::from_secs(10), sleep_job(), JobOptions::new())
            .await
            .expect("schedule");

        assert!(scheduler.discard(&id).await.expect("discard"));
        assert!(!scheduler.discard(&id).await.expect("discard again"));
        assert!(scheduler.fetch(&id).await.expect("fetch").is_none());
    }

    #[tokio::test]
    async fn test_clear_queue() {
        let (_, scheduler) = scheduler();
        for _ in 0..3 {
            let record = JobOptions::new().build(sleep_job(), scheduler.defaults());
            scheduler.enqueue_now(record).await.expect("enqueue");
        }
        assert_eq!(scheduler.clear_queue("default").await.expect("clear"), 3);
        assert_eq!(scheduler.clear_queue("default").await.expect("clear"), 0);
    }
}
