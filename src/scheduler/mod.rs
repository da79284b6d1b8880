//! Deferred job scheduling.
//!
//! - **Scheduler**: submission and control façade (schedule, cancel, requeue)
//! - **SchedulerLoop**: lease-holding loop that promotes due jobs
//! - **Components**: the store-backed collaborators both of them share
//!
//! # Architecture
//!
//! ```text
//!   schedule()          ┌────────────────────┐
//!  ─────────────────────►  registry (zset)   │
//!                       └─────────┬──────────┘
//!                                 │ due(now)
//!   ┌──────────────┐     ┌────────▼──────────┐      ┌─────────────────┐
//!   │ lease (SET NX├─────► SchedulerLoop     ├──────► rq:queue:{name} │──► workers
//!   └──────────────┘     │ (one active)      │      └─────────────────┘
//!                        └───────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use deferq::config::SchedulerConfig;
//! use deferq::job::{CallableRef, JobOptions};
//! use deferq::scheduler::{Scheduler, SchedulerLoop};
//! use deferq::store::RedisStore;
//!
//! let config = SchedulerConfig::from_env()?;
//! let store = Arc::new(RedisStore::connect(&config.redis_url).await?);
//! let scheduler = Scheduler::from_store(store.clone(), &config);
//!
//! let job_id = scheduler
//!     .enqueue_in(Duration::from_secs(30), CallableRef::new("app.jobs.sleep"), JobOptions::new())
//!     .await?;
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
//! let runner = SchedulerLoop::from_store(store, &config);
//! tokio::spawn(async move { runner.run(shutdown_rx).await });
//! ```

pub mod backoff;
pub mod client;
pub mod runner;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

pub use backoff::Backoff;
pub use client::{ControlOutcome, RequeueOutcome, ScheduledJob, Scheduler};
pub use runner::{LoopPhase, PromotionReport, SchedulerLoop};

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::job::{JobRecord, JobRepository, JobStatus};
use crate::lock::{LockManager, StoreLockManager};
use crate::queue::ExecutionQueue;
use crate::registry::{Registry, StoreRegistry};
use crate::state::{StateMachine, StoreStateMachine};
use crate::store::Store;

/// Store-backed collaborators shared by the façade and the loop.
///
/// Each capability sits behind a trait so deployments can swap one
/// implementation without touching the others.
#[derive(Clone)]
pub struct Components {
    pub jobs: JobRepository,
    pub registry: Arc<dyn Registry>,
    pub states: Arc<dyn StateMachine>,
    pub queues: ExecutionQueue,
    pub locks: Arc<dyn LockManager>,
}

impl Components {
    /// Wires the default implementations over one store handle.
    pub fn from_store(store: Arc<dyn Store>, config: &SchedulerConfig) -> Self {
        let jobs = JobRepository::new(store.clone(), config.job_key_prefix.clone());
        Self {
            registry: Arc::new(StoreRegistry::new(store.clone(), config.jobs_key.clone())),
            states: Arc::new(StoreStateMachine::new(jobs.clone())),
            queues: ExecutionQueue::new(store.clone(), config.queue_key_prefix.clone()),
            locks: Arc::new(StoreLockManager::new(store)),
            jobs,
        }
    }

    /// Moves a scheduled job into its execution queue.
    ///
    /// The status flips first, then the id is pushed, then the registry
    /// entry goes. A crash part way leaves either a still-scheduled job or a
    /// stale entry that the next scan removes.
    pub(crate) async fn promote(&self, record: &JobRecord) -> Result<JobStatus, SchedulerError> {
        let previous = self.states.promote(&record.id).await?;
        self.queues.push(&record.origin, &record.id).await?;
        self.registry.remove(&record.id).await?;
        Ok(previous)
    }
}

/// Absolute time `delay` from now, saturating at the latest representable time.
pub fn run_at_after(delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| Utc::now().checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_at_after() {
        let before = Utc::now();
        let at = run_at_after(Duration::from_secs(30));
        assert!(at >= before + chrono::Duration::seconds(30));
        assert!(at <= Utc::now() + chrono::Duration::seconds(31));
    }

    #[test]
    fn test_run_at_after_saturates() {
        assert_eq!(run_at_after(Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }
}
