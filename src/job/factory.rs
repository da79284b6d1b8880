//! Job factories.
//!
//! A `JobFactory` binds a function path to a queue and timing parameters once,
//! then stamps out job records for each call:
//!
//! ```rust,ignore
//! use deferq::job::JobFactory;
//! use serde_json::json;
//!
//! let sleep = JobFactory::new("app.jobs.sleep").queue("paper:default");
//! let job_id = sleep.schedule_in(&scheduler, vec![json!(5)], Duration::from_secs(30)).await?;
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::SchedulerError;
use crate::scheduler::{run_at_after, Scheduler};

use super::record::{CallableRef, JobDefaults, JobRecord};

/// Per-job overrides of the scheduler's defaults.
///
/// Unset options leave the defaults in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOptions {
    /// Explicit job id; a random one is generated otherwise.
    pub id: Option<String>,
    pub queue: Option<String>,
    pub timeout: Option<Duration>,
    /// Retention after success; `Some(None)` keeps finished records forever.
    pub result_ttl: Option<Option<Duration>>,
    /// Retention after failure; `Some(None)` keeps failed records forever.
    pub failure_ttl: Option<Option<Duration>>,
    pub description: Option<String>,
    pub meta: serde_json::Map<String, serde_json::Value>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn result_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.result_ttl = Some(ttl);
        self
    }

    pub fn failure_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.failure_ttl = Some(ttl);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    /// Builds a record for `callable` with these options over `defaults`.
    pub fn build(&self, callable: CallableRef, defaults: &JobDefaults) -> JobRecord {
        let mut record = JobRecord::new(callable, defaults);

        if let Some(id) = &self.id {
            record.id = id.clone();
        }
        if let Some(queue) = &self.queue {
            record.origin = queue.clone();
        }
        if let Some(timeout) = self.timeout {
            record.timeout = timeout;
        }
        if let Some(ttl) = self.result_ttl {
            record.result_ttl = ttl;
        }
        if let Some(ttl) = self.failure_ttl {
            record.failure_ttl = ttl;
        }
        if let Some(description) = &self.description {
            record.description = description.clone();
        }
        record.meta.extend(self.meta.clone());
        record
    }
}

/// Produces job records for one function with preset options.
///
/// Options left unset fall back to the scheduler's configured defaults.
#[derive(Debug, Clone, Default)]
pub struct JobFactory {
    func: String,
    options: JobOptions,
}

impl JobFactory {
    pub fn new(func: impl Into<String>) -> Self {
        Self {
            func: func.into(),
            options: JobOptions::default(),
        }
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.options = self.options.queue(queue);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options = self.options.timeout(timeout);
        self
    }

    /// Retention after success; `None` keeps finished records forever.
    pub fn result_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.options = self.options.result_ttl(ttl);
        self
    }

    /// Retention after failure; `None` keeps failed records forever.
    pub fn failure_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.options = self.options.failure_ttl(ttl);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.options = self.options.description(description);
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options = self.options.meta(key, value);
        self
    }

    pub fn func(&self) -> &str {
        &self.func
    }

    /// Builds a record for one call. The status is set by whoever submits it.
    pub fn build(
        &self,
        args: Vec<serde_json::Value>,
        kwargs: serde_json::Map<String, serde_json::Value>,
        defaults: &JobDefaults,
    ) -> JobRecord {
        let callable = CallableRef {
            func: self.func.clone(),
            args,
            kwargs,
        };
        self.options.build(callable, defaults)
    }

    /// Enqueues a call for immediate execution.
    pub async fn delay(
        &self,
        scheduler: &Scheduler,
        args: Vec<serde_json::Value>,
    ) -> Result<String, SchedulerError> {
        let record = self.build(args, serde_json::Map::new(), scheduler.defaults());
        scheduler.enqueue_now(record).await
    }

    /// Schedules a call for `run_at`.
    pub async fn schedule_at(
        &self,
        scheduler: &Scheduler,
        args: Vec<serde_json::Value>,
        run_at: DateTime<Utc>,
    ) -> Result<String, SchedulerError> {
        let record = self.build(args, serde_json::Map::new(), scheduler.defaults());
        scheduler.schedule_job(record, run_at).await
    }

    /// Schedules a call to run after `delay`.
    pub async fn schedule_in(
        &self,
        scheduler: &Scheduler,
        args: Vec<serde_json::Value>,
        delay: Duration,
    ) -> Result<String, SchedulerError> {
        self.schedule_at(scheduler, args, run_at_after(delay)).await
    }
}
