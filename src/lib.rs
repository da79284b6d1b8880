//! deferq: lease-coordinated promotion of deferred jobs.
//!
//! Jobs are registered with a due time in a shared store. Any number of
//! scheduler instances watch that registry, but only the one holding the
//! lease promotes due jobs into their execution queues, where external
//! workers pick them up.

pub mod cli;
pub mod config;
pub mod error;
pub mod job;
pub mod lock;
pub mod metrics;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod state;
pub mod store;

// Re-export commonly used types
pub use config::SchedulerConfig;
pub use error::{ConfigError, JobError, LockError, SchedulerError, StoreError};
pub use job::{CallableRef, JobFactory, JobOptions, JobRecord, JobStatus};
pub use scheduler::{ControlOutcome, Scheduler, SchedulerLoop};
