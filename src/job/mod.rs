//! Job records and their persistence.
//!
//! - `JobRecord`: identity, callable reference, timing parameters, status
//! - `JobStatus`: the seven lifecycle statuses
//! - `JobOptions`, `JobFactory`: per-job overrides and a function bound to them
//! - `JobRepository`: reads and writes records in the backing store

pub mod factory;
pub mod record;
pub mod repository;

pub use factory::{JobFactory, JobOptions};
pub use record::{CallableRef, JobDefaults, JobRecord, JobStatus};
pub use repository::JobRepository;
