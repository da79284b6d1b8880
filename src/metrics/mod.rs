//! Prometheus metrics for the scheduler.
//!
//! # Example
//!
//! ```ignore
//! use deferq::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! let collector = MetricsCollector::new();
//! collector.record_promotion("default", 0.3);
//! let text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;
pub mod server;

pub use collectors::{LockEvent, MetricsCollector};
pub use prometheus::{export_metrics, init_metrics, metrics_handler};
