//! Prometheus metrics registration and export.
//!
//! All metrics live in a dedicated registry held in `OnceLock` statics, so
//! recording is a no-op until [`init_metrics`] has run.

use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramOpts, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all deferq metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Jobs promoted into an execution queue, labeled by queue.
pub static PROMOTIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Lease events (acquired, contended, renewed, lost, released), labeled by event.
pub static LOCK_EVENTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// 1 while this instance holds the scheduler lease.
pub static SCHEDULER_ACTIVE: OnceLock<IntGauge> = OnceLock::new();

/// Entries in the scheduled-job registry at the last scan.
pub static SCHEDULED_JOBS: OnceLock<Gauge> = OnceLock::new();

/// Scheduled jobs skipped because their record cannot be read.
pub static UNPROMOTABLE_JOBS: OnceLock<IntGauge> = OnceLock::new();

/// Failed store round trips, labeled by operation.
pub static STORE_ERRORS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Applied status transitions, labeled by source and target status.
pub static TRANSITIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Seconds between a job's due time and its promotion.
pub static PROMOTION_DELAY: OnceLock<Histogram> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Calling it again after a successful first call leaves the original
/// metrics in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if a metric definition is rejected.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let promotions_total = CounterVec::new(
        Opts::new("deferq_promotions_total", "Jobs promoted into execution queues"),
        &["queue"],
    )?;

    let lock_events_total = CounterVec::new(
        Opts::new("deferq_lock_events_total", "Scheduler lease events"),
        &["event"],
    )?;

    let scheduler_active = IntGauge::new(
        "deferq_scheduler_active",
        "Whether this instance holds the scheduler lease",
    )?;

    let scheduled_jobs = Gauge::new(
        "deferq_scheduled_jobs",
        "Entries in the scheduled-job registry",
    )?;

    let unpromotable_jobs = IntGauge::new(
        "deferq_unpromotable_jobs",
        "Scheduled jobs whose record cannot be deserialized",
    )?;

    let store_errors_total = CounterVec::new(
        Opts::new("deferq_store_errors_total", "Failed store operations"),
        &["operation"],
    )?;

    let transitions_total = CounterVec::new(
        Opts::new("deferq_transitions_total", "Applied job status transitions"),
        &["from", "to"],
    )?;

    let promotion_delay = Histogram::with_opts(
        HistogramOpts::new(
            "deferq_promotion_delay_seconds",
            "Delay between a job's due time and its promotion",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0]),
    )?;

    registry.register(Box::new(promotions_total.clone()))?;
    registry.register(Box::new(lock_events_total.clone()))?;
    registry.register(Box::new(scheduler_active.clone()))?;
    registry.register(Box::new(scheduled_jobs.clone()))?;
    registry.register(Box::new(unpromotable_jobs.clone()))?;
    registry.register(Box::new(store_errors_total.clone()))?;
    registry.register(Box::new(transitions_total.clone()))?;
    registry.register(Box::new(promotion_delay.clone()))?;

    // Already set means already initialized.
    let _ = REGISTRY.set(registry);
    let _ = PROMOTIONS_TOTAL.set(promotions_total);
    let _ = LOCK_EVENTS_TOTAL.set(lock_events_total);
    let _ = SCHEDULER_ACTIVE.set(scheduler_active);
    let _ = SCHEDULED_JOBS.set(scheduled_jobs);
    let _ = UNPROMOTABLE_JOBS.set(unpromotable_jobs);
    let _ = STORE_ERRORS_TOTAL.set(store_errors_total);
    let _ = TRANSITIONS_TOTAL.set(transitions_total);
    let _ = PROMOTION_DELAY.set(promotion_delay);

    tracing::info!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// HTTP handler for the /metrics endpoint.
pub async fn metrics_handler() -> String {
    export_metrics()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        assert!(result.is_ok() || REGISTRY.get().is_some());
        // Second call keeps the first registry.
        assert!(init_metrics().is_ok());
    }

    #[test]
    fn test_export_contains_metric_names() {
        let _ = init_metrics();
        if let Some(active) = SCHEDULER_ACTIVE.get() {
            active.set(1);
        }

        let text = export_metrics();
        assert!(!text.starts_with("# Error"));
        assert!(text.contains("deferq_scheduler_active"));
    }
}
