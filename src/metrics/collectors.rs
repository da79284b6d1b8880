//! High-level recording interface over the raw Prometheus metrics.

use super::prometheus::{
    LOCK_EVENTS_TOTAL, PROMOTIONS_TOTAL, PROMOTION_DELAY, SCHEDULED_JOBS, SCHEDULER_ACTIVE,
    STORE_ERRORS_TOTAL, TRANSITIONS_TOTAL, UNPROMOTABLE_JOBS,
};
use crate::job::JobStatus;

/// Lease lifecycle events counted by `deferq_lock_events_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockEvent {
    Acquired,
    /// Another instance holds the lease.
    Contended,
    Renewed,
    /// Renewal found a foreign token.
    Lost,
    Released,
}

impl LockEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockEvent::Acquired => "acquired",
            LockEvent::Contended => "contended",
            LockEvent::Renewed => "renewed",
            LockEvent::Lost => "lost",
            LockEvent::Released => "released",
        }
    }
}

/// Records scheduler metrics.
///
/// Every method is a no-op until `init_metrics()` has been called.
///
/// # Example
///
/// ```ignore
/// use deferq::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_promotion("default", 0.4);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record one promotion and how late it was relative to the due time.
    pub fn record_promotion(&self, queue: &str, delay_secs: f64) {
        if let Some(promotions) = PROMOTIONS_TOTAL.get() {
            promotions.with_label_values(&[queue]).inc();
        }

        if let Some(delay) = PROMOTION_DELAY.get() {
            delay.observe(delay_secs.max(0.0));
        }

        tracing::trace!(queue = queue, delay_secs = delay_secs, "Recorded promotion");
    }

    pub fn record_lock_event(&self, event: LockEvent) {
        if let Some(events) = LOCK_EVENTS_TOTAL.get() {
            events.with_label_values(&[event.as_str()]).inc();
        }
    }

    pub fn set_active(&self, active: bool) {
        if let Some(gauge) = SCHEDULER_ACTIVE.get() {
            gauge.set(i64::from(active));
        }
    }

    pub fn set_scheduled_jobs(&self, count: usize) {
        if let Some(gauge) = SCHEDULED_JOBS.get() {
            gauge.set(count as f64);
        }
    }

    pub fn set_unpromotable(&self, count: usize) {
        if let Some(gauge) = UNPROMOTABLE_JOBS.get() {
            gauge.set(i64::try_from(count).unwrap_or(i64::MAX));
        }
    }

    pub fn record_store_error(&self, operation: &str) {
        if let Some(errors) = STORE_ERRORS_TOTAL.get() {
            errors.with_label_values(&[operation]).inc();
        }

        tracing::trace!(operation = operation, "Recorded store error");
    }

    pub fn record_transition(&self, from: JobStatus, to: JobStatus) {
        if let Some(transitions) = TRANSITIONS_TOTAL.get() {
            transitions
                .with_label_values(&[from.as_str(), to.as_str()])
                .inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::prometheus::init_metrics;

    fn ensure_metrics_init() {
        let _ = init_metrics();
    }

    #[test]
    fn test_metrics_collector_new() {
        let collector = MetricsCollector::new();
        assert!(std::mem::size_of_val(&collector) == 0);
    }

    #[test]
    fn test_lock_event_labels() {
        assert_eq!(LockEvent::Acquired.as_str(), "acquired");
        assert_eq!(LockEvent::Lost.as_str(), "lost");
    }

    #[test]
    fn test_record_promotion() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.record_promotion("default", 0.25);
        collector.record_promotion("paper:default", -1.0);

        let counter = PROMOTIONS_TOTAL.get().expect("initialized");
        assert!(counter.with_label_values(&["default"]).get() >= 1.0);
    }

    #[test]
    fn test_record_transition() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.record_transition(JobStatus::Scheduled, JobStatus::Queued);

        let counter = TRANSITIONS_TOTAL.get().expect("initialized");
        assert!(
            counter
                .with_label_values(&["scheduled", "queued"])
                .get()
                >= 1.0
        );
    }

    #[test]
    fn test_gauges() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.set_active(true);
        collector.set_scheduled_jobs(12);
        collector.set_unpromotable(2);
        collector.record_lock_event(LockEvent::Renewed);
        collector.record_store_error("ordered_range");
    }
}
