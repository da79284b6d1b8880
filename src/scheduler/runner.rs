//! The promotion loop.
//!
//! Any number of instances may run the loop against the same lease key; the
//! lease makes sure only one of them promotes at a time.
//!
//! ```text
//! Idle ──► Acquiring ──► Active ──► Renewing ──► Promoting ──► Active ...
//!  ▲           │                       │
//!  └───────────┴──── held elsewhere ───┴── ownership lost / store error
//!
//! shutdown: Active ──► Releasing ──► Stopped
//! ```
//!
//! Store failures never stop the loop; it backs off and tries again.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::Components;
use crate::config::SchedulerConfig;
use crate::error::{JobError, SchedulerError};
use crate::lock::Lease;
use crate::metrics::{LockEvent, MetricsCollector};
use crate::store::Store;

/// Observable state of a loop instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    /// Not holding the lease; waiting for the next acquisition attempt.
    Idle,
    Acquiring,
    /// Holding the lease between polls.
    Active,
    Renewing,
    Promoting,
    Releasing,
    Stopped,
}

/// Outcome of one scan of the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromotionReport {
    /// Jobs pushed onto their execution queue, in promotion order.
    pub promoted: Vec<String>,
    /// Entries dropped because their job had already left `scheduled` or no
    /// longer exists.
    pub stale_removed: Vec<String>,
    /// Entries kept because their job record cannot be read.
    pub unpromotable: Vec<String>,
}

impl PromotionReport {
    pub fn is_empty(&self) -> bool {
        self.promoted.is_empty() && self.stale_removed.is_empty() && self.unpromotable.is_empty()
    }
}

enum Tick {
    Keep(Duration),
    Drop(Duration),
}

/// Lease-coordinated loop promoting due jobs into execution queues.
pub struct SchedulerLoop {
    components: Components,
    lock_key: String,
    poll_interval: Duration,
    lease_ttl: Duration,
    release_timeout: Duration,
    backoff: Backoff,
    phase: watch::Sender<LoopPhase>,
    unpromotable: Mutex<BTreeSet<String>>,
    running: AtomicBool,
    metrics: MetricsCollector,
}

impl SchedulerLoop {
    pub fn new(components: Components, config: &SchedulerConfig) -> Self {
        let (phase, _) = watch::channel(LoopPhase::Idle);
        Self {
            components,
            lock_key: config.lock_key.clone(),
            poll_interval: config.poll_interval,
            lease_ttl: config.lease_ttl,
            release_timeout: config.release_timeout,
            backoff: Backoff::new(config.backoff_initial, config.backoff_max),
            phase,
            unpromotable: Mutex::new(BTreeSet::new()),
            running: AtomicBool::new(false),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn from_store(store: Arc<dyn Store>, config: &SchedulerConfig) -> Self {
        Self::new(Components::from_store(store, config), config)
    }

    pub fn phase(&self) -> LoopPhase {
        *self.phase.borrow()
    }

    /// Receiver that observes every phase change.
    pub fn subscribe(&self) -> watch::Receiver<LoopPhase> {
        self.phase.subscribe()
    }

    /// Ids skipped by the last scan because their record cannot be read.
    pub fn unpromotable(&self) -> Vec<String> {
        self.unpromotable
            .lock()
            .map(|flagged| flagged.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn set_phase(&self, phase: LoopPhase) {
        self.phase.send_replace(phase);
    }

    /// Runs until `shutdown` fires, then releases the lease if held.
    ///
    /// A step already in progress when `shutdown` fires is completed first.
    ///
    /// # Errors
    ///
    /// `SchedulerError::AlreadyRunning` if this instance is already running.
    /// Store failures are retried internally and never returned.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), SchedulerError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SchedulerError::AlreadyRunning);
        }

        info!(
            lock_key = %self.lock_key,
            poll_interval_secs = self.poll_interval.as_secs_f64(),
            lease_ttl_secs = self.lease_ttl.as_secs_f64(),
            "Scheduler loop started"
        );

        let mut lease: Option<Lease> = None;
        let mut backoff = self.backoff.clone();

        loop {
            // Shutdown is only observed between steps so a promotion is never
            // cut off between its transition and its queue push.
            let delay = self.step(&mut lease, &mut backoff).await;

            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(lock_key = %self.lock_key, "Scheduler loop shutting down");
        if let Some(held) = lease.take() {
            self.set_phase(LoopPhase::Releasing);
            if let Err(e) = self.release(&held).await {
                warn!(error = %e, "Lease left to expire");
            }
        }

        self.set_phase(LoopPhase::Stopped);
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Single pass: acquire, promote once, release.
    ///
    /// Returns `None` if another instance holds the lease.
    pub async fn run_once(&self) -> Result<Option<PromotionReport>, SchedulerError> {
        self.set_phase(LoopPhase::Acquiring);
        let Some(lease) = self
            .components
            .locks
            .acquire(&self.lock_key, self.lease_ttl)
            .await?
        else {
            self.metrics.record_lock_event(LockEvent::Contended);
            info!(lock_key = %self.lock_key, "Another scheduler is active");
            self.set_phase(LoopPhase::Idle);
            return Ok(None);
        };
        self.metrics.record_lock_event(LockEvent::Acquired);

        self.set_phase(LoopPhase::Promoting);
        let report = self.promote_due().await;

        self.set_phase(LoopPhase::Releasing);
        if let Err(e) = self.release(&lease).await {
            warn!(error = %e, "Lease left to expire");
        }
        self.set_phase(LoopPhase::Idle);

        report.map(Some)
    }

    async fn step(&self, lease: &mut Option<Lease>, backoff: &mut Backoff) -> Duration {
        match lease.as_mut() {
            Some(held) => match self.renew_and_promote(held, backoff).await {
                Tick::Keep(delay) => delay,
                Tick::Drop(delay) => {
                    *lease = None;
                    self.metrics.set_active(false);
                    self.set_phase(LoopPhase::Idle);
                    delay
                }
            },
            None => {
                self.set_phase(LoopPhase::Acquiring);
                match self
                    .components
                    .locks
                    .acquire(&self.lock_key, self.lease_ttl)
                    .await
                {
                    Ok(Some(acquired)) => {
                        info!(lock_key = %self.lock_key, "Became the active scheduler");
                        self.metrics.record_lock_event(LockEvent::Acquired);
                        self.metrics.set_active(true);
                        *lease = Some(acquired);
                        backoff.reset();
                        self.promote_pass(backoff).await
                    }
                    Ok(None) => {
                        debug!(lock_key = %self.lock_key, "Lease held elsewhere");
                        self.metrics.record_lock_event(LockEvent::Contended);
                        self.set_phase(LoopPhase::Idle);
                        backoff.reset();
                        self.poll_interval
                    }
                    Err(e) => {
                        self.metrics.record_store_error("acquire");
                        self.set_phase(LoopPhase::Idle);
                        let delay = backoff.next_delay();
                        warn!(error = %e, retry_in_secs = delay.as_secs_f64(), "Lease acquisition failed");
                        delay
                    }
                }
            }
        }
    }

    async fn renew_and_promote(&self, lease: &mut Lease, backoff: &mut Backoff) -> Tick {
        self.set_phase(LoopPhase::Renewing);
        match self.components.locks.renew(lease, self.lease_ttl).await {
            Ok(true) => {
                self.metrics.record_lock_event(LockEvent::Renewed);
                Tick::Keep(self.promote_pass(backoff).await)
            }
            Ok(false) => {
                warn!(lock_key = %self.lock_key, "Scheduler lease lost to another instance");
                self.metrics.record_lock_event(LockEvent::Lost);
                Tick::Drop(self.poll_interval)
            }
            Err(e) => {
                // Unknown outcome: stop promoting until the lease is re-acquired.
                self.metrics.record_store_error("renew");
                let delay = backoff.next_delay();
                warn!(error = %e, retry_in_secs = delay.as_secs_f64(), "Lease renewal failed");
                Tick::Drop(delay)
            }
        }
    }

    async fn promote_pass(&self, backoff: &mut Backoff) -> Duration {
        self.set_phase(LoopPhase::Promoting);
        let delay = match self.promote_due().await {
            Ok(report) => {
                backoff.reset();
                if !report.is_empty() {
                    info!(
                        promoted = report.promoted.len(),
                        stale_removed = report.stale_removed.len(),
                        unpromotable = report.unpromotable.len(),
                        "Promotion pass complete"
                    );
                }
                self.poll_interval
            }
            Err(e) => {
                self.metrics.record_store_error("promote");
                // Never sleep past the next renewal.
                let delay = backoff.next_delay().min(self.poll_interval);
                warn!(error = %e, retry_in_secs = delay.as_secs_f64(), "Promotion pass failed");
                delay
            }
        };
        self.set_phase(LoopPhase::Active);
        delay
    }

    /// Promotes every job due now, in due order.
    ///
    /// Only call this while holding the lease.
    pub async fn promote_due(&self) -> Result<PromotionReport, SchedulerError> {
        let now = Utc::now();
        let due = self.components.registry.due(now).await?;
        let mut report = PromotionReport::default();

        for entry in due {
            let record = match self.components.jobs.load(&entry.job_id).await {
                Ok(record) => record,
                Err(JobError::NotFound(_)) => {
                    self.components.registry.remove(&entry.job_id).await?;
                    debug!(job_id = %entry.job_id, "Removed entry without job record");
                    report.stale_removed.push(entry.job_id);
                    continue;
                }
                Err(JobError::Deserialization { reason, .. }) => {
                    let newly_flagged = self
                        .unpromotable
                        .lock()
                        .map(|flagged| !flagged.contains(&entry.job_id))
                        .unwrap_or(true);
                    if newly_flagged {
                        warn!(
                            job_id = %entry.job_id,
                            reason = %reason,
                            "Scheduled job cannot be deserialized; skipping until discarded"
                        );
                    }
                    report.unpromotable.push(entry.job_id);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            match self.components.promote(&record).await {
                Ok(_) => {
                    let delay = (now - entry.due_at).num_milliseconds() as f64 / 1000.0;
                    self.metrics.record_promotion(&record.origin, delay);
                    info!(job_id = %record.id, queue = %record.origin, "Job promoted");
                    report.promoted.push(record.id);
                }
                Err(SchedulerError::Job(JobError::IllegalTransition { from, .. })) => {
                    self.components.registry.remove(&record.id).await?;
                    debug!(job_id = %record.id, status = %from, "Removed stale registry entry");
                    report.stale_removed.push(record.id);
                }
                Err(SchedulerError::Job(JobError::NotFound(_))) => {
                    self.components.registry.remove(&record.id).await?;
                    report.stale_removed.push(record.id);
                }
                Err(e) => return Err(e),
            }
        }

        if let Ok(mut flagged) = self.unpromotable.lock() {
            *flagged = report.unpromotable.iter().cloned().collect();
            self.metrics.set_unpromotable(flagged.len());
        }
        if let Ok(count) = self.components.registry.count().await {
            self.metrics.set_scheduled_jobs(count);
        }

        Ok(report)
    }

    /// Releases `lease`, giving up after the configured release timeout.
    ///
    /// Returns whether the lease was still ours.
    pub async fn release(&self, lease: &Lease) -> Result<bool, SchedulerError> {
        self.metrics.set_active(false);
        match tokio::time::timeout(self.release_timeout, self.components.locks.release(lease)).await
        {
            Ok(Ok(released)) => {
                if released {
                    self.metrics.record_lock_event(LockEvent::Released);
                    info!(lock_key = %lease.key(), "Scheduler lease released");
                }
                Ok(released)
            }
            Ok(Err(e)) => {
                self.metrics.record_store_error("release");
                error!(lock_key = %lease.key(), error = %e, "Lease release failed");
                Err(e.into())
            }
            Err(_) => Err(SchedulerError::ReleaseTimeout(self.release_timeout)),
        }
    }
}
