//! # Trigger Metrics
//!
//! Per-binding counters kept in atomics for lock-free updates. Every update is
//! also emitted through the `metrics` crate facade, labelled with the table
//! and consumer group, so any installed exporter (Prometheus, StatsD) picks
//! them up.
//!
//! ```ignore
//! use rivven_trigger::common::TriggerMetrics;
//!
//! let metrics = TriggerMetrics::new("dbo.Products", "products-sync");
//! metrics.record_poll(Duration::from_millis(3), 0);
//!
//! let snapshot = metrics.snapshot();
//! println!("{} empty polls", snapshot.empty_polls);
//! ```

use crate::common::{ChangeBatch, ErrorCategory, TriggerError};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Metrics collector for one (table, consumer group) binding.
#[derive(Debug)]
pub struct TriggerMetrics {
    table: String,
    consumer_group: String,
    start_time: Instant,

    // Polling
    polls: AtomicU64,
    empty_polls: AtomicU64,
    last_poll_duration_us: AtomicU64,

    // Delivery
    batches_delivered: AtomicU64,
    changes_delivered: AtomicU64,
    inserts: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,

    // Handler
    handler_retries: AtomicU64,
    handler_failures: AtomicU64,
    batches_skipped: AtomicU64,

    // Leases
    lease_acquisitions: AtomicU64,
    lease_losses: AtomicU64,
    checkpoints: AtomicU64,
    last_checkpoint_version: AtomicU64,

    // Errors
    source_errors: AtomicU64,

    // Scale
    pending_changes: AtomicU64,
    desired_workers: AtomicU64,
}

impl TriggerMetrics {
    pub fn new(table: &str, consumer_group: &str) -> Self {
        Self {
            table: table.to_string(),
            consumer_group: consumer_group.to_string(),
            start_time: Instant::now(),
            polls: AtomicU64::new(0),
            empty_polls: AtomicU64::new(0),
            last_poll_duration_us: AtomicU64::new(0),
            batches_delivered: AtomicU64::new(0),
            changes_delivered: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
            updates: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            handler_retries: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            batches_skipped: AtomicU64::new(0),
            lease_acquisitions: AtomicU64::new(0),
            lease_losses: AtomicU64::new(0),
            checkpoints: AtomicU64::new(0),
            last_checkpoint_version: AtomicU64::new(0),
            source_errors: AtomicU64::new(0),
            pending_changes: AtomicU64::new(0),
            desired_workers: AtomicU64::new(0),
        }
    }

    /// Record a completed fetch.
    #[inline]
    pub fn record_poll(&self, duration: Duration, changes: usize) {
        self.polls.fetch_add(1, Ordering::Relaxed);
        if changes == 0 {
            self.empty_polls.fetch_add(1, Ordering::Relaxed);
        }
        self.last_poll_duration_us
            .store(duration.as_micros() as u64, Ordering::Relaxed);

        metrics::counter!(
            "rivven_trigger_polls_total",
            "table" => self.table.clone(),
            "consumer_group" => self.consumer_group.clone()
        )
        .increment(1);
        metrics::histogram!(
            "rivven_trigger_poll_duration_seconds",
            "table" => self.table.clone(),
            "consumer_group" => self.consumer_group.clone()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a batch the handler accepted.
    pub fn record_batch(&self, batch: &ChangeBatch) {
        let (inserts, updates, deletes) = batch.operation_counts();
        self.batches_delivered.fetch_add(1, Ordering::Relaxed);
        self.changes_delivered
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        self.inserts.fetch_add(inserts, Ordering::Relaxed);
        self.updates.fetch_add(updates, Ordering::Relaxed);
        self.deletes.fetch_add(deletes, Ordering::Relaxed);

        metrics::counter!(
            "rivven_trigger_batches_total",
            "table" => self.table.clone(),
            "consumer_group" => self.consumer_group.clone()
        )
        .increment(1);
        for (op, count) in [("insert", inserts), ("update", updates), ("delete", deletes)] {
            if count > 0 {
                metrics::counter!(
                    "rivven_trigger_changes_total",
                    "table" => self.table.clone(),
                    "consumer_group" => self.consumer_group.clone(),
                    "op" => op
                )
                .increment(count);
            }
        }
    }

    #[inline]
    pub fn record_handler_retry(&self) {
        self.handler_retries.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "rivven_trigger_handler_retries_total",
            "table" => self.table.clone(),
            "consumer_group" => self.consumer_group.clone()
        )
        .increment(1);
    }

    #[inline]
    pub fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "rivven_trigger_handler_failures_total",
            "table" => self.table.clone(),
            "consumer_group" => self.consumer_group.clone()
        )
        .increment(1);
    }

    #[inline]
    pub fn record_skipped_batch(&self) {
        self.batches_skipped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "rivven_trigger_batches_skipped_total",
            "table" => self.table.clone(),
            "consumer_group" => self.consumer_group.clone()
        )
        .increment(1);
    }

    #[inline]
    pub fn record_lease_acquired(&self) {
        self.lease_acquisitions.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "rivven_trigger_lease_acquisitions_total",
            "table" => self.table.clone(),
            "consumer_group" => self.consumer_group.clone()
        )
        .increment(1);
    }

    #[inline]
    pub fn record_lease_lost(&self) {
        self.lease_losses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "rivven_trigger_lease_losses_total",
            "table" => self.table.clone(),
            "consumer_group" => self.consumer_group.clone()
        )
        .increment(1);
    }

    /// Record a committed checkpoint.
    #[inline]
    pub fn record_checkpoint(&self, version: i64) {
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
        self.last_checkpoint_version
            .store(version.max(0) as u64, Ordering::Relaxed);
        metrics::gauge!(
            "rivven_trigger_checkpoint_version",
            "table" => self.table.clone(),
            "consumer_group" => self.consumer_group.clone()
        )
        .set(version as f64);
    }

    /// Record an error absorbed or surfaced by the scheduler.
    pub fn record_error(&self, error: &TriggerError) {
        if error.category() == ErrorCategory::Source {
            self.source_errors.fetch_add(1, Ordering::Relaxed);
        }
        metrics::counter!(
            "rivven_trigger_errors_total",
            "table" => self.table.clone(),
            "consumer_group" => self.consumer_group.clone(),
            "code" => error.error_code()
        )
        .increment(1);
    }

    /// Publish the latest scale estimate.
    pub fn set_scale(&self, pending: u64, desired_workers: u64) {
        self.pending_changes.store(pending, Ordering::Relaxed);
        self.desired_workers
            .store(desired_workers, Ordering::Relaxed);
        metrics::gauge!(
            "rivven_trigger_pending_changes",
            "table" => self.table.clone(),
            "consumer_group" => self.consumer_group.clone()
        )
        .set(pending as f64);
        metrics::gauge!(
            "rivven_trigger_desired_workers",
            "table" => self.table.clone(),
            "consumer_group" => self.consumer_group.clone()
        )
        .set(desired_workers as f64);
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> TriggerMetricsSnapshot {
        TriggerMetricsSnapshot {
            table: self.table.clone(),
            consumer_group: self.consumer_group.clone(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            polls: self.polls.load(Ordering::Relaxed),
            empty_polls: self.empty_polls.load(Ordering::Relaxed),
            last_poll_duration_us: self.last_poll_duration_us.load(Ordering::Relaxed),
            batches_delivered: self.batches_delivered.load(Ordering::Relaxed),
            changes_delivered: self.changes_delivered.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            handler_retries: self.handler_retries.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            batches_skipped: self.batches_skipped.load(Ordering::Relaxed),
            lease_acquisitions: self.lease_acquisitions.load(Ordering::Relaxed),
            lease_losses: self.lease_losses.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
            last_checkpoint_version: self.last_checkpoint_version.load(Ordering::Relaxed),
            source_errors: self.source_errors.load(Ordering::Relaxed),
            pending_changes: self.pending_changes.load(Ordering::Relaxed),
            desired_workers: self.desired_workers.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`TriggerMetrics`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct TriggerMetricsSnapshot {
    pub table: String,
    pub consumer_group: String,
    pub uptime_secs: u64,
    pub polls: u64,
    pub empty_polls: u64,
    pub last_poll_duration_us: u64,
    pub batches_delivered: u64,
    pub changes_delivered: u64,
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    pub handler_retries: u64,
    pub handler_failures: u64,
    pub batches_skipped: u64,
    pub lease_acquisitions: u64,
    pub lease_losses: u64,
    pub checkpoints: u64,
    pub last_checkpoint_version: u64,
    pub source_errors: u64,
    pub pending_changes: u64,
    pub desired_workers: u64,
}

impl TriggerMetricsSnapshot {
    /// Fraction of polls that found nothing to deliver.
    pub fn empty_poll_ratio(&self) -> f64 {
        if self.polls > 0 {
            self.empty_polls as f64 / self.polls as f64
        } else {
            0.0
        }
    }
}
