//! # Scale estimation
//!
//! Advisory worker-count hints for an external scale controller. Nothing here
//! starts or stops workers.
//!
//! - [`desired_workers`]: `ceil(pending / max_changes_per_worker)`, at least 1.
//! - [`scale_vote`]: a trend-based scale-out / scale-in vote over recent
//!   samples.
//! - [`ScaleEstimator`]: samples every binding on its own cadence and
//!   publishes the result through a shared [`ScaleSignal`].

use crate::common::{
    LeaseRow, LeaseStore, PartitionKey, Result, TableName, TriggerError, TriggerMetrics,
    VersionStore,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Samples needed before a trend vote is made
pub const MIN_SAMPLES_FOR_VOTE: usize = 5;
/// Samples kept by a [`ScaleSignal`]
pub const SAMPLE_HISTORY: usize = 10;
/// Horizon of the scale-out projection
pub const PROJECTION_WINDOW: Duration = Duration::from_secs(30);

/// Unprocessed changes for one partition.
///
/// `current_version - checkpoint`, where the checkpoint is clamped to the
/// store's minimum valid version. Rows sharing a version count once, so this is a
/// lower bound.
pub async fn pending_count<V: VersionStore + ?Sized>(
    versions: &V,
    table: &TableName,
    lease: Option<&LeaseRow>,
) -> Result<u64> {
    let current = versions.current_version(table).await?;
    let min_valid = versions.min_valid_version(table).await?;
    let checkpoint = lease.map(|l| l.last_processed_version).unwrap_or(0);
    let from = checkpoint.max(min_valid);
    Ok(current.saturating_sub(from).max(0) as u64)
}

/// Workers needed so none has more than `max_changes_per_worker` pending.
///
/// Never below 1: an active partition always warrants one worker.
pub fn desired_workers(pending: u64, max_changes_per_worker: u32) -> Result<u64> {
    if max_changes_per_worker == 0 {
        return Err(TriggerError::config(
            "max_changes_per_worker must not be less than 1",
        ));
    }
    Ok(pending.div_ceil(max_changes_per_worker as u64).max(1))
}

/// One observation of the unprocessed change count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScaleSample {
    pub unprocessed: u64,
    pub timestamp: DateTime<Utc>,
}

/// Scale recommendation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleVote {
    None,
    ScaleOut,
    ScaleIn,
}

/// Vote on scaling from the most recent samples.
///
/// Scale out when the latest count exceeds what the current workers can
/// absorb, or when counts rise steadily and the projection 30 seconds ahead
/// would. Scale in when counts fall steadily (or reach zero) and one fewer
/// worker would still cope.
pub fn scale_vote(samples: &[ScaleSample], workers: u64, max_changes_per_worker: u32) -> ScaleVote {
    if samples.len() < MIN_SAMPLES_FOR_VOTE {
        return ScaleVote::None;
    }
    let recent = &samples[samples.len() - MIN_SAMPLES_FOR_VOTE..];
    let max = max_changes_per_worker as u64;
    let capacity = workers.saturating_mul(max);

    let latest = recent[recent.len() - 1];
    if latest.unprocessed > capacity {
        return ScaleVote::ScaleOut;
    }

    let increasing = recent
        .windows(2)
        .all(|w| w[0].unprocessed < w[1].unprocessed);
    let decreasing = recent
        .windows(2)
        .all(|w| w[1].unprocessed == 0 || w[0].unprocessed > w[1].unprocessed);

    if increasing {
        let window = chrono::Duration::milliseconds(PROJECTION_WINDOW.as_millis() as i64);
        let reference_time = latest.timestamp - window;
        let reference = recent
            .iter()
            .find(|s| s.timestamp > reference_time)
            .unwrap_or(&latest);
        let projected = (2 * latest.unprocessed).saturating_sub(reference.unprocessed);
        if projected > capacity {
            return ScaleVote::ScaleOut;
        }
    }

    if decreasing && workers > 0 && latest.unprocessed <= (workers - 1) * max {
        return ScaleVote::ScaleIn;
    }

    ScaleVote::None
}

#[derive(Debug, Default)]
struct SignalState {
    pending: u64,
    desired_workers: u64,
    samples: VecDeque<ScaleSample>,
}

/// Read-only scale estimate shared with a scale controller.
///
/// Cheap to clone; every clone sees the latest sample.
#[derive(Debug, Clone)]
pub struct ScaleSignal {
    max_changes_per_worker: u32,
    state: Arc<RwLock<SignalState>>,
}

impl ScaleSignal {
    pub fn new(max_changes_per_worker: u32) -> Self {
        Self {
            max_changes_per_worker,
            state: Arc::new(RwLock::new(SignalState::default())),
        }
    }

    /// Latest desired worker count (0 until the first sample).
    pub fn desired_workers(&self) -> u64 {
        self.state.read().desired_workers
    }

    /// Latest unprocessed change count.
    pub fn pending_changes(&self) -> u64 {
        self.state.read().pending
    }

    /// Recent samples, oldest first.
    pub fn samples(&self) -> Vec<ScaleSample> {
        self.state.read().samples.iter().copied().collect()
    }

    /// Vote given the controller's current worker count.
    pub fn vote(&self, current_workers: u64) -> ScaleVote {
        let samples = self.samples();
        scale_vote(&samples, current_workers, self.max_changes_per_worker)
    }

    pub(crate) fn record(&self, sample: ScaleSample, desired_workers: u64) {
        let mut state = self.state.write();
        state.pending = sample.unprocessed;
        state.desired_workers = desired_workers;
        if state.samples.len() == SAMPLE_HISTORY {
            state.samples.pop_front();
        }
        state.samples.push_back(sample);
    }
}

/// One binding watched by the estimator
pub struct ScaleTarget {
    pub table: TableName,
    pub partition: PartitionKey,
    pub versions: Arc<dyn VersionStore>,
    pub leases: Arc<dyn LeaseStore>,
    pub metrics: Option<Arc<TriggerMetrics>>,
}

/// Samples pending work across bindings and publishes a [`ScaleSignal`].
pub struct ScaleEstimator {
    targets: Vec<ScaleTarget>,
    max_changes_per_worker: u32,
    signal: ScaleSignal,
}

impl ScaleEstimator {
    pub fn new(max_changes_per_worker: u32) -> Self {
        Self {
            targets: Vec::new(),
            max_changes_per_worker,
            signal: ScaleSignal::new(max_changes_per_worker),
        }
    }

    pub fn add_target(&mut self, target: ScaleTarget) {
        self.targets.push(target);
    }

    pub fn signal(&self) -> ScaleSignal {
        self.signal.clone()
    }

    /// Pending changes for each target, in registration order.
    pub async fn pending_by_target(&self) -> Result<Vec<(PartitionKey, u64)>> {
        let mut pending = Vec::with_capacity(self.targets.len());
        for target in &self.targets {
            let lease = target.leases.load(&target.partition).await?;
            let count = pending_count(target.versions.as_ref(), &target.table, lease.as_ref()).await?;
            if let Some(metrics) = &target.metrics {
                metrics.set_scale(count, desired_workers(count, self.max_changes_per_worker)?);
            }
            pending.push((target.partition.clone(), count));
        }
        Ok(pending)
    }

    /// Take one sample and publish it.
    ///
    /// With no bindings the desired worker count is 0.
    pub async fn sample(&self) -> Result<ScaleSample> {
        let total: u64 = self
            .pending_by_target()
            .await?
            .into_iter()
            .map(|(_, count)| count)
            .sum();
        let desired = if self.targets.is_empty() {
            0
        } else {
            desired_workers(total, self.max_changes_per_worker)?
        };

        let sample = ScaleSample {
            unprocessed: total,
            timestamp: Utc::now(),
        };
        self.signal.record(sample, desired);
        debug!(
            pending = total,
            desired_workers = desired,
            "Scale sample recorded"
        );
        Ok(sample)
    }

    /// Sample every `interval` until cancelled. Errors are logged and skipped.
    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        info!(
            targets = self.targets.len(),
            "Starting scale estimator every {:?}", interval
        );
        loop {
            if let Err(e) = self.sample().await {
                warn!(error = %e, "Failed to sample pending changes");
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        debug!("Scale estimator stopped");
    }
}
