//! # Polling Scheduler
//!
//! The control loop for one (table, consumer group) binding in one worker.
//!
//! ```text
//!            ┌──────────────── denied / lost ───────────────┐
//!            ▼                                              │
//! Idle → Claiming → Fetching → Dispatching → Checkpointing → Sleeping
//!            ▲          │ empty                             │
//!            │          └───────────────► Sleeping ─────────┤
//!            └──────────────────────────────────────────────┘
//!
//! any state ── cancel ──► ShuttingDown → Stopped
//! Dispatching ── permanent failure, stall policy ──► Stalled
//! ```
//!
//! One cycle is [`PollingScheduler::poll_once`]; [`PollingScheduler::run`]
//! repeats cycles until cancelled. Transient store errors are absorbed with
//! backoff and never end the loop. Fatal errors and stalled partitions end it
//! and are reported through the [`TriggerEvent`] channel.
//!
//! Delivery is at-least-once. A worker that loses its lease mid-batch does not
//! checkpoint, so the next owner re-reads from the last committed version.

use crate::common::{
    BatchFetcher, ChangeBatch, ChangeDispatcher, ClaimResult, DispatchOutcome, LeaseRow,
    LeaseStore, OwnerId, PartitionKey, PoisonBatchPolicy, PollingConfig, Result,
    SchedulerOptions, TriggerError, TriggerMetrics, VersionStore,
};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Capacity of the diagnostic event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Claiming,
    Fetching,
    Dispatching,
    Checkpointing,
    Sleeping,
    /// Halted on a poison batch
    Stalled,
    /// Halted on a fatal error
    Failed,
    ShuttingDown,
    Stopped,
}

impl SchedulerState {
    /// True once the loop has ended for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stalled | Self::Failed | Self::Stopped)
    }
}

/// Diagnostic events published by schedulers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TriggerEvent {
    LeaseAcquired {
        partition: PartitionKey,
        owner: OwnerId,
        checkpoint: i64,
    },
    LeaseLost {
        partition: PartitionKey,
        owner: OwnerId,
    },
    BatchDelivered {
        partition: PartitionKey,
        changes: usize,
        checkpoint: i64,
    },
    BatchSkipped {
        partition: PartitionKey,
        from_version: i64,
        bound_version: i64,
        message: String,
    },
    HandlerRetry {
        partition: PartitionKey,
        attempt: u32,
        #[serde(with = "duration_millis")]
        delay: Duration,
        message: String,
    },
    PartitionStalled {
        partition: PartitionKey,
        checkpoint: i64,
        bound_version: i64,
        message: String,
    },
    Fatal {
        partition: PartitionKey,
        code: &'static str,
        message: String,
    },
    Stopped {
        partition: PartitionKey,
    },
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}

/// Result of one polling cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another worker holds the partition
    Denied,
    /// Nothing new above the checkpoint
    Empty,
    /// The handler accepted a batch and the checkpoint advanced
    Delivered { changes: usize, checkpoint: i64 },
    /// A poison batch was skipped and checkpointed past
    Skipped { checkpoint: i64 },
    /// Ownership was lost before the checkpoint could be written
    LeaseLost,
    /// A transient store error was absorbed
    SourceUnavailable(String),
}

/// Drives one partition: claim, fetch, dispatch, checkpoint, sleep.
pub struct PollingScheduler<V, L> {
    partition: PartitionKey,
    owner: OwnerId,
    fetcher: BatchFetcher<V>,
    leases: L,
    dispatcher: ChangeDispatcher,
    polling: PollingConfig,
    options: SchedulerOptions,
    metrics: Arc<TriggerMetrics>,
    events: broadcast::Sender<TriggerEvent>,
    state: Arc<RwLock<SchedulerState>>,
    /// Last lease row this worker wrote or read, including renewals made
    /// while the handler runs
    lease: Mutex<Option<LeaseRow>>,
}

impl<V: VersionStore, L: LeaseStore> PollingScheduler<V, L> {
    pub fn new(
        consumer_group: impl Into<String>,
        owner: OwnerId,
        fetcher: BatchFetcher<V>,
        leases: L,
        dispatcher: ChangeDispatcher,
        polling: PollingConfig,
        options: SchedulerOptions,
    ) -> Self {
        let partition = PartitionKey::new(fetcher.schema().table.to_string(), consumer_group);
        let metrics = Arc::new(TriggerMetrics::new(
            &partition.table,
            &partition.consumer_group,
        ));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            partition,
            owner,
            fetcher,
            leases,
            dispatcher,
            polling,
            options,
            metrics,
            events,
            state: Arc::new(RwLock::new(SchedulerState::Idle)),
            lease: Mutex::new(None),
        }
    }

    /// Publish events on a shared channel.
    pub fn with_event_sender(mut self, events: broadcast::Sender<TriggerEvent>) -> Self {
        self.events = events;
        self
    }

    /// Record into a shared metrics collector.
    pub fn with_metrics(mut self, metrics: Arc<TriggerMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn partition(&self) -> &PartitionKey {
        &self.partition
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.read()
    }

    /// Shared view of the state for observers outside the loop.
    pub fn state_handle(&self) -> Arc<RwLock<SchedulerState>> {
        self.state.clone()
    }

    pub fn metrics(&self) -> Arc<TriggerMetrics> {
        self.metrics.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TriggerEvent> {
        self.events.subscribe()
    }

    /// The lease as this worker last saw it, if it believes it holds one.
    pub fn lease(&self) -> Option<LeaseRow> {
        self.lease.lock().clone()
    }

    /// Run cycles until `shutdown` is cancelled or the partition halts.
    ///
    /// Returns `Ok(())` on shutdown and the halting error otherwise. The lease
    /// is released in both cases so another worker can take over at once.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        info!(
            partition = %self.partition,
            owner = %self.owner,
            "Starting polling scheduler: {}",
            self.polling.format()
        );

        let mut consecutive_errors: u32 = 0;
        let result = loop {
            let outcome = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                outcome = self.poll_once(Utc::now()) => outcome,
            };

            let delay = match outcome {
                Ok(CycleOutcome::SourceUnavailable(_)) => {
                    let backoff = self
                        .options
                        .retry
                        .delay_for_attempt(consecutive_errors)
                        .max(self.polling.polling_interval());
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    backoff
                }
                Ok(_) => {
                    consecutive_errors = 0;
                    self.polling.polling_interval()
                }
                Err(e) => break Err(e),
            };

            self.set_state(SchedulerState::Sleeping);
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        };

        let halted = self.state().is_terminal();
        if !halted {
            self.set_state(SchedulerState::ShuttingDown);
        }
        self.release_lease().await;
        if !halted {
            self.set_state(SchedulerState::Stopped);
        }
        self.emit(TriggerEvent::Stopped {
            partition: self.partition.clone(),
        });
        info!(partition = %self.partition, "Polling scheduler stopped");

        result
    }

    /// Run a single cycle at `now`.
    ///
    /// Transient store errors come back as [`CycleOutcome::SourceUnavailable`];
    /// an `Err` means the partition must halt.
    pub async fn poll_once(&mut self, now: DateTime<Utc>) -> Result<CycleOutcome> {
        match self.cycle(now).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_retriable() => {
                self.metrics.record_error(&e);
                warn!(
                    partition = %self.partition,
                    error = %e,
                    "Transient error during poll, backing off"
                );
                Ok(CycleOutcome::SourceUnavailable(e.to_string()))
            }
            Err(e) => {
                self.metrics.record_error(&e);
                if !matches!(e, TriggerError::PartitionStalled { .. }) {
                    self.set_state(SchedulerState::Failed);
                    error!(partition = %self.partition, error = %e, "Partition halted");
                    self.emit(TriggerEvent::Fatal {
                        partition: self.partition.clone(),
                        code: e.error_code(),
                        message: e.to_string(),
                    });
                }
                Err(e)
            }
        }
    }

    async fn cycle(&mut self, now: DateTime<Utc>) -> Result<CycleOutcome> {
        self.set_state(SchedulerState::Claiming);
        let Some(lease) = self.acquire(now).await? else {
            return Ok(CycleOutcome::Denied);
        };

        self.set_state(SchedulerState::Fetching);
        let started = Instant::now();
        let fetched = self
            .fetcher
            .fetch(&lease, self.polling.batch_size() as usize)
            .await?;
        self.metrics.record_poll(started.elapsed(), fetched.len());

        if fetched.is_empty() {
            trace!(partition = %self.partition, "No new changes");
            return Ok(CycleOutcome::Empty);
        }

        let batch = fetched.into_batch(self.partition.clone());
        debug!(
            partition = %self.partition,
            "Fetched {} changes in ({}, {}]",
            batch.len(),
            lease.last_processed_version,
            batch.bound_version
        );

        self.set_state(SchedulerState::Dispatching);
        let (lease, delivery) = self.deliver(&batch, lease).await;
        self.set_lease(lease.clone());
        let Some(lease) = lease else {
            self.lease_lost();
            return Ok(CycleOutcome::LeaseLost);
        };

        match delivery {
            Delivery::Delivered => {
                self.set_state(SchedulerState::Checkpointing);
                match self.commit(&lease, batch.bound_version).await? {
                    ClaimResult::Acquired(row) => {
                        self.set_lease(Some(row));
                        self.metrics.record_batch(&batch);
                        self.metrics.record_checkpoint(batch.bound_version);
                        self.emit(TriggerEvent::BatchDelivered {
                            partition: self.partition.clone(),
                            changes: batch.len(),
                            checkpoint: batch.bound_version,
                        });
                        Ok(CycleOutcome::Delivered {
                            changes: batch.len(),
                            checkpoint: batch.bound_version,
                        })
                    }
                    ClaimResult::Denied(denied) => {
                        debug!(partition = %self.partition, "Checkpoint denied: {}", denied);
                        self.lease_lost();
                        Ok(CycleOutcome::LeaseLost)
                    }
                }
            }
            Delivery::Failed(message) => self.handle_poison(&batch, &lease, message).await,
        }
    }

    /// Claim or renew the lease for this cycle.
    async fn acquire(&mut self, now: DateTime<Utc>) -> Result<Option<LeaseRow>> {
        let renew_within = chrono::Duration::milliseconds(
            (self.leases.lease_duration().as_millis() / 2) as i64,
        );

        let current = self.lease();
        if let Some(held) = current.clone() {
            let fresh = held
                .lease_expiry
                .map(|expiry| expiry - now > renew_within)
                .unwrap_or(false);
            if fresh {
                return Ok(Some(held));
            }
            if let ClaimResult::Acquired(row) = self.leases.renew(&held, now).await? {
                trace!(partition = %self.partition, "Renewed lease");
                self.set_lease(Some(row.clone()));
                return Ok(Some(row));
            }
        }

        match self
            .leases
            .try_claim(&self.partition, self.owner, now)
            .await?
        {
            ClaimResult::Acquired(row) => {
                if current.is_none() {
                    info!(
                        partition = %self.partition,
                        owner = %self.owner,
                        checkpoint = row.last_processed_version,
                        "Acquired lease"
                    );
                    self.metrics.record_lease_acquired();
                    self.emit(TriggerEvent::LeaseAcquired {
                        partition: self.partition.clone(),
                        owner: self.owner,
                        checkpoint: row.last_processed_version,
                    });
                }
                self.set_lease(Some(row.clone()));
                Ok(Some(row))
            }
            ClaimResult::Denied(denied) => {
                if current.is_some() {
                    self.lease_lost();
                }
                trace!(partition = %self.partition, "Claim denied: {}", denied);
                self.set_lease(None);
                Ok(None)
            }
        }
    }

    /// Dispatch with retries, renewing the lease while the handler runs.
    ///
    /// Returns the latest lease row, or `None` once ownership is lost.
    async fn deliver(&self, batch: &ChangeBatch, mut lease: LeaseRow) -> (Option<LeaseRow>, Delivery) {
        let retry = &self.options.retry;
        let mut attempt: u32 = 0;

        loop {
            let (outcome, lost) = self.dispatch_holding_lease(batch, &mut lease).await;
            if lost {
                return (None, Delivery::Failed("lease lost during dispatch".into()));
            }

            match outcome {
                DispatchOutcome::Success => return (Some(lease), Delivery::Delivered),
                DispatchOutcome::HandlerFailure {
                    retryable: true,
                    message,
                } if retry.should_retry(attempt) => {
                    let delay = retry.delay_for_attempt(attempt);
                    attempt += 1;
                    self.metrics.record_handler_retry();
                    warn!(
                        partition = %self.partition,
                        attempt,
                        "Handler failed, retrying batch in {:?}: {}",
                        delay,
                        message
                    );
                    self.emit(TriggerEvent::HandlerRetry {
                        partition: self.partition.clone(),
                        attempt,
                        delay,
                        message,
                    });
                    tokio::time::sleep(delay).await;

                    match self.leases.renew(&lease, Utc::now()).await {
                        Ok(ClaimResult::Acquired(row)) => {
                            self.set_lease(Some(row.clone()));
                            lease = row;
                        }
                        Ok(ClaimResult::Denied(_)) => {
                            return (None, Delivery::Failed("lease lost during retry".into()))
                        }
                        Err(e) => {
                            warn!(partition = %self.partition, error = %e, "Lease renewal failed before retry")
                        }
                    }
                }
                DispatchOutcome::HandlerFailure { retryable, message } => {
                    self.metrics.record_handler_failure();
                    let message = if retryable {
                        format!("retries exhausted after {} attempts: {}", attempt + 1, message)
                    } else {
                        message
                    };
                    return (Some(lease), Delivery::Failed(message));
                }
            }
        }
    }

    async fn dispatch_holding_lease(
        &self,
        batch: &ChangeBatch,
        lease: &mut LeaseRow,
    ) -> (DispatchOutcome, bool) {
        let renew_every = self.leases.lease_duration() / 2;
        let dispatch = self.dispatcher.dispatch(batch);
        tokio::pin!(dispatch);
        let mut lost = false;

        loop {
            tokio::select! {
                outcome = &mut dispatch => return (outcome, lost),
                _ = tokio::time::sleep(renew_every), if !lost => {
                    match self.leases.renew(lease, Utc::now()).await {
                        Ok(ClaimResult::Acquired(row)) => {
                            trace!(partition = %self.partition, "Renewed lease during dispatch");
                            self.set_lease(Some(row.clone()));
                            *lease = row;
                        }
                        Ok(ClaimResult::Denied(denied)) => {
                            warn!(
                                partition = %self.partition,
                                "Lease lost while the handler was running: {}",
                                denied
                            );
                            lost = true;
                        }
                        Err(e) => {
                            warn!(partition = %self.partition, error = %e, "Lease renewal failed during dispatch");
                        }
                    }
                }
            }
        }
    }

    /// Write the checkpoint, retrying transient store errors.
    async fn commit(&self, lease: &LeaseRow, version: i64) -> Result<ClaimResult> {
        let retry = &self.options.retry;
        let mut attempt: u32 = 0;
        loop {
            match self.leases.checkpoint(lease, version).await {
                Err(e) if e.is_retriable() && retry.should_retry(attempt) => {
                    let delay = retry.delay_for_attempt(attempt);
                    attempt += 1;
                    warn!(
                        partition = %self.partition,
                        error = %e,
                        "Checkpoint to {} failed, retrying in {:?}",
                        version,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    async fn handle_poison(
        &mut self,
        batch: &ChangeBatch,
        lease: &LeaseRow,
        message: String,
    ) -> Result<CycleOutcome> {
        match self.options.poison_batch {
            PoisonBatchPolicy::Stall => {
                self.set_state(SchedulerState::Stalled);
                error!(
                    partition = %self.partition,
                    checkpoint = lease.last_processed_version,
                    bound_version = batch.bound_version,
                    "Handler rejected batch, partition stalled: {}",
                    message
                );
                self.emit(TriggerEvent::PartitionStalled {
                    partition: self.partition.clone(),
                    checkpoint: lease.last_processed_version,
                    bound_version: batch.bound_version,
                    message: message.clone(),
                });
                Err(TriggerError::partition_stalled(
                    self.partition.to_string(),
                    format!(
                        "batch ({}, {}] rejected: {}",
                        lease.last_processed_version, batch.bound_version, message
                    ),
                ))
            }
            PoisonBatchPolicy::Skip => {
                self.set_state(SchedulerState::Checkpointing);
                error!(
                    partition = %self.partition,
                    "Skipping batch ({}, {}] after handler failure: {}",
                    lease.last_processed_version,
                    batch.bound_version,
                    message
                );
                match self.commit(lease, batch.bound_version).await? {
                    ClaimResult::Acquired(row) => {
                        self.set_lease(Some(row));
                        self.metrics.record_skipped_batch();
                        self.metrics.record_checkpoint(batch.bound_version);
                        self.emit(TriggerEvent::BatchSkipped {
                            partition: self.partition.clone(),
                            from_version: lease.last_processed_version,
                            bound_version: batch.bound_version,
                            message,
                        });
                        Ok(CycleOutcome::Skipped {
                            checkpoint: batch.bound_version,
                        })
                    }
                    ClaimResult::Denied(_) => {
                        self.lease_lost();
                        Ok(CycleOutcome::LeaseLost)
                    }
                }
            }
        }
    }

    /// Give up ownership on exit.
    ///
    /// A renewal cut short by cancellation can land in the store without
    /// reaching `self.lease`, so a refused release is retried once against
    /// the stored row as long as this worker still owns it.
    async fn release_lease(&mut self) {
        let held = self.lease.lock().take();
        let Some(lease) = held else {
            return;
        };
        let released = match self.leases.release(&lease).await {
            Ok(false) => match self.leases.load(&self.partition).await {
                Ok(Some(row)) if row.owner_id == Some(self.owner) => {
                    debug!(
                        partition = %self.partition,
                        "Stored lease is at version {}, releasing that row",
                        row.lease_version
                    );
                    self.leases.release(&row).await
                }
                Ok(_) => Ok(false),
                Err(e) => Err(e),
            },
            other => other,
        };
        match released {
            Ok(true) => info!(partition = %self.partition, "Released lease"),
            Ok(false) => debug!(partition = %self.partition, "Lease already changed hands"),
            Err(e) => warn!(
                partition = %self.partition,
                error = %e,
                "Failed to release lease, it will expire"
            ),
        }
    }

    fn set_lease(&self, lease: Option<LeaseRow>) {
        *self.lease.lock() = lease;
    }

    fn lease_lost(&mut self) {
        self.set_lease(None);
        self.metrics.record_lease_lost();
        info!(partition = %self.partition, owner = %self.owner, "Lost lease");
        self.emit(TriggerEvent::LeaseLost {
            partition: self.partition.clone(),
            owner: self.owner,
        });
    }

    fn set_state(&self, state: SchedulerState) {
        let mut current = self.state.write();
        if *current != state {
            trace!(partition = %self.partition, "{:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    fn emit(&self, event: TriggerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

enum Delivery {
    Delivered,
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{
        handler_fn, HandlerError, MemoryLeaseStore, MemoryVersionStore, TableName, TableSchema,
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn table() -> TableName {
        TableName::new("dbo", "Orders")
    }

    fn versions() -> MemoryVersionStore {
        let store = MemoryVersionStore::new();
        store.create_table(TableSchema::new(
            table(),
            vec!["Id".into()],
            vec!["Id".into(), "Total".into()],
        ));
        store
    }

    fn scheduler(
        store: &MemoryVersionStore,
        leases: &MemoryLeaseStore,
        handler: impl crate::common::ChangeHandler + 'static,
        options: SchedulerOptions,
    ) -> PollingScheduler<MemoryVersionStore, MemoryLeaseStore> {
        let fetcher = BatchFetcher::new(
            store.clone(),
            TableSchema::new(table(), vec!["Id".into()], vec!["Id".into(), "Total".into()]),
        );
        PollingScheduler::new(
            "billing",
            OwnerId::new(),
            fetcher,
            leases.clone(),
            ChangeDispatcher::new(Arc::new(handler), Duration::from_secs(5)),
            PollingConfig::builder().batch_size(3).build().unwrap(),
            options,
        )
    }

    fn no_retry() -> SchedulerOptions {
        SchedulerOptions {
            retry: crate::common::RetryConfig::disabled(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_empty_poll_skips_checkpoint() {
        let store = versions();
        let leases = MemoryLeaseStore::default();
        let mut s = scheduler(&store, &leases, handler_fn(|_| async { Ok(()) }), no_retry());

        assert_eq!(s.poll_once(Utc::now()).await.unwrap(), CycleOutcome::Empty);
        let row = leases.row(s.partition()).unwrap();
        assert_eq!(row.last_processed_version, 0);
        assert_eq!(s.metrics().snapshot().checkpoints, 0);
    }

    #[tokio::test]
    async fn test_delivers_in_batches_and_checkpoints() {
        let store = versions();
        for id in 1..=5 {
            store.insert(&table(), json!({"Id": id, "Total": 1})).unwrap();
        }
        let leases = MemoryLeaseStore::default();
        let mut s = scheduler(&store, &leases, handler_fn(|_| async { Ok(()) }), no_retry());

        assert_eq!(
            s.poll_once(Utc::now()).await.unwrap(),
            CycleOutcome::Delivered {
                changes: 3,
                checkpoint: 3
            }
        );
        assert_eq!(
            s.poll_once(Utc::now()).await.unwrap(),
            CycleOutcome::Delivered {
                changes: 2,
                checkpoint: 5
            }
        );
        assert_eq!(s.poll_once(Utc::now()).await.unwrap(), CycleOutcome::Empty);
        assert_eq!(leases.row(s.partition()).unwrap().last_processed_version, 5);
    }

    #[tokio::test]
    async fn test_denied_when_other_owner_holds_lease() {
        let store = versions();
        let leases = MemoryLeaseStore::default();
        let now = Utc::now();
        let partition = PartitionKey::new("dbo.Orders", "billing");
        leases.try_claim(&partition, OwnerId::new(), now).await.unwrap();

        let mut s = scheduler(&store, &leases, handler_fn(|_| async { Ok(()) }), no_retry());
        assert_eq!(s.poll_once(now).await.unwrap(), CycleOutcome::Denied);
        assert!(s.lease().is_none());
    }

    #[tokio::test]
    async fn test_permanent_failure_stalls() {
        let store = versions();
        for id in 1..=2 {
            store.insert(&table(), json!({"Id": id})).unwrap();
        }
        let leases = MemoryLeaseStore::default();
        let mut s = scheduler(
            &store,
            &leases,
            handler_fn(|_| async { Err(HandlerError::permanent("constraint violated")) }),
            no_retry(),
        );
        let mut events = s.subscribe();

        let err = s.poll_once(Utc::now()).await.unwrap_err();
        assert!(matches!(err, TriggerError::PartitionStalled { .. }));
        assert_eq!(s.state(), SchedulerState::Stalled);
        assert_eq!(leases.row(s.partition()).unwrap().last_processed_version, 0);

        let mut stalled = false;
        while let Ok(event) = events.try_recv() {
            if let TriggerEvent::PartitionStalled { checkpoint, bound_version, .. } = event {
                assert_eq!(checkpoint, 0);
                assert_eq!(bound_version, 2);
                stalled = true;
            }
        }
        assert!(stalled);
    }

    #[tokio::test]
    async fn test_skip_policy_advances() {
        let store = versions();
        store.insert(&table(), json!({"Id": 1})).unwrap();
        let leases = MemoryLeaseStore::default();
        let mut s = scheduler(
            &store,
            &leases,
            handler_fn(|_| async { Err(HandlerError::permanent("bad")) }),
            SchedulerOptions {
                poison_batch: PoisonBatchPolicy::Skip,
                ..no_retry()
            },
        );

        assert_eq!(
            s.poll_once(Utc::now()).await.unwrap(),
            CycleOutcome::Skipped { checkpoint: 1 }
        );
        assert_eq!(s.metrics().snapshot().batches_skipped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failure_is_retried() {
        let store = versions();
        store.insert(&table(), json!({"Id": 1})).unwrap();
        let leases = MemoryLeaseStore::default();

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let handler = handler_fn(move |_| {
            let seen = seen.clone();
            async move {
                if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(HandlerError::retryable("busy"))
                } else {
                    Ok(())
                }
            }
        });
        let mut s = scheduler(&store, &leases, handler, SchedulerOptions::default());

        assert_eq!(
            s.poll_once(Utc::now()).await.unwrap(),
            CycleOutcome::Delivered {
                changes: 1,
                checkpoint: 1
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(s.metrics().snapshot().handler_retries, 2);
    }

    #[tokio::test]
    async fn test_source_outage_is_absorbed() {
        let store = versions();
        let leases = MemoryLeaseStore::default();
        let mut s = scheduler(&store, &leases, handler_fn(|_| async { Ok(()) }), no_retry());

        store.set_available(false);
        assert!(matches!(
            s.poll_once(Utc::now()).await.unwrap(),
            CycleOutcome::SourceUnavailable(_)
        ));
        assert_eq!(s.metrics().snapshot().source_errors, 1);

        store.set_available(true);
        assert_eq!(s.poll_once(Utc::now()).await.unwrap(), CycleOutcome::Empty);
    }

    #[tokio::test]
    async fn test_tracking_disabled_is_fatal() {
        let store = versions();
        let leases = MemoryLeaseStore::default();
        let mut s = scheduler(&store, &leases, handler_fn(|_| async { Ok(()) }), no_retry());

        store.set_tracking(&table(), false).unwrap();
        let err = s.poll_once(Utc::now()).await.unwrap_err();
        assert!(matches!(err, TriggerError::TrackingNotEnabled(_)));
        assert_eq!(s.state(), SchedulerState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_releases_lease_on_shutdown() {
        let store = versions();
        let leases = MemoryLeaseStore::default();
        let s = scheduler(&store, &leases, handler_fn(|_| async { Ok(()) }), no_retry());
        let partition = s.partition().clone();
        let state = s.state_handle();

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(s.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(2500)).await;
        shutdown.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(*state.read(), SchedulerState::Stopped);
        assert_eq!(leases.row(&partition).unwrap().owner_id, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_mid_dispatch_releases_renewed_lease() {
        let store = versions();
        store.insert(&table(), json!({"Id": 1})).unwrap();
        let leases = MemoryLeaseStore::new(Duration::from_secs(2));
        let handler = handler_fn(|_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        let s = scheduler(&store, &leases, handler, no_retry());
        let partition = s.partition().clone();

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(s.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(3500)).await;

        // Renewed every second while the handler runs
        let held = leases.row(&partition).unwrap();
        assert!(held.owner_id.is_some());
        assert!(held.lease_version > 1);

        shutdown.cancel();
        task.await.unwrap().unwrap();

        let row = leases.row(&partition).unwrap();
        assert_eq!(row.owner_id, None);
        assert_eq!(row.last_processed_version, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_retry_backoff_releases_lease() {
        let store = versions();
        store.insert(&table(), json!({"Id": 1})).unwrap();
        let leases = MemoryLeaseStore::new(Duration::from_secs(2));
        let handler = handler_fn(|_| async {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            Err(HandlerError::retryable("downstream busy"))
        });
        let options = SchedulerOptions {
            retry: crate::common::RetryConfig::builder()
                .max_retries(3)
                .retry_delay(Duration::from_secs(30))
                .max_delay(Duration::from_secs(60))
                .jitter(0.0)
                .build(),
            ..Default::default()
        };
        let s = scheduler(&store, &leases, handler, options);
        let partition = s.partition().clone();
        let mut events = s.subscribe();

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(s.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(matches!(
            events.try_recv(),
            Ok(TriggerEvent::LeaseAcquired { .. })
        ));
        assert!(matches!(
            events.try_recv(),
            Ok(TriggerEvent::HandlerRetry { attempt: 1, .. })
        ));
        assert!(leases.row(&partition).unwrap().lease_version > 1);

        shutdown.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(leases.row(&partition).unwrap().owner_id, None);
    }

    #[tokio::test]
    async fn test_release_uses_stored_row_when_local_copy_is_stale() {
        let store = versions();
        let leases = MemoryLeaseStore::default();
        let mut s = scheduler(&store, &leases, handler_fn(|_| async { Ok(()) }), no_retry());
        assert_eq!(s.poll_once(Utc::now()).await.unwrap(), CycleOutcome::Empty);
        let partition = s.partition().clone();

        // A renewal that reached the store but never came back
        let local = s.lease().unwrap();
        leases.renew(&local, Utc::now()).await.unwrap();
        assert_eq!(
            leases.row(&partition).unwrap().lease_version,
            local.lease_version + 1
        );

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        s.run(shutdown).await.unwrap();
        assert_eq!(leases.row(&partition).unwrap().owner_id, None);
    }

    #[tokio::test]
    async fn test_release_leaves_new_owner_alone() {
        let store = versions();
        let leases = MemoryLeaseStore::default();
        let mut s = scheduler(&store, &leases, handler_fn(|_| async { Ok(()) }), no_retry());
        assert_eq!(s.poll_once(Utc::now()).await.unwrap(), CycleOutcome::Empty);
        let partition = s.partition().clone();

        leases.expire(&partition);
        let other = OwnerId::new();
        assert!(leases
            .try_claim(&partition, other, Utc::now())
            .await
            .unwrap()
            .is_acquired());

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        s.run(shutdown).await.unwrap();
        assert_eq!(leases.row(&partition).unwrap().owner_id, Some(other));
    }
}
