//! Trigger lifecycle
//!
//! [`ChangeTrigger`] binds one table and consumer group to a handler. Calling
//! [`ChangeTrigger::start`] validates the table, makes sure the leases table
//! exists and spawns the polling loop plus a scale estimator; the returned
//! [`TriggerHandle`] stops them again.

use crate::common::{
    BatchFetcher, ChangeDispatcher, ChangeHandler, LeaseStore, OwnerId, PartitionKey,
    PollingConfig, PollingScheduler, Result, ScaleEstimator, ScaleSignal, ScaleTarget,
    SchedulerOptions, SchedulerState, TableName, TriggerError, TriggerEvent, TriggerMetrics,
    VersionStore, EVENT_CHANNEL_CAPACITY,
};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A configured, not yet running trigger
pub struct ChangeTrigger {
    versions: Arc<dyn VersionStore>,
    leases: Arc<dyn LeaseStore>,
    table: TableName,
    consumer_group: String,
    polling: PollingConfig,
    options: SchedulerOptions,
    handler: Arc<dyn ChangeHandler>,
    owner: OwnerId,
}

impl ChangeTrigger {
    pub fn builder() -> ChangeTriggerBuilder {
        ChangeTriggerBuilder::default()
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    /// Validate the table and start polling.
    ///
    /// Fails with `TrackingNotEnabled` or `SchemaIncompatible` before any
    /// task is spawned.
    pub async fn start(self) -> Result<TriggerHandle> {
        let schema = self.versions.table_schema(&self.table).await?;
        schema.validate()?;
        self.leases.ensure_table().await?;

        let fetcher = BatchFetcher::new(self.versions.clone(), schema);
        let dispatcher = ChangeDispatcher::new(self.handler, self.options.handler_timeout());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let scheduler = PollingScheduler::new(
            self.consumer_group,
            self.owner,
            fetcher,
            self.leases.clone(),
            dispatcher,
            self.polling.clone(),
            self.options.clone(),
        )
        .with_event_sender(events.clone());

        let partition = scheduler.partition().clone();
        let metrics = scheduler.metrics();
        let state = scheduler.state_handle();

        let mut estimator = ScaleEstimator::new(self.polling.max_changes_per_worker());
        estimator.add_target(ScaleTarget {
            table: self.table,
            partition: partition.clone(),
            versions: self.versions,
            leases: self.leases,
            metrics: Some(metrics.clone()),
        });
        let scale = estimator.signal();

        let shutdown = CancellationToken::new();
        let scheduler_task = tokio::spawn(scheduler.run(shutdown.clone()));
        let estimator_task = tokio::spawn(
            estimator.run(self.options.scale_sample_interval(), shutdown.clone()),
        );

        info!(partition = %partition, owner = %self.owner, "Change trigger started");

        Ok(TriggerHandle {
            partition,
            owner: self.owner,
            shutdown,
            scheduler: Some(scheduler_task),
            estimator: Some(estimator_task),
            events,
            state,
            metrics,
            scale,
        })
    }
}

/// Builder for [`ChangeTrigger`]
#[derive(Default)]
pub struct ChangeTriggerBuilder {
    versions: Option<Arc<dyn VersionStore>>,
    leases: Option<Arc<dyn LeaseStore>>,
    table: Option<TableName>,
    consumer_group: Option<String>,
    polling: PollingConfig,
    options: SchedulerOptions,
    handler: Option<Arc<dyn ChangeHandler>>,
    owner: Option<OwnerId>,
}

impl ChangeTriggerBuilder {
    pub fn versions(mut self, versions: Arc<dyn VersionStore>) -> Self {
        self.versions = Some(versions);
        self
    }

    pub fn leases(mut self, leases: Arc<dyn LeaseStore>) -> Self {
        self.leases = Some(leases);
        self
    }

    pub fn table(mut self, table: TableName) -> Self {
        self.table = Some(table);
        self
    }

    pub fn consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = Some(group.into());
        self
    }

    pub fn polling(mut self, polling: PollingConfig) -> Self {
        self.polling = polling;
        self
    }

    pub fn options(mut self, options: SchedulerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn handler(mut self, handler: impl ChangeHandler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Use a fixed owner identity instead of a fresh one.
    pub fn owner(mut self, owner: OwnerId) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn build(self) -> Result<ChangeTrigger> {
        let versions = self
            .versions
            .ok_or_else(|| TriggerError::config("a version store is required"))?;
        let leases = self
            .leases
            .ok_or_else(|| TriggerError::config("a lease store is required"))?;
        let table = self
            .table
            .ok_or_else(|| TriggerError::config("a table is required"))?;
        let handler = self
            .handler
            .ok_or_else(|| TriggerError::config("a handler is required"))?;
        let consumer_group = self
            .consumer_group
            .filter(|g| !g.trim().is_empty())
            .ok_or_else(|| TriggerError::config("a non-empty consumer group is required"))?;

        self.options.validate()?;

        let renew_every = leases.lease_duration() / 2;
        if renew_every < self.polling.polling_interval() {
            return Err(TriggerError::config(format!(
                "lease duration {:?} is too short for a polling interval of {:?}",
                leases.lease_duration(),
                self.polling.polling_interval()
            )));
        }

        Ok(ChangeTrigger {
            versions,
            leases,
            table,
            consumer_group,
            polling: self.polling,
            options: self.options,
            handler,
            owner: self.owner.unwrap_or_default(),
        })
    }
}

/// Handle to a running trigger
///
/// Dropping the handle cancels the trigger without waiting for it.
pub struct TriggerHandle {
    partition: PartitionKey,
    owner: OwnerId,
    shutdown: CancellationToken,
    scheduler: Option<JoinHandle<Result<()>>>,
    estimator: Option<JoinHandle<()>>,
    events: broadcast::Sender<TriggerEvent>,
    state: Arc<RwLock<SchedulerState>>,
    metrics: Arc<TriggerMetrics>,
    scale: ScaleSignal,
}

impl TriggerHandle {
    pub fn partition(&self) -> &PartitionKey {
        &self.partition
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.read()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TriggerEvent> {
        self.events.subscribe()
    }

    pub fn metrics(&self) -> Arc<TriggerMetrics> {
        self.metrics.clone()
    }

    pub fn scale_signal(&self) -> ScaleSignal {
        self.scale.clone()
    }

    /// True once the polling loop has exited.
    pub fn is_finished(&self) -> bool {
        self.scheduler
            .as_ref()
            .map(|task| task.is_finished())
            .unwrap_or(true)
    }

    /// Stop polling, release the lease and wait for both tasks.
    ///
    /// Returns the error that halted the partition, if it halted before the
    /// stop request.
    pub async fn stop(mut self) -> Result<()> {
        self.shutdown.cancel();
        self.finish().await
    }

    /// Wait until the polling loop ends on its own (stall or fatal error),
    /// then stop the estimator.
    pub async fn join(mut self) -> Result<()> {
        let result = match self.scheduler.take() {
            Some(task) => flatten(task.await),
            None => Ok(()),
        };
        self.shutdown.cancel();
        if let Some(task) = self.estimator.take() {
            if let Err(e) = task.await {
                warn!(partition = %self.partition, "Scale estimator task failed: {}", e);
            }
        }
        result
    }

    async fn finish(&mut self) -> Result<()> {
        let result = match self.scheduler.take() {
            Some(task) => flatten(task.await),
            None => Ok(()),
        };
        if let Some(task) = self.estimator.take() {
            if let Err(e) = task.await {
                warn!(partition = %self.partition, "Scale estimator task failed: {}", e);
            }
        }
        info!(partition = %self.partition, "Change trigger stopped");
        result
    }
}

impl Drop for TriggerHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn flatten(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    joined.map_err(|e| TriggerError::other(format!("scheduler task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{
        handler_fn, MemoryLeaseStore, MemoryVersionStore, TableSchema, CHANGE_VERSION_COLUMN,
    };
    use std::time::Duration;

    fn store_with_table(table: &TableName) -> MemoryVersionStore {
        let store = MemoryVersionStore::new();
        store.create_table(TableSchema::new(
            table.clone(),
            vec!["Id".into()],
            vec!["Id".into(), "Name".into()],
        ));
        store
    }

    fn builder(versions: MemoryVersionStore, table: TableName) -> ChangeTriggerBuilder {
        ChangeTrigger::builder()
            .versions(Arc::new(versions))
            .leases(Arc::new(MemoryLeaseStore::default()))
            .table(table)
            .consumer_group("g")
            .handler(handler_fn(|_| async { Ok(()) }))
    }

    #[test]
    fn test_build_requires_fields() {
        let err = ChangeTrigger::builder().build().err().unwrap();
        assert!(matches!(err, TriggerError::Config(_)));

        let table = TableName::new("dbo", "T");
        let err = builder(store_with_table(&table), table)
            .consumer_group("  ")
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("consumer group"));
    }

    #[test]
    fn test_build_rejects_short_lease() {
        let table = TableName::new("dbo", "T");
        let err = builder(store_with_table(&table), table)
            .leases(Arc::new(MemoryLeaseStore::new(Duration::from_millis(1500))))
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("too short"));
    }

    #[tokio::test]
    async fn test_start_rejects_untracked_table() {
        let table = TableName::new("dbo", "T");
        let store = MemoryVersionStore::new();
        store.create_untracked_table(TableSchema::new(
            table.clone(),
            vec!["Id".into()],
            vec!["Id".into()],
        ));

        let err = builder(store, table).build().unwrap().start().await.err().unwrap();
        assert!(matches!(err, TriggerError::TrackingNotEnabled(_)));
    }

    #[tokio::test]
    async fn test_start_rejects_reserved_column() {
        let table = TableName::new("dbo", "T");
        let store = MemoryVersionStore::new();
        store.create_table(TableSchema::new(
            table.clone(),
            vec!["Id".into()],
            vec!["Id".into(), CHANGE_VERSION_COLUMN.into()],
        ));

        let err = builder(store, table).build().unwrap().start().await.err().unwrap();
        assert!(matches!(err, TriggerError::SchemaIncompatible(_)));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let table = TableName::new("dbo", "T");
        let handle = builder(store_with_table(&table), table)
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert_eq!(handle.partition().to_string(), "dbo.T/g");
        handle.stop().await.unwrap();
    }
}
