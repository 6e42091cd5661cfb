//! Shared fixtures for trigger integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use rivven_trigger::common::{MemoryLeaseStore, MemoryVersionStore, TableSchema};
use rivven_trigger::{ChangeBatch, ChangeHandler, HandlerError, TableName};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

static INIT: Once = Once::new();

/// Initialize test logging (idempotent)
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("rivven_trigger=debug".parse().unwrap()),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn products() -> TableName {
    TableName::new("dbo", "Products")
}

pub fn products_schema() -> TableSchema {
    TableSchema::new(
        products(),
        vec!["ProductId".into()],
        vec!["ProductId".into(), "Name".into(), "Cost".into()],
    )
}

/// A version store with an empty, tracked `dbo.Products`
pub fn product_store() -> MemoryVersionStore {
    let store = MemoryVersionStore::new();
    store.create_table(products_schema());
    store
}

/// Insert `count` products with ids starting at `first_id`, one version each.
pub fn insert_products(store: &MemoryVersionStore, first_id: i64, count: i64) {
    for id in first_id..first_id + count {
        store
            .insert(
                &products(),
                serde_json::json!({"ProductId": id, "Name": format!("p{}", id), "Cost": id * 10}),
            )
            .unwrap();
    }
}

/// Leases short enough for tests that wait out an expiry
pub fn short_leases() -> MemoryLeaseStore {
    MemoryLeaseStore::new(Duration::from_secs(1))
}

/// Handler that records every batch it accepts
#[derive(Clone, Default)]
pub struct RecordingHandler {
    batches: Arc<Mutex<Vec<ChangeBatch>>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<ChangeBatch> {
        self.batches.lock().clone()
    }

    /// Every delivered version, in delivery order
    pub fn versions(&self) -> Vec<i64> {
        self.batches
            .lock()
            .iter()
            .flat_map(|b| b.changes.iter().map(|c| c.version))
            .collect()
    }

    pub fn change_count(&self) -> usize {
        self.batches.lock().iter().map(|b| b.len()).sum()
    }
}

#[async_trait]
impl ChangeHandler for RecordingHandler {
    async fn handle(&self, batch: &ChangeBatch) -> Result<(), HandlerError> {
        self.batches.lock().push(batch.clone());
        Ok(())
    }
}

/// Handler that rejects every batch containing `poison_version`
#[derive(Clone)]
pub struct PoisonHandler {
    poison_version: i64,
    retryable: bool,
    pub inner: RecordingHandler,
    pub attempts: Arc<AtomicUsize>,
}

impl PoisonHandler {
    pub fn new(poison_version: i64, retryable: bool) -> Self {
        Self {
            poison_version,
            retryable,
            inner: RecordingHandler::new(),
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChangeHandler for PoisonHandler {
    async fn handle(&self, batch: &ChangeBatch) -> Result<(), HandlerError> {
        if batch.iter().any(|c| c.version == self.poison_version) {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            return Err(if self.retryable {
                HandlerError::retryable("downstream unavailable")
            } else {
                HandlerError::permanent("cannot decode row")
            });
        }
        self.inner.handle(batch).await
    }
}

/// Poll `condition` every 20ms until it holds or `limit` passes.
pub async fn wait_until<F, Fut>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition().await
}
