//! # Version Store
//!
//! Read access to a table's change log. The engine never writes through this
//! trait; the change log is owned by the database.
//!
//! | Store | Use Case |
//! |-------|----------|
//! | `MemoryVersionStore` | Tests, local development |
//! | `SqlServerVersionStore` | SQL Server change tracking (feature `sqlserver`) |
//!
//! Versions are monotonic per table. Some change logs give every row touched
//! by one transaction the same version, so consumers must not assume versions
//! are unique across rows.

use crate::common::{ChangeOperation, RawChange, Result, TableName, TableSchema, TriggerError};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Read-only view of a table's change log
#[async_trait]
pub trait VersionStore: Send + Sync {
    /// Latest committed change version visible to a consistent read.
    async fn current_version(&self, table: &TableName) -> Result<i64>;

    /// Lowest checkpoint the change log can still resume from.
    ///
    /// This is an exclusive lower bound, the same contract as SQL Server's
    /// `CHANGE_TRACKING_MIN_VALID_VERSION`: `changes_since(table, v, ..)` is
    /// complete for every `v >= min_valid_version`. A checkpoint below it has
    /// lost history, and fetching resumes from this value.
    async fn min_valid_version(&self, table: &TableName) -> Result<i64>;

    /// Changes with `version > from_version`, ascending, at most `limit`.
    async fn changes_since(
        &self,
        table: &TableName,
        from_version: i64,
        limit: usize,
    ) -> Result<Vec<RawChange>>;

    /// Describe the table. Fails with `TrackingNotEnabled` when the table has
    /// no change log.
    async fn table_schema(&self, table: &TableName) -> Result<TableSchema>;
}

#[async_trait]
impl<T: VersionStore + ?Sized> VersionStore for Arc<T> {
    async fn current_version(&self, table: &TableName) -> Result<i64> {
        (**self).current_version(table).await
    }

    async fn min_valid_version(&self, table: &TableName) -> Result<i64> {
        (**self).min_valid_version(table).await
    }

    async fn changes_since(
        &self,
        table: &TableName,
        from_version: i64,
        limit: usize,
    ) -> Result<Vec<RawChange>> {
        (**self).changes_since(table, from_version, limit).await
    }

    async fn table_schema(&self, table: &TableName) -> Result<TableSchema> {
        (**self).table_schema(table).await
    }
}

// ============================================================================
// In-memory Version Store
// ============================================================================

#[derive(Debug)]
struct MemoryTable {
    schema: TableSchema,
    tracking: bool,
    log: Vec<RawChange>,
    current_version: i64,
    min_valid_version: i64,
}

/// In-memory change log for tests and local development.
///
/// Each table keeps its own version counter. [`commit`](Self::commit) records
/// several rows under one shared version, the way a database transaction
/// does. [`set_available`](Self::set_available) simulates an outage: every
/// call then fails with `SourceUnavailable`.
#[derive(Debug, Clone, Default)]
pub struct MemoryVersionStore {
    tables: Arc<RwLock<HashMap<TableName, MemoryTable>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryVersionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table with change tracking enabled.
    pub fn create_table(&self, schema: TableSchema) {
        self.register(schema, true);
    }

    /// Register a table without a change log.
    pub fn create_untracked_table(&self, schema: TableSchema) {
        self.register(schema, false);
    }

    fn register(&self, schema: TableSchema, tracking: bool) {
        let table = schema.table.clone();
        self.tables.write().insert(
            table,
            MemoryTable {
                schema,
                tracking,
                log: Vec::new(),
                current_version: 0,
                min_valid_version: 0,
            },
        );
    }

    /// Enable or disable change tracking for a registered table.
    pub fn set_tracking(&self, table: &TableName, enabled: bool) -> Result<()> {
        let mut tables = self.tables.write();
        let entry = tables.get_mut(table).ok_or_else(|| missing_table(table))?;
        entry.tracking = enabled;
        Ok(())
    }

    /// Toggle the simulated outage.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Record an insert. Returns the assigned version.
    pub fn insert(&self, table: &TableName, row: serde_json::Value) -> Result<i64> {
        self.commit(table, vec![(ChangeOperation::Insert, row)])
    }

    /// Record an update. Returns the assigned version.
    pub fn update(&self, table: &TableName, row: serde_json::Value) -> Result<i64> {
        self.commit(table, vec![(ChangeOperation::Update, row)])
    }

    /// Record a delete. Only the key columns of `row` are kept.
    pub fn delete(&self, table: &TableName, row: serde_json::Value) -> Result<i64> {
        self.commit(table, vec![(ChangeOperation::Delete, row)])
    }

    /// Record several changes under one shared version.
    pub fn commit(
        &self,
        table: &TableName,
        changes: Vec<(ChangeOperation, serde_json::Value)>,
    ) -> Result<i64> {
        let mut tables = self.tables.write();
        let entry = tables.get_mut(table).ok_or_else(|| missing_table(table))?;
        if !entry.tracking {
            return Err(tracking_disabled(table));
        }

        let version = entry.current_version + 1;
        let mut records = Vec::with_capacity(changes.len());
        for (operation, row) in changes {
            let serde_json::Value::Object(mut row) = row else {
                return Err(TriggerError::serialization(format!(
                    "row for {} must be a JSON object",
                    table
                )));
            };
            if operation == ChangeOperation::Delete {
                let keys = &entry.schema.primary_key;
                row.retain(|column, _| keys.contains(column));
            }
            records.push(RawChange::new(version, operation, row));
        }
        entry.log.extend(records);
        entry.current_version = version;

        debug!("Committed version {} on {}", version, table);
        Ok(version)
    }

    /// Drop history older than `version`, like change-log retention cleanup.
    ///
    /// Afterwards the lowest valid checkpoint is `version - 1`.
    pub fn purge_before(&self, table: &TableName, version: i64) -> Result<()> {
        let mut tables = self.tables.write();
        let entry = tables.get_mut(table).ok_or_else(|| missing_table(table))?;
        entry.log.retain(|c| c.version >= version);
        entry.min_valid_version = entry.min_valid_version.max(version - 1);
        Ok(())
    }

    /// Number of entries currently retained for a table.
    pub fn log_len(&self, table: &TableName) -> usize {
        self.tables
            .read()
            .get(table)
            .map(|t| t.log.len())
            .unwrap_or(0)
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TriggerError::source_unavailable(
                "memory version store is offline",
            ));
        }
        Ok(())
    }

    fn with_tracked<T>(
        &self,
        table: &TableName,
        f: impl FnOnce(&MemoryTable) -> T,
    ) -> Result<T> {
        self.check_available()?;
        let tables = self.tables.read();
        let entry = tables.get(table).ok_or_else(|| missing_table(table))?;
        if !entry.tracking {
            return Err(tracking_disabled(table));
        }
        Ok(f(entry))
    }
}

fn missing_table(table: &TableName) -> TriggerError {
    TriggerError::schema_incompatible(format!("table {} does not exist", table))
}

fn tracking_disabled(table: &TableName) -> TriggerError {
    TriggerError::tracking_not_enabled(format!(
        "change tracking is not enabled on table {}",
        table
    ))
}

#[async_trait]
impl VersionStore for MemoryVersionStore {
    async fn current_version(&self, table: &TableName) -> Result<i64> {
        self.with_tracked(table, |t| t.current_version)
    }

    async fn min_valid_version(&self, table: &TableName) -> Result<i64> {
        self.with_tracked(table, |t| t.min_valid_version)
    }

    async fn changes_since(
        &self,
        table: &TableName,
        from_version: i64,
        limit: usize,
    ) -> Result<Vec<RawChange>> {
        self.with_tracked(table, |t| {
            t.log
                .iter()
                .filter(|c| c.version > from_version)
                .take(limit)
                .cloned()
                .collect()
        })
    }

    async fn table_schema(&self, table: &TableName) -> Result<TableSchema> {
        self.with_tracked(table, |t| t.schema.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn products() -> TableName {
        TableName::new("dbo", "Products")
    }

    fn store() -> MemoryVersionStore {
        let store = MemoryVersionStore::new();
        store.create_table(TableSchema::new(
            products(),
            vec!["ProductId".into()],
            vec!["ProductId".into(), "Name".into()],
        ));
        store
    }

    #[tokio::test]
    async fn test_versions_increase() {
        let store = store();
        let table = products();
        assert_eq!(store.current_version(&table).await.unwrap(), 0);

        let v1 = store
            .insert(&table, json!({"ProductId": 1, "Name": "a"}))
            .unwrap();
        let v2 = store
            .update(&table, json!({"ProductId": 1, "Name": "b"}))
            .unwrap();
        assert!(v2 > v1);
        assert_eq!(store.current_version(&table).await.unwrap(), v2);
    }

    #[tokio::test]
    async fn test_changes_since_is_exclusive_and_limited() {
        let store = store();
        let table = products();
        for id in 1..=5 {
            store
                .insert(&table, json!({"ProductId": id, "Name": "x"}))
                .unwrap();
        }

        let changes = store.changes_since(&table, 2, 2).await.unwrap();
        let versions: Vec<i64> = changes.iter().map(|c| c.version).collect();
        assert_eq!(versions, vec![3, 4]);

        assert!(store.changes_since(&table, 5, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_keeps_only_key_columns() {
        let store = store();
        let table = products();
        store
            .delete(&table, json!({"ProductId": 9, "Name": "gone"}))
            .unwrap();

        let changes = store.changes_since(&table, 0, 10).await.unwrap();
        assert_eq!(changes[0].operation, ChangeOperation::Delete);
        assert_eq!(changes[0].row.len(), 1);
        assert_eq!(changes[0].row["ProductId"], 9);
    }

    #[tokio::test]
    async fn test_commit_shares_version() {
        let store = store();
        let table = products();
        let version = store
            .commit(
                &table,
                vec![
                    (ChangeOperation::Insert, json!({"ProductId": 1})),
                    (ChangeOperation::Insert, json!({"ProductId": 2})),
                ],
            )
            .unwrap();

        let changes = store.changes_since(&table, 0, 10).await.unwrap();
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| c.version == version));
    }

    #[tokio::test]
    async fn test_tracking_disabled() {
        let store = store();
        let table = products();
        store.set_tracking(&table, false).unwrap();

        let err = store.current_version(&table).await.unwrap_err();
        assert!(matches!(err, TriggerError::TrackingNotEnabled(_)));
        assert!(!err.is_retriable());
        assert!(store.table_schema(&table).await.is_err());
    }

    #[tokio::test]
    async fn test_outage_is_retriable() {
        let store = store();
        store.set_available(false);

        let err = store.current_version(&products()).await.unwrap_err();
        assert!(matches!(err, TriggerError::SourceUnavailable(_)));
        assert!(err.is_retriable());

        store.set_available(true);
        assert!(store.current_version(&products()).await.is_ok());
    }

    #[tokio::test]
    async fn test_purge_advances_min_valid() {
        let store = store();
        let table = products();
        for id in 1..=4 {
            store.insert(&table, json!({"ProductId": id})).unwrap();
        }
        store.purge_before(&table, 3).unwrap();

        // Versions 3 and 4 remain, so a checkpoint of 2 is the lowest valid one
        assert_eq!(store.min_valid_version(&table).await.unwrap(), 2);
        assert_eq!(store.log_len(&table), 2);
    }
}
