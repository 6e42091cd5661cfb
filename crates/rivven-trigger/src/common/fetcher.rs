//! Batch fetching
//!
//! Reads the next ordered slice of the change log above a lease's checkpoint.

use crate::common::{
    ChangeBatch, ChangeRecord, LeaseRow, PartitionKey, RawChange, Result, TableSchema,
    TriggerError, VersionStore,
};
use tracing::{trace, warn};

/// Changes read in one fetch
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedBatch {
    pub changes: Vec<ChangeRecord>,
    /// Highest version present, or the lower bound when empty
    pub bound_version: i64,
    /// Exclusive lower bound the fetch used
    pub from_version: i64,
}

impl FetchedBatch {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn into_batch(self, partition: PartitionKey) -> ChangeBatch {
        ChangeBatch {
            partition,
            changes: self.changes,
            bound_version: self.bound_version,
        }
    }
}

/// Fetches change batches for one table
pub struct BatchFetcher<V> {
    store: V,
    schema: TableSchema,
}

impl<V: VersionStore> BatchFetcher<V> {
    pub fn new(store: V, schema: TableSchema) -> Self {
        Self { store, schema }
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn store(&self) -> &V {
        &self.store
    }

    /// Fetch up to `batch_size` changes above the lease's checkpoint.
    ///
    /// Rows sharing a version are never split across batches. A full batch
    /// ending in a partial version group is cut back to the previous group.
    /// A single group larger than `batch_size` is returned whole.
    pub async fn fetch(&self, lease: &LeaseRow, batch_size: usize) -> Result<FetchedBatch> {
        let table = &self.schema.table;
        let limit = batch_size.max(1);
        let from_version = self.lower_bound(lease).await?;

        // One extra row tells whether the last version group is complete
        let mut raw = self
            .store
            .changes_since(table, from_version, limit + 1)
            .await?;
        check_order(&raw, from_version, table)?;

        if raw.len() > limit {
            raw.truncate(limit + 1);
            let next = raw.pop().map(|c| c.version);
            let first = raw[0].version;
            let last = raw[limit - 1].version;
            if next == Some(last) {
                if first == last {
                    raw = self.fetch_whole_group(from_version, limit).await?;
                } else {
                    raw.retain(|c| c.version < last);
                }
            }
        }

        let bound_version = raw.last().map(|c| c.version).unwrap_or(from_version);
        trace!(
            "Fetched {} changes from {} in ({}, {}]",
            raw.len(),
            table,
            from_version,
            bound_version
        );

        let changes = raw
            .into_iter()
            .map(|c| ChangeRecord::from_raw(c, &self.schema))
            .collect();

        Ok(FetchedBatch {
            changes,
            bound_version,
            from_version,
        })
    }

    /// Checkpoint clamped to the lowest one the change log still accepts.
    async fn lower_bound(&self, lease: &LeaseRow) -> Result<i64> {
        let checkpoint = lease.last_processed_version;
        let min_valid = self.store.min_valid_version(&self.schema.table).await?;
        if checkpoint < min_valid {
            warn!(
                "Checkpoint {} for {} is older than the retained change history (min valid {}); changes in between were lost",
                checkpoint, lease.partition, min_valid
            );
            return Ok(min_valid);
        }
        Ok(checkpoint)
    }

    /// Keep doubling the limit until one version group is complete.
    async fn fetch_whole_group(&self, from_version: i64, limit: usize) -> Result<Vec<RawChange>> {
        let table = &self.schema.table;
        let mut limit = limit;
        loop {
            limit = limit.saturating_mul(2);
            let mut raw = self.store.changes_since(table, from_version, limit).await?;
            check_order(&raw, from_version, table)?;

            let Some(first) = raw.first().map(|c| c.version) else {
                return Ok(raw);
            };
            let complete = raw.len() < limit || raw.iter().any(|c| c.version != first);
            if complete {
                raw.retain(|c| c.version == first);
                warn!(
                    "Version {} on {} has {} rows, more than the batch size; delivering it whole",
                    first,
                    table,
                    raw.len()
                );
                return Ok(raw);
            }
        }
    }
}

fn check_order(raw: &[RawChange], from_version: i64, table: &impl std::fmt::Display) -> Result<()> {
    let mut previous = from_version;
    for (i, change) in raw.iter().enumerate() {
        let ordered = if i == 0 {
            change.version > previous
        } else {
            change.version >= previous
        };
        if !ordered {
            return Err(TriggerError::invalid_state(format!(
                "change log for {} returned version {} after {}",
                table, change.version, previous
            )));
        }
        previous = change.version;
    }
    Ok(())
}
