//! Leases table
//!
//! One row per (table, consumer group). Every change after the first insert
//! is a compare-and-swap on `LeaseVersion`; an update that matches no row
//! means another worker wrote first and the caller is denied.

use super::client::SqlServerClient;
use super::error::SqlServerError;
use super::queries;
use crate::common::{
    expiry_after, ClaimDenied, ClaimResult, LeaseRow, LeaseStore, LeasesTable, OwnerId,
    PartitionKey, Result, TriggerError,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tiberius::Row;
use tracing::{debug, info};
use uuid::Uuid;

/// [`LeaseStore`] backed by a SQL Server table
pub struct SqlServerLeaseStore {
    client: Arc<SqlServerClient>,
    leases: LeasesTable,
    lease_duration: Duration,
}

impl SqlServerLeaseStore {
    pub fn new(client: Arc<SqlServerClient>, leases: LeasesTable, lease_duration: Duration) -> Self {
        Self {
            client,
            leases,
            lease_duration,
        }
    }

    pub fn leases_table(&self) -> &LeasesTable {
        &self.leases
    }

    /// Write `owner`, `expiry` and `checkpoint` if the row still has the
    /// version `expected` was read at.
    async fn swap(
        &self,
        expected: &LeaseRow,
        owner: Option<OwnerId>,
        expiry: Option<DateTime<Utc>>,
        checkpoint: i64,
    ) -> Result<ClaimResult> {
        let partition = &expected.partition;
        let owner: Option<Uuid> = owner.map(|o| *o.as_uuid());
        let expiry: Option<NaiveDateTime> = expiry.map(|e| e.naive_utc());

        let rows = self
            .client
            .query(
                &queries::update_lease(&self.leases),
                &[
                    &partition.table,
                    &partition.consumer_group,
                    &owner,
                    &expiry,
                    &checkpoint,
                    &expected.lease_version,
                ],
            )
            .await?;

        match rows.first() {
            Some(row) => Ok(ClaimResult::Acquired(parse_lease(partition, row)?)),
            None => self.denied(partition).await,
        }
    }

    async fn denied(&self, partition: &PartitionKey) -> Result<ClaimResult> {
        let denied = match self.load(partition).await? {
            Some(row) => ClaimDenied::from_row(&row),
            None => ClaimDenied::vanished(partition),
        };
        Ok(ClaimResult::Denied(denied))
    }

    async fn insert(
        &self,
        partition: &PartitionKey,
        owner: OwnerId,
        expiry: DateTime<Utc>,
    ) -> Result<ClaimResult> {
        let owner_id = *owner.as_uuid();
        let expiry = expiry.naive_utc();

        let rows = match self
            .client
            .try_query(
                &queries::insert_lease(&self.leases),
                &[
                    &partition.table,
                    &partition.consumer_group,
                    &owner_id,
                    &expiry,
                ],
            )
            .await
        {
            Ok(rows) => rows,
            Err(SqlServerError::DuplicateKey(msg)) => {
                debug!("Lost first-claim race for {}: {}", partition, msg);
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };

        match rows.first() {
            Some(row) => {
                info!("Created lease for {} owned by {}", partition, owner);
                Ok(ClaimResult::Acquired(parse_lease(partition, row)?))
            }
            None => self.denied(partition).await,
        }
    }
}

#[async_trait]
impl LeaseStore for SqlServerLeaseStore {
    async fn ensure_table(&self) -> Result<()> {
        self.client
            .batch(&queries::create_leases_table(&self.leases))
            .await?;
        debug!("Leases table {} ready", self.leases);
        Ok(())
    }

    fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    async fn load(&self, partition: &PartitionKey) -> Result<Option<LeaseRow>> {
        let rows = self
            .client
            .query(
                &queries::select_lease(&self.leases),
                &[&partition.table, &partition.consumer_group],
            )
            .await?;
        rows.first()
            .map(|row| parse_lease(partition, row))
            .transpose()
    }

    async fn try_claim(
        &self,
        partition: &PartitionKey,
        owner: OwnerId,
        now: DateTime<Utc>,
    ) -> Result<ClaimResult> {
        let expiry = expiry_after(now, self.lease_duration);

        match self.load(partition).await? {
            None => self.insert(partition, owner, expiry).await,
            Some(row) if row.is_claimable_by(owner, now) => {
                if row.owner_id != Some(owner) {
                    debug!(
                        "Taking over lease for {} from {:?}",
                        partition, row.owner_id
                    );
                }
                self.swap(&row, Some(owner), Some(expiry), row.last_processed_version)
                    .await
            }
            Some(row) => Ok(ClaimResult::Denied(ClaimDenied::from_row(&row))),
        }
    }

    async fn renew(&self, lease: &LeaseRow, now: DateTime<Utc>) -> Result<ClaimResult> {
        if lease.owner_id.is_none() {
            return Ok(ClaimResult::Denied(ClaimDenied::from_row(lease)));
        }
        let expiry = expiry_after(now, self.lease_duration);
        self.swap(lease, lease.owner_id, Some(expiry), lease.last_processed_version)
            .await
    }

    async fn checkpoint(&self, lease: &LeaseRow, new_version: i64) -> Result<ClaimResult> {
        if new_version <= lease.last_processed_version {
            return match self.load(&lease.partition).await? {
                Some(row)
                    if row.lease_version == lease.lease_version
                        && row.owner_id == lease.owner_id =>
                {
                    Ok(ClaimResult::Acquired(row))
                }
                Some(row) => Ok(ClaimResult::Denied(ClaimDenied::from_row(&row))),
                None => Ok(ClaimResult::Denied(ClaimDenied::vanished(&lease.partition))),
            };
        }
        self.swap(lease, lease.owner_id, lease.lease_expiry, new_version)
            .await
    }

    async fn release(&self, lease: &LeaseRow) -> Result<bool> {
        let result = self
            .swap(lease, None, None, lease.last_processed_version)
            .await?;
        Ok(result.is_acquired())
    }
}

fn parse_lease(partition: &PartitionKey, row: &Row) -> Result<LeaseRow> {
    let owner_id = row
        .try_get::<Uuid, _>(0)
        .map_err(|e| TriggerError::serialization(format!("OwnerId: {}", e)))?
        .map(OwnerId::from);
    let lease_expiry = row
        .try_get::<NaiveDateTime, _>(1)
        .map_err(|e| TriggerError::serialization(format!("LeaseExpiry: {}", e)))?
        .map(|naive| naive.and_utc());
    let last_processed_version = row
        .try_get::<i64, _>(2)
        .map_err(|e| TriggerError::serialization(format!("LastProcessedVersion: {}", e)))?
        .ok_or_else(|| TriggerError::serialization("NULL LastProcessedVersion"))?;
    let lease_version = row
        .try_get::<i64, _>(3)
        .map_err(|e| TriggerError::serialization(format!("LeaseVersion: {}", e)))?
        .ok_or_else(|| TriggerError::serialization("NULL LeaseVersion"))?;

    Ok(LeaseRow {
        partition: partition.clone(),
        owner_id,
        lease_expiry,
        last_processed_version,
        lease_version,
    })
}
