//! # Partition leases
//!
//! One durable row per (table, consumer group) records who owns the partition,
//! until when, and how far it has processed. Workers coordinate through this
//! row only.
//!
//! Every write is a compare-and-swap on [`LeaseRow::lease_version`]: a write
//! carries the version the caller last observed and succeeds only if the row
//! still has it. Two workers racing on the same row can never both succeed for
//! the same version.
//!
//! Losing a race is not an error. Lease operations return
//! [`ClaimResult::Denied`] and the scheduler backs off.

use crate::common::{PartitionKey, Result, TableName, TriggerError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Schema holding the leases tables
pub const LEASES_SCHEMA: &str = "rivven_trigger";

/// Opaque identity of one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(Uuid);

impl OwnerId {
    /// Generate a fresh random owner id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for OwnerId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for OwnerId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl FromStr for OwnerId {
    type Err = TriggerError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| TriggerError::serialization(format!("invalid owner id '{}': {}", s, e)))
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Durable ownership and checkpoint record for one partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRow {
    pub partition: PartitionKey,
    /// Current owner; `None` after a release
    pub owner_id: Option<OwnerId>,
    pub lease_expiry: Option<DateTime<Utc>>,
    /// Checkpoint: every version up to and including this one is processed
    pub last_processed_version: i64,
    /// Optimistic concurrency counter, bumped on every write
    pub lease_version: i64,
}

impl LeaseRow {
    /// True once the expiry has passed (or the row has no owner).
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match (self.owner_id, self.lease_expiry) {
            (Some(_), Some(expiry)) => expiry < now,
            _ => true,
        }
    }

    /// Whether `owner` may claim this row at `now`.
    pub fn is_claimable_by(&self, owner: OwnerId, now: DateTime<Utc>) -> bool {
        self.owner_id == Some(owner) || self.is_expired(now)
    }
}

/// Why a lease operation did not take effect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimDenied {
    pub partition: PartitionKey,
    /// Owner recorded in the row at the time of the attempt
    pub current_owner: Option<OwnerId>,
    pub lease_expiry: Option<DateTime<Utc>>,
}

impl ClaimDenied {
    pub(crate) fn from_row(row: &LeaseRow) -> Self {
        Self {
            partition: row.partition.clone(),
            current_owner: row.owner_id,
            lease_expiry: row.lease_expiry,
        }
    }

    pub(crate) fn vanished(partition: &PartitionKey) -> Self {
        Self {
            partition: partition.clone(),
            current_owner: None,
            lease_expiry: None,
        }
    }
}

impl fmt::Display for ClaimDenied {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.current_owner, &self.lease_expiry) {
            (Some(owner), Some(expiry)) => write!(
                f,
                "partition {} held by {} until {}",
                self.partition,
                owner,
                expiry.to_rfc3339()
            ),
            _ => write!(f, "partition {} changed concurrently", self.partition),
        }
    }
}

/// Outcome of a lease operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimResult {
    /// The write took effect; the row as it now stands
    Acquired(LeaseRow),
    /// Another worker holds the partition or changed the row first
    Denied(ClaimDenied),
}

impl ClaimResult {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }

    /// The lease row if the operation succeeded
    pub fn into_lease(self) -> Option<LeaseRow> {
        match self {
            Self::Acquired(row) => Some(row),
            Self::Denied(_) => None,
        }
    }
}

/// Persistent store of partition leases
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Create the backing table if it does not exist.
    async fn ensure_table(&self) -> Result<()>;

    /// How long a claim or renewal stays valid.
    fn lease_duration(&self) -> Duration;

    /// Read the current row without modifying it.
    async fn load(&self, partition: &PartitionKey) -> Result<Option<LeaseRow>>;

    /// Claim the partition. Succeeds when no row exists, the row is expired
    /// or released, or `owner` already holds it.
    async fn try_claim(
        &self,
        partition: &PartitionKey,
        owner: OwnerId,
        now: DateTime<Utc>,
    ) -> Result<ClaimResult>;

    /// Extend the expiry of a held lease.
    async fn renew(&self, lease: &LeaseRow, now: DateTime<Utc>) -> Result<ClaimResult>;

    /// Advance the checkpoint. A `new_version` at or below the current
    /// checkpoint leaves the row untouched.
    async fn checkpoint(&self, lease: &LeaseRow, new_version: i64) -> Result<ClaimResult>;

    /// Give the partition up so another worker can claim it immediately.
    /// Returns false when the lease had already changed hands.
    async fn release(&self, lease: &LeaseRow) -> Result<bool>;
}

#[async_trait]
impl<T: LeaseStore + ?Sized> LeaseStore for Arc<T> {
    async fn ensure_table(&self) -> Result<()> {
        (**self).ensure_table().await
    }

    fn lease_duration(&self) -> Duration {
        (**self).lease_duration()
    }

    async fn load(&self, partition: &PartitionKey) -> Result<Option<LeaseRow>> {
        (**self).load(partition).await
    }

    async fn try_claim(
        &self,
        partition: &PartitionKey,
        owner: OwnerId,
        now: DateTime<Utc>,
    ) -> Result<ClaimResult> {
        (**self).try_claim(partition, owner, now).await
    }

    async fn renew(&self, lease: &LeaseRow, now: DateTime<Utc>) -> Result<ClaimResult> {
        (**self).renew(lease, now).await
    }

    async fn checkpoint(&self, lease: &LeaseRow, new_version: i64) -> Result<ClaimResult> {
        (**self).checkpoint(lease, new_version).await
    }

    async fn release(&self, lease: &LeaseRow) -> Result<bool> {
        (**self).release(lease).await
    }
}

/// Compute `now + duration` for a lease expiry.
pub fn expiry_after(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    now + chrono::Duration::milliseconds(duration.as_millis().min(i64::MAX as u128) as i64)
}

// ============================================================================
// Leases table naming
// ============================================================================

/// Location of the leases table for one watched table
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeasesTable(TableName);

impl LeasesTable {
    /// Resolve the leases table for `table`, honouring an explicit name.
    ///
    /// The default is `[rivven_trigger].[Leases_<schema>_<table>]`.
    pub fn for_table(table: &TableName, explicit: Option<&str>) -> Self {
        let name = match explicit {
            Some(name) => name.trim().to_string(),
            None => format!("Leases_{}_{}", table.schema, table.name),
        };
        Self(TableName::new(LEASES_SCHEMA, name))
    }

    pub fn table(&self) -> &TableName {
        &self.0
    }

    /// Bracket-quoted, schema-qualified name
    pub fn quoted(&self) -> String {
        self.0.quoted()
    }
}

impl fmt::Display for LeasesTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// In-memory Lease Store
// ============================================================================

/// In-memory lease store.
///
/// Clones share state, so several schedulers in one process can compete for
/// the same partitions the way separate processes would through a database.
#[derive(Debug, Clone)]
pub struct MemoryLeaseStore {
    rows: Arc<Mutex<HashMap<PartitionKey, LeaseRow>>>,
    lease_duration: Duration,
    unavailable: Arc<AtomicBool>,
}

impl MemoryLeaseStore {
    pub fn new(lease_duration: Duration) -> Self {
        Self {
            rows: Arc::new(Mutex::new(HashMap::new())),
            lease_duration,
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Toggle a simulated outage.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Snapshot of a row, bypassing the outage toggle.
    pub fn row(&self, partition: &PartitionKey) -> Option<LeaseRow> {
        self.rows.lock().get(partition).cloned()
    }

    /// Move a row's expiry into the past, as if its owner had crashed.
    pub fn expire(&self, partition: &PartitionKey) {
        if let Some(row) = self.rows.lock().get_mut(partition) {
            row.lease_expiry = Some(DateTime::<Utc>::MIN_UTC);
        }
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TriggerError::source_unavailable(
                "memory lease store is offline",
            ));
        }
        Ok(())
    }

    /// Apply `update` to the row if its version still matches `lease`.
    fn compare_and_swap(
        &self,
        lease: &LeaseRow,
        update: impl FnOnce(&mut LeaseRow),
    ) -> Result<ClaimResult> {
        self.check_available()?;
        let mut rows = self.rows.lock();
        let Some(row) = rows.get_mut(&lease.partition) else {
            return Ok(ClaimResult::Denied(ClaimDenied::vanished(&lease.partition)));
        };
        if row.lease_version != lease.lease_version || row.owner_id != lease.owner_id {
            return Ok(ClaimResult::Denied(ClaimDenied::from_row(row)));
        }
        update(row);
        row.lease_version += 1;
        Ok(ClaimResult::Acquired(row.clone()))
    }
}

impl Default for MemoryLeaseStore {
    fn default() -> Self {
        Self::new(Duration::from_millis(crate::common::DEFAULT_LEASE_DURATION_MS))
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn ensure_table(&self) -> Result<()> {
        self.check_available()
    }

    fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    async fn load(&self, partition: &PartitionKey) -> Result<Option<LeaseRow>> {
        self.check_available()?;
        Ok(self.rows.lock().get(partition).cloned())
    }

    async fn try_claim(
        &self,
        partition: &PartitionKey,
        owner: OwnerId,
        now: DateTime<Utc>,
    ) -> Result<ClaimResult> {
        self.check_available()?;
        let expiry = expiry_after(now, self.lease_duration);
        let mut rows = self.rows.lock();

        match rows.get_mut(partition) {
            None => {
                let row = LeaseRow {
                    partition: partition.clone(),
                    owner_id: Some(owner),
                    lease_expiry: Some(expiry),
                    last_processed_version: 0,
                    lease_version: 1,
                };
                rows.insert(partition.clone(), row.clone());
                info!("Created lease for {} owned by {}", partition, owner);
                Ok(ClaimResult::Acquired(row))
            }
            Some(row) if row.is_claimable_by(owner, now) => {
                if row.owner_id != Some(owner) {
                    debug!(
                        "Taking over lease for {} from {:?}",
                        partition, row.owner_id
                    );
                }
                row.owner_id = Some(owner);
                row.lease_expiry = Some(expiry);
                row.lease_version += 1;
                Ok(ClaimResult::Acquired(row.clone()))
            }
            Some(row) => Ok(ClaimResult::Denied(ClaimDenied::from_row(row))),
        }
    }

    async fn renew(&self, lease: &LeaseRow, now: DateTime<Utc>) -> Result<ClaimResult> {
        if lease.owner_id.is_none() {
            return Ok(ClaimResult::Denied(ClaimDenied::from_row(lease)));
        }
        let expiry = expiry_after(now, self.lease_duration);
        self.compare_and_swap(lease, |row| row.lease_expiry = Some(expiry))
    }

    async fn checkpoint(&self, lease: &LeaseRow, new_version: i64) -> Result<ClaimResult> {
        self.check_available()?;
        {
            let rows = self.rows.lock();
            if let Some(row) = rows.get(&lease.partition) {
                if row.lease_version == lease.lease_version
                    && row.owner_id == lease.owner_id
                    && new_version <= row.last_processed_version
                {
                    return Ok(ClaimResult::Acquired(row.clone()));
                }
            }
        }
        self.compare_and_swap(lease, |row| row.last_processed_version = new_version)
    }

    async fn release(&self, lease: &LeaseRow) -> Result<bool> {
        let result = self.compare_and_swap(lease, |row| {
            row.owner_id = None;
            row.lease_expiry = None;
        })?;
        Ok(result.is_acquired())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> PartitionKey {
        PartitionKey::new("dbo.Products", "sync")
    }

    fn store() -> MemoryLeaseStore {
        MemoryLeaseStore::new(Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_first_claim_creates_row() {
        let store = store();
        let owner = OwnerId::new();
        let now = Utc::now();

        let lease = store
            .try_claim(&key(), owner, now)
            .await
            .unwrap()
            .into_lease()
            .unwrap();
        assert_eq!(lease.owner_id, Some(owner));
        assert_eq!(lease.last_processed_version, 0);
        assert_eq!(lease.lease_expiry, Some(expiry_after(now, Duration::from_secs(30))));
    }

    #[tokio::test]
    async fn test_competing_claim_is_denied() {
        let store = store();
        let a = OwnerId::new();
        let b = OwnerId::new();
        let now = Utc::now();

        assert!(store.try_claim(&key(), a, now).await.unwrap().is_acquired());
        match store.try_claim(&key(), b, now).await.unwrap() {
            ClaimResult::Denied(denied) => assert_eq!(denied.current_owner, Some(a)),
            other => panic!("expected denial, got {:?}", other),
        }

        // Owner can re-claim its own lease
        assert!(store.try_claim(&key(), a, now).await.unwrap().is_acquired());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let store = store();
        let a = OwnerId::new();
        let b = OwnerId::new();
        let now = Utc::now();

        let lease_a = store
            .try_claim(&key(), a, now)
            .await
            .unwrap()
            .into_lease()
            .unwrap();
        let later = now + chrono::Duration::seconds(31);
        let lease_b = store
            .try_claim(&key(), b, later)
            .await
            .unwrap()
            .into_lease()
            .unwrap();
        assert_eq!(lease_b.owner_id, Some(b));

        // The old owner's writes now fail
        assert!(!store.renew(&lease_a, later).await.unwrap().is_acquired());
        assert!(!store.checkpoint(&lease_a, 10).await.unwrap().is_acquired());
    }

    #[tokio::test]
    async fn test_stale_version_write_is_denied() {
        let store = store();
        let owner = OwnerId::new();
        let now = Utc::now();

        let lease = store
            .try_claim(&key(), owner, now)
            .await
            .unwrap()
            .into_lease()
            .unwrap();
        let renewed = store.renew(&lease, now).await.unwrap().into_lease().unwrap();
        assert_eq!(renewed.lease_version, lease.lease_version + 1);

        // Writing with the pre-renewal snapshot loses
        assert!(!store.checkpoint(&lease, 5).await.unwrap().is_acquired());
        assert!(store.checkpoint(&renewed, 5).await.unwrap().is_acquired());
    }

    #[tokio::test]
    async fn test_checkpoint_is_monotonic() {
        let store = store();
        let owner = OwnerId::new();
        let lease = store
            .try_claim(&key(), owner, Utc::now())
            .await
            .unwrap()
            .into_lease()
            .unwrap();

        let lease = store.checkpoint(&lease, 15).await.unwrap().into_lease().unwrap();
        assert_eq!(lease.last_processed_version, 15);

        let same = store.checkpoint(&lease, 12).await.unwrap().into_lease().unwrap();
        assert_eq!(same.last_processed_version, 15);
        assert_eq!(same.lease_version, lease.lease_version);

        let same = store.checkpoint(&lease, 15).await.unwrap().into_lease().unwrap();
        assert_eq!(same, lease);
    }

    #[tokio::test]
    async fn test_release_allows_immediate_claim() {
        let store = store();
        let a = OwnerId::new();
        let b = OwnerId::new();
        let now = Utc::now();

        let lease = store
            .try_claim(&key(), a, now)
            .await
            .unwrap()
            .into_lease()
            .unwrap();
        let lease = store.checkpoint(&lease, 7).await.unwrap().into_lease().unwrap();
        assert!(store.release(&lease).await.unwrap());

        let taken = store
            .try_claim(&key(), b, now)
            .await
            .unwrap()
            .into_lease()
            .unwrap();
        assert_eq!(taken.owner_id, Some(b));
        assert_eq!(taken.last_processed_version, 7);

        // Releasing a stale lease is a no-op
        assert!(!store.release(&lease).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let store = store();
        let now = Utc::now();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.try_claim(&key(), OwnerId::new(), now).await.unwrap()
            }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap().is_acquired() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_racing_writes_one_wins_per_version() {
        let store = store();
        let owner = OwnerId::new();
        let lease = store
            .try_claim(&key(), owner, Utc::now())
            .await
            .unwrap()
            .into_lease()
            .unwrap();

        // Same snapshot, two writers: a checkpoint and a renewal
        let first = store.checkpoint(&lease, 3).await.unwrap();
        let second = store.renew(&lease, Utc::now()).await.unwrap();
        assert!(first.is_acquired());
        assert!(!second.is_acquired());
    }

    #[tokio::test]
    async fn test_outage() {
        let store = store();
        store.set_available(false);
        let err = store
            .try_claim(&key(), OwnerId::new(), Utc::now())
            .await
            .unwrap_err();
        assert!(err.is_retriable());
    }

    #[test]
    fn test_leases_table_naming() {
        let table = TableName::new("dbo", "Products");
        let default = LeasesTable::for_table(&table, None);
        assert_eq!(default.quoted(), "[rivven_trigger].[Leases_dbo_Products]");

        let explicit = LeasesTable::for_table(&table, Some("MyLeases"));
        assert_eq!(explicit.quoted(), "[rivven_trigger].[MyLeases]");
    }

    #[test]
    fn test_owner_id_parse() {
        let owner = OwnerId::new();
        let parsed: OwnerId = owner.to_string().parse().unwrap();
        assert_eq!(parsed, owner);
        assert!("not-a-uuid".parse::<OwnerId>().is_err());
    }
}
