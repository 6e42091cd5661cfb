//! # rivven-trigger - Change-Feed Triggers for Rivven
//!
//! Watches change-tracked tables and delivers ordered batches of row changes
//! to a handler. Work is split into partitions (one per table and consumer
//! group); a partition is owned by at most one worker at a time through a
//! durable lease, and progress is checkpointed in the lease row.
//!
//! ## Features
//!
//! - `sqlserver` - SQL Server change tracking backend and the `rivven-trigger` binary
//! - `full` - All backends
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐    ┌─────────────┐    ┌────────────────┐
//! │ Change log │◄───│ BatchFetcher│◄───│                │
//! │ (Version   │    └─────────────┘    │                │     ┌───────────────┐
//! │  Store)    │                       │PollingScheduler│────►│ ChangeHandler │
//! └────────────┘    ┌─────────────┐    │                │     └───────────────┘
//!                   │ LeaseStore  │◄───│                │
//!                   │ (ownership, │    └────────────────┘
//!                   │ checkpoint) │◄───── ScaleEstimator ──► ScaleSignal
//!                   └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn example() -> rivven_trigger::Result<()> {
//! use rivven_trigger::common::{MemoryLeaseStore, MemoryVersionStore, TableName, TableSchema};
//! use rivven_trigger::{handler_fn, ChangeTrigger};
//! use std::sync::Arc;
//!
//! let versions = MemoryVersionStore::new();
//! let table = TableName::new("dbo", "Products");
//! versions.create_table(TableSchema::new(
//!     table.clone(),
//!     vec!["Id".into()],
//!     vec!["Id".into(), "Name".into()],
//! ));
//!
//! let handle = ChangeTrigger::builder()
//!     .versions(Arc::new(versions))
//!     .leases(Arc::new(MemoryLeaseStore::default()))
//!     .table(table)
//!     .consumer_group("billing")
//!     .handler(handler_fn(|batch| async move {
//!         for change in batch.iter() {
//!             println!("{} v{}: {}", change.operation, change.version, change.payload);
//!         }
//!         Ok(())
//!     }))
//!     .build()?
//!     .start()
//!     .await?;
//!
//! handle.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Public API Organization
//!
//! ### Tier 1: Core Types (crate root)
//! What a handler author needs - `ChangeTrigger`, `ChangeBatch`, `ChangeRecord`,
//! `ChangeHandler`, `HandlerError`.
//!
//! ### Tier 2: Operations (crate root)
//! Configuration, events, scale signal and metrics.
//!
//! ### Tier 3: Engine Types (`common` module)
//! Store traits, the fetcher, dispatcher and scheduler for custom backends.

pub mod common;
pub mod trigger;

// =============================================================================
// TIER 1: Core Types
// =============================================================================

pub use common::{
    handler_fn, ChangeBatch, ChangeHandler, ChangeOperation, ChangeRecord, HandlerError,
    PartitionKey, Result, TableName, TriggerError,
};
pub use trigger::{ChangeTrigger, ChangeTriggerBuilder, TriggerHandle};

// =============================================================================
// TIER 2: Operations
// =============================================================================

// Configuration
pub use common::{
    BindingConfig, LeaseConfig, PoisonBatchPolicy, PollingConfig, RetryConfig, SchedulerOptions,
    TriggerConfig,
};

// Events and state
pub use common::{SchedulerState, TriggerEvent};

// Scaling and metrics
pub use common::{ScaleSignal, ScaleVote, TriggerMetrics, TriggerMetricsSnapshot};

// =============================================================================
// TIER 3: Engine Types - Available via `common::` module
// =============================================================================
// Stores:
//   - common::VersionStore, MemoryVersionStore
//   - common::LeaseStore, MemoryLeaseStore, LeaseRow, ClaimResult, LeasesTable
//
// Pipeline:
//   - common::BatchFetcher, ChangeDispatcher, PollingScheduler, ScaleEstimator

// SQL Server change tracking - feature-gated
#[cfg(feature = "sqlserver")]
pub mod sqlserver;
