//! # Common Trigger Types and Traits
//!
//! Database-agnostic engine shared by every backend:
//!
//! - [`VersionStore`] - Read access to a table's change log
//! - [`LeaseStore`] - Durable per-partition ownership and checkpoints
//! - [`BatchFetcher`] - Ordered batches above a checkpoint
//! - [`ChangeDispatcher`] - Handler invocation and failure classification
//! - [`PollingScheduler`] - Claim, fetch, dispatch, checkpoint loop
//! - [`ScaleEstimator`] - Worker-count hints for a scale controller
//! - [`TriggerMetrics`] - Counters exported through the `metrics` facade
//! - [`RetryConfig`] - Bounded exponential backoff
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      PollingScheduler                        │
//! │   claim/renew ──► fetch ──► dispatch ──► checkpoint ──► sleep│
//! └──────┬───────────────┬───────────┬──────────────┬────────────┘
//!        │               │           │              │
//!        ▼               ▼           ▼              ▼
//!   LeaseStore     BatchFetcher  ChangeDispatcher  LeaseStore
//!                        │           │
//!                        ▼           ▼
//!                  VersionStore  ChangeHandler
//!
//! ScaleEstimator ──► VersionStore + LeaseStore (own cadence)
//! ```

mod config;
mod dispatcher;
mod error;
mod event;
mod fetcher;
mod lease;
mod metrics;
mod resilience;
mod scale;
mod scheduler;
mod version_store;

pub use config::*;
pub use dispatcher::*;
pub use error::*;
pub use event::*;
pub use fetcher::*;
pub use lease::*;
pub use metrics::*;
pub use resilience::*;
pub use scale::*;
pub use scheduler::*;
pub use version_store::*;
