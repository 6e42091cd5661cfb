//! # SQL Server Change Tracking
//!
//! Backend for tables with SQL Server change tracking enabled.
//!
//! ## Prerequisites
//!
//! ```sql
//! ALTER DATABASE shop SET CHANGE_TRACKING = ON (CHANGE_RETENTION = 2 DAYS, AUTO_CLEANUP = ON);
//! ALTER TABLE dbo.Products ENABLE CHANGE_TRACKING;
//! ```
//!
//! The login needs `VIEW CHANGE TRACKING` and `SELECT` on the watched tables,
//! plus permission to create the `rivven_trigger` schema on first start (or
//! an administrator creates it ahead of time).
//!
//! ## Example
//!
//! ```rust,no_run
//! # async fn example() -> rivven_trigger::Result<()> {
//! use rivven_trigger::common::{LeasesTable, TableName};
//! use rivven_trigger::sqlserver::{
//!     SqlServerClient, SqlServerConfig, SqlServerLeaseStore, SqlServerVersionStore,
//! };
//! use rivven_trigger::{handler_fn, ChangeTrigger};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let config = SqlServerConfig::builder()
//!     .host("localhost")
//!     .username("sa")
//!     .password("password")
//!     .database("shop")
//!     .build()?;
//! let client = Arc::new(SqlServerClient::connect(config).await?);
//!
//! let table = TableName::parse("dbo.Products")?;
//! let leases = SqlServerLeaseStore::new(
//!     client.clone(),
//!     LeasesTable::for_table(&table, None),
//!     Duration::from_secs(30),
//! );
//!
//! let handle = ChangeTrigger::builder()
//!     .versions(Arc::new(SqlServerVersionStore::new(client)))
//!     .leases(Arc::new(leases))
//!     .table(table)
//!     .consumer_group("search-index")
//!     .handler(handler_fn(|batch| async move {
//!         println!("{} changes up to {}", batch.len(), batch.bound_version);
//!         Ok(())
//!     }))
//!     .build()?
//!     .start()
//!     .await?;
//! # handle.stop().await
//! # }
//! ```

mod client;
mod config;
mod error;
mod lease_store;
pub mod queries;
mod version_store;

pub use client::SqlServerClient;
pub use config::{SqlServerConfig, SqlServerConfigBuilder};
pub use error::{codes, SqlServerError};
pub use lease_store::SqlServerLeaseStore;
pub use version_store::SqlServerVersionStore;
