//! Shared TDS connection
//!
//! One tiberius connection guarded by an async mutex. Each call takes the
//! connection out of its slot and only puts it back once the call has read
//! its results to the end. A call that fails at the network or protocol
//! level, or whose future is dropped halfway through a response, leaves the
//! slot empty and the next call reconnects. A database restart therefore
//! surfaces as `SourceUnavailable` for a few cycles and then heals.

use super::config::SqlServerConfig;
use super::error::SqlServerError;
use crate::common::Result;
use std::future::Future;
use std::time::Duration;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel, Row, ToSql};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, warn};

type TdsClient = Client<Compat<TcpStream>>;

/// SQL Server client shared by the version and lease stores
pub struct SqlServerClient {
    config: SqlServerConfig,
    conn: Mutex<Option<TdsClient>>,
}

impl SqlServerClient {
    /// Connect eagerly so bad credentials fail at startup.
    pub async fn connect(config: SqlServerConfig) -> Result<Self> {
        let client = open(&config).await?;
        Ok(Self {
            config,
            conn: Mutex::new(Some(client)),
        })
    }

    /// Defer connecting until the first query.
    pub fn lazy(config: SqlServerConfig) -> Self {
        Self {
            config,
            conn: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SqlServerConfig {
        &self.config
    }

    /// Run a parameterised query and collect its first result set.
    pub async fn query(&self, sql: &str, params: &[&dyn ToSql]) -> Result<Vec<Row>> {
        Ok(self.try_query(sql, params).await?)
    }

    /// Like [`query`](Self::query) but keeps the server error number.
    pub async fn try_query(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> std::result::Result<Vec<Row>, SqlServerError> {
        let mut checkout = self.checkout().await?;
        let result = match checkout.client.query(sql, params).await {
            Ok(stream) => stream.into_first_result().await,
            Err(e) => Err(e),
        };
        self.settle(checkout, result)
    }

    /// Run a parameterless batch (DDL), discarding any results.
    pub async fn batch(&self, sql: &str) -> Result<()> {
        let mut checkout = self.checkout().await?;
        let result = match checkout.client.simple_query(sql).await {
            Ok(stream) => stream.into_results().await.map(|_| ()),
            Err(e) => Err(e),
        };
        Ok(self.settle(checkout, result)?)
    }

    async fn checkout(&self) -> std::result::Result<Checkout<'_, TdsClient>, SqlServerError> {
        check_out(&self.conn, move || async move {
            debug!("Reconnecting to SQL Server {}", self.config.endpoint());
            open(&self.config).await
        })
        .await
    }

    /// Return the connection unless the error says it is broken.
    fn settle<T>(
        &self,
        checkout: Checkout<'_, TdsClient>,
        result: std::result::Result<T, tiberius::error::Error>,
    ) -> std::result::Result<T, SqlServerError> {
        match result {
            Ok(value) => {
                checkout.check_in();
                Ok(value)
            }
            Err(e) => {
                let err = SqlServerError::from(e);
                if err.is_connection_lost() {
                    warn!(
                        "Dropping SQL Server connection to {}: {}",
                        self.config.endpoint(),
                        err
                    );
                } else {
                    checkout.check_in();
                }
                Err(err)
            }
        }
    }
}

/// A connection out of its slot for the length of one call.
///
/// The slot stays locked and empty meanwhile. Dropping a checkout without
/// [`check_in`](Checkout::check_in) discards the connection.
struct Checkout<'a, C> {
    slot: MutexGuard<'a, Option<C>>,
    client: C,
}

impl<C> Checkout<'_, C> {
    fn check_in(self) {
        let Checkout { mut slot, client } = self;
        *slot = Some(client);
    }
}

/// Lock `conn` and take its connection, opening a new one if the slot is empty.
async fn check_out<'a, C, F, Fut>(
    conn: &'a Mutex<Option<C>>,
    open: F,
) -> std::result::Result<Checkout<'a, C>, SqlServerError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = std::result::Result<C, SqlServerError>>,
{
    let mut slot = conn.lock().await;
    let client = match slot.take() {
        Some(client) => client,
        None => open().await?,
    };
    Ok(Checkout { slot, client })
}

async fn open(config: &SqlServerConfig) -> std::result::Result<TdsClient, SqlServerError> {
    debug!("Connecting to SQL Server {}", config.endpoint());

    let mut tds = Config::new();
    tds.host(&config.host);
    tds.port(config.port);
    tds.database(&config.database);
    tds.application_name(&config.application_name);

    let password = config.password.as_deref().ok_or_else(|| {
        SqlServerError::Authentication("password is required for SQL authentication".to_string())
    })?;
    tds.authentication(AuthMethod::sql_server(&config.username, password));

    if config.encrypt {
        tds.encryption(EncryptionLevel::Required);
        if config.trust_server_certificate {
            tds.trust_cert();
        }
    } else {
        tds.encryption(EncryptionLevel::NotSupported);
    }

    let connect = async move {
        let tcp = TcpStream::connect(tds.get_addr())
            .await
            .map_err(|e| SqlServerError::Connection(e.to_string()))?;
        tcp.set_nodelay(true)
            .map_err(|e| SqlServerError::Connection(e.to_string()))?;
        let client = Client::connect(tds, tcp.compat_write()).await?;
        Ok::<_, SqlServerError>(client)
    };

    let timeout = Duration::from_secs(config.connect_timeout_secs);
    let client = tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_| {
            SqlServerError::Connection(format!(
                "timed out after {:?} connecting to {}",
                timeout,
                config.endpoint()
            ))
        })??;

    info!("Connected to SQL Server {}", config.endpoint());
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn never_opens() -> std::result::Result<u32, SqlServerError> {
        Err(SqlServerError::Connection("unreachable".to_string()))
    }

    #[tokio::test]
    async fn test_check_in_returns_connection() {
        let conn = Mutex::new(Some(7u32));
        let checkout = check_out(&conn, never_opens).await.unwrap();
        assert_eq!(checkout.client, 7);
        checkout.check_in();
        assert_eq!(*conn.lock().await, Some(7));
    }

    #[tokio::test]
    async fn test_dropped_checkout_discards_connection() {
        let conn = Mutex::new(Some(7u32));
        let checkout = check_out(&conn, never_opens).await.unwrap();
        drop(checkout);
        assert_eq!(*conn.lock().await, None);
    }

    #[tokio::test]
    async fn test_empty_slot_reconnects() {
        let counter = AtomicUsize::new(0);
        let opened = &counter;
        let conn = Mutex::new(None);
        let open = move || async move {
            opened.fetch_add(1, Ordering::SeqCst);
            Ok(42u32)
        };
        check_out(&conn, open).await.unwrap().check_in();
        check_out(&conn, open).await.unwrap().check_in();
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(*conn.lock().await, Some(42));

        let conn = Mutex::new(None::<u32>);
        assert!(check_out(&conn, never_opens).await.is_err());
        assert_eq!(*conn.lock().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_call_leaves_slot_empty() {
        let conn = Arc::new(Mutex::new(Some(7u32)));
        let task = {
            let conn = conn.clone();
            tokio::spawn(async move {
                let checkout = check_out(&*conn, never_opens).await.unwrap();
                // Stands in for a response that never finishes arriving
                tokio::time::sleep(Duration::from_secs(3600)).await;
                checkout.check_in();
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        assert_eq!(*conn.lock().await, None);
    }
}
