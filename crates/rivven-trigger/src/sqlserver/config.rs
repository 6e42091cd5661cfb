//! SQL Server connection settings

use crate::common::{Result, TriggerError};
use serde::Deserialize;

/// Connection settings for a change-tracking enabled database
///
/// # Example
///
/// ```rust
/// use rivven_trigger::sqlserver::SqlServerConfig;
///
/// let config = SqlServerConfig::builder()
///     .host("localhost")
///     .username("sa")
///     .password("secret")
///     .database("shop")
///     .build()?;
/// assert_eq!(config.port, 1433);
/// # Ok::<(), rivven_trigger::TriggerError>(())
/// ```
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct SqlServerConfig {
    /// SQL Server host
    pub host: String,
    /// SQL Server port (default: 1433)
    pub port: u16,
    /// Username for SQL authentication
    pub username: String,
    /// Password for SQL authentication
    pub password: Option<String>,
    /// Database holding the tracked tables and the leases tables
    pub database: String,
    /// Application name reported to the server
    pub application_name: String,
    /// Connection timeout in seconds (default: 30)
    pub connect_timeout_secs: u64,
    /// Accept self-signed server certificates
    pub trust_server_certificate: bool,
    /// Encrypt the connection (default: true)
    pub encrypt: bool,
}

impl std::fmt::Debug for SqlServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlServerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("database", &self.database)
            .field("application_name", &self.application_name)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("trust_server_certificate", &self.trust_server_certificate)
            .field("encrypt", &self.encrypt)
            .finish()
    }
}

impl Default for SqlServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1433,
            username: String::new(),
            password: None,
            database: String::new(),
            application_name: "rivven-trigger".to_string(),
            connect_timeout_secs: 30,
            trust_server_certificate: false,
            encrypt: true,
        }
    }
}

impl SqlServerConfig {
    pub fn builder() -> SqlServerConfigBuilder {
        SqlServerConfigBuilder::default()
    }

    /// Parse the `sqlserver` section of a trigger configuration document.
    pub fn from_yaml_value(value: serde_yaml::Value) -> Result<Self> {
        let config: Self = serde_yaml::from_value(value)
            .map_err(|e| TriggerError::config(format!("invalid sqlserver section: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(TriggerError::config("sqlserver.host is required"));
        }
        if self.database.is_empty() {
            return Err(TriggerError::config("sqlserver.database is required"));
        }
        if self.username.is_empty() {
            return Err(TriggerError::config("sqlserver.username is required"));
        }
        if self.password.is_none() {
            return Err(TriggerError::config(
                "sqlserver.password is required for SQL Server authentication",
            ));
        }
        if self.connect_timeout_secs == 0 {
            return Err(TriggerError::config(
                "sqlserver.connect_timeout_secs must be greater than 0",
            ));
        }
        Ok(())
    }

    /// `host:port/database` for log lines.
    pub fn endpoint(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }
}

/// Builder for [`SqlServerConfig`]
#[derive(Default)]
pub struct SqlServerConfigBuilder {
    config: SqlServerConfig,
}

impl SqlServerConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.config.username = username.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = Some(password.into());
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.config.database = database.into();
        self
    }

    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.config.application_name = name.into();
        self
    }

    pub fn connect_timeout_secs(mut self, secs: u64) -> Self {
        self.config.connect_timeout_secs = secs;
        self
    }

    /// Trust self-signed certificates (testing only)
    pub fn trust_server_certificate(mut self, trust: bool) -> Self {
        self.config.trust_server_certificate = trust;
        self
    }

    pub fn encrypt(mut self, encrypt: bool) -> Self {
        self.config.encrypt = encrypt;
        self
    }

    pub fn build(self) -> Result<SqlServerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_password() {
        let config = SqlServerConfig::builder()
            .username("sa")
            .password("hunter2")
            .database("shop")
            .build()
            .unwrap();

        let debug = format!("{:?}", config);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_builder_requires_database_and_password() {
        let err = SqlServerConfig::builder().username("sa").password("x").build();
        assert!(err.is_err());

        let err = SqlServerConfig::builder().username("sa").database("shop").build();
        assert!(err.unwrap_err().to_string().contains("password"));
    }

    #[test]
    fn test_from_yaml_value_applies_defaults() {
        let value: serde_yaml::Value = serde_yaml::from_str(
            r#"
host: db.internal
username: trigger
password: secret
database: shop
trust_server_certificate: true
"#,
        )
        .unwrap();

        let config = SqlServerConfig::from_yaml_value(value).unwrap();
        assert_eq!(config.host, "db.internal");
        assert_eq!(config.port, 1433);
        assert_eq!(config.application_name, "rivven-trigger");
        assert!(config.encrypt);
        assert!(config.trust_server_certificate);
        assert_eq!(config.endpoint(), "db.internal:1433/shop");
    }

    #[test]
    fn test_from_yaml_value_rejects_unknown_types() {
        let value: serde_yaml::Value = serde_yaml::from_str("port: not-a-number").unwrap();
        assert!(SqlServerConfig::from_yaml_value(value).is_err());
    }
}
