//! Trigger configuration
//!
//! Two layers:
//!
//! - [`PollingConfig`] holds the three host-facing knobs (batch size, polling
//!   interval, max changes per worker). Values are validated when they are set
//!   or deserialized, so an invalid setting fails before the first poll.
//! - [`TriggerConfig`] is the YAML document consumed by the `rivven-trigger`
//!   binary. It bundles polling, lease and scheduler options with the list of
//!   table bindings.
//!
//! ```yaml
//! polling:
//!   batch_size: 100
//!   polling_interval_ms: 1000
//!   max_changes_per_worker: 1000
//! lease:
//!   duration_ms: 30000
//! scheduler:
//!   poison_batch: stall
//! bindings:
//!   - table: dbo.Products
//!     consumer_group: products-sync
//! ```

use crate::common::{Result, RetryConfig, TriggerError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

/// Default number of changes fetched per batch
pub const DEFAULT_MAX_BATCH_SIZE: u32 = 100;
/// Default delay between polls
pub const DEFAULT_POLLING_INTERVAL_MS: u64 = 1000;
/// Lowest accepted polling interval
pub const MIN_POLLING_INTERVAL_MS: u64 = 100;
/// Default scale-out threshold per worker
pub const DEFAULT_MAX_CHANGES_PER_WORKER: u32 = 1000;
/// Default lease duration
pub const DEFAULT_LEASE_DURATION_MS: u64 = 30_000;
/// Lowest accepted lease duration
pub const MIN_LEASE_DURATION_MS: u64 = 1000;

/// Host setting keys read by [`PollingConfig::from_env`]
pub const ENV_MAX_BATCH_SIZE: &str = "RIVVEN_TRIGGER_MAX_BATCH_SIZE";
/// Deprecated alias of [`ENV_MAX_BATCH_SIZE`], honoured when the new key is absent
pub const ENV_BATCH_SIZE_DEPRECATED: &str = "RIVVEN_TRIGGER_BATCH_SIZE";
pub const ENV_POLLING_INTERVAL_MS: &str = "RIVVEN_TRIGGER_POLLING_INTERVAL_MS";
pub const ENV_MAX_CHANGES_PER_WORKER: &str = "RIVVEN_TRIGGER_MAX_CHANGES_PER_WORKER";

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

// ============================================================================
// Polling configuration
// ============================================================================

/// Polling options for one trigger binding.
///
/// Cloning produces an independent snapshot; later setter calls on either
/// copy do not affect the other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawPollingConfig")]
pub struct PollingConfig {
    batch_size: u32,
    polling_interval_ms: u64,
    max_changes_per_worker: u32,
}

#[derive(Deserialize)]
#[serde(default)]
struct RawPollingConfig {
    batch_size: u32,
    polling_interval_ms: u64,
    max_changes_per_worker: u32,
}

impl Default for RawPollingConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_MAX_BATCH_SIZE,
            polling_interval_ms: DEFAULT_POLLING_INTERVAL_MS,
            max_changes_per_worker: DEFAULT_MAX_CHANGES_PER_WORKER,
        }
    }
}

impl TryFrom<RawPollingConfig> for PollingConfig {
    type Error = TriggerError;

    fn try_from(raw: RawPollingConfig) -> Result<Self> {
        PollingConfig::builder()
            .batch_size(raw.batch_size)
            .polling_interval_ms(raw.polling_interval_ms)
            .max_changes_per_worker(raw.max_changes_per_worker)
            .build()
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_MAX_BATCH_SIZE,
            polling_interval_ms: DEFAULT_POLLING_INTERVAL_MS,
            max_changes_per_worker: DEFAULT_MAX_CHANGES_PER_WORKER,
        }
    }
}

impl PollingConfig {
    /// Create a new builder for PollingConfig
    pub fn builder() -> PollingConfigBuilder {
        PollingConfigBuilder::default()
    }

    /// Maximum number of changes delivered per batch
    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    /// Delay between polls in milliseconds
    pub fn polling_interval_ms(&self) -> u64 {
        self.polling_interval_ms
    }

    /// Delay between polls
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    /// Unprocessed changes one worker is expected to absorb
    pub fn max_changes_per_worker(&self) -> u32 {
        self.max_changes_per_worker
    }

    /// Set the batch size, rejecting zero.
    pub fn set_batch_size(&mut self, value: u32) -> Result<()> {
        check_batch_size(value)?;
        self.batch_size = value;
        Ok(())
    }

    /// Set the polling interval, rejecting values under the floor.
    pub fn set_polling_interval_ms(&mut self, value: u64) -> Result<()> {
        check_polling_interval(value)?;
        self.polling_interval_ms = value;
        Ok(())
    }

    /// Set the per-worker change limit, rejecting zero.
    pub fn set_max_changes_per_worker(&mut self, value: u32) -> Result<()> {
        check_max_changes_per_worker(value)?;
        self.max_changes_per_worker = value;
        Ok(())
    }

    /// Read the host settings from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the host settings through a key lookup.
    ///
    /// Missing keys keep their defaults. The deprecated batch-size key is
    /// consulted only when the current one is absent.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        let batch_size = lookup(ENV_MAX_BATCH_SIZE)
            .map(|v| (ENV_MAX_BATCH_SIZE, v))
            .or_else(|| lookup(ENV_BATCH_SIZE_DEPRECATED).map(|v| (ENV_BATCH_SIZE_DEPRECATED, v)));
        if let Some((key, raw)) = batch_size {
            config.set_batch_size(parse_setting(key, &raw)?)?;
        }
        if let Some(raw) = lookup(ENV_POLLING_INTERVAL_MS) {
            config.set_polling_interval_ms(parse_setting(ENV_POLLING_INTERVAL_MS, &raw)?)?;
        }
        if let Some(raw) = lookup(ENV_MAX_CHANGES_PER_WORKER) {
            config.set_max_changes_per_worker(parse_setting(ENV_MAX_CHANGES_PER_WORKER, &raw)?)?;
        }

        Ok(config)
    }

    /// Render the effective options for startup logs.
    pub fn format(&self) -> String {
        serde_json::to_string_pretty(&serde_json::json!({
            "MaxBatchSize": self.batch_size,
            "PollingIntervalMs": self.polling_interval_ms,
            "MaxChangesPerWorker": self.max_changes_per_worker,
        }))
        .unwrap_or_default()
    }
}

fn parse_setting<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| TriggerError::config(format!("{} must be an integer, got '{}'", key, raw)))
}

fn check_batch_size(value: u32) -> Result<()> {
    if value == 0 {
        return Err(TriggerError::config("batch_size must not be less than 1"));
    }
    Ok(())
}

fn check_polling_interval(value: u64) -> Result<()> {
    if value < MIN_POLLING_INTERVAL_MS {
        return Err(TriggerError::config(format!(
            "polling_interval_ms must not be less than {}ms, got {}",
            MIN_POLLING_INTERVAL_MS, value
        )));
    }
    Ok(())
}

fn check_max_changes_per_worker(value: u32) -> Result<()> {
    if value == 0 {
        return Err(TriggerError::config(
            "max_changes_per_worker must not be less than 1",
        ));
    }
    Ok(())
}

/// Builder for PollingConfig
#[derive(Default)]
pub struct PollingConfigBuilder {
    config: PollingConfig,
}

impl PollingConfigBuilder {
    /// Set the maximum batch size (default: 100)
    pub fn batch_size(mut self, size: u32) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Set the polling interval in milliseconds (default: 1000ms, minimum: 100ms)
    pub fn polling_interval_ms(mut self, ms: u64) -> Self {
        self.config.polling_interval_ms = ms;
        self
    }

    /// Set the per-worker change limit used for scale hints (default: 1000)
    pub fn max_changes_per_worker(mut self, max: u32) -> Self {
        self.config.max_changes_per_worker = max;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<PollingConfig> {
        check_batch_size(self.config.batch_size)?;
        check_polling_interval(self.config.polling_interval_ms)?;
        check_max_changes_per_worker(self.config.max_changes_per_worker)?;
        Ok(self.config)
    }
}

// ============================================================================
// Lease and scheduler options
// ============================================================================

/// Lease timing shared by every binding in a process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// How long a claim stays valid without renewal
    #[serde(default = "default_lease_duration_ms")]
    pub duration_ms: u64,
}

fn default_lease_duration_ms() -> u64 {
    DEFAULT_LEASE_DURATION_MS
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            duration_ms: DEFAULT_LEASE_DURATION_MS,
        }
    }
}

impl LeaseConfig {
    /// Lease duration
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// Validate the lease settings
    pub fn validate(&self) -> Result<()> {
        if self.duration_ms < MIN_LEASE_DURATION_MS {
            return Err(TriggerError::config(format!(
                "lease duration_ms must not be less than {}ms, got {}",
                MIN_LEASE_DURATION_MS, self.duration_ms
            )));
        }
        Ok(())
    }
}

/// What to do with a batch the handler rejects permanently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoisonBatchPolicy {
    /// Keep the checkpoint where it is and halt the partition until an
    /// operator restarts it.
    #[default]
    Stall,
    /// Log the failure, checkpoint past the batch and continue.
    Skip,
}

/// Scheduler behaviour knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerOptions {
    /// Backoff for retryable handler failures and transient store errors
    #[serde(default)]
    pub retry: RetryConfig,

    /// Poison batch handling
    #[serde(default)]
    pub poison_batch: PoisonBatchPolicy,

    /// Upper bound for a single handler invocation
    #[serde(default = "default_handler_timeout_ms")]
    pub handler_timeout_ms: u64,

    /// Cadence of the scale estimator
    #[serde(default = "default_scale_sample_interval_ms")]
    pub scale_sample_interval_ms: u64,
}

fn default_handler_timeout_ms() -> u64 {
    300_000
}

fn default_scale_sample_interval_ms() -> u64 {
    10_000
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            poison_batch: PoisonBatchPolicy::default(),
            handler_timeout_ms: default_handler_timeout_ms(),
            scale_sample_interval_ms: default_scale_sample_interval_ms(),
        }
    }
}

impl SchedulerOptions {
    /// Handler timeout
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    /// Scale sampling cadence
    pub fn scale_sample_interval(&self) -> Duration {
        Duration::from_millis(self.scale_sample_interval_ms)
    }

    /// Validate scheduler options
    pub fn validate(&self) -> Result<()> {
        if self.handler_timeout_ms == 0 {
            return Err(TriggerError::config("handler_timeout_ms must be > 0"));
        }
        if self.scale_sample_interval_ms == 0 {
            return Err(TriggerError::config("scale_sample_interval_ms must be > 0"));
        }
        Ok(())
    }
}

// ============================================================================
// Bindings and the YAML document
// ============================================================================

/// One (table, consumer group) pair to watch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingConfig {
    /// Source table, optionally schema-qualified (`dbo.Products`)
    pub table: String,
    /// Consumer group sharing the partition lease
    pub consumer_group: String,
    /// Explicit leases table name (default: derived from the table)
    #[serde(default)]
    pub leases_table: Option<String>,
}

impl BindingConfig {
    /// Create a binding with a derived leases table name
    pub fn new(table: impl Into<String>, consumer_group: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            consumer_group: consumer_group.into(),
            leases_table: None,
        }
    }

    /// Use an explicit leases table name
    pub fn with_leases_table(mut self, name: impl Into<String>) -> Self {
        self.leases_table = Some(name.into());
        self
    }

    /// Validate the binding
    pub fn validate(&self) -> Result<()> {
        if self.table.trim().is_empty() {
            return Err(TriggerError::config("binding table must not be empty"));
        }
        if self.consumer_group.trim().is_empty() {
            return Err(TriggerError::config(format!(
                "binding for '{}' must have a consumer_group",
                self.table
            )));
        }
        if let Some(name) = &self.leases_table {
            if name.trim().is_empty() {
                return Err(TriggerError::config(format!(
                    "leases_table for '{}' must not be empty when set",
                    self.table
                )));
            }
        }
        Ok(())
    }
}

/// Root configuration document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Configuration version
    #[serde(default = "default_version")]
    pub version: String,

    /// Polling options applied to every binding
    #[serde(default)]
    pub polling: PollingConfig,

    /// Lease timing
    #[serde(default)]
    pub lease: LeaseConfig,

    /// Scheduler behaviour
    #[serde(default)]
    pub scheduler: SchedulerOptions,

    /// Tables to watch
    #[serde(default)]
    pub bindings: Vec<BindingConfig>,

    /// Backend connection settings, parsed by the backend itself
    #[serde(default)]
    pub sqlserver: Option<serde_yaml::Value>,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl TriggerConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            TriggerError::config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text, expanding environment variables
    pub fn from_yaml(content: &str) -> Result<Self> {
        let expanded = Self::expand_env_vars(content);

        let config: Self = serde_yaml::from_str(&expanded)
            .map_err(|e| TriggerError::config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Expand environment variables in the format ${VAR} or ${VAR:-default}
    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());

                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.lease.validate()?;
        self.scheduler.validate()?;

        if self.bindings.is_empty() {
            return Err(TriggerError::config("at least one binding is required"));
        }

        let mut seen = std::collections::HashSet::new();
        for binding in &self.bindings {
            binding.validate()?;
            if !seen.insert((binding.table.as_str(), binding.consumer_group.as_str())) {
                return Err(TriggerError::config(format!(
                    "duplicate binding for table '{}' and consumer group '{}'",
                    binding.table, binding.consumer_group
                )));
            }
        }

        // Renewal runs at half the lease duration and must outpace the poll loop
        if self.lease.duration_ms / 2 < self.polling.polling_interval_ms() {
            return Err(TriggerError::config(format!(
                "lease duration_ms ({}) must be at least twice polling_interval_ms ({})",
                self.lease.duration_ms,
                self.polling.polling_interval_ms()
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_polling_defaults() {
        let config = PollingConfig::default();
        assert_eq!(config.batch_size(), 100);
        assert_eq!(config.polling_interval_ms(), 1000);
        assert_eq!(config.max_changes_per_worker(), 1000);
    }

    #[test]
    fn test_builder_rejects_out_of_range() {
        assert!(PollingConfig::builder().batch_size(0).build().is_err());
        assert!(PollingConfig::builder()
            .polling_interval_ms(99)
            .build()
            .is_err());
        assert!(PollingConfig::builder()
            .max_changes_per_worker(0)
            .build()
            .is_err());

        let config = PollingConfig::builder()
            .batch_size(1)
            .polling_interval_ms(100)
            .max_changes_per_worker(1)
            .build()
            .unwrap();
        assert_eq!(config.batch_size(), 1);
        assert_eq!(config.polling_interval_ms(), 100);
    }

    #[test]
    fn test_setter_rejects_and_keeps_value() {
        let mut config = PollingConfig::default();
        let err = config.set_batch_size(0).unwrap_err();
        assert!(matches!(err, TriggerError::Config(_)));
        assert!(err.to_string().contains("batch_size"));
        assert_eq!(config.batch_size(), 100);

        assert!(config.set_polling_interval_ms(50).is_err());
        assert_eq!(config.polling_interval_ms(), 1000);

        config.set_max_changes_per_worker(250).unwrap();
        assert_eq!(config.max_changes_per_worker(), 250);
    }

    #[test]
    fn test_clone_is_a_snapshot() {
        let mut config = PollingConfig::default();
        let snapshot = config.clone();
        config.set_batch_size(7).unwrap();
        assert_eq!(snapshot.batch_size(), 100);
        assert_eq!(config.batch_size(), 7);
    }

    #[test]
    fn test_deserialize_validates() {
        let config: PollingConfig = serde_yaml::from_str("batch_size: 25").unwrap();
        assert_eq!(config.batch_size(), 25);
        assert_eq!(config.polling_interval_ms(), 1000);

        let result: std::result::Result<PollingConfig, _> =
            serde_yaml::from_str("batch_size: 0");
        assert!(result.is_err());

        let result: std::result::Result<PollingConfig, _> =
            serde_yaml::from_str("polling_interval_ms: 10");
        assert!(result.is_err());
    }

    #[test]
    fn test_from_lookup() {
        let settings: HashMap<&str, &str> = [
            (ENV_MAX_BATCH_SIZE, "50"),
            (ENV_POLLING_INTERVAL_MS, "250"),
        ]
        .into_iter()
        .collect();

        let config =
            PollingConfig::from_lookup(|key| settings.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(config.batch_size(), 50);
        assert_eq!(config.polling_interval_ms(), 250);
        assert_eq!(config.max_changes_per_worker(), 1000);
    }

    #[test]
    fn test_from_lookup_deprecated_batch_size() {
        let config = PollingConfig::from_lookup(|key| {
            (key == ENV_BATCH_SIZE_DEPRECATED).then(|| "30".to_string())
        })
        .unwrap();
        assert_eq!(config.batch_size(), 30);

        // The current key wins over the deprecated alias
        let config = PollingConfig::from_lookup(|key| match key {
            ENV_MAX_BATCH_SIZE => Some("40".to_string()),
            ENV_BATCH_SIZE_DEPRECATED => Some("30".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.batch_size(), 40);
    }

    #[test]
    fn test_from_lookup_rejects_bad_values() {
        let result = PollingConfig::from_lookup(|key| {
            (key == ENV_MAX_BATCH_SIZE).then(|| "lots".to_string())
        });
        assert!(result.is_err());

        let result = PollingConfig::from_lookup(|key| {
            (key == ENV_POLLING_INTERVAL_MS).then(|| "20".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_format() {
        let formatted = PollingConfig::default().format();
        let value: serde_json::Value = serde_json::from_str(&formatted).unwrap();
        assert_eq!(value["MaxBatchSize"], 100);
        assert_eq!(value["PollingIntervalMs"], 1000);
        assert_eq!(value["MaxChangesPerWorker"], 1000);
    }

    #[test]
    fn test_env_var_expansion() {
        std::env::set_var("RIVVEN_TRIGGER_TEST_GROUP", "orders-sync");
        let content = "consumer_group: ${RIVVEN_TRIGGER_TEST_GROUP}";
        let expanded = TriggerConfig::expand_env_vars(content);
        assert_eq!(expanded, "consumer_group: orders-sync");
    }

    #[test]
    fn test_env_var_with_default() {
        std::env::remove_var("RIVVEN_TRIGGER_MISSING_VAR");
        let content = "value: ${RIVVEN_TRIGGER_MISSING_VAR:-fallback}";
        let expanded = TriggerConfig::expand_env_vars(content);
        assert_eq!(expanded, "value: fallback");
    }

    #[test]
    fn test_parse_trigger_config() {
        let yaml = r#"
version: "1.0"
polling:
  batch_size: 10
  polling_interval_ms: 500
lease:
  duration_ms: 20000
scheduler:
  poison_batch: skip
  retry:
    max_retries: 2
bindings:
  - table: dbo.Products
    consumer_group: products-sync
  - table: dbo.Orders
    consumer_group: orders-sync
    leases_table: OrderLeases
sqlserver:
  host: localhost
"#;
        let config = TriggerConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.polling.batch_size(), 10);
        assert_eq!(config.polling.max_changes_per_worker(), 1000);
        assert_eq!(config.lease.duration_ms, 20_000);
        assert_eq!(config.scheduler.poison_batch, PoisonBatchPolicy::Skip);
        assert_eq!(config.scheduler.retry.max_retries(), 2);
        assert_eq!(config.bindings.len(), 2);
        assert_eq!(
            config.bindings[1].leases_table.as_deref(),
            Some("OrderLeases")
        );
        assert!(config.sqlserver.is_some());
    }

    #[test]
    fn test_invalid_polling_fails_at_bind_time() {
        let yaml = r#"
polling:
  batch_size: 0
bindings:
  - table: dbo.Products
    consumer_group: g
"#;
        let err = TriggerConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn test_validate_bindings() {
        let no_bindings = "polling:\n  batch_size: 5\n";
        assert!(TriggerConfig::from_yaml(no_bindings).is_err());

        let duplicate = r#"
bindings:
  - table: dbo.T
    consumer_group: g
  - table: dbo.T
    consumer_group: g
"#;
        assert!(TriggerConfig::from_yaml(duplicate).is_err());

        let empty_group = r#"
bindings:
  - table: dbo.T
    consumer_group: ""
"#;
        assert!(TriggerConfig::from_yaml(empty_group).is_err());
    }

    #[test]
    fn test_lease_must_outlast_polling() {
        let yaml = r#"
polling:
  polling_interval_ms: 10000
lease:
  duration_ms: 15000
bindings:
  - table: dbo.T
    consumer_group: g
"#;
        assert!(TriggerConfig::from_yaml(yaml).is_err());
    }
}
