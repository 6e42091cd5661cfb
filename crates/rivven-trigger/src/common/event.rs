//! Change representation
//!
//! A change travels through two shapes:
//!
//! - [`RawChange`]: what a [`VersionStore`](crate::common::VersionStore) returns,
//!   a version, an operation and the row as a JSON object.
//! - [`ChangeRecord`]: what a handler sees, with the primary key extracted in
//!   key-column order using the table's [`TableSchema`].
//!
//! Handlers receive whole [`ChangeBatch`]es in ascending version order.

use crate::common::{Result, TriggerError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Column alias carrying the change version in change queries
pub const CHANGE_VERSION_COLUMN: &str = "__rivven_change_version";
/// Column alias carrying the change operation in change queries
pub const CHANGE_OPERATION_COLUMN: &str = "__rivven_change_operation";

/// Column names a watched table must not use
pub const RESERVED_COLUMN_NAMES: &[&str] = &[CHANGE_VERSION_COLUMN, CHANGE_OPERATION_COLUMN];

/// Row-level operation recorded by the change log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeOperation {
    /// Row inserted
    Insert,
    /// Row updated
    Update,
    /// Row deleted
    Delete,
}

impl ChangeOperation {
    /// Parse the single-letter code used by change tracking (`I`, `U`, `D`).
    pub fn from_code(code: &str) -> Result<Self> {
        match code.trim() {
            "I" | "i" => Ok(Self::Insert),
            "U" | "u" => Ok(Self::Update),
            "D" | "d" => Ok(Self::Delete),
            other => Err(TriggerError::serialization(format!(
                "unknown change operation '{}'",
                other
            ))),
        }
    }

    /// Metric-safe name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Schema-qualified table identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableName {
    /// Schema (`dbo` when not given)
    pub schema: String,
    /// Table name
    pub name: String,
}

impl TableName {
    pub const DEFAULT_SCHEMA: &'static str = "dbo";

    /// Create a table name from its parts
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Parse `table`, `schema.table`, or the bracketed `[schema].[table]` form.
    pub fn parse(input: &str) -> Result<Self> {
        let parts = split_identifier(input.trim())?;
        match parts.as_slice() {
            [name] => Ok(Self::new(Self::DEFAULT_SCHEMA, name.clone())),
            [schema, name] => Ok(Self::new(schema.clone(), name.clone())),
            _ => Err(TriggerError::config(format!(
                "table name '{}' must be 'table' or 'schema.table'",
                input
            ))),
        }
    }

    /// Bracket-quoted form, e.g. `[dbo].[Products]`
    pub fn quoted(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.name))
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Quote an identifier with brackets, escaping closing brackets.
pub fn quote_ident(ident: &str) -> String {
    format!("[{}]", ident.replace(']', "]]"))
}

fn split_identifier(input: &str) -> Result<Vec<String>> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = input.chars().peekable();
    let mut in_brackets = false;

    while let Some(c) = chars.next() {
        match c {
            '[' if !in_brackets && current.is_empty() => in_brackets = true,
            ']' if in_brackets => {
                if chars.peek() == Some(&']') {
                    chars.next();
                    current.push(']');
                } else {
                    in_brackets = false;
                }
            }
            '.' if !in_brackets => parts.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }

    if in_brackets {
        return Err(TriggerError::config(format!(
            "unterminated bracket in table name '{}'",
            input
        )));
    }
    parts.push(current);

    if parts.iter().any(|p| p.trim().is_empty()) {
        return Err(TriggerError::config(format!(
            "table name '{}' has an empty part",
            input
        )));
    }
    Ok(parts)
}

/// Unit of lease ownership: one table watched by one consumer group
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    /// Table identity as `schema.table`
    pub table: String,
    /// Consumer group
    pub consumer_group: String,
}

impl PartitionKey {
    pub fn new(table: impl Into<String>, consumer_group: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            consumer_group: consumer_group.into(),
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.consumer_group)
    }
}

/// Shape of a watched table, as needed to build change records
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table: TableName,
    /// Primary key columns in key order
    pub primary_key: Vec<String>,
    /// All columns in ordinal order
    pub columns: Vec<String>,
}

impl TableSchema {
    pub fn new(table: TableName, primary_key: Vec<String>, columns: Vec<String>) -> Self {
        Self {
            table,
            primary_key,
            columns,
        }
    }

    /// Check that the table can be watched.
    pub fn validate(&self) -> Result<()> {
        if self.primary_key.is_empty() {
            return Err(TriggerError::schema_incompatible(format!(
                "table {} has no primary key",
                self.table
            )));
        }

        let reserved: Vec<&str> = self
            .columns
            .iter()
            .filter(|c| {
                RESERVED_COLUMN_NAMES
                    .iter()
                    .any(|r| r.eq_ignore_ascii_case(c))
            })
            .map(String::as_str)
            .collect();
        if !reserved.is_empty() {
            return Err(TriggerError::schema_incompatible(format!(
                "table {} uses reserved column names: {}",
                self.table,
                reserved.join(", ")
            )));
        }

        Ok(())
    }
}

/// A change as read from the change log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    pub version: i64,
    pub operation: ChangeOperation,
    /// Row values keyed by column name. Deletes carry only the key columns.
    pub row: serde_json::Map<String, serde_json::Value>,
}

impl RawChange {
    pub fn new(
        version: i64,
        operation: ChangeOperation,
        row: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            version,
            operation,
            row,
        }
    }
}

/// A typed change delivered to handlers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub operation: ChangeOperation,
    pub version: i64,
    pub payload: serde_json::Value,
    /// Key column values in key order
    pub primary_key: Vec<serde_json::Value>,
}

impl ChangeRecord {
    /// Build a record from a raw change, extracting the key columns.
    pub fn from_raw(raw: RawChange, schema: &TableSchema) -> Self {
        let primary_key = schema
            .primary_key
            .iter()
            .map(|column| {
                raw.row
                    .get(column)
                    .cloned()
                    .unwrap_or(serde_json::Value::Null)
            })
            .collect();

        Self {
            operation: raw.operation,
            version: raw.version,
            payload: serde_json::Value::Object(raw.row),
            primary_key,
        }
    }

    /// Decode the row payload into a caller-defined type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Ordered changes handed to a handler in one call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeBatch {
    pub partition: PartitionKey,
    pub changes: Vec<ChangeRecord>,
    /// Highest version in the batch; the checkpoint written on success
    pub bound_version: i64,
}

impl ChangeBatch {
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn first_version(&self) -> Option<i64> {
        self.changes.first().map(|c| c.version)
    }

    pub fn last_version(&self) -> Option<i64> {
        self.changes.last().map(|c| c.version)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChangeRecord> {
        self.changes.iter()
    }

    /// Count changes per operation as (inserts, updates, deletes)
    pub fn operation_counts(&self) -> (u64, u64, u64) {
        self.changes
            .iter()
            .fold((0, 0, 0), |(i, u, d), c| match c.operation {
                ChangeOperation::Insert => (i + 1, u, d),
                ChangeOperation::Update => (i, u + 1, d),
                ChangeOperation::Delete => (i, u, d + 1),
            })
    }
}
