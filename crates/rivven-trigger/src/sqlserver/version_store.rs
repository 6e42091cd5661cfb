//! Change tracking reads
//!
//! Change tracking gives every row touched by one transaction the same
//! `SYS_CHANGE_VERSION`, and only records that a key changed. Current values
//! come from a left join against the user table; for deleted rows (or rows
//! deleted after the change) only the key columns are known.

use super::client::SqlServerClient;
use super::queries;
use crate::common::{
    ChangeOperation, RawChange, Result, TableName, TableSchema, TriggerError, VersionStore,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tiberius::Row;
use tracing::debug;

/// [`VersionStore`] over SQL Server change tracking
pub struct SqlServerVersionStore {
    client: Arc<SqlServerClient>,
    schemas: RwLock<HashMap<TableName, TableSchema>>,
}

impl SqlServerVersionStore {
    pub fn new(client: Arc<SqlServerClient>) -> Self {
        Self {
            client,
            schemas: RwLock::new(HashMap::new()),
        }
    }

    pub fn client(&self) -> &Arc<SqlServerClient> {
        &self.client
    }

    async fn schema(&self, table: &TableName) -> Result<TableSchema> {
        let cached = self.schemas.read().get(table).cloned();
        match cached {
            Some(schema) => Ok(schema),
            None => self.table_schema(table).await,
        }
    }

    async fn names(&self, sql: &str, table: &TableName) -> Result<Vec<String>> {
        let quoted = table.quoted();
        self.client
            .query(sql, &[&quoted])
            .await?
            .iter()
            .map(|row| {
                column::<&str>(row, 0, "name")?
                    .map(str::to_string)
                    .ok_or_else(|| TriggerError::serialization("NULL column name"))
            })
            .collect()
    }
}

#[async_trait]
impl VersionStore for SqlServerVersionStore {
    async fn current_version(&self, _table: &TableName) -> Result<i64> {
        let rows = self.client.query(queries::CURRENT_VERSION, &[]).await?;
        first_i64(&rows)?.ok_or_else(|| {
            TriggerError::tracking_not_enabled(format!(
                "change tracking is not enabled on database '{}'",
                self.client.config().database
            ))
        })
    }

    /// `CHANGE_TRACKING_MIN_VALID_VERSION` is already the lowest valid
    /// last-sync version, so it is returned unchanged.
    async fn min_valid_version(&self, table: &TableName) -> Result<i64> {
        let quoted = table.quoted();
        let rows = self
            .client
            .query(queries::MIN_VALID_VERSION, &[&quoted])
            .await?;
        first_i64(&rows)?.ok_or_else(|| {
            TriggerError::tracking_not_enabled(format!(
                "change tracking is not enabled on table {}",
                table
            ))
        })
    }

    async fn changes_since(
        &self,
        table: &TableName,
        from_version: i64,
        limit: usize,
    ) -> Result<Vec<RawChange>> {
        let schema = self.schema(table).await?;
        let sql = queries::changes_query(&schema);
        let columns = queries::change_row_columns(&schema);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = self
            .client
            .query(&sql, &[&limit, &from_version])
            .await?;

        rows.iter()
            .map(|row| parse_change(row, &schema, &columns))
            .collect()
    }

    async fn table_schema(&self, table: &TableName) -> Result<TableSchema> {
        let quoted = table.quoted();

        let rows = self.client.query(queries::TABLE_EXISTS, &[&quoted]).await?;
        let exists = match rows.first() {
            Some(row) => column::<i32>(row, 0, "object_id")?.is_some(),
            None => false,
        };
        if !exists {
            return Err(TriggerError::schema_incompatible(format!(
                "table {} does not exist",
                table
            )));
        }

        let tracked = self
            .client
            .query(queries::TRACKING_ENABLED, &[&quoted])
            .await?;
        if tracked.is_empty() {
            return Err(TriggerError::tracking_not_enabled(format!(
                "change tracking is not enabled on table {}",
                table
            )));
        }

        let columns = self.names(queries::TABLE_COLUMNS, table).await?;
        let primary_key = self.names(queries::PRIMARY_KEY_COLUMNS, table).await?;
        debug!(
            "Discovered {} with key {:?} and {} columns",
            table,
            primary_key,
            columns.len()
        );

        let schema = TableSchema::new(table.clone(), primary_key, columns);
        self.schemas.write().insert(table.clone(), schema.clone());
        Ok(schema)
    }
}

fn parse_change(row: &Row, schema: &TableSchema, columns: &[String]) -> Result<RawChange> {
    let version = column::<i64>(row, 0, "SYS_CHANGE_VERSION")?
        .ok_or_else(|| TriggerError::serialization("NULL SYS_CHANGE_VERSION"))?;
    let code = column::<&str>(row, 1, "SYS_CHANGE_OPERATION")?
        .ok_or_else(|| TriggerError::serialization("NULL SYS_CHANGE_OPERATION"))?;
    let operation = ChangeOperation::from_code(code.trim())?;

    let mut data = parse_row_data(row, columns, 2);
    if operation == ChangeOperation::Delete {
        data.retain(|name, _| schema.primary_key.iter().any(|pk| pk == name));
    }

    Ok(RawChange::new(version, operation, data))
}

fn column<'a, T: tiberius::FromSql<'a>>(row: &'a Row, idx: usize, name: &str) -> Result<Option<T>> {
    row.try_get::<T, _>(idx)
        .map_err(|e| TriggerError::serialization(format!("column {}: {}", name, e)))
}

fn first_i64(rows: &[Row]) -> Result<Option<i64>> {
    match rows.first() {
        Some(row) => column::<i64>(row, 0, "version"),
        None => Ok(None),
    }
}

/// Convert the columns starting at `start_index` to JSON values.
///
/// Types are probed in order of likelihood; anything unsupported becomes
/// `null`.
fn parse_row_data(row: &Row, columns: &[String], start_index: usize) -> Map<String, Value> {
    let mut data = Map::new();

    for (i, col_name) in columns.iter().enumerate() {
        let idx = start_index + i;
        if idx >= row.len() {
            break;
        }

        let value = if let Some(v) = row.try_get::<&str, _>(idx).ok().flatten() {
            Value::String(v.to_string())
        } else if let Some(v) = row.try_get::<i64, _>(idx).ok().flatten() {
            Value::Number(v.into())
        } else if let Some(v) = row.try_get::<i32, _>(idx).ok().flatten() {
            Value::Number(v.into())
        } else if let Some(v) = row.try_get::<i16, _>(idx).ok().flatten() {
            Value::Number(v.into())
        } else if let Some(v) = row.try_get::<u8, _>(idx).ok().flatten() {
            Value::Number(v.into())
        } else if let Some(v) = row.try_get::<f64, _>(idx).ok().flatten() {
            float(v)
        } else if let Some(v) = row.try_get::<f32, _>(idx).ok().flatten() {
            float(f64::from(v))
        } else if let Some(v) = row
            .try_get::<tiberius::numeric::Numeric, _>(idx)
            .ok()
            .flatten()
        {
            v.to_string()
                .parse::<serde_json::Number>()
                .map(Value::Number)
                .unwrap_or_else(|_| Value::String(v.to_string()))
        } else if let Some(v) = row.try_get::<bool, _>(idx).ok().flatten() {
            Value::Bool(v)
        } else if let Some(v) = row.try_get::<&[u8], _>(idx).ok().flatten() {
            Value::String(base64_encode(v))
        } else if let Some(v) = row
            .try_get::<chrono::NaiveDateTime, _>(idx)
            .ok()
            .flatten()
        {
            Value::String(v.format("%Y-%m-%d %H:%M:%S%.f").to_string())
        } else if let Some(v) = row.try_get::<chrono::NaiveDate, _>(idx).ok().flatten() {
            Value::String(v.format("%Y-%m-%d").to_string())
        } else if let Some(v) = row.try_get::<chrono::NaiveTime, _>(idx).ok().flatten() {
            Value::String(v.format("%H:%M:%S%.f").to_string())
        } else if let Some(v) = row.try_get::<uuid::Uuid, _>(idx).ok().flatten() {
            Value::String(v.to_string())
        } else {
            Value::Null
        };

        data.insert(col_name.clone(), value);
    }

    data
}

fn float(v: f64) -> Value {
    serde_json::Number::from_f64(v)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn base64_encode(data: &[u8]) -> String {
    use base64::{engine::general_purpose::STANDARD, Engine};
    STANDARD.encode(data)
}
