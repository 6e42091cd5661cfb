//! Query text for the SQL Server backend
//!
//! Every statement is built here from bracket-quoted identifiers; values are
//! always bound as `@Pn` parameters.

use crate::common::{
    quote_ident, LeasesTable, TableName, TableSchema, CHANGE_OPERATION_COLUMN,
    CHANGE_VERSION_COLUMN,
};

/// Database-wide latest change tracking version. NULL when change tracking
/// is disabled on the database.
pub const CURRENT_VERSION: &str = "SELECT CHANGE_TRACKING_CURRENT_VERSION()";

/// Oldest version still retained for `@P1` (quoted table name).
pub const MIN_VALID_VERSION: &str = "SELECT CHANGE_TRACKING_MIN_VALID_VERSION(OBJECT_ID(@P1))";

/// Object id of user table `@P1`, NULL when it does not exist.
pub const TABLE_EXISTS: &str = "SELECT OBJECT_ID(@P1, N'U')";

/// One row when change tracking is enabled on table `@P1`.
pub const TRACKING_ENABLED: &str =
    "SELECT 1 FROM sys.change_tracking_tables WHERE object_id = OBJECT_ID(@P1)";

/// Column names of table `@P1` in declaration order.
pub const TABLE_COLUMNS: &str =
    "SELECT c.name FROM sys.columns c WHERE c.object_id = OBJECT_ID(@P1) ORDER BY c.column_id";

/// Primary key column names of table `@P1` in key order.
pub const PRIMARY_KEY_COLUMNS: &str = "\
SELECT c.name
FROM sys.indexes i
JOIN sys.index_columns ic ON ic.object_id = i.object_id AND ic.index_id = i.index_id
JOIN sys.columns c ON c.object_id = ic.object_id AND c.column_id = ic.column_id
WHERE i.is_primary_key = 1 AND i.object_id = OBJECT_ID(@P1)
ORDER BY ic.key_ordinal";

/// Columns of a lease row, in the order every lease query returns them
pub const LEASE_COLUMNS: &str = "OwnerId, LeaseExpiry, LastProcessedVersion, LeaseVersion";

/// Render a value as an `N'...'` literal.
pub fn n_literal(value: &str) -> String {
    format!("N'{}'", value.replace('\'', "''"))
}

/// Changes above `@P2`, at most `@P1` rows, oldest first.
///
/// Result columns: version, operation, then every table column with primary
/// key columns taken from the change table so deleted rows still carry them.
/// Rows sharing a version are ordered by primary key.
pub fn changes_query(schema: &TableSchema) -> String {
    let select = select_columns(schema).join(", ");
    let join = schema
        .primary_key
        .iter()
        .map(|pk| format!("t.{0} = c.{0}", quote_ident(pk)))
        .collect::<Vec<_>>()
        .join(" AND ");
    let order = std::iter::once("c.SYS_CHANGE_VERSION ASC".to_string())
        .chain(
            schema
                .primary_key
                .iter()
                .map(|pk| format!("c.{} ASC", quote_ident(pk))),
        )
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "SELECT TOP (@P1) c.SYS_CHANGE_VERSION AS {version}, c.SYS_CHANGE_OPERATION AS {operation}, {select} \
         FROM CHANGETABLE(CHANGES {table}, @P2) AS c \
         LEFT OUTER JOIN {table} AS t ON {join} \
         ORDER BY {order}",
        version = quote_ident(CHANGE_VERSION_COLUMN),
        operation = quote_ident(CHANGE_OPERATION_COLUMN),
        select = select,
        table = schema.table.quoted(),
        join = join,
        order = order,
    )
}

/// Column names in the order [`changes_query`] selects them after the two
/// change columns.
pub fn change_row_columns(schema: &TableSchema) -> Vec<String> {
    schema
        .primary_key
        .iter()
        .chain(
            schema
                .columns
                .iter()
                .filter(|c| !is_key_column(schema, c)),
        )
        .cloned()
        .collect()
}

fn select_columns(schema: &TableSchema) -> Vec<String> {
    change_row_columns(schema)
        .iter()
        .map(|col| {
            let alias = if is_key_column(schema, col) { "c" } else { "t" };
            format!("{}.{}", alias, quote_ident(col))
        })
        .collect()
}

fn is_key_column(schema: &TableSchema, column: &str) -> bool {
    schema.primary_key.iter().any(|pk| pk == column)
}

/// Create the leases schema and table when absent.
pub fn create_leases_table(leases: &LeasesTable) -> String {
    let table: &TableName = leases.table();
    format!(
        "IF SCHEMA_ID({schema_literal}) IS NULL EXEC(N'CREATE SCHEMA {schema}'); \
         IF OBJECT_ID({table_literal}, N'U') IS NULL \
         CREATE TABLE {quoted} ( \
         TableName NVARCHAR(512) NOT NULL, \
         ConsumerGroup NVARCHAR(256) NOT NULL, \
         OwnerId UNIQUEIDENTIFIER NULL, \
         LeaseExpiry DATETIME2 NULL, \
         LastProcessedVersion BIGINT NOT NULL, \
         LeaseVersion BIGINT NOT NULL, \
         PRIMARY KEY (TableName, ConsumerGroup))",
        schema_literal = n_literal(&table.schema),
        schema = quote_ident(&table.schema).replace('\'', "''"),
        table_literal = n_literal(&leases.quoted()),
        quoted = leases.quoted(),
    )
}

/// Read one lease row. `@P1` table, `@P2` consumer group.
pub fn select_lease(leases: &LeasesTable) -> String {
    format!(
        "SELECT {} FROM {} WITH (READCOMMITTEDLOCK) WHERE TableName = @P1 AND ConsumerGroup = @P2",
        LEASE_COLUMNS,
        leases.quoted()
    )
}

/// Create the first lease row for a partition unless one exists.
///
/// `@P1` table, `@P2` consumer group, `@P3` owner, `@P4` expiry. The row
/// starts with checkpoint 0 and lease version 1.
pub fn insert_lease(leases: &LeasesTable) -> String {
    format!(
        "INSERT INTO {table} (TableName, ConsumerGroup, OwnerId, LeaseExpiry, LastProcessedVersion, LeaseVersion) \
         OUTPUT {output} \
         SELECT @P1, @P2, @P3, @P4, 0, 1 \
         WHERE NOT EXISTS (SELECT 1 FROM {table} WITH (UPDLOCK, HOLDLOCK) \
         WHERE TableName = @P1 AND ConsumerGroup = @P2)",
        table = leases.quoted(),
        output = inserted_columns(),
    )
}

/// Compare-and-swap write of a lease row.
///
/// `@P1` table, `@P2` consumer group, `@P3` new owner, `@P4` new expiry,
/// `@P5` new checkpoint, `@P6` expected lease version. Returns the updated
/// row, or nothing when the row changed since it was read.
pub fn update_lease(leases: &LeasesTable) -> String {
    format!(
        "UPDATE {table} SET OwnerId = @P3, LeaseExpiry = @P4, LastProcessedVersion = @P5, \
         LeaseVersion = LeaseVersion + 1 \
         OUTPUT {output} \
         WHERE TableName = @P1 AND ConsumerGroup = @P2 AND LeaseVersion = @P6",
        table = leases.quoted(),
        output = inserted_columns(),
    )
}

fn inserted_columns() -> String {
    LEASE_COLUMNS
        .split(", ")
        .map(|c| format!("INSERTED.{}", c))
        .collect::<Vec<_>>()
        .join(", ")
}
