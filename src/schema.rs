//! Emits DDL, verifies columns/indexes, and idempotently re-creates
//! tables/indexes across Postgres, MySQL, and SQLite.

use tracing::{info, warn};

use crate::client::{Client, Engine};
use crate::error::{Result, SessionError};
use crate::keys::validate_table_prefix;

/// Semantic column type, translated to an engine-specific SQL type by
/// [`ColumnType::sql`]. Kept as one enum rather than per-engine strings so
/// the DDL emitter and the verification pass can never drift apart.
///
/// Time columns store epoch milliseconds (`util::to_millis`/`from_millis`),
/// not a driver-native timestamp: `sqlx::Any` binds/decodes through a
/// narrow common type surface, and a `TIMESTAMP` column would reject an
/// `i64` bind on Postgres/MySQL. `EpochMillis`/`NullableEpochMillis` are
/// declared as a big integer on every engine so the DDL matches what the
/// code actually reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    BigIntPrimaryKey,
    VarChar255,
    Json,
    Text,
    EpochMillis,
    NullableEpochMillis,
}

impl ColumnType {
    fn sql(self, engine: Engine) -> &'static str {
        match (self, engine) {
            (ColumnType::BigIntPrimaryKey, Engine::Postgres) => "BIGSERIAL PRIMARY KEY",
            (ColumnType::BigIntPrimaryKey, Engine::MySql) => {
                "BIGINT PRIMARY KEY AUTO_INCREMENT"
            }
            (ColumnType::BigIntPrimaryKey, Engine::Sqlite) => "INTEGER PRIMARY KEY AUTOINCREMENT",
            (ColumnType::VarChar255, _) => "VARCHAR(255) NOT NULL",
            (ColumnType::Json, Engine::Postgres) => "JSONB NOT NULL",
            (ColumnType::Json, Engine::MySql) => "JSON NOT NULL",
            (ColumnType::Json, Engine::Sqlite) => "TEXT NOT NULL",
            (ColumnType::Text, _) => "TEXT",
            (ColumnType::EpochMillis, _) => "BIGINT NOT NULL",
            (ColumnType::NullableEpochMillis, _) => "BIGINT",
        }
    }

    /// Whether `information_schema`/`pragma_table_info` reports this column
    /// nullable, for the verification pass.
    fn nullable(self) -> bool {
        matches!(self, ColumnType::NullableEpochMillis | ColumnType::Text)
    }

    /// The semantic family the verification pass expects
    /// `information_schema`/`pragma_table_info` to report for this column,
    /// independent of engine-specific spelling.
    fn family(self) -> ColumnFamily {
        match self {
            ColumnType::BigIntPrimaryKey | ColumnType::EpochMillis | ColumnType::NullableEpochMillis => {
                ColumnFamily::BigInt
            }
            ColumnType::VarChar255 => ColumnFamily::VarChar,
            ColumnType::Json => ColumnFamily::Json,
            ColumnType::Text => ColumnFamily::Text,
        }
    }
}

/// Engine-independent column type family, used to check a reported
/// `information_schema`/`pragma_table_info` type string against what
/// [`ColumnType::sql`] actually emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnFamily {
    BigInt,
    VarChar,
    Json,
    Text,
}

impl ColumnFamily {
    /// Whether a reported type string (lowercased) is consistent with this
    /// family. JSON columns fall back to TEXT on SQLite (no native JSON
    /// type), so `Json` also accepts a text-shaped report there.
    fn matches(self, reported: &str, engine: Engine) -> bool {
        let reported = reported.to_lowercase();
        match self {
            ColumnFamily::BigInt => {
                reported.contains("int") // bigint, int8, integer, bigserial's underlying bigint
            }
            ColumnFamily::VarChar => reported.contains("char"),
            ColumnFamily::Json => match engine {
                Engine::Sqlite => reported.contains("text"),
                _ => reported.contains("json"),
            },
            ColumnFamily::Text => reported.contains("text"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub name: &'static str,
    pub ty: ColumnType,
}

#[derive(Debug, Clone)]
pub struct IndexDef {
    pub name: &'static str,
    pub columns: &'static [&'static str],
    pub unique: bool,
}

#[derive(Debug, Clone)]
pub struct TableDef {
    pub name: &'static str,
    pub columns: &'static [ColumnDef],
    pub indexes: &'static [IndexDef],
}

const SESSION_STATES_COLUMNS: &[ColumnDef] = &[
    ColumnDef { name: "id", ty: ColumnType::BigIntPrimaryKey },
    ColumnDef { name: "app", ty: ColumnType::VarChar255 },
    ColumnDef { name: "user_id", ty: ColumnType::VarChar255 },
    ColumnDef { name: "session_id", ty: ColumnType::VarChar255 },
    ColumnDef { name: "state", ty: ColumnType::Json },
    ColumnDef { name: "created_at", ty: ColumnType::EpochMillis },
    ColumnDef { name: "updated_at", ty: ColumnType::EpochMillis },
    ColumnDef { name: "expires_at", ty: ColumnType::NullableEpochMillis },
    ColumnDef { name: "deleted_at", ty: ColumnType::NullableEpochMillis },
];

const SESSION_STATES_INDEXES: &[IndexDef] = &[
    IndexDef {
        name: "ux_session_states_key",
        columns: &["app", "user_id", "session_id", "deleted_at"],
        unique: true,
    },
    IndexDef {
        name: "idx_session_states_expires",
        columns: &["expires_at"],
        unique: false,
    },
];

const SESSION_EVENTS_COLUMNS: &[ColumnDef] = &[
    ColumnDef { name: "id", ty: ColumnType::BigIntPrimaryKey },
    ColumnDef { name: "app", ty: ColumnType::VarChar255 },
    ColumnDef { name: "user_id", ty: ColumnType::VarChar255 },
    ColumnDef { name: "session_id", ty: ColumnType::VarChar255 },
    ColumnDef { name: "filter_key", ty: ColumnType::VarChar255 },
    ColumnDef { name: "payload", ty: ColumnType::Json },
    ColumnDef { name: "created_at", ty: ColumnType::EpochMillis },
    ColumnDef { name: "updated_at", ty: ColumnType::EpochMillis },
    ColumnDef { name: "expires_at", ty: ColumnType::NullableEpochMillis },
    ColumnDef { name: "deleted_at", ty: ColumnType::NullableEpochMillis },
];

const SESSION_EVENTS_INDEXES: &[IndexDef] = &[
    IndexDef {
        name: "idx_session_events_key",
        columns: &["app", "user_id", "session_id", "created_at"],
        unique: false,
    },
    IndexDef {
        name: "idx_session_events_expires",
        columns: &["expires_at"],
        unique: false,
    },
];

const SESSION_TRACK_EVENTS_COLUMNS: &[ColumnDef] = &[
    ColumnDef { name: "id", ty: ColumnType::BigIntPrimaryKey },
    ColumnDef { name: "app", ty: ColumnType::VarChar255 },
    ColumnDef { name: "user_id", ty: ColumnType::VarChar255 },
    ColumnDef { name: "session_id", ty: ColumnType::VarChar255 },
    ColumnDef { name: "track", ty: ColumnType::VarChar255 },
    ColumnDef { name: "payload", ty: ColumnType::Json },
    ColumnDef { name: "created_at", ty: ColumnType::EpochMillis },
    ColumnDef { name: "updated_at", ty: ColumnType::EpochMillis },
    ColumnDef { name: "expires_at", ty: ColumnType::NullableEpochMillis },
    ColumnDef { name: "deleted_at", ty: ColumnType::NullableEpochMillis },
];

const SESSION_TRACK_EVENTS_INDEXES: &[IndexDef] = &[IndexDef {
    name: "idx_session_track_events_key",
    columns: &["app", "user_id", "session_id", "track", "created_at"],
    unique: false,
}];

const SESSION_SUMMARIES_COLUMNS: &[ColumnDef] = &[
    ColumnDef { name: "id", ty: ColumnType::BigIntPrimaryKey },
    ColumnDef { name: "app", ty: ColumnType::VarChar255 },
    ColumnDef { name: "user_id", ty: ColumnType::VarChar255 },
    ColumnDef { name: "session_id", ty: ColumnType::VarChar255 },
    ColumnDef { name: "filter_key", ty: ColumnType::VarChar255 },
    ColumnDef { name: "summary", ty: ColumnType::Text },
    ColumnDef { name: "topics", ty: ColumnType::Json },
    ColumnDef { name: "updated_at", ty: ColumnType::EpochMillis },
    ColumnDef { name: "expires_at", ty: ColumnType::NullableEpochMillis },
    ColumnDef { name: "deleted_at", ty: ColumnType::NullableEpochMillis },
];

// deleted_at is deliberately EXCLUDED from this unique index — upserts
// revive the tombstoned row instead of relying on NULL-handling.
const SESSION_SUMMARIES_INDEXES: &[IndexDef] = &[IndexDef {
    name: "ux_session_summaries_key",
    columns: &["app", "user_id", "session_id", "filter_key"],
    unique: true,
}];

const APP_STATES_COLUMNS: &[ColumnDef] = &[
    ColumnDef { name: "id", ty: ColumnType::BigIntPrimaryKey },
    ColumnDef { name: "app", ty: ColumnType::VarChar255 },
    ColumnDef { name: "key_name", ty: ColumnType::VarChar255 },
    ColumnDef { name: "value", ty: ColumnType::Text },
    ColumnDef { name: "updated_at", ty: ColumnType::EpochMillis },
    ColumnDef { name: "expires_at", ty: ColumnType::NullableEpochMillis },
    ColumnDef { name: "deleted_at", ty: ColumnType::NullableEpochMillis },
];

const APP_STATES_INDEXES: &[IndexDef] = &[IndexDef {
    name: "ux_app_states_key",
    columns: &["app", "key_name", "deleted_at"],
    unique: true,
}];

const USER_STATES_COLUMNS: &[ColumnDef] = &[
    ColumnDef { name: "id", ty: ColumnType::BigIntPrimaryKey },
    ColumnDef { name: "app", ty: ColumnType::VarChar255 },
    ColumnDef { name: "user_id", ty: ColumnType::VarChar255 },
    ColumnDef { name: "key_name", ty: ColumnType::VarChar255 },
    ColumnDef { name: "value", ty: ColumnType::Text },
    ColumnDef { name: "updated_at", ty: ColumnType::EpochMillis },
    ColumnDef { name: "expires_at", ty: ColumnType::NullableEpochMillis },
    ColumnDef { name: "deleted_at", ty: ColumnType::NullableEpochMillis },
];

const USER_STATES_INDEXES: &[IndexDef] = &[IndexDef {
    name: "ux_user_states_key",
    columns: &["app", "user_id", "key_name", "deleted_at"],
    unique: true,
}];

/// All six tables in the order they should be created (no FK dependencies
/// between them, so order only matters for readability).
pub fn table_defs() -> Vec<TableDef> {
    vec![
        TableDef { name: "session_states", columns: SESSION_STATES_COLUMNS, indexes: SESSION_STATES_INDEXES },
        TableDef { name: "session_events", columns: SESSION_EVENTS_COLUMNS, indexes: SESSION_EVENTS_INDEXES },
        TableDef {
            name: "session_track_events",
            columns: SESSION_TRACK_EVENTS_COLUMNS,
            indexes: SESSION_TRACK_EVENTS_INDEXES,
        },
        TableDef { name: "session_summaries", columns: SESSION_SUMMARIES_COLUMNS, indexes: SESSION_SUMMARIES_INDEXES },
        TableDef { name: "app_states", columns: APP_STATES_COLUMNS, indexes: APP_STATES_INDEXES },
        TableDef { name: "user_states", columns: USER_STATES_COLUMNS, indexes: USER_STATES_INDEXES },
    ]
}

/// Four VARCHAR(255) columns under a multibyte (utf8mb4) charset need
/// 255*4*4 = 4080 bytes, over MySQL's 3072-byte key-length cap. A 191-char
/// prefix keeps 191*4*4 = 3056 bytes, just under the cap.
const MYSQL_VARCHAR_PREFIX_THRESHOLD: usize = 3;

fn mysql_index_column_list(columns: &[&str], table: &TableDef) -> String {
    let varchar_count = columns
        .iter()
        .filter(|c| {
            table
                .columns
                .iter()
                .any(|col| &col.name == *c && col.ty == ColumnType::VarChar255)
        })
        .count();
    let use_prefix = varchar_count > MYSQL_VARCHAR_PREFIX_THRESHOLD;

    columns
        .iter()
        .map(|c| {
            let is_varchar = table
                .columns
                .iter()
                .any(|col| &col.name == c && col.ty == ColumnType::VarChar255);
            if use_prefix && is_varchar {
                format!("{c}(191)")
            } else {
                (*c).to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn create_table_sql(table: &TableDef, prefix: &str, engine: Engine) -> String {
    let cols = table
        .columns
        .iter()
        .map(|c| format!("{} {}", c.name, c.ty.sql(engine)))
        .collect::<Vec<_>>()
        .join(",\n    ");
    format!("CREATE TABLE IF NOT EXISTS {prefix}{} (\n    {cols}\n)", table.name)
}

fn create_index_sql(table: &TableDef, index: &IndexDef, prefix: &str, engine: Engine) -> String {
    let unique = if index.unique { "UNIQUE " } else { "" };
    let table_name = format!("{prefix}{}", table.name);
    let cols = match engine {
        Engine::MySql => mysql_index_column_list(index.columns, table),
        _ => index.columns.join(", "),
    };
    format!(
        "CREATE {unique}INDEX {prefix}{} ON {table_name} ({cols})",
        index.name
    )
}

/// Statements to fully initialize the schema under `prefix` for `engine`.
pub fn ddl_statements(prefix: &str, engine: Engine) -> Vec<String> {
    let mut statements = Vec::new();
    for table in table_defs() {
        statements.push(create_table_sql(&table, prefix, engine));
        for index in table.indexes {
            statements.push(create_index_sql(&table, index, prefix, engine));
        }
    }
    statements
}

/// Engine-specific substrings/codes for "index already exists" — treated as
/// success rather than error, since many engines lack
/// `CREATE INDEX IF NOT EXISTS`.
fn is_duplicate_index_error(engine: Engine, message: &str) -> bool {
    let lower = message.to_lowercase();
    match engine {
        Engine::Postgres => lower.contains("42p07") || lower.contains("already exists"),
        Engine::MySql => lower.contains("1061") || lower.contains("duplicate key name"),
        Engine::Sqlite => lower.contains("already exists"),
    }
}

/// Runs DDL for the full schema, treating duplicate-index errors as success
/// and any other error as fatal, then runs the verification pass.
pub async fn init_schema(client: &dyn Client, raw_prefix: &str) -> Result<()> {
    let prefix = validate_table_prefix(raw_prefix)?;
    let engine = client.engine();

    for statement in ddl_statements(&prefix, engine) {
        match sqlx::query(&statement).execute(client.pool()).await {
            Ok(_) => {}
            Err(err) if is_duplicate_index_error(engine, &err.to_string()) => {
                info!(statement = %statement, "index already present, continuing");
            }
            Err(err) => return Err(SessionError::from(err)),
        }
    }

    verify_schema(client, &prefix).await
}

/// A column as actually reported by the engine: its declared type string and
/// whether it is nullable.
struct ReportedColumn {
    data_type: String,
    nullable: bool,
}

/// An index as actually reported by the engine: its column tuple, in order,
/// and whether it is unique.
struct ReportedIndex {
    columns: Vec<String>,
    unique: bool,
}

/// Post-init verification: a missing column, or one whose reported type
/// family or nullability disagrees with [`ColumnType`], is fatal. A missing
/// index, or one whose column tuple or uniqueness disagrees with
/// [`IndexDef`], is a warning with a suggested corrective DDL — spec §4.1
/// treats index drift as correctable without refusing to start.
pub async fn verify_schema(client: &dyn Client, prefix: &str) -> Result<()> {
    let engine = client.engine();
    for table in table_defs() {
        let table_name = format!("{prefix}{}", table.name);
        let existing_columns = existing_columns(client, &table_name, engine).await?;
        for column in table.columns {
            let Some(reported) = existing_columns.get(column.name) else {
                return Err(SessionError::SchemaMismatch(format!(
                    "table '{table_name}' is missing column '{}' (expected {}, nullable={})",
                    column.name,
                    column.ty.sql(engine),
                    column.ty.nullable()
                )));
            };
            if !column.ty.family().matches(&reported.data_type, engine) {
                return Err(SessionError::SchemaMismatch(format!(
                    "table '{table_name}' column '{}' has type '{}', expected {}",
                    column.name,
                    reported.data_type,
                    column.ty.sql(engine)
                )));
            }
            // SQLite reports its integer primary key as NOT NULL=0 even though
            // the rowid alias can never actually be null; nothing else gets this
            // carve-out.
            let effectively_nullable = reported.nullable
                && !matches!((column.ty, engine), (ColumnType::BigIntPrimaryKey, Engine::Sqlite));
            if effectively_nullable != column.ty.nullable() {
                return Err(SessionError::SchemaMismatch(format!(
                    "table '{table_name}' column '{}' has nullable={effectively_nullable}, expected {}",
                    column.name,
                    column.ty.nullable()
                )));
            }
        }
        for index in table.indexes {
            let expected_columns: Vec<String> = index.columns.iter().map(|c| (*c).to_string()).collect();
            match existing_index(client, &table_name, index.name, engine).await? {
                None => {
                    warn!(
                        table = %table_name,
                        index = index.name,
                        corrective_ddl = %create_index_sql(&table, index, prefix, engine),
                        "expected index missing"
                    );
                }
                Some(reported) if reported.columns != expected_columns || reported.unique != index.unique => {
                    warn!(
                        table = %table_name,
                        index = index.name,
                        expected_columns = ?expected_columns,
                        expected_unique = index.unique,
                        actual_columns = ?reported.columns,
                        actual_unique = reported.unique,
                        corrective_ddl = %create_index_sql(&table, index, prefix, engine),
                        "index definition drifted from expected"
                    );
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}

async fn existing_columns(
    client: &dyn Client,
    table_name: &str,
    engine: Engine,
) -> Result<std::collections::HashMap<String, ReportedColumn>> {
    use sqlx::Row;
    let mut out = std::collections::HashMap::new();
    match engine {
        Engine::Postgres | Engine::MySql => {
            let rows: Vec<sqlx::any::AnyRow> = sqlx::query(
                "SELECT column_name, data_type, is_nullable FROM information_schema.columns WHERE table_name = ?",
            )
            .bind(table_name)
            .fetch_all(client.pool())
            .await
            .map_err(SessionError::from)?;
            for row in rows {
                let name: String = row.try_get("column_name").map_err(SessionError::from)?;
                let data_type: String = row.try_get("data_type").map_err(SessionError::from)?;
                let is_nullable: String = row.try_get("is_nullable").map_err(SessionError::from)?;
                out.insert(name, ReportedColumn { data_type, nullable: is_nullable.eq_ignore_ascii_case("yes") });
            }
        }
        Engine::Sqlite => {
            let pragma = format!("PRAGMA table_info({table_name})");
            let rows: Vec<sqlx::any::AnyRow> =
                sqlx::query(&pragma).fetch_all(client.pool()).await.map_err(SessionError::from)?;
            for row in rows {
                let name: String = row.try_get("name").map_err(SessionError::from)?;
                let data_type: String = row.try_get("type").map_err(SessionError::from)?;
                let notnull: i64 = row.try_get("notnull").map_err(SessionError::from)?;
                out.insert(name, ReportedColumn { data_type, nullable: notnull == 0 });
            }
        }
    }
    Ok(out)
}

async fn existing_index(
    client: &dyn Client,
    table_name: &str,
    index_name: &str,
    engine: Engine,
) -> Result<Option<ReportedIndex>> {
    use sqlx::Row;
    match engine {
        Engine::Postgres => {
            let rows: Vec<sqlx::any::AnyRow> =
                sqlx::query("SELECT indexdef FROM pg_indexes WHERE tablename = ? AND indexname = ?")
                    .bind(table_name)
                    .bind(index_name)
                    .fetch_all(client.pool())
                    .await
                    .map_err(SessionError::from)?;
            let Some(row) = rows.into_iter().next() else { return Ok(None) };
            let indexdef: String = row.try_get("indexdef").map_err(SessionError::from)?;
            let unique = indexdef.to_uppercase().contains("UNIQUE");
            let columns = parse_postgres_index_columns(&indexdef);
            Ok(Some(ReportedIndex { columns, unique }))
        }
        Engine::MySql => {
            let rows: Vec<sqlx::any::AnyRow> = sqlx::query(
                "SELECT column_name, non_unique, seq_in_index FROM information_schema.statistics \
                 WHERE table_name = ? AND index_name = ? ORDER BY seq_in_index",
            )
            .bind(table_name)
            .bind(index_name)
            .fetch_all(client.pool())
            .await
            .map_err(SessionError::from)?;
            if rows.is_empty() {
                return Ok(None);
            }
            let mut non_unique = 0i64;
            let mut columns = Vec::new();
            for row in rows {
                let column_name: String = row.try_get("column_name").map_err(SessionError::from)?;
                non_unique = row.try_get("non_unique").map_err(SessionError::from)?;
                columns.push(column_name);
            }
            Ok(Some(ReportedIndex { columns, unique: non_unique == 0 }))
        }
        Engine::Sqlite => {
            let list_pragma = format!("PRAGMA index_list({table_name})");
            let list_rows: Vec<sqlx::any::AnyRow> =
                sqlx::query(&list_pragma).fetch_all(client.pool()).await.map_err(SessionError::from)?;
            let mut unique = None;
            for row in list_rows {
                let name: String = row.try_get("name").map_err(SessionError::from)?;
                if name == index_name {
                    let is_unique: i64 = row.try_get("unique").map_err(SessionError::from)?;
                    unique = Some(is_unique != 0);
                    break;
                }
            }
            let Some(unique) = unique else { return Ok(None) };
            let info_pragma = format!("PRAGMA index_info({index_name})");
            let info_rows: Vec<sqlx::any::AnyRow> =
                sqlx::query(&info_pragma).fetch_all(client.pool()).await.map_err(SessionError::from)?;
            let columns = info_rows
                .into_iter()
                .map(|row| row.try_get::<String, _>("name").map_err(SessionError::from))
                .collect::<Result<Vec<_>>>()?;
            Ok(Some(ReportedIndex { columns, unique }))
        }
    }
}

/// Extracts the parenthesized column list from a Postgres `CREATE INDEX`
/// statement as reported by `pg_indexes.indexdef`.
fn parse_postgres_index_columns(indexdef: &str) -> Vec<String> {
    let Some(start) = indexdef.find('(') else { return Vec::new() };
    let Some(end) = indexdef.rfind(')') else { return Vec::new() };
    if end <= start {
        return Vec::new();
    }
    indexdef[start + 1..end].split(',').map(|c| c.trim().to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mysql_key_length_prefix_applies_to_four_column_composite() {
        let table = &table_defs()[0];
        let index = &table.indexes[0];
        let cols = mysql_index_column_list(index.columns, table);
        assert!(cols.contains("(191)"), "expected a 191-char prefix: {cols}");
    }

    #[test]
    fn sqlite_ddl_has_no_prefix_clauses() {
        let statements = ddl_statements("acme_", Engine::Sqlite);
        assert!(statements.iter().any(|s| s.contains("CREATE TABLE IF NOT EXISTS acme_session_states")));
        assert!(!statements.iter().any(|s| s.contains("(191)")));
    }

    #[tokio::test]
    async fn init_and_verify_against_in_memory_sqlite() {
        let client = crate::client::SqlxClient::connect("sqlite::memory:", 1).await.unwrap();
        init_schema(&client, "acme").await.unwrap();
    }

    #[test]
    fn epoch_millis_columns_are_bigint_on_every_engine() {
        for engine in [Engine::Postgres, Engine::MySql, Engine::Sqlite] {
            assert!(ColumnType::EpochMillis.sql(engine).starts_with("BIGINT"));
            assert!(ColumnType::NullableEpochMillis.sql(engine) == "BIGINT");
        }
    }

    #[tokio::test]
    async fn verify_schema_rejects_a_column_type_that_drifted_from_epoch_millis() {
        let client = crate::client::SqlxClient::connect("sqlite::memory:", 1).await.unwrap();
        init_schema(&client, "acme").await.unwrap();
        sqlx::query("ALTER TABLE acme_session_states RENAME COLUMN updated_at TO updated_at_old")
            .execute(client.pool())
            .await
            .unwrap();
        sqlx::query("ALTER TABLE acme_session_states ADD COLUMN updated_at TIMESTAMP")
            .execute(client.pool())
            .await
            .unwrap();
        let err = verify_schema(&client, "acme").await.unwrap_err();
        assert!(matches!(err, SessionError::SchemaMismatch(_)));
    }
}
