// Connection pool and schema management for the alert store

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info, warn};

use crate::error::{MonitorError, Result};

const INITIAL_SCHEMA: &str = include_str!("../../migrations/001_initial_schema.sql");
const INDEXES: &str = include_str!("../../migrations/002_indexes.sql");

/// A column that older tables may lack, with the backfill to run once it is added.
struct ColumnSpec {
    table: &'static str,
    column: &'static str,
    definition: &'static str,
    backfill: Option<&'static str>,
}

const ADDITIVE_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec {
        table: "alerts",
        column: "channel_label",
        definition: "TEXT",
        backfill: Some(
            "UPDATE alerts SET channel_label = channel WHERE channel_label IS NULL OR channel_label = ''",
        ),
    },
    ColumnSpec {
        table: "alerts",
        column: "source_ts",
        definition: "TEXT NOT NULL DEFAULT ''",
        backfill: Some("UPDATE alerts SET source_ts = slack_ts WHERE source_ts = '' AND slack_ts IS NOT NULL"),
    },
    ColumnSpec {
        table: "alerts",
        column: "reason",
        definition: "TEXT",
        backfill: None,
    },
    ColumnSpec {
        table: "alerts",
        column: "content_hash",
        definition: "TEXT",
        backfill: None,
    },
    ColumnSpec {
        table: "alerts",
        column: "pattern_signature",
        definition: "TEXT",
        backfill: None,
    },
    ColumnSpec {
        table: "alerts",
        column: "detected_at",
        definition: "TEXT NOT NULL DEFAULT '1970-01-01T00:00:00.000000Z'",
        backfill: Some(
            "UPDATE alerts SET detected_at = strftime('%Y-%m-%dT%H:%M:%f', created_at) || '000Z'
             WHERE strftime('%Y-%m-%dT%H:%M:%f', created_at) IS NOT NULL",
        ),
    },
    ColumnSpec {
        table: "alerts",
        column: "event_ts",
        definition: "TEXT",
        backfill: None,
    },
    ColumnSpec {
        table: "alerts",
        column: "sent",
        definition: "BOOLEAN NOT NULL DEFAULT 0",
        backfill: Some("UPDATE alerts SET sent = COALESCE(sent_to_slack, 0)"),
    },
    ColumnSpec {
        table: "decision_log",
        column: "reason",
        definition: "TEXT",
        backfill: None,
    },
];

/// Timestamp columns compared lexicographically; older writers used other layouts.
const TIMESTAMP_COLUMNS: &[(&str, &str)] = &[
    ("alerts", "detected_at"),
    ("alerts", "event_ts"),
    ("decision_log", "created_at"),
    ("monitor_state", "updated_at"),
];

const FIXED_WIDTH_GLOB: &str = "[0-9][0-9][0-9][0-9]-[0-9][0-9]-[0-9][0-9]T[0-9][0-9]:[0-9][0-9]:[0-9][0-9].[0-9][0-9][0-9][0-9][0-9][0-9]Z";

/// Columns written by earlier versions that new rows must keep populating.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LegacyColumns {
    /// `slack_ts TEXT NOT NULL` without a default
    pub slack_ts: bool,
    pub sent_to_slack: bool,
}

/// Initialize database connection pool with WAL mode enabled
pub async fn create_pool<P: AsRef<Path>>(database_path: P) -> Result<SqlitePool> {
    let path = database_path.as_ref();
    let path_str = path
        .to_str()
        .ok_or_else(|| MonitorError::configuration(format!("invalid database path: {:?}", path)))?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    info!("Opening alert store at: {}", path_str);

    let connect_options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(30))
        .connect_with(connect_options)
        .await?;

    debug!("Database connection pool created successfully");
    Ok(pool)
}

/// Split a schema file into executable statements, dropping `--` comments.
pub(crate) fn split_sql_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current_statement = String::new();

    for line in sql.lines() {
        let trimmed = line.trim();

        if trimmed.is_empty() || (trimmed.starts_with("--") && current_statement.is_empty()) {
            continue;
        }

        if let Some(pos) = trimmed.find("--") {
            current_statement.push_str(&trimmed[..pos]);
        } else {
            current_statement.push_str(trimmed);
        }
        current_statement.push(' ');

        if trimmed.ends_with(';') {
            let stmt = current_statement.trim().trim_end_matches(';').trim().to_string();
            if !stmt.is_empty() {
                statements.push(stmt);
            }
            current_statement.clear();
        }
    }

    statements
}

async fn execute_script(pool: &SqlitePool, sql: &str) -> Result<()> {
    for statement in split_sql_statements(sql) {
        debug!("Executing: {}", &statement[..statement.len().min(80)]);
        sqlx::query(&statement).execute(pool).await.map_err(|e| {
            MonitorError::Migration(format!(
                "{} (statement: {})",
                e,
                &statement[..statement.len().min(200)]
            ))
        })?;
    }
    Ok(())
}

async fn existing_columns(pool: &SqlitePool, table: &str) -> Result<Vec<String>> {
    let columns: Vec<String> = sqlx::query_scalar("SELECT name FROM pragma_table_info(?1)")
        .bind(table)
        .fetch_all(pool)
        .await?;
    Ok(columns)
}

/// Add any missing columns to tables created by an earlier schema version.
///
/// Additive only: columns are never dropped or renamed.
pub async fn ensure_columns(pool: &SqlitePool) -> Result<usize> {
    let mut added = 0;

    for spec in ADDITIVE_COLUMNS {
        let columns = existing_columns(pool, spec.table).await?;
        if columns.iter().any(|c| c == spec.column) {
            continue;
        }

        info!(table = spec.table, column = spec.column, "Adding missing column");
        sqlx::query(&format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            spec.table, spec.column, spec.definition
        ))
        .execute(pool)
        .await
        .map_err(|e| MonitorError::Migration(format!("adding {}.{}: {}", spec.table, spec.column, e)))?;
        added += 1;

        if let Some(backfill) = spec.backfill {
            // Legacy source columns may not exist; the backfill is best effort
            if let Err(e) = sqlx::query(backfill).execute(pool).await {
                warn!(column = spec.column, error = %e, "Skipping backfill");
            }
        }
    }

    Ok(added)
}

/// Rewrite timestamps in other layouts (`CURRENT_TIMESTAMP`, ISO 8601 with offset)
/// into the fixed-width UTC form so range queries stay exact.
pub async fn normalize_timestamps(pool: &SqlitePool) -> Result<u64> {
    let mut rewritten = 0;

    for (table, column) in TIMESTAMP_COLUMNS {
        let sql = format!(
            "UPDATE {table} SET {column} = strftime('%Y-%m-%dT%H:%M:%f', {column}) || '000Z'
             WHERE {column} IS NOT NULL
               AND {column} NOT GLOB '{glob}'
               AND strftime('%Y-%m-%dT%H:%M:%f', {column}) IS NOT NULL",
            table = table,
            column = column,
            glob = FIXED_WIDTH_GLOB,
        );
        rewritten += sqlx::query(&sql)
            .execute(pool)
            .await
            .map_err(|e| MonitorError::Migration(format!("normalizing {}.{}: {}", table, column, e)))?
            .rows_affected();
    }

    if rewritten > 0 {
        info!("Normalized {} legacy timestamp value(s)", rewritten);
    }
    Ok(rewritten)
}

/// Detect legacy columns on `alerts` that inserts must still fill.
pub async fn legacy_columns(pool: &SqlitePool) -> Result<LegacyColumns> {
    let columns = existing_columns(pool, "alerts").await?;
    Ok(LegacyColumns {
        slack_ts: columns.iter().any(|c| c == "slack_ts"),
        sent_to_slack: columns.iter().any(|c| c == "sent_to_slack"),
    })
}

/// Create tables, upgrade older layouts, then build indexes.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    info!("Creating alert store schema");
    execute_script(pool, INITIAL_SCHEMA).await?;
    let added = ensure_columns(pool).await?;
    if added > 0 {
        info!("Upgraded legacy schema with {} new column(s)", added);
    }
    normalize_timestamps(pool).await?;
    execute_script(pool, INDEXES).await?;
    Ok(())
}

/// Verify database schema is correctly initialized
pub async fn verify_schema(pool: &SqlitePool) -> Result<bool> {
    let tables: Vec<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master WHERE type='table' AND name IN ('alerts', 'decision_log', 'monitor_state')",
    )
    .fetch_all(pool)
    .await?;

    Ok(tables.len() == 3)
}
