//! SQLite-backed storage for agents, executions and results.
//!
//! A single [`Store`] owns one `tokio_rusqlite` connection; all statements run
//! on its dedicated thread, so writes are serialized while readers get a
//! consistent snapshot per call. The database file may be shared with an
//! isolated worker process (WAL mode plus a busy timeout).

mod agents;
mod executions;
mod results;

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Type, Value};
use tokio_rusqlite::Connection;
use tracing::{debug, info};
use uuid::Uuid;

pub use agents::StatusChange;
pub use results::CompactionReport;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Async SQLite store.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) a database at the given file path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| tokio_rusqlite::Error::Other(Box::new(e)))?;
            }
        }
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self { conn };
        store.init_schema().await?;
        info!(path = %path.as_ref().display(), "store opened");
        Ok(store)
    }

    /// Create a purely in-memory database (useful for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        debug!("in-memory store opened");
        Ok(store)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA temp_store=MEMORY;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS agents (
                        id                      TEXT PRIMARY KEY,
                        name                    TEXT NOT NULL,
                        tenant_id               TEXT,
                        agent_type              TEXT NOT NULL,
                        capabilities            TEXT NOT NULL,
                        executor                TEXT NOT NULL,
                        config                  TEXT NOT NULL,
                        status                  TEXT NOT NULL,
                        created_at              TEXT NOT NULL,
                        updated_at              TEXT NOT NULL,
                        last_run_at             TEXT,
                        consecutive_error_count INTEGER NOT NULL DEFAULT 0
                    );

                    CREATE INDEX IF NOT EXISTS idx_agents_tenant ON agents(tenant_id);
                    CREATE INDEX IF NOT EXISTS idx_agents_status ON agents(status);

                    CREATE TABLE IF NOT EXISTS executions (
                        id                  TEXT PRIMARY KEY,
                        agent_id            TEXT NOT NULL,
                        tenant_id           TEXT,
                        started_at          TEXT NOT NULL,
                        ended_at            TEXT,
                        status              TEXT NOT NULL,
                        isolation_mode_used INTEGER NOT NULL,
                        forced              INTEGER NOT NULL,
                        result_count        INTEGER NOT NULL DEFAULT 0,
                        error               TEXT,
                        warnings            TEXT NOT NULL DEFAULT '[]',
                        orphaned            INTEGER NOT NULL DEFAULT 0
                    );

                    CREATE INDEX IF NOT EXISTS idx_executions_agent ON executions(agent_id, started_at);
                    CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);

                    CREATE TABLE IF NOT EXISTS results (
                        id              TEXT PRIMARY KEY,
                        agent_id        TEXT NOT NULL,
                        tenant_id       TEXT,
                        execution_id    TEXT NOT NULL,
                        produced_at     TEXT NOT NULL,
                        source          TEXT NOT NULL,
                        content         TEXT NOT NULL,
                        relevance_score REAL,
                        orphaned        INTEGER NOT NULL DEFAULT 0
                    );

                    CREATE INDEX IF NOT EXISTS idx_results_agent ON results(agent_id, produced_at);
                    CREATE INDEX IF NOT EXISTS idx_results_tenant ON results(tenant_id, produced_at);
                    CREATE INDEX IF NOT EXISTS idx_results_execution ON results(execution_id);
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Column helpers
// ---------------------------------------------------------------------------

/// Fixed-width RFC 3339 so that text comparison in SQL orders chronologically.
pub(crate) fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

pub(crate) fn ts_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

pub(crate) fn opt_ts_col(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

pub(crate) fn uuid_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| conversion_error(idx, e))
}

pub(crate) fn enum_col<T>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| conversion_error(idx, e))
}

pub(crate) fn json_col<T: serde::de::DeserializeOwned>(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

/// Appends a visibility clause over `column` for a tenant scope: `Some(t)`
/// matches `t` and shared (NULL) rows, `None` matches shared rows only.
pub(crate) fn push_tenant_scope(
    clauses: &mut Vec<String>,
    params: &mut Vec<Value>,
    column: &str,
    tenant: Option<&str>,
) {
    match tenant {
        Some(t) => {
            params.push(Value::Text(t.to_string()));
            clauses.push(format!("({column} = ?{} OR {column} IS NULL)", params.len()));
        }
        None => clauses.push(format!("{column} IS NULL")),
    }
}

pub(crate) fn where_sql(clauses: &[String]) -> String {
    if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    }
}
