use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension};
use tracing::debug;
use uuid::Uuid;

use super::{
    enum_col, json_col, opt_ts_col, push_tenant_scope, ts_col, ts_to_sql, uuid_col, where_sql,
    Result, Store,
};
use crate::types::{
    page_limit, AgentExecution, AgentResult, ExecutionCompletion, ExecutionFilter, Page,
};

const EXECUTION_COLUMNS: &str = "id, agent_id, tenant_id, started_at, ended_at, status, \
     isolation_mode_used, forced, result_count, error, warnings";

fn row_to_execution(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentExecution> {
    Ok(AgentExecution {
        id: uuid_col(row, 0)?,
        agent_id: uuid_col(row, 1)?,
        tenant_id: row.get(2)?,
        started_at: ts_col(row, 3)?,
        ended_at: opt_ts_col(row, 4)?,
        status: enum_col(row, 5)?,
        isolation_mode_used: row.get(6)?,
        forced: row.get(7)?,
        result_count: row.get(8)?,
        error: row.get(9)?,
        warnings: json_col(row, 10)?,
    })
}

/// Result rows prepared for insertion inside the finalize transaction.
struct ResultRow {
    id: String,
    agent_id: String,
    tenant_id: Option<String>,
    execution_id: String,
    produced_at: String,
    source: String,
    content: String,
    relevance_score: Option<f64>,
}

impl From<&AgentResult> for ResultRow {
    fn from(r: &AgentResult) -> Self {
        Self {
            id: r.id.to_string(),
            agent_id: r.agent_id.to_string(),
            tenant_id: r.tenant_id.clone(),
            execution_id: r.execution_id.to_string(),
            produced_at: ts_to_sql(&r.produced_at),
            source: r.source.clone(),
            content: r.content.clone(),
            relevance_score: r.relevance_score,
        }
    }
}

impl Store {
    pub async fn insert_execution(&self, execution: &AgentExecution) -> Result<()> {
        let id = execution.id.to_string();
        let agent_id = execution.agent_id.to_string();
        let tenant_id = execution.tenant_id.clone();
        let started_at = ts_to_sql(&execution.started_at);
        let ended_at = execution.ended_at.as_ref().map(ts_to_sql);
        let status = execution.status.as_str();
        let isolation = execution.isolation_mode_used;
        let forced = execution.forced;
        let result_count = execution.result_count;
        let error = execution.error.clone();
        let warnings = serde_json::to_string(&execution.warnings)?;

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO executions (id, agent_id, tenant_id, started_at, ended_at, status, \
                     isolation_mode_used, forced, result_count, error, warnings) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        id,
                        agent_id,
                        tenant_id,
                        started_at,
                        ended_at,
                        status,
                        isolation,
                        forced,
                        result_count,
                        error,
                        warnings
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// `pending -> running` once a concurrency slot is held. `started_at`
    /// moves to the moment work actually begins.
    pub async fn mark_execution_running(&self, id: Uuid, started_at: DateTime<Utc>) -> Result<bool> {
        let id = id.to_string();
        let started_at = ts_to_sql(&started_at);
        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE executions SET status = 'running', started_at = ?2 \
                     WHERE id = ?1 AND status = 'pending'",
                    params![id, started_at],
                )?;
                Ok(n > 0)
            })
            .await?;
        Ok(changed)
    }

    /// Write the terminal outcome of an execution together with its results.
    ///
    /// The update only applies while the execution is still non-terminal, so
    /// of two racing finalizers (worker and timeout handler) exactly one wins;
    /// the loser's results are discarded with its update. Returns whether this
    /// call won.
    pub async fn finalize_execution(
        &self,
        completion: &ExecutionCompletion,
        results: &[AgentResult],
    ) -> Result<bool> {
        let id = completion.execution_id.to_string();
        let status = completion.status.as_str();
        let ended_at = ts_to_sql(&completion.ended_at);
        let error = completion.error.clone();
        let warnings = serde_json::to_string(&completion.warnings)?;
        let rows: Vec<ResultRow> = results.iter().map(ResultRow::from).collect();
        let result_count = rows.len() as u32;

        let won = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
                let n = tx.execute(
                    "UPDATE executions SET status = ?2, ended_at = ?3, error = ?4, warnings = ?5, \
                     result_count = ?6 WHERE id = ?1 AND status IN ('pending', 'running')",
                    params![id, status, ended_at, error, warnings, result_count],
                )?;
                if n == 0 {
                    return Ok(false);
                }
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO results (id, agent_id, tenant_id, execution_id, produced_at, \
                         source, content, relevance_score) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    )?;
                    for r in &rows {
                        stmt.execute(params![
                            r.id,
                            r.agent_id,
                            r.tenant_id,
                            r.execution_id,
                            r.produced_at,
                            r.source,
                            r.content,
                            r.relevance_score
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(true)
            })
            .await?;
        Ok(won)
    }

    pub async fn get_execution(&self, id: Uuid) -> Result<Option<AgentExecution>> {
        let id = id.to_string();
        let execution = self
            .conn
            .call(move |conn| {
                let sql = format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?1");
                let row = conn.query_row(&sql, params![id], row_to_execution).optional()?;
                Ok(row)
            })
            .await?;
        Ok(execution)
    }

    /// Execution history, newest first, tenant-scoped like result queries.
    pub async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Page<AgentExecution>> {
        let limit = page_limit(filter.limit);
        let offset = filter.offset.unwrap_or(0);

        let mut clauses = vec!["orphaned = 0".to_string()];
        let mut params: Vec<Value> = Vec::new();
        push_tenant_scope(&mut clauses, &mut params, "tenant_id", filter.tenant_id.as_deref());
        if let Some(agent_id) = filter.agent_id {
            params.push(Value::Text(agent_id.to_string()));
            clauses.push(format!("agent_id = ?{}", params.len()));
        }
        if let Some(status) = filter.status {
            params.push(Value::Text(status.as_str().to_string()));
            clauses.push(format!("status = ?{}", params.len()));
        }
        let where_clause = where_sql(&clauses);

        let page = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let total: i64 = tx.query_row(
                    &format!("SELECT COUNT(*) FROM executions {where_clause}"),
                    params_from_iter(params.iter()),
                    |row| row.get(0),
                )?;

                let mut paged = params.clone();
                paged.push(Value::Integer(limit as i64));
                let limit_idx = paged.len();
                paged.push(Value::Integer(offset as i64));
                let offset_idx = paged.len();
                let sql = format!(
                    "SELECT {EXECUTION_COLUMNS} FROM executions {where_clause} \
                     ORDER BY started_at DESC, rowid DESC LIMIT ?{limit_idx} OFFSET ?{offset_idx}"
                );
                let items = {
                    let mut stmt = tx.prepare(&sql)?;
                    let rows = stmt
                        .query_map(params_from_iter(paged.iter()), row_to_execution)?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    rows
                };
                tx.commit()?;
                Ok(Page {
                    items,
                    total: total.max(0) as u64,
                    limit,
                    offset,
                })
            })
            .await?;
        Ok(page)
    }

    /// Executions of one agent started at or after `since`, oldest first.
    pub async fn executions_since(
        &self,
        agent_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<AgentExecution>> {
        let agent_id = agent_id.to_string();
        let since = ts_to_sql(&since);
        let rows = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {EXECUTION_COLUMNS} FROM executions \
                     WHERE agent_id = ?1 AND started_at >= ?2 AND orphaned = 0 \
                     ORDER BY started_at ASC, rowid ASC"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![agent_id, since], row_to_execution)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    pub async fn count_running_executions(&self) -> Result<u64> {
        let n = self
            .conn
            .call(|conn| {
                let n: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM executions WHERE status = 'running'",
                    [],
                    |row| row.get(0),
                )?;
                Ok(n)
            })
            .await?;
        Ok(n.max(0) as u64)
    }

    /// Startup recovery: fail every non-terminal execution left behind by a
    /// previous process and put `running` agents back to `active`. Returns
    /// `(executions_failed, agents_released)`.
    pub async fn recover_abandoned(&self, now: DateTime<Utc>, reason: &str) -> Result<(usize, usize)> {
        let now = ts_to_sql(&now);
        let reason = reason.to_string();
        let counts = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
                let executions = tx.execute(
                    "UPDATE executions SET status = 'failed', ended_at = ?1, error = ?2 \
                     WHERE status IN ('pending', 'running')",
                    params![now, reason],
                )?;
                let agents = tx.execute(
                    "UPDATE agents SET status = 'active', updated_at = ?1 WHERE status = 'running'",
                    params![now],
                )?;
                tx.commit()?;
                Ok((executions, agents))
            })
            .await?;
        debug!(
            executions = counts.0,
            agents = counts.1,
            "abandoned executions failed and agents released"
        );
        Ok(counts)
    }
}
