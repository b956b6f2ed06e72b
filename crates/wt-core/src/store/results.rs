use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter};
use serde::Serialize;
use tracing::debug;

use super::{push_tenant_scope, ts_col, ts_to_sql, uuid_col, where_sql, Result, Store};
use crate::types::{page_limit, AgentResult, Page, ResultFilter};

const RESULT_COLUMNS: &str =
    "id, agent_id, tenant_id, execution_id, produced_at, source, content, relevance_score";

fn row_to_result(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentResult> {
    Ok(AgentResult {
        id: uuid_col(row, 0)?,
        agent_id: uuid_col(row, 1)?,
        tenant_id: row.get(2)?,
        execution_id: uuid_col(row, 3)?,
        produced_at: ts_col(row, 4)?,
        source: row.get(5)?,
        content: row.get(6)?,
        relevance_score: row.get(7)?,
    })
}

/// Escape `%`, `_` and the escape character itself for a `LIKE ... ESCAPE '\'`.
fn like_pattern(keyword: &str) -> String {
    let mut out = String::with_capacity(keyword.len() + 2);
    out.push('%');
    for ch in keyword.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('%');
    out
}

/// What a compaction pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompactionReport {
    pub expired_results: usize,
    pub capped_results: usize,
    pub orphaned_results: usize,
    pub executions: usize,
}

impl CompactionReport {
    pub fn total_results(&self) -> usize {
        self.expired_results + self.capped_results + self.orphaned_results
    }
}

impl Store {
    /// Page through results newest first. Count and rows are read inside one
    /// transaction so a concurrent compaction cannot split the page.
    pub async fn query_results(&self, filter: &ResultFilter) -> Result<Page<AgentResult>> {
        let limit = page_limit(filter.limit);
        let offset = filter.offset.unwrap_or(0);

        let mut clauses = vec!["orphaned = 0".to_string()];
        let mut params: Vec<Value> = Vec::new();
        push_tenant_scope(&mut clauses, &mut params, "tenant_id", filter.tenant_id.as_deref());
        if let Some(agent_id) = filter.agent_id {
            params.push(Value::Text(agent_id.to_string()));
            clauses.push(format!("agent_id = ?{}", params.len()));
        }
        if let Some(from) = filter.from {
            params.push(Value::Text(ts_to_sql(&from)));
            clauses.push(format!("produced_at >= ?{}", params.len()));
        }
        if let Some(to) = filter.to {
            params.push(Value::Text(ts_to_sql(&to)));
            clauses.push(format!("produced_at <= ?{}", params.len()));
        }
        if let Some(keyword) = filter.keyword.as_deref().map(str::trim).filter(|k| !k.is_empty()) {
            params.push(Value::Text(like_pattern(keyword)));
            clauses.push(format!("content LIKE ?{} ESCAPE '\\'", params.len()));
        }
        let where_clause = where_sql(&clauses);

        let page = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let total: i64 = tx.query_row(
                    &format!("SELECT COUNT(*) FROM results {where_clause}"),
                    params_from_iter(params.iter()),
                    |row| row.get(0),
                )?;

                let mut paged = params.clone();
                paged.push(Value::Integer(limit as i64));
                let limit_idx = paged.len();
                paged.push(Value::Integer(offset as i64));
                let offset_idx = paged.len();
                let sql = format!(
                    "SELECT {RESULT_COLUMNS} FROM results {where_clause} \
                     ORDER BY produced_at DESC, relevance_score DESC, rowid ASC LIMIT ?{limit_idx} OFFSET ?{offset_idx}"
                );
                let items = {
                    let mut stmt = tx.prepare(&sql)?;
                    let rows = stmt
                        .query_map(params_from_iter(paged.iter()), row_to_result)?
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

    /// Apply retention in one transaction: drop orphaned results, results
    /// older than `cutoff`, and everything beyond the newest `max_per_agent`
    /// per agent; then drop terminal executions that ended before `cutoff`
    /// (or were orphaned) and no longer own any result.
    pub async fn compact(
        &self,
        cutoff: DateTime<Utc>,
        max_per_agent: u32,
    ) -> Result<CompactionReport> {
        let cutoff = ts_to_sql(&cutoff);
        let report = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
                let orphaned_results = tx.execute("DELETE FROM results WHERE orphaned = 1", [])?;
                let expired_results =
                    tx.execute("DELETE FROM results WHERE produced_at < ?1", params![cutoff])?;
                let capped_results = tx.execute(
                    "DELETE FROM results WHERE id IN (
                         SELECT id FROM (
                             SELECT id, ROW_NUMBER() OVER (
                                 PARTITION BY agent_id ORDER BY produced_at DESC, rowid DESC
                             ) AS rn
                             FROM results
                         ) WHERE rn > ?1
                     )",
                    params![max_per_agent],
                )?;
                let executions = tx.execute(
                    "DELETE FROM executions
                     WHERE status IN ('completed', 'failed', 'timed_out')
                       AND (orphaned = 1 OR ended_at < ?1)
                       AND NOT EXISTS (SELECT 1 FROM results r WHERE r.execution_id = executions.id)",
                    params![cutoff],
                )?;
                tx.commit()?;
                Ok(CompactionReport {
                    expired_results,
                    capped_results,
                    orphaned_results,
                    executions,
                })
            })
            .await?;
        debug!(
            expired = report.expired_results,
            capped = report.capped_results,
            orphaned = report.orphaned_results,
            executions = report.executions,
            "compaction transaction committed"
        );
        Ok(report)
    }
}
