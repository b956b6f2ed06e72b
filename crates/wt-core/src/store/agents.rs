use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use tracing::debug;
use uuid::Uuid;

use super::{enum_col, json_col, opt_ts_col, ts_col, ts_to_sql, uuid_col, Result, Store};
use crate::types::{Agent, AgentStatus};

const AGENT_COLUMNS: &str = "id, name, tenant_id, agent_type, capabilities, executor, config, \
     status, created_at, updated_at, last_run_at, consecutive_error_count";

/// Outcome of a conditional status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    /// The agent moved; `previous` is the status it left.
    Changed { previous: AgentStatus },
    /// The agent exists but its current status was not in the allowed set.
    Rejected { current: AgentStatus },
    Missing,
}

fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<Agent> {
    Ok(Agent {
        id: uuid_col(row, 0)?,
        name: row.get(1)?,
        tenant_id: row.get(2)?,
        agent_type: enum_col(row, 3)?,
        capabilities: json_col(row, 4)?,
        executor: enum_col(row, 5)?,
        config: json_col(row, 6)?,
        status: enum_col(row, 7)?,
        created_at: ts_col(row, 8)?,
        updated_at: ts_col(row, 9)?,
        last_run_at: opt_ts_col(row, 10)?,
        consecutive_error_count: row.get(11)?,
    })
}

impl Store {
    // -----------------------------------------------------------------------
    // Agents: definition
    // -----------------------------------------------------------------------

    pub async fn insert_agent(&self, agent: &Agent) -> Result<()> {
        let id = agent.id.to_string();
        let name = agent.name.clone();
        let tenant_id = agent.tenant_id.clone();
        let agent_type = agent.agent_type.as_str();
        let capabilities = serde_json::to_string(&agent.capabilities)?;
        let executor = agent.executor.as_str();
        let config = serde_json::to_string(&agent.config)?;
        let status = agent.status.as_str();
        let created_at = ts_to_sql(&agent.created_at);
        let updated_at = ts_to_sql(&agent.updated_at);
        let last_run_at = agent.last_run_at.as_ref().map(ts_to_sql);
        let errors = agent.consecutive_error_count;

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO agents (id, name, tenant_id, agent_type, capabilities, executor, \
                     config, status, created_at, updated_at, last_run_at, consecutive_error_count) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    params![
                        id,
                        name,
                        tenant_id,
                        agent_type,
                        capabilities,
                        executor,
                        config,
                        status,
                        created_at,
                        updated_at,
                        last_run_at,
                        errors
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Rewrite the user-editable part of an agent (name, capabilities,
    /// executor, config). Lifecycle columns are left untouched so an edit
    /// never races with the scheduler's claim/release.
    pub async fn update_agent_definition(&self, agent: &Agent) -> Result<bool> {
        let id = agent.id.to_string();
        let name = agent.name.clone();
        let capabilities = serde_json::to_string(&agent.capabilities)?;
        let executor = agent.executor.as_str();
        let config = serde_json::to_string(&agent.config)?;
        let updated_at = ts_to_sql(&agent.updated_at);

        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE agents SET name = ?2, capabilities = ?3, executor = ?4, config = ?5, \
                     updated_at = ?6 WHERE id = ?1",
                    params![id, name, capabilities, executor, config, updated_at],
                )?;
                Ok(n > 0)
            })
            .await?;
        Ok(changed)
    }

    pub async fn get_agent(&self, id: Uuid) -> Result<Option<Agent>> {
        let id = id.to_string();
        let agent = self
            .conn
            .call(move |conn| {
                let sql = format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?1");
                let agent = conn
                    .query_row(&sql, params![id], row_to_agent)
                    .optional()?;
                Ok(agent)
            })
            .await?;
        Ok(agent)
    }

    /// Agents visible to a tenant scope, newest first. `None` lists shared
    /// agents only.
    pub async fn list_visible_agents(&self, tenant: Option<&str>) -> Result<Vec<Agent>> {
        let tenant = tenant.map(str::to_string);
        let agents = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {AGENT_COLUMNS} FROM agents \
                     WHERE agent_type = 'shared' OR (?1 IS NOT NULL AND tenant_id = ?1) \
                     ORDER BY created_at DESC, id DESC"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![tenant], row_to_agent)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(agents)
    }

    pub async fn list_agents_by_status(&self, status: AgentStatus) -> Result<Vec<Agent>> {
        let status = status.as_str();
        let agents = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {AGENT_COLUMNS} FROM agents WHERE status = ?1 ORDER BY created_at ASC, id ASC"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![status], row_to_agent)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(agents)
    }

    /// Every agent regardless of tenant, for the health loop.
    pub async fn list_all_agents(&self) -> Result<Vec<Agent>> {
        let agents = self
            .conn
            .call(|conn| {
                let sql = format!("SELECT {AGENT_COLUMNS} FROM agents ORDER BY created_at ASC, id ASC");
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], row_to_agent)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(agents)
    }

    /// Remove an agent. Its executions and results are flagged orphaned in
    /// the same transaction: hidden from queries, removed by compaction.
    pub async fn delete_agent(&self, id: Uuid) -> Result<bool> {
        let id = id.to_string();
        let removed = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let n = tx.execute("DELETE FROM agents WHERE id = ?1", params![id])?;
                if n > 0 {
                    tx.execute(
                        "UPDATE executions SET orphaned = 1 WHERE agent_id = ?1",
                        params![id],
                    )?;
                    tx.execute("UPDATE results SET orphaned = 1 WHERE agent_id = ?1", params![id])?;
                }
                tx.commit()?;
                Ok(n > 0)
            })
            .await?;
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Agents: lifecycle
    // -----------------------------------------------------------------------

    /// Atomically move an agent to `to` if its current status is one of
    /// `allowed_from`.
    pub async fn transition_agent(
        &self,
        id: Uuid,
        allowed_from: &[AgentStatus],
        to: AgentStatus,
        now: DateTime<Utc>,
    ) -> Result<StatusChange> {
        let id = id.to_string();
        let allowed: Vec<AgentStatus> = allowed_from.to_vec();
        let now = ts_to_sql(&now);

        let change = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
                let current = tx
                    .query_row(
                        "SELECT status FROM agents WHERE id = ?1",
                        params![id],
                        |row| enum_col::<AgentStatus>(row, 0),
                    )
                    .optional()?;
                let change = match current {
                    None => StatusChange::Missing,
                    Some(current) if allowed.contains(&current) => {
                        tx.execute(
                            "UPDATE agents SET status = ?2, updated_at = ?3 WHERE id = ?1",
                            params![id, to.as_str(), now],
                        )?;
                        StatusChange::Changed { previous: current }
                    }
                    Some(current) => StatusChange::Rejected { current },
                };
                tx.commit()?;
                Ok(change)
            })
            .await?;
        Ok(change)
    }

    /// Finish a run for an agent holding `running`. Success makes it active,
    /// stamps `last_run_at` and clears the error streak; failure restores
    /// `restore` and extends the streak. `last_run_at` moves either way so a
    /// failing agent is not retried before its next interval.
    pub async fn release_agent(
        &self,
        id: Uuid,
        success: bool,
        restore: AgentStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let id = id.to_string();
        let now = ts_to_sql(&now);

        let released = self
            .conn
            .call(move |conn| {
                let n = if success {
                    conn.execute(
                        "UPDATE agents SET status = 'active', last_run_at = ?2, \
                         consecutive_error_count = 0, updated_at = ?2 \
                         WHERE id = ?1 AND status = 'running'",
                        params![id, now],
                    )?
                } else {
                    conn.execute(
                        "UPDATE agents SET status = ?3, last_run_at = ?2, \
                         consecutive_error_count = consecutive_error_count + 1, updated_at = ?2 \
                         WHERE id = ?1 AND status = 'running'",
                        params![id, now, restore.as_str()],
                    )?
                };
                Ok(n > 0)
            })
            .await?;
        Ok(released)
    }

    /// Clear the error streak and return the agent to `active`. A running
    /// agent keeps `running`; its release will settle the status.
    pub async fn reactivate_agent(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let id = id.to_string();
        let now = ts_to_sql(&now);
        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE agents SET consecutive_error_count = 0, \
                     status = CASE WHEN status = 'running' THEN 'running' ELSE 'active' END, \
                     updated_at = ?2 WHERE id = ?1",
                    params![id, now],
                )?;
                Ok(n > 0)
            })
            .await?;
        Ok(changed)
    }

    /// Move an `active` agent to `error` only while its stored error streak
    /// is still at least `max_error_count`. The check and the write happen
    /// in one statement, so a run or reactivation that reset the streak in
    /// the meantime wins. Returns whether the agent was demoted.
    pub async fn demote_agent(
        &self,
        id: Uuid,
        max_error_count: u32,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let key = id.to_string();
        let now = ts_to_sql(&now);
        let demoted = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE agents SET status = 'error', updated_at = ?3 \
                     WHERE id = ?1 AND status = 'active' AND consecutive_error_count >= ?2",
                    params![key, max_error_count, now],
                )?;
                Ok(n > 0)
            })
            .await?;
        if !demoted {
            debug!(agent_id = %id, "demotion skipped, agent no longer over its error budget");
        }
        Ok(demoted)
    }
}
