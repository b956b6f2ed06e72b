use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tenants are owned by an external account system; we only carry their id.
pub type TenantId = String;

/// Error returned when a stored enum label does not match any variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} `{value}`")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $label:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $label,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($label => Ok($ty::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

// ---------------------------------------------------------------------------
// AgentType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    TenantSpecific,
    Shared,
}

string_enum!(AgentType, "agent type", {
    TenantSpecific => "tenant_specific",
    Shared => "shared",
});

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

/// What kind of intelligence an agent gathers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    NewsMonitoring,
    TrendAnalysis,
    CustomKeyword,
}

string_enum!(Capability, "capability", {
    NewsMonitoring => "news_monitoring",
    TrendAnalysis => "trend_analysis",
    CustomKeyword => "custom_keyword",
});

// ---------------------------------------------------------------------------
// ExecutorKind
// ---------------------------------------------------------------------------

/// The executor variant an agent runs with. Chosen once when the agent is
/// created (or its capabilities change) and stored alongside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    NewsMonitor,
    TrendAnalyzer,
    KeywordWatcher,
}

string_enum!(ExecutorKind, "executor kind", {
    NewsMonitor => "news_monitor",
    TrendAnalyzer => "trend_analyzer",
    KeywordWatcher => "keyword_watcher",
});

// ---------------------------------------------------------------------------
// AgentStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Inactive,
    Error,
    Running,
}

string_enum!(AgentStatus, "agent status", {
    Active => "active",
    Inactive => "inactive",
    Error => "error",
    Running => "running",
});

// ---------------------------------------------------------------------------
// AgentConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default = "default_update_frequency")]
    pub update_frequency_minutes: u32,
    #[serde(default = "default_max_results")]
    pub max_results_per_update: u32,
    #[serde(default)]
    pub isolation_mode: bool,
    #[serde(default)]
    pub custom_sources: Vec<String>,
}

fn default_update_frequency() -> u32 {
    60
}
fn default_max_results() -> u32 {
    10
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            keywords: Vec::new(),
            update_frequency_minutes: default_update_frequency(),
            max_results_per_update: default_max_results(),
            isolation_mode: false,
            custom_sources: Vec::new(),
        }
    }
}

impl AgentConfig {
    pub fn update_frequency(&self) -> Duration {
        Duration::minutes(i64::from(self.update_frequency_minutes))
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    /// Present iff `agent_type` is `TenantSpecific`.
    pub tenant_id: Option<TenantId>,
    pub agent_type: AgentType,
    pub capabilities: BTreeSet<Capability>,
    pub executor: ExecutorKind,
    pub config: AgentConfig,
    pub status: AgentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub consecutive_error_count: u32,
}

impl Agent {
    /// Whether a caller scoped to `tenant` may see this agent. Shared agents
    /// are visible to everyone; tenant agents only to their owner.
    pub fn is_visible_to(&self, tenant: Option<&str>) -> bool {
        match self.agent_type {
            AgentType::Shared => true,
            AgentType::TenantSpecific => {
                matches!((self.tenant_id.as_deref(), tenant), (Some(owner), Some(t)) if owner == t)
            }
        }
    }

    /// When the next scheduled run becomes due. `None` for agents that have
    /// never run (they are due immediately).
    pub fn next_run_at(&self) -> Option<DateTime<Utc>> {
        self.last_run_at
            .map(|last| last + self.config.update_frequency())
    }

    /// `now - last_run_at >= update_frequency`, ignoring status.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_run_at {
            None => true,
            Some(last) => now - last >= self.config.update_frequency(),
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
}

string_enum!(ExecutionStatus, "execution status", {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    TimedOut => "timed_out",
});

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::TimedOut
        )
    }

    /// Returns `true` when a transition from `self` to `target` is valid.
    /// Terminal states never transition again.
    pub fn can_transition_to(&self, target: &ExecutionStatus) -> bool {
        matches!(
            (self, target),
            (ExecutionStatus::Pending, ExecutionStatus::Running)
                | (ExecutionStatus::Pending, ExecutionStatus::Failed)
                | (ExecutionStatus::Pending, ExecutionStatus::TimedOut)
                | (ExecutionStatus::Running, ExecutionStatus::Completed)
                | (ExecutionStatus::Running, ExecutionStatus::Failed)
                | (ExecutionStatus::Running, ExecutionStatus::TimedOut)
        )
    }
}

// ---------------------------------------------------------------------------
// AgentExecution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentExecution {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub tenant_id: Option<TenantId>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub isolation_mode_used: bool,
    /// Whether this run was requested manually rather than by the scheduler.
    pub forced: bool,
    pub result_count: u32,
    pub error: Option<String>,
    /// One entry per data source that failed without failing the run.
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl AgentExecution {
    /// A freshly dispatched execution, not yet holding a concurrency slot.
    pub fn pending(agent: &Agent, isolation_mode_used: bool, forced: bool, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id: agent.id,
            tenant_id: agent.tenant_id.clone(),
            started_at: now,
            ended_at: None,
            status: ExecutionStatus::Pending,
            isolation_mode_used,
            forced,
            result_count: 0,
            error: None,
            warnings: Vec::new(),
        }
    }

    /// Wall time between start and end, if the execution has ended.
    pub fn duration(&self) -> Option<Duration> {
        self.ended_at.map(|end| end - self.started_at)
    }
}

/// Terminal outcome written once for an execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionCompletion {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub ended_at: DateTime<Utc>,
    pub error: Option<String>,
    pub warnings: Vec<String>,
}

// ---------------------------------------------------------------------------
// AgentResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub id: Uuid,
    pub agent_id: Uuid,
    /// `None` for results produced by shared agents.
    pub tenant_id: Option<TenantId>,
    pub execution_id: Uuid,
    pub produced_at: DateTime<Utc>,
    pub source: String,
    pub content: String,
    pub relevance_score: Option<f64>,
}

// ---------------------------------------------------------------------------
// Query types
// ---------------------------------------------------------------------------

pub const DEFAULT_PAGE_LIMIT: usize = 50;
pub const MAX_PAGE_LIMIT: usize = 500;

/// Filter for result queries. `tenant_id` is a visibility scope: `Some(t)`
/// sees `t`'s results plus shared-agent results, `None` sees shared only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultFilter {
    pub agent_id: Option<Uuid>,
    pub tenant_id: Option<TenantId>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub keyword: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Filter for execution history. Same tenant scoping as [`ResultFilter`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionFilter {
    pub agent_id: Option<Uuid>,
    pub tenant_id: Option<TenantId>,
    pub status: Option<ExecutionStatus>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Clamp a requested page size into `1..=MAX_PAGE_LIMIT`.
pub fn page_limit(requested: Option<usize>) -> usize {
    requested.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub limit: usize,
    pub offset: usize,
}

impl<T> Page<T> {
    pub fn has_more(&self) -> bool {
        ((self.offset + self.items.len()) as u64) < self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn agent(tenant: Option<&str>) -> Agent {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().expect("valid date");
        Agent {
            id: Uuid::new_v4(),
            name: "probe".into(),
            tenant_id: tenant.map(str::to_string),
            agent_type: if tenant.is_some() {
                AgentType::TenantSpecific
            } else {
                AgentType::Shared
            },
            capabilities: [Capability::NewsMonitoring].into_iter().collect(),
            executor: ExecutorKind::NewsMonitor,
            config: AgentConfig {
                update_frequency_minutes: 30,
                ..AgentConfig::default()
            },
            status: AgentStatus::Active,
            created_at: now,
            updated_at: now,
            last_run_at: None,
            consecutive_error_count: 0,
        }
    }

    #[test]
    fn enum_labels_round_trip_through_from_str() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::TimedOut,
        ] {
            assert_eq!(status.as_str().parse::<ExecutionStatus>(), Ok(status));
        }
        assert!("sleeping".parse::<AgentStatus>().is_err());
    }

    #[test]
    fn serde_and_sql_labels_agree() {
        let json = serde_json::to_string(&ExecutionStatus::TimedOut).expect("serialize");
        assert_eq!(json, "\"timed_out\"");
        assert_eq!(ExecutionStatus::TimedOut.as_str(), "timed_out");
    }

    #[test]
    fn never_run_agent_is_due() {
        let a = agent(None);
        assert!(a.is_due(a.created_at));
        assert!(a.next_run_at().is_none());
    }

    #[test]
    fn due_exactly_at_frequency_boundary() {
        let mut a = agent(None);
        let last = a.created_at;
        a.last_run_at = Some(last);
        assert!(!a.is_due(last + Duration::minutes(29)));
        assert!(a.is_due(last + Duration::minutes(30)));
        assert_eq!(a.next_run_at(), Some(last + Duration::minutes(30)));
    }

    #[test]
    fn visibility_respects_tenant_ownership() {
        let shared = agent(None);
        let owned = agent(Some("acme"));

        assert!(shared.is_visible_to(None));
        assert!(shared.is_visible_to(Some("globex")));
        assert!(owned.is_visible_to(Some("acme")));
        assert!(!owned.is_visible_to(Some("globex")));
        assert!(!owned.is_visible_to(None));
    }

    #[test]
    fn terminal_execution_states_do_not_transition() {
        for terminal in [
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::TimedOut,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(&ExecutionStatus::Running));
            assert!(!terminal.can_transition_to(&ExecutionStatus::Completed));
        }
        assert!(ExecutionStatus::Pending.can_transition_to(&ExecutionStatus::Running));
        assert!(!ExecutionStatus::Pending.can_transition_to(&ExecutionStatus::Completed));
    }

    #[test]
    fn page_reports_remaining_items() {
        let page = Page {
            items: vec![1, 2],
            total: 5,
            limit: 2,
            offset: 2,
        };
        assert!(page.has_more());
        let last = Page {
            items: vec![5],
            total: 5,
            limit: 2,
            offset: 4,
        };
        assert!(!last.has_more());
    }

    #[test]
    fn page_limit_is_clamped() {
        assert_eq!(page_limit(None), DEFAULT_PAGE_LIMIT);
        assert_eq!(page_limit(Some(0)), 1);
        assert_eq!(page_limit(Some(10_000)), MAX_PAGE_LIMIT);
    }
}
