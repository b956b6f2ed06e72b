use std::fmt;

use serde::{Deserialize, Serialize};
use wt_core::types::AgentStatus;

// ---------------------------------------------------------------------------
// AgentEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentEvent {
    /// Scheduled run takes the agent.
    Claim,
    /// Manual run takes the agent; allowed from any idle status.
    ForceClaim,
    /// A run ended; the agent moves to the carried status.
    Finish(AgentStatus),
    /// Health monitor demotes an agent past its error budget.
    Demote,
    Reactivate,
    Deactivate,
}

impl fmt::Display for AgentEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentEvent::Claim => write!(f, "Claim"),
            AgentEvent::ForceClaim => write!(f, "ForceClaim"),
            AgentEvent::Finish(to) => write!(f, "Finish({to})"),
            AgentEvent::Demote => write!(f, "Demote"),
            AgentEvent::Reactivate => write!(f, "Reactivate"),
            AgentEvent::Deactivate => write!(f, "Deactivate"),
        }
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateMachineError {
    #[error("invalid transition: cannot apply {event} in status {status}")]
    InvalidTransition { status: AgentStatus, event: AgentEvent },
}

// ---------------------------------------------------------------------------
// Transition table
// ---------------------------------------------------------------------------

/// Statuses from which `event` is accepted.
///
/// - Active                  + Claim        -> Running
/// - Active/Inactive/Error   + ForceClaim   -> Running
/// - Running                 + Finish(s)    -> s  (s is never Running)
/// - Active                  + Demote       -> Error
/// - Error/Inactive          + Reactivate   -> Active
/// - Active                  + Deactivate   -> Inactive
pub fn allowed_from(event: AgentEvent) -> &'static [AgentStatus] {
    match event {
        AgentEvent::Claim => &[AgentStatus::Active],
        AgentEvent::ForceClaim => &[AgentStatus::Active, AgentStatus::Inactive, AgentStatus::Error],
        AgentEvent::Finish(_) => &[AgentStatus::Running],
        AgentEvent::Demote => &[AgentStatus::Active],
        AgentEvent::Reactivate => &[AgentStatus::Error, AgentStatus::Inactive],
        AgentEvent::Deactivate => &[AgentStatus::Active],
    }
}

fn target(event: AgentEvent) -> AgentStatus {
    match event {
        AgentEvent::Claim | AgentEvent::ForceClaim => AgentStatus::Running,
        AgentEvent::Finish(to) => to,
        AgentEvent::Demote => AgentStatus::Error,
        AgentEvent::Reactivate => AgentStatus::Active,
        AgentEvent::Deactivate => AgentStatus::Inactive,
    }
}

/// Apply `event` to `status`.
pub fn transition(status: AgentStatus, event: AgentEvent) -> Result<AgentStatus, StateMachineError> {
    let next = target(event);
    let finishes_into_running = matches!(event, AgentEvent::Finish(AgentStatus::Running));
    if !allowed_from(event).contains(&status) || finishes_into_running {
        return Err(StateMachineError::InvalidTransition { status, event });
    }
    tracing::debug!(from = %status, event = %event, to = %next, "agent status transition");
    Ok(next)
}

/// The event that moves an agent from `current` to a requested idle
/// status, if any. `Ok(None)` means it is already there.
pub fn event_for_request(
    current: AgentStatus,
    requested: AgentStatus,
) -> Result<Option<AgentEvent>, StateMachineError> {
    if current == requested {
        return Ok(None);
    }
    let event = match requested {
        AgentStatus::Active => AgentEvent::Reactivate,
        AgentStatus::Inactive => AgentEvent::Deactivate,
        AgentStatus::Error => AgentEvent::Demote,
        AgentStatus::Running => AgentEvent::Claim,
    };
    transition(current, event).map(|_| Some(event))
}
