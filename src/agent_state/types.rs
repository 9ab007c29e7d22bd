use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::storage::FieldUpdate;

/// Run-level state of the background agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    #[default]
    Idle,
    Discovering,
    Paused,
    OutreachRunning,
    Stopping,
    Error,
}

impl AgentState {
    pub const ALL: [AgentState; 6] = [
        AgentState::Idle,
        AgentState::Discovering,
        AgentState::Paused,
        AgentState::OutreachRunning,
        AgentState::Stopping,
        AgentState::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Idle => "idle",
            AgentState::Discovering => "discovering",
            AgentState::Paused => "paused",
            AgentState::OutreachRunning => "outreach_running",
            AgentState::Stopping => "stopping",
            AgentState::Error => "error",
        }
    }

    /// Row of the legal transition table for this state.
    pub fn allowed_targets(&self) -> &'static [AgentState] {
        use AgentState::*;
        match self {
            Idle => &[Discovering, OutreachRunning],
            Discovering => &[Paused, Stopping, Error, Idle],
            OutreachRunning => &[Paused, Stopping, Error, Idle],
            Paused => &[Discovering, OutreachRunning, Stopping, Idle],
            Stopping => &[Idle, Error],
            // Manual recovery only
            Error => &[Idle],
        }
    }

    /// A worker is expected to be heartbeating in this state.
    pub fn is_active_run(&self) -> bool {
        matches!(self, AgentState::Discovering | AgentState::OutreachRunning)
    }
}

/// Whether `from -> to` appears in the transition table.
pub fn is_legal(from: AgentState, to: AgentState) -> bool {
    from.allowed_targets().contains(&to)
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AgentState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown agent state: {s}"))
    }
}

/// The single persisted run-state row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRunState {
    pub state: AgentState,
    pub last_transition_time: DateTime<Utc>,
    pub reason: Option<String>,
    pub controlled_by: String,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub current_task: Option<String>,
    pub discovery_query: Option<String>,
    pub discovery_location: Option<String>,
}

impl Default for AgentRunState {
    fn default() -> Self {
        Self {
            state: AgentState::Idle,
            last_transition_time: Utc::now(),
            reason: None,
            controlled_by: "system".to_string(),
            last_heartbeat: None,
            error_message: None,
            current_task: None,
            discovery_query: None,
            discovery_location: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlResult {
    Success,
    Rejected,
}

impl ControlResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlResult::Success => "success",
            ControlResult::Rejected => "rejected",
        }
    }
}

impl FromStr for ControlResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(ControlResult::Success),
            "rejected" => Ok(ControlResult::Rejected),
            other => Err(format!("unknown control result: {other}")),
        }
    }
}

/// One row of the append-only control log. Written for every transition attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlLogEntry {
    pub timestamp: DateTime<Utc>,
    pub previous_state: AgentState,
    pub new_state: AgentState,
    pub controlled_by: String,
    pub reason: Option<String>,
    pub result: ControlResult,
}

/// Answer to a control verb. Rejections are values, never errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlOutcome {
    pub accepted: bool,
    pub message: String,
}

impl ControlOutcome {
    pub fn accepted(message: impl Into<String>) -> Self {
        Self {
            accepted: true,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            message: message.into(),
        }
    }
}

impl fmt::Display for ControlOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.accepted { "accepted" } else { "rejected" };
        write!(f, "{verdict}: {}", self.message)
    }
}

/// Extra run-state columns written together with a transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionMetadata {
    pub error_message: FieldUpdate<String>,
    pub current_task: FieldUpdate<String>,
    pub discovery_query: FieldUpdate<String>,
    pub discovery_location: FieldUpdate<String>,
}

impl TransitionMetadata {
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = FieldUpdate::Set(message.into());
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error_message = FieldUpdate::Clear;
        self
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.current_task = FieldUpdate::Set(task.into());
        self
    }

    pub fn with_discovery(mut self, query: impl Into<String>, location: impl Into<String>) -> Self {
        self.discovery_query = FieldUpdate::Set(query.into());
        self.discovery_location = FieldUpdate::Set(location.into());
        self
    }

    pub fn clear_discovery(mut self) -> Self {
        self.discovery_query = FieldUpdate::Clear;
        self.discovery_location = FieldUpdate::Clear;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub reason: String,
}

impl HealthReport {
    pub fn ok() -> Self {
        Self {
            healthy: true,
            reason: "OK".to_string(),
        }
    }

    pub fn unhealthy(reason: impl Into<String>) -> Self {
        Self {
            healthy: false,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table_rows() {
        use AgentState::*;
        assert!(is_legal(Idle, Discovering));
        assert!(is_legal(Idle, OutreachRunning));
        assert!(!is_legal(Idle, Paused));
        assert!(!is_legal(Idle, Idle));
        assert!(is_legal(Paused, Stopping));
        assert!(!is_legal(Paused, Error));
        assert!(is_legal(Stopping, Error));
        assert!(!is_legal(Stopping, Discovering));
        assert_eq!(Error.allowed_targets(), &[Idle]);
    }

    #[test]
    fn test_state_names_match_serde() {
        for state in AgentState::ALL {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state.as_str()));
            assert_eq!(state.as_str().parse::<AgentState>(), Ok(state));
        }
    }
}
