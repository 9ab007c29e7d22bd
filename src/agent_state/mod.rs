// Agent State - run-level control of discovery and outreach
//
// A closed state enum with a static transition table, and the manager that
// persists every transition attempt to the control log.

pub mod manager;
pub mod types;

pub use manager::{health_of, AgentStateManager};
pub use types::{
    is_legal, AgentRunState, AgentState, ControlLogEntry, ControlOutcome, ControlResult,
    HealthReport, TransitionMetadata,
};
