// Outreach Control Library - approval-gated lead discovery and outreach
// This exposes the core components for hosting services, the operator CLI and tests

pub mod agent_state;
pub mod cli;
pub mod config;
pub mod leads;
pub mod runner;
pub mod storage;
pub mod telemetry;

// Re-export key types for easy access
pub use agent_state::{
    is_legal, AgentRunState, AgentState, AgentStateManager, ControlLogEntry, ControlOutcome,
    ControlResult, HealthReport,
};
pub use config::OutreachControlConfig;
pub use leads::{
    Lead, LeadErrorCode, LeadLifecycleState, LeadLifecycleStateMachine, LeadTransitionResult,
    OutreachStatus, ReviewStatus, TransitionPolicy,
};
pub use runner::{AgentRunner, Collaborators, RunSummary, RunnerSettings, StopSignal};
pub use storage::{open_store, JsonFileStore, MemoryStore, StateStore, StorageError};
pub use telemetry::{generate_correlation_id, init_telemetry};
