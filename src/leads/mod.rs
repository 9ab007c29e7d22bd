// Leads - per-lead lifecycle and the human approval gate in front of outreach

pub mod state_machine;
pub mod types;

pub use state_machine::{
    is_valid_transition, valid_transitions, LeadErrorCode, LeadLifecycleStateMachine,
    LeadStateTransitionRecord, LeadTransitionResult, TransitionPolicy,
};
pub use types::{Lead, LeadCounts, LeadLifecycleState, LeadPatch, OutreachStatus, ReviewStatus};
