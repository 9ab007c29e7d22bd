// Property-Based Testing for run-state transitions
// Every attempt, legal or not, lands exactly once in the control log and
// illegal attempts never touch the persisted row.

use outreach_control::agent_state::{
    is_legal, AgentState, AgentStateManager, ControlResult, TransitionMetadata,
};
use outreach_control::leads::{is_valid_transition, LeadLifecycleState};
use outreach_control::storage::{MemoryStore, StorageRetry};
use proptest::prelude::*;
use std::sync::Arc;

fn state_strategy() -> impl Strategy<Value = AgentState> {
    proptest::sample::select(AgentState::ALL.to_vec())
}

fn lead_state_strategy() -> impl Strategy<Value = LeadLifecycleState> {
    proptest::sample::select(LeadLifecycleState::ALL.to_vec())
}

/// Legal route from idle to `target`.
fn path_to(target: AgentState) -> Vec<AgentState> {
    use AgentState::*;
    match target {
        Idle => vec![],
        Discovering => vec![Discovering],
        OutreachRunning => vec![OutreachRunning],
        Paused => vec![Discovering, Paused],
        Stopping => vec![Discovering, Stopping],
        Error => vec![Discovering, Error],
    }
}

async fn manager_in(state: AgentState) -> AgentStateManager {
    let manager =
        AgentStateManager::with_retry(Arc::new(MemoryStore::new()), StorageRetry::disabled());
    for step in path_to(state) {
        let outcome = manager
            .transition(step, "setup", None, TransitionMetadata::default())
            .await
            .unwrap();
        assert!(outcome.accepted, "setup step {step} refused: {outcome}");
    }
    manager
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

proptest! {
    #[test]
    fn prop_illegal_transition_never_mutates(from in state_strategy(), to in state_strategy()) {
        prop_assume!(!is_legal(from, to));

        block_on(async {
            let manager = manager_in(from).await;
            let before = manager.get_state().await.unwrap();
            let logs_before = manager.get_control_logs(usize::MAX).await.unwrap().len();

            let outcome = manager
                .transition(to, "user", Some("property"), TransitionMetadata::default().with_error("x"))
                .await
                .unwrap();

            assert!(!outcome.accepted);
            assert_eq!(outcome.message, format!("Illegal transition: {from} -> {to}"));
            assert_eq!(manager.get_state().await.unwrap(), before);

            let logs = manager.get_control_logs(usize::MAX).await.unwrap();
            assert_eq!(logs.len(), logs_before + 1);
            assert_eq!(logs[0].result, ControlResult::Rejected);
            assert_eq!(logs[0].previous_state, from);
            assert_eq!(logs[0].new_state, to);
        });
    }

    #[test]
    fn prop_legal_transition_logs_exactly_one_success(from in state_strategy(), to in state_strategy()) {
        prop_assume!(is_legal(from, to));

        block_on(async {
            let manager = manager_in(from).await;
            let logs_before = manager.get_control_logs(usize::MAX).await.unwrap().len();

            let outcome = manager
                .transition(to, "user", None, TransitionMetadata::default())
                .await
                .unwrap();

            assert!(outcome.accepted);
            assert_eq!(manager.get_state().await.unwrap().state, to);

            let logs = manager.get_control_logs(usize::MAX).await.unwrap();
            assert_eq!(logs.len(), logs_before + 1);
            assert_eq!(logs[0].result, ControlResult::Success);
        });
    }

    #[test]
    fn prop_lead_table_has_no_self_loops(state in lead_state_strategy()) {
        prop_assert!(!is_valid_transition(state, state));
    }
}

#[test]
fn error_is_only_left_for_idle() {
    for to in AgentState::ALL {
        assert_eq!(is_legal(AgentState::Error, to), to == AgentState::Idle);
    }
}

#[test]
fn approval_gate_cannot_be_bypassed_through_the_table() {
    use LeadLifecycleState::*;
    for from in LeadLifecycleState::ALL {
        if is_valid_transition(from, ReadyForOutreach) {
            assert_eq!(from, Approved);
        }
        if is_valid_transition(from, Approved) {
            assert_eq!(from, PendingReview);
        }
    }
}
