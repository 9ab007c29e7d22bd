use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::types::{
    is_legal, AgentRunState, AgentState, ControlLogEntry, ControlOutcome, ControlResult,
    HealthReport, TransitionMetadata,
};
use crate::storage::{FieldUpdate, RunStatePatch, StateStore, StorageError, StorageRetry};

/// Owns the run-state row: every read-modify-write of it goes through here.
///
/// Transitions are serialized by one async mutex, so concurrent control calls
/// land in the control log in a total order even though the row itself only
/// keeps the latest value.
pub struct AgentStateManager {
    store: Arc<dyn StateStore>,
    retry: StorageRetry,
    transition_lock: Mutex<()>,
}

impl AgentStateManager {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self::with_retry(store, StorageRetry::default())
    }

    pub fn with_retry(store: Arc<dyn StateStore>, retry: StorageRetry) -> Self {
        Self {
            store,
            retry,
            transition_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub async fn get_state(&self) -> Result<AgentRunState, StorageError> {
        self.retry
            .run("get_run_state", || self.store.get_run_state())
            .await
    }

    /// Attempt `current -> new_state`. Illegal moves are logged as rejected and
    /// leave the row untouched.
    pub async fn transition(
        &self,
        new_state: AgentState,
        controlled_by: &str,
        reason: Option<&str>,
        metadata: TransitionMetadata,
    ) -> Result<ControlOutcome, StorageError> {
        let _guard = self.transition_lock.lock().await;

        let current = self.get_state().await?.state;

        if !is_legal(current, new_state) {
            let message = format!("Illegal transition: {current} -> {new_state}");
            self.log_transition(current, new_state, controlled_by, reason, ControlResult::Rejected)
                .await?;
            warn!(
                from = %current,
                to = %new_state,
                controlled_by,
                "Rejected agent state transition"
            );
            return Ok(ControlOutcome::rejected(message));
        }

        let patch = RunStatePatch {
            state: Some(new_state),
            last_transition_time: Some(Utc::now()),
            reason: reason.map_or(FieldUpdate::Clear, |r| FieldUpdate::Set(r.to_string())),
            controlled_by: Some(controlled_by.to_string()),
            last_heartbeat: FieldUpdate::Keep,
            error_message: metadata.error_message,
            current_task: metadata.current_task,
            discovery_query: metadata.discovery_query,
            discovery_location: metadata.discovery_location,
        };
        let entry = control_entry(current, new_state, controlled_by, reason, ControlResult::Success);
        self.retry
            .run("commit_transition", || {
                self.store.commit_transition(patch.clone(), entry.clone())
            })
            .await?;

        info!(
            from = %current,
            to = %new_state,
            controlled_by,
            reason = reason.unwrap_or_default(),
            "Agent state transition"
        );
        Ok(ControlOutcome::accepted(format!("Transitioned to {new_state}")))
    }

    async fn log_transition(
        &self,
        previous_state: AgentState,
        new_state: AgentState,
        controlled_by: &str,
        reason: Option<&str>,
        result: ControlResult,
    ) -> Result<(), StorageError> {
        let entry = control_entry(previous_state, new_state, controlled_by, reason, result);
        self.retry
            .run("append_control_log", || {
                self.store.append_control_log(entry.clone())
            })
            .await
    }

    /// Liveness timestamp from the running worker. Does not look at the state.
    pub async fn update_heartbeat(&self, current_task: Option<&str>) -> Result<(), StorageError> {
        let patch = RunStatePatch {
            last_heartbeat: FieldUpdate::Set(Utc::now()),
            current_task: current_task.map_or(FieldUpdate::Keep, |t| FieldUpdate::Set(t.to_string())),
            ..RunStatePatch::default()
        };
        self.retry
            .run("update_heartbeat", || self.store.update_run_state(patch.clone()))
            .await?;
        Ok(())
    }

    pub async fn set_error(
        &self,
        error_message: &str,
        controlled_by: &str,
    ) -> Result<ControlOutcome, StorageError> {
        self.transition(
            AgentState::Error,
            controlled_by,
            Some("Agent error"),
            TransitionMetadata::default().with_error(error_message),
        )
        .await
    }

    pub async fn is_healthy(&self, threshold_seconds: u64) -> Result<HealthReport, StorageError> {
        let row = self.get_state().await?;
        Ok(health_of(&row, threshold_seconds))
    }

    /// Newest first.
    pub async fn get_control_logs(&self, limit: usize) -> Result<Vec<ControlLogEntry>, StorageError> {
        self.retry
            .run("control_logs", || self.store.control_logs(limit))
            .await
    }

    pub async fn is_idle(&self) -> Result<bool, StorageError> {
        Ok(self.get_state().await?.state == AgentState::Idle)
    }

    pub async fn is_discovering(&self) -> Result<bool, StorageError> {
        Ok(self.get_state().await?.state == AgentState::Discovering)
    }

    pub async fn is_outreach_running(&self) -> Result<bool, StorageError> {
        Ok(self.get_state().await?.state == AgentState::OutreachRunning)
    }
}

fn control_entry(
    previous_state: AgentState,
    new_state: AgentState,
    controlled_by: &str,
    reason: Option<&str>,
    result: ControlResult,
) -> ControlLogEntry {
    ControlLogEntry {
        timestamp: Utc::now(),
        previous_state,
        new_state,
        controlled_by: controlled_by.to_string(),
        reason: reason.map(str::to_string),
        result,
    }
}

/// Health of a run-state snapshot against a heartbeat staleness threshold.
pub fn health_of(row: &AgentRunState, threshold_seconds: u64) -> HealthReport {
    if row.state == AgentState::Error {
        let message = row.error_message.as_deref().unwrap_or("Unknown");
        return HealthReport::unhealthy(format!("Agent in error state: {message}"));
    }

    if row.state.is_active_run() {
        let Some(last_beat) = row.last_heartbeat else {
            return HealthReport::unhealthy("No heartbeat recorded");
        };
        let seconds_since = (Utc::now() - last_beat).num_seconds();
        if seconds_since > threshold_seconds as i64 {
            return HealthReport::unhealthy(format!("Heartbeat stale ({seconds_since}s ago)"));
        }
    }

    HealthReport::ok()
}
