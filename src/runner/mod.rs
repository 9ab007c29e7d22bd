//! Agent runner: owns at most one background worker at a time.
//!
//! Control verbs check the current run state, ask the [`AgentStateManager`]
//! for the transition, and only then touch the worker (spawn it or signal
//! it). Workers perform their own terminal transition back to `idle` or
//! `error`; control verbs never jump straight to a terminal state.
//!
//! Every verb answers with a [`ControlOutcome`]. Storage failures are
//! reported as a rejected outcome rather than an error.

pub mod collaborators;
mod discovery;
mod outreach;
pub mod signals;

pub use collaborators::{
    Collaborators, Discovery, DiscoveryRequest, FollowUp, Messenger, ReplyDetector, RunSummary,
    WebsiteAnalyzer,
};
#[cfg(any(test, feature = "testing"))]
pub use collaborators::{
    MockDiscovery, MockFollowUp, MockMessenger, MockReplyDetector, MockWebsiteAnalyzer,
};
pub use signals::{PauseGate, StopSignal, WorkerSignals};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument};

use crate::agent_state::{AgentState, AgentStateManager, ControlOutcome, TransitionMetadata};
use crate::config::OutreachControlConfig;
use crate::leads::{LeadLifecycleStateMachine, TransitionPolicy};
use crate::storage::{StateStore, StorageError};
use crate::telemetry::{create_worker_span, generate_correlation_id};
use discovery::DiscoveryWorker;
use outreach::OutreachWorker;
use signals::{signal_pair, SignalControls};

/// Actor recorded for transitions the runner and its workers make on their own.
pub const SYSTEM_ACTOR: &str = "system";

const LOST_ON_RESTART: &str = "Worker lost on restart";
const NO_WORKER_ATTACHED: &str = "Stopped with no worker attached";

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub cycle_interval: Duration,
    pub followup_delay_days: u32,
    pub default_max_results: u32,
    pub lead_policy: TransitionPolicy,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            cycle_interval: Duration::from_secs(60),
            followup_delay_days: 3,
            default_max_results: 50,
            lead_policy: TransitionPolicy::Lenient,
        }
    }
}

impl RunnerSettings {
    pub fn from_config(config: &OutreachControlConfig) -> Self {
        Self {
            cycle_interval: Duration::from_secs(config.agent.outreach_cycle_interval_seconds),
            followup_delay_days: config.agent.followup_delay_days,
            default_max_results: config.agent.default_max_results,
            lead_policy: TransitionPolicy::from_strict_flag(config.lead_lifecycle.strict_transitions),
        }
    }
}

struct ActiveWorker {
    controls: SignalControls,
    handle: Option<JoinHandle<()>>,
}

impl ActiveWorker {
    fn is_live(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

pub struct AgentRunner {
    manager: Arc<AgentStateManager>,
    store: Arc<dyn StateStore>,
    leads: Arc<LeadLifecycleStateMachine>,
    collaborators: Collaborators,
    settings: RunnerSettings,
    worker: Mutex<Option<ActiveWorker>>,
}

impl AgentRunner {
    pub fn new(
        manager: Arc<AgentStateManager>,
        store: Arc<dyn StateStore>,
        collaborators: Collaborators,
        settings: RunnerSettings,
    ) -> Self {
        let leads = Arc::new(LeadLifecycleStateMachine::new(
            store.clone(),
            settings.lead_policy,
        ));
        Self {
            manager,
            store,
            leads,
            collaborators,
            settings,
            worker: Mutex::new(None),
        }
    }

    pub fn manager(&self) -> &Arc<AgentStateManager> {
        &self.manager
    }

    pub fn leads(&self) -> &Arc<LeadLifecycleStateMachine> {
        &self.leads
    }

    /// Whether a worker task is currently executing in this process.
    pub async fn has_live_worker(&self) -> bool {
        self.worker.lock().await.as_ref().is_some_and(ActiveWorker::is_live)
    }

    pub async fn start_discovery(
        &self,
        query: &str,
        location: &str,
        max_results: Option<u32>,
        controlled_by: &str,
    ) -> ControlOutcome {
        let mut slot = self.worker.lock().await;

        let state = match self.current_state().await {
            Ok(state) => state,
            Err(outcome) => return outcome,
        };
        if state != AgentState::Idle {
            return ControlOutcome::rejected(format!("Cannot start discovery: agent is {state}"));
        }
        reap(&mut slot).await;

        let reason = format!("Discovery started: {query} in {location}");
        let metadata = TransitionMetadata::default()
            .with_discovery(query, location)
            .with_task("Starting map discovery");
        match self
            .manager
            .transition(AgentState::Discovering, controlled_by, Some(&reason), metadata)
            .await
        {
            Ok(outcome) if outcome.accepted => {}
            Ok(outcome) => return outcome,
            Err(e) => return storage_failure(e),
        }

        let (controls, signals) = signal_pair();
        let worker = DiscoveryWorker {
            manager: self.manager.clone(),
            discovery: self.collaborators.discovery.clone(),
            analyzer: self.collaborators.analyzer.clone(),
            request: DiscoveryRequest {
                query: query.to_string(),
                location: location.to_string(),
                max_results: max_results.unwrap_or(self.settings.default_max_results),
            },
            signals,
        };
        let span = create_worker_span("discovery", &generate_correlation_id());
        let handle = tokio::spawn(worker.run().instrument(span));
        *slot = Some(ActiveWorker {
            controls,
            handle: Some(handle),
        });

        info!(controlled_by, query, location, "Discovery started");
        ControlOutcome::accepted("Discovery started")
    }

    pub async fn stop_discovery(&self, controlled_by: &str) -> ControlOutcome {
        self.request_stop(
            &[AgentState::Discovering],
            "Cannot stop discovery",
            "Discovery stop requested",
            controlled_by,
        )
        .await
    }

    /// Refused without touching the run state when nothing is approved and unsent.
    pub async fn start_outreach(&self, controlled_by: &str) -> ControlOutcome {
        let mut slot = self.worker.lock().await;

        let state = match self.current_state().await {
            Ok(state) => state,
            Err(outcome) => return outcome,
        };
        if state != AgentState::Idle {
            return ControlOutcome::rejected(format!("Cannot start outreach: agent is {state}"));
        }

        let approved = match self.store.approved_leads_for_outreach().await {
            Ok(leads) => leads,
            Err(e) => return storage_failure(e),
        };
        if approved.is_empty() {
            return ControlOutcome::rejected("No approved leads ready for outreach");
        }
        reap(&mut slot).await;

        // Lingering discovery parameters would make resume pick discovery.
        let metadata = TransitionMetadata::default()
            .with_task("Initializing outreach")
            .clear_discovery();
        match self
            .manager
            .transition(
                AgentState::OutreachRunning,
                controlled_by,
                Some("Outreach started"),
                metadata,
            )
            .await
        {
            Ok(outcome) if outcome.accepted => {}
            Ok(outcome) => return outcome,
            Err(e) => return storage_failure(e),
        }

        let (controls, signals) = signal_pair();
        let worker = OutreachWorker {
            manager: self.manager.clone(),
            store: self.store.clone(),
            leads: self.leads.clone(),
            collaborators: self.collaborators.clone(),
            signals,
            cycle_interval: self.settings.cycle_interval,
            followup_delay_days: self.settings.followup_delay_days,
        };
        let span = create_worker_span("outreach", &generate_correlation_id());
        let handle = tokio::spawn(worker.run().instrument(span));
        *slot = Some(ActiveWorker {
            controls,
            handle: Some(handle),
        });

        info!(controlled_by, approved = approved.len(), "Outreach started");
        ControlOutcome::accepted(format!(
            "Outreach started with {} approved leads",
            approved.len()
        ))
    }

    pub async fn stop_outreach(&self, controlled_by: &str) -> ControlOutcome {
        self.request_stop(
            &[AgentState::OutreachRunning],
            "Cannot stop outreach",
            "Outreach stop requested",
            controlled_by,
        )
        .await
    }

    pub async fn pause(&self, controlled_by: &str) -> ControlOutcome {
        let slot = self.worker.lock().await;

        let state = match self.current_state().await {
            Ok(state) => state,
            Err(outcome) => return outcome,
        };
        if !matches!(state, AgentState::Discovering | AgentState::OutreachRunning) {
            return ControlOutcome::rejected(format!("Cannot pause: agent is {state}"));
        }

        let outcome = match self
            .manager
            .transition(
                AgentState::Paused,
                controlled_by,
                Some("Agent paused"),
                TransitionMetadata::default(),
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => return storage_failure(e),
        };
        if outcome.accepted {
            if let Some(worker) = slot.as_ref() {
                worker.controls.pause();
            }
            info!(controlled_by, "Agent paused");
        }
        outcome
    }

    /// Resumes discovery when a discovery query is on record, outreach otherwise.
    pub async fn resume(&self, controlled_by: &str) -> ControlOutcome {
        let slot = self.worker.lock().await;

        let row = match self.manager.get_state().await {
            Ok(row) => row,
            Err(e) => return storage_failure(e),
        };
        if row.state != AgentState::Paused {
            return ControlOutcome::rejected(format!("Cannot resume: agent is {}", row.state));
        }

        let target = if row.discovery_query.as_deref().is_some_and(|q| !q.is_empty()) {
            AgentState::Discovering
        } else {
            AgentState::OutreachRunning
        };

        let outcome = match self
            .manager
            .transition(
                target,
                controlled_by,
                Some("Agent resumed"),
                TransitionMetadata::default(),
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => return storage_failure(e),
        };
        if outcome.accepted {
            if let Some(worker) = slot.as_ref() {
                worker.controls.resume();
            }
            info!(controlled_by, mode = %target, "Agent resumed");
        }
        outcome
    }

    pub async fn stop(&self, controlled_by: &str) -> ControlOutcome {
        self.request_stop(
            &[
                AgentState::Discovering,
                AgentState::OutreachRunning,
                AgentState::Paused,
            ],
            "Cannot stop",
            "Stop requested",
            controlled_by,
        )
        .await
    }

    /// Manual recovery. Clears the stored error message.
    pub async fn reset_from_error(&self, controlled_by: &str) -> ControlOutcome {
        let _slot = self.worker.lock().await;
        reset_run_state(&self.manager, controlled_by).await
    }

    /// Wait for the current worker, if any, to finish.
    pub async fn join(&self) {
        let handle = {
            let mut slot = self.worker.lock().await;
            slot.as_mut().and_then(|w| w.handle.take())
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task ended abnormally");
            }
        }
    }

    /// Stop whatever is running and wait for it. Used at process teardown.
    pub async fn shutdown(&self, controlled_by: &str) {
        let running = match self.current_state().await {
            Ok(state) => matches!(
                state,
                AgentState::Discovering | AgentState::OutreachRunning | AgentState::Paused
            ),
            Err(_) => false,
        };
        if running {
            let outcome = self.stop(controlled_by).await;
            info!(accepted = outcome.accepted, message = %outcome.message, "Shutdown stop request");
        }
        self.join().await;
    }

    /// Repair a run state left behind by a process that died mid-run.
    ///
    /// Running states become `error` so an operator notices; paused or
    /// stopping rows go back to `idle`. Call once before accepting control
    /// requests.
    pub async fn reconcile_on_startup(&self) -> Result<ControlOutcome, StorageError> {
        let slot = self.worker.lock().await;
        if slot.as_ref().is_some_and(ActiveWorker::is_live) {
            return Ok(ControlOutcome::rejected("A worker is running in this process"));
        }

        let state = self.manager.get_state().await?.state;
        let outcome = match state {
            AgentState::Discovering | AgentState::OutreachRunning => {
                warn!(state = %state, "Run state orphaned by a previous process");
                self.manager.set_error(LOST_ON_RESTART, SYSTEM_ACTOR).await?
            }
            AgentState::Paused | AgentState::Stopping => {
                warn!(state = %state, "Run state orphaned by a previous process");
                self.manager
                    .transition(
                        AgentState::Idle,
                        SYSTEM_ACTOR,
                        Some(LOST_ON_RESTART),
                        TransitionMetadata::default(),
                    )
                    .await?
            }
            AgentState::Idle | AgentState::Error => {
                ControlOutcome::accepted(format!("Nothing to reconcile: agent is {state}"))
            }
        };
        Ok(outcome)
    }

    async fn request_stop(
        &self,
        allowed: &[AgentState],
        refusal: &str,
        reason: &str,
        controlled_by: &str,
    ) -> ControlOutcome {
        let slot = self.worker.lock().await;

        let state = match self.current_state().await {
            Ok(state) => state,
            Err(outcome) => return outcome,
        };
        if !allowed.contains(&state) {
            return ControlOutcome::rejected(format!("{refusal}: agent is {state}"));
        }

        let outcome = match self
            .manager
            .transition(
                AgentState::Stopping,
                controlled_by,
                Some(reason),
                TransitionMetadata::default(),
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => return storage_failure(e),
        };
        if !outcome.accepted {
            return outcome;
        }
        info!(controlled_by, reason, "Agent stop requested");

        match slot.as_ref() {
            Some(worker) if worker.is_live() => {
                worker.controls.request_stop();
                outcome
            }
            // Nobody is left to make the terminal transition.
            _ => {
                warn!("Stop requested with no worker attached; returning to idle");
                match self
                    .manager
                    .transition(
                        AgentState::Idle,
                        SYSTEM_ACTOR,
                        Some(NO_WORKER_ATTACHED),
                        TransitionMetadata::default(),
                    )
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(e) => storage_failure(e),
                }
            }
        }
    }

    async fn current_state(&self) -> Result<AgentState, ControlOutcome> {
        self.manager
            .get_state()
            .await
            .map(|row| row.state)
            .map_err(storage_failure)
    }
}

/// `error -> idle` on operator request. Shared by the runner and the operator CLI,
/// which has no worker of its own.
pub async fn reset_run_state(manager: &AgentStateManager, controlled_by: &str) -> ControlOutcome {
    let state = match manager.get_state().await {
        Ok(row) => row.state,
        Err(e) => return storage_failure(e),
    };
    if state != AgentState::Error {
        return ControlOutcome::rejected(format!("Cannot reset: agent is {state}, not error"));
    }

    let outcome = match manager
        .transition(
            AgentState::Idle,
            controlled_by,
            Some("Manual recovery from error"),
            TransitionMetadata::default().clear_error(),
        )
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => return storage_failure(e),
    };
    if outcome.accepted {
        info!(controlled_by, "Agent reset from error");
    }
    outcome
}

/// Await a previous worker that is finishing its terminal transition.
async fn reap(slot: &mut Option<ActiveWorker>) {
    if let Some(handle) = slot.take().and_then(|w| w.handle) {
        if let Err(e) = handle.await {
            error!(error = %e, "Previous worker ended abnormally");
        }
    }
}

fn storage_failure(e: StorageError) -> ControlOutcome {
    error!(error = %e, "Control request failed on storage");
    match e {
        StorageError::Unavailable { .. } => ControlOutcome::rejected(e.to_string()),
        other => ControlOutcome::rejected(format!("Storage unavailable: {other}")),
    }
}

/// Terminal transition for a worker that ran to completion or observed stop.
pub(crate) async fn finish_worker(manager: &AgentStateManager, reason: &str) {
    match manager
        .transition(
            AgentState::Idle,
            SYSTEM_ACTOR,
            Some(reason),
            TransitionMetadata::default(),
        )
        .await
    {
        Ok(outcome) if outcome.accepted => info!(reason, "Worker finished"),
        Ok(outcome) => warn!(reason, message = %outcome.message, "Worker could not return to idle"),
        Err(e) => error!(reason, error = %e, "Worker could not record its exit"),
    }
}

/// Escalate a crashed worker to `error`.
pub(crate) async fn fail_worker(manager: &AgentStateManager, message: &str) {
    let outcome = match manager.set_error(message, SYSTEM_ACTOR).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(error = %e, "Could not record worker crash");
            return;
        }
    };
    if outcome.accepted {
        return;
    }

    // Paused cannot reach error directly; go through stopping.
    match escalate_via_stopping(manager, message).await {
        Ok(outcome) if outcome.accepted => {}
        Ok(outcome) => warn!(message = %outcome.message, "Worker crash left run state unchanged"),
        Err(e) => error!(error = %e, "Could not record worker crash"),
    }
}

async fn escalate_via_stopping(
    manager: &AgentStateManager,
    message: &str,
) -> Result<ControlOutcome, StorageError> {
    let stopping = manager
        .transition(
            AgentState::Stopping,
            SYSTEM_ACTOR,
            Some(message),
            TransitionMetadata::default(),
        )
        .await?;
    if !stopping.accepted {
        return Ok(stopping);
    }
    manager.set_error(message, SYSTEM_ACTOR).await
}
