use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::collaborators::{Collaborators, RunSummary};
use super::signals::WorkerSignals;
use super::{fail_worker, finish_worker, SYSTEM_ACTOR};
use crate::agent_state::AgentStateManager;
use crate::leads::{LeadLifecycleState, LeadLifecycleStateMachine};
use crate::storage::StateStore;

pub(super) const STOPPED_BY_USER: &str = "Outreach stopped by user";
pub(super) const COMPLETED: &str = "Outreach completed";
pub(super) const RATE_LIMITED: &str = "Outreach stopped: daily rate limit reached";

/// Repeating send cycle over approved leads.
pub(super) struct OutreachWorker {
    pub manager: Arc<AgentStateManager>,
    pub store: Arc<dyn StateStore>,
    pub leads: Arc<LeadLifecycleStateMachine>,
    pub collaborators: Collaborators,
    pub signals: WorkerSignals,
    pub cycle_interval: Duration,
    pub followup_delay_days: u32,
}

impl OutreachWorker {
    pub async fn run(self) {
        match self.execute().await {
            Ok(reason) => finish_worker(&self.manager, reason).await,
            Err(e) => {
                let message = format!("Outreach crashed: {e}");
                error!(error = %e, "Outreach worker crashed");
                fail_worker(&self.manager, &message).await;
            }
        }
    }

    async fn execute(&self) -> anyhow::Result<&'static str> {
        let stop = &self.signals.stop;
        let mut cycle = 0u64;

        loop {
            cycle += 1;
            if self.signals.checkpoint().await {
                return Ok(STOPPED_BY_USER);
            }

            self.manager.update_heartbeat(Some("Checking for replies")).await?;
            guarded("reply detection", self.collaborators.replies.run_once(stop)).await;

            if self.signals.checkpoint().await {
                return Ok(STOPPED_BY_USER);
            }

            self.manager
                .update_heartbeat(Some("Queueing approved leads"))
                .await?;
            if let Err(e) = self.queue_approved_leads().await {
                error!(phase = "queue approved leads", error = %e, "Outreach phase failed");
            }

            if self.signals.checkpoint().await {
                return Ok(STOPPED_BY_USER);
            }

            self.manager
                .update_heartbeat(Some("Sending initial emails"))
                .await?;
            let sent = guarded("initial emails", self.collaborators.messenger.run_once(stop)).await;
            if sent.is_some_and(|s| s.rate_limited) {
                info!("Daily rate limit reached during initial emails");
                return Ok(RATE_LIMITED);
            }

            if self.signals.checkpoint().await {
                return Ok(STOPPED_BY_USER);
            }

            self.manager.update_heartbeat(Some("Sending follow-ups")).await?;
            let followed = guarded("follow-ups", self.collaborators.followup.run_once(stop)).await;
            if followed.is_some_and(|s| s.rate_limited) {
                info!("Daily rate limit reached during follow-ups");
                return Ok(RATE_LIMITED);
            }

            let approved_pending = self.store.approved_leads_for_outreach().await?;
            let followup_eligible = self
                .store
                .leads_for_followup(self.followup_delay_days, Utc::now())
                .await?;

            if approved_pending.is_empty() && followup_eligible.is_empty() {
                info!(cycle, "No more leads to process");
                return Ok(COMPLETED);
            }

            debug!(
                cycle,
                approved_pending = approved_pending.len(),
                followup_eligible = followup_eligible.len(),
                "Outreach cycle finished, waiting for next"
            );
            self.manager
                .update_heartbeat(Some("Waiting for next cycle"))
                .await?;
            if self.signals.sleep(self.cycle_interval).await {
                return Ok(STOPPED_BY_USER);
            }
        }
    }

    /// Move approved leads into `ready_for_outreach` so the messenger picks them up.
    async fn queue_approved_leads(&self) -> anyhow::Result<usize> {
        let mut queued = 0;
        for lead in self.store.approved_leads_for_outreach().await? {
            if lead.effective_lifecycle_state() == LeadLifecycleState::ReadyForOutreach {
                continue;
            }
            let result = self
                .leads
                .mark_ready_for_outreach(&lead.id, SYSTEM_ACTOR)
                .await;
            if result.success {
                queued += 1;
            } else {
                warn!(
                    lead_id = %lead.id,
                    error_code = ?result.error_code,
                    message = %result.message,
                    "Approved lead could not be queued"
                );
            }
        }
        if queued > 0 {
            info!(queued, "Queued approved leads for outreach");
        }
        Ok(queued)
    }
}

/// Run one phase; a failure is logged and does not abort the cycle.
async fn guarded(
    phase: &'static str,
    call: impl Future<Output = anyhow::Result<RunSummary>>,
) -> Option<RunSummary> {
    match call.await {
        Ok(summary) => {
            info!(phase, summary = %summary, "Outreach phase finished");
            Some(summary)
        }
        Err(e) => {
            error!(phase, error = %e, "Outreach phase failed");
            None
        }
    }
}
