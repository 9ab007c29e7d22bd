use std::sync::Arc;
use tracing::{error, info};

use super::collaborators::{Discovery, DiscoveryRequest, WebsiteAnalyzer};
use super::signals::WorkerSignals;
use super::{fail_worker, finish_worker};
use crate::agent_state::AgentStateManager;

pub(super) const STOPPED_BY_USER: &str = "Discovery stopped by user";
pub(super) const COMPLETED: &str = "Discovery completed successfully";

/// Single pass: map discovery, then website analysis.
pub(super) struct DiscoveryWorker {
    pub manager: Arc<AgentStateManager>,
    pub discovery: Arc<dyn Discovery>,
    pub analyzer: Arc<dyn WebsiteAnalyzer>,
    pub request: DiscoveryRequest,
    pub signals: WorkerSignals,
}

impl DiscoveryWorker {
    pub async fn run(self) {
        match self.execute().await {
            Ok(reason) => finish_worker(&self.manager, reason).await,
            Err(e) => {
                let message = format!("Discovery crashed: {e}");
                error!(error = %e, "Discovery worker crashed");
                fail_worker(&self.manager, &message).await;
            }
        }
    }

    async fn execute(&self) -> anyhow::Result<&'static str> {
        self.manager
            .update_heartbeat(Some("Starting map discovery"))
            .await?;
        let found = self
            .discovery
            .run_once(&self.request, &self.signals.stop)
            .await?;
        info!(
            query = %self.request.query,
            location = %self.request.location,
            summary = %found,
            "Map discovery finished"
        );

        if self.signals.checkpoint().await {
            return Ok(STOPPED_BY_USER);
        }

        self.manager.update_heartbeat(Some("Analyzing websites")).await?;
        let analyzed = self.analyzer.run_once(&self.signals.stop).await?;
        info!(summary = %analyzed, "Website analysis finished");

        if self.signals.stop.is_stopped() {
            return Ok(STOPPED_BY_USER);
        }
        Ok(COMPLETED)
    }
}
