use anyhow::Result;
use std::sync::Arc;

use crate::agent_state::AgentStateManager;
use crate::config::OutreachControlConfig;
use crate::leads::{LeadLifecycleStateMachine, TransitionPolicy};
use crate::storage::{open_store, StateStore, StorageRetry};

pub mod health;
pub mod lead;
pub mod logs;
pub mod reset;
pub mod status;

#[allow(async_fn_in_trait)]
pub trait Command {
    async fn execute(&self) -> Result<()>;
}

/// Store and managers opened once per CLI invocation.
pub struct ControlContext {
    pub config: OutreachControlConfig,
    pub store: Arc<dyn StateStore>,
    pub manager: AgentStateManager,
}

impl ControlContext {
    pub async fn open(config: OutreachControlConfig) -> Result<Self> {
        let store = open_store(&config.storage).await?;
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: OutreachControlConfig, store: Arc<dyn StateStore>) -> Self {
        let manager = AgentStateManager::with_retry(
            store.clone(),
            StorageRetry::new(config.storage.retry.clone()),
        );
        Self {
            config,
            store,
            manager,
        }
    }

    pub fn lead_machine(&self) -> LeadLifecycleStateMachine {
        LeadLifecycleStateMachine::new(
            self.store.clone(),
            TransitionPolicy::from_strict_flag(self.config.lead_lifecycle.strict_transitions),
        )
    }
}
