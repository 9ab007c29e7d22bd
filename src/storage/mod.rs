//! Persistence contract for the control plane.
//!
//! Everything the state manager, runner and lead state machine need from
//! storage goes through [`StateStore`]: the singleton run-state row, the
//! append-only control log, the generic audit log, and lead rows. Backends
//! are interchangeable; the file backend is the default durable one and the
//! SQLite backend is available behind the `database` feature.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::agent_state::{AgentRunState, AgentState, ControlLogEntry};
use crate::config::{StorageBackend, StorageConfig};
use crate::leads::{Lead, LeadLifecycleState, LeadPatch};

#[cfg(test)]
pub(crate) mod faulty;
pub mod file;
pub mod memory;
pub mod retry;
#[cfg(feature = "database")]
pub mod sqlite;

pub use file::JsonFileStore;
pub use memory::MemoryStore;
pub use retry::{RetryConfig, StorageRetry};
#[cfg(feature = "database")]
pub use sqlite::SqliteStore;

/// Errors that can occur while talking to the backing store
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Storage unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Corrupt record: {reason}")]
    Corrupt { reason: String },
}

impl StorageError {
    /// Transient failures are worth another attempt; corruption is not.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Io(_) | StorageError::Unavailable { .. } => true,
            #[cfg(feature = "database")]
            StorageError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ) || e
                .as_database_error()
                .is_some_and(|db| db.message().contains("locked")),
            StorageError::Serialization(_) | StorageError::Corrupt { .. } => false,
        }
    }
}

/// Tri-state column update: leave it, overwrite it, or null it out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FieldUpdate<T> {
    #[default]
    Keep,
    Set(T),
    Clear,
}

impl<T> FieldUpdate<T> {
    pub fn apply(self, slot: &mut Option<T>) {
        match self {
            FieldUpdate::Keep => {}
            FieldUpdate::Set(value) => *slot = Some(value),
            FieldUpdate::Clear => *slot = None,
        }
    }

    pub fn is_keep(&self) -> bool {
        matches!(self, FieldUpdate::Keep)
    }
}

/// Partial, atomic update of the run-state row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunStatePatch {
    pub state: Option<AgentState>,
    pub last_transition_time: Option<DateTime<Utc>>,
    pub reason: FieldUpdate<String>,
    pub controlled_by: Option<String>,
    pub last_heartbeat: FieldUpdate<DateTime<Utc>>,
    pub error_message: FieldUpdate<String>,
    pub current_task: FieldUpdate<String>,
    pub discovery_query: FieldUpdate<String>,
    pub discovery_location: FieldUpdate<String>,
}

impl RunStatePatch {
    pub fn apply_to(self, row: &mut AgentRunState) {
        if let Some(state) = self.state {
            row.state = state;
        }
        if let Some(at) = self.last_transition_time {
            row.last_transition_time = at;
        }
        if let Some(actor) = self.controlled_by {
            row.controlled_by = actor;
        }
        self.reason.apply(&mut row.reason);
        self.last_heartbeat.apply(&mut row.last_heartbeat);
        self.error_message.apply(&mut row.error_message);
        self.current_task.apply(&mut row.current_task);
        self.discovery_query.apply(&mut row.discovery_query);
        self.discovery_location.apply(&mut row.discovery_location);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    Success,
    Warning,
    Rejected,
    Error,
}

impl AuditResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditResult::Success => "success",
            AuditResult::Warning => "warning",
            AuditResult::Rejected => "rejected",
            AuditResult::Error => "error",
        }
    }
}

impl std::str::FromStr for AuditResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(AuditResult::Success),
            "warning" => Ok(AuditResult::Warning),
            "rejected" => Ok(AuditResult::Rejected),
            "error" => Ok(AuditResult::Error),
            other => Err(format!("unknown audit result: {other}")),
        }
    }
}

/// Generic audit record, tagged by the module that wrote it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub timestamp: DateTime<Utc>,
    pub module: String,
    pub lead_id: Option<String>,
    pub action: String,
    pub result: AuditResult,
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditQuery {
    pub module: Option<String>,
    pub lead_id: Option<String>,
    pub limit: usize,
}

impl Default for AuditQuery {
    fn default() -> Self {
        Self {
            module: None,
            lead_id: None,
            limit: 100,
        }
    }
}

impl AuditQuery {
    pub fn matches(&self, entry: &AuditLogEntry) -> bool {
        self.module.as_deref().is_none_or(|m| entry.module == m)
            && self
                .lead_id
                .as_deref()
                .is_none_or(|id| entry.lead_id.as_deref() == Some(id))
    }
}

/// Read/write/query contract the control plane depends on.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Current run state; a default idle row when nothing was ever persisted.
    async fn get_run_state(&self) -> Result<AgentRunState, StorageError>;

    async fn update_run_state(&self, patch: RunStatePatch) -> Result<AgentRunState, StorageError>;

    /// Apply `patch` and append `entry` as one unit: both land or neither does.
    async fn commit_transition(
        &self,
        patch: RunStatePatch,
        entry: ControlLogEntry,
    ) -> Result<AgentRunState, StorageError>;

    async fn append_control_log(&self, entry: ControlLogEntry) -> Result<(), StorageError>;

    /// Newest first.
    async fn control_logs(&self, limit: usize) -> Result<Vec<ControlLogEntry>, StorageError>;

    async fn append_audit_log(&self, entry: AuditLogEntry) -> Result<(), StorageError>;

    /// Newest first.
    async fn audit_logs(&self, query: AuditQuery) -> Result<Vec<AuditLogEntry>, StorageError>;

    async fn insert_lead(&self, lead: Lead) -> Result<(), StorageError>;

    async fn get_lead(&self, id: &str) -> Result<Option<Lead>, StorageError>;

    /// Returns false when no lead with that id exists.
    async fn update_lead(&self, id: &str, patch: LeadPatch) -> Result<bool, StorageError>;

    async fn list_leads(&self) -> Result<Vec<Lead>, StorageError>;

    async fn leads_by_lifecycle_state(
        &self,
        state: LeadLifecycleState,
    ) -> Result<Vec<Lead>, StorageError>;

    /// Approved, emailable, never contacted; oldest discovery first.
    async fn approved_leads_for_outreach(&self) -> Result<Vec<Lead>, StorageError>;

    async fn leads_for_followup(
        &self,
        delay_days: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Lead>, StorageError>;
}

/// Open the configured backend. Called once at startup; failures are fatal.
pub async fn open_store(config: &StorageConfig) -> anyhow::Result<Arc<dyn StateStore>> {
    let store: Arc<dyn StateStore> = match config.backend {
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
        StorageBackend::File => Arc::new(JsonFileStore::open(&config.path).await?),
        #[cfg(feature = "database")]
        StorageBackend::Sqlite => {
            let url = format!("sqlite://{}", config.path.display());
            Arc::new(SqliteStore::open(&url, config.auto_migrate).await?)
        }
        #[cfg(not(feature = "database"))]
        StorageBackend::Sqlite => {
            anyhow::bail!("SQLite storage requires building with the `database` feature")
        }
    };
    info!(backend = ?config.backend, path = %config.path.display(), "Storage opened");
    Ok(store)
}

/// Run-state row and lead table, shared by the in-process backends.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateDocument {
    pub run_state: Option<AgentRunState>,
    #[serde(default)]
    pub leads: BTreeMap<String, Lead>,
}

impl StateDocument {
    pub fn run_state(&self) -> AgentRunState {
        self.run_state.clone().unwrap_or_default()
    }

    pub fn update_run_state(&mut self, patch: RunStatePatch) -> AgentRunState {
        let row = self.run_state.get_or_insert_with(AgentRunState::default);
        patch.apply_to(row);
        row.clone()
    }

    pub fn update_lead(&mut self, id: &str, patch: &LeadPatch, now: DateTime<Utc>) -> bool {
        match self.leads.get_mut(id) {
            Some(lead) => {
                patch.apply_to(lead, now);
                true
            }
            None => false,
        }
    }

    pub fn leads_where(&self, predicate: impl Fn(&Lead) -> bool) -> Vec<Lead> {
        let mut leads: Vec<Lead> = self.leads.values().filter(|l| predicate(l)).cloned().collect();
        leads.sort_by_key(|l| l.discovered_at);
        leads
    }
}

/// Whole-store contents of the memory backend.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub state: StateDocument,
    pub control_log: Vec<ControlLogEntry>,
    pub audit_log: Vec<AuditLogEntry>,
}

impl StoreSnapshot {
    pub fn commit_transition(&mut self, patch: RunStatePatch, entry: ControlLogEntry) -> AgentRunState {
        let row = self.state.update_run_state(patch);
        self.control_log.push(entry);
        row
    }

    pub fn control_logs(&self, limit: usize) -> Vec<ControlLogEntry> {
        self.control_log.iter().rev().take(limit).cloned().collect()
    }

    pub fn audit_logs(&self, query: &AuditQuery) -> Vec<AuditLogEntry> {
        self.audit_log
            .iter()
            .rev()
            .filter(|entry| query.matches(entry))
            .take(query.limit)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_update_tri_state() {
        let mut slot = Some("plumbers".to_string());
        FieldUpdate::Keep.apply(&mut slot);
        assert_eq!(slot.as_deref(), Some("plumbers"));

        FieldUpdate::Set("roofers".to_string()).apply(&mut slot);
        assert_eq!(slot.as_deref(), Some("roofers"));

        FieldUpdate::<String>::Clear.apply(&mut slot);
        assert!(slot.is_none());
    }

    #[test]
    fn test_run_state_patch_leaves_untouched_columns() {
        let mut row = AgentRunState {
            discovery_query: Some("plumbers".to_string()),
            ..AgentRunState::default()
        };

        RunStatePatch {
            state: Some(AgentState::Paused),
            ..RunStatePatch::default()
        }
        .apply_to(&mut row);

        assert_eq!(row.state, AgentState::Paused);
        assert_eq!(row.discovery_query.as_deref(), Some("plumbers"));
    }

    #[test]
    fn test_audit_query_filters() {
        let entry = AuditLogEntry {
            timestamp: Utc::now(),
            module: "state_machine".to_string(),
            lead_id: Some("lead-1".to_string()),
            action: "state_transition".to_string(),
            result: AuditResult::Success,
            details: serde_json::json!({}),
        };

        assert!(AuditQuery::default().matches(&entry));
        assert!(AuditQuery {
            lead_id: Some("lead-1".to_string()),
            ..AuditQuery::default()
        }
        .matches(&entry));
        assert!(!AuditQuery {
            module: Some("messenger".to_string()),
            ..AuditQuery::default()
        }
        .matches(&entry));
    }

    #[test]
    fn test_transient_classification() {
        let io = StorageError::Io(std::io::Error::other("disk busy"));
        assert!(io.is_transient());
        let corrupt = StorageError::Corrupt {
            reason: "bad state".to_string(),
        };
        assert!(!corrupt.is_transient());
    }
}
