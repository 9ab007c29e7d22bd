use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Mutex;

use super::{AuditLogEntry, AuditQuery, RunStatePatch, StateStore, StorageError, StoreSnapshot};
use crate::agent_state::{AgentRunState, ControlLogEntry};
use crate::leads::{Lead, LeadLifecycleState, LeadPatch};

/// Process-local store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<StoreSnapshot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut StoreSnapshot) -> R) -> Result<R, StorageError> {
        let mut guard = self.inner.lock().map_err(|_| StorageError::Unavailable {
            reason: "memory store lock poisoned".to_string(),
        })?;
        Ok(f(&mut guard))
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get_run_state(&self) -> Result<AgentRunState, StorageError> {
        self.with(|s| s.state.run_state())
    }

    async fn update_run_state(&self, patch: RunStatePatch) -> Result<AgentRunState, StorageError> {
        self.with(|s| s.state.update_run_state(patch))
    }

    async fn commit_transition(
        &self,
        patch: RunStatePatch,
        entry: ControlLogEntry,
    ) -> Result<AgentRunState, StorageError> {
        self.with(|s| s.commit_transition(patch, entry))
    }

    async fn append_control_log(&self, entry: ControlLogEntry) -> Result<(), StorageError> {
        self.with(|s| s.control_log.push(entry))
    }

    async fn control_logs(&self, limit: usize) -> Result<Vec<ControlLogEntry>, StorageError> {
        self.with(|s| s.control_logs(limit))
    }

    async fn append_audit_log(&self, entry: AuditLogEntry) -> Result<(), StorageError> {
        self.with(|s| s.audit_log.push(entry))
    }

    async fn audit_logs(&self, query: AuditQuery) -> Result<Vec<AuditLogEntry>, StorageError> {
        self.with(|s| s.audit_logs(&query))
    }

    async fn insert_lead(&self, lead: Lead) -> Result<(), StorageError> {
        self.with(|s| {
            s.state.leads.insert(lead.id.clone(), lead);
        })
    }

    async fn get_lead(&self, id: &str) -> Result<Option<Lead>, StorageError> {
        self.with(|s| s.state.leads.get(id).cloned())
    }

    async fn update_lead(&self, id: &str, patch: LeadPatch) -> Result<bool, StorageError> {
        self.with(|s| s.state.update_lead(id, &patch, Utc::now()))
    }

    async fn list_leads(&self) -> Result<Vec<Lead>, StorageError> {
        self.with(|s| s.state.leads_where(|_| true))
    }

    async fn leads_by_lifecycle_state(
        &self,
        state: LeadLifecycleState,
    ) -> Result<Vec<Lead>, StorageError> {
        self.with(|s| s.state.leads_where(|l| l.effective_lifecycle_state() == state))
    }

    async fn approved_leads_for_outreach(&self) -> Result<Vec<Lead>, StorageError> {
        self.with(|s| s.state.leads_where(Lead::is_outreach_eligible))
    }

    async fn leads_for_followup(
        &self,
        delay_days: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Lead>, StorageError> {
        self.with(|s| s.state.leads_where(|l| l.is_followup_due(delay_days, now)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_state::AgentState;
    use crate::leads::{OutreachStatus, ReviewStatus};

    #[tokio::test]
    async fn test_default_run_state_is_idle() {
        let store = MemoryStore::new();
        let row = store.get_run_state().await.unwrap();
        assert_eq!(row.state, AgentState::Idle);
        assert_eq!(row.controlled_by, "system");
    }

    #[tokio::test]
    async fn test_outreach_query_filters_unapproved_and_emailless() {
        let store = MemoryStore::new();
        store
            .insert_lead(
                Lead::discovered("Ready")
                    .with_id("ready")
                    .with_email("hi@ready.com")
                    .with_review_status(ReviewStatus::Approved),
            )
            .await
            .unwrap();
        store
            .insert_lead(
                Lead::discovered("No email")
                    .with_id("no-email")
                    .with_review_status(ReviewStatus::Approved),
            )
            .await
            .unwrap();
        store
            .insert_lead(Lead::discovered("Pending").with_id("pending").with_email("p@p.com"))
            .await
            .unwrap();

        let eligible = store.approved_leads_for_outreach().await.unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id, "ready");
    }

    #[tokio::test]
    async fn test_update_lead_stamps_updated_at() {
        let store = MemoryStore::new();
        store
            .insert_lead(Lead::discovered("Stamp").with_id("stamp"))
            .await
            .unwrap();

        let updated = store
            .update_lead(
                "stamp",
                LeadPatch {
                    outreach_status: Some(OutreachStatus::SentInitial),
                    ..LeadPatch::default()
                },
            )
            .await
            .unwrap();
        assert!(updated);

        let lead = store.get_lead("stamp").await.unwrap().unwrap();
        assert_eq!(lead.outreach_status, OutreachStatus::SentInitial);
        assert!(lead.updated_at.is_some());

        assert!(!store.update_lead("missing", LeadPatch::default()).await.unwrap());
    }
}
