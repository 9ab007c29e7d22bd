//! Memory store whose log writes can be switched to fail, for exercising
//! storage failure paths.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};

use super::{AuditLogEntry, AuditQuery, MemoryStore, RunStatePatch, StateStore, StorageError};
use crate::agent_state::{AgentRunState, ControlLogEntry};
use crate::leads::{Lead, LeadLifecycleState, LeadPatch};

#[derive(Debug, Default)]
pub struct FaultyStore {
    inner: MemoryStore,
    fail_control_log: AtomicBool,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_control_log(&self, fail: bool) {
        self.fail_control_log.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.fail_control_log.load(Ordering::SeqCst) {
            return Err(StorageError::Corrupt {
                reason: "disk full".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for FaultyStore {
    async fn get_run_state(&self) -> Result<AgentRunState, StorageError> {
        self.inner.get_run_state().await
    }

    async fn update_run_state(&self, patch: RunStatePatch) -> Result<AgentRunState, StorageError> {
        self.inner.update_run_state(patch).await
    }

    async fn commit_transition(
        &self,
        patch: RunStatePatch,
        entry: ControlLogEntry,
    ) -> Result<AgentRunState, StorageError> {
        self.check()?;
        self.inner.commit_transition(patch, entry).await
    }

    async fn append_control_log(&self, entry: ControlLogEntry) -> Result<(), StorageError> {
        self.check()?;
        self.inner.append_control_log(entry).await
    }

    async fn control_logs(&self, limit: usize) -> Result<Vec<ControlLogEntry>, StorageError> {
        self.inner.control_logs(limit).await
    }

    async fn append_audit_log(&self, entry: AuditLogEntry) -> Result<(), StorageError> {
        self.inner.append_audit_log(entry).await
    }

    async fn audit_logs(&self, query: AuditQuery) -> Result<Vec<AuditLogEntry>, StorageError> {
        self.inner.audit_logs(query).await
    }

    async fn insert_lead(&self, lead: Lead) -> Result<(), StorageError> {
        self.inner.insert_lead(lead).await
    }

    async fn get_lead(&self, id: &str) -> Result<Option<Lead>, StorageError> {
        self.inner.get_lead(id).await
    }

    async fn update_lead(&self, id: &str, patch: LeadPatch) -> Result<bool, StorageError> {
        self.inner.update_lead(id, patch).await
    }

    async fn list_leads(&self) -> Result<Vec<Lead>, StorageError> {
        self.inner.list_leads().await
    }

    async fn leads_by_lifecycle_state(
        &self,
        state: LeadLifecycleState,
    ) -> Result<Vec<Lead>, StorageError> {
        self.inner.leads_by_lifecycle_state(state).await
    }

    async fn approved_leads_for_outreach(&self) -> Result<Vec<Lead>, StorageError> {
        self.inner.approved_leads_for_outreach().await
    }

    async fn leads_for_followup(
        &self,
        delay_days: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Lead>, StorageError> {
        self.inner.leads_for_followup(delay_days, now).await
    }
}
