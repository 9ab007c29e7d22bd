use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::types::{Lead, LeadCounts, LeadLifecycleState, LeadPatch, ReviewStatus};
use crate::storage::{AuditLogEntry, AuditQuery, AuditResult, StateStore, StorageError};

/// Module tag for lead transitions in the audit log.
pub const AUDIT_MODULE: &str = "state_machine";
pub const AUDIT_ACTION: &str = "state_transition";

/// Targets reachable from `from` in the lead lifecycle table.
pub fn valid_transitions(from: LeadLifecycleState) -> &'static [LeadLifecycleState] {
    use LeadLifecycleState::*;
    match from {
        // analysis may be skipped when there is no website
        Discovered => &[Analyzing, Analyzed, PendingReview, Failed],
        Analyzing => &[Analyzed, Failed],
        Analyzed => &[PendingReview, Failed],
        PendingReview => &[Approved, Rejected, Expired],
        Approved => &[ReadyForOutreach, Rejected],
        Rejected => &[PendingReview],
        ReadyForOutreach => &[Rejected],
        Failed => &[Discovered, Analyzing, PendingReview],
        Expired => &[PendingReview],
    }
}

pub fn is_valid_transition(from: LeadLifecycleState, to: LeadLifecycleState) -> bool {
    valid_transitions(from).contains(&to)
}

/// What to do with a move that is not in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionPolicy {
    /// Apply it anyway and audit it as a warning (tolerates legacy rows).
    #[default]
    Lenient,
    /// Refuse it with `INVALID_TRANSITION`.
    Strict,
}

impl TransitionPolicy {
    pub fn from_strict_flag(strict: bool) -> Self {
        if strict {
            TransitionPolicy::Strict
        } else {
            TransitionPolicy::Lenient
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeadErrorCode {
    LeadNotFound,
    MissingEmail,
    NotApproved,
    InvalidTransition,
    DbUpdateFailed,
    TransitionError,
}

impl LeadErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadErrorCode::LeadNotFound => "LEAD_NOT_FOUND",
            LeadErrorCode::MissingEmail => "MISSING_EMAIL",
            LeadErrorCode::NotApproved => "NOT_APPROVED",
            LeadErrorCode::InvalidTransition => "INVALID_TRANSITION",
            LeadErrorCode::DbUpdateFailed => "DB_UPDATE_FAILED",
            LeadErrorCode::TransitionError => "TRANSITION_ERROR",
        }
    }
}

impl std::fmt::Display for LeadErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadTransitionResult {
    pub success: bool,
    pub lead_id: String,
    /// `None` when the lead could not be loaded.
    pub from_state: Option<LeadLifecycleState>,
    pub to_state: LeadLifecycleState,
    pub message: String,
    pub error_code: Option<LeadErrorCode>,
    pub metadata: Option<serde_json::Value>,
}

impl LeadTransitionResult {
    fn failure(
        lead_id: &str,
        from_state: Option<LeadLifecycleState>,
        to_state: LeadLifecycleState,
        message: impl Into<String>,
        code: LeadErrorCode,
    ) -> Self {
        Self {
            success: false,
            lead_id: lead_id.to_string(),
            from_state,
            to_state,
            message: message.into(),
            error_code: Some(code),
            metadata: None,
        }
    }
}

/// Audit detail written for every applied (or refused) lead transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadStateTransitionRecord {
    pub from_lifecycle: LeadLifecycleState,
    pub to_lifecycle: LeadLifecycleState,
    pub from_review: ReviewStatus,
    pub to_review: Option<ReviewStatus>,
    pub actor: String,
    pub reason: String,
    pub valid_transition: bool,
    pub metadata: Option<serde_json::Value>,
}

struct TransitionRequest<'a> {
    lead_id: &'a str,
    target: LeadLifecycleState,
    review: Option<ReviewStatus>,
    actor: &'a str,
    reason: String,
    metadata: Option<serde_json::Value>,
    /// Applied regardless of policy.
    forced: bool,
}

/// Per-lead state machine gating outreach behind human approval.
pub struct LeadLifecycleStateMachine {
    store: Arc<dyn StateStore>,
    policy: TransitionPolicy,
}

impl LeadLifecycleStateMachine {
    pub fn new(store: Arc<dyn StateStore>, policy: TransitionPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> TransitionPolicy {
        self.policy
    }

    pub async fn mark_analyzing(&self, lead_id: &str, actor: &str) -> LeadTransitionResult {
        self.transition(TransitionRequest {
            lead_id,
            target: LeadLifecycleState::Analyzing,
            review: None,
            actor,
            reason: "Website analysis started".to_string(),
            metadata: None,
            forced: false,
        })
        .await
    }

    /// Record finished website analysis; `analysis_results` lands in the audit record.
    pub async fn mark_analysis_complete(
        &self,
        lead_id: &str,
        analysis_results: Value,
        actor: &str,
    ) -> LeadTransitionResult {
        self.transition(TransitionRequest {
            lead_id,
            target: LeadLifecycleState::Analyzed,
            review: None,
            actor,
            reason: "Website analysis completed".to_string(),
            metadata: Some(json!({ "analysis_results": analysis_results })),
            forced: false,
        })
        .await
    }

    pub async fn transition_to_pending_review(
        &self,
        lead_id: &str,
        actor: &str,
        reason: Option<&str>,
    ) -> LeadTransitionResult {
        self.transition(TransitionRequest {
            lead_id,
            target: LeadLifecycleState::PendingReview,
            review: Some(ReviewStatus::Pending),
            actor,
            reason: reason.unwrap_or("Lead ready for human review").to_string(),
            metadata: None,
            forced: false,
        })
        .await
    }

    /// Approve for outreach. A lead without an email is refused and left as is.
    pub async fn approve_lead(
        &self,
        lead_id: &str,
        actor: &str,
        reason: Option<&str>,
    ) -> LeadTransitionResult {
        let target = LeadLifecycleState::Approved;
        let lead = match self.load(lead_id, target).await {
            Ok(lead) => lead,
            Err(result) => return result,
        };

        if !lead.has_email() {
            return LeadTransitionResult::failure(
                lead_id,
                Some(lead.effective_lifecycle_state()),
                target,
                "Cannot approve lead without email address",
                LeadErrorCode::MissingEmail,
            );
        }

        self.transition(TransitionRequest {
            lead_id,
            target,
            review: Some(ReviewStatus::Approved),
            actor,
            reason: reason.unwrap_or("Lead approved for outreach").to_string(),
            metadata: None,
            forced: false,
        })
        .await
    }

    pub async fn reject_lead(
        &self,
        lead_id: &str,
        actor: &str,
        reason: Option<&str>,
    ) -> LeadTransitionResult {
        self.transition(TransitionRequest {
            lead_id,
            target: LeadLifecycleState::Rejected,
            review: Some(ReviewStatus::Rejected),
            actor,
            reason: reason.unwrap_or("Lead rejected").to_string(),
            metadata: None,
            forced: false,
        })
        .await
    }

    pub async fn expire_lead(&self, lead_id: &str, actor: &str) -> LeadTransitionResult {
        self.transition(TransitionRequest {
            lead_id,
            target: LeadLifecycleState::Expired,
            review: Some(ReviewStatus::Expired),
            actor,
            reason: "Review window expired".to_string(),
            metadata: None,
            forced: false,
        })
        .await
    }

    /// Queue an approved lead for sending. Never grants approval by itself.
    pub async fn mark_ready_for_outreach(&self, lead_id: &str, actor: &str) -> LeadTransitionResult {
        let target = LeadLifecycleState::ReadyForOutreach;
        let lead = match self.load(lead_id, target).await {
            Ok(lead) => lead,
            Err(result) => return result,
        };
        let from = Some(lead.effective_lifecycle_state());

        if lead.review_status != ReviewStatus::Approved {
            return LeadTransitionResult::failure(
                lead_id,
                from,
                target,
                "Cannot queue a lead for outreach without approval",
                LeadErrorCode::NotApproved,
            );
        }
        if !lead.has_email() {
            return LeadTransitionResult::failure(
                lead_id,
                from,
                target,
                "Cannot queue a lead for outreach without email address",
                LeadErrorCode::MissingEmail,
            );
        }

        self.transition(TransitionRequest {
            lead_id,
            target,
            review: None,
            actor,
            reason: "Lead queued for outreach".to_string(),
            metadata: None,
            forced: false,
        })
        .await
    }

    /// Force a lead into `failed` from any state, keeping its review status.
    pub async fn mark_failed(
        &self,
        lead_id: &str,
        error_reason: &str,
        actor: &str,
    ) -> LeadTransitionResult {
        self.transition(TransitionRequest {
            lead_id,
            target: LeadLifecycleState::Failed,
            review: None,
            actor,
            reason: format!("Lead processing failed: {error_reason}"),
            metadata: Some(json!({ "error": error_reason })),
            forced: true,
        })
        .await
    }

    pub async fn bulk_approve(&self, lead_ids: &[String], actor: &str) -> Vec<LeadTransitionResult> {
        let mut results = Vec::with_capacity(lead_ids.len());
        for id in lead_ids {
            results.push(self.approve_lead(id, actor, None).await);
        }
        results
    }

    pub async fn bulk_reject(&self, lead_ids: &[String], actor: &str) -> Vec<LeadTransitionResult> {
        let mut results = Vec::with_capacity(lead_ids.len());
        for id in lead_ids {
            results.push(self.reject_lead(id, actor, None).await);
        }
        results
    }

    /// Audit trail of lifecycle moves for one lead, newest first.
    pub async fn lead_state_history(&self, lead_id: &str) -> Result<Vec<AuditLogEntry>, StorageError> {
        let entries = self
            .store
            .audit_logs(AuditQuery {
                module: Some(AUDIT_MODULE.to_string()),
                lead_id: Some(lead_id.to_string()),
                limit: 100,
            })
            .await?;
        Ok(entries
            .into_iter()
            .filter(|e| e.action == AUDIT_ACTION)
            .collect())
    }

    pub async fn lead_counts(&self) -> Result<LeadCounts, StorageError> {
        let leads = self.store.list_leads().await?;
        Ok(LeadCounts::tally(&leads))
    }

    async fn load(
        &self,
        lead_id: &str,
        target: LeadLifecycleState,
    ) -> Result<Lead, LeadTransitionResult> {
        match self.store.get_lead(lead_id).await {
            Ok(Some(lead)) => Ok(lead),
            Ok(None) => Err(LeadTransitionResult::failure(
                lead_id,
                None,
                target,
                "Lead not found",
                LeadErrorCode::LeadNotFound,
            )),
            Err(e) => Err(LeadTransitionResult::failure(
                lead_id,
                None,
                target,
                format!("Transition failed: {e}"),
                LeadErrorCode::TransitionError,
            )),
        }
    }

    async fn transition(&self, request: TransitionRequest<'_>) -> LeadTransitionResult {
        let TransitionRequest {
            lead_id,
            target,
            review,
            actor,
            reason,
            metadata,
            forced,
        } = request;

        let lead = match self.load(lead_id, target).await {
            Ok(lead) => lead,
            Err(result) => return result,
        };

        let current = lead.effective_lifecycle_state();
        let is_valid = is_valid_transition(current, target);

        let record = LeadStateTransitionRecord {
            from_lifecycle: current,
            to_lifecycle: target,
            from_review: lead.review_status,
            to_review: review,
            actor: actor.to_string(),
            reason: reason.clone(),
            valid_transition: is_valid,
            metadata: metadata.clone(),
        };

        if !is_valid && !forced && self.policy == TransitionPolicy::Strict {
            warn!(lead_id, from = %current, to = %target, actor, "Refused invalid lead transition");
            self.audit(lead_id, AuditResult::Rejected, &record).await;
            return LeadTransitionResult::failure(
                lead_id,
                Some(current),
                target,
                format!("Invalid transition: {current} -> {target}"),
                LeadErrorCode::InvalidTransition,
            );
        }

        let patch = LeadPatch {
            lifecycle_state: Some(target),
            review_status: review,
            ..LeadPatch::default()
        };

        match self.store.update_lead(lead_id, patch).await {
            Ok(true) => {}
            Ok(false) => {
                return LeadTransitionResult::failure(
                    lead_id,
                    Some(current),
                    target,
                    "Database update failed",
                    LeadErrorCode::DbUpdateFailed,
                )
            }
            Err(e) => {
                return LeadTransitionResult::failure(
                    lead_id,
                    Some(current),
                    target,
                    format!("Transition failed: {e}"),
                    LeadErrorCode::TransitionError,
                )
            }
        }

        let result = if is_valid {
            info!(lead_id, from = %current, to = %target, actor, "Lead state transition");
            AuditResult::Success
        } else {
            warn!(
                lead_id,
                from = %current,
                to = %target,
                actor,
                "Applied lead transition outside the lifecycle table"
            );
            AuditResult::Warning
        };
        self.audit(lead_id, result, &record).await;

        LeadTransitionResult {
            success: true,
            lead_id: lead_id.to_string(),
            from_state: Some(current),
            to_state: target,
            message: reason,
            error_code: None,
            metadata,
        }
    }

    async fn audit(&self, lead_id: &str, result: AuditResult, record: &LeadStateTransitionRecord) {
        let details = match serde_json::to_value(record) {
            Ok(details) => details,
            Err(e) => {
                error!(lead_id, error = %e, "Could not encode lead transition record");
                return;
            }
        };
        let entry = AuditLogEntry {
            timestamp: Utc::now(),
            module: AUDIT_MODULE.to_string(),
            lead_id: Some(lead_id.to_string()),
            action: AUDIT_ACTION.to_string(),
            result,
            details,
        };
        // The row is already updated; a lost audit line is reported, not rolled back.
        if let Err(e) = self.store.append_audit_log(entry).await {
            error!(lead_id, error = %e, "Failed to write lead transition to audit log");
        }
    }
}
