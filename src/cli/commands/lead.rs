use anyhow::{bail, Result};

use super::{Command, ControlContext};
use crate::cli::LeadAction;
use crate::leads::{LeadStateTransitionRecord, LeadTransitionResult};
use crate::storage::AuditResult;

pub struct LeadCommand<'a> {
    ctx: &'a ControlContext,
    actor: String,
    action: &'a LeadAction,
}

impl<'a> LeadCommand<'a> {
    pub fn new(ctx: &'a ControlContext, actor: impl Into<String>, action: &'a LeadAction) -> Self {
        Self {
            ctx,
            actor: actor.into(),
            action,
        }
    }

    async fn history(&self, id: &str) -> Result<()> {
        let entries = self.ctx.lead_machine().lead_state_history(id).await?;
        if entries.is_empty() {
            println!("📭 No lifecycle history for lead {id}");
            return Ok(());
        }

        println!("📜 LIFECYCLE HISTORY for {id} (newest first)");
        for entry in entries {
            let marker = match entry.result {
                AuditResult::Success => "✅",
                AuditResult::Warning => "⚠️ ",
                AuditResult::Rejected => "🚫",
                AuditResult::Error => "❌",
            };
            match serde_json::from_value::<LeadStateTransitionRecord>(entry.details) {
                Ok(record) => println!(
                    "{marker} {} {} -> {} by {}: {}",
                    entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    record.from_lifecycle,
                    record.to_lifecycle,
                    record.actor,
                    record.reason
                ),
                Err(_) => println!(
                    "{marker} {} (unreadable transition record)",
                    entry.timestamp.format("%Y-%m-%d %H:%M:%S")
                ),
            }
        }
        Ok(())
    }
}

impl Command for LeadCommand<'_> {
    async fn execute(&self) -> Result<()> {
        let machine = self.ctx.lead_machine();
        let actor = self.actor.as_str();

        let result = match self.action {
            LeadAction::Approve { id, reason } => {
                machine.approve_lead(id, actor, reason.as_deref()).await
            }
            LeadAction::Reject { id, reason } => {
                machine.reject_lead(id, actor, reason.as_deref()).await
            }
            LeadAction::Ready { id } => machine.mark_ready_for_outreach(id, actor).await,
            LeadAction::Review { id, reason } => {
                machine
                    .transition_to_pending_review(id, actor, reason.as_deref())
                    .await
            }
            LeadAction::Fail { id, error } => machine.mark_failed(id, error, actor).await,
            LeadAction::History { id } => return self.history(id).await,
        };

        report(&result)
    }
}

fn report(result: &LeadTransitionResult) -> Result<()> {
    let from = result
        .from_state
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    if !result.success {
        let code = result
            .error_code
            .map(|c| c.to_string())
            .unwrap_or_default();
        bail!("{code}: {} (lead {})", result.message, result.lead_id);
    }
    println!(
        "✅ Lead {}: {} -> {} ({})",
        result.lead_id, from, result.to_state, result.message
    );
    Ok(())
}
