use anyhow::Result;

use super::{Command, ControlContext};
use crate::agent_state::health_of;
use crate::leads::LeadCounts;

pub struct StatusCommand<'a> {
    ctx: &'a ControlContext,
}

impl<'a> StatusCommand<'a> {
    pub fn new(ctx: &'a ControlContext) -> Self {
        Self { ctx }
    }
}

impl Command for StatusCommand<'_> {
    async fn execute(&self) -> Result<()> {
        let row = self.ctx.manager.get_state().await?;
        let health = health_of(&row, self.ctx.config.agent.heartbeat_threshold_seconds);
        let leads = self.ctx.store.list_leads().await?;
        let counts = LeadCounts::tally(&leads);

        println!("🤖 OUTREACH AGENT STATUS");
        println!("========================");
        println!();
        println!("📍 State: {}", row.state);
        println!(
            "   Since: {} (by {})",
            row.last_transition_time.format("%Y-%m-%d %H:%M:%S UTC"),
            row.controlled_by
        );
        if let Some(reason) = &row.reason {
            println!("   Reason: {reason}");
        }
        if let Some(task) = &row.current_task {
            println!("   Task: {task}");
        }
        if let (Some(query), Some(location)) = (&row.discovery_query, &row.discovery_location) {
            println!("   Discovery: {query} in {location}");
        }
        if let Some(error) = &row.error_message {
            println!("   ❌ Error: {error}");
        }
        match row.last_heartbeat {
            Some(beat) => println!("   Heartbeat: {}", beat.format("%H:%M:%S UTC")),
            None => println!("   Heartbeat: never"),
        }
        println!();

        if health.healthy {
            println!("💚 Health: {}", health.reason);
        } else {
            println!("🔴 Health: {}", health.reason);
        }
        println!();

        println!("📋 LEADS:");
        println!("   Total: {}", counts.total);
        println!("   ⏳ Pending review: {}", counts.pending_review);
        println!("   ✅ Approved: {}", counts.approved);
        println!("   🚫 Rejected: {}", counts.rejected);
        println!("   📧 Sent (initial): {}", counts.sent_initial);
        println!("   🔁 Sent (follow-up): {}", counts.sent_followup);
        println!("   💬 Replied: {}", counts.replied);

        Ok(())
    }
}
