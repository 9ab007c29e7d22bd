use anyhow::Result;

use super::{Command, ControlContext};
use crate::agent_state::ControlResult;

pub struct LogsCommand<'a> {
    ctx: &'a ControlContext,
    limit: usize,
}

impl<'a> LogsCommand<'a> {
    pub fn new(ctx: &'a ControlContext, limit: usize) -> Self {
        Self { ctx, limit }
    }
}

impl Command for LogsCommand<'_> {
    async fn execute(&self) -> Result<()> {
        let entries = self.ctx.manager.get_control_logs(self.limit).await?;
        if entries.is_empty() {
            println!("📭 Control log is empty");
            return Ok(());
        }

        println!("📜 CONTROL LOG (newest first)");
        println!("─────────────────────────────");
        for entry in entries {
            let marker = match entry.result {
                ControlResult::Success => "✅",
                ControlResult::Rejected => "🚫",
            };
            println!(
                "{marker} {} {} -> {} by {}{}",
                entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                entry.previous_state,
                entry.new_state,
                entry.controlled_by,
                entry
                    .reason
                    .as_deref()
                    .map(|r| format!(" ({r})"))
                    .unwrap_or_default()
            );
        }
        Ok(())
    }
}
