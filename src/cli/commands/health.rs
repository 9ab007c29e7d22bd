use anyhow::{bail, Result};

use super::{Command, ControlContext};

pub struct HealthCommand<'a> {
    ctx: &'a ControlContext,
    threshold_seconds: u64,
}

impl<'a> HealthCommand<'a> {
    pub fn new(ctx: &'a ControlContext, threshold: Option<u64>) -> Self {
        Self {
            ctx,
            threshold_seconds: threshold.unwrap_or(ctx.config.agent.heartbeat_threshold_seconds),
        }
    }
}

impl Command for HealthCommand<'_> {
    async fn execute(&self) -> Result<()> {
        let report = self.ctx.manager.is_healthy(self.threshold_seconds).await?;
        if !report.healthy {
            bail!("Agent unhealthy: {}", report.reason);
        }
        println!("💚 {}", report.reason);
        Ok(())
    }
}
