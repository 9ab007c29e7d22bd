use anyhow::{bail, Result};

use super::{Command, ControlContext};
use crate::runner::reset_run_state;

pub struct ResetCommand<'a> {
    ctx: &'a ControlContext,
    actor: String,
}

impl<'a> ResetCommand<'a> {
    pub fn new(ctx: &'a ControlContext, actor: impl Into<String>) -> Self {
        Self {
            ctx,
            actor: actor.into(),
        }
    }
}

impl Command for ResetCommand<'_> {
    async fn execute(&self) -> Result<()> {
        println!("🔄 Resetting agent from error state");
        let outcome = reset_run_state(&self.ctx.manager, &self.actor).await;
        if !outcome.accepted {
            bail!("{}", outcome.message);
        }
        println!("✅ {}", outcome.message);
        Ok(())
    }
}
