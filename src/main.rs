use anyhow::Result;
use clap::Parser;

use outreach_control::cli::commands::{
    health::HealthCommand, lead::LeadCommand, logs::LogsCommand, reset::ResetCommand,
    status::StatusCommand, Command, ControlContext,
};
use outreach_control::cli::{Cli, Commands};
use outreach_control::{init_telemetry, OutreachControlConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_file = OutreachControlConfig::load_env_file()?;
    let config = OutreachControlConfig::load(cli.config.as_deref())?;
    init_telemetry(&config.observability)?;
    if let Some(path) = env_file {
        tracing::info!(file = ?path, "Loaded environment variables from .env file");
    }

    let ctx = ControlContext::open(config).await?;

    match &cli.command {
        Commands::Status => StatusCommand::new(&ctx).execute().await,
        Commands::Logs { limit } => LogsCommand::new(&ctx, *limit).execute().await,
        Commands::Health { threshold } => HealthCommand::new(&ctx, *threshold).execute().await,
        Commands::Reset => ResetCommand::new(&ctx, &cli.actor).execute().await,
        Commands::Lead { action } => LeadCommand::new(&ctx, &cli.actor, action).execute().await,
    }
}
