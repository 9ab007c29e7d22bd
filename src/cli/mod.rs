use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod commands;

#[derive(Parser)]
#[command(name = "outreach-control")]
#[command(about = "Operator console for approval-gated lead discovery and outreach")]
#[command(long_about = "Inspect the agent run state, read the control log, recover from errors, \
                       and move leads through human review. Starting discovery or outreach is \
                       done by the hosting service.")]
pub struct Cli {
    /// Configuration file (defaults to ./outreach-control.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Actor recorded in the control and audit logs
    #[arg(long, global = true, default_value = "operator")]
    pub actor: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show run state, health and lead counts
    Status,
    /// Show the most recent control log entries
    Logs {
        #[arg(long, default_value = "20", help = "Number of entries to show, newest first")]
        limit: usize,
    },
    /// Check heartbeat health; exits non-zero when unhealthy
    Health {
        #[arg(long, help = "Heartbeat staleness threshold in seconds (defaults to config)")]
        threshold: Option<u64>,
    },
    /// Recover the agent from the error state
    Reset,
    /// Review and lifecycle actions on a single lead
    Lead {
        #[command(subcommand)]
        action: LeadAction,
    },
}

#[derive(Subcommand)]
pub enum LeadAction {
    /// Approve a lead for outreach (requires an email address)
    Approve {
        id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Reject a lead
    Reject {
        id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Queue an approved lead for sending
    Ready { id: String },
    /// Send a lead back to human review
    Review {
        id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Mark a lead as failed
    Fail {
        id: String,
        #[arg(long, help = "What went wrong")]
        error: String,
    },
    /// Show the lifecycle history of a lead
    History { id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lead_approve() {
        let cli = Cli::try_parse_from([
            "outreach-control",
            "--actor",
            "dana",
            "lead",
            "approve",
            "lead-7",
            "--reason",
            "good fit",
        ])
        .unwrap();

        assert_eq!(cli.actor, "dana");
        match cli.command {
            Commands::Lead {
                action: LeadAction::Approve { id, reason },
            } => {
                assert_eq!(id, "lead-7");
                assert_eq!(reason.as_deref(), Some("good fit"));
            }
            _ => panic!("expected lead approve"),
        }
    }

    #[test]
    fn test_fail_requires_error() {
        assert!(Cli::try_parse_from(["outreach-control", "lead", "fail", "lead-7"]).is_err());
    }

    #[test]
    fn test_logs_default_limit() {
        let cli = Cli::try_parse_from(["outreach-control", "logs"]).unwrap();
        assert!(matches!(cli.command, Commands::Logs { limit: 20 }));
        assert!(cli.config.is_none());
    }
}
