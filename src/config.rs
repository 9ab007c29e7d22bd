use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::storage::RetryConfig;

/// Default configuration file, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "outreach-control.toml";

/// Main configuration structure for the outreach control plane
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OutreachControlConfig {
    /// Run-level agent settings
    pub agent: AgentConfig,
    /// Lead lifecycle validation
    pub lead_lifecycle: LeadLifecycleConfig,
    /// Where run state, logs and leads are kept
    pub storage: StorageConfig,
    /// Logging settings
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    /// Heartbeat age after which a running agent is reported unhealthy
    pub heartbeat_threshold_seconds: u64,
    /// Pause between outreach cycles
    pub outreach_cycle_interval_seconds: u64,
    /// Days after the initial email before a follow-up is due
    pub followup_delay_days: u32,
    /// Discovery result cap when the caller gives none
    pub default_max_results: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            heartbeat_threshold_seconds: 30,
            outreach_cycle_interval_seconds: 60,
            followup_delay_days: 3,
            default_max_results: 50,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LeadLifecycleConfig {
    /// Refuse lead moves outside the lifecycle table instead of applying them with a warning
    pub strict_transitions: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    #[default]
    File,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Document path for `file` (its log and lock files sit next to it), database file for `sqlite`
    pub path: PathBuf,
    /// Run embedded migrations when opening a SQLite database
    pub auto_migrate: bool,
    /// Backoff for runtime storage calls
    pub retry: RetryConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::File,
            path: PathBuf::from(".outreach-control/state.json"),
            auto_migrate: true,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Default filter when `RUST_LOG` is unset
    pub log_level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
        }
    }
}

impl OutreachControlConfig {
    /// Load configuration with precedence:
    /// 1. Default values
    /// 2. Configuration file (`outreach-control.toml`, or `explicit` when given)
    /// 3. Environment variables (`OUTREACH_CONTROL_AGENT__FOLLOWUP_DELAY_DAYS=5`)
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        match explicit {
            Some(path) => {
                builder = builder.add_source(File::from(path).required(true));
            }
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                builder = builder.add_source(File::with_name(DEFAULT_CONFIG_FILE));
            }
            None => {}
        }

        builder = builder.add_source(
            Environment::with_prefix("OUTREACH_CONTROL")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load `.env` from the working directory if it exists.
    ///
    /// Runs before telemetry is set up, so the loaded path is returned for the
    /// caller to log instead of being logged here.
    pub fn load_env_file() -> Result<Option<PathBuf>> {
        Self::load_env_file_in(Path::new("."))
    }

    pub fn load_env_file_in(dir: &Path) -> Result<Option<PathBuf>> {
        let path = dir.join(".env");
        if !path.exists() {
            return Ok(None);
        }
        dotenvy::from_path(&path)?;
        Ok(Some(path))
    }
}
