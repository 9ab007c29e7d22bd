// External modules the workers drive. Their internals live outside this crate;
// each exposes one run-once entrypoint that honors the stop signal between items.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

use super::signals::StopSignal;

/// What a single collaborator pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub processed: usize,
    pub sent: usize,
    pub skipped: usize,
    pub errors: usize,
    /// The provider refused further sends for today.
    pub rate_limited: bool,
}

impl RunSummary {
    pub fn rate_limited() -> Self {
        Self {
            rate_limited: true,
            ..Self::default()
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "processed={} sent={} skipped={} errors={}",
            self.processed, self.sent, self.skipped, self.errors
        )?;
        if self.rate_limited {
            write!(f, " (rate limited)")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    pub query: String,
    pub location: String,
    pub max_results: u32,
}

/// Finds businesses on a map provider and stores them as new leads.
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn run_once(&self, request: &DiscoveryRequest, stop: &StopSignal) -> anyhow::Result<RunSummary>;
}

/// Scrapes websites of newly discovered leads for contact details.
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait WebsiteAnalyzer: Send + Sync {
    async fn run_once(&self, stop: &StopSignal) -> anyhow::Result<RunSummary>;
}

/// Sends the initial email to every lead that is ready for outreach.
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn run_once(&self, stop: &StopSignal) -> anyhow::Result<RunSummary>;
}

#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait FollowUp: Send + Sync {
    async fn run_once(&self, stop: &StopSignal) -> anyhow::Result<RunSummary>;
}

/// Polls the inbox and marks leads that replied.
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait ReplyDetector: Send + Sync {
    async fn run_once(&self, stop: &StopSignal) -> anyhow::Result<RunSummary>;
}

/// The full set of collaborators handed to the runner at construction.
#[derive(Clone)]
pub struct Collaborators {
    pub discovery: Arc<dyn Discovery>,
    pub analyzer: Arc<dyn WebsiteAnalyzer>,
    pub messenger: Arc<dyn Messenger>,
    pub followup: Arc<dyn FollowUp>,
    pub replies: Arc<dyn ReplyDetector>,
}
