// Retry wrapper for runtime storage calls.
// Startup opens are never retried; a store that cannot be opened is fatal.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{debug, warn};

use super::StorageError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_attempts: u32,
    /// Delays double from twice this value: 2x, 4x, 8x, ...
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StorageRetry {
    config: RetryConfig,
}

impl StorageRetry {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// No retries at all; every error is returned immediately.
    pub fn disabled() -> Self {
        Self::new(RetryConfig {
            max_attempts: 0,
            ..RetryConfig::default()
        })
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::from_millis(2)
            .factor(self.config.base_delay_ms.max(1))
            .max_delay(Duration::from_millis(self.config.max_delay_ms))
    }

    /// Run `action`, retrying transient failures with jittered exponential backoff.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut action: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let strategy = self
            .backoff()
            .map(jitter)
            .take(self.config.max_attempts as usize);

        let mut attempt = 0u32;
        RetryIf::spawn(
            strategy,
            || {
                attempt += 1;
                debug!(operation, attempt, "Storage call");
                action()
            },
            |error: &StorageError| {
                let retry = error.is_transient();
                if retry {
                    warn!(operation, error = %error, "Transient storage failure, retrying");
                }
                retry
            },
        )
        .await
    }
}
