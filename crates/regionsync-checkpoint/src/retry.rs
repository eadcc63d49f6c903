//! Bounded retry for checkpoint and metadata store operations.
//!
//! Transient failures back off exponentially with jitter. A not-found
//! error (a table that has not appeared yet, typically during a store
//! upgrade) waits a fixed interval instead. Both are bounded by the same
//! attempt budget; anything else fails on the spot.

use std::time::Duration;

use tracing::warn;

use regionsync_core::{AgentConfig, Backoff, ConfigError, Shutdown};
use regionsync_state::StateResult;

use crate::error::{CheckpointError, CheckpointResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub not_found_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            not_found_interval: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &AgentConfig) -> Result<Self, ConfigError> {
        let timing = config.timing()?;
        Ok(Self {
            max_attempts: config.checkpoint.max_attempts,
            backoff_initial: timing.backoff_initial,
            backoff_max: timing.backoff_max,
            not_found_interval: config.not_found_interval()?,
        })
    }
}

/// Run `f` until it succeeds, fails permanently, or the budget runs out.
pub async fn with_retry<T, F>(
    op: &str,
    policy: &RetryPolicy,
    shutdown: &Shutdown,
    mut f: F,
) -> CheckpointResult<T>
where
    F: FnMut() -> StateResult<T>,
{
    let mut shutdown = shutdown.clone();
    let mut backoff = Backoff::new(policy.backoff_initial, policy.backoff_max);
    let mut attempt = 0u32;

    loop {
        if shutdown.is_triggered() {
            return Err(CheckpointError::Cancelled { op: op.to_string() });
        }
        attempt += 1;

        let error = match f() {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        if !(error.is_transient() || error.is_not_found()) {
            return Err(CheckpointError::Store {
                op: op.to_string(),
                error,
            });
        }
        if attempt >= policy.max_attempts {
            return Err(CheckpointError::Exhausted {
                op: op.to_string(),
                attempts: attempt,
                last: error,
            });
        }

        let delay = if error.is_not_found() {
            policy.not_found_interval
        } else {
            backoff.next_delay()
        };
        warn!(op, attempt, ?delay, error = %error, "store operation failed, retrying");
        if !shutdown.sleep(delay).await {
            return Err(CheckpointError::Cancelled { op: op.to_string() });
        }
    }
}
