use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{BatchSource, FetchError};
use crate::clock::Clock;
use crate::domain::{BatchId, FetchOutcome};

/// Fixed-delay retry policy: `1 + max_retries` attempts, no backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(2, Duration::from_secs(5))
    }
}

/// Fetch one batch, retrying transient failures with a fixed delay.
///
/// Returns `Failure` carrying the last error once all attempts are spent, or
/// immediately for errors that retrying cannot fix.
pub fn fetch_batch(
    source: &dyn BatchSource,
    batch: BatchId,
    policy: &RetryPolicy,
    clock: &dyn Clock,
) -> FetchOutcome {
    let attempts = policy.attempts();
    let mut last_error = None;

    for attempt in 1..=attempts {
        match source.fetch_once(batch) {
            Ok(records) => {
                debug!(batch = %batch, attempt, records = records.len(), "batch fetched");
                return FetchOutcome::Success { batch, records };
            }
            Err(e) if !e.is_retryable() => {
                warn!(batch = %batch, error = %e, "batch fetch failed permanently");
                return FetchOutcome::Failure {
                    batch,
                    last_error: e,
                };
            }
            Err(e) => {
                warn!(batch = %batch, attempt, attempts, error = %e, "batch fetch attempt failed");
                last_error = Some(e);
                if attempt < attempts {
                    clock.sleep(policy.retry_delay);
                }
            }
        }
    }

    FetchOutcome::Failure {
        batch,
        last_error: last_error
            .unwrap_or_else(|| FetchError::Transport("no attempt was made".into())),
    }
}
