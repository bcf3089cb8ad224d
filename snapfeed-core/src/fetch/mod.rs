//! Batch fetcher: the [`BatchSource`] seam, its error taxonomy, and the
//! fixed-delay retry loop wrapped around a single attempt.

pub mod http;
pub mod retry;

pub use http::{parse_records, HttpBatchSource};
pub use retry::{fetch_batch, RetryPolicy};

use thiserror::Error;

use crate::domain::{BatchId, Record};
use crate::shard::ShardError;

/// Errors from a single fetch attempt.
///
/// Everything except `OutOfRange` is transient and retried by [`fetch_batch`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("upstream returned HTTP {status}")]
    UpstreamStatus { status: u16 },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("batch {batch} is outside every configured shard range")]
    OutOfRange { batch: BatchId },

    #[error("fetch task could not be submitted: {0}")]
    Submission(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Transport(_)
                | FetchError::UpstreamStatus { .. }
                | FetchError::MalformedResponse(_)
        )
    }
}

impl From<ShardError> for FetchError {
    fn from(err: ShardError) -> Self {
        match err {
            ShardError::OutOfRange { batch } => FetchError::OutOfRange { batch },
            other => FetchError::Transport(other.to_string()),
        }
    }
}

/// Something that can fetch one batch of records in a single attempt.
///
/// Implementations do no retrying of their own; [`fetch_batch`] owns the
/// retry policy so the delay stays on the injected clock.
pub trait BatchSource: Send + Sync {
    /// Human-readable name for logs.
    fn name(&self) -> &str;

    /// One attempt at fetching `batch`.
    fn fetch_once(&self, batch: BatchId) -> Result<Vec<Record>, FetchError>;
}
