//! Error taxonomy for the sync engine.

use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

/// Failures the engine distinguishes between.
///
/// A pre-save veto is not an error; it is reported through
/// [`crate::syncer::UpsertOutcome::Cancelled`].
#[derive(Debug, Error)]
pub enum SyncError {
    /// Required configuration is missing or unusable.
    #[error("configuration error: {0}")]
    Config(String),

    /// The provider is unreachable or answered 429/5xx. Retried inside the
    /// client; surfacing here means the retry budget is exhausted.
    #[error("provider transport failure: {0}")]
    Transport(String),

    /// The provider rejected the request (4xx other than 404). Not retried.
    #[error("provider rejected request ({status}): {message}")]
    Provider { status: u16, message: String },

    /// The object no longer exists remotely.
    #[error("not found upstream: {0}")]
    NotFound(String),

    /// A body could not be parsed: malformed webhook payload, malformed
    /// signature header, or a remote object missing its id.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The webhook signature did not match or its timestamp is outside
    /// tolerance.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// Local persistence failure.
    #[error("storage failure: {0}")]
    Storage(#[from] sqlx::Error),
}

impl SyncError {
    /// Transport-class failures are the only ones worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transport(_))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Transport(err.to_string())
    }
}
