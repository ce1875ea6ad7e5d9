use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

/// Uniform failure shape returned by every facade call, whichever backend
/// answered it.
#[derive(Debug, Error)]
pub enum SyncError {
    /// No backend responded (connection refused, timeout, bridge missing).
    #[error("backend unreachable: {0}")]
    Unreachable(String),
    /// The backend answered with an explicit error payload. The message is
    /// kept verbatim for display.
    #[error("{0}")]
    Rejected(String),
    /// The backend answered but the response could not be parsed.
    #[error("malformed response: {0}")]
    Malformed(String),
    /// The transfer is still in progress on the host; retry later.
    #[error("transfer busy, retry later")]
    Busy,
    /// The user stopped the operation locally.
    #[error("cancelled by user")]
    UserCancelled,
}

impl SyncError {
    pub fn rejected(message: impl Into<String>) -> Self {
        SyncError::Rejected(message.into())
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, SyncError::Busy)
    }

    /// `Busy` and `UserCancelled` are control signals, not failures.
    pub fn is_failure(&self) -> bool {
        !matches!(self, SyncError::Busy | SyncError::UserCancelled)
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SyncError::Malformed(err.to_string())
        } else {
            SyncError::Unreachable(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Malformed(err.to_string())
    }
}
