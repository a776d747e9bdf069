use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,
}

/// A change-feed payload that does not match the message row schema.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed change event: {0}")]
    Malformed(String),

    #[error("Unsupported change event type: {0}")]
    UnsupportedEvent(String),

    #[error("Change event for unexpected table: {0}")]
    UnexpectedTable(String),

    #[error("Missing record on {0} event")]
    MissingRecord(&'static str),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        Self::Malformed(e.to_string())
    }
}

/// Failures reported by the backend collaborator.
#[derive(Error, Debug, Clone)]
pub enum BackendError {
    #[error("Backend unreachable: {0}")]
    Transport(String),

    #[error("Backend call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Backend storage error: {0}")]
    Storage(String),

    #[error("Change subscription closed")]
    SubscriptionClosed,

    #[error("Backend rejected the request: {0}")]
    Rejected(String),
}

impl BackendError {
    /// Whether retrying the same call can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Timeout(_) | Self::Storage(_) | Self::SubscriptionClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(BackendError::Transport("reset".into()).is_retryable());
        assert!(BackendError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!BackendError::Rejected("row level security".into()).is_retryable());
    }
}
