use thiserror::Error;

use campus_shared::{BackendError, ClientMessageId, ConversationId, CryptoError};

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Message body is empty")]
    EmptyMessage,

    #[error("Message {0} was not confirmed in time")]
    StateConflict(ClientMessageId),

    #[error("No conversation is open")]
    NoActiveConversation,

    #[error("Conversation {0} is no longer active")]
    StaleConversation(ConversationId),

    #[error("Unknown message {0}")]
    UnknownMessage(ClientMessageId),

    #[error("Cannot open a conversation with yourself")]
    SelfConversation,

    #[error("Encryption error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Session is signed out")]
    SignedOut,
}

impl MessagingError {
    /// Whether the caller may retry the same operation unchanged.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Backend(e) => e.is_retryable(),
            Self::StateConflict(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, MessagingError>;
