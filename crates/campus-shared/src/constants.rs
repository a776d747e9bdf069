/// Application name
pub const APP_NAME: &str = "Campus";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Poly1305 authentication tag size in bytes
pub const TAG_SIZE: usize = 16;

/// Prefix marking a message body sealed by the v1 codec
pub const SEALED_BODY_PREFIX: &str = "v1:";

/// Key derivation context for conversation keys (BLAKE3)
pub const KDF_CONTEXT_CONVERSATION_KEY: &str = "campus-dm-conversation-key-v1";

/// Table carrying direct messages on the backend
pub const MESSAGES_TABLE: &str = "messages";

/// Default number of messages loaded when a conversation opens
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Length of the rolling history window when that policy is enabled
pub const DEFAULT_HISTORY_WINDOW_HOURS: i64 = 24;
