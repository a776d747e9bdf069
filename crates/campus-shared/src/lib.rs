//! Types, wire schema, message codec and backend contract shared by the
//! Campus direct-messaging crates.

pub mod backend;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod types;

pub use backend::Backend;
pub use error::{BackendError, CryptoError, ProtocolError};
pub use types::{ClientMessageId, ConversationId, FriendshipStatus, MessageId, UserId};
