//! Direct-messaging core of the Campus client.
//!
//! Everything hangs off a [`Session`]: open a conversation, send into it,
//! mark it read, clear it. Realtime delivery, optimistic sends, and unread
//! badges are handled behind it; the view layer listens to
//! [`MessagingEvent`]s.

pub mod auth;
pub mod config;
pub mod conversation;
pub mod conversation_index;
pub mod coordination;
pub mod error;
pub mod events;
pub mod message_store;
pub mod realtime;
pub mod session;
pub mod state;
pub mod unread;

use tracing_subscriber::{fmt, EnvFilter};

pub use auth::AuthFollower;
pub use config::{ClearPolicy, HistoryWindow, MessagingConfig};
pub use conversation::{Delivery, LocalMessage};
pub use coordination::should_mark_unread;
pub use error::MessagingError;
pub use events::MessagingEvent;
pub use message_store::{ClearConfirmation, ConversationSnapshot};
pub use session::Session;
pub use unread::UnreadTracker;

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the
/// default filter. Safe to call more than once.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("campus_client=debug,campus_store=info,warn"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
