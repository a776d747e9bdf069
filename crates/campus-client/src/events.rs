use serde::Serialize;
use tokio::sync::broadcast;

use campus_shared::{ClientMessageId, ConversationId, MessageId, UserId};

use crate::config::ClearPolicy;
use crate::conversation::LocalMessage;

pub const EVENT_CONVERSATION_LOADED: &str = "conversation-loaded";
pub const EVENT_MESSAGE_APPENDED: &str = "message-appended";
pub const EVENT_MESSAGE_CONFIRMED: &str = "message-confirmed";
pub const EVENT_MESSAGE_FAILED: &str = "message-failed";
pub const EVENT_MESSAGE_UPDATED: &str = "message-updated";
pub const EVENT_MESSAGE_REMOVED: &str = "message-removed";
pub const EVENT_CONVERSATION_CLEARED: &str = "conversation-cleared";
pub const EVENT_UNREAD_CHANGED: &str = "unread-changed";
pub const EVENT_SIGNED_OUT: &str = "signed-out";

/// State changes the view layer re-renders from.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum MessagingEvent {
    #[serde(rename_all = "camelCase")]
    ConversationLoaded {
        conversation: ConversationId,
        count: usize,
        first_unread: Option<MessageId>,
    },
    /// `scroll` is set when the view should jump to the new message.
    MessageAppended {
        conversation: ConversationId,
        message: LocalMessage,
        scroll: bool,
    },
    #[serde(rename_all = "camelCase")]
    MessageConfirmed {
        conversation: ConversationId,
        client_id: ClientMessageId,
        message: LocalMessage,
    },
    #[serde(rename_all = "camelCase")]
    MessageFailed {
        conversation: ConversationId,
        client_id: ClientMessageId,
        reason: String,
    },
    MessageUpdated {
        conversation: ConversationId,
        message: LocalMessage,
    },
    /// `client_id` is set when the removed entry was still a pending send.
    #[serde(rename_all = "camelCase")]
    MessageRemoved {
        conversation: ConversationId,
        id: MessageId,
        client_id: Option<ClientMessageId>,
    },
    ConversationCleared {
        conversation: ConversationId,
        policy: ClearPolicy,
    },
    UnreadChanged {
        senders: Vec<UserId>,
    },
    SignedOut,
}

impl MessagingEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConversationLoaded { .. } => EVENT_CONVERSATION_LOADED,
            Self::MessageAppended { .. } => EVENT_MESSAGE_APPENDED,
            Self::MessageConfirmed { .. } => EVENT_MESSAGE_CONFIRMED,
            Self::MessageFailed { .. } => EVENT_MESSAGE_FAILED,
            Self::MessageUpdated { .. } => EVENT_MESSAGE_UPDATED,
            Self::MessageRemoved { .. } => EVENT_MESSAGE_REMOVED,
            Self::ConversationCleared { .. } => EVENT_CONVERSATION_CLEARED,
            Self::UnreadChanged { .. } => EVENT_UNREAD_CHANGED,
            Self::SignedOut => EVENT_SIGNED_OUT,
        }
    }
}

/// Session-scoped event fan-out. Each session owns one; nothing global.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<MessagingEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MessagingEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: MessagingEvent) {
        let name = event.name();
        if self.tx.send(event).is_err() {
            tracing::trace!(event = name, "No event listeners");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_reaches_subscribers() {
        let sink = EventSink::new(8);
        let mut rx = sink.subscribe();
        sink.emit(MessagingEvent::SignedOut);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), EVENT_SIGNED_OUT);
    }

    #[test]
    fn emit_without_listeners_is_fine() {
        EventSink::new(1).emit(MessagingEvent::UnreadChanged { senders: vec![] });
    }

    #[test]
    fn events_serialize_tagged() {
        let value = serde_json::to_value(MessagingEvent::UnreadChanged {
            senders: vec![UserId::from("u2")],
        })
        .unwrap();
        assert_eq!(value["event"], "unreadChanged");
        assert_eq!(value["senders"][0], "u2");
    }
}
