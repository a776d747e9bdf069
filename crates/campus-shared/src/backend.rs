//! Contract of the hosted backend (relational store, change feed, auth).
//!
//! The messaging core only talks to the backend through [`Backend`]. The
//! `campus-store` crate ships an embedded implementation used for tests and
//! local development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::error::BackendError;
use crate::protocol::{ChangeKind, FriendshipRow, MessageRow, NewMessage, Profile};
use crate::types::{ConversationId, FriendshipStatus, UserId};

/// Fetch the messages of one conversation as seen by `viewer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageQuery {
    pub conversation: ConversationId,
    /// Rows the viewer soft-deleted on their side are left out.
    pub viewer: UserId,
    /// Only rows created at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Keep the most recent `limit` rows. `None` returns everything.
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageScope {
    /// Rows sent by `sender` to `receiver`.
    Directed { sender: UserId, receiver: UserId },
    /// Every row of the conversation, both directions.
    Conversation(ConversationId),
}

/// Row selection for bulk updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFilter {
    pub scope: MessageScope,
    /// Match only rows where `is_read IS NOT true` (also catches NULL).
    pub not_read: bool,
    /// Match only rows the receiver has not soft-deleted.
    pub not_deleted_by_receiver: bool,
}

impl MessageFilter {
    pub fn directed(sender: &UserId, receiver: &UserId) -> Self {
        Self {
            scope: MessageScope::Directed {
                sender: sender.clone(),
                receiver: receiver.clone(),
            },
            not_read: false,
            not_deleted_by_receiver: false,
        }
    }

    pub fn conversation(conversation: ConversationId) -> Self {
        Self {
            scope: MessageScope::Conversation(conversation),
            not_read: false,
            not_deleted_by_receiver: false,
        }
    }

    pub fn not_read(mut self) -> Self {
        self.not_read = true;
        self
    }

    pub fn not_deleted_by_receiver(mut self) -> Self {
        self.not_deleted_by_receiver = true;
        self
    }

    pub fn matches(&self, row: &MessageRow) -> bool {
        let in_scope = match &self.scope {
            MessageScope::Directed { sender, receiver } => {
                &row.sender_id == sender && &row.receiver_id == receiver
            }
            MessageScope::Conversation(conversation) => &row.conversation() == conversation,
        };
        in_scope
            && !(self.not_read && row.is_read)
            && !(self.not_deleted_by_receiver && row.deleted_by_receiver)
    }
}

/// Columns to set on matched rows. `None` leaves a column untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessagePatch {
    pub is_read: Option<bool>,
    pub read_at: Option<DateTime<Utc>>,
    pub deleted_by_sender: Option<bool>,
    pub deleted_by_receiver: Option<bool>,
}

impl MessagePatch {
    pub fn read_at(at: DateTime<Utc>) -> Self {
        Self {
            is_read: Some(true),
            read_at: Some(at),
            ..Self::default()
        }
    }

    pub fn deleted_by_sender() -> Self {
        Self {
            deleted_by_sender: Some(true),
            ..Self::default()
        }
    }

    pub fn deleted_by_receiver() -> Self {
        Self {
            deleted_by_receiver: Some(true),
            ..Self::default()
        }
    }

    pub fn deleted_by_both() -> Self {
        Self {
            deleted_by_sender: Some(true),
            deleted_by_receiver: Some(true),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Column predicates for a change-feed subscription on the messages table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeFilter {
    pub kinds: Vec<ChangeKind>,
    pub sender_id: Option<UserId>,
    pub receiver_id: Option<UserId>,
}

impl ChangeFilter {
    pub fn inserts() -> Self {
        Self {
            kinds: vec![ChangeKind::Insert],
            sender_id: None,
            receiver_id: None,
        }
    }

    pub fn inserts_and_updates() -> Self {
        Self {
            kinds: vec![ChangeKind::Insert, ChangeKind::Update],
            sender_id: None,
            receiver_id: None,
        }
    }

    pub fn sender(mut self, id: &UserId) -> Self {
        self.sender_id = Some(id.clone());
        self
    }

    pub fn receiver(mut self, id: &UserId) -> Self {
        self.receiver_id = Some(id.clone());
        self
    }

    pub fn matches(&self, kind: ChangeKind, row: &MessageRow) -> bool {
        self.kinds.contains(&kind)
            && self.sender_id.as_ref().map_or(true, |s| s == &row.sender_id)
            && self.receiver_id.as_ref().map_or(true, |r| r == &row.receiver_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// An acknowledged change-feed subscription. Raw JSON payloads arrive on
/// `events` in commit order; validation is the consumer's job.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub events: mpsc::UnboundedReceiver<serde_json::Value>,
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn query_messages(&self, query: &MessageQuery) -> Result<Vec<MessageRow>, BackendError>;

    /// Unread rows addressed to `receiver` that they have not deleted.
    async fn query_unread(&self, receiver: &UserId) -> Result<Vec<MessageRow>, BackendError>;

    async fn insert_message(&self, message: &NewMessage) -> Result<MessageRow, BackendError>;

    /// Apply `patch` to every row matching `filter`; returns the updated rows.
    async fn update_messages(
        &self,
        filter: &MessageFilter,
        patch: &MessagePatch,
    ) -> Result<Vec<MessageRow>, BackendError>;

    async fn query_friendships(
        &self,
        user: &UserId,
        status: FriendshipStatus,
    ) -> Result<Vec<FriendshipRow>, BackendError>;

    async fn fetch_profiles(&self, ids: &[UserId]) -> Result<Vec<Profile>, BackendError>;

    /// Resolves once the feed acknowledged the subscription.
    async fn subscribe(&self, filter: ChangeFilter) -> Result<Subscription, BackendError>;

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageId;

    fn row(sender: &str, receiver: &str) -> MessageRow {
        MessageRow {
            id: MessageId(1),
            sender_id: UserId::from(sender),
            receiver_id: UserId::from(receiver),
            content: String::new(),
            created_at: Utc::now(),
            is_read: false,
            read_at: None,
            deleted_by_sender: false,
            deleted_by_receiver: false,
            client_id: None,
        }
    }

    #[test]
    fn test_directed_filter() {
        let filter = MessageFilter::directed(&UserId::from("u1"), &UserId::from("u2"));
        assert!(filter.matches(&row("u1", "u2")));
        assert!(!filter.matches(&row("u2", "u1")));
    }

    #[test]
    fn test_conversation_filter_matches_both_directions() {
        let conv = ConversationId::new(&UserId::from("u1"), &UserId::from("u2"));
        let filter = MessageFilter::conversation(conv);
        assert!(filter.matches(&row("u1", "u2")));
        assert!(filter.matches(&row("u2", "u1")));
        assert!(!filter.matches(&row("u1", "u3")));
    }

    #[test]
    fn test_not_read_predicate() {
        let filter = MessageFilter::directed(&UserId::from("u1"), &UserId::from("u2")).not_read();
        let mut read = row("u1", "u2");
        read.is_read = true;
        assert!(!filter.matches(&read));
        assert!(filter.matches(&row("u1", "u2")));
    }

    #[test]
    fn test_change_filter_predicates() {
        let me = UserId::from("u2");
        let filter = ChangeFilter::inserts().receiver(&me);
        assert!(filter.matches(ChangeKind::Insert, &row("u1", "u2")));
        assert!(!filter.matches(ChangeKind::Update, &row("u1", "u2")));
        assert!(!filter.matches(ChangeKind::Insert, &row("u2", "u1")));
    }

    #[test]
    fn test_patch_helpers() {
        assert!(MessagePatch::default().is_empty());
        assert!(!MessagePatch::deleted_by_both().is_empty());
        assert_eq!(MessagePatch::read_at(Utc::now()).is_read, Some(true));
    }
}
