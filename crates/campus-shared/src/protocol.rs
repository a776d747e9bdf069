//! Row and change-event schema exchanged with the backend.
//!
//! The change feed hands us loosely shaped JSON. Everything entering the
//! messaging core goes through [`ChangeEvent::from_value`], which checks the
//! event type, the table and every required column, and coerces nullable
//! legacy flags to `false`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::MESSAGES_TABLE;
use crate::error::ProtocolError;
use crate::types::{ClientMessageId, ConversationId, MessageId, UserId};

/// A stored message row, as returned by queries, inserts and the change feed.
///
/// `content` is always the sealed body, never plaintext.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageRow {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub deleted_by_sender: bool,
    pub deleted_by_receiver: bool,
    pub client_id: Option<ClientMessageId>,
}

impl MessageRow {
    pub fn conversation(&self) -> ConversationId {
        ConversationId::new(&self.sender_id, &self.receiver_id)
    }

    /// Whether `viewer` still sees this row (their own delete flag is unset).
    pub fn is_visible_to(&self, viewer: &UserId) -> bool {
        if &self.sender_id == viewer {
            !self.deleted_by_sender
        } else if &self.receiver_id == viewer {
            !self.deleted_by_receiver
        } else {
            false
        }
    }
}

/// Insert payload for a new message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub client_id: Option<ClientMessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FriendshipRow {
    pub user_id: UserId,
    pub friend_id: UserId,
    pub status: crate::types::FriendshipStatus,
}

impl FriendshipRow {
    pub fn partner_of(&self, me: &UserId) -> Option<&UserId> {
        if &self.user_id == me {
            Some(&self.friend_id)
        } else if &self.friend_id == me {
            Some(&self.user_id)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    pub id: UserId,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

impl Profile {
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or_else(|| self.id.short())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
        }
    }
}

/// A validated change-feed event on the messages table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub commit_timestamp: DateTime<Utc>,
    pub record: MessageRow,
    pub old_record: Option<MessageRow>,
}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct WireChange {
    #[serde(rename = "type")]
    kind: String,
    table: String,
    commit_timestamp: DateTime<Utc>,
    record: Option<WireRow>,
    #[serde(default)]
    old_record: Option<WireRow>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireRow {
    id: i64,
    sender_id: String,
    receiver_id: String,
    content: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    is_read: Option<bool>,
    #[serde(default)]
    read_at: Option<DateTime<Utc>>,
    #[serde(default)]
    deleted_by_sender: Option<bool>,
    #[serde(default)]
    deleted_by_receiver: Option<bool>,
    #[serde(default)]
    client_id: Option<uuid::Uuid>,
}

impl WireRow {
    fn into_row(self) -> Result<MessageRow, ProtocolError> {
        if self.sender_id.is_empty() || self.receiver_id.is_empty() {
            return Err(ProtocolError::Malformed(
                "sender_id and receiver_id must be non-empty".into(),
            ));
        }
        Ok(MessageRow {
            id: MessageId(self.id),
            sender_id: UserId::new(self.sender_id),
            receiver_id: UserId::new(self.receiver_id),
            content: self.content,
            created_at: self.created_at,
            is_read: self.is_read.unwrap_or(false),
            read_at: self.read_at,
            deleted_by_sender: self.deleted_by_sender.unwrap_or(false),
            deleted_by_receiver: self.deleted_by_receiver.unwrap_or(false),
            client_id: self.client_id.map(ClientMessageId),
        })
    }
}

impl From<&MessageRow> for WireRow {
    fn from(row: &MessageRow) -> Self {
        Self {
            id: row.id.0,
            sender_id: row.sender_id.as_str().to_string(),
            receiver_id: row.receiver_id.as_str().to_string(),
            content: row.content.clone(),
            created_at: row.created_at,
            is_read: Some(row.is_read),
            read_at: row.read_at,
            deleted_by_sender: Some(row.deleted_by_sender),
            deleted_by_receiver: Some(row.deleted_by_receiver),
            client_id: row.client_id.map(|c| c.0),
        }
    }
}

impl ChangeEvent {
    /// Validate and coerce a raw change-feed payload.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ProtocolError> {
        let wire: WireChange = serde_json::from_value(value)?;

        let kind = match wire.kind.as_str() {
            "INSERT" => ChangeKind::Insert,
            "UPDATE" => ChangeKind::Update,
            other => return Err(ProtocolError::UnsupportedEvent(other.to_string())),
        };

        if wire.table != MESSAGES_TABLE {
            return Err(ProtocolError::UnexpectedTable(wire.table));
        }

        let record = wire
            .record
            .ok_or(ProtocolError::MissingRecord(kind.as_str()))?
            .into_row()?;
        let old_record = wire.old_record.map(WireRow::into_row).transpose()?;

        Ok(Self {
            kind,
            commit_timestamp: wire.commit_timestamp,
            record,
            old_record,
        })
    }

    /// Encode into the JSON shape the change feed publishes.
    pub fn to_value(&self) -> serde_json::Value {
        let wire = WireChange {
            kind: self.kind.as_str().to_string(),
            table: MESSAGES_TABLE.to_string(),
            commit_timestamp: self.commit_timestamp,
            record: Some(WireRow::from(&self.record)),
            old_record: self.old_record.as_ref().map(WireRow::from),
        };
        // Plain structs with string keys always serialize.
        serde_json::to_value(wire).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn insert_payload() -> serde_json::Value {
        json!({
            "type": "INSERT",
            "table": "messages",
            "commit_timestamp": "2026-03-01T10:00:00Z",
            "record": {
                "id": 7,
                "sender_id": "u1",
                "receiver_id": "u2",
                "content": "v1:abc",
                "created_at": "2026-03-01T10:00:00Z",
                "is_read": null,
                "read_at": null,
                "deleted_by_sender": false,
                "deleted_by_receiver": null,
                "client_id": null
            },
            "old_record": null
        })
    }

    #[test]
    fn test_insert_event_coerces_nulls() {
        let event = ChangeEvent::from_value(insert_payload()).unwrap();
        assert_eq!(event.kind, ChangeKind::Insert);
        assert_eq!(event.record.id, MessageId(7));
        assert!(!event.record.is_read);
        assert!(!event.record.deleted_by_receiver);
        assert_eq!(event.record.client_id, None);
    }

    #[test]
    fn test_missing_flags_default_to_false() {
        let value = json!({
            "type": "INSERT",
            "table": "messages",
            "commit_timestamp": "2026-03-01T10:00:00Z",
            "record": {
                "id": 1,
                "sender_id": "u1",
                "receiver_id": "u2",
                "content": "legacy plaintext",
                "created_at": "2026-03-01T10:00:00Z"
            }
        });
        let event = ChangeEvent::from_value(value).unwrap();
        assert!(!event.record.deleted_by_sender);
        assert!(event.old_record.is_none());
    }

    #[test]
    fn test_rejects_unknown_event_type() {
        let mut value = insert_payload();
        value["type"] = json!("DELETE");
        assert_eq!(
            ChangeEvent::from_value(value),
            Err(ProtocolError::UnsupportedEvent("DELETE".into()))
        );
    }

    #[test]
    fn test_rejects_other_table() {
        let mut value = insert_payload();
        value["table"] = json!("friendships");
        assert!(matches!(
            ChangeEvent::from_value(value),
            Err(ProtocolError::UnexpectedTable(_))
        ));
    }

    #[test]
    fn test_rejects_missing_sender() {
        let mut value = insert_payload();
        value["record"].as_object_mut().unwrap().remove("sender_id");
        assert!(matches!(
            ChangeEvent::from_value(value),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_rejects_empty_receiver() {
        let mut value = insert_payload();
        value["record"]["receiver_id"] = json!("");
        assert!(ChangeEvent::from_value(value).is_err());
    }

    #[test]
    fn test_rejects_missing_record() {
        let mut value = insert_payload();
        value["record"] = serde_json::Value::Null;
        assert_eq!(
            ChangeEvent::from_value(value),
            Err(ProtocolError::MissingRecord("INSERT"))
        );
    }

    #[test]
    fn test_rejects_bad_timestamp() {
        let mut value = insert_payload();
        value["record"]["created_at"] = json!("yesterday");
        assert!(ChangeEvent::from_value(value).is_err());
    }

    #[test]
    fn test_to_value_is_accepted_back() {
        let event = ChangeEvent::from_value(insert_payload()).unwrap();
        let again = ChangeEvent::from_value(event.to_value()).unwrap();
        assert_eq!(event, again);
    }

    #[test]
    fn test_visibility_per_side() {
        let mut row = ChangeEvent::from_value(insert_payload()).unwrap().record;
        row.deleted_by_sender = true;

        assert!(!row.is_visible_to(&UserId::from("u1")));
        assert!(row.is_visible_to(&UserId::from("u2")));
        assert!(!row.is_visible_to(&UserId::from("u3")));
    }

    #[test]
    fn test_friendship_partner() {
        let row = FriendshipRow {
            user_id: UserId::from("u1"),
            friend_id: UserId::from("u2"),
            status: crate::types::FriendshipStatus::Accepted,
        };
        assert_eq!(row.partner_of(&UserId::from("u2")), Some(&UserId::from("u1")));
        assert_eq!(row.partner_of(&UserId::from("u9")), None);
    }
}
