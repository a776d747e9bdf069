//! CRUD operations for message rows.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension};

use campus_shared::backend::{MessageFilter, MessagePatch, MessageQuery, MessageScope};
use campus_shared::protocol::{MessageRow, NewMessage};
use campus_shared::{ClientMessageId, MessageId, UserId};

use crate::database::{corrupt, format_ts, parse_ts, Database};
use crate::error::{Result, StoreError};

const MESSAGE_COLUMNS: &str = "id, sender_id, receiver_id, content, created_at, is_read, read_at,
     deleted_by_sender, deleted_by_receiver, client_id";

// Stays well under SQLite's bound-parameter limit.
const ID_CHUNK: usize = 500;

/// Outcome of an insert: the stored row, and whether it is new. A repeated
/// insert with the same `(sender_id, client_id)` returns the existing row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inserted {
    pub row: MessageRow,
    pub created: bool,
}

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    pub fn insert_message(&self, message: &NewMessage, created_at: DateTime<Utc>) -> Result<Inserted> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO messages (sender_id, receiver_id, content, created_at, is_read, client_id)
             VALUES (?1, ?2, ?3, ?4, 0, ?5)",
            params![
                message.sender_id.as_str(),
                message.receiver_id.as_str(),
                message.content,
                format_ts(&created_at),
                message.client_id.map(|c| c.0.to_string()),
            ],
        )?;

        if affected > 0 {
            let id = MessageId(self.conn().last_insert_rowid());
            return Ok(Inserted {
                row: self.get_message(id)?,
                created: true,
            });
        }

        // Ignored: only the client_id uniqueness constraint can collide.
        let client_id = message.client_id.ok_or(StoreError::NotFound)?;
        let row = self
            .find_by_client_id(&message.sender_id, client_id)?
            .ok_or(StoreError::NotFound)?;
        Ok(Inserted {
            row,
            created: false,
        })
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_message(&self, id: MessageId) -> Result<MessageRow> {
        self.conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.0],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    pub fn find_by_client_id(
        &self,
        sender: &UserId,
        client_id: ClientMessageId,
    ) -> Result<Option<MessageRow>> {
        let row = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE sender_id = ?1 AND client_id = ?2"
                ),
                params![sender.as_str(), client_id.0.to_string()],
                row_to_message,
            )
            .optional()?;
        Ok(row)
    }

    /// Rows of one conversation visible to the query's viewer, oldest first.
    /// With a limit, the most recent `limit` rows are kept.
    pub fn query_conversation(&self, query: &MessageQuery) -> Result<Vec<MessageRow>> {
        let (low, high) = query.conversation.participants();
        let viewer = query.viewer.as_str();

        let mut sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE ((sender_id = ?1 AND receiver_id = ?2) OR (sender_id = ?2 AND receiver_id = ?1))
               AND NOT (sender_id = ?3 AND deleted_by_sender = 1)
               AND NOT (receiver_id = ?3 AND deleted_by_receiver = 1)"
        );
        let mut values: Vec<Value> = vec![
            Value::Text(low.as_str().to_string()),
            Value::Text(high.as_str().to_string()),
            Value::Text(viewer.to_string()),
        ];

        if let Some(since) = query.since {
            sql.push_str(" AND created_at >= ?4");
            values.push(Value::Text(format_ts(&since)));
        }

        sql.push_str(" ORDER BY created_at DESC, id DESC");
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        messages.reverse();
        Ok(messages)
    }

    pub fn query_unread_for(&self, receiver: &UserId) -> Result<Vec<MessageRow>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE receiver_id = ?1 AND is_read IS NOT 1 AND deleted_by_receiver = 0
             ORDER BY created_at ASC, id ASC"
        ))?;

        let rows = stmt.query_map(params![receiver.as_str()], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Apply `patch` to every row matching `filter` inside one transaction.
    /// Returns the rows as they are after the update.
    pub fn update_messages(
        &mut self,
        filter: &MessageFilter,
        patch: &MessagePatch,
    ) -> Result<Vec<MessageRow>> {
        if patch.is_empty() {
            return Ok(Vec::new());
        }

        let (where_sql, values) = filter_clause(filter);

        let tx = self.conn_mut().transaction()?;

        let ids: Vec<i64> = {
            let mut stmt = tx.prepare(&format!("SELECT id FROM messages WHERE {where_sql}"))?;
            let rows = stmt.query_map(params_from_iter(values.iter()), |row| row.get(0))?;
            let mut ids = Vec::new();
            for id in rows {
                ids.push(id?);
            }
            ids
        };

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut sets = Vec::new();
        let mut set_values: Vec<Value> = Vec::new();
        if let Some(is_read) = patch.is_read {
            sets.push("is_read = ?");
            set_values.push(Value::Integer(i64::from(is_read)));
        }
        if let Some(read_at) = patch.read_at {
            sets.push("read_at = ?");
            set_values.push(Value::Text(format_ts(&read_at)));
        }
        if let Some(flag) = patch.deleted_by_sender {
            sets.push("deleted_by_sender = ?");
            set_values.push(Value::Integer(i64::from(flag)));
        }
        if let Some(flag) = patch.deleted_by_receiver {
            sets.push("deleted_by_receiver = ?");
            set_values.push(Value::Integer(i64::from(flag)));
        }

        let set_sql = sets.join(", ");
        let mut updated = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(ID_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let mut bound = set_values.clone();
            bound.extend(chunk.iter().map(|id| Value::Integer(*id)));
            tx.execute(
                &format!("UPDATE messages SET {set_sql} WHERE id IN ({placeholders})"),
                params_from_iter(bound),
            )?;

            let mut stmt = tx.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id IN ({placeholders})"
            ))?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), row_to_message)?;
            for row in rows {
                updated.push(row?);
            }
        }
        updated.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));

        tx.commit()?;
        Ok(updated)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Unnumbered `?` placeholders, in order.
fn filter_clause(filter: &MessageFilter) -> (String, Vec<Value>) {
    let mut clauses = Vec::new();
    let mut values = Vec::new();

    match &filter.scope {
        MessageScope::Directed { sender, receiver } => {
            clauses.push("sender_id = ? AND receiver_id = ?".to_string());
            values.push(Value::Text(sender.as_str().to_string()));
            values.push(Value::Text(receiver.as_str().to_string()));
        }
        MessageScope::Conversation(conversation) => {
            let (low, high) = conversation.participants();
            clauses.push(
                "((sender_id = ? AND receiver_id = ?) OR (sender_id = ? AND receiver_id = ?))"
                    .to_string(),
            );
            values.push(Value::Text(low.as_str().to_string()));
            values.push(Value::Text(high.as_str().to_string()));
            values.push(Value::Text(high.as_str().to_string()));
            values.push(Value::Text(low.as_str().to_string()));
        }
    }

    if filter.not_read {
        clauses.push("is_read IS NOT 1".to_string());
    }
    if filter.not_deleted_by_receiver {
        clauses.push("deleted_by_receiver = 0".to_string());
    }

    (clauses.join(" AND "), values)
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    let id: i64 = row.get(0)?;
    let sender_id: String = row.get(1)?;
    let receiver_id: String = row.get(2)?;
    let content: String = row.get(3)?;
    let created_str: String = row.get(4)?;
    let is_read: Option<bool> = row.get(5)?;
    let read_at_str: Option<String> = row.get(6)?;
    let deleted_by_sender: bool = row.get(7)?;
    let deleted_by_receiver: bool = row.get(8)?;
    let client_id_str: Option<String> = row.get(9)?;

    if sender_id.is_empty() || receiver_id.is_empty() {
        return Err(corrupt(1, "empty participant id"));
    }

    let created_at = parse_ts(4, &created_str)?;
    let read_at = read_at_str.map(|s| parse_ts(6, &s)).transpose()?;

    let client_id = client_id_str
        .map(|s| uuid::Uuid::parse_str(&s))
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e))
        })?
        .map(ClientMessageId);

    Ok(MessageRow {
        id: MessageId(id),
        sender_id: UserId::new(sender_id),
        receiver_id: UserId::new(receiver_id),
        content,
        created_at,
        is_read: is_read.unwrap_or(false),
        read_at,
        deleted_by_sender,
        deleted_by_receiver,
        client_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use campus_shared::ConversationId;
    use chrono::Duration;

    fn new_message(sender: &str, receiver: &str, content: &str) -> NewMessage {
        NewMessage {
            sender_id: UserId::from(sender),
            receiver_id: UserId::from(receiver),
            content: content.to_string(),
            client_id: None,
        }
    }

    fn conversation_query(viewer: &str) -> MessageQuery {
        MessageQuery {
            conversation: ConversationId::new(&UserId::from("u1"), &UserId::from("u2")),
            viewer: UserId::from(viewer),
            since: None,
            limit: None,
        }
    }

    #[test]
    fn insert_assigns_increasing_ids() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        let a = db.insert_message(&new_message("u1", "u2", "a"), now).unwrap();
        let b = db.insert_message(&new_message("u2", "u1", "b"), now).unwrap();

        assert!(a.created && b.created);
        assert!(b.row.id > a.row.id);
        assert!(!a.row.is_read);
    }

    #[test]
    fn insert_with_same_client_id_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let mut msg = new_message("u1", "u2", "hi");
        msg.client_id = Some(ClientMessageId::new());

        let first = db.insert_message(&msg, Utc::now()).unwrap();
        let second = db.insert_message(&msg, Utc::now()).unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.row.id, second.row.id);
        assert_eq!(second.row.client_id, msg.client_id);
    }

    #[test]
    fn query_orders_by_time_then_id() {
        let db = Database::open_in_memory().unwrap();
        let t0 = Utc::now();
        db.insert_message(&new_message("u1", "u2", "second"), t0).unwrap();
        db.insert_message(&new_message("u2", "u1", "first"), t0 - Duration::seconds(5))
            .unwrap();
        db.insert_message(&new_message("u2", "u1", "third"), t0).unwrap();
        db.insert_message(&new_message("u1", "u3", "elsewhere"), t0).unwrap();

        let rows = db.query_conversation(&conversation_query("u1")).unwrap();
        let bodies: Vec<_> = rows.iter().map(|r| r.content.as_str()).collect();
        assert_eq!(bodies, ["first", "second", "third"]);
    }

    #[test]
    fn query_limit_keeps_most_recent() {
        let db = Database::open_in_memory().unwrap();
        let t0 = Utc::now();
        for i in 0..5 {
            db.insert_message(&new_message("u1", "u2", &format!("m{i}")), t0 + Duration::seconds(i))
                .unwrap();
        }

        let mut query = conversation_query("u2");
        query.limit = Some(2);
        let rows = db.query_conversation(&query).unwrap();
        let bodies: Vec<_> = rows.iter().map(|r| r.content.as_str()).collect();
        assert_eq!(bodies, ["m3", "m4"]);
    }

    #[test]
    fn query_since_filters_old_rows() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        db.insert_message(&new_message("u1", "u2", "old"), now - Duration::hours(30))
            .unwrap();
        db.insert_message(&new_message("u1", "u2", "fresh"), now - Duration::hours(1))
            .unwrap();

        let mut query = conversation_query("u2");
        query.since = Some(now - Duration::hours(24));
        let rows = db.query_conversation(&query).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].content, "fresh");
    }

    #[test]
    fn soft_delete_is_per_viewer() {
        let mut db = Database::open_in_memory().unwrap();
        db.insert_message(&new_message("u1", "u2", "hello"), Utc::now())
            .unwrap();

        let updated = db
            .update_messages(
                &MessageFilter::directed(&UserId::from("u1"), &UserId::from("u2")),
                &MessagePatch::deleted_by_sender(),
            )
            .unwrap();
        assert_eq!(updated.len(), 1);
        assert!(updated[0].deleted_by_sender);

        assert!(db.query_conversation(&conversation_query("u1")).unwrap().is_empty());
        assert_eq!(db.query_conversation(&conversation_query("u2")).unwrap().len(), 1);
    }

    #[test]
    fn bilateral_delete_hides_from_both() {
        let mut db = Database::open_in_memory().unwrap();
        db.insert_message(&new_message("u1", "u2", "a"), Utc::now()).unwrap();
        db.insert_message(&new_message("u2", "u1", "b"), Utc::now()).unwrap();

        let conv = ConversationId::new(&UserId::from("u1"), &UserId::from("u2"));
        let updated = db
            .update_messages(&MessageFilter::conversation(conv), &MessagePatch::deleted_by_both())
            .unwrap();
        assert_eq!(updated.len(), 2);

        assert!(db.query_conversation(&conversation_query("u1")).unwrap().is_empty());
        assert!(db.query_conversation(&conversation_query("u2")).unwrap().is_empty());
    }

    #[test]
    fn clearing_more_rows_than_the_parameter_limit() {
        let mut db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        db.conn().execute_batch("BEGIN").unwrap();
        for i in 0..33_000 {
            db.insert_message(&new_message("u1", "u2", &format!("m{i}")), now)
                .unwrap();
        }
        db.conn().execute_batch("COMMIT").unwrap();

        let conv = ConversationId::new(&UserId::from("u1"), &UserId::from("u2"));
        let updated = db
            .update_messages(&MessageFilter::conversation(conv), &MessagePatch::deleted_by_both())
            .unwrap();
        assert_eq!(updated.len(), 33_000);
        assert!(updated.windows(2).all(|w| w[0].id < w[1].id));
        assert!(updated.iter().all(|r| r.deleted_by_sender && r.deleted_by_receiver));

        let per_side = db
            .update_messages(
                &MessageFilter::directed(&UserId::from("u1"), &UserId::from("u2")),
                &MessagePatch::deleted_by_sender(),
            )
            .unwrap();
        assert_eq!(per_side.len(), 33_000);
        assert!(db.query_conversation(&conversation_query("u2")).unwrap().is_empty());
    }

    #[test]
    fn not_read_filter_repairs_null_rows_once() {
        let mut db = Database::open_in_memory().unwrap();
        let inserted = db
            .insert_message(&new_message("u1", "u2", "legacy"), Utc::now())
            .unwrap();
        db.conn()
            .execute("UPDATE messages SET is_read = NULL WHERE id = ?1", params![inserted.row.id.0])
            .unwrap();

        let filter = MessageFilter::directed(&UserId::from("u1"), &UserId::from("u2"))
            .not_read()
            .not_deleted_by_receiver();
        let first = db
            .update_messages(&filter, &MessagePatch::read_at(Utc::now()))
            .unwrap();
        assert_eq!(first.len(), 1);
        assert!(first[0].is_read);
        assert!(first[0].read_at.is_some());

        let second = db
            .update_messages(&filter, &MessagePatch::read_at(Utc::now()))
            .unwrap();
        assert!(second.is_empty());
        assert_eq!(db.get_message(inserted.row.id).unwrap().read_at, first[0].read_at);
    }

    #[test]
    fn unread_query_skips_deleted_and_read() {
        let mut db = Database::open_in_memory().unwrap();
        db.insert_message(&new_message("u1", "u2", "a"), Utc::now()).unwrap();
        db.insert_message(&new_message("u3", "u2", "b"), Utc::now()).unwrap();
        db.insert_message(&new_message("u2", "u1", "mine"), Utc::now()).unwrap();

        db.update_messages(
            &MessageFilter::directed(&UserId::from("u3"), &UserId::from("u2")),
            &MessagePatch::deleted_by_receiver(),
        )
        .unwrap();

        let unread = db.query_unread_for(&UserId::from("u2")).unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].sender_id, UserId::from("u1"));
    }

    #[test]
    fn missing_message_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(db.get_message(MessageId(42)), Err(StoreError::NotFound)));
    }
}
