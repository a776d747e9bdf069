//! In-memory state of the open conversation.
//!
//! Holds the visible messages for the current viewer, confirmed and
//! optimistic alike, ordered by `created_at` with the server id as
//! tiebreaker. Temporary entries carry a [`ClientMessageId`] that the
//! backend echoes back on the stored row; reconciliation matches on it and
//! always finishes with a dedupe by server id, so a confirmation and its
//! realtime echo can arrive in either order without duplicating the message.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use campus_shared::crypto;
use campus_shared::protocol::MessageRow;
use campus_shared::{ClientMessageId, ConversationId, MessageId, UserId};

use crate::config::{HistoryWindow, MessagingConfig};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum Delivery {
    Sending,
    Failed { reason: String },
    Sent { id: MessageId },
}

/// A message as the view sees it: decrypted, with its delivery state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalMessage {
    pub client_id: Option<ClientMessageId>,
    pub delivery: Delivery,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
}

impl LocalMessage {
    /// Decrypts the row body. Never fails; undecryptable bodies show as stored.
    pub fn from_row(row: &MessageRow) -> Self {
        Self {
            client_id: row.client_id,
            delivery: Delivery::Sent { id: row.id },
            sender_id: row.sender_id.clone(),
            receiver_id: row.receiver_id.clone(),
            body: crypto::open_body(&row.content, &row.sender_id, &row.receiver_id),
            created_at: row.created_at,
            is_read: row.is_read,
            read_at: row.read_at,
        }
    }

    pub fn server_id(&self) -> Option<MessageId> {
        match self.delivery {
            Delivery::Sent { id } => Some(id),
            _ => None,
        }
    }

    pub fn is_temporary(&self) -> bool {
        self.server_id().is_none()
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.delivery, Delivery::Failed { .. })
    }

    fn order_key(&self) -> (DateTime<Utc>, bool, i64) {
        (
            self.created_at,
            self.is_temporary(),
            self.server_id().map_or(0, |id| id.0),
        )
    }

    /// Read state only moves false -> true.
    fn merge_read(&mut self, row: &MessageRow) -> bool {
        if !row.is_read || self.is_read {
            return false;
        }
        self.is_read = true;
        self.read_at = row.read_at.or(self.read_at);
        true
    }
}

/// Result of applying one feed row to the conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Inserted(LocalMessage),
    /// A temporary entry was replaced by its confirmed row.
    Reconciled(LocalMessage),
    Updated(LocalMessage),
    Removed {
        id: MessageId,
        client_id: Option<ClientMessageId>,
    },
    Unchanged,
}

#[derive(Debug)]
pub struct ConversationState {
    conversation: ConversationId,
    me: UserId,
    counterparty: UserId,
    generation: u64,
    messages: Vec<LocalMessage>,
    first_unread: Option<MessageId>,
    loaded: bool,
    focused: bool,
    // Rows applied from the feed since the last fetch started.
    live_ids: HashSet<MessageId>,
    // Highest server id the last clear covered.
    cleared_through: Option<MessageId>,
    page_size: Option<u32>,
    history_window: HistoryWindow,
    echo_window: chrono::Duration,
}

impl ConversationState {
    pub fn new(me: UserId, counterparty: UserId, generation: u64, config: &MessagingConfig) -> Self {
        let echo_window = chrono::Duration::from_std(config.echo_match_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(10));
        Self {
            conversation: ConversationId::new(&me, &counterparty),
            me,
            counterparty,
            generation,
            messages: Vec::new(),
            first_unread: None,
            loaded: false,
            focused: true,
            live_ids: HashSet::new(),
            cleared_through: None,
            page_size: config.page_size,
            history_window: config.history_window,
            echo_window,
        }
    }

    pub fn conversation(&self) -> &ConversationId {
        &self.conversation
    }

    pub fn counterparty(&self) -> &UserId {
        &self.counterparty
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn messages(&self) -> &[LocalMessage] {
        &self.messages
    }

    pub fn first_unread(&self) -> Option<MessageId> {
        self.first_unread
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn is_focused(&self) -> bool {
        self.focused
    }

    pub fn set_focused(&mut self, focused: bool) -> bool {
        std::mem::replace(&mut self.focused, focused) != focused
    }

    pub fn find(&self, client_id: ClientMessageId) -> Option<&LocalMessage> {
        self.messages.iter().find(|m| m.client_id == Some(client_id))
    }

    /// Start tracking feed rows that a fetch in flight may not include.
    pub fn begin_fetch(&mut self) {
        self.live_ids.clear();
    }

    /// Re-derive the visible list from a fetched snapshot.
    ///
    /// Kept from the current list: temporaries the snapshot does not
    /// account for, and confirmed rows the feed delivered after the fetch
    /// started. Everything else comes from the snapshot.
    pub fn replace_snapshot(&mut self, rows: &[MessageRow]) {
        let mut next: Vec<LocalMessage> = rows
            .iter()
            .filter(|row| {
                row.conversation() == self.conversation
                    && row.is_visible_to(&self.me)
                    && !self.is_cleared(row.id)
            })
            .map(LocalMessage::from_row)
            .collect();

        let known: HashSet<MessageId> = next.iter().filter_map(LocalMessage::server_id).collect();
        let mut carried = Vec::new();
        for message in std::mem::take(&mut self.messages) {
            match message.server_id() {
                Some(id) => {
                    if self.live_ids.contains(&id) && !known.contains(&id) {
                        carried.push(message);
                    }
                }
                None => {
                    let confirmed = next.iter().any(|row| {
                        match row.client_id {
                            Some(_) => row.client_id == message.client_id,
                            None => self.echoes(&message, row),
                        }
                    });
                    if !confirmed {
                        carried.push(message);
                    }
                }
            }
        }
        next.extend(carried);

        self.messages = next;
        self.sort();
        self.enforce_limits(Utc::now());
        self.first_unread = self
            .messages
            .iter()
            .find(|m| m.sender_id == self.counterparty && !m.is_read)
            .and_then(LocalMessage::server_id);
        self.loaded = true;
    }

    /// Append an optimistic outgoing message.
    pub fn push_pending(&mut self, body: &str, now: DateTime<Utc>) -> LocalMessage {
        let message = LocalMessage {
            client_id: Some(ClientMessageId::new()),
            delivery: Delivery::Sending,
            sender_id: self.me.clone(),
            receiver_id: self.counterparty.clone(),
            body: body.to_string(),
            created_at: now,
            is_read: false,
            read_at: None,
        };
        self.insert_sorted(message.clone());
        message
    }

    /// Swap the temporary entry for the row the backend acknowledged.
    /// Returns `None` if a clear already covered the row; the temporary is
    /// dropped then.
    pub fn confirm(&mut self, client_id: ClientMessageId, row: &MessageRow) -> Option<LocalMessage> {
        self.messages
            .retain(|m| !(m.is_temporary() && m.client_id == Some(client_id)));
        if self.is_cleared(row.id) {
            return None;
        }
        self.live_ids.insert(row.id);
        let mut message = self.upsert_confirmed(row);
        if message.client_id.is_none() {
            message.client_id = Some(client_id);
            if let Some(stored) = self.by_server_id_mut(row.id) {
                stored.client_id = Some(client_id);
            }
        }
        Some(message)
    }

    /// Returns `false` if the entry is gone or already confirmed.
    pub fn fail(&mut self, client_id: ClientMessageId, reason: &str) -> bool {
        match self.temporary_mut(client_id) {
            Some(message) => {
                message.delivery = Delivery::Failed {
                    reason: reason.to_string(),
                };
                true
            }
            None => false,
        }
    }

    /// Move a failed entry back to `Sending`. Returns its body.
    pub fn retry(&mut self, client_id: ClientMessageId, now: DateTime<Utc>) -> Option<String> {
        let message = self.temporary_mut(client_id).filter(|m| m.is_failed())?;
        message.delivery = Delivery::Sending;
        message.created_at = now;
        let body = message.body.clone();
        self.sort();
        Some(body)
    }

    /// Drop a failed entry. Returns `false` if there was none.
    pub fn discard(&mut self, client_id: ClientMessageId) -> bool {
        let before = self.messages.len();
        self.messages
            .retain(|m| !(m.is_failed() && m.client_id == Some(client_id)));
        self.messages.len() != before
    }

    /// Flag temporaries still sending after `timeout` as failed.
    pub fn sweep_stale(&mut self, now: DateTime<Utc>, timeout: Duration) -> Vec<ClientMessageId> {
        let Ok(timeout) = chrono::Duration::from_std(timeout) else {
            return Vec::new();
        };
        let mut swept = Vec::new();
        for message in &mut self.messages {
            if message.delivery == Delivery::Sending && now - message.created_at > timeout {
                message.delivery = Delivery::Failed {
                    reason: "not confirmed in time".into(),
                };
                swept.extend(message.client_id);
            }
        }
        swept
    }

    pub fn apply_insert(&mut self, row: &MessageRow) -> Applied {
        if row.conversation() != self.conversation || !row.is_visible_to(&self.me) {
            return Applied::Unchanged;
        }
        self.live_ids.insert(row.id);

        if let Some(existing) = self.by_server_id_mut(row.id) {
            return if existing.merge_read(row) {
                Applied::Updated(existing.clone())
            } else {
                Applied::Unchanged
            };
        }

        let confirmed = LocalMessage::from_row(row);
        let temporary = match row.client_id {
            Some(client_id) => self
                .messages
                .iter()
                .position(|m| m.is_temporary() && m.client_id == Some(client_id)),
            None if row.sender_id == self.me => self
                .messages
                .iter()
                .position(|m| m.is_temporary() && self.echoes(m, &confirmed)),
            None => None,
        };

        if self.is_cleared(row.id) {
            return match temporary {
                Some(idx) => {
                    let dropped = self.messages.remove(idx);
                    Applied::Removed {
                        id: row.id,
                        client_id: dropped.client_id,
                    }
                }
                None => Applied::Unchanged,
            };
        }

        match temporary {
            Some(idx) => {
                let replaced = self.messages.remove(idx);
                let mut message = confirmed;
                message.client_id = message.client_id.or(replaced.client_id);
                self.insert_sorted(message.clone());
                Applied::Reconciled(message)
            }
            None => {
                self.insert_sorted(confirmed.clone());
                self.enforce_limits(Utc::now());
                Applied::Inserted(confirmed)
            }
        }
    }

    pub fn apply_update(&mut self, row: &MessageRow) -> Applied {
        if row.conversation() != self.conversation {
            return Applied::Unchanged;
        }
        let Some(idx) = self
            .messages
            .iter()
            .position(|m| m.server_id() == Some(row.id))
        else {
            return Applied::Unchanged;
        };

        if !row.is_visible_to(&self.me) {
            let removed = self.messages.remove(idx);
            return Applied::Removed {
                id: row.id,
                client_id: removed.client_id,
            };
        }
        let message = &mut self.messages[idx];
        if message.merge_read(row) {
            Applied::Updated(message.clone())
        } else {
            Applied::Unchanged
        }
    }

    /// Merge read state returned by a mark-read call. Returns changed entries.
    pub fn merge_read_rows(&mut self, rows: &[MessageRow]) -> Vec<LocalMessage> {
        let mut changed = Vec::new();
        for row in rows {
            if let Some(message) = self.by_server_id_mut(row.id) {
                if message.merge_read(row) {
                    changed.push(message.clone());
                }
            }
        }
        changed
    }

    /// Drop everything the viewer could see, after a successful clear that
    /// touched rows up to `through`. Sends still in flight stay; if their row
    /// turns out to be covered by the clear they are dropped on confirm.
    pub fn clear(&mut self, through: Option<MessageId>) {
        self.messages.retain(|m| m.is_temporary() && !m.is_failed());
        self.first_unread = None;
        self.live_ids.clear();
        self.cleared_through = self.cleared_through.max(through);
    }

    fn is_cleared(&self, id: MessageId) -> bool {
        self.cleared_through.is_some_and(|through| id <= through)
    }

    fn upsert_confirmed(&mut self, row: &MessageRow) -> LocalMessage {
        if let Some(existing) = self.by_server_id_mut(row.id) {
            existing.merge_read(row);
            return existing.clone();
        }
        let message = LocalMessage::from_row(row);
        self.insert_sorted(message.clone());
        message
    }

    /// Fallback match for rows without a correlation id: same direction,
    /// same body, created within the echo window.
    fn echoes(&self, temporary: &LocalMessage, confirmed: &LocalMessage) -> bool {
        confirmed.sender_id == self.me
            && temporary.receiver_id == confirmed.receiver_id
            && temporary.body == confirmed.body
            && (temporary.created_at - confirmed.created_at).abs() <= self.echo_window
    }

    fn enforce_limits(&mut self, now: DateTime<Utc>) {
        if let Some(floor) = self.history_window.floor(now) {
            self.messages
                .retain(|m| m.is_temporary() || m.created_at >= floor);
        }
        if let Some(limit) = self.page_size {
            let confirmed = self.messages.iter().filter(|m| !m.is_temporary()).count();
            let mut excess = confirmed.saturating_sub(limit as usize);
            self.messages.retain(|m| {
                if excess > 0 && !m.is_temporary() {
                    excess -= 1;
                    false
                } else {
                    true
                }
            });
        }
    }

    fn insert_sorted(&mut self, message: LocalMessage) {
        let key = message.order_key();
        let idx = self.messages.partition_point(|m| m.order_key() <= key);
        self.messages.insert(idx, message);
    }

    fn sort(&mut self) {
        self.messages.sort_by_key(LocalMessage::order_key);
    }

    fn by_server_id_mut(&mut self, id: MessageId) -> Option<&mut LocalMessage> {
        self.messages.iter_mut().find(|m| m.server_id() == Some(id))
    }

    fn temporary_mut(&mut self, client_id: ClientMessageId) -> Option<&mut LocalMessage> {
        self.messages
            .iter_mut()
            .find(|m| m.is_temporary() && m.client_id == Some(client_id))
    }
}
