//! Session-scoped state shared by the public [`Session`](crate::Session)
//! handle and the feed tasks.
//!
//! [`SessionContext`] is created at sign-in and dropped at sign-out. Feed
//! tasks only hold a `Weak` to it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use campus_shared::protocol::{ChangeEvent, ChangeKind};
use campus_shared::{Backend, ConversationId, UserId};

use crate::config::MessagingConfig;
use crate::conversation_index::ConversationIndex;
use crate::coordination::{disposition, should_mark_unread, Disposition};
use crate::error::{MessagingError, Result};
use crate::events::{EventSink, MessagingEvent};
use crate::message_store::{bounded, MessageStore};
use crate::realtime::{ChangeSink, FeedScope};
use crate::unread::UnreadTracker;

pub struct SessionContext {
    pub me: UserId,
    pub config: MessagingConfig,
    pub backend: Arc<dyn Backend>,
    pub events: EventSink,
    pub store: MessageStore,
    pub index: ConversationIndex,
    pub unread: Mutex<UnreadTracker>,
    signed_in: AtomicBool,
}

impl SessionContext {
    pub fn new(me: UserId, backend: Arc<dyn Backend>, config: MessagingConfig) -> Self {
        let events = EventSink::new(config.event_buffer);
        let store = MessageStore::new(me.clone(), backend.clone(), config.clone(), events.clone());
        let index = ConversationIndex::new(me.clone(), backend.clone(), config.request_timeout);
        Self {
            me,
            config,
            backend,
            events,
            store,
            index,
            unread: Mutex::new(UnreadTracker::new()),
            signed_in: AtomicBool::new(true),
        }
    }

    pub fn is_signed_in(&self) -> bool {
        self.signed_in.load(Ordering::SeqCst)
    }

    pub fn ensure_signed_in(&self) -> Result<()> {
        if self.is_signed_in() {
            Ok(())
        } else {
            Err(MessagingError::SignedOut)
        }
    }

    /// Returns `true` if this call flipped the session to signed out.
    pub fn mark_signed_out(&self) -> bool {
        self.signed_in.swap(false, Ordering::SeqCst)
    }

    /// Mutate the unread set, emitting `UnreadChanged` when it changed.
    pub async fn update_unread(&self, f: impl FnOnce(&mut UnreadTracker) -> bool) -> bool {
        let senders = {
            let mut unread = self.unread.lock().await;
            if !f(&mut unread) {
                return false;
            }
            unread.senders()
        };
        debug!(count = senders.len(), "unread senders changed");
        self.events.emit(MessagingEvent::UnreadChanged { senders });
        true
    }

    /// Mark `counterparty`'s messages read, then drop their badge.
    pub async fn mark_read(&self, counterparty: &UserId) -> Result<usize> {
        let count = self.store.mark_read(counterparty).await?;
        self.update_unread(|unread| unread.remove(counterparty)).await;
        Ok(count)
    }

    /// Rebuild the unread set from the backend. The open, focused
    /// conversation is left out.
    pub async fn refresh_unread(&self) -> Result<usize> {
        let rows = bounded(self.config.request_timeout, self.backend.query_unread(&self.me))
            .await
            .map_err(|e| {
                warn!(user = %self.me, error = %e, "Failed to fetch unread messages");
                MessagingError::from(e)
            })?;

        let view = self.store.view().await;
        let senders: Vec<UserId> = rows
            .into_iter()
            .filter(|row| row.receiver_id == self.me && row.is_visible_to(&self.me))
            .map(|row| row.sender_id)
            .filter(|sender| !view.is_focused_on(sender))
            .collect();

        self.update_unread(|unread| unread.replace_all(senders)).await;
        Ok(self.unread.lock().await.count())
    }

    async fn route_global(&self, event: ChangeEvent) {
        let record = &event.record;
        if event.kind != ChangeKind::Insert
            || record.receiver_id != self.me
            || !record.is_visible_to(&self.me)
            || record.is_read
        {
            return;
        }

        let sender = &record.sender_id;
        let view = self.store.view().await;
        if should_mark_unread(view.is_open(), view.active.as_ref(), sender) {
            self.update_unread(|unread| unread.add(sender)).await;
        } else if view.focused {
            self.update_unread(|unread| unread.remove(sender)).await;
        }
    }

    async fn route_conversation(&self, scope: FeedScope, conversation: &ConversationId, event: ChangeEvent) {
        match scope {
            FeedScope::Inbound => {
                if event.kind != ChangeKind::Insert {
                    return;
                }
                let sender = event.record.sender_id.clone();
                let view = self.store.view().await;
                let action = disposition(&view, &sender);

                let scroll = action == Disposition::AppendAndScroll;
                if self.store.apply_change(conversation, &event, scroll).await.is_none() {
                    debug!(%conversation, message = %event.record.id, "event for inactive conversation ignored");
                    return;
                }

                if scroll {
                    if let Err(e) = self.mark_read(&sender).await {
                        warn!(%conversation, error = %e, "Failed to mark inbound message read");
                    }
                }
            }
            FeedScope::Own => {
                self.store.apply_change(conversation, &event, true).await;
            }
            FeedScope::Global => {}
        }
    }
}

#[async_trait]
impl ChangeSink for SessionContext {
    async fn on_change(&self, scope: FeedScope, conversation: Option<&ConversationId>, event: ChangeEvent) {
        if !self.is_signed_in() {
            return;
        }
        match (scope, conversation) {
            (FeedScope::Global, _) => self.route_global(event).await,
            (_, Some(conversation)) => self.route_conversation(scope, conversation, event).await,
            (_, None) => {}
        }
    }
}
