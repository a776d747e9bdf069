//! Backend-facing operations on the open conversation.
//!
//! [`MessageStore`] owns the active [`ConversationState`]. Every async
//! completion re-checks that the conversation it started for is still the
//! active one before touching state; the lock is never held across a
//! backend call.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use campus_shared::backend::{MessageFilter, MessagePatch, MessageQuery};
use campus_shared::crypto;
use campus_shared::protocol::{ChangeEvent, ChangeKind, MessageRow, NewMessage};
use campus_shared::{Backend, BackendError, ClientMessageId, ConversationId, MessageId, UserId};

use crate::config::{ClearPolicy, MessagingConfig};
use crate::conversation::{Applied, ConversationState, LocalMessage};
use crate::coordination::ViewState;
use crate::error::{MessagingError, Result};
use crate::events::{EventSink, MessagingEvent};

/// Run a backend call with an upper bound on its duration.
pub(crate) async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = std::result::Result<T, BackendError>>,
) -> std::result::Result<T, BackendError> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Timeout(limit)),
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSnapshot {
    pub conversation: ConversationId,
    pub counterparty: UserId,
    pub messages: Vec<LocalMessage>,
    pub first_unread: Option<MessageId>,
    pub loaded: bool,
    pub focused: bool,
}

impl ConversationSnapshot {
    fn of(state: &ConversationState) -> Self {
        Self {
            conversation: state.conversation().clone(),
            counterparty: state.counterparty().clone(),
            messages: state.messages().to_vec(),
            first_unread: state.first_unread(),
            loaded: state.is_loaded(),
            focused: state.is_focused(),
        }
    }
}

/// Proof that the user confirmed a clear. Only valid for the conversation
/// it was issued for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClearConfirmation {
    conversation: ConversationId,
    counterparty: UserId,
    policy: ClearPolicy,
}

impl ClearConfirmation {
    pub fn conversation(&self) -> &ConversationId {
        &self.conversation
    }

    pub fn policy(&self) -> ClearPolicy {
        self.policy
    }

    /// Whether the other participant loses their copy too.
    pub fn affects_counterparty(&self) -> bool {
        self.policy == ClearPolicy::Bilateral
    }
}

pub struct MessageStore {
    me: UserId,
    backend: Arc<dyn Backend>,
    config: MessagingConfig,
    events: EventSink,
    state: Mutex<Option<ConversationState>>,
    generation: AtomicU64,
}

impl MessageStore {
    pub fn new(
        me: UserId,
        backend: Arc<dyn Backend>,
        config: MessagingConfig,
        events: EventSink,
    ) -> Self {
        Self {
            me,
            backend,
            config,
            events,
            state: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Make `counterparty` the active conversation with an empty, unloaded
    /// state. Returns the generation later completions are checked against.
    pub async fn begin_open(&self, counterparty: &UserId) -> (ConversationId, u64) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let state = ConversationState::new(
            self.me.clone(),
            counterparty.clone(),
            generation,
            &self.config,
        );
        let conversation = state.conversation().clone();
        *self.state.lock().await = Some(state);

        let key = crypto::key_fingerprint(&crypto::derive_conversation_key(&self.me, counterparty));
        debug!(%conversation, generation, %key, "conversation opened");
        (conversation, generation)
    }

    /// Fetch the visible history for the conversation opened at `generation`.
    ///
    /// A failed fetch leaves the current list untouched.
    pub async fn load(&self, generation: u64) -> Result<ConversationSnapshot> {
        let query = {
            let mut guard = self.state.lock().await;
            let state = self.current(&mut guard, generation)?;
            state.begin_fetch();
            MessageQuery {
                conversation: state.conversation().clone(),
                viewer: self.me.clone(),
                since: self.config.history_floor(Utc::now()),
                limit: self.config.page_size,
            }
        };

        let rows = match bounded(self.config.request_timeout, self.backend.query_messages(&query)).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(conversation = %query.conversation, error = %e, "Failed to fetch messages");
                return Err(e.into());
            }
        };

        let mut guard = self.state.lock().await;
        let state = self.current(&mut guard, generation)?;
        state.replace_snapshot(&rows);
        let snapshot = ConversationSnapshot::of(state);
        drop(guard);

        debug!(
            conversation = %snapshot.conversation,
            fetched = rows.len(),
            visible = snapshot.messages.len(),
            "conversation loaded"
        );
        self.events.emit(MessagingEvent::ConversationLoaded {
            conversation: snapshot.conversation.clone(),
            count: snapshot.messages.len(),
            first_unread: snapshot.first_unread,
        });
        Ok(snapshot)
    }

    /// Refetch the active conversation.
    pub async fn reload(&self) -> Result<ConversationSnapshot> {
        let generation = self
            .state
            .lock()
            .await
            .as_ref()
            .map(ConversationState::generation)
            .ok_or(MessagingError::NoActiveConversation)?;
        self.load(generation).await
    }

    pub async fn close(&self) -> Option<ConversationId> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let closed = self.state.lock().await.take();
        closed.map(|state| state.conversation().clone())
    }

    /// Close only if the conversation opened at `generation` is still the
    /// active one.
    pub async fn close_opened(&self, generation: u64) -> Option<ConversationId> {
        let mut guard = self.state.lock().await;
        if guard.as_ref().map(ConversationState::generation) != Some(generation) {
            return None;
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        guard.take().map(|state| state.conversation().clone())
    }

    pub async fn active(&self) -> Option<ConversationId> {
        self.state
            .lock()
            .await
            .as_ref()
            .map(|state| state.conversation().clone())
    }

    pub async fn view(&self) -> ViewState {
        match self.state.lock().await.as_ref() {
            Some(state) => ViewState {
                active: Some(state.counterparty().clone()),
                focused: state.is_focused(),
            },
            None => ViewState::default(),
        }
    }

    pub async fn snapshot(&self) -> Option<ConversationSnapshot> {
        self.state.lock().await.as_ref().map(ConversationSnapshot::of)
    }

    /// Returns the counterparty when an open conversation regains focus.
    pub async fn set_focused(&self, focused: bool) -> Option<UserId> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut()?;
        let changed = state.set_focused(focused);
        (changed && focused).then(|| state.counterparty().clone())
    }

    /// Optimistically append `plaintext`, then seal and submit it.
    pub async fn send(&self, plaintext: &str) -> Result<LocalMessage> {
        if plaintext.trim().is_empty() {
            return Err(MessagingError::EmptyMessage);
        }

        let (conversation, counterparty, pending) = {
            let mut guard = self.state.lock().await;
            let state = guard.as_mut().ok_or(MessagingError::NoActiveConversation)?;
            let pending = state.push_pending(plaintext, Utc::now());
            (
                state.conversation().clone(),
                state.counterparty().clone(),
                pending,
            )
        };
        let client_id = pending.client_id.unwrap_or_default();

        self.events.emit(MessagingEvent::MessageAppended {
            conversation: conversation.clone(),
            message: pending,
            scroll: true,
        });

        self.submit(conversation, counterparty, client_id, plaintext).await
    }

    /// Re-submit a failed message under its original correlation id.
    pub async fn retry(&self, client_id: ClientMessageId) -> Result<LocalMessage> {
        let (conversation, counterparty, body) = {
            let mut guard = self.state.lock().await;
            let state = guard.as_mut().ok_or(MessagingError::NoActiveConversation)?;
            let body = state
                .retry(client_id, Utc::now())
                .ok_or(MessagingError::UnknownMessage(client_id))?;
            (
                state.conversation().clone(),
                state.counterparty().clone(),
                body,
            )
        };
        debug!(%conversation, %client_id, "retrying send");
        self.submit(conversation, counterparty, client_id, &body).await
    }

    pub async fn discard_failed(&self, client_id: ClientMessageId) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or(MessagingError::NoActiveConversation)?;
        if state.discard(client_id) {
            Ok(())
        } else {
            Err(MessagingError::UnknownMessage(client_id))
        }
    }

    async fn submit(
        &self,
        conversation: ConversationId,
        counterparty: UserId,
        client_id: ClientMessageId,
        plaintext: &str,
    ) -> Result<LocalMessage> {
        let sealed = crypto::seal_body(plaintext, &self.me, &counterparty);
        let outcome = match sealed {
            Ok(content) => {
                let message = NewMessage {
                    sender_id: self.me.clone(),
                    receiver_id: counterparty,
                    content,
                    client_id: Some(client_id),
                };
                bounded(self.config.request_timeout, self.backend.insert_message(&message))
                    .await
                    .map_err(MessagingError::from)
            }
            Err(e) => Err(e.into()),
        };

        match outcome {
            Ok(row) => {
                let confirmed = {
                    let mut guard = self.state.lock().await;
                    match guard.as_mut() {
                        Some(state) if state.conversation() == &conversation => {
                            Some(state.confirm(client_id, &row))
                        }
                        _ => None,
                    }
                };
                info!(%conversation, message = %row.id, %client_id, "message sent");
                match confirmed {
                    Some(Some(message)) => {
                        self.events.emit(MessagingEvent::MessageConfirmed {
                            conversation,
                            client_id,
                            message: message.clone(),
                        });
                        Ok(message)
                    }
                    Some(None) => {
                        debug!(%conversation, message = %row.id, "sent message already cleared");
                        self.events.emit(MessagingEvent::MessageRemoved {
                            conversation,
                            id: row.id,
                            client_id: Some(client_id),
                        });
                        Ok(LocalMessage::from_row(&row))
                    }
                    None => Ok(LocalMessage::from_row(&row)),
                }
            }
            Err(e) => {
                warn!(%conversation, %client_id, error = %e, "send failed");
                self.fail(&conversation, client_id, &e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn fail(&self, conversation: &ConversationId, client_id: ClientMessageId, reason: &str) {
        let failed = {
            let mut guard = self.state.lock().await;
            match guard.as_mut() {
                Some(state) if state.conversation() == conversation => state.fail(client_id, reason),
                _ => false,
            }
        };
        if failed {
            self.events.emit(MessagingEvent::MessageFailed {
                conversation: conversation.clone(),
                client_id,
                reason: reason.to_string(),
            });
        }
    }

    /// Flag sends that never got confirmed as failed.
    pub async fn sweep_pending(&self) -> Vec<ClientMessageId> {
        let (conversation, swept) = {
            let mut guard = self.state.lock().await;
            let Some(state) = guard.as_mut() else {
                return Vec::new();
            };
            let swept = state.sweep_stale(Utc::now(), self.config.reconcile_timeout);
            (state.conversation().clone(), swept)
        };

        for client_id in &swept {
            let reason = MessagingError::StateConflict(*client_id).to_string();
            warn!(%conversation, %client_id, "send was never confirmed");
            self.events.emit(MessagingEvent::MessageFailed {
                conversation: conversation.clone(),
                client_id: *client_id,
                reason,
            });
        }
        swept
    }

    /// Mark everything `counterparty` sent us as read. Matches rows that are
    /// not read yet (including a null legacy flag), so repeated calls are
    /// harmless and leave `read_at` alone.
    pub async fn mark_read(&self, counterparty: &UserId) -> Result<usize> {
        let filter = MessageFilter::directed(counterparty, &self.me)
            .not_read()
            .not_deleted_by_receiver();
        let patch = MessagePatch::read_at(Utc::now());

        let updated = bounded(
            self.config.request_timeout,
            self.backend.update_messages(&filter, &patch),
        )
        .await
        .map_err(|e| {
            warn!(counterparty = %counterparty, error = %e, "Failed to mark messages read");
            MessagingError::from(e)
        })?;

        let (conversation, changed) = {
            let mut guard = self.state.lock().await;
            match guard.as_mut() {
                Some(state) if state.counterparty() == counterparty => (
                    Some(state.conversation().clone()),
                    state.merge_read_rows(&updated),
                ),
                _ => (None, Vec::new()),
            }
        };
        if let Some(conversation) = conversation {
            for message in changed {
                self.events.emit(MessagingEvent::MessageUpdated {
                    conversation: conversation.clone(),
                    message,
                });
            }
        }

        if !updated.is_empty() {
            debug!(counterparty = %counterparty, count = updated.len(), "messages marked read");
        }
        Ok(updated.len())
    }

    pub async fn request_clear(&self) -> Result<ClearConfirmation> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(MessagingError::NoActiveConversation)?;
        Ok(ClearConfirmation {
            conversation: state.conversation().clone(),
            counterparty: state.counterparty().clone(),
            policy: self.config.clear_policy,
        })
    }

    /// Soft-delete the conversation under the confirmed policy. Returns the
    /// number of rows updated.
    pub async fn clear_conversation(&self, confirmation: ClearConfirmation) -> Result<usize> {
        let ClearConfirmation {
            conversation,
            counterparty,
            policy,
        } = confirmation;

        if self.active().await.as_ref() != Some(&conversation) {
            return Err(MessagingError::StaleConversation(conversation));
        }

        let limit = self.config.request_timeout;
        let result = match policy {
            ClearPolicy::PerSide => {
                let sent = MessageFilter::directed(&self.me, &counterparty);
                let received = MessageFilter::directed(&counterparty, &self.me);
                let sender_patch = MessagePatch::deleted_by_sender();
                let receiver_patch = MessagePatch::deleted_by_receiver();
                futures::try_join!(
                    bounded(limit, self.backend.update_messages(&sent, &sender_patch)),
                    bounded(limit, self.backend.update_messages(&received, &receiver_patch)),
                )
                .map(|(mut sent, received)| {
                    sent.extend(received);
                    sent
                })
            }
            ClearPolicy::Bilateral => {
                let all = MessageFilter::conversation(conversation.clone());
                bounded(
                    limit,
                    self.backend
                        .update_messages(&all, &MessagePatch::deleted_by_both()),
                )
                .await
            }
        };

        let rows = match result {
            Ok(rows) => rows,
            Err(e) => {
                warn!(%conversation, policy = policy.as_str(), error = %e, "Failed to clear conversation");
                return Err(e.into());
            }
        };

        let count = rows.len();
        let through = rows.iter().map(|row| row.id).max();
        {
            let mut guard = self.state.lock().await;
            if let Some(state) = guard.as_mut().filter(|s| s.conversation() == &conversation) {
                state.clear(through);
            }
        }

        info!(%conversation, policy = policy.as_str(), count, "conversation cleared");
        self.events.emit(MessagingEvent::ConversationCleared {
            conversation,
            policy,
        });
        Ok(count)
    }

    /// Apply a feed event tagged for `conversation`. Returns `None` when that
    /// conversation is no longer the active one.
    pub async fn apply_change(
        &self,
        conversation: &ConversationId,
        event: &ChangeEvent,
        scroll: bool,
    ) -> Option<Applied> {
        let applied = {
            let mut guard = self.state.lock().await;
            let state = guard.as_mut().filter(|s| s.conversation() == conversation)?;
            match event.kind {
                ChangeKind::Insert => state.apply_insert(&event.record),
                ChangeKind::Update => state.apply_update(&event.record),
            }
        };

        let conversation = conversation.clone();
        match &applied {
            Applied::Inserted(message) => self.events.emit(MessagingEvent::MessageAppended {
                conversation,
                message: message.clone(),
                scroll,
            }),
            Applied::Reconciled(message) => {
                if let Some(client_id) = message.client_id {
                    self.events.emit(MessagingEvent::MessageConfirmed {
                        conversation,
                        client_id,
                        message: message.clone(),
                    });
                }
            }
            Applied::Updated(message) => self.events.emit(MessagingEvent::MessageUpdated {
                conversation,
                message: message.clone(),
            }),
            Applied::Removed { id, client_id } => self.events.emit(MessagingEvent::MessageRemoved {
                conversation,
                id: *id,
                client_id: *client_id,
            }),
            Applied::Unchanged => {}
        }
        Some(applied)
    }

    fn current<'a>(
        &self,
        guard: &'a mut Option<ConversationState>,
        generation: u64,
    ) -> Result<&'a mut ConversationState> {
        match guard.as_mut() {
            Some(state) if state.generation() == generation => Ok(state),
            Some(state) => Err(MessagingError::StaleConversation(state.conversation().clone())),
            None => Err(MessagingError::NoActiveConversation),
        }
    }
}
