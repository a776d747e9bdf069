//! Change-feed subscriptions and their routing.
//!
//! The router keeps one global feed (inserts addressed to the signed-in
//! user, for badges) for the whole session, plus two feeds scoped to the open
//! conversation: inbound inserts from the counterparty and inserts/updates
//! on our own messages (multi-device echoes, read receipts). Conversation
//! feeds are always torn down before feeds for another conversation open.
//!
//! Each feed is drained by its own task, which validates the raw payload
//! and hands typed events to a [`ChangeSink`]. Tasks hold only a weak
//! reference to the sink, so they wind down with the session.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use campus_shared::backend::{ChangeFilter, SubscriptionId};
use campus_shared::protocol::ChangeEvent;
use campus_shared::{Backend, ConversationId, UserId};

use crate::error::{MessagingError, Result};
use crate::message_store::bounded;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterState {
    Closed,
    Subscribing(ConversationId),
    Active(ConversationId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedScope {
    /// Inserts from the counterparty to us.
    Inbound,
    /// Inserts and updates on rows we sent.
    Own,
    /// Inserts addressed to us, any sender.
    Global,
}

impl FeedScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Own => "own",
            Self::Global => "global",
        }
    }
}

/// Receiver of validated change events.
#[async_trait]
pub trait ChangeSink: Send + Sync + 'static {
    /// `conversation` is the conversation the feed was opened for, `None`
    /// for the global feed.
    async fn on_change(&self, scope: FeedScope, conversation: Option<&ConversationId>, event: ChangeEvent);
}

struct Feed {
    id: SubscriptionId,
    scope: FeedScope,
    task: JoinHandle<()>,
}

pub struct RealtimeRouter {
    me: UserId,
    backend: Arc<dyn Backend>,
    timeout: Duration,
    state: RouterState,
    conversation_feeds: Vec<Feed>,
    global_feed: Option<Feed>,
}

impl RealtimeRouter {
    pub fn new(me: UserId, backend: Arc<dyn Backend>, timeout: Duration) -> Self {
        Self {
            me,
            backend,
            timeout,
            state: RouterState::Closed,
            conversation_feeds: Vec::new(),
            global_feed: None,
        }
    }

    pub fn state(&self) -> &RouterState {
        &self.state
    }

    pub fn has_global_feed(&self) -> bool {
        self.global_feed.is_some()
    }

    /// Subscribe to inserts addressed to us. Idempotent.
    pub async fn start_global(&mut self, sink: Weak<dyn ChangeSink>) -> Result<()> {
        if self.global_feed.is_some() {
            return Ok(());
        }
        let filter = ChangeFilter::inserts().receiver(&self.me);
        let feed = self.open_feed(FeedScope::Global, None, filter, sink).await?;
        info!(user = %self.me, subscription = %feed.id, "global feed started");
        self.global_feed = Some(feed);
        Ok(())
    }

    /// Point the conversation feeds at `conversation`. Feeds for a previous
    /// conversation are closed first; reopening the active one is a no-op.
    pub async fn open(&mut self, conversation: ConversationId, sink: Weak<dyn ChangeSink>) -> Result<()> {
        if self.state == RouterState::Active(conversation.clone()) {
            return Ok(());
        }
        if self.state != RouterState::Closed {
            self.close().await;
        }

        let counterparty = conversation
            .counterparty(&self.me)
            .cloned()
            .ok_or_else(|| MessagingError::StaleConversation(conversation.clone()))?;

        self.state = RouterState::Subscribing(conversation.clone());

        let inbound = ChangeFilter::inserts()
            .sender(&counterparty)
            .receiver(&self.me);
        let own = ChangeFilter::inserts_and_updates()
            .sender(&self.me)
            .receiver(&counterparty);

        for (scope, filter) in [(FeedScope::Inbound, inbound), (FeedScope::Own, own)] {
            match self
                .open_feed(scope, Some(conversation.clone()), filter, sink.clone())
                .await
            {
                Ok(feed) => self.conversation_feeds.push(feed),
                Err(e) => {
                    warn!(%conversation, scope = scope.as_str(), error = %e, "Failed to subscribe");
                    self.close().await;
                    return Err(e);
                }
            }
        }

        debug!(%conversation, "conversation feeds active");
        self.state = RouterState::Active(conversation);
        Ok(())
    }

    /// Tear down the conversation feeds.
    pub async fn close(&mut self) {
        let feeds: Vec<Feed> = self.conversation_feeds.drain(..).collect();
        self.release(feeds).await;
        if self.state != RouterState::Closed {
            debug!(state = ?self.state, "conversation feeds closed");
        }
        self.state = RouterState::Closed;
    }

    /// Tear down every feed, global included.
    pub async fn shutdown(&mut self) {
        self.close().await;
        if let Some(feed) = self.global_feed.take() {
            self.release(vec![feed]).await;
        }
    }

    async fn open_feed(
        &self,
        scope: FeedScope,
        conversation: Option<ConversationId>,
        filter: ChangeFilter,
        sink: Weak<dyn ChangeSink>,
    ) -> Result<Feed> {
        let subscription = bounded(self.timeout, self.backend.subscribe(filter)).await?;
        let id = subscription.id;
        let task = tokio::spawn(pump(scope, conversation, subscription.events, sink));
        Ok(Feed { id, scope, task })
    }

    async fn release(&self, feeds: Vec<Feed>) {
        for feed in &feeds {
            feed.task.abort();
        }
        let unsubscribes = feeds.iter().map(|feed| async move {
            if let Err(e) = bounded(self.timeout, self.backend.unsubscribe(feed.id)).await {
                warn!(subscription = %feed.id, scope = feed.scope.as_str(), error = %e, "Failed to unsubscribe");
            }
        });
        futures::future::join_all(unsubscribes).await;
    }
}

impl Drop for RealtimeRouter {
    fn drop(&mut self) {
        for feed in self.conversation_feeds.iter().chain(self.global_feed.iter()) {
            feed.task.abort();
        }
    }
}

/// Drain one subscription, validating every payload at the boundary.
async fn pump(
    scope: FeedScope,
    conversation: Option<ConversationId>,
    mut events: mpsc::UnboundedReceiver<serde_json::Value>,
    sink: Weak<dyn ChangeSink>,
) {
    while let Some(payload) = events.recv().await {
        let event = match ChangeEvent::from_value(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(scope = scope.as_str(), error = %e, "Dropping malformed change event");
                continue;
            }
        };

        if let Some(conversation) = &conversation {
            if &event.record.conversation() != conversation {
                warn!(
                    scope = scope.as_str(),
                    %conversation,
                    message = %event.record.id,
                    "Dropping change event for another conversation"
                );
                continue;
            }
        }

        let Some(sink) = sink.upgrade() else {
            break;
        };
        sink.on_change(scope, conversation.as_ref(), event).await;
    }

    debug!(scope = scope.as_str(), "change feed ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use campus_shared::protocol::{ChangeKind, NewMessage};
    use campus_store::LocalBackend;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(FeedScope, Option<ConversationId>, ChangeKind)>>,
    }

    #[async_trait]
    impl ChangeSink for Recorder {
        async fn on_change(&self, scope: FeedScope, conversation: Option<&ConversationId>, event: ChangeEvent) {
            self.seen
                .lock()
                .await
                .push((scope, conversation.cloned(), event.kind));
        }
    }

    fn router(backend: &LocalBackend, me: &str) -> RealtimeRouter {
        RealtimeRouter::new(UserId::from(me), Arc::new(backend.clone()), Duration::from_secs(5))
    }

    fn message(from: &str, to: &str) -> NewMessage {
        NewMessage {
            sender_id: UserId::from(from),
            receiver_id: UserId::from(to),
            content: "v1:x".into(),
            client_id: None,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn switching_conversations_unsubscribes_first() {
        let backend = LocalBackend::in_memory().unwrap();
        let sink = Arc::new(Recorder::default());
        let weak: Weak<dyn ChangeSink> = Arc::downgrade(&sink) as Weak<dyn ChangeSink>;
        let mut router = router(&backend, "u1");

        let with_u2 = ConversationId::new(&UserId::from("u1"), &UserId::from("u2"));
        let with_u3 = ConversationId::new(&UserId::from("u1"), &UserId::from("u3"));

        router.open(with_u2.clone(), weak.clone()).await.unwrap();
        assert_eq!(router.state(), &RouterState::Active(with_u2.clone()));
        assert_eq!(backend.feed().subscriber_count(), 2);

        router.open(with_u3.clone(), weak.clone()).await.unwrap();
        assert_eq!(router.state(), &RouterState::Active(with_u3.clone()));
        assert_eq!(backend.feed().subscriber_count(), 2);

        backend.insert_message(&message("u2", "u1")).await.unwrap();
        backend.insert_message(&message("u3", "u1")).await.unwrap();
        settle().await;

        let seen = sink.seen.lock().await.clone();
        assert_eq!(seen, vec![(FeedScope::Inbound, Some(with_u3), ChangeKind::Insert)]);
    }

    #[tokio::test]
    async fn global_feed_sees_every_sender() {
        let backend = LocalBackend::in_memory().unwrap();
        let sink = Arc::new(Recorder::default());
        let weak: Weak<dyn ChangeSink> = Arc::downgrade(&sink) as Weak<dyn ChangeSink>;
        let mut router = router(&backend, "u1");

        router.start_global(weak.clone()).await.unwrap();
        router.start_global(weak).await.unwrap();
        assert_eq!(backend.feed().subscriber_count(), 1);

        backend.insert_message(&message("u2", "u1")).await.unwrap();
        backend.insert_message(&message("u3", "u1")).await.unwrap();
        backend.insert_message(&message("u1", "u3")).await.unwrap();
        settle().await;

        let scopes: Vec<FeedScope> = sink.seen.lock().await.iter().map(|s| s.0).collect();
        assert_eq!(scopes, [FeedScope::Global, FeedScope::Global]);
    }

    #[tokio::test]
    async fn own_feed_sees_read_receipts() {
        let backend = LocalBackend::in_memory().unwrap();
        let sink = Arc::new(Recorder::default());
        let weak: Weak<dyn ChangeSink> = Arc::downgrade(&sink) as Weak<dyn ChangeSink>;
        let mut router = router(&backend, "u1");
        let conversation = ConversationId::new(&UserId::from("u1"), &UserId::from("u2"));
        router.open(conversation, weak).await.unwrap();

        backend.insert_message(&message("u1", "u2")).await.unwrap();
        let filter = campus_shared::backend::MessageFilter::directed(&UserId::from("u1"), &UserId::from("u2"));
        backend
            .update_messages(&filter, &campus_shared::backend::MessagePatch::read_at(chrono::Utc::now()))
            .await
            .unwrap();
        settle().await;

        let kinds: Vec<(FeedScope, ChangeKind)> =
            sink.seen.lock().await.iter().map(|s| (s.0, s.2)).collect();
        assert_eq!(
            kinds,
            [(FeedScope::Own, ChangeKind::Insert), (FeedScope::Own, ChangeKind::Update)]
        );
    }

    #[tokio::test]
    async fn shutdown_releases_everything() {
        let backend = LocalBackend::in_memory().unwrap();
        let sink = Arc::new(Recorder::default());
        let weak: Weak<dyn ChangeSink> = Arc::downgrade(&sink) as Weak<dyn ChangeSink>;
        let mut router = router(&backend, "u1");

        router.start_global(weak.clone()).await.unwrap();
        router
            .open(ConversationId::new(&UserId::from("u1"), &UserId::from("u2")), weak)
            .await
            .unwrap();
        assert_eq!(backend.feed().subscriber_count(), 3);

        router.shutdown().await;
        assert_eq!(router.state(), &RouterState::Closed);
        assert!(!router.has_global_feed());
        assert_eq!(backend.feed().subscriber_count(), 0);
    }

    #[tokio::test]
    async fn malformed_payloads_are_dropped() {
        let sink = Arc::new(Recorder::default());
        let weak: Weak<dyn ChangeSink> = Arc::downgrade(&sink) as Weak<dyn ChangeSink>;
        let (tx, rx) = mpsc::unbounded_channel();

        tx.send(serde_json::json!({ "type": "INSERT", "table": "messages" })).unwrap();
        tx.send(serde_json::json!("garbage")).unwrap();
        drop(tx);

        pump(FeedScope::Global, None, rx, weak).await;
        assert!(sink.seen.lock().await.is_empty());
    }

    #[tokio::test]
    async fn conversation_outside_pair_is_rejected() {
        let backend = LocalBackend::in_memory().unwrap();
        let sink = Arc::new(Recorder::default());
        let weak: Weak<dyn ChangeSink> = Arc::downgrade(&sink) as Weak<dyn ChangeSink>;
        let mut router = router(&backend, "u1");

        let foreign = ConversationId::new(&UserId::from("u2"), &UserId::from("u3"));
        assert!(router.open(foreign, weak).await.is_err());
        assert_eq!(router.state(), &RouterState::Closed);
    }
}
