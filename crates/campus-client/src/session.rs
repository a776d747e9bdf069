//! The signed-in user's messaging session.
//!
//! A [`Session`] is the explicit context every messaging operation goes
//! through. It owns the realtime subscriptions, the open conversation, the
//! unread badges and the event stream; signing out (or dropping the last
//! handle) tears all of it down.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use campus_shared::protocol::Profile;
use campus_shared::{Backend, ClientMessageId, UserId};

use crate::config::MessagingConfig;
use crate::conversation::LocalMessage;
use crate::conversation_index::ConversationSummary;
use crate::error::{MessagingError, Result};
use crate::events::MessagingEvent;
use crate::message_store::{ClearConfirmation, ConversationSnapshot};
use crate::realtime::{ChangeSink, RealtimeRouter, RouterState};
use crate::state::SessionContext;

struct SessionInner {
    ctx: Arc<SessionContext>,
    router: Mutex<RealtimeRouter>,
    sweeper: JoinHandle<()>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

/// Cheap to clone; all clones share one session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Start a session for `me`: subscribe to the global feed and load the
    /// unread badges. A failed badge load is logged, not fatal.
    pub async fn sign_in(me: UserId, backend: Arc<dyn Backend>, config: MessagingConfig) -> Result<Self> {
        let ctx = Arc::new(SessionContext::new(me.clone(), backend.clone(), config));

        let mut router = RealtimeRouter::new(me.clone(), backend, ctx.config.request_timeout);
        router.start_global(sink(&ctx)).await?;

        let sweep_every = (ctx.config.reconcile_timeout / 2).max(Duration::from_secs(1));
        let sweeper = spawn_sweeper(Arc::downgrade(&ctx), sweep_every);

        let session = Self {
            inner: Arc::new(SessionInner {
                ctx,
                router: Mutex::new(router),
                sweeper,
            }),
        };

        if let Err(e) = session.inner.ctx.refresh_unread().await {
            warn!(user = %me, error = %e, "Unread badges unavailable at sign-in");
        }

        info!(user = %me, "messaging session started");
        Ok(session)
    }

    pub fn me(&self) -> &UserId {
        &self.ctx().me
    }

    pub fn config(&self) -> &MessagingConfig {
        &self.ctx().config
    }

    pub fn is_signed_in(&self) -> bool {
        self.ctx().is_signed_in()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<MessagingEvent> {
        self.ctx().events.subscribe()
    }

    /// Open the conversation with `counterparty`: switch the realtime feeds,
    /// fetch its history, and mark it read (a new conversation opens focused).
    pub async fn open_conversation(&self, counterparty: &UserId) -> Result<ConversationSnapshot> {
        let ctx = self.ctx();
        ctx.ensure_signed_in()?;
        if counterparty == &ctx.me {
            return Err(MessagingError::SelfConversation);
        }

        let (conversation, generation) = ctx.store.begin_open(counterparty).await;
        ctx.update_unread(|unread| unread.remove(counterparty)).await;

        {
            let mut router = self.inner.router.lock().await;
            // A newer open may have overtaken us while we waited for the lock.
            if ctx.store.active().await.as_ref() != Some(&conversation) {
                return Err(MessagingError::StaleConversation(conversation));
            }
            if let Err(e) = router.open(conversation.clone(), sink(ctx)).await {
                ctx.store.close_opened(generation).await;
                return Err(e);
            }
        }

        let snapshot = ctx.store.load(generation).await?;

        if let Err(e) = ctx.mark_read(counterparty).await {
            warn!(%conversation, error = %e, "Failed to mark conversation read on open");
        }
        Ok(ctx.store.snapshot().await.unwrap_or(snapshot))
    }

    /// Refetch the open conversation.
    pub async fn reload(&self) -> Result<ConversationSnapshot> {
        self.ctx().ensure_signed_in()?;
        self.ctx().store.reload().await
    }

    /// Close the open conversation. Badges are rebuilt afterwards: messages
    /// that arrived while it was open but unfocused were never counted.
    pub async fn close_conversation(&self) {
        let ctx = self.ctx();
        self.inner.router.lock().await.close().await;
        let Some(conversation) = ctx.store.close().await else {
            return;
        };
        debug!(%conversation, "conversation closed");
        if !ctx.is_signed_in() {
            return;
        }
        if let Err(e) = ctx.refresh_unread().await {
            warn!(%conversation, error = %e, "Failed to rebuild unread badges on close");
        }
    }

    pub async fn snapshot(&self) -> Option<ConversationSnapshot> {
        self.ctx().store.snapshot().await
    }

    pub async fn router_state(&self) -> RouterState {
        self.inner.router.lock().await.state().clone()
    }

    pub async fn send(&self, plaintext: &str) -> Result<LocalMessage> {
        self.ctx().ensure_signed_in()?;
        self.ctx().store.send(plaintext).await
    }

    pub async fn retry_send(&self, client_id: ClientMessageId) -> Result<LocalMessage> {
        self.ctx().ensure_signed_in()?;
        self.ctx().store.retry(client_id).await
    }

    pub async fn discard_failed(&self, client_id: ClientMessageId) -> Result<()> {
        self.ctx().store.discard_failed(client_id).await
    }

    /// Flag sends still unconfirmed after the reconcile timeout. Also runs
    /// periodically in the background.
    pub async fn sweep_pending(&self) -> Vec<ClientMessageId> {
        self.ctx().store.sweep_pending().await
    }

    pub async fn mark_read(&self, counterparty: &UserId) -> Result<usize> {
        self.ctx().ensure_signed_in()?;
        self.ctx().mark_read(counterparty).await
    }

    /// First half of "clear chat": returns the token the caller shows the
    /// user before [`clear_conversation`](Self::clear_conversation).
    pub async fn request_clear(&self) -> Result<ClearConfirmation> {
        self.ctx().ensure_signed_in()?;
        self.ctx().store.request_clear().await
    }

    pub async fn clear_conversation(&self, confirmation: ClearConfirmation) -> Result<usize> {
        let ctx = self.ctx();
        ctx.ensure_signed_in()?;
        let counterparty = confirmation
            .conversation()
            .counterparty(&ctx.me)
            .cloned();
        let count = ctx.store.clear_conversation(confirmation).await?;
        if let Some(counterparty) = counterparty {
            ctx.update_unread(|unread| unread.remove(&counterparty)).await;
        }
        Ok(count)
    }

    /// Focus changes of the open conversation. Regaining focus marks it read.
    pub async fn set_focused(&self, focused: bool) -> Result<()> {
        let ctx = self.ctx();
        ctx.ensure_signed_in()?;
        if let Some(counterparty) = ctx.store.set_focused(focused).await {
            ctx.mark_read(&counterparty).await?;
        }
        Ok(())
    }

    pub async fn refresh_unread(&self) -> Result<usize> {
        self.ctx().ensure_signed_in()?;
        self.ctx().refresh_unread().await
    }

    pub async fn unread_count(&self) -> usize {
        self.ctx().unread.lock().await.count()
    }

    pub async fn unread_senders(&self) -> Vec<UserId> {
        self.ctx().unread.lock().await.senders()
    }

    pub async fn list_friends(&self, refresh: bool) -> Result<Vec<Profile>> {
        self.ctx().ensure_signed_in()?;
        self.ctx().index.list_friends(refresh).await
    }

    /// Friend list joined with unread badges.
    pub async fn conversations(&self) -> Result<Vec<ConversationSummary>> {
        let ctx = self.ctx();
        ctx.ensure_signed_in()?;
        let unread = ctx.unread.lock().await.clone();
        ctx.index.summaries(&unread, false).await
    }

    /// Friendship changes are owned elsewhere; this drops the cached list.
    pub async fn friendships_changed(&self) {
        self.ctx().index.invalidate().await;
    }

    /// Tear down subscriptions and reset all session state. Idempotent.
    pub async fn sign_out(&self) {
        let ctx = self.ctx();
        if !ctx.mark_signed_out() {
            return;
        }
        self.inner.sweeper.abort();
        self.inner.router.lock().await.shutdown().await;
        ctx.store.close().await;
        ctx.unread.lock().await.clear();
        ctx.index.invalidate().await;

        info!(user = %ctx.me, "messaging session ended");
        ctx.events.emit(MessagingEvent::SignedOut);
    }

    fn ctx(&self) -> &Arc<SessionContext> {
        &self.inner.ctx
    }
}

fn sink(ctx: &Arc<SessionContext>) -> Weak<dyn ChangeSink> {
    Arc::downgrade(ctx) as Weak<dyn ChangeSink>
}

fn spawn_sweeper(ctx: Weak<SessionContext>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(ctx) = ctx.upgrade() else {
                break;
            };
            if !ctx.is_signed_in() {
                break;
            }
            ctx.store.sweep_pending().await;
        }
    })
}
