//! Embedded implementation of the backend contract.
//!
//! [`LocalBackend`] serves the relational operations from a SQLite
//! [`Database`] and publishes committed message changes on a [`ChangeFeed`].
//! It stands in for the hosted service in tests and local development.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use campus_shared::backend::{
    Backend, ChangeFilter, MessageFilter, MessagePatch, MessageQuery, Subscription,
    SubscriptionId,
};
use campus_shared::protocol::{ChangeKind, FriendshipRow, MessageRow, NewMessage, Profile};
use campus_shared::{BackendError, FriendshipStatus, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::feed::ChangeFeed;

#[derive(Clone)]
pub struct LocalBackend {
    db: Arc<Mutex<Database>>,
    feed: Arc<ChangeFeed>,
}

impl LocalBackend {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            feed: Arc::new(ChangeFeed::new()),
        }
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    pub fn open_at(path: &Path) -> Result<Self> {
        Ok(Self::new(Database::open_at(path)?))
    }

    /// Synchronous access to the underlying database, for seeding the
    /// relations the messaging core never writes (profiles, friendships).
    pub fn with_database<T>(&self, f: impl FnOnce(&mut Database) -> Result<T>) -> Result<T> {
        let mut db = self.lock()?;
        f(&mut db)
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    fn lock(&self) -> Result<MutexGuard<'_, Database>> {
        self.db.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn query_messages(&self, query: &MessageQuery) -> std::result::Result<Vec<MessageRow>, BackendError> {
        let rows = self.lock()?.query_conversation(query)?;
        debug!(
            conversation = %query.conversation,
            viewer = %query.viewer,
            count = rows.len(),
            "query_messages"
        );
        Ok(rows)
    }

    async fn query_unread(&self, receiver: &UserId) -> std::result::Result<Vec<MessageRow>, BackendError> {
        Ok(self.lock()?.query_unread_for(receiver)?)
    }

    async fn insert_message(&self, message: &NewMessage) -> std::result::Result<MessageRow, BackendError> {
        if message.sender_id == message.receiver_id {
            return Err(BackendError::Rejected("sender and receiver must differ".into()));
        }

        let inserted = self.lock()?.insert_message(message, Utc::now())?;

        if inserted.created {
            info!(
                message = %inserted.row.id,
                sender = %inserted.row.sender_id,
                receiver = %inserted.row.receiver_id,
                "message stored"
            );
            self.feed.publish(ChangeKind::Insert, &inserted.row);
        } else {
            debug!(message = %inserted.row.id, "duplicate insert resolved by client_id");
        }

        Ok(inserted.row)
    }

    async fn update_messages(
        &self,
        filter: &MessageFilter,
        patch: &MessagePatch,
    ) -> std::result::Result<Vec<MessageRow>, BackendError> {
        let updated = self.lock()?.update_messages(filter, patch)?;

        debug!(count = updated.len(), ?patch, "messages updated");
        for row in &updated {
            self.feed.publish(ChangeKind::Update, row);
        }
        Ok(updated)
    }

    async fn query_friendships(
        &self,
        user: &UserId,
        status: FriendshipStatus,
    ) -> std::result::Result<Vec<FriendshipRow>, BackendError> {
        Ok(self.lock()?.friendships_for(user, status)?)
    }

    async fn fetch_profiles(&self, ids: &[UserId]) -> std::result::Result<Vec<Profile>, BackendError> {
        Ok(self.lock()?.profiles_by_ids(ids)?)
    }

    async fn subscribe(&self, filter: ChangeFilter) -> std::result::Result<Subscription, BackendError> {
        Ok(self.feed.subscribe(filter))
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> std::result::Result<(), BackendError> {
        self.feed.unsubscribe(id);
        Ok(())
    }
}
