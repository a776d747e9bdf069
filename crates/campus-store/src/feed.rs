//! In-process change feed.
//!
//! Keeps a registry of subscriptions (filter + sender half of an unbounded
//! channel). Writers publish committed rows; every subscription whose filter
//! matches receives the event as raw JSON, the same shape a hosted feed
//! would deliver.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use campus_shared::backend::{ChangeFilter, Subscription, SubscriptionId};
use campus_shared::protocol::{ChangeEvent, ChangeKind, MessageRow};

struct Subscriber {
    filter: ChangeFilter,
    tx: mpsc::UnboundedSender<serde_json::Value>,
}

#[derive(Default)]
pub struct ChangeFeed {
    next_id: AtomicU64,
    subscribers: Mutex<BTreeMap<SubscriptionId, Subscriber>>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, filter: ChangeFilter) -> Subscription {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = mpsc::unbounded_channel();

        debug!(subscription = %id, ?filter, "change feed subscription added");
        self.lock().insert(id, Subscriber { filter, tx });

        Subscription { id, events: rx }
    }

    /// Returns `true` if the subscription existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.lock().remove(&id).is_some();
        if removed {
            debug!(subscription = %id, "change feed subscription removed");
        }
        removed
    }

    /// Fan a committed change out to matching subscribers. Subscribers whose
    /// receiver was dropped are pruned.
    pub fn publish(&self, kind: ChangeKind, record: &MessageRow) {
        let event = ChangeEvent {
            kind,
            commit_timestamp: Utc::now(),
            record: record.clone(),
            old_record: None,
        };
        let payload = event.to_value();

        let mut subscribers = self.lock();
        subscribers.retain(|id, sub| {
            if !sub.filter.matches(kind, record) {
                return !sub.tx.is_closed();
            }
            trace!(subscription = %id, message = %record.id, kind = kind.as_str(), "delivering change");
            sub.tx.send(payload.clone()).is_ok()
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<SubscriptionId, Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
