//! Set of senders with at least one unread, undeleted message for the
//! signed-in user. Drives badge counts, independent of the open conversation.

use std::collections::BTreeSet;

use campus_shared::UserId;

#[derive(Debug, Default, Clone)]
pub struct UnreadTracker {
    senders: BTreeSet<UserId>,
}

impl UnreadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the sender was not already tracked.
    pub fn add(&mut self, sender: &UserId) -> bool {
        self.senders.insert(sender.clone())
    }

    /// Returns `true` if the sender was tracked.
    pub fn remove(&mut self, sender: &UserId) -> bool {
        self.senders.remove(sender)
    }

    pub fn count(&self) -> usize {
        self.senders.len()
    }

    pub fn contains(&self, sender: &UserId) -> bool {
        self.senders.contains(sender)
    }

    pub fn senders(&self) -> Vec<UserId> {
        self.senders.iter().cloned().collect()
    }

    /// Replace the whole set. Returns `true` if membership changed.
    pub fn replace_all(&mut self, senders: impl IntoIterator<Item = UserId>) -> bool {
        let next: BTreeSet<UserId> = senders.into_iter().collect();
        if next == self.senders {
            return false;
        }
        self.senders = next;
        true
    }

    /// Returns `true` if anything was removed.
    pub fn clear(&mut self) -> bool {
        let had_any = !self.senders.is_empty();
        self.senders.clear();
        had_any
    }
}
