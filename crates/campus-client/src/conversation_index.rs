//! Friend list for the signed-in user, cached for the session.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use campus_shared::protocol::Profile;
use campus_shared::{Backend, FriendshipStatus, UserId};

use crate::error::Result;
use crate::message_store::bounded;
use crate::unread::UnreadTracker;

/// A friend joined with their badge state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub profile: Profile,
    pub has_unread: bool,
}

pub struct ConversationIndex {
    me: UserId,
    backend: Arc<dyn Backend>,
    timeout: Duration,
    friends: RwLock<Option<Vec<Profile>>>,
}

impl ConversationIndex {
    pub fn new(me: UserId, backend: Arc<dyn Backend>, timeout: Duration) -> Self {
        Self {
            me,
            backend,
            timeout,
            friends: RwLock::new(None),
        }
    }

    /// Accepted friends, sorted by display label. Served from cache unless
    /// `refresh` is set or nothing was cached yet. A failed refresh keeps the
    /// previous list.
    pub async fn list_friends(&self, refresh: bool) -> Result<Vec<Profile>> {
        if !refresh {
            if let Some(cached) = self.friends.read().await.as_ref() {
                return Ok(cached.clone());
            }
        }

        match self.fetch().await {
            Ok(profiles) => {
                *self.friends.write().await = Some(profiles.clone());
                Ok(profiles)
            }
            Err(e) => {
                warn!(user = %self.me, error = %e, "Failed to fetch friends");
                Err(e)
            }
        }
    }

    /// Forget the cache (friendship change notification).
    pub async fn invalidate(&self) {
        *self.friends.write().await = None;
    }

    pub async fn summaries(&self, unread: &UnreadTracker, refresh: bool) -> Result<Vec<ConversationSummary>> {
        let friends = self.list_friends(refresh).await?;
        Ok(friends
            .into_iter()
            .map(|profile| ConversationSummary {
                has_unread: unread.contains(&profile.id),
                profile,
            })
            .collect())
    }

    async fn fetch(&self) -> Result<Vec<Profile>> {
        let rows = bounded(
            self.timeout,
            self.backend
                .query_friendships(&self.me, FriendshipStatus::Accepted),
        )
        .await?;

        let mut seen = HashSet::new();
        let ids: Vec<UserId> = rows
            .iter()
            .filter_map(|row| row.partner_of(&self.me))
            .filter(|id| seen.insert((*id).clone()))
            .cloned()
            .collect();

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut profiles = bounded(self.timeout, self.backend.fetch_profiles(&ids)).await?;

        // Friends without a profile row still show up, under their id.
        for id in &ids {
            if !profiles.iter().any(|p| &p.id == id) {
                profiles.push(Profile {
                    id: id.clone(),
                    display_name: None,
                    avatar_url: None,
                });
            }
        }
        profiles.retain(|p| ids.contains(&p.id));
        profiles.sort_by_cached_key(|p| (p.label().to_lowercase(), p.id.clone()));

        debug!(user = %self.me, count = profiles.len(), "friends resolved");
        Ok(profiles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use campus_store::LocalBackend;

    fn seed(backend: &LocalBackend) {
        backend
            .with_database(|db| {
                let me = UserId::from("u1");
                db.upsert_profile(&Profile {
                    id: UserId::from("u2"),
                    display_name: Some("zoe".into()),
                    avatar_url: None,
                })?;
                db.upsert_profile(&Profile {
                    id: UserId::from("u3"),
                    display_name: Some("Adam".into()),
                    avatar_url: None,
                })?;
                db.upsert_friendship(&me, &UserId::from("u2"), FriendshipStatus::Accepted)?;
                db.upsert_friendship(&UserId::from("u3"), &me, FriendshipStatus::Accepted)?;
                db.upsert_friendship(&me, &UserId::from("u4"), FriendshipStatus::Pending)?;
                Ok(())
            })
            .unwrap();
    }

    fn index(backend: &LocalBackend) -> ConversationIndex {
        ConversationIndex::new(
            UserId::from("u1"),
            Arc::new(backend.clone()),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn friends_from_both_directions_sorted_by_label() {
        let backend = LocalBackend::in_memory().unwrap();
        seed(&backend);

        let friends = index(&backend).list_friends(false).await.unwrap();
        let labels: Vec<&str> = friends.iter().map(|p| p.label()).collect();
        assert_eq!(labels, ["Adam", "zoe"]);
    }

    #[tokio::test]
    async fn cache_serves_until_refresh() {
        let backend = LocalBackend::in_memory().unwrap();
        let index = index(&backend);
        assert!(index.list_friends(false).await.unwrap().is_empty());

        seed(&backend);
        assert!(index.list_friends(false).await.unwrap().is_empty());
        assert_eq!(index.list_friends(true).await.unwrap().len(), 2);

        backend
            .with_database(|db| {
                db.upsert_friendship(&UserId::from("u1"), &UserId::from("u7"), FriendshipStatus::Accepted)
            })
            .unwrap();
        assert_eq!(index.list_friends(false).await.unwrap().len(), 2);
        index.invalidate().await;
        assert_eq!(index.list_friends(false).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn friend_without_profile_is_listed_by_id() {
        let backend = LocalBackend::in_memory().unwrap();
        backend
            .with_database(|db| {
                db.upsert_friendship(&UserId::from("u1"), &UserId::from("u9"), FriendshipStatus::Accepted)
            })
            .unwrap();

        let friends = index(&backend).list_friends(false).await.unwrap();
        assert_eq!(friends.len(), 1);
        assert_eq!(friends[0].label(), "u9");
    }

    #[tokio::test]
    async fn summaries_carry_unread_state() {
        let backend = LocalBackend::in_memory().unwrap();
        seed(&backend);
        let mut unread = UnreadTracker::new();
        unread.add(&UserId::from("u2"));

        let summaries = index(&backend).summaries(&unread, false).await.unwrap();
        let flagged: Vec<bool> = summaries.iter().map(|s| s.has_unread).collect();
        assert_eq!(flagged, [false, true]);
    }
}
