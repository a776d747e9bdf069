//! Friendship and profile records.
//!
//! Both relations are owned by other parts of the product (friend requests,
//! profile editing). The messaging core only reads them; the write helpers
//! exist for fixtures and for the embedded backend.

use chrono::Utc;
use rusqlite::params;

use campus_shared::protocol::{FriendshipRow, Profile};
use campus_shared::{FriendshipStatus, UserId};

use crate::database::{corrupt, format_ts, Database};
use crate::error::Result;

impl Database {
    // ------------------------------------------------------------------
    // Friendships
    // ------------------------------------------------------------------

    /// Insert or update the relation `user_id -> friend_id`.
    pub fn upsert_friendship(
        &self,
        user_id: &UserId,
        friend_id: &UserId,
        status: FriendshipStatus,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO friendships (user_id, friend_id, status, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, friend_id) DO UPDATE SET status = excluded.status",
            params![
                user_id.as_str(),
                friend_id.as_str(),
                status.as_str(),
                format_ts(&Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Relations where `user` is on either side, with the given status.
    pub fn friendships_for(
        &self,
        user: &UserId,
        status: FriendshipStatus,
    ) -> Result<Vec<FriendshipRow>> {
        let mut stmt = self.conn().prepare(
            "SELECT user_id, friend_id, status FROM friendships
             WHERE (user_id = ?1 OR friend_id = ?1) AND status = ?2
             ORDER BY created_at ASC",
        )?;

        let rows = stmt.query_map(params![user.as_str(), status.as_str()], |row| {
            let user_id: String = row.get(0)?;
            let friend_id: String = row.get(1)?;
            let status_str: String = row.get(2)?;
            let status =
                FriendshipStatus::parse(&status_str).ok_or_else(|| corrupt(2, "unknown status"))?;
            Ok(FriendshipRow {
                user_id: UserId::new(user_id),
                friend_id: UserId::new(friend_id),
                status,
            })
        })?;

        let mut friendships = Vec::new();
        for row in rows {
            friendships.push(row?);
        }
        Ok(friendships)
    }

    // ------------------------------------------------------------------
    // Profiles
    // ------------------------------------------------------------------

    pub fn upsert_profile(&self, profile: &Profile) -> Result<()> {
        self.conn().execute(
            "INSERT INTO profiles (id, display_name, avatar_url, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                display_name = excluded.display_name,
                avatar_url = excluded.avatar_url",
            params![
                profile.id.as_str(),
                profile.display_name,
                profile.avatar_url,
                format_ts(&Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Profiles for the given ids. Unknown ids are skipped.
    pub fn profiles_by_ids(&self, ids: &[UserId]) -> Result<Vec<Profile>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let mut stmt = self.conn().prepare(&format!(
            "SELECT id, display_name, avatar_url FROM profiles WHERE id IN ({placeholders})"
        ))?;

        let rows = stmt.query_map(
            rusqlite::params_from_iter(ids.iter().map(|id| id.as_str())),
            |row| {
                let id: String = row.get(0)?;
                Ok(Profile {
                    id: UserId::new(id),
                    display_name: row.get(1)?,
                    avatar_url: row.get(2)?,
                })
            },
        )?;

        let mut profiles = Vec::new();
        for row in rows {
            profiles.push(row?);
        }
        Ok(profiles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(id: &str, name: &str) -> Profile {
        Profile {
            id: UserId::from(id),
            display_name: Some(name.to_string()),
            avatar_url: None,
        }
    }

    #[test]
    fn friendships_match_either_side() {
        let db = Database::open_in_memory().unwrap();
        let (u1, u2, u3) = (UserId::from("u1"), UserId::from("u2"), UserId::from("u3"));

        db.upsert_friendship(&u1, &u2, FriendshipStatus::Accepted).unwrap();
        db.upsert_friendship(&u3, &u1, FriendshipStatus::Pending).unwrap();

        let accepted = db.friendships_for(&u1, FriendshipStatus::Accepted).unwrap();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].partner_of(&u1), Some(&u2));

        let pending = db.friendships_for(&u1, FriendshipStatus::Pending).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].partner_of(&u1), Some(&u3));
    }

    #[test]
    fn accepting_updates_status() {
        let db = Database::open_in_memory().unwrap();
        let (u1, u2) = (UserId::from("u1"), UserId::from("u2"));

        db.upsert_friendship(&u1, &u2, FriendshipStatus::Pending).unwrap();
        db.upsert_friendship(&u1, &u2, FriendshipStatus::Accepted).unwrap();

        assert!(db.friendships_for(&u2, FriendshipStatus::Pending).unwrap().is_empty());
        assert_eq!(db.friendships_for(&u2, FriendshipStatus::Accepted).unwrap().len(), 1);
    }

    #[test]
    fn profiles_batch_fetch() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_profile(&profile("u1", "Ada")).unwrap();
        db.upsert_profile(&profile("u2", "Grace")).unwrap();
        db.upsert_profile(&profile("u2", "Grace H.")).unwrap();

        let mut found = db
            .profiles_by_ids(&[UserId::from("u2"), UserId::from("u9")])
            .unwrap();
        assert_eq!(found.len(), 1);
        let grace = found.remove(0);
        assert_eq!(grace.display_name.as_deref(), Some("Grace H."));

        assert!(db.profiles_by_ids(&[]).unwrap().is_empty());
    }
}
