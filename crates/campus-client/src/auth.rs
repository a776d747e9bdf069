//! Follows the auth collaborator's signed-in identity.
//!
//! The auth layer publishes `Option<UserId>` on a `watch` channel. A new
//! identity signs a session in, `None` or a different identity signs the
//! current one out first. When the sender goes away the session ends too.

use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use campus_shared::{Backend, UserId};

use crate::config::MessagingConfig;
use crate::session::Session;

type Slot = Arc<Mutex<Option<Session>>>;

pub struct AuthFollower {
    current: Slot,
    task: JoinHandle<()>,
}

impl AuthFollower {
    pub fn spawn(
        mut auth: watch::Receiver<Option<UserId>>,
        backend: Arc<dyn Backend>,
        config: MessagingConfig,
    ) -> Self {
        let current: Slot = Arc::new(Mutex::new(None));
        let slot = current.clone();

        let task = tokio::spawn(async move {
            loop {
                let identity = auth.borrow_and_update().clone();
                follow(&slot, identity, &backend, &config).await;
                if auth.changed().await.is_err() {
                    break;
                }
            }
            info!("auth source closed");
            if let Some(session) = slot.lock().await.take() {
                session.sign_out().await;
            }
        });

        Self { current, task }
    }

    /// The live session, if someone is signed in.
    pub async fn session(&self) -> Option<Session> {
        self.current.lock().await.clone()
    }

    /// Stop following and sign the current session out.
    pub async fn shutdown(self) {
        self.task.abort();
        if let Some(session) = self.current.lock().await.take() {
            session.sign_out().await;
        }
    }
}

async fn follow(slot: &Slot, identity: Option<UserId>, backend: &Arc<dyn Backend>, config: &MessagingConfig) {
    let mut current = slot.lock().await;
    if current.as_ref().map(Session::me) == identity.as_ref() {
        return;
    }

    if let Some(previous) = current.take() {
        previous.sign_out().await;
    }

    if let Some(me) = identity {
        match Session::sign_in(me.clone(), backend.clone(), config.clone()).await {
            Ok(session) => *current = Some(session),
            Err(e) => warn!(user = %me, error = %e, "Failed to start messaging session"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use campus_store::LocalBackend;

    async fn wait_for(follower: &AuthFollower, expected: Option<&str>) -> Option<Session> {
        for _ in 0..50 {
            let session = follower.session().await;
            if session.as_ref().map(|s| s.me().as_str()) == expected {
                return session;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session never became {expected:?}");
    }

    #[tokio::test]
    async fn follows_sign_in_switch_and_sign_out() {
        let backend = LocalBackend::in_memory().unwrap();
        let (tx, rx) = watch::channel(None);
        let follower = AuthFollower::spawn(rx, Arc::new(backend.clone()), MessagingConfig::default());

        tx.send(Some(UserId::from("u1"))).unwrap();
        let first = wait_for(&follower, Some("u1")).await.unwrap();
        assert!(first.is_signed_in());

        tx.send(Some(UserId::from("u2"))).unwrap();
        let second = wait_for(&follower, Some("u2")).await.unwrap();
        assert!(!first.is_signed_in());
        assert!(second.is_signed_in());

        tx.send(None).unwrap();
        wait_for(&follower, None).await;
        assert!(!second.is_signed_in());
        assert_eq!(backend.feed().subscriber_count(), 0);
    }

    #[tokio::test]
    async fn closed_auth_source_signs_out() {
        let backend = LocalBackend::in_memory().unwrap();
        let (tx, rx) = watch::channel(Some(UserId::from("u1")));
        let follower = AuthFollower::spawn(rx, Arc::new(backend), MessagingConfig::default());

        let session = wait_for(&follower, Some("u1")).await.unwrap();
        drop(tx);
        wait_for(&follower, None).await;
        assert!(!session.is_signed_in());
    }

    #[tokio::test]
    async fn shutdown_signs_out() {
        let backend = LocalBackend::in_memory().unwrap();
        let (_tx, rx) = watch::channel(Some(UserId::from("u1")));
        let follower = AuthFollower::spawn(rx, Arc::new(backend), MessagingConfig::default());

        let session = wait_for(&follower, Some("u1")).await.unwrap();
        follower.shutdown().await;
        assert!(!session.is_signed_in());
    }
}
