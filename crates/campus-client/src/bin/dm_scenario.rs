//! # dm-scenario
//!
//! Walks two users through a direct-message exchange against the embedded
//! backend and logs what each side sees:
//! - u1 sends "hello" to u2
//! - u2 opens the conversation, which marks it read
//! - u1 sees the read receipt, then clears the chat
//!
//! Set `CAMPUS_DM_DB` to keep the SQLite file instead of running in memory.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tracing::info;

use campus_client::{init_tracing, MessagingConfig, Session};
use campus_shared::{FriendshipStatus, UserId};
use campus_store::LocalBackend;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Tracing and configuration
    // -----------------------------------------------------------------------
    init_tracing();

    let config = MessagingConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 2. Backend and seed data
    // -----------------------------------------------------------------------
    let backend = match std::env::var("CAMPUS_DM_DB") {
        Ok(path) => LocalBackend::open_at(&PathBuf::from(path)).context("opening database")?,
        Err(_) => LocalBackend::in_memory().context("opening in-memory database")?,
    };

    let (alice_id, bob_id) = (UserId::from("u1"), UserId::from("u2"));
    backend
        .with_database(|db| db.upsert_friendship(&alice_id, &bob_id, FriendshipStatus::Accepted))
        .context("seeding friendship")?;

    // -----------------------------------------------------------------------
    // 3. Sessions
    // -----------------------------------------------------------------------
    let alice = Session::sign_in(alice_id.clone(), Arc::new(backend.clone()), config.clone()).await?;
    let bob = Session::sign_in(bob_id.clone(), Arc::new(backend.clone()), config).await?;

    let friends = alice.list_friends(false).await?;
    info!(count = friends.len(), "u1 friends resolved");

    alice.open_conversation(&bob_id).await?;
    let sent = alice.send("hello").await?;
    info!(message = ?sent.server_id(), "u1 sent a message");

    tokio::time::sleep(Duration::from_millis(50)).await;
    info!(unread = ?bob.unread_senders().await, "u2 badges before opening");

    let opened = bob.open_conversation(&alice_id).await?;
    let Some(first) = opened.messages.first() else {
        bail!("u2 sees no messages");
    };
    info!(count = opened.messages.len(), read = first.is_read, "u2 opened the conversation");

    let receipt = alice.reload().await?;
    let read = receipt.messages.first().map(|m| m.is_read).unwrap_or(false);
    info!(read, "u1 sees the read receipt");

    // -----------------------------------------------------------------------
    // 4. Clear chat
    // -----------------------------------------------------------------------
    let confirmation = alice.request_clear().await?;
    info!(
        policy = confirmation.policy().as_str(),
        affects_u2 = confirmation.affects_counterparty(),
        "u1 confirmed clear"
    );
    alice.clear_conversation(confirmation).await?;

    let alice_view = alice.reload().await?;
    let bob_view = bob.reload().await?;
    info!(
        u1_visible = alice_view.messages.len(),
        u2_visible = bob_view.messages.len(),
        "after clear"
    );

    alice.sign_out().await;
    bob.sign_out().await;
    Ok(())
}
