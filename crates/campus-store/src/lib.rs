//! # campus-store
//!
//! Embedded backend for Campus direct messaging, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle with typed helpers for
//! messages, friendships and profiles, an in-process [`ChangeFeed`], and
//! [`LocalBackend`], which wires both behind the
//! [`campus_shared::Backend`] contract.

pub mod backend;
pub mod database;
pub mod feed;
pub mod friendships;
pub mod messages;
pub mod migrations;

mod error;

pub use backend::LocalBackend;
pub use database::Database;
pub use error::StoreError;
pub use feed::ChangeFeed;
pub use messages::Inserted;
