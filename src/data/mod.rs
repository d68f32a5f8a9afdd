//! Data layer module
//!
//! Handles all persistence through a single key-value abstraction:
//! - In-memory store (tests, single-process development)
//! - SQLite store (durable, shareable between processes)
//! - Follower relationships on top of either

mod followers;
mod kv;
mod sqlite;

pub use followers::FollowerStore;
pub use kv::{KvEntry, KvKey, KvStore, MemoryKvStore};
pub use sqlite::SqliteKvStore;
