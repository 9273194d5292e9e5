//! Implementations of the store ports.
//!
//! # Included
//! - **InMemoryTaskStore** / **InMemoryLedger**: development and tests
//! - **SqliteStore**: durable store, both ports over one database file
//! - **StaticCredentials**: fixed tenant -> credentials map

pub mod credentials;
pub mod memory_ledger;
pub mod memory_store;
pub mod sqlite;

pub use self::credentials::StaticCredentials;
pub use self::memory_ledger::InMemoryLedger;
pub use self::memory_store::InMemoryTaskStore;
pub use self::sqlite::SqliteStore;
