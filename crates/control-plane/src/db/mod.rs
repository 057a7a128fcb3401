//! Durable run and event storage.
//!
//! [`EventStore`] is implemented over SQLite with SQLx and in memory.

mod memory;
pub mod pool;
mod sqlite;
mod store;
mod types;

pub use memory::MemoryEventStore;
pub use pool::{create_pool, health_check, DbPool};
pub use sqlite::SqliteEventStore;
pub use store::{EventStore, StoreError};
pub use types::{ResumeState, RunStatus, StoredRun};
