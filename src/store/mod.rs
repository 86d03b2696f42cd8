//! Persistent stores for custom per-client limits.

mod sqlite;

pub use sqlite::SqliteLimitStore;
