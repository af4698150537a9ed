//! Persistent task storage.
//!
//! [`sqlite::SqliteTaskStore`] implements [`murmur_core::TaskStore`]; the
//! orchestrator only ever sees the trait object.

pub mod sqlite;
