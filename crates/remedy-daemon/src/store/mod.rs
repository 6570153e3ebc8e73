//! Durable incident persistence.

mod sqlite;

pub use sqlite::SqliteIncidentStore;
