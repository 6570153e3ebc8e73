//! Operational shell for the remedy orchestration engine.
//!
//! Supplies the technology choices the engine abstracts over: a
//! SQLite-backed [`remedy_core::store::IncidentStore`], a GitHub
//! Actions dispatch transport driven through the `gh` CLI, and JSON
//! config loading with hot reload.

pub mod config;
pub mod store;
pub mod transport;

pub use config::{ConfigError, DaemonConfig};
pub use store::SqliteIncidentStore;
pub use transport::GithubDispatchTransport;
