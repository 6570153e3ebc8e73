//! Incident orchestration engine for autonomous remediation.
//!
//! Ingests normalized incident records from observability providers,
//! collapses duplicates inside a sliding time window, routes each
//! incident to the repository that owns the failing service, and
//! dispatches an external remediation workflow subject to a
//! per-repository concurrency ceiling with a FIFO backlog.
//!
//! The engine is storage- and transport-agnostic: it depends on the
//! [`store::IncidentStore`] and [`dispatch::DispatchTransport`] traits
//! only. The companion daemon crate supplies the SQLite store and the
//! GitHub Actions transport.
//!
//! # Architecture
//!
//! - [`incident`] — the data model: incidents, statuses, audit events.
//! - [`lifecycle`] — the single gate through which status changes.
//! - [`dedup`] — time-windowed deduplication.
//! - [`routing`] — service to repository routing with atomic reload.
//! - [`queue`] — per-repository admission control and FIFO backlog.
//! - [`dispatch`] — the transport contract and dispatch-with-retry.
//! - [`orchestrator`] — the composition root wiring it all together.

pub mod clock;
pub mod config;
pub mod dedup;
pub mod dispatch;
pub mod error;
pub mod incident;
pub mod lifecycle;
pub mod orchestrator;
pub mod queue;
pub mod routing;
pub mod store;

pub use config::{EngineConfig, EngineConfigBuilder, EngineConfigError};
pub use dispatch::{
    DispatchContext, DispatchOutcome, DispatchTransport, Dispatcher, RetryPolicy,
    StubDispatchTransport,
};
pub use error::{DispatchError, EngineError, StoreError};
pub use incident::{
    Incident, IncidentEvent, IncidentEventKind, IncidentStatus, RawIncident, Severity,
};
pub use orchestrator::{
    DispatchDisposition, IncidentOutcome, Orchestrator, WorkflowOutcome,
};
pub use queue::{Admission, DispatchQueueManager};
pub use routing::{Route, RoutingTable, ServiceMapping};
pub use store::{IncidentStore, MemoryIncidentStore, OutcomePatch};
