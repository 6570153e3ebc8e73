//! Error taxonomy for the orchestration engine.
//!
//! The taxonomy separates errors by how they propagate:
//!
//! - **Recovered locally**: deduplication and routing misses are expected,
//!   common outcomes. They are folded into incident state (`failed`) and
//!   never surface as process errors.
//! - **Recorded on the incident**: dispatch failures after retry
//!   exhaustion transition the incident to `failed` and append a
//!   diagnostic audit event rather than crashing request handling.
//! - **Propagated to the caller**: store errors and transport timeouts,
//!   for operational alerting.
//!
//! No error in this crate is fatal to the process; other incidents and
//! repositories continue unaffected.

use thiserror::Error;

use crate::incident::IncidentStatus;

/// Errors returned by [`IncidentStore`](crate::store::IncidentStore)
/// implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No incident exists with the given id.
    #[error("incident {0} not found")]
    NotFound(String),

    /// An incident with the given id already exists.
    #[error("incident {0} already exists")]
    AlreadyExists(String),

    /// An optimistic status update observed a different stored status
    /// than the caller expected. The write did not take effect.
    #[error("status conflict for incident {incident_id}: expected {expected}, found {actual}")]
    StatusConflict {
        /// The incident whose update was rejected.
        incident_id: String,
        /// The status the caller observed before mutating.
        expected: IncidentStatus,
        /// The status actually stored.
        actual: IncidentStatus,
    },

    /// The storage backend failed (I/O, serialization, lock poisoning).
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Errors returned by [`DispatchTransport`](crate::dispatch::DispatchTransport)
/// implementations. Each error counts as one failed attempt for retry
/// purposes.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// The transport call did not complete within the caller-supplied
    /// timeout.
    #[error("dispatch to {repository} timed out after {timeout_secs}s")]
    Timeout {
        /// Target repository of the dispatch.
        repository: String,
        /// The timeout that elapsed, in whole seconds.
        timeout_secs: u64,
    },

    /// The transport call completed but reported failure.
    #[error("dispatch transport failure: {0}")]
    Transport(String),
}

/// Top-level engine error surfaced by orchestrator operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The incoming incident is malformed; rejected before persistence.
    #[error("invalid incident: {0}")]
    Validation(String),

    /// No routing entry maps the service to a repository.
    #[error("no route for service '{service}'")]
    UnroutableService {
        /// The service name that failed to resolve.
        service: String,
    },

    /// An illegal state transition was attempted. The incident is left
    /// unchanged.
    #[error("illegal transition for incident {incident_id}: {from} -> {to}")]
    InvalidTransition {
        /// The incident whose transition was rejected.
        incident_id: String,
        /// The status the incident was in.
        from: IncidentStatus,
        /// The requested target status.
        to: IncidentStatus,
    },

    /// No incident matches the given identifier or run id.
    #[error("incident not found: {0}")]
    IncidentNotFound(String),

    /// A persistence operation failed. The triggering operation is not
    /// assumed to have taken effect.
    #[error(transparent)]
    Store(#[from] StoreError),
}
