//! Incident persistence contract.
//!
//! The engine depends on this narrow trait rather than a storage
//! technology; the daemon crate supplies a SQLite implementation and
//! [`MemoryIncidentStore`] backs unit tests and embedders.
//!
//! # Contracts
//!
//! - `create` rejects duplicate ids.
//! - `update_status` is an optimistic compare-and-swap on the expected
//!   prior status; a mismatch leaves the record untouched and returns
//!   [`StoreError::StatusConflict`]. This is what makes concurrent
//!   transitions on one incident safe: one wins, the other observes the
//!   conflict.
//! - `touch` and `set_outcome` are field-scoped writes. They exist so
//!   the dedup and completion paths never overwrite a whole record read
//!   before a concurrent transition: `touch` moves `updated_at_ns` and
//!   nothing else; `set_outcome` writes outcome fields under the same
//!   status guard as `update_status`.
//! - `find_duplicate` returns the most recently active open incident
//!   with identical service and error whose `updated_at_ns` falls
//!   inside the sliding window ending now; since every duplicate hit
//!   refreshes `updated_at_ns`, a live burst keeps matching past the
//!   original creation time. Incidents in `resolved` or
//!   `no_fix_needed` never match; `failed` still does, since it
//!   represents the same unresolved failure.
//! - `append_event` is append-only; events are never mutated or deleted.
//! - At-least read-your-writes consistency is assumed.

mod memory;

use std::time::Duration;

pub use memory::MemoryIncidentStore;

use crate::error::StoreError;
use crate::incident::{Incident, IncidentEvent, IncidentStatus};

/// Outcome fields written by [`IncidentStore::set_outcome`].
///
/// `None` fields are left untouched, so the write cannot clobber a
/// value another path recorded concurrently.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutcomePatch {
    /// External workflow run identifier.
    pub run_id: Option<String>,
    /// URL of the remediation pull request.
    pub pr_url: Option<String>,
    /// Diagnosis text reported by the workflow.
    pub diagnosis: Option<String>,
}

/// Durable persistence for incidents and their audit trail.
pub trait IncidentStore: Send + Sync {
    /// Persists a new incident.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyExists`] if the id is taken, or a
    /// backend error.
    fn create(&self, incident: &Incident) -> Result<(), StoreError>;

    /// Fetches an incident by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such incident exists.
    fn get(&self, id: &str) -> Result<Incident, StoreError>;

    /// Overwrites an existing incident record.
    ///
    /// Callers must not change `status` through this method; all status
    /// mutation goes through [`update_status`](Self::update_status) via
    /// the lifecycle gate.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such incident exists.
    fn update(&self, incident: &Incident) -> Result<(), StoreError>;

    /// Persists a status change, guarded by the status the caller
    /// observed before mutating.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::StatusConflict`] when the stored status no
    /// longer equals `expected`; the record is left unchanged.
    fn update_status(
        &self,
        id: &str,
        expected: IncidentStatus,
        incident: &Incident,
    ) -> Result<(), StoreError>;

    /// Moves `updated_at_ns` and nothing else.
    ///
    /// Safe to race with a status transition on the same incident: the
    /// write is field-scoped, so it can never revert a status or erase
    /// outcome fields written in between.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such incident exists.
    fn touch(&self, id: &str, updated_at_ns: u64) -> Result<(), StoreError>;

    /// Writes outcome fields, guarded by the status the caller observed.
    ///
    /// `None` fields in the patch are left untouched. Like
    /// [`update_status`](Self::update_status), a status mismatch leaves
    /// the record unchanged and returns
    /// [`StoreError::StatusConflict`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown id and
    /// [`StoreError::StatusConflict`] when the stored status no longer
    /// equals `expected`.
    fn set_outcome(
        &self,
        id: &str,
        expected: IncidentStatus,
        patch: &OutcomePatch,
        updated_at_ns: u64,
    ) -> Result<(), StoreError>;

    /// Lists all incidents, newest first.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the query fails.
    fn list(&self) -> Result<Vec<Incident>, StoreError>;

    /// Finds the incident holding the given external run id, if any.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the query fails.
    fn find_by_run_id(&self, run_id: &str) -> Result<Option<Incident>, StoreError>;

    /// Finds the most recently active open duplicate of
    /// (`service_name`, `error_message`) whose `updated_at_ns` lies
    /// within `window` of now.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the query fails.
    fn find_duplicate(
        &self,
        service_name: &str,
        error_message: &str,
        window: Duration,
    ) -> Result<Option<Incident>, StoreError>;

    /// Appends one audit event.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the insert fails.
    fn append_event(&self, event: &IncidentEvent) -> Result<(), StoreError>;

    /// Returns the audit trail for one incident, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the query fails.
    fn events_for(&self, incident_id: &str) -> Result<Vec<IncidentEvent>, StoreError>;
}
