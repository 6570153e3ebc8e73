//! The lifecycle transition gate.
//!
//! [`transition`] is the single path through which incident status may
//! change. It checks legality against the static transition table,
//! stamps the set-exactly-once timestamps, appends the `status_changed`
//! audit event, and persists through the store's optimistic
//! compare-and-swap so concurrent transitions on one incident cannot
//! silently race into an invalid combined state: one wins, the other
//! surfaces [`EngineError::InvalidTransition`].

use tracing::debug;

use crate::clock::now_ns;
use crate::error::{EngineError, StoreError};
use crate::incident::{Incident, IncidentEvent, IncidentStatus};
use crate::store::IncidentStore;

/// Transitions an incident to `target`, enforcing the legal transition
/// table and the timestamp invariants.
///
/// On success returns the updated incident. On an illegal transition or
/// a lost optimistic race the incident is left unchanged in the store.
///
/// # Errors
///
/// - [`EngineError::InvalidTransition`] when `target` is not in the
///   allowed set for the current status, or when a concurrent
///   transition won the compare-and-swap.
/// - [`EngineError::Store`] for persistence failures.
pub fn transition(
    store: &dyn IncidentStore,
    incident_id: &str,
    target: IncidentStatus,
) -> Result<Incident, EngineError> {
    let mut incident = store.get(incident_id)?;
    let from = incident.status;

    if !from.can_transition_to(target) {
        return Err(EngineError::InvalidTransition {
            incident_id: incident_id.to_string(),
            from,
            to: target,
        });
    }

    let now = now_ns();
    incident.status = target;
    incident.updated_at_ns = now;
    // triggered_at is stamped exactly once, the first time the incident
    // leaves pending toward workflow_triggered.
    if target == IncidentStatus::WorkflowTriggered && incident.triggered_at_ns.is_none() {
        incident.triggered_at_ns = Some(now);
    }
    // completed_at is stamped exactly once, the first time a
    // terminal-for-cycle status is reached.
    if target.is_terminal_for_cycle() && incident.completed_at_ns.is_none() {
        incident.completed_at_ns = Some(now);
    }

    store
        .update_status(incident_id, from, &incident)
        .map_err(|err| match err {
            StoreError::StatusConflict { actual, .. } => EngineError::InvalidTransition {
                incident_id: incident_id.to_string(),
                from: actual,
                to: target,
            },
            other => EngineError::Store(other),
        })?;

    store.append_event(&IncidentEvent::status_changed(incident_id, from, target))?;
    debug!(
        incident_id,
        from = %from,
        to = %target,
        "incident status transitioned"
    );
    Ok(incident)
}
