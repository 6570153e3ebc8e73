//! In-memory incident store.
//!
//! Deterministic and fast but not durable; backs unit tests and mirrors
//! the semantics of the production SQLite adapter, including the
//! optimistic status compare-and-swap.
//!
//! # Synchronization protocol
//!
//! All fields are protected by a single `Mutex<Inner>`. Lock poisoning
//! is surfaced as [`StoreError::Backend`] rather than panicking.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::clock::now_ns;
use crate::error::StoreError;
use crate::incident::{Incident, IncidentEvent, IncidentStatus};
use crate::store::{IncidentStore, OutcomePatch};

#[derive(Debug, Default)]
struct Inner {
    incidents: HashMap<String, Incident>,
    events: Vec<IncidentEvent>,
}

/// Mutex-protected in-memory [`IncidentStore`].
#[derive(Debug, Default)]
pub struct MemoryIncidentStore {
    inner: Mutex<Inner>,
}

impl MemoryIncidentStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|e| StoreError::Backend(format!("memory store lock poisoned: {e}")))
    }
}

impl IncidentStore for MemoryIncidentStore {
    fn create(&self, incident: &Incident) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        if inner.incidents.contains_key(&incident.id) {
            return Err(StoreError::AlreadyExists(incident.id.clone()));
        }
        inner.incidents.insert(incident.id.clone(), incident.clone());
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Incident, StoreError> {
        let inner = self.lock()?;
        inner
            .incidents
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn update(&self, incident: &Incident) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        if !inner.incidents.contains_key(&incident.id) {
            return Err(StoreError::NotFound(incident.id.clone()));
        }
        inner.incidents.insert(incident.id.clone(), incident.clone());
        Ok(())
    }

    fn update_status(
        &self,
        id: &str,
        expected: IncidentStatus,
        incident: &Incident,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let stored = inner
            .incidents
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if stored.status != expected {
            return Err(StoreError::StatusConflict {
                incident_id: id.to_string(),
                expected,
                actual: stored.status,
            });
        }
        *stored = incident.clone();
        Ok(())
    }

    fn touch(&self, id: &str, updated_at_ns: u64) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let stored = inner
            .incidents
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        stored.updated_at_ns = updated_at_ns;
        Ok(())
    }

    fn set_outcome(
        &self,
        id: &str,
        expected: IncidentStatus,
        patch: &OutcomePatch,
        updated_at_ns: u64,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let stored = inner
            .incidents
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if stored.status != expected {
            return Err(StoreError::StatusConflict {
                incident_id: id.to_string(),
                expected,
                actual: stored.status,
            });
        }
        if let Some(run_id) = &patch.run_id {
            stored.run_id = Some(run_id.clone());
        }
        if let Some(pr_url) = &patch.pr_url {
            stored.pr_url = Some(pr_url.clone());
        }
        if let Some(diagnosis) = &patch.diagnosis {
            stored.diagnosis = Some(diagnosis.clone());
        }
        stored.updated_at_ns = updated_at_ns;
        Ok(())
    }

    fn list(&self) -> Result<Vec<Incident>, StoreError> {
        let inner = self.lock()?;
        let mut incidents: Vec<Incident> = inner.incidents.values().cloned().collect();
        incidents.sort_by(|a, b| b.created_at_ns.cmp(&a.created_at_ns));
        Ok(incidents)
    }

    fn find_by_run_id(&self, run_id: &str) -> Result<Option<Incident>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .incidents
            .values()
            .find(|incident| incident.run_id.as_deref() == Some(run_id))
            .cloned())
    }

    fn find_duplicate(
        &self,
        service_name: &str,
        error_message: &str,
        window: Duration,
    ) -> Result<Option<Incident>, StoreError> {
        let cutoff = now_ns().saturating_sub(u64::try_from(window.as_nanos()).unwrap_or(u64::MAX));
        let inner = self.lock()?;
        Ok(inner
            .incidents
            .values()
            .filter(|incident| {
                incident.service_name == service_name
                    && incident.error_message == error_message
                    && incident.updated_at_ns >= cutoff
                    && !matches!(
                        incident.status,
                        IncidentStatus::Resolved | IncidentStatus::NoFixNeeded
                    )
            })
            .max_by_key(|incident| incident.updated_at_ns)
            .cloned())
    }

    fn append_event(&self, event: &IncidentEvent) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.events.push(event.clone());
        Ok(())
    }

    fn events_for(&self, incident_id: &str) -> Result<Vec<IncidentEvent>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .events
            .iter()
            .filter(|event| event.incident_id == incident_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::incident::{IncidentEventKind, RawIncident};

    fn incident(service: &str, error: &str, status: IncidentStatus) -> Incident {
        Incident::from_raw(RawIncident::new(service, error), "org/repo", status)
    }

    #[test]
    fn create_then_get_round_trips() {
        let store = MemoryIncidentStore::new();
        let inc = incident("svc", "boom", IncidentStatus::Pending);
        store.create(&inc).expect("create");
        let fetched = store.get(&inc.id).expect("get");
        assert_eq!(fetched, inc);
    }

    #[test]
    fn create_rejects_duplicate_id() {
        let store = MemoryIncidentStore::new();
        let inc = incident("svc", "boom", IncidentStatus::Pending);
        store.create(&inc).expect("create");
        assert!(matches!(
            store.create(&inc),
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn get_missing_is_not_found() {
        let store = MemoryIncidentStore::new();
        assert!(matches!(store.get("inc-nope"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn update_status_enforces_expected_status() {
        let store = MemoryIncidentStore::new();
        let mut inc = incident("svc", "boom", IncidentStatus::Pending);
        store.create(&inc).expect("create");

        inc.status = IncidentStatus::WorkflowTriggered;
        store
            .update_status(&inc.id, IncidentStatus::Pending, &inc)
            .expect("cas succeeds from observed status");

        // A second writer that still believes the status is pending loses.
        let stale = inc.clone();
        let err = store
            .update_status(&stale.id, IncidentStatus::Pending, &stale)
            .expect_err("stale cas must fail");
        assert!(matches!(
            err,
            StoreError::StatusConflict {
                expected: IncidentStatus::Pending,
                actual: IncidentStatus::WorkflowTriggered,
                ..
            }
        ));
    }

    #[test]
    fn find_duplicate_matches_service_and_error_within_window() {
        let store = MemoryIncidentStore::new();
        let inc = incident("svc", "boom", IncidentStatus::Pending);
        store.create(&inc).expect("create");

        let hit = store
            .find_duplicate("svc", "boom", Duration::from_secs(300))
            .expect("query");
        assert_eq!(hit.map(|i| i.id), Some(inc.id.clone()));

        assert!(store
            .find_duplicate("svc", "other error", Duration::from_secs(300))
            .expect("query")
            .is_none());
        assert!(store
            .find_duplicate("other-svc", "boom", Duration::from_secs(300))
            .expect("query")
            .is_none());
    }

    #[test]
    fn find_duplicate_ignores_idle_incidents_outside_window() {
        let store = MemoryIncidentStore::new();
        let mut inc = incident("svc", "boom", IncidentStatus::Pending);
        inc.created_at_ns = now_ns().saturating_sub(600 * 1_000_000_000);
        inc.updated_at_ns = inc.created_at_ns;
        store.create(&inc).expect("create");

        assert!(store
            .find_duplicate("svc", "boom", Duration::from_secs(300))
            .expect("query")
            .is_none());
    }

    #[test]
    fn find_duplicate_matches_on_last_activity_not_creation() {
        // Created long before the window, but a steady duplicate burst
        // kept refreshing updated_at_ns; it must still match.
        let store = MemoryIncidentStore::new();
        let mut inc = incident("svc", "boom", IncidentStatus::Pending);
        inc.created_at_ns = now_ns().saturating_sub(600 * 1_000_000_000);
        store.create(&inc).expect("create");

        let hit = store
            .find_duplicate("svc", "boom", Duration::from_secs(300))
            .expect("query");
        assert_eq!(hit.map(|i| i.id), Some(inc.id));
    }

    #[test]
    fn find_duplicate_skips_resolved_and_no_fix_needed() {
        let store = MemoryIncidentStore::new();
        let resolved = incident("svc", "boom", IncidentStatus::Resolved);
        let no_fix = incident("svc", "boom", IncidentStatus::NoFixNeeded);
        store.create(&resolved).expect("create");
        store.create(&no_fix).expect("create");

        assert!(store
            .find_duplicate("svc", "boom", Duration::from_secs(300))
            .expect("query")
            .is_none());

        // A failed incident is still the same unresolved failure.
        let failed = incident("svc", "boom", IncidentStatus::Failed);
        store.create(&failed).expect("create");
        let hit = store
            .find_duplicate("svc", "boom", Duration::from_secs(300))
            .expect("query");
        assert_eq!(hit.map(|i| i.id), Some(failed.id));
    }

    #[test]
    fn find_duplicate_prefers_the_most_recently_active_candidate() {
        let store = MemoryIncidentStore::new();
        let mut older = incident("svc", "boom", IncidentStatus::Pending);
        older.created_at_ns = older.created_at_ns.saturating_sub(1_000_000);
        older.updated_at_ns = older.created_at_ns;
        let newer = incident("svc", "boom", IncidentStatus::Pending);
        store.create(&older).expect("create");
        store.create(&newer).expect("create");

        let hit = store
            .find_duplicate("svc", "boom", Duration::from_secs(300))
            .expect("query");
        assert_eq!(hit.map(|i| i.id), Some(newer.id));
    }

    #[test]
    fn touch_moves_updated_at_and_nothing_else() {
        let store = MemoryIncidentStore::new();
        let mut inc = incident("svc", "boom", IncidentStatus::Pending);
        inc.run_id = Some("run-9".to_string());
        store.create(&inc).expect("create");

        let later = inc.updated_at_ns + 1_000_000_000;
        store.touch(&inc.id, later).expect("touch");

        let stored = store.get(&inc.id).expect("get");
        assert_eq!(stored.updated_at_ns, later);
        assert_eq!(stored.status, IncidentStatus::Pending);
        assert_eq!(stored.run_id.as_deref(), Some("run-9"));

        assert!(matches!(
            store.touch("inc-nope", later),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn set_outcome_is_guarded_by_observed_status() {
        let store = MemoryIncidentStore::new();
        let inc = incident("svc", "boom", IncidentStatus::Pending);
        store.create(&inc).expect("create");

        let patch = OutcomePatch {
            run_id: Some("run-1".to_string()),
            ..OutcomePatch::default()
        };
        let err = store
            .set_outcome(&inc.id, IncidentStatus::WorkflowTriggered, &patch, now_ns())
            .expect_err("status mismatch");
        assert!(matches!(err, StoreError::StatusConflict { .. }));
        assert!(store.get(&inc.id).expect("get").run_id.is_none());

        store
            .set_outcome(&inc.id, IncidentStatus::Pending, &patch, now_ns())
            .expect("guarded write");
        let stored = store.get(&inc.id).expect("get");
        assert_eq!(stored.run_id.as_deref(), Some("run-1"));
        // None fields in the patch stay untouched.
        assert!(stored.pr_url.is_none());
        assert!(stored.diagnosis.is_none());
    }

    #[test]
    fn find_by_run_id_matches_dispatched_incident() {
        let store = MemoryIncidentStore::new();
        let mut inc = incident("svc", "boom", IncidentStatus::Pending);
        inc.run_id = Some("run-77".to_string());
        store.create(&inc).expect("create");

        let hit = store.find_by_run_id("run-77").expect("query");
        assert_eq!(hit.map(|i| i.id), Some(inc.id));
        assert!(store.find_by_run_id("run-88").expect("query").is_none());
    }

    #[test]
    fn events_are_append_only_and_scoped_by_incident() {
        let store = MemoryIncidentStore::new();
        let inc = incident("svc", "boom", IncidentStatus::Pending);
        store.create(&inc).expect("create");

        store
            .append_event(&IncidentEvent::new(
                &inc.id,
                IncidentEventKind::Received,
                json!({"provider": "datadog"}),
            ))
            .expect("append");
        store
            .append_event(&IncidentEvent::new(
                "inc-other",
                IncidentEventKind::Received,
                json!({}),
            ))
            .expect("append");

        let events = store.events_for(&inc.id).expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, IncidentEventKind::Received);
    }

    #[test]
    fn list_returns_newest_first() {
        let store = MemoryIncidentStore::new();
        let mut older = incident("svc-a", "boom", IncidentStatus::Pending);
        older.created_at_ns = older.created_at_ns.saturating_sub(5_000_000_000);
        let newer = incident("svc-b", "boom", IncidentStatus::Pending);
        store.create(&older).expect("create");
        store.create(&newer).expect("create");

        let listed = store.list().expect("list");
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, newer.id);
        assert_eq!(listed[1].id, older.id);
    }
}
