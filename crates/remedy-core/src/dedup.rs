//! Time-windowed incident deduplication.
//!
//! An incoming incident is a duplicate of an existing one when an open
//! incident with identical `service_name` and `error_message` was last
//! active within the window of now. The window slides from the current
//! time, not from the original incident's time: every hit refreshes
//! `updated_at_ns`, so a burst of identical errors keeps collapsing
//! into one incident long after its creation.
//!
//! Deduplication is best-effort under true simultaneity: two concurrent
//! creates for the same pair may both miss the lookup and produce one
//! extra record. This is accepted rather than paying for a distributed
//! lock.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::debug;

use crate::clock::now_ns;
use crate::error::EngineError;
use crate::incident::{Incident, IncidentEvent, IncidentEventKind};
use crate::store::IncidentStore;

/// Resolves incoming incidents against existing open ones.
pub struct Deduplicator {
    store: Arc<dyn IncidentStore>,
}

impl Deduplicator {
    /// Creates a deduplicator over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn IncidentStore>) -> Self {
        Self { store }
    }

    /// Returns the existing open incident this (service, error) pair
    /// collapses into, or `None` when a fresh incident should be
    /// created.
    ///
    /// On a hit, the existing record's `updated_at_ns` is refreshed and
    /// a `duplicate_detected` audit event is appended. No new incident,
    /// received event, or dispatch occurs for a duplicate.
    ///
    /// If the store could match multiple candidates, the first (most
    /// recently active) match is authoritative; ambiguity beyond that
    /// is a store-layer bug, not resolved here.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn resolve(
        &self,
        service_name: &str,
        error_message: &str,
        window: Duration,
    ) -> Result<Option<Incident>, EngineError> {
        let Some(mut existing) = self
            .store
            .find_duplicate(service_name, error_message, window)?
        else {
            return Ok(None);
        };

        // Field-scoped refresh: a transition racing this path must never
        // be reverted or lose its run id to a stale full-record write.
        let now = now_ns();
        self.store.touch(&existing.id, now)?;
        existing.updated_at_ns = now;
        self.store.append_event(&IncidentEvent::new(
            &existing.id,
            IncidentEventKind::DuplicateDetected,
            json!({
                "service_name": service_name,
                "window_secs": window.as_secs(),
            }),
        ))?;
        debug!(
            incident_id = %existing.id,
            service = service_name,
            "incoming incident collapsed into existing open incident"
        );
        Ok(Some(existing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incident::{IncidentStatus, RawIncident};
    use crate::store::MemoryIncidentStore;

    const WINDOW: Duration = Duration::from_secs(300);

    fn store_with(incident: &Incident) -> Arc<dyn IncidentStore> {
        let store = MemoryIncidentStore::new();
        store.create(incident).expect("create");
        Arc::new(store)
    }

    #[test]
    fn miss_returns_none_without_side_effects() {
        let store: Arc<dyn IncidentStore> = Arc::new(MemoryIncidentStore::new());
        let dedup = Deduplicator::new(Arc::clone(&store));
        let hit = dedup.resolve("svc", "boom", WINDOW).expect("resolve");
        assert!(hit.is_none());
    }

    #[test]
    fn hit_refreshes_updated_at_and_appends_event() {
        let mut existing = Incident::from_raw(
            RawIncident::new("svc", "boom"),
            "org/repo",
            IncidentStatus::Pending,
        );
        existing.updated_at_ns = existing.updated_at_ns.saturating_sub(1_000_000_000);
        let before = existing.updated_at_ns;
        let store = store_with(&existing);
        let dedup = Deduplicator::new(Arc::clone(&store));

        let hit = dedup
            .resolve("svc", "boom", WINDOW)
            .expect("resolve")
            .expect("duplicate expected");
        assert_eq!(hit.id, existing.id);
        assert!(hit.updated_at_ns > before);

        let refetched = store.get(&existing.id).expect("get");
        assert_eq!(refetched.updated_at_ns, hit.updated_at_ns);

        let events = store.events_for(&existing.id).expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, IncidentEventKind::DuplicateDetected);
    }

    #[test]
    fn resolve_does_not_clobber_a_transition_racing_it() {
        use std::sync::atomic::{AtomicBool, Ordering};

        use crate::error::StoreError;
        use crate::store::OutcomePatch;

        // Delegating store that promotes the incident to
        // workflow_triggered (recording its run id) after resolve() has
        // read it but before the refresh lands, the way a dispatch on
        // another thread would.
        struct PromoteAfterLookup {
            inner: Arc<MemoryIncidentStore>,
            fired: AtomicBool,
        }

        impl IncidentStore for PromoteAfterLookup {
            fn create(&self, incident: &Incident) -> Result<(), StoreError> {
                self.inner.create(incident)
            }
            fn get(&self, id: &str) -> Result<Incident, StoreError> {
                self.inner.get(id)
            }
            fn update(&self, incident: &Incident) -> Result<(), StoreError> {
                self.inner.update(incident)
            }
            fn update_status(
                &self,
                id: &str,
                expected: IncidentStatus,
                incident: &Incident,
            ) -> Result<(), StoreError> {
                self.inner.update_status(id, expected, incident)
            }
            fn touch(&self, id: &str, updated_at_ns: u64) -> Result<(), StoreError> {
                self.inner.touch(id, updated_at_ns)
            }
            fn set_outcome(
                &self,
                id: &str,
                expected: IncidentStatus,
                patch: &OutcomePatch,
                updated_at_ns: u64,
            ) -> Result<(), StoreError> {
                self.inner.set_outcome(id, expected, patch, updated_at_ns)
            }
            fn list(&self) -> Result<Vec<Incident>, StoreError> {
                self.inner.list()
            }
            fn find_by_run_id(&self, run_id: &str) -> Result<Option<Incident>, StoreError> {
                self.inner.find_by_run_id(run_id)
            }
            fn find_duplicate(
                &self,
                service_name: &str,
                error_message: &str,
                window: Duration,
            ) -> Result<Option<Incident>, StoreError> {
                let hit = self.inner.find_duplicate(service_name, error_message, window)?;
                if let Some(existing) = &hit {
                    if !self.fired.swap(true, Ordering::SeqCst) {
                        crate::lifecycle::transition(
                            self.inner.as_ref(),
                            &existing.id,
                            IncidentStatus::WorkflowTriggered,
                        )
                        .expect("concurrent transition");
                        self.inner
                            .set_outcome(
                                &existing.id,
                                IncidentStatus::WorkflowTriggered,
                                &OutcomePatch {
                                    run_id: Some("run-42".to_string()),
                                    ..OutcomePatch::default()
                                },
                                now_ns(),
                            )
                            .expect("record run id");
                    }
                }
                Ok(hit)
            }
            fn append_event(&self, event: &IncidentEvent) -> Result<(), StoreError> {
                self.inner.append_event(event)
            }
            fn events_for(&self, incident_id: &str) -> Result<Vec<IncidentEvent>, StoreError> {
                self.inner.events_for(incident_id)
            }
        }

        let inner = Arc::new(MemoryIncidentStore::new());
        let existing = Incident::from_raw(
            RawIncident::new("svc", "boom"),
            "org/repo",
            IncidentStatus::Pending,
        );
        inner.create(&existing).expect("create");
        let store: Arc<dyn IncidentStore> = Arc::new(PromoteAfterLookup {
            inner: Arc::clone(&inner),
            fired: AtomicBool::new(false),
        });
        let dedup = Deduplicator::new(store);

        let hit = dedup
            .resolve("svc", "boom", WINDOW)
            .expect("resolve")
            .expect("duplicate expected");
        assert_eq!(hit.id, existing.id);

        // The transition that landed mid-resolve survives intact.
        let stored = inner.get(&existing.id).expect("get");
        assert_eq!(stored.status, IncidentStatus::WorkflowTriggered);
        assert_eq!(stored.run_id.as_deref(), Some("run-42"));
    }

    #[test]
    fn different_error_message_is_not_a_duplicate() {
        let existing = Incident::from_raw(
            RawIncident::new("svc", "boom"),
            "org/repo",
            IncidentStatus::Pending,
        );
        let store = store_with(&existing);
        let dedup = Deduplicator::new(store);

        let hit = dedup
            .resolve("svc", "different boom", WINDOW)
            .expect("resolve");
        assert!(hit.is_none());
    }
}
