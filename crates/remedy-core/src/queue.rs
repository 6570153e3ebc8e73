//! Per-repository dispatch admission control.
//!
//! Tracks, per repository, the number of remediation jobs in flight and
//! a FIFO backlog of incidents awaiting a slot. Queueing (not rejecting)
//! protects the downstream CI system while preserving fairness; limits
//! are per-repository and independent.
//!
//! # Invariants
//!
//! - `active` never exceeds the ceiling passed to [`admit`] and never
//!   goes negative: [`release`] floors at zero so stale or duplicate
//!   completion signals are a counter no-op.
//! - The backlog is strict FIFO: first queued is first released,
//!   independent of queue depth or the concurrency limit.
//! - `active` only ever reflects jobs actually in flight; queue depth
//!   only ever reflects jobs awaiting a slot. A popped incident does not
//!   increment `active` — the caller re-enters the admit/dispatch path.
//!
//! # Thread safety
//!
//! All mutation is serialized by a single mutex over the repository map.
//! Contention is bounded by repository count, not incident volume.
//! This state is process-local with an explicit lifecycle (reset on
//! restart); see [`restore_active`](DispatchQueueManager::restore_active)
//! for the startup reconciliation pass.
//!
//! [`admit`]: DispatchQueueManager::admit
//! [`release`]: DispatchQueueManager::release

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, warn};

use crate::incident::Incident;

/// Outcome of an admission decision.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// A slot was taken; the caller must now invoke dispatch-with-retry.
    DispatchNow,
    /// The ceiling is reached; the incident was appended to the FIFO
    /// backlog.
    Queued {
        /// Backlog depth after appending, 1-based.
        depth: usize,
    },
}

#[derive(Debug, Default)]
struct RepoDispatchState {
    active: usize,
    queue: VecDeque<Incident>,
}

/// Per-repository admission control with a FIFO backlog.
#[derive(Debug, Default)]
pub struct DispatchQueueManager {
    state: Mutex<HashMap<String, RepoDispatchState>>,
}

impl DispatchQueueManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits an incident for dispatch against `max_concurrency`.
    ///
    /// Returns [`Admission::DispatchNow`] and takes a slot when capacity
    /// allows, otherwise appends the incident to the repository's FIFO
    /// backlog.
    pub fn admit(
        &self,
        repository: &str,
        incident: Incident,
        max_concurrency: usize,
    ) -> Admission {
        let mut state = self.lock();
        let repo = state.entry(repository.to_string()).or_default();
        if repo.active < max_concurrency {
            repo.active += 1;
            debug!(
                repository,
                incident_id = %incident.id,
                active = repo.active,
                max_concurrency,
                "incident admitted for immediate dispatch"
            );
            Admission::DispatchNow
        } else {
            repo.queue.push_back(incident);
            let depth = repo.queue.len();
            debug!(
                repository,
                active = repo.active,
                depth,
                max_concurrency,
                "concurrency ceiling reached; incident queued"
            );
            Admission::Queued { depth }
        }
    }

    /// Releases one slot for the repository and pops the backlog head,
    /// if any.
    ///
    /// The counter floors at zero: a completion signal with no matching
    /// in-flight job (stale callback, duplicate signal) is logged and
    /// otherwise ignored. The popped incident does not take the freed
    /// slot; the caller must re-enter the admit/dispatch path with it.
    pub fn release(&self, repository: &str) -> Option<Incident> {
        let mut state = self.lock();
        let repo = state.get_mut(repository)?;
        if repo.active == 0 {
            warn!(
                repository,
                "release with no active jobs; stale or duplicate completion signal ignored"
            );
        } else {
            repo.active -= 1;
        }
        let next = repo.queue.pop_front();
        if let Some(incident) = &next {
            debug!(
                repository,
                incident_id = %incident.id,
                active = repo.active,
                remaining = repo.queue.len(),
                "queued incident handed back for dispatch"
            );
        }
        next
    }

    /// Number of jobs currently in flight for the repository.
    #[must_use]
    pub fn active_count(&self, repository: &str) -> usize {
        self.lock().get(repository).map_or(0, |repo| repo.active)
    }

    /// Backlog depth for the repository.
    #[must_use]
    pub fn queued_count(&self, repository: &str) -> usize {
        self.lock().get(repository).map_or(0, |repo| repo.queue.len())
    }

    /// Records one already-in-flight job for the repository without an
    /// admission decision. Used by the startup reconciliation pass that
    /// rebuilds counters from persisted non-terminal incidents; may
    /// leave `active` above the configured ceiling, which simply defers
    /// new admissions until completions drain it.
    pub fn restore_active(&self, repository: &str) {
        let mut state = self.lock();
        let repo = state.entry(repository.to_string()).or_default();
        repo.active += 1;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, RepoDispatchState>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::incident::{IncidentStatus, RawIncident};

    fn incident(tag: &str) -> Incident {
        Incident::from_raw(
            RawIncident::new("svc", format!("boom {tag}")),
            "org/repo",
            IncidentStatus::Pending,
        )
    }

    #[test]
    fn admits_up_to_the_ceiling_then_queues() {
        let manager = DispatchQueueManager::new();
        assert_eq!(manager.admit("org/repo", incident("a"), 2), Admission::DispatchNow);
        assert_eq!(manager.admit("org/repo", incident("b"), 2), Admission::DispatchNow);
        assert_eq!(
            manager.admit("org/repo", incident("c"), 2),
            Admission::Queued { depth: 1 }
        );
        assert_eq!(
            manager.admit("org/repo", incident("d"), 2),
            Admission::Queued { depth: 2 }
        );
        assert_eq!(manager.active_count("org/repo"), 2);
        assert_eq!(manager.queued_count("org/repo"), 2);
    }

    #[test]
    fn release_pops_strict_fifo_order() {
        let manager = DispatchQueueManager::new();
        assert_eq!(manager.admit("org/repo", incident("running"), 1), Admission::DispatchNow);
        let a = incident("a");
        let b = incident("b");
        let c = incident("c");
        manager.admit("org/repo", a.clone(), 1);
        manager.admit("org/repo", b.clone(), 1);
        manager.admit("org/repo", c.clone(), 1);

        assert_eq!(manager.release("org/repo").map(|i| i.id), Some(a.id));
        assert_eq!(manager.release("org/repo").map(|i| i.id), Some(b.id));
        assert_eq!(manager.release("org/repo").map(|i| i.id), Some(c.id));
        assert_eq!(manager.release("org/repo"), None);
    }

    #[test]
    fn release_does_not_underflow() {
        let manager = DispatchQueueManager::new();
        manager.admit("org/repo", incident("a"), 4);
        for _ in 0..10 {
            manager.release("org/repo");
        }
        assert_eq!(manager.active_count("org/repo"), 0);
    }

    #[test]
    fn release_for_unknown_repository_is_a_noop() {
        let manager = DispatchQueueManager::new();
        assert_eq!(manager.release("org/never-seen"), None);
        assert_eq!(manager.active_count("org/never-seen"), 0);
    }

    #[test]
    fn popped_incident_does_not_take_the_slot() {
        let manager = DispatchQueueManager::new();
        manager.admit("org/repo", incident("running"), 1);
        manager.admit("org/repo", incident("waiting"), 1);

        let next = manager.release("org/repo");
        assert!(next.is_some());
        // The slot stays free until the caller re-admits.
        assert_eq!(manager.active_count("org/repo"), 0);
        assert_eq!(manager.queued_count("org/repo"), 0);
    }

    #[test]
    fn repositories_are_limited_independently() {
        let manager = DispatchQueueManager::new();
        assert_eq!(manager.admit("org/a", incident("a1"), 1), Admission::DispatchNow);
        assert_eq!(
            manager.admit("org/a", incident("a2"), 1),
            Admission::Queued { depth: 1 }
        );
        // org/b has its own budget.
        assert_eq!(manager.admit("org/b", incident("b1"), 1), Admission::DispatchNow);
        assert_eq!(manager.active_count("org/a"), 1);
        assert_eq!(manager.active_count("org/b"), 1);
        assert_eq!(manager.queued_count("org/b"), 0);
    }

    #[test]
    fn end_to_end_slot_cycle_with_ceiling_one() {
        let manager = DispatchQueueManager::new();
        let inc1 = incident("1");
        let inc2 = incident("2");

        assert_eq!(manager.admit("r", inc1, 1), Admission::DispatchNow);
        assert_eq!(manager.active_count("r"), 1);

        assert_eq!(manager.admit("r", inc2.clone(), 1), Admission::Queued { depth: 1 });

        let handed_back = manager.release("r").expect("inc2 handed back");
        assert_eq!(handed_back.id, inc2.id);
        assert_eq!(manager.active_count("r"), 0);
        assert_eq!(manager.queued_count("r"), 0);

        assert_eq!(manager.admit("r", handed_back, 1), Admission::DispatchNow);
        assert_eq!(manager.active_count("r"), 1);
    }

    #[test]
    fn restore_active_rebuilds_in_flight_counters() {
        let manager = DispatchQueueManager::new();
        manager.restore_active("org/repo");
        manager.restore_active("org/repo");
        assert_eq!(manager.active_count("org/repo"), 2);
        // With the ceiling already consumed, new work queues.
        assert_eq!(
            manager.admit("org/repo", incident("x"), 2),
            Admission::Queued { depth: 1 }
        );
    }

    #[test]
    fn ceiling_is_never_exceeded_under_concurrent_admits() {
        const CEILING: usize = 4;
        let manager = Arc::new(DispatchQueueManager::new());

        let handles: Vec<_> = (0..16)
            .map(|worker| {
                let manager = Arc::clone(&manager);
                thread::spawn(move || {
                    let mut dispatched = 0usize;
                    for n in 0..25 {
                        match manager.admit("org/repo", incident(&format!("{worker}-{n}")), CEILING)
                        {
                            Admission::DispatchNow => {
                                dispatched += 1;
                                assert!(manager.active_count("org/repo") <= CEILING);
                                manager.release("org/repo");
                            },
                            Admission::Queued { .. } => {
                                // Drain one backlog entry to keep the test bounded.
                                let _ = manager.release("org/repo");
                            },
                        }
                    }
                    dispatched
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("worker thread");
        }
        assert!(manager.active_count("org/repo") <= CEILING);
    }
}
