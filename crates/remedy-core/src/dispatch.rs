//! Dispatch transport contract and the retry policy around it.
//!
//! The transport is a synchronous remote call bounded by a
//! caller-supplied timeout; a timeout counts as a failed attempt. The
//! [`Dispatcher`] wraps it in bounded exponential-backoff retry and owns
//! the incident-side bookkeeping: success transitions the incident to
//! `workflow_triggered` and records the run id, exhaustion transitions
//! it to `failed` and releases the admitted slot so a permanently
//! failing dispatch never leaks concurrency budget.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::json;
use tracing::{info, warn};

use crate::clock::now_ns;
use crate::error::{DispatchError, EngineError};
use crate::incident::{Incident, IncidentEvent, IncidentEventKind, IncidentStatus, Severity};
use crate::lifecycle;
use crate::queue::DispatchQueueManager;
use crate::store::{IncidentStore, OutcomePatch};

/// Largest backoff exponent; attempts beyond this reuse the same delay.
const MAX_BACKOFF_SHIFT: u32 = 16;

/// The incident context handed to the remediation workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchContext {
    /// The incident being remediated.
    pub incident_id: String,
    /// The failing service.
    pub service_name: String,
    /// The error message identifying the failure.
    pub error_message: String,
    /// Reported severity.
    pub severity: Severity,
    /// Branch the workflow runs against.
    pub branch: String,
}

impl DispatchContext {
    /// Builds the context for an incident routed to `branch`.
    #[must_use]
    pub fn for_incident(incident: &Incident, branch: impl Into<String>) -> Self {
        Self {
            incident_id: incident.id.clone(),
            service_name: incident.service_name.clone(),
            error_message: incident.error_message.clone(),
            severity: incident.severity,
            branch: branch.into(),
        }
    }
}

/// A remote call that triggers the external remediation job.
pub trait DispatchTransport: Send + Sync {
    /// Triggers the remediation workflow for `repository` and returns
    /// the external run identifier.
    ///
    /// The call must not outlive `timeout`; implementations that cannot
    /// bound the underlying operation must enforce the deadline
    /// themselves and report [`DispatchError::Timeout`].
    ///
    /// # Errors
    ///
    /// Returns a [`DispatchError`] on timeout or transport failure; each
    /// error counts as one failed attempt.
    fn dispatch(
        &self,
        repository: &str,
        context: &DispatchContext,
        timeout: Duration,
    ) -> Result<String, DispatchError>;
}

/// Retry policy for dispatch attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Must be at least 1.
    pub max_attempts: u32,
    /// Base delay before the second attempt; doubles each retry.
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given retry (1-based attempt that just failed).
    #[must_use]
    pub fn backoff_for(&self, failed_attempt: u32) -> Duration {
        let shift = failed_attempt.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
        self.backoff_base.saturating_mul(1_u32 << shift)
    }
}

/// Outcome of a dispatch-with-retry run.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The workflow was triggered; the incident is `workflow_triggered`.
    Triggered {
        /// External run identifier returned by the transport.
        run_id: String,
    },
    /// All attempts failed; the incident is `failed`, its slot was
    /// released, and the backlog head (if any) is handed back for
    /// dispatch.
    Failed {
        /// Total attempts made.
        attempts: u32,
        /// Next queued incident freed by the released slot.
        next: Option<Incident>,
    },
}

/// Dispatch-with-retry over a transport, store, and queue manager.
pub struct Dispatcher {
    store: Arc<dyn IncidentStore>,
    transport: Arc<dyn DispatchTransport>,
    queue: Arc<DispatchQueueManager>,
}

impl Dispatcher {
    /// Creates a dispatcher.
    #[must_use]
    pub fn new(
        store: Arc<dyn IncidentStore>,
        transport: Arc<dyn DispatchTransport>,
        queue: Arc<DispatchQueueManager>,
    ) -> Self {
        Self {
            store,
            transport,
            queue,
        }
    }

    /// Runs dispatch-with-retry for an incident that holds an admitted
    /// slot.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] or
    /// [`EngineError::InvalidTransition`] for bookkeeping failures.
    /// Transport exhaustion is not an error here: it is reported as
    /// [`DispatchOutcome::Failed`] per the propagation policy.
    pub fn dispatch_admitted(
        &self,
        repository: &str,
        incident: &Incident,
        branch: &str,
        policy: &RetryPolicy,
        timeout: Duration,
    ) -> Result<DispatchOutcome, EngineError> {
        let context = DispatchContext::for_incident(incident, branch);
        let max_attempts = policy.max_attempts.max(1);
        let mut last_error: Option<DispatchError> = None;

        for attempt in 1..=max_attempts {
            match self.transport.dispatch(repository, &context, timeout) {
                Ok(run_id) => {
                    self.record_triggered(incident, repository, &run_id)?;
                    return Ok(DispatchOutcome::Triggered { run_id });
                },
                Err(err) => {
                    warn!(
                        repository,
                        incident_id = %incident.id,
                        attempt,
                        max_attempts,
                        error = %err,
                        "dispatch attempt failed"
                    );
                    last_error = Some(err);
                    if attempt < max_attempts {
                        std::thread::sleep(policy.backoff_for(attempt));
                    }
                },
            }
        }

        let next = self.record_exhausted(incident, repository, max_attempts, last_error)?;
        Ok(DispatchOutcome::Failed {
            attempts: max_attempts,
            next,
        })
    }

    fn record_triggered(
        &self,
        incident: &Incident,
        repository: &str,
        run_id: &str,
    ) -> Result<(), EngineError> {
        lifecycle::transition(self.store.as_ref(), &incident.id, IncidentStatus::WorkflowTriggered)?;
        // Guarded field-scoped write; a lost race surfaces as a status
        // conflict rather than a silent overwrite.
        self.store.set_outcome(
            &incident.id,
            IncidentStatus::WorkflowTriggered,
            &OutcomePatch {
                run_id: Some(run_id.to_string()),
                ..OutcomePatch::default()
            },
            now_ns(),
        )?;
        self.store.append_event(&IncidentEvent::new(
            &incident.id,
            IncidentEventKind::Triggered,
            json!({ "repository": repository, "run_id": run_id }),
        ))?;
        info!(
            repository,
            incident_id = %incident.id,
            run_id,
            "remediation workflow triggered"
        );
        Ok(())
    }

    fn record_exhausted(
        &self,
        incident: &Incident,
        repository: &str,
        attempts: u32,
        last_error: Option<DispatchError>,
    ) -> Result<Option<Incident>, EngineError> {
        lifecycle::transition(self.store.as_ref(), &incident.id, IncidentStatus::Failed)?;
        self.store.append_event(&IncidentEvent::new(
            &incident.id,
            IncidentEventKind::Failed,
            json!({
                "repository": repository,
                "attempts": attempts,
                "last_error": last_error.map(|err| err.to_string()),
            }),
        ))?;
        warn!(
            repository,
            incident_id = %incident.id,
            attempts,
            "dispatch abandoned after exhausting retries; slot released"
        );
        // Release the admitted slot so a permanently failing dispatch
        // does not leak concurrency budget.
        Ok(self.queue.release(repository))
    }
}

// ---------------------------------------------------------------------------
// StubDispatchTransport
// ---------------------------------------------------------------------------

/// A recorded transport call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchCall {
    /// Target repository of the call.
    pub repository: String,
    /// Context the call carried.
    pub context: DispatchContext,
}

/// Scripted in-memory transport for tests.
///
/// Responses are consumed FIFO; once the script is exhausted every call
/// succeeds with a generated `run-N` identifier.
#[derive(Debug, Default)]
pub struct StubDispatchTransport {
    script: Mutex<std::collections::VecDeque<Result<String, DispatchError>>>,
    calls: Mutex<Vec<DispatchCall>>,
    counter: AtomicU64,
}

impl StubDispatchTransport {
    /// Creates a stub whose calls all succeed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one scripted response.
    pub fn push_response(&self, response: Result<String, DispatchError>) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(response);
    }

    /// Scripts `n` consecutive transport failures.
    pub fn fail_times(&self, n: usize) {
        for _ in 0..n {
            self.push_response(Err(DispatchError::Transport(
                "scripted failure".to_string(),
            )));
        }
    }

    /// Returns all recorded calls.
    #[must_use]
    pub fn calls(&self) -> Vec<DispatchCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl DispatchTransport for StubDispatchTransport {
    fn dispatch(
        &self,
        repository: &str,
        context: &DispatchContext,
        _timeout: Duration,
    ) -> Result<String, DispatchError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(DispatchCall {
                repository: repository.to_string(),
                context: context.clone(),
            });
        let scripted = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        scripted.unwrap_or_else(|| {
            let n = self.counter.fetch_add(1, Ordering::Relaxed);
            Ok(format!("run-{n}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incident::RawIncident;
    use crate::store::MemoryIncidentStore;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff_base: Duration::from_millis(1),
        }
    }

    fn setup() -> (Arc<MemoryIncidentStore>, Arc<StubDispatchTransport>, Arc<DispatchQueueManager>, Dispatcher)
    {
        let store = Arc::new(MemoryIncidentStore::new());
        let transport = Arc::new(StubDispatchTransport::new());
        let queue = Arc::new(DispatchQueueManager::new());
        let dispatcher = Dispatcher::new(
            Arc::clone(&store) as Arc<dyn IncidentStore>,
            Arc::clone(&transport) as Arc<dyn DispatchTransport>,
            Arc::clone(&queue),
        );
        (store, transport, queue, dispatcher)
    }

    fn admitted_incident(
        store: &MemoryIncidentStore,
        queue: &DispatchQueueManager,
    ) -> Incident {
        let incident = Incident::from_raw(
            RawIncident::new("svc", "boom"),
            "org/repo",
            IncidentStatus::Pending,
        );
        store.create(&incident).expect("create");
        queue.admit("org/repo", incident.clone(), 1);
        incident
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_base: Duration::from_millis(100),
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(400));
    }

    #[test]
    fn success_triggers_workflow_and_records_run_id() {
        let (store, transport, queue, dispatcher) = setup();
        let incident = admitted_incident(&store, &queue);

        let outcome = dispatcher
            .dispatch_admitted("org/repo", &incident, "main", &fast_policy(), Duration::from_secs(5))
            .expect("dispatch");
        let DispatchOutcome::Triggered { run_id } = outcome else {
            panic!("expected triggered outcome");
        };

        let stored = store.get(&incident.id).expect("get");
        assert_eq!(stored.status, IncidentStatus::WorkflowTriggered);
        assert_eq!(stored.run_id, Some(run_id));
        assert!(stored.triggered_at_ns.is_some());
        assert_eq!(transport.calls().len(), 1);
        // Success keeps the slot; only a completion releases it.
        assert_eq!(queue.active_count("org/repo"), 1);
    }

    #[test]
    fn transient_failure_retries_then_succeeds() {
        let (store, transport, queue, dispatcher) = setup();
        let incident = admitted_incident(&store, &queue);
        transport.fail_times(2);

        let outcome = dispatcher
            .dispatch_admitted("org/repo", &incident, "main", &fast_policy(), Duration::from_secs(5))
            .expect("dispatch");
        assert!(matches!(outcome, DispatchOutcome::Triggered { .. }));
        assert_eq!(transport.calls().len(), 3);
    }

    #[test]
    fn exhaustion_fails_incident_and_releases_slot() {
        let (store, transport, queue, dispatcher) = setup();
        let incident = admitted_incident(&store, &queue);
        transport.fail_times(3);

        let outcome = dispatcher
            .dispatch_admitted("org/repo", &incident, "main", &fast_policy(), Duration::from_secs(5))
            .expect("dispatch");
        let DispatchOutcome::Failed { attempts, next } = outcome else {
            panic!("expected failed outcome");
        };
        assert_eq!(attempts, 3);
        assert!(next.is_none());

        let stored = store.get(&incident.id).expect("get");
        assert_eq!(stored.status, IncidentStatus::Failed);
        assert!(stored.completed_at_ns.is_some());
        assert_eq!(queue.active_count("org/repo"), 0);

        let events = store.events_for(&incident.id).expect("events");
        let failed = events
            .iter()
            .find(|event| event.kind == IncidentEventKind::Failed)
            .expect("diagnostic failed event");
        assert_eq!(failed.detail["attempts"], 3);
        assert!(failed.detail["last_error"].is_string());
    }

    #[test]
    fn exhaustion_hands_back_the_backlog_head() {
        let (store, transport, queue, dispatcher) = setup();
        let incident = admitted_incident(&store, &queue);
        let waiting = Incident::from_raw(
            RawIncident::new("svc", "boom 2"),
            "org/repo",
            IncidentStatus::Pending,
        );
        store.create(&waiting).expect("create");
        queue.admit("org/repo", waiting.clone(), 1);
        transport.fail_times(3);

        let outcome = dispatcher
            .dispatch_admitted("org/repo", &incident, "main", &fast_policy(), Duration::from_secs(5))
            .expect("dispatch");
        let DispatchOutcome::Failed { next, .. } = outcome else {
            panic!("expected failed outcome");
        };
        assert_eq!(next.map(|i| i.id), Some(waiting.id));
    }

    #[test]
    fn timeout_counts_as_a_failed_attempt() {
        let (store, transport, queue, dispatcher) = setup();
        let incident = admitted_incident(&store, &queue);
        transport.push_response(Err(DispatchError::Timeout {
            repository: "org/repo".to_string(),
            timeout_secs: 5,
        }));

        let outcome = dispatcher
            .dispatch_admitted("org/repo", &incident, "main", &fast_policy(), Duration::from_secs(5))
            .expect("dispatch");
        assert!(matches!(outcome, DispatchOutcome::Triggered { .. }));
        assert_eq!(transport.calls().len(), 2);
    }

    #[test]
    fn context_carries_incident_fields() {
        let incident = Incident::from_raw(
            RawIncident::new("checkout", "payment timeout").with_severity(Severity::Critical),
            "org/checkout",
            IncidentStatus::Pending,
        );
        let context = DispatchContext::for_incident(&incident, "main");
        assert_eq!(context.incident_id, incident.id);
        assert_eq!(context.service_name, "checkout");
        assert_eq!(context.severity, Severity::Critical);
        assert_eq!(context.branch, "main");
    }
}
