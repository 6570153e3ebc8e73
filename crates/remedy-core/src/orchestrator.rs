//! The composition root.
//!
//! Wires deduplication, routing, persistence, the lifecycle gate, and
//! admission control into the three inbound operations: incident
//! creation, workflow-completion callbacks, and manual re-trigger.
//!
//! # Thread safety
//!
//! All operations take `&self` and may be invoked concurrently from
//! independent inbound requests and completion callbacks. Shared state
//! is the queue manager (single coarse lock), the routing snapshot, the
//! config snapshot, and the store.

use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::clock::now_ns;
use crate::config::EngineConfig;
use crate::dedup::Deduplicator;
use crate::dispatch::{Dispatcher, DispatchOutcome, DispatchTransport};
use crate::error::EngineError;
use crate::incident::{
    Incident, IncidentEvent, IncidentEventKind, IncidentStatus, RawIncident,
};
use crate::lifecycle;
use crate::queue::{Admission, DispatchQueueManager};
use crate::routing::{RoutingTable, ServiceMapping};
use crate::store::{IncidentStore, OutcomePatch};

/// Branch used when an incident's route has vanished between admission
/// and dispatch (routing reload removed the service).
const FALLBACK_BRANCH: &str = "main";

/// Terminal outcome reported by the external remediation workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowOutcome {
    /// The workflow produced a pull request.
    PrCreated,
    /// The workflow failed.
    Failed,
    /// The workflow decided no code change is needed.
    NoFixNeeded,
}

impl WorkflowOutcome {
    const fn target_status(self) -> IncidentStatus {
        match self {
            Self::PrCreated => IncidentStatus::PrCreated,
            Self::Failed => IncidentStatus::Failed,
            Self::NoFixNeeded => IncidentStatus::NoFixNeeded,
        }
    }

    const fn event_kind(self) -> Option<IncidentEventKind> {
        match self {
            Self::PrCreated => Some(IncidentEventKind::PrCreated),
            Self::Failed => Some(IncidentEventKind::Failed),
            // The status_changed event already records the no-fix
            // endpoint; there is no separate audit kind for it.
            Self::NoFixNeeded => None,
        }
    }
}

/// What happened to an incident when it entered the dispatch path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchDisposition {
    /// The workflow was triggered immediately.
    Triggered {
        /// External run identifier.
        run_id: String,
    },
    /// The repository was saturated; the incident waits in the backlog.
    Queued {
        /// Backlog depth after queueing, 1-based.
        depth: usize,
    },
    /// Dispatch exhausted its retries; the incident is `failed`.
    Failed {
        /// Total attempts made.
        attempts: u32,
    },
}

/// Result of [`Orchestrator::create_incident`].
#[derive(Debug)]
pub enum IncidentOutcome {
    /// A fresh incident was created and entered the dispatch path.
    Created {
        /// The persisted incident as of creation.
        incident: Incident,
        /// What the dispatch path did with it.
        disposition: DispatchDisposition,
    },
    /// The submission collapsed into an existing open incident.
    Duplicate(Incident),
    /// No route exists for the service; persisted directly as `failed`.
    Unroutable(Incident),
}

/// The orchestration engine.
pub struct Orchestrator {
    store: Arc<dyn IncidentStore>,
    routes: RoutingTable,
    queue: Arc<DispatchQueueManager>,
    config: RwLock<Arc<EngineConfig>>,
    dedup: Deduplicator,
    dispatcher: Dispatcher,
}

impl Orchestrator {
    /// Builds an orchestrator over a store, transport, routing set, and
    /// config.
    #[must_use]
    pub fn new(
        store: Arc<dyn IncidentStore>,
        transport: Arc<dyn DispatchTransport>,
        mappings: Vec<ServiceMapping>,
        config: EngineConfig,
    ) -> Self {
        let queue = Arc::new(DispatchQueueManager::new());
        Self {
            dedup: Deduplicator::new(Arc::clone(&store)),
            dispatcher: Dispatcher::new(Arc::clone(&store), transport, Arc::clone(&queue)),
            routes: RoutingTable::new(mappings),
            queue,
            config: RwLock::new(Arc::new(config)),
            store,
        }
    }

    /// Ingests a normalized incident: dedup, route, persist, dispatch.
    ///
    /// Routing misses are not errors; they produce
    /// [`IncidentOutcome::Unroutable`] with the incident persisted as
    /// `failed`. Dispatch retry exhaustion is likewise folded into
    /// [`DispatchDisposition::Failed`].
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] for malformed input (nothing
    /// persisted) and [`EngineError::Store`] for persistence failures.
    pub fn create_incident(&self, raw: RawIncident) -> Result<IncidentOutcome, EngineError> {
        raw.validate()?;
        let config = self.config_snapshot();

        if let Some(existing) =
            self.dedup
                .resolve(&raw.service_name, &raw.error_message, config.dedup_window())?
        {
            return Ok(IncidentOutcome::Duplicate(existing));
        }

        let Some(route) = self.routes.lookup(&raw.service_name) else {
            let incident = Incident::from_raw(raw, "", IncidentStatus::Failed);
            self.store.create(&incident)?;
            self.store.append_event(&IncidentEvent::new(
                &incident.id,
                IncidentEventKind::Received,
                json!({ "service_name": incident.service_name, "provider": incident.provider }),
            ))?;
            self.store.append_event(&IncidentEvent::new(
                &incident.id,
                IncidentEventKind::Failed,
                json!({ "reason": "unroutable", "service_name": incident.service_name }),
            ))?;
            warn!(
                incident_id = %incident.id,
                service = %incident.service_name,
                "no route for service; incident persisted as failed"
            );
            return Ok(IncidentOutcome::Unroutable(incident));
        };

        let incident = Incident::from_raw(raw, route.repository.clone(), IncidentStatus::Pending);
        self.store.create(&incident)?;
        self.store.append_event(&IncidentEvent::new(
            &incident.id,
            IncidentEventKind::Received,
            json!({
                "service_name": incident.service_name,
                "repository": incident.repository,
                "provider": incident.provider,
                "severity": incident.severity.as_str(),
            }),
        ))?;
        info!(
            incident_id = %incident.id,
            service = %incident.service_name,
            repository = %incident.repository,
            "incident created"
        );

        let disposition = self.dispatch_chain(&route.repository, incident.clone())?;
        Ok(IncidentOutcome::Created {
            incident,
            disposition,
        })
    }

    /// Handles the external workflow's completion signal.
    ///
    /// Advances the incident per `outcome`, records the PR URL and
    /// diagnosis when supplied, releases the repository's dispatch slot,
    /// and dispatches the backlog head freed by it. A callback for an
    /// incident already in a terminal state is accepted idempotently:
    /// logged, no transition, and no release (the slot was already freed
    /// by whichever path completed it first).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::IncidentNotFound`] for an unknown run id,
    /// [`EngineError::InvalidTransition`] for a lost transition race,
    /// and [`EngineError::Store`] for persistence failures.
    pub fn on_workflow_completion(
        &self,
        repository: &str,
        run_id: &str,
        outcome: WorkflowOutcome,
        diagnosis: Option<&str>,
        pr_url: Option<&str>,
    ) -> Result<(), EngineError> {
        let incident = self
            .store
            .find_by_run_id(run_id)?
            .ok_or_else(|| EngineError::IncidentNotFound(run_id.to_string()))?;

        if incident.status.is_terminal_for_cycle() {
            info!(
                incident_id = %incident.id,
                run_id,
                status = %incident.status,
                "stale completion callback for terminal incident ignored"
            );
            return Ok(());
        }

        // A callback can arrive before any in-progress signal; bridge
        // through in_progress so the transition table holds.
        if incident.status == IncidentStatus::WorkflowTriggered {
            lifecycle::transition(self.store.as_ref(), &incident.id, IncidentStatus::InProgress)?;
        }

        let updated =
            lifecycle::transition(self.store.as_ref(), &incident.id, outcome.target_status())?;
        if pr_url.is_some() || diagnosis.is_some() {
            // Field-scoped write guarded by the status the transition
            // just produced; never a whole-record overwrite.
            self.store.set_outcome(
                &incident.id,
                updated.status,
                &OutcomePatch {
                    run_id: None,
                    pr_url: pr_url.map(str::to_string),
                    diagnosis: diagnosis.map(str::to_string),
                },
                now_ns(),
            )?;
        }
        if let Some(kind) = outcome.event_kind() {
            self.store.append_event(&IncidentEvent::new(
                &incident.id,
                kind,
                json!({ "run_id": run_id, "pr_url": pr_url, "diagnosis": diagnosis }),
            ))?;
        }
        info!(
            incident_id = %incident.id,
            run_id,
            status = %updated.status,
            "workflow completion recorded"
        );

        if let Some(next) = self.queue.release(repository) {
            self.store.append_event(&IncidentEvent::new(
                &next.id,
                IncidentEventKind::Dequeued,
                json!({ "repository": repository }),
            ))?;
            self.dispatch_chain(repository, next)?;
        }
        Ok(())
    }

    /// Re-enters the dispatch path for an incident by operator request.
    ///
    /// Permitted only for `pending` and `failed` incidents; a `failed`
    /// incident takes the explicit retry transition back to `pending`
    /// first.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::IncidentNotFound`] for an unknown id,
    /// [`EngineError::InvalidTransition`] when the incident is mid-flight
    /// or terminal, [`EngineError::UnroutableService`] when it has no
    /// repository to dispatch against, and [`EngineError::Store`] for
    /// persistence failures.
    pub fn manual_trigger(&self, incident_id: &str) -> Result<DispatchDisposition, EngineError> {
        let incident = self.store.get(incident_id).map_err(|err| match err {
            crate::error::StoreError::NotFound(id) => EngineError::IncidentNotFound(id),
            other => EngineError::Store(other),
        })?;

        if !matches!(
            incident.status,
            IncidentStatus::Pending | IncidentStatus::Failed
        ) {
            return Err(EngineError::InvalidTransition {
                incident_id: incident_id.to_string(),
                from: incident.status,
                to: IncidentStatus::Pending,
            });
        }
        if incident.repository.is_empty() {
            return Err(EngineError::UnroutableService {
                service: incident.service_name,
            });
        }

        let incident = if incident.status == IncidentStatus::Failed {
            lifecycle::transition(self.store.as_ref(), incident_id, IncidentStatus::Pending)?
        } else {
            incident
        };

        self.store.append_event(&IncidentEvent::new(
            incident_id,
            IncidentEventKind::ManualTrigger,
            json!({ "repository": incident.repository }),
        ))?;
        info!(incident_id, repository = %incident.repository, "manual trigger accepted");

        let repository = incident.repository.clone();
        self.dispatch_chain(&repository, incident)
    }

    /// Marks a `pr_created` incident resolved (merged or fixed out of
    /// band).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::IncidentNotFound`] for an unknown id and
    /// [`EngineError::InvalidTransition`] from any status other than
    /// `pr_created`.
    pub fn mark_resolved(&self, incident_id: &str) -> Result<Incident, EngineError> {
        let incident =
            lifecycle::transition(self.store.as_ref(), incident_id, IncidentStatus::Resolved)?;
        self.store.append_event(&IncidentEvent::new(
            incident_id,
            IncidentEventKind::Resolved,
            json!({ "pr_url": incident.pr_url }),
        ))?;
        Ok(incident)
    }

    /// Rebuilds in-flight dispatch counters from persisted status after
    /// a restart.
    ///
    /// Every incident in an active-dispatch status counts one slot for
    /// its repository; the restored count may exceed the configured
    /// ceiling, which defers new admissions until completions drain it.
    /// Returns the number of restored slots.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if listing fails.
    pub fn recover(&self) -> Result<usize, EngineError> {
        let mut restored = 0;
        for incident in self.store.list()? {
            if incident.status.is_dispatch_active() && !incident.repository.is_empty() {
                self.queue.restore_active(&incident.repository);
                restored += 1;
            }
        }
        if restored > 0 {
            info!(restored, "restored in-flight dispatch slots from persisted status");
        }
        Ok(restored)
    }

    /// Swaps in a new config; applies to subsequent admissions only.
    pub fn reload_config(&self, config: EngineConfig) {
        *self
            .config
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(config);
        info!("engine config reloaded");
    }

    /// Swaps in a new routing set; in-flight lookups finish against the
    /// snapshot they started with.
    pub fn reload_routes(&self, mappings: Vec<ServiceMapping>) {
        self.routes.reload(mappings);
    }

    /// Read-only admission-control introspection.
    #[must_use]
    pub fn queue(&self) -> &DispatchQueueManager {
        &self.queue
    }

    /// The incident store this orchestrator persists through.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn IncidentStore> {
        &self.store
    }

    fn config_snapshot(&self) -> Arc<EngineConfig> {
        Arc::clone(&self.config.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Admits an incident and, when admitted, runs dispatch-with-retry.
    /// A failed dispatch hands back the backlog head it freed, which
    /// re-enters admission here until the chain settles.
    ///
    /// Returns the disposition of the incident the caller passed in;
    /// chained backlog incidents record their own events and state.
    fn dispatch_chain(
        &self,
        repository: &str,
        incident: Incident,
    ) -> Result<DispatchDisposition, EngineError> {
        let mut current = incident;
        let mut first: Option<DispatchDisposition> = None;

        loop {
            let config = self.config_snapshot();
            let ceiling = config.max_concurrency_for(repository);
            let next = match self.queue.admit(repository, current.clone(), ceiling) {
                Admission::Queued { depth } => {
                    self.store.append_event(&IncidentEvent::new(
                        &current.id,
                        IncidentEventKind::Queued,
                        json!({ "repository": repository, "depth": depth }),
                    ))?;
                    first.get_or_insert(DispatchDisposition::Queued { depth });
                    None
                },
                Admission::DispatchNow => {
                    let branch = self
                        .routes
                        .lookup(&current.service_name)
                        .map_or_else(|| FALLBACK_BRANCH.to_string(), |route| route.branch);
                    match self.dispatcher.dispatch_admitted(
                        repository,
                        &current,
                        &branch,
                        config.retry(),
                        config.dispatch_timeout(),
                    )? {
                        DispatchOutcome::Triggered { run_id } => {
                            first.get_or_insert(DispatchDisposition::Triggered { run_id });
                            None
                        },
                        DispatchOutcome::Failed { attempts, next } => {
                            first.get_or_insert(DispatchDisposition::Failed { attempts });
                            next
                        },
                    }
                },
            };

            match next {
                Some(handed_back) => {
                    self.store.append_event(&IncidentEvent::new(
                        &handed_back.id,
                        IncidentEventKind::Dequeued,
                        json!({ "repository": repository }),
                    ))?;
                    current = handed_back;
                },
                None => break,
            }
        }

        // The loop records a disposition on its first iteration.
        first.ok_or_else(|| {
            EngineError::Validation("dispatch chain settled without a disposition".to_string())
        })
    }
}
