//! Service to repository routing.
//!
//! The routing table is an immutable snapshot swapped atomically on
//! reload: lookups against one snapshot are pure, side-effect-free, and
//! deterministic, and a reload never tears an in-flight lookup.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::info;

/// One static routing fact: which repository (and branch) remediates a
/// service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMapping {
    /// The service name as providers report it.
    pub service: String,
    /// Target repository, e.g. `org/repo`.
    pub repository: String,
    /// Branch the remediation workflow runs against.
    pub branch: String,
}

/// A resolved route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Target repository.
    pub repository: String,
    /// Branch the remediation workflow runs against.
    pub branch: String,
}

#[derive(Debug, Default)]
struct RouteSet {
    routes: HashMap<String, Route>,
}

impl RouteSet {
    fn from_mappings(mappings: Vec<ServiceMapping>) -> Self {
        let mut routes = HashMap::with_capacity(mappings.len());
        // Later entries win on duplicate service names.
        for mapping in mappings {
            routes.insert(
                mapping.service,
                Route {
                    repository: mapping.repository,
                    branch: mapping.branch,
                },
            );
        }
        Self { routes }
    }
}

/// Atomic-snapshot routing table.
#[derive(Debug)]
pub struct RoutingTable {
    snapshot: RwLock<Arc<RouteSet>>,
}

impl RoutingTable {
    /// Builds a routing table from mappings. Duplicate service names
    /// resolve to the last entry.
    #[must_use]
    pub fn new(mappings: Vec<ServiceMapping>) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(RouteSet::from_mappings(mappings))),
        }
    }

    /// Resolves a service name against the current snapshot.
    #[must_use]
    pub fn lookup(&self, service: &str) -> Option<Route> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .routes
            .get(service)
            .cloned()
    }

    /// Replaces the snapshot with a new immutable set. In-flight lookups
    /// finish against the snapshot they started with.
    pub fn reload(&self, mappings: Vec<ServiceMapping>) {
        let next = Arc::new(RouteSet::from_mappings(mappings));
        let count = next.routes.len();
        *self
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner) = next;
        info!(routes = count, "routing table reloaded");
    }

    /// Number of routable services in the current snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .routes
            .len()
    }

    /// Returns `true` if no services are routable.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
