//! Incident data model.
//!
//! An [`Incident`] is a normalized record of one detected failure: the
//! unit of work flowing through deduplication, routing, and dispatch.
//! Provider webhook adapters produce a [`RawIncident`]; the orchestrator
//! owns identity assignment, routing, and all status mutation.
//!
//! # Invariants
//!
//! - `id` is immutable once created.
//! - `triggered_at_ns` is set exactly once, the first time status leaves
//!   `pending` toward `workflow_triggered`.
//! - `completed_at_ns` is set exactly once, the first time status
//!   reaches a terminal-for-this-cycle state.
//! - `provider_data` is an open, schema-less bag; the engine never
//!   interprets it.

mod event;
mod status;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub use event::{IncidentEvent, IncidentEventKind, ParseEventKindError};
pub use status::{IncidentStatus, ParseStatusError};

use crate::clock::now_ns;
use crate::error::EngineError;

/// Maximum accepted length for a service name.
pub const MAX_SERVICE_NAME_LEN: usize = 256;

/// Maximum accepted length for an error message.
pub const MAX_ERROR_MESSAGE_LEN: usize = 16 * 1024;

/// Maximum accepted length for a provider name.
pub const MAX_PROVIDER_LEN: usize = 128;

/// Incident severity as reported by the observability provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Service-down or data-loss class failure.
    Critical,
    /// Major degradation.
    High,
    /// Default severity when the provider reports none we recognize.
    Medium,
    /// Minor degradation.
    Low,
    /// Informational signal.
    Info,
}

impl Severity {
    /// Parses a severity from a provider string.
    ///
    /// Unknown values default to `Medium`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Self::Critical,
            "high" => Self::High,
            "low" => Self::Low,
            "info" => Self::Info,
            // "medium" or any unknown value defaults to Medium.
            _ => Self::Medium,
        }
    }

    /// Returns the severity as its canonical string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Info => "info",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

/// A normalized incident as produced by a provider webhook adapter,
/// before identity assignment and routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawIncident {
    /// The failing service, as the provider names it.
    pub service_name: String,
    /// The error message identifying the failure.
    pub error_message: String,
    /// Stack trace, when the provider supplies one.
    pub stack_trace: Option<String>,
    /// Reported severity.
    pub severity: Severity,
    /// The observability provider that reported this incident.
    pub provider: String,
    /// Provider-specific metadata. Never interpreted by the engine.
    pub provider_data: serde_json::Map<String, serde_json::Value>,
}

impl RawIncident {
    /// Creates a raw incident with the required fields.
    #[must_use]
    pub fn new(service_name: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            error_message: error_message.into(),
            stack_trace: None,
            severity: Severity::Medium,
            provider: String::new(),
            provider_data: serde_json::Map::new(),
        }
    }

    /// Sets the stack trace.
    #[must_use]
    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = Some(stack_trace.into());
        self
    }

    /// Sets the severity.
    #[must_use]
    pub const fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Sets the provider name.
    #[must_use]
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    /// Adds one provider metadata entry.
    #[must_use]
    pub fn with_provider_data(
        mut self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        self.provider_data.insert(key.into(), value);
        self
    }

    /// Validates the raw incident before persistence.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] when the service name or error
    /// message is empty or exceeds its bound, or the provider name
    /// exceeds its bound.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.service_name.trim().is_empty() {
            return Err(EngineError::Validation("service_name is empty".to_string()));
        }
        if self.service_name.len() > MAX_SERVICE_NAME_LEN {
            return Err(EngineError::Validation(format!(
                "service_name exceeds bound: {} > {MAX_SERVICE_NAME_LEN}",
                self.service_name.len()
            )));
        }
        if self.error_message.trim().is_empty() {
            return Err(EngineError::Validation(
                "error_message is empty".to_string(),
            ));
        }
        if self.error_message.len() > MAX_ERROR_MESSAGE_LEN {
            return Err(EngineError::Validation(format!(
                "error_message exceeds bound: {} > {MAX_ERROR_MESSAGE_LEN}",
                self.error_message.len()
            )));
        }
        if self.provider.len() > MAX_PROVIDER_LEN {
            return Err(EngineError::Validation(format!(
                "provider exceeds bound: {} > {MAX_PROVIDER_LEN}",
                self.provider.len()
            )));
        }
        Ok(())
    }
}

/// One tracked incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    /// Opaque unique id, immutable once created.
    pub id: String,
    /// The failing service.
    pub service_name: String,
    /// Target repository; empty until (unless) routing succeeds.
    pub repository: String,
    /// The error message identifying the failure.
    pub error_message: String,
    /// Stack trace, when available.
    pub stack_trace: Option<String>,
    /// Reported severity.
    pub severity: Severity,
    /// The observability provider that reported this incident.
    pub provider: String,
    /// Provider-specific metadata bag.
    pub provider_data: serde_json::Map<String, serde_json::Value>,
    /// External workflow run identifier, once dispatched.
    pub run_id: Option<String>,
    /// Pull-request URL, once the workflow produced one.
    pub pr_url: Option<String>,
    /// Diagnosis text reported by the workflow.
    pub diagnosis: Option<String>,
    /// Current lifecycle status.
    pub status: IncidentStatus,
    /// Creation time, nanoseconds since the Unix epoch.
    pub created_at_ns: u64,
    /// Last mutation time.
    pub updated_at_ns: u64,
    /// First time the workflow was triggered; set exactly once.
    pub triggered_at_ns: Option<u64>,
    /// First time a terminal-for-cycle status was reached; set exactly
    /// once.
    pub completed_at_ns: Option<u64>,
}

impl Incident {
    /// Materializes a raw incident into a tracked record.
    ///
    /// `repository` is empty for unroutable incidents, which are created
    /// directly in `failed` with `completed_at_ns` already stamped.
    #[must_use]
    pub fn from_raw(raw: RawIncident, repository: impl Into<String>, status: IncidentStatus) -> Self {
        let now = now_ns();
        Self {
            id: new_incident_id(),
            service_name: raw.service_name,
            repository: repository.into(),
            error_message: raw.error_message,
            stack_trace: raw.stack_trace,
            severity: raw.severity,
            provider: raw.provider,
            provider_data: raw.provider_data,
            run_id: None,
            pr_url: None,
            diagnosis: None,
            status,
            created_at_ns: now,
            updated_at_ns: now,
            triggered_at_ns: None,
            completed_at_ns: status.is_terminal_for_cycle().then_some(now),
        }
    }
}

/// Generates a fresh incident id.
fn new_incident_id() -> String {
    format!("inc-{}", Ulid::new().to_string().to_lowercase())
}
