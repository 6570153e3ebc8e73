//! Append-only incident audit trail.
//!
//! One event is appended per state-changing action so an incident's
//! history can be reconstructed from the trail alone. Events are never
//! mutated or deleted by the engine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::clock::now_ns;
use crate::incident::IncidentStatus;

/// The kind of audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IncidentEventKind {
    /// A new (non-duplicate) incident was ingested.
    #[serde(rename = "incident_received")]
    Received,
    /// The remediation workflow was triggered.
    #[serde(rename = "workflow_triggered")]
    Triggered,
    /// The workflow reported progress.
    #[serde(rename = "in_progress")]
    InProgress,
    /// The workflow produced a pull request.
    #[serde(rename = "pr_created")]
    PrCreated,
    /// The incident was resolved.
    #[serde(rename = "resolved")]
    Resolved,
    /// Routing, dispatch, or the workflow failed.
    #[serde(rename = "failed")]
    Failed,
    /// An operator re-triggered remediation by hand.
    #[serde(rename = "manual_trigger")]
    ManualTrigger,
    /// The lifecycle gate changed the incident status.
    #[serde(rename = "status_changed")]
    StatusChanged,
    /// An incoming incident collapsed into an existing one.
    #[serde(rename = "duplicate_detected")]
    DuplicateDetected,
    /// Admission control queued the incident behind the concurrency
    /// ceiling.
    #[serde(rename = "queued_for_remediation")]
    Queued,
    /// A queued incident was handed back a dispatch slot.
    #[serde(rename = "dequeued_for_remediation")]
    Dequeued,
}

impl IncidentEventKind {
    /// Returns the kind as its canonical string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Received => "incident_received",
            Self::Triggered => "workflow_triggered",
            Self::InProgress => "in_progress",
            Self::PrCreated => "pr_created",
            Self::Resolved => "resolved",
            Self::Failed => "failed",
            Self::ManualTrigger => "manual_trigger",
            Self::StatusChanged => "status_changed",
            Self::DuplicateDetected => "duplicate_detected",
            Self::Queued => "queued_for_remediation",
            Self::Dequeued => "dequeued_for_remediation",
        }
    }

    /// All kinds, for store round-trip tests.
    pub const ALL: [Self; 11] = [
        Self::Received,
        Self::Triggered,
        Self::InProgress,
        Self::PrCreated,
        Self::Resolved,
        Self::Failed,
        Self::ManualTrigger,
        Self::StatusChanged,
        Self::DuplicateDetected,
        Self::Queued,
        Self::Dequeued,
    ];
}

impl fmt::Display for IncidentEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing an [`IncidentEventKind`] from a string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown incident event kind: {0}")]
pub struct ParseEventKindError(pub String);

impl FromStr for IncidentEventKind {
    type Err = ParseEventKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ParseEventKindError(s.to_string()))
    }
}

/// One append-only audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentEvent {
    /// The incident this event belongs to.
    pub incident_id: String,
    /// What happened.
    pub kind: IncidentEventKind,
    /// Structured detail payload; shape varies per kind.
    pub detail: serde_json::Value,
    /// When the event was recorded, nanoseconds since the Unix epoch.
    pub created_at_ns: u64,
}

impl IncidentEvent {
    /// Creates an event stamped with the current time.
    #[must_use]
    pub fn new(
        incident_id: impl Into<String>,
        kind: IncidentEventKind,
        detail: serde_json::Value,
    ) -> Self {
        Self {
            incident_id: incident_id.into(),
            kind,
            detail,
            created_at_ns: now_ns(),
        }
    }

    /// Creates the `status_changed` event appended by the lifecycle gate.
    #[must_use]
    pub fn status_changed(
        incident_id: impl Into<String>,
        from: IncidentStatus,
        to: IncidentStatus,
    ) -> Self {
        Self::new(
            incident_id,
            IncidentEventKind::StatusChanged,
            json!({ "from": from.as_str(), "to": to.as_str() }),
        )
    }
}
