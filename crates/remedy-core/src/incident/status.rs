//! Incident lifecycle states and the legal transition table.
//!
//! The transition table is static data, not ad-hoc string comparison:
//! every legality check goes through [`IncidentStatus::can_transition_to`]
//! so the allowed set stays exhaustive and testable.
//!
//! ```text
//! pending            --> workflow_triggered | failed
//! workflow_triggered --> in_progress | failed
//! in_progress        --> pr_created | failed | no_fix_needed
//! pr_created         --> resolved | failed
//! failed             --> pending              (explicit retry)
//! resolved           --> (terminal)
//! no_fix_needed      --> (terminal)
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The lifecycle state of an incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    /// Routed and awaiting a dispatch slot or dispatch attempt.
    Pending,
    /// The external remediation workflow has been triggered.
    WorkflowTriggered,
    /// The remediation workflow reported that work is underway.
    InProgress,
    /// The workflow produced a pull request.
    PrCreated,
    /// The pull request was accepted; the incident cycle is closed.
    Resolved,
    /// Routing, dispatch, or the workflow itself failed. Re-enters the
    /// lifecycle only through the explicit retry to `pending`.
    Failed,
    /// The workflow concluded no code change is required.
    NoFixNeeded,
}

impl IncidentStatus {
    /// Returns the statuses this status may legally transition to.
    #[must_use]
    pub const fn allowed_transitions(self) -> &'static [Self] {
        match self {
            Self::Pending => &[Self::WorkflowTriggered, Self::Failed],
            Self::WorkflowTriggered => &[Self::InProgress, Self::Failed],
            Self::InProgress => &[Self::PrCreated, Self::Failed, Self::NoFixNeeded],
            Self::PrCreated => &[Self::Resolved, Self::Failed],
            Self::Failed => &[Self::Pending],
            Self::Resolved | Self::NoFixNeeded => &[],
        }
    }

    /// Returns `true` if `target` is a legal transition from this status.
    #[must_use]
    pub fn can_transition_to(self, target: Self) -> bool {
        self.allowed_transitions().contains(&target)
    }

    /// Returns `true` if this status closes the current remediation
    /// cycle. `failed` is terminal for the cycle even though the explicit
    /// retry path can reopen it.
    #[must_use]
    pub const fn is_terminal_for_cycle(self) -> bool {
        matches!(self, Self::Resolved | Self::Failed | Self::NoFixNeeded)
    }

    /// Returns `true` while a dispatched workflow is (believed to be)
    /// running for this incident.
    #[must_use]
    pub const fn is_dispatch_active(self) -> bool {
        matches!(self, Self::WorkflowTriggered | Self::InProgress)
    }

    /// Returns the status as its canonical snake_case string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::WorkflowTriggered => "workflow_triggered",
            Self::InProgress => "in_progress",
            Self::PrCreated => "pr_created",
            Self::Resolved => "resolved",
            Self::Failed => "failed",
            Self::NoFixNeeded => "no_fix_needed",
        }
    }

    /// All statuses, in lifecycle order. Useful for exhaustive tests and
    /// store round-trips.
    pub const ALL: [Self; 7] = [
        Self::Pending,
        Self::WorkflowTriggered,
        Self::InProgress,
        Self::PrCreated,
        Self::Resolved,
        Self::Failed,
        Self::NoFixNeeded,
    ];
}

impl fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing an [`IncidentStatus`] from a string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown incident status: {0}")]
pub struct ParseStatusError(pub String);

impl FromStr for IncidentStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "workflow_triggered" => Ok(Self::WorkflowTriggered),
            "in_progress" => Ok(Self::InProgress),
            "pr_created" => Ok(Self::PrCreated),
            "resolved" => Ok(Self::Resolved),
            "failed" => Ok(Self::Failed),
            "no_fix_needed" => Ok(Self::NoFixNeeded),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_strings() {
        for status in IncidentStatus::ALL {
            let parsed: IncidentStatus = status.as_str().parse().expect("parse");
            assert_eq!(parsed, status);
        }
        assert!("exploded".parse::<IncidentStatus>().is_err());
    }

    #[test]
    fn transition_table_matches_lifecycle() {
        use IncidentStatus::{
            Failed, InProgress, NoFixNeeded, Pending, PrCreated, Resolved, WorkflowTriggered,
        };

        assert!(Pending.can_transition_to(WorkflowTriggered));
        assert!(Pending.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Resolved));
        assert!(!Pending.can_transition_to(PrCreated));

        assert!(WorkflowTriggered.can_transition_to(InProgress));
        assert!(WorkflowTriggered.can_transition_to(Failed));
        assert!(!WorkflowTriggered.can_transition_to(Pending));

        assert!(InProgress.can_transition_to(PrCreated));
        assert!(InProgress.can_transition_to(NoFixNeeded));
        assert!(InProgress.can_transition_to(Failed));

        assert!(PrCreated.can_transition_to(Resolved));
        assert!(PrCreated.can_transition_to(Failed));

        // The only way out of failed is the explicit retry.
        assert_eq!(Failed.allowed_transitions(), &[Pending]);

        assert!(Resolved.allowed_transitions().is_empty());
        assert!(NoFixNeeded.allowed_transitions().is_empty());
    }

    #[test]
    fn no_status_can_transition_to_itself() {
        for status in IncidentStatus::ALL {
            assert!(
                !status.can_transition_to(status),
                "{status} must not self-transition"
            );
        }
    }

    #[test]
    fn terminal_for_cycle_covers_completion_statuses() {
        assert!(IncidentStatus::Resolved.is_terminal_for_cycle());
        assert!(IncidentStatus::Failed.is_terminal_for_cycle());
        assert!(IncidentStatus::NoFixNeeded.is_terminal_for_cycle());
        assert!(!IncidentStatus::Pending.is_terminal_for_cycle());
        assert!(!IncidentStatus::WorkflowTriggered.is_terminal_for_cycle());
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&IncidentStatus::WorkflowTriggered).expect("serialize");
        assert_eq!(json, "\"workflow_triggered\"");
        let back: IncidentStatus = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, IncidentStatus::WorkflowTriggered);
    }
}
