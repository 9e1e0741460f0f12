use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Persisted lifecycle state of a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    /// Reserved for dependency-gated jobs. Persisted and round-tripped, never
    /// entered by the worker itself.
    WaitingDependency,
    Running,
    NeedsClarification,
    NeedsPermission,
    PrCreated,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 9] = [
        Self::Pending,
        Self::WaitingDependency,
        Self::Running,
        Self::NeedsClarification,
        Self::NeedsPermission,
        Self::PrCreated,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Statuses that release the one-active-job-per-ticket slot.
    pub const TERMINAL: [JobStatus; 4] = [
        Self::Completed,
        Self::PrCreated,
        Self::Failed,
        Self::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::WaitingDependency => "waiting_dependency",
            Self::Running => "running",
            Self::NeedsClarification => "needs_clarification",
            Self::NeedsPermission => "needs_permission",
            Self::PrCreated => "pr_created",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }

    pub fn is_cancellable(&self) -> bool {
        !self.is_terminal()
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine permits moving from `self` to `to`.
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        if *self != to && to == Cancelled {
            return self.is_cancellable();
        }
        matches!(
            (*self, to),
            (Pending, Running)
                | (Pending, WaitingDependency)
                | (Pending, Failed)
                | (WaitingDependency, Pending)
                | (Running, NeedsClarification)
                | (Running, NeedsPermission)
                | (Running, PrCreated)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Pending)
                | (NeedsClarification, Running)
                | (NeedsPermission, Running)
                | (Failed, Pending)
                | (Cancelled, Pending)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "waiting_dependency" => Ok(Self::WaitingDependency),
            "running" => Ok(Self::Running),
            "needs_clarification" => Ok(Self::NeedsClarification),
            "needs_permission" => Ok(Self::NeedsPermission),
            "pr_created" => Ok(Self::PrCreated),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// Event type of an append-only job log record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobLogEvent {
    IterationStart,
    IterationOutput,
    IterationEnd,
    ClarificationRequested,
    PermissionRequested,
    PermissionApproved,
    PermissionDenied,
    PrCreated,
    Completed,
    MaxIterationsReached,
    Error,
}

impl JobLogEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IterationStart => "iteration_start",
            Self::IterationOutput => "iteration_output",
            Self::IterationEnd => "iteration_end",
            Self::ClarificationRequested => "clarification_requested",
            Self::PermissionRequested => "permission_requested",
            Self::PermissionApproved => "permission_approved",
            Self::PermissionDenied => "permission_denied",
            Self::PrCreated => "pr_created",
            Self::Completed => "completed",
            Self::MaxIterationsReached => "max_iterations_reached",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for JobLogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobLogEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "iteration_start" => Ok(Self::IterationStart),
            "iteration_output" => Ok(Self::IterationOutput),
            "iteration_end" => Ok(Self::IterationEnd),
            "clarification_requested" => Ok(Self::ClarificationRequested),
            "permission_requested" => Ok(Self::PermissionRequested),
            "permission_approved" => Ok(Self::PermissionApproved),
            "permission_denied" => Ok(Self::PermissionDenied),
            "pr_created" => Ok(Self::PrCreated),
            "completed" => Ok(Self::Completed),
            "max_iterations_reached" => Ok(Self::MaxIterationsReached),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid job log event: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("paused".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&JobStatus::NeedsClarification).unwrap();
        assert_eq!(json, "\"needs_clarification\"");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::PrCreated.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::NeedsPermission.is_terminal());
    }

    #[test]
    fn test_valid_transitions() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::NeedsClarification));
        assert!(JobStatus::NeedsClarification.can_transition_to(JobStatus::Running));
        assert!(JobStatus::NeedsPermission.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::PrCreated));
        assert!(JobStatus::Failed.can_transition_to(JobStatus::Pending));
        assert!(JobStatus::Cancelled.can_transition_to(JobStatus::Pending));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::PrCreated.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::NeedsClarification.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn test_cancel_allowed_from_any_non_terminal_state() {
        for status in JobStatus::ALL {
            assert_eq!(
                status.can_transition_to(JobStatus::Cancelled),
                !status.is_terminal(),
                "cancel from {status}"
            );
        }
    }

    #[test]
    fn test_log_event_round_trips_through_str() {
        let events = [
            JobLogEvent::IterationStart,
            JobLogEvent::IterationOutput,
            JobLogEvent::IterationEnd,
            JobLogEvent::ClarificationRequested,
            JobLogEvent::PermissionRequested,
            JobLogEvent::PermissionApproved,
            JobLogEvent::PermissionDenied,
            JobLogEvent::PrCreated,
            JobLogEvent::Completed,
            JobLogEvent::MaxIterationsReached,
            JobLogEvent::Error,
        ];
        for event in events {
            assert_eq!(event.as_str().parse::<JobLogEvent>().unwrap(), event);
        }
    }
}
