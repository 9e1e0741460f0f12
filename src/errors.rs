//! Typed error hierarchy for the ticketsmith worker.
//!
//! One enum per subsystem, plus `EngineError` for job operations:
//! - `ExecutorError` — agent subprocess failures
//! - `SandboxError` — workspace provisioning failures
//! - `ProviderError` — ticket tracker calls (logged, never fatal)
//! - `QueueError` — durable queue failures
//! - `EngineError` — job lookups and status transitions

use thiserror::Error;
use ticketsmith_common::JobStatus;

/// Errors from running the agent subprocess.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Failed to spawn agent process '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Agent process timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Agent process aborted: {reason}")]
    Aborted { reason: String },

    #[error("Failed to read agent output: {0}")]
    Stream(#[source] std::io::Error),
}

/// Errors from provisioning a job sandbox.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Failed to provision sandbox at {path}: {message}")]
    Provision {
        path: std::path::PathBuf,
        message: String,
    },

    #[error("Sandbox I/O error at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from a ticket tracker adapter.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Ticket provider '{provider}' is not configured")]
    NotConfigured { provider: String },
}

/// Errors from the durable queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Topic '{0}' has not been declared")]
    UnknownTopic(String),

    #[error("Queue is not started")]
    NotStarted,

    #[error("Invalid payload on topic '{topic}': {source}")]
    Payload {
        topic: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Queue database error: {0}")]
    Database(#[source] anyhow::Error),
}

/// Errors surfaced by the engine's job operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Job {id} not found")]
    JobNotFound { id: String },

    #[error("Project {id} not found")]
    ProjectNotFound { id: String },

    #[error("Ticket {id} not found")]
    TicketNotFound { id: String },

    #[error("Ticket {ticket_id} already has an active job")]
    ActiveJobExists { ticket_id: String },

    #[error("Invalid job transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Job {id} is {status} and cannot be retried")]
    NotRetryable { id: String, status: JobStatus },

    #[error("Max iterations ({max}) reached without completion")]
    MaxIterations { max: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executor_error_spawn_carries_command() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "claude not found");
        let err = ExecutorError::Spawn {
            command: "claude".to_string(),
            source: io_err,
        };
        match &err {
            ExecutorError::Spawn { command, source } => {
                assert_eq!(command, "claude");
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            _ => panic!("Expected Spawn variant"),
        }
        assert!(err.to_string().contains("claude"));
    }

    #[test]
    fn executor_timeout_and_abort_are_distinguishable() {
        let timeout = ExecutorError::Timeout { secs: 600 };
        let aborted = ExecutorError::Aborted {
            reason: "cancelled by operator".to_string(),
        };
        assert!(matches!(timeout, ExecutorError::Timeout { secs: 600 }));
        assert!(matches!(aborted, ExecutorError::Aborted { .. }));
        assert!(aborted.to_string().contains("cancelled by operator"));
    }

    #[test]
    fn max_iterations_message_names_the_limit() {
        let err = EngineError::MaxIterations { max: 7 };
        assert_eq!(
            err.to_string(),
            "Max iterations (7) reached without completion"
        );
    }

    #[test]
    fn invalid_transition_displays_statuses() {
        let err = EngineError::InvalidTransition {
            from: JobStatus::Completed,
            to: JobStatus::Running,
        };
        assert_eq!(
            err.to_string(),
            "Invalid job transition from completed to running"
        );
    }

    #[test]
    fn queue_error_unknown_topic_names_topic() {
        let err = QueueError::UnknownTopic("job-frobnicate".to_string());
        assert!(err.to_string().contains("job-frobnicate"));
    }
}
