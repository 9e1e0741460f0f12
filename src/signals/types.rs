//! Signal types extracted from agent output.

use serde::{Deserialize, Serialize};

/// A pull/merge request link found in the output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestRef {
    pub url: String,
    /// Trailing numeric path segment, when it parses.
    pub number: Option<i64>,
}

/// Everything the parser found in one iteration's output.
///
/// Extraction is order-insensitive; several signals may be present at once.
/// Use [`AgentSignals::decisive`] to pick the one the loop acts on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSignals {
    /// `<promise>` content matched the job's completion token.
    pub completion: bool,
    /// Trimmed `<promise>` content, whether or not it matched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promise: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clarification: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_request: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<PullRequestRef>,
}

/// The single action an iteration resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Completion,
    Clarification(String),
    Permission(String),
    PullRequest(PullRequestRef),
}

impl AgentSignals {
    /// First signal in priority order: completion, clarification, permission,
    /// pull request.
    pub fn decisive(&self) -> Option<Signal> {
        if self.completion {
            return Some(Signal::Completion);
        }
        if let Some(question) = &self.clarification {
            return Some(Signal::Clarification(question.clone()));
        }
        if let Some(command) = &self.permission_request {
            return Some(Signal::Permission(command.clone()));
        }
        self.pull_request.clone().map(Signal::PullRequest)
    }

    pub fn is_empty(&self) -> bool {
        self.decisive().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pr() -> PullRequestRef {
        PullRequestRef {
            url: "https://github.com/acme/app/pull/42".to_string(),
            number: Some(42),
        }
    }

    #[test]
    fn test_completion_beats_everything() {
        let signals = AgentSignals {
            completion: true,
            promise: Some("DONE".to_string()),
            clarification: Some("which db?".to_string()),
            permission_request: Some("rm -rf build".to_string()),
            pull_request: Some(pr()),
        };
        assert_eq!(signals.decisive(), Some(Signal::Completion));
    }

    #[test]
    fn test_clarification_beats_permission_and_pr() {
        let signals = AgentSignals {
            clarification: Some("which db?".to_string()),
            permission_request: Some("npm install".to_string()),
            pull_request: Some(pr()),
            ..Default::default()
        };
        assert_eq!(
            signals.decisive(),
            Some(Signal::Clarification("which db?".to_string()))
        );
    }

    #[test]
    fn test_permission_beats_pr() {
        let signals = AgentSignals {
            permission_request: Some("npm install".to_string()),
            pull_request: Some(pr()),
            ..Default::default()
        };
        assert_eq!(
            signals.decisive(),
            Some(Signal::Permission("npm install".to_string()))
        );
    }

    #[test]
    fn test_mismatched_promise_is_not_decisive() {
        let signals = AgentSignals {
            promise: Some("NOT IT".to_string()),
            ..Default::default()
        };
        assert!(signals.is_empty());
    }
}
