//! Signal parsing from agent output.
//!
//! Extracts control signals from text using regex patterns for:
//! - `<promise>TOKEN</promise>` completion promises
//! - `<clarification>question</clarification>` requests for human input
//! - `<permission_request>command</permission_request>` blocked commands
//! - GitHub pull request and GitLab merge request URLs

use super::types::{AgentSignals, PullRequestRef};
use regex::Regex;
use std::sync::LazyLock;

static PROMISE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<promise>(.*?)</promise>").unwrap());

static CLARIFICATION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<clarification>(.*?)</clarification>").unwrap());

static PERMISSION_TAG_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<permission_request>(.*?)</permission_request>").unwrap()
});

static GITHUB_PR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https?://github\.com/[\w.-]+/[\w.-]+/pull/\d+").unwrap()
});

static GITLAB_MR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https?://gitlab\.com/[\w.-]+(?:/[\w.-]+)+/-/merge_requests/\d+").unwrap()
});

static PR_NUMBER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/(?:pull|merge_requests)/(\d+)").unwrap());

/// Parser for extracting control signals from agent output.
pub struct SignalParser {
    completion_promise: String,
}

impl SignalParser {
    /// `completion_promise` is the token the agent must echo inside `<promise>`.
    pub fn new(completion_promise: impl Into<String>) -> Self {
        Self {
            completion_promise: completion_promise.into(),
        }
    }

    /// Extract all signals from the given text.
    pub fn parse(&self, text: &str) -> AgentSignals {
        let promise = first_capture(&PROMISE_REGEX, text);
        let completion = !self.completion_promise.is_empty()
            && promise.as_deref() == Some(self.completion_promise.as_str());

        AgentSignals {
            completion,
            promise,
            clarification: first_capture(&CLARIFICATION_REGEX, text),
            permission_request: first_capture(&PERMISSION_TAG_REGEX, text),
            pull_request: extract_pull_request(text),
        }
    }
}

/// Convenience function to extract signals without creating a parser.
pub fn extract_signals(text: &str, completion_promise: &str) -> AgentSignals {
    SignalParser::new(completion_promise).parse(text)
}

/// First GitHub PR or GitLab MR URL in the text.
pub fn extract_pull_request(text: &str) -> Option<PullRequestRef> {
    let github = GITHUB_PR_REGEX.find(text);
    let gitlab = GITLAB_MR_REGEX.find(text);
    let found = match (github, gitlab) {
        (Some(a), Some(b)) => Some(if a.start() <= b.start() { a } else { b }),
        (a, b) => a.or(b),
    }?;
    let url = found.as_str().to_string();
    Some(PullRequestRef {
        number: pr_number(&url),
        url,
    })
}

/// Numeric id from a `/pull/N` or `/merge_requests/N` URL.
pub fn pr_number(url: &str) -> Option<i64> {
    PR_NUMBER_REGEX
        .captures(url)
        .and_then(|cap| cap.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn first_capture(regex: &Regex, text: &str) -> Option<String> {
    regex
        .captures_iter(text)
        .filter_map(|cap| cap.get(1))
        .map(|m| m.as_str().trim())
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "TASK COMPLETE";

    #[test]
    fn test_promise_matches_token() {
        let signals = extract_signals("All done. <promise>TASK COMPLETE</promise>", TOKEN);
        assert!(signals.completion);
        assert_eq!(signals.promise.as_deref(), Some("TASK COMPLETE"));
    }

    #[test]
    fn test_promise_with_surrounding_whitespace_matches() {
        let signals = extract_signals("<promise>\n  TASK COMPLETE \n</promise>", TOKEN);
        assert!(signals.completion);
    }

    #[test]
    fn test_promise_mismatch_is_not_completion() {
        let signals = extract_signals("<promise>task complete</promise>", TOKEN);
        assert!(!signals.completion);
        assert_eq!(signals.promise.as_deref(), Some("task complete"));
    }

    #[test]
    fn test_empty_token_never_completes() {
        let signals = extract_signals("<promise></promise>", "");
        assert!(!signals.completion);
    }

    #[test]
    fn test_parse_clarification_multiline() {
        let text = "I have a question.\n<clarification>\nShould the API use\nREST or GraphQL?\n</clarification>";
        let signals = extract_signals(text, TOKEN);
        assert_eq!(
            signals.clarification.as_deref(),
            Some("Should the API use\nREST or GraphQL?")
        );
    }

    #[test]
    fn test_blank_clarification_is_ignored() {
        let signals = extract_signals("<clarification>   </clarification>", TOKEN);
        assert!(signals.clarification.is_none());
    }

    #[test]
    fn test_parse_permission_tag() {
        let signals = extract_signals(
            "<permission_request>npm install --save lodash</permission_request>",
            TOKEN,
        );
        assert_eq!(
            signals.permission_request.as_deref(),
            Some("npm install --save lodash")
        );
    }

    #[test]
    fn test_shell_errors_are_not_permission_requests() {
        let signals = extract_signals(
            "sh: ./build.sh: Permission denied\nhint: try `chmod +x build.sh`\nThis step requires approval: `make deploy`",
            TOKEN,
        );
        assert!(signals.permission_request.is_none());
    }

    #[test]
    fn test_plain_backticks_are_not_permission_requests() {
        let signals = extract_signals("I ran `cargo fmt` and it passed.", TOKEN);
        assert!(signals.permission_request.is_none());
    }

    #[test]
    fn test_parse_github_pr() {
        let signals = extract_signals(
            "Opened https://github.com/acme/web-app/pull/1234 for review",
            TOKEN,
        );
        let pr = signals.pull_request.unwrap();
        assert_eq!(pr.url, "https://github.com/acme/web-app/pull/1234");
        assert_eq!(pr.number, Some(1234));
    }

    #[test]
    fn test_parse_gitlab_mr_with_subgroup() {
        let signals = extract_signals(
            "MR: https://gitlab.com/acme/platform/api/-/merge_requests/87",
            TOKEN,
        );
        let pr = signals.pull_request.unwrap();
        assert_eq!(pr.url, "https://gitlab.com/acme/platform/api/-/merge_requests/87");
        assert_eq!(pr.number, Some(87));
    }

    #[test]
    fn test_first_pr_link_wins() {
        let pr = extract_pull_request(
            "https://gitlab.com/a/b/-/merge_requests/2 then https://github.com/a/b/pull/9",
        )
        .unwrap();
        assert_eq!(pr.number, Some(2));
    }

    #[test]
    fn test_github_issue_link_is_not_a_pr() {
        assert!(extract_pull_request("https://github.com/acme/app/issues/5").is_none());
    }

    #[test]
    fn test_pr_number_from_url() {
        assert_eq!(pr_number("https://github.com/a/b/pull/77"), Some(77));
        assert_eq!(pr_number("https://example.com/nothing"), None);
    }

    #[test]
    fn test_no_signals_in_plain_output() {
        let signals = extract_signals("Refactored the module and ran the tests.", TOKEN);
        assert_eq!(signals, AgentSignals::default());
    }

    #[test]
    fn test_extraction_is_order_insensitive() {
        let text = "https://github.com/a/b/pull/3\n<clarification>why?</clarification>\n<promise>TASK COMPLETE</promise>";
        let signals = extract_signals(text, TOKEN);
        assert!(signals.completion);
        assert!(signals.clarification.is_some());
        assert!(signals.pull_request.is_some());
    }
}
