//! Agent prompt construction.
//!
//! The prompt is rebuilt from the job snapshot on every iteration, so the
//! same inputs always produce the same text. A resume preamble is prepended
//! after a clarification answer or permission decision.

use ticketsmith_common::{JobSpec, TicketComment};

/// Context carried into the prompt after the loop was paused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preamble {
    Answer { question: String, answer: String },
    PermissionApproved(String),
    PermissionDenied(String),
}

impl Preamble {
    pub fn render(&self) -> String {
        match self {
            Self::Answer { question, answer } => format!(
                "Previous question: {}\n\n\
                 Human answer: {}\n\n\
                 Continue working on the task with this information.",
                question, answer
            ),
            Self::PermissionApproved(command) => format!(
                "The following command was approved: {}\n\n\
                 Please proceed with the task. The command has been approved and you can execute it.",
                command
            ),
            Self::PermissionDenied(command) => format!(
                "The following command was denied: {}\n\n\
                 Please find an alternative approach that doesn't require this command, \
                 or ask for clarification if you need more information.",
                command
            ),
        }
    }
}

/// Full prompt for one iteration.
pub fn build_prompt(
    spec: &JobSpec,
    iteration: u32,
    max_iterations: u32,
    preamble: Option<&Preamble>,
) -> String {
    let task = task_prompt(spec, iteration, max_iterations);
    match preamble {
        Some(preamble) => format!("{}\n\n{}", preamble.render(), task),
        None => task,
    }
}

fn task_prompt(spec: &JobSpec, iteration: u32, max_iterations: u32) -> String {
    let description = spec
        .description
        .as_deref()
        .filter(|d| !d.trim().is_empty())
        .unwrap_or("No description provided.");

    format!(
        "# Task: {title}\n\n\
         {description}\n\
         {comments}\n\
         ## Instructions\n\n\
         Work on this task iteratively. You have access to the full codebase.\n\n\
         When you have completed the task:\n\
         1. Commit your changes and open a pull request, then include its URL in your output.\n\
         2. Output: <promise>{promise}</promise>\n\n\
         If you need clarification from the user:\n\
         - Output: <clarification>Your specific question here</clarification>\n\
         - Then stop and wait for the answer.\n\n\
         If you need to run a command that is not permitted:\n\
         - Output: <permission_request>the exact command</permission_request>\n\
         - Then stop and wait for a decision.\n\n\
         Current iteration: {iteration}/{max}",
        title = spec.title,
        description = description,
        comments = comments_section(&spec.comments),
        promise = spec.completion_promise,
        iteration = iteration,
        max = max_iterations,
    )
}

fn comments_section(comments: &[TicketComment]) -> String {
    if comments.is_empty() {
        return String::new();
    }
    let mut section = String::from("\n## Comments from ticket\n");
    for comment in comments {
        let when = comment
            .created_at
            .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
            .unwrap_or_else(|| "unknown date".to_string());
        section.push_str(&format!(
            "\n**{}** ({}):\n{}\n",
            comment.author.as_deref().unwrap_or("Unknown"),
            when,
            comment.body
        ));
    }
    section
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn spec() -> JobSpec {
        JobSpec {
            job_id: "job-1".to_string(),
            project_id: "project-1".to_string(),
            ticket_id: "ticket-1".to_string(),
            external_ticket_id: "ENG-1".to_string(),
            repo_url: "https://github.com/acme/web".to_string(),
            default_branch: "main".to_string(),
            vcs_provider: "github".to_string(),
            vcs_token: None,
            title: "Fix login".to_string(),
            description: Some("Safari users cannot log in.".to_string()),
            comments: vec![TicketComment {
                body: "Happens on iOS too".to_string(),
                author: Some("sam".to_string()),
                created_at: Some(Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap()),
            }],
            ticket_provider: None,
            ticket_provider_token: None,
            ticket_provider_config: Default::default(),
            sandbox_base_path: "/tmp/sb".to_string(),
            instructions_template: None,
            allowed_commands: Vec::new(),
            max_iterations: 10,
            completion_promise: "SHIP IT".to_string(),
            sandbox_path: None,
            branch_name: None,
        }
    }

    #[test]
    fn test_prompt_contains_ticket_and_protocol() {
        let prompt = build_prompt(&spec(), 3, 10, None);
        assert!(prompt.starts_with("# Task: Fix login"));
        assert!(prompt.contains("Safari users cannot log in."));
        assert!(prompt.contains("**sam** (2024-05-01 09:30 UTC):\nHappens on iOS too"));
        assert!(prompt.contains("<promise>SHIP IT</promise>"));
        assert!(prompt.contains("<clarification>"));
        assert!(prompt.contains("<permission_request>"));
        assert!(prompt.ends_with("Current iteration: 3/10"));
    }

    #[test]
    fn test_prompt_is_deterministic() {
        let spec = spec();
        assert_eq!(build_prompt(&spec, 1, 5, None), build_prompt(&spec, 1, 5, None));
    }

    #[test]
    fn test_missing_description_placeholder() {
        let mut spec = spec();
        spec.description = None;
        spec.comments.clear();
        let prompt = build_prompt(&spec, 1, 5, None);
        assert!(prompt.contains("No description provided."));
        assert!(!prompt.contains("Comments from ticket"));
    }

    #[test]
    fn test_answer_preamble_comes_first() {
        let preamble = Preamble::Answer {
            question: "Which database?".to_string(),
            answer: "Postgres".to_string(),
        };
        let prompt = build_prompt(&spec(), 2, 10, Some(&preamble));
        assert!(prompt.starts_with("Previous question: Which database?\n\nHuman answer: Postgres"));
        assert!(prompt.contains("# Task: Fix login"));
    }

    #[test]
    fn test_permission_preambles() {
        let approved = Preamble::PermissionApproved("npm publish".to_string()).render();
        assert!(approved.contains("approved: npm publish"));
        let denied = Preamble::PermissionDenied("rm -rf /".to_string()).render();
        assert!(denied.contains("denied: rm -rf /"));
        assert!(denied.contains("alternative approach"));
    }
}
