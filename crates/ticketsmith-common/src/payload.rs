use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Queue topic names.
pub mod topics {
    pub const JOB_PROCESS: &str = "job-process";
    pub const JOB_RESUME: &str = "job-resume";
    pub const JOB_CANCEL: &str = "job-cancel";
    pub const JOB_PERMISSION_ANSWER: &str = "job-permission-answer";

    pub const ALL: [&str; 4] = [JOB_PROCESS, JOB_RESUME, JOB_CANCEL, JOB_PERMISSION_ANSWER];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketComment {
    pub body: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Immutable snapshot of everything a worker needs to run a job without
/// further lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub job_id: String,
    pub project_id: String,
    pub ticket_id: String,
    pub external_ticket_id: String,

    pub repo_url: String,
    pub default_branch: String,
    pub vcs_provider: String,
    #[serde(default)]
    pub vcs_token: Option<String>,

    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub comments: Vec<TicketComment>,

    #[serde(default)]
    pub ticket_provider: Option<String>,
    #[serde(default)]
    pub ticket_provider_token: Option<String>,
    #[serde(default)]
    pub ticket_provider_config: serde_json::Map<String, serde_json::Value>,

    pub sandbox_base_path: String,
    #[serde(default)]
    pub instructions_template: Option<String>,
    #[serde(default)]
    pub allowed_commands: Vec<String>,

    pub max_iterations: u32,
    pub completion_promise: String,

    /// Sandbox retained from a previous run (retry or recovery).
    #[serde(default)]
    pub sandbox_path: Option<String>,
    #[serde(default)]
    pub branch_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProcessPayload {
    pub spec: JobSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResumePayload {
    pub job_id: String,
    pub answer: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCancelPayload {
    pub job_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPermissionAnswerPayload {
    pub job_id: String,
    pub approved: bool,
    pub command: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resume_payload_uses_camel_case() {
        let payload = JobResumePayload {
            job_id: "job-1".to_string(),
            answer: "use postgres".to_string(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["jobId"], "job-1");
        assert_eq!(json["answer"], "use postgres");
    }

    #[test]
    fn test_spec_optional_fields_default_when_missing() {
        let json = serde_json::json!({
            "jobId": "j",
            "projectId": "p",
            "ticketId": "t",
            "externalTicketId": "ENG-1",
            "repoUrl": "https://github.com/acme/app",
            "defaultBranch": "main",
            "vcsProvider": "github",
            "title": "Fix login",
            "sandboxBasePath": "/tmp/sandboxes",
            "maxIterations": 10,
            "completionPromise": "TASK COMPLETE"
        });
        let spec: JobSpec = serde_json::from_value(json).unwrap();
        assert!(spec.comments.is_empty());
        assert!(spec.sandbox_path.is_none());
        assert!(spec.ticket_provider_config.is_empty());
        assert_eq!(spec.max_iterations, 10);
    }

    #[test]
    fn test_topics_are_distinct() {
        let mut names = topics::ALL.to_vec();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 4);
    }
}
