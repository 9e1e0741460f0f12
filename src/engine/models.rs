use serde::{Deserialize, Serialize};
use ticketsmith_common::{JobLogEvent, JobStatus, TicketComment};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub repo_url: String,
    pub default_branch: String,
    pub vcs_provider: String,
    pub vcs_token: Option<String>,
    pub ticket_provider: Option<String>,
    pub ticket_provider_token: Option<String>,
    pub ticket_provider_config: serde_json::Map<String, serde_json::Value>,
    pub sandbox_base_path: Option<String>,
    pub instructions_template: Option<String>,
    pub allowed_commands: Vec<String>,
    pub max_iterations: u32,
    pub created_at: String,
    pub updated_at: String,
}

/// Fields for creating a project.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewProject {
    pub name: String,
    pub repo_url: String,
    pub default_branch: String,
    pub vcs_provider: String,
    pub vcs_token: Option<String>,
    pub ticket_provider: Option<String>,
    pub ticket_provider_token: Option<String>,
    #[serde(default)]
    pub ticket_provider_config: serde_json::Map<String, serde_json::Value>,
    pub sandbox_base_path: Option<String>,
    pub instructions_template: Option<String>,
    #[serde(default)]
    pub allowed_commands: Vec<String>,
    pub max_iterations: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: String,
    pub project_id: String,
    pub external_id: String,
    pub external_url: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub comments: Vec<TicketComment>,
    pub external_status: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A ticket as reported by a tracker, before it is stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TicketData {
    pub external_id: String,
    pub external_url: Option<String>,
    pub title: String,
    pub description: Option<String>,
    #[serde(default)]
    pub comments: Vec<TicketComment>,
    pub external_status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub project_id: String,
    pub ticket_id: String,
    pub status: JobStatus,
    pub iteration: u32,
    pub max_iterations: u32,
    pub completion_promise: String,
    pub sandbox_path: Option<String>,
    pub branch_name: Option<String>,
    pub pr_url: Option<String>,
    pub pr_number: Option<i64>,
    pub blocked_by_job_id: Option<String>,
    pub error_message: Option<String>,
    pub error_stack: Option<String>,
    pub worker_id: Option<String>,
    pub clarification_question: Option<String>,
    pub clarification_answer: Option<String>,
    pub pending_permission_request: Option<String>,
    pub final_output: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLog {
    pub id: i64,
    pub job_id: String,
    pub iteration: u32,
    pub event: JobLogEvent,
    pub event_data: Option<serde_json::Value>,
    pub agent_output: Option<String>,
    pub created_at: String,
}

/// Filter for the job listing read model.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub project_id: Option<String>,
    pub status: Option<JobStatus>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}
