//! `ticketsmith dispatch` and `ticketsmith jobs ...`.

use anyhow::{Result, bail};
use clap::Subcommand;

use super::open_stores;
use ticketsmith::config::Config;
use ticketsmith::engine::models::{Job, JobFilter, JobLog};
use ticketsmith::engine::{DbHandle, Dispatcher};
use ticketsmith::util::truncate_with_marker;
use ticketsmith_common::JobStatus;

const LOG_OUTPUT_PREVIEW_CHARS: usize = 2000;

#[derive(Subcommand, Clone)]
pub enum JobsCommands {
    /// List jobs, newest first
    List {
        #[arg(long)]
        project: Option<String>,
        /// Only jobs in this status (e.g. running, needs_clarification)
        #[arg(long)]
        status: Option<JobStatus>,
        #[arg(long, default_value = "20")]
        limit: u32,
        #[arg(long, default_value = "0")]
        offset: u32,
    },
    /// Show one job
    Show {
        id: String,
        /// Print the job as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show a job's event log
    Logs {
        id: String,
        #[arg(long)]
        limit: Option<u32>,
        #[arg(long, default_value = "0")]
        offset: u32,
        /// Include captured agent output
        #[arg(long)]
        output: bool,
    },
    /// Answer a job's clarification question
    Answer { id: String, answer: String },
    /// Approve or deny a job's pending command
    Permission {
        id: String,
        #[arg(long, conflicts_with = "deny", required_unless_present = "deny")]
        approve: bool,
        #[arg(long)]
        deny: bool,
        /// Command being decided (defaults to the job's pending request)
        #[arg(long)]
        command: Option<String>,
    },
    /// Cancel a job
    Cancel {
        id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Retry a failed or cancelled job
    Retry { id: String },
}

async fn dispatcher(config: &Config) -> Result<(DbHandle, Dispatcher)> {
    let (db, queue) = open_stores(config).await?;
    let dispatcher = Dispatcher::new(
        db.clone(),
        queue,
        config.sandbox.base_path.to_string_lossy(),
    );
    Ok((db, dispatcher))
}

async fn require_job(db: &DbHandle, id: &str) -> Result<Job> {
    let id = id.to_string();
    db.call(move |db| db.require_job(&id)).await
}

pub async fn cmd_dispatch(config: &Config, project: &str, ticket: &str) -> Result<()> {
    let (_, dispatcher) = dispatcher(config).await?;
    let job = dispatcher.dispatch_ticket(project, ticket).await?;
    println!("Job {} queued", job.id);
    Ok(())
}

pub async fn cmd_jobs(config: &Config, command: JobsCommands) -> Result<()> {
    let (db, dispatcher) = dispatcher(config).await?;
    match command {
        JobsCommands::List {
            project,
            status,
            limit,
            offset,
        } => {
            let filter = JobFilter {
                project_id: project,
                status,
                limit: Some(limit),
                offset: Some(offset),
            };
            let jobs = db.call(move |db| db.list_jobs(&filter)).await?;
            if jobs.is_empty() {
                println!("No jobs");
                return Ok(());
            }
            println!(
                "{:<36}  {:<20}  {:>9}  {}",
                "ID", "STATUS", "ITERATION", "UPDATED"
            );
            for job in jobs {
                println!(
                    "{:<36}  {:<20}  {:>9}  {}",
                    job.id,
                    job.status.as_str(),
                    format!("{}/{}", job.iteration, job.max_iterations),
                    job.updated_at
                );
            }
        }
        JobsCommands::Show { id, json } => {
            let job = require_job(&db, &id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&job)?);
            } else {
                print_job(&job);
            }
        }
        JobsCommands::Logs {
            id,
            limit,
            offset,
            output,
        } => {
            require_job(&db, &id).await?;
            let logs = db
                .call(move |db| db.list_logs(&id, limit, offset))
                .await?;
            for log in &logs {
                print_log(log, output);
            }
        }
        JobsCommands::Answer { id, answer } => {
            let job = require_job(&db, &id).await?;
            if job.status != JobStatus::NeedsClarification {
                bail!("Job {} is {}, not waiting for an answer", id, job.status);
            }
            dispatcher.enqueue_resume(&id, &answer).await?;
            println!("Answer queued for job {}", id);
        }
        JobsCommands::Permission {
            id,
            approve,
            deny: _,
            command,
        } => {
            let job = require_job(&db, &id).await?;
            if job.status != JobStatus::NeedsPermission {
                bail!("Job {} is {}, not waiting for a permission decision", id, job.status);
            }
            let Some(command) = command.or(job.pending_permission_request) else {
                bail!("Job {} has no pending command; pass --command", id);
            };
            dispatcher
                .enqueue_permission_answer(&id, approve, &command)
                .await?;
            println!(
                "{} `{}` for job {}",
                if approve { "Approved" } else { "Denied" },
                command,
                id
            );
        }
        JobsCommands::Cancel { id, reason } => {
            let job = require_job(&db, &id).await?;
            if job.status.is_terminal() {
                bail!("Job {} is already {}", id, job.status);
            }
            dispatcher.enqueue_cancel(&id, reason.as_deref()).await?;
            println!("Cancel queued for job {}", id);
        }
        JobsCommands::Retry { id } => {
            let job = dispatcher.retry_job(&id).await?;
            println!("Job {} queued for retry", job.id);
        }
    }
    Ok(())
}

fn print_job(job: &Job) {
    println!("Job {}", job.id);
    println!("  status:     {}", job.status);
    println!("  iteration:  {}/{}", job.iteration, job.max_iterations);
    println!("  project:    {}", job.project_id);
    println!("  ticket:     {}", job.ticket_id);
    let optional = [
        ("branch", &job.branch_name),
        ("sandbox", &job.sandbox_path),
        ("worker", &job.worker_id),
        ("pr", &job.pr_url),
        ("question", &job.clarification_question),
        ("answer", &job.clarification_answer),
        ("permission", &job.pending_permission_request),
        ("error", &job.error_message),
        ("started", &job.started_at),
        ("completed", &job.completed_at),
    ];
    for (label, value) in optional {
        if let Some(value) = value {
            println!("  {:<11} {}", format!("{}:", label), value);
        }
    }
    println!("  created:    {}", job.created_at);
    println!("  updated:    {}", job.updated_at);
}

fn print_log(log: &JobLog, with_output: bool) {
    let data = log
        .event_data
        .as_ref()
        .map(|d| d.to_string())
        .unwrap_or_default();
    println!(
        "{}  [{}] {} {}",
        log.created_at, log.iteration, log.event, data
    );
    if with_output {
        if let Some(output) = log.agent_output.as_deref().filter(|o| !o.is_empty()) {
            println!("{}", truncate_with_marker(output, LOG_OUTPUT_PREVIEW_CHARS));
        }
    }
}
