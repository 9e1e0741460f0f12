use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, ToSql, params};
use ticketsmith_common::{JobLogEvent, JobSpec, JobStatus, TicketComment};

use super::models::*;
use crate::errors::EngineError;
use crate::util::truncate_chars;

pub const DEFAULT_MAX_ITERATIONS: u32 = 100;
pub const DEFAULT_COMPLETION_PROMISE: &str = "TASK COMPLETE";
/// Agent output stored on a single log record is capped at this many chars.
pub const MAX_LOG_OUTPUT_CHARS: usize = 50_000;

/// Async-safe handle to a SQLite-backed store.
///
/// Wraps the store behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
pub struct DbHandle<D = EngineDb> {
    inner: Arc<std::sync::Mutex<D>>,
}

impl<D> Clone for DbHandle<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: Send + 'static> DbHandle<D> {
    pub fn new(db: D) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&D) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Used at startup and in
    /// tests; never from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, D>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

/// Open a connection with the pragmas every store relies on.
pub(crate) fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path).context("Failed to open SQLite database")?;
    conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")
        .context("Failed to configure SQLite connection")?;
    Ok(conn)
}

/// Jobs, tickets, projects and the append-only job log.
pub struct EngineDb {
    conn: Connection,
}

const JOB_COLUMNS: &str = "id, project_id, ticket_id, status, iteration, max_iterations, completion_promise,
     sandbox_path, branch_name, pr_url, pr_number, blocked_by_job_id, error_message, error_stack,
     worker_id, clarification_question, clarification_answer, pending_permission_request,
     final_output, created_at, updated_at, started_at, completed_at";

const LOG_COLUMNS: &str =
    "id, job_id, iteration, event_type, event_data, agent_output, created_at";

const PROJECT_COLUMNS: &str = "id, name, repo_url, default_branch, vcs_provider, vcs_token,
     ticket_provider, ticket_provider_token, ticket_provider_config, sandbox_base_path,
     instructions_template, allowed_commands, max_iterations, created_at, updated_at";

const TICKET_COLUMNS: &str = "id, project_id, external_id, external_url, title, description,
     comments, external_status, created_at, updated_at";

impl EngineDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let db = Self {
            conn: open_connection(path)?,
        };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS projects (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    repo_url TEXT NOT NULL,
                    default_branch TEXT NOT NULL DEFAULT 'main',
                    vcs_provider TEXT NOT NULL DEFAULT 'github',
                    vcs_token TEXT,
                    ticket_provider TEXT,
                    ticket_provider_token TEXT,
                    ticket_provider_config TEXT NOT NULL DEFAULT '{}',
                    sandbox_base_path TEXT,
                    instructions_template TEXT,
                    allowed_commands TEXT NOT NULL DEFAULT '[]',
                    max_iterations INTEGER NOT NULL DEFAULT 100,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS tickets (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    external_id TEXT NOT NULL,
                    external_url TEXT,
                    title TEXT NOT NULL,
                    description TEXT,
                    comments TEXT NOT NULL DEFAULT '[]',
                    external_status TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(project_id, external_id)
                );

                CREATE TABLE IF NOT EXISTS jobs (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    ticket_id TEXT NOT NULL REFERENCES tickets(id) ON DELETE CASCADE,
                    status TEXT NOT NULL DEFAULT 'pending',
                    iteration INTEGER NOT NULL DEFAULT 0,
                    max_iterations INTEGER NOT NULL DEFAULT 100,
                    completion_promise TEXT NOT NULL DEFAULT 'TASK COMPLETE',
                    sandbox_path TEXT,
                    branch_name TEXT,
                    pr_url TEXT,
                    pr_number INTEGER,
                    blocked_by_job_id TEXT REFERENCES jobs(id),
                    error_message TEXT,
                    error_stack TEXT,
                    worker_id TEXT,
                    clarification_question TEXT,
                    clarification_answer TEXT,
                    pending_permission_request TEXT,
                    final_output TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    started_at TEXT,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS job_logs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                    iteration INTEGER NOT NULL,
                    event_type TEXT NOT NULL,
                    event_data TEXT,
                    agent_output TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_tickets_project ON tickets(project_id);
                CREATE INDEX IF NOT EXISTS idx_jobs_project ON jobs(project_id);
                CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
                CREATE INDEX IF NOT EXISTS idx_job_logs_job ON job_logs(job_id, id);

                CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_one_active_per_ticket
                    ON jobs(ticket_id)
                    WHERE status NOT IN ('completed', 'pr_created', 'failed', 'cancelled');
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Projects ──────────────────────────────────────────────────────

    pub fn create_project(&self, project: &NewProject) -> Result<Project> {
        let id = uuid::Uuid::new_v4().to_string();
        let provider_config = serde_json::to_string(&project.ticket_provider_config)
            .context("Failed to encode ticket provider config")?;
        let allowed = serde_json::to_string(&project.allowed_commands)
            .context("Failed to encode allowed commands")?;
        let default_branch = if project.default_branch.is_empty() {
            "main"
        } else {
            project.default_branch.as_str()
        };
        let vcs_provider = if project.vcs_provider.is_empty() {
            "github"
        } else {
            project.vcs_provider.as_str()
        };
        self.conn
            .execute(
                "INSERT INTO projects (id, name, repo_url, default_branch, vcs_provider, vcs_token,
                    ticket_provider, ticket_provider_token, ticket_provider_config, sandbox_base_path,
                    instructions_template, allowed_commands, max_iterations)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    id,
                    project.name,
                    project.repo_url,
                    default_branch,
                    vcs_provider,
                    project.vcs_token,
                    project.ticket_provider,
                    project.ticket_provider_token,
                    provider_config,
                    project.sandbox_base_path,
                    project.instructions_template,
                    allowed,
                    project.max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS),
                ],
            )
            .context("Failed to insert project")?;
        self.get_project(&id)?
            .context("Project not found after insert")
    }

    pub fn get_project(&self, id: &str) -> Result<Option<Project>> {
        let sql = format!("SELECT {} FROM projects WHERE id = ?1", PROJECT_COLUMNS);
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare get_project")?;
        let mut rows = stmt
            .query_map(params![id], ProjectRow::from_row)
            .context("Failed to query project")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read project row")?.into_project()?)),
            None => Ok(None),
        }
    }

    // ── Tickets ───────────────────────────────────────────────────────

    /// Insert a ticket, or refresh the stored copy if the tracker already
    /// reported it for this project.
    pub fn upsert_ticket(&self, project_id: &str, ticket: &TicketData) -> Result<Ticket> {
        let comments =
            serde_json::to_string(&ticket.comments).context("Failed to encode ticket comments")?;
        self.conn
            .execute(
                "INSERT INTO tickets (id, project_id, external_id, external_url, title, description, comments, external_status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(project_id, external_id) DO UPDATE SET
                    external_url = excluded.external_url,
                    title = excluded.title,
                    description = excluded.description,
                    comments = excluded.comments,
                    external_status = excluded.external_status,
                    updated_at = datetime('now')",
                params![
                    uuid::Uuid::new_v4().to_string(),
                    project_id,
                    ticket.external_id,
                    ticket.external_url,
                    ticket.title,
                    ticket.description,
                    comments,
                    ticket.external_status,
                ],
            )
            .context("Failed to upsert ticket")?;
        let id: String = self
            .conn
            .query_row(
                "SELECT id FROM tickets WHERE project_id = ?1 AND external_id = ?2",
                params![project_id, ticket.external_id],
                |row| row.get(0),
            )
            .context("Ticket not found after upsert")?;
        self.get_ticket(&id)?.context("Ticket not found after upsert")
    }

    pub fn get_ticket(&self, id: &str) -> Result<Option<Ticket>> {
        let sql = format!("SELECT {} FROM tickets WHERE id = ?1", TICKET_COLUMNS);
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare get_ticket")?;
        let mut rows = stmt
            .query_map(params![id], TicketRow::from_row)
            .context("Failed to query ticket")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read ticket row")?.into_ticket()?)),
            None => Ok(None),
        }
    }

    // ── Jobs ──────────────────────────────────────────────────────────

    /// Create a pending job for a ticket. Fails with
    /// `EngineError::ActiveJobExists` if the ticket already has a
    /// non-terminal job.
    pub fn create_job(&self, project_id: &str, ticket_id: &str) -> Result<Job> {
        let project = self
            .get_project(project_id)?
            .ok_or_else(|| EngineError::ProjectNotFound {
                id: project_id.to_string(),
            })?;
        let id = uuid::Uuid::new_v4().to_string();
        let inserted = self.conn.execute(
            "INSERT INTO jobs (id, project_id, ticket_id, max_iterations, completion_promise)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id,
                project_id,
                ticket_id,
                project.max_iterations,
                DEFAULT_COMPLETION_PROMISE
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(EngineError::ActiveJobExists {
                    ticket_id: ticket_id.to_string(),
                }
                .into());
            }
            Err(e) => return Err(anyhow::Error::new(e).context("Failed to insert job")),
        }
        self.get_job(&id)?.context("Job not found after insert")
    }

    pub fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let sql = format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS);
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare get_job")?;
        let mut rows = stmt
            .query_map(params![id], JobRow::from_row)
            .context("Failed to query job")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read job row")?.into_job()?)),
            None => Ok(None),
        }
    }

    /// Load a job or fail with `EngineError::JobNotFound`.
    pub fn require_job(&self, id: &str) -> Result<Job> {
        self.get_job(id)?.ok_or_else(|| {
            EngineError::JobNotFound { id: id.to_string() }.into()
        })
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {} FROM jobs
             WHERE (?1 IS NULL OR project_id = ?1) AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?3 OFFSET ?4",
            JOB_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_jobs")?;
        let rows = stmt
            .query_map(
                params![
                    filter.project_id,
                    filter.status.map(|s| s.as_str()),
                    filter.limit.map(i64::from).unwrap_or(-1),
                    filter.offset.unwrap_or(0),
                ],
                JobRow::from_row,
            )
            .context("Failed to query jobs")?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row.context("Failed to read job row")?.into_job()?);
        }
        Ok(jobs)
    }

    pub fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        self.list_jobs(&JobFilter {
            status: Some(status),
            ..Default::default()
        })
    }

    /// Move a job to `to` if the state machine allows it, applying extra
    /// column assignments. `assignments` may reference `?4` onwards, bound
    /// from `extra` in order.
    fn transition(
        &self,
        id: &str,
        to: JobStatus,
        assignments: &str,
        extra: &[&dyn ToSql],
    ) -> Result<Job> {
        let job = self.require_job(id)?;
        if !job.status.can_transition_to(to) {
            return Err(EngineError::InvalidTransition {
                from: job.status,
                to,
            }
            .into());
        }
        let completed = if to.is_terminal() {
            ", completed_at = datetime('now')"
        } else {
            ""
        };
        let sql = format!(
            "UPDATE jobs SET status = ?1, updated_at = datetime('now'){}{} WHERE id = ?2 AND status = ?3",
            completed, assignments
        );
        let to_str = to.as_str();
        let from_str = job.status.as_str();
        let mut bound: Vec<&dyn ToSql> = vec![&to_str, &id, &from_str];
        bound.extend_from_slice(extra);
        let changed = match self.conn.execute(&sql, bound.as_slice()) {
            Ok(n) => n,
            Err(e) if is_unique_violation(&e) => {
                return Err(EngineError::ActiveJobExists {
                    ticket_id: job.ticket_id,
                }
                .into());
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("Failed to move job {} to {}", id, to)));
            }
        };
        if changed == 0 {
            let current = self.require_job(id)?;
            return Err(EngineError::InvalidTransition {
                from: current.status,
                to,
            }
            .into());
        }
        self.get_job(id)?
            .context("Job not found after status update")
    }

    /// Fail with `InvalidTransition` unless the job is currently `expected`.
    fn expect_status(&self, id: &str, expected: JobStatus, to: JobStatus) -> Result<()> {
        let job = self.require_job(id)?;
        if job.status != expected {
            return Err(EngineError::InvalidTransition {
                from: job.status,
                to,
            }
            .into());
        }
        Ok(())
    }

    /// pending → running, recording where the job runs.
    pub fn start_job(
        &self,
        id: &str,
        sandbox_path: &str,
        branch_name: &str,
        worker_id: &str,
    ) -> Result<Job> {
        self.transition(
            id,
            JobStatus::Running,
            ", sandbox_path = ?4, branch_name = ?5, worker_id = ?6,
               started_at = COALESCE(started_at, datetime('now'))",
            &[&sandbox_path, &branch_name, &worker_id],
        )
    }

    /// Record where a resumed job now runs, without a status change.
    pub fn assign_worker(
        &self,
        id: &str,
        sandbox_path: &str,
        branch_name: &str,
        worker_id: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE jobs SET sandbox_path = ?1, branch_name = ?2, worker_id = ?3,
                    updated_at = datetime('now')
                 WHERE id = ?4",
                params![sandbox_path, branch_name, worker_id, id],
            )
            .context("Failed to assign job worker")?;
        Ok(())
    }

    pub fn set_iteration(&self, id: &str, iteration: u32) -> Result<()> {
        self.conn
            .execute(
                "UPDATE jobs SET iteration = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![iteration, id],
            )
            .context("Failed to update job iteration")?;
        Ok(())
    }

    pub fn complete_job(&self, id: &str, final_output: &str) -> Result<Job> {
        let output = truncate_chars(final_output, MAX_LOG_OUTPUT_CHARS);
        self.transition(
            id,
            JobStatus::Completed,
            ", final_output = ?4",
            &[&output],
        )
    }

    pub fn request_clarification(&self, id: &str, question: &str) -> Result<Job> {
        self.transition(
            id,
            JobStatus::NeedsClarification,
            ", clarification_question = ?4, clarification_answer = NULL",
            &[&question],
        )
    }

    pub fn answer_clarification(&self, id: &str, answer: &str) -> Result<Job> {
        self.expect_status(id, JobStatus::NeedsClarification, JobStatus::Running)?;
        self.transition(
            id,
            JobStatus::Running,
            ", clarification_answer = ?4",
            &[&answer],
        )
    }

    pub fn request_permission(&self, id: &str, command: &str) -> Result<Job> {
        self.transition(
            id,
            JobStatus::NeedsPermission,
            ", pending_permission_request = ?4",
            &[&command],
        )
    }

    pub fn resolve_permission(&self, id: &str) -> Result<Job> {
        self.expect_status(id, JobStatus::NeedsPermission, JobStatus::Running)?;
        self.transition(
            id,
            JobStatus::Running,
            ", pending_permission_request = NULL",
            &[],
        )
    }

    pub fn record_pull_request(
        &self,
        id: &str,
        pr_url: &str,
        pr_number: Option<i64>,
        final_output: &str,
    ) -> Result<Job> {
        let output = truncate_chars(final_output, MAX_LOG_OUTPUT_CHARS);
        self.transition(
            id,
            JobStatus::PrCreated,
            ", pr_url = ?4, pr_number = ?5, final_output = ?6",
            &[&pr_url, &pr_number, &output],
        )
    }

    pub fn fail_job(&self, id: &str, message: &str, stack: Option<&str>) -> Result<Job> {
        self.transition(
            id,
            JobStatus::Failed,
            ", error_message = ?4, error_stack = ?5",
            &[&message, &stack],
        )
    }

    /// Cancel a non-terminal job. Returns `None` when the job had already
    /// reached a terminal state.
    pub fn cancel_job(&self, id: &str) -> Result<Option<Job>> {
        let job = self.require_job(id)?;
        if job.status.is_terminal() {
            return Ok(None);
        }
        self.transition(id, JobStatus::Cancelled, "", &[]).map(Some)
    }

    /// running → pending, releasing the worker assignment. Used when a
    /// worker shuts down mid-job or a dead worker's job is reclaimed.
    pub fn release_job(&self, id: &str) -> Result<Job> {
        self.transition(id, JobStatus::Pending, ", worker_id = NULL", &[])
    }

    /// failed/cancelled → pending with counters and diagnostics cleared.
    pub fn reset_for_retry(&self, id: &str) -> Result<Job> {
        let job = self.require_job(id)?;
        if !job.status.is_retryable() {
            return Err(EngineError::NotRetryable {
                id: id.to_string(),
                status: job.status,
            }
            .into());
        }
        self.transition(
            id,
            JobStatus::Pending,
            ", iteration = 0, error_message = NULL, error_stack = NULL, worker_id = NULL,
               started_at = NULL, completed_at = NULL",
            &[],
        )
    }

    // ── Job logs ──────────────────────────────────────────────────────

    pub fn append_log(
        &self,
        job_id: &str,
        iteration: u32,
        event: JobLogEvent,
        event_data: Option<&serde_json::Value>,
        agent_output: Option<&str>,
    ) -> Result<i64> {
        let data = event_data
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to encode log event data")?;
        let output = agent_output.map(|o| truncate_chars(o, MAX_LOG_OUTPUT_CHARS));
        self.conn
            .execute(
                "INSERT INTO job_logs (job_id, iteration, event_type, event_data, agent_output)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![job_id, iteration, event.as_str(), data, output],
            )
            .context("Failed to insert job log")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Replace the output of an in-progress log record.
    pub fn update_log_output(&self, log_id: i64, agent_output: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE job_logs SET agent_output = ?1 WHERE id = ?2",
                params![truncate_chars(agent_output, MAX_LOG_OUTPUT_CHARS), log_id],
            )
            .context("Failed to update job log output")?;
        Ok(())
    }

    pub fn latest_log(&self, job_id: &str, event: JobLogEvent) -> Result<Option<JobLog>> {
        let sql = format!(
            "SELECT {} FROM job_logs WHERE job_id = ?1 AND event_type = ?2 ORDER BY id DESC LIMIT 1",
            LOG_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare latest_log")?;
        let mut rows = stmt
            .query_map(params![job_id, event.as_str()], JobLogRow::from_row)
            .context("Failed to query job log")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read job log row")?.into_job_log()?)),
            None => Ok(None),
        }
    }

    /// Most recent record whose event is one of `events`.
    pub fn latest_log_of(&self, job_id: &str, events: &[JobLogEvent]) -> Result<Option<JobLog>> {
        let mut latest: Option<JobLog> = None;
        for event in events {
            if let Some(log) = self.latest_log(job_id, *event)? {
                if latest.as_ref().is_none_or(|current| log.id > current.id) {
                    latest = Some(log);
                }
            }
        }
        Ok(latest)
    }

    /// Log records for a job, oldest first.
    pub fn list_logs(&self, job_id: &str, limit: Option<u32>, offset: u32) -> Result<Vec<JobLog>> {
        let sql = format!(
            "SELECT {} FROM job_logs WHERE job_id = ?1 ORDER BY id LIMIT ?2 OFFSET ?3",
            LOG_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_logs")?;
        let rows = stmt
            .query_map(
                params![job_id, limit.map(i64::from).unwrap_or(-1), offset],
                JobLogRow::from_row,
            )
            .context("Failed to query job logs")?;
        let mut logs = Vec::new();
        for row in rows {
            logs.push(row.context("Failed to read job log row")?.into_job_log()?);
        }
        Ok(logs)
    }

    // ── Snapshots ─────────────────────────────────────────────────────

    /// Rebuild the queue snapshot for a job from its persisted job, ticket
    /// and project rows.
    pub fn job_spec(&self, job_id: &str, default_sandbox_base: &str) -> Result<JobSpec> {
        let job = self.require_job(job_id)?;
        let project = self
            .get_project(&job.project_id)?
            .ok_or_else(|| EngineError::ProjectNotFound {
                id: job.project_id.clone(),
            })?;
        let ticket = self
            .get_ticket(&job.ticket_id)?
            .ok_or_else(|| EngineError::TicketNotFound {
                id: job.ticket_id.clone(),
            })?;
        Ok(JobSpec {
            job_id: job.id,
            project_id: project.id,
            ticket_id: ticket.id,
            external_ticket_id: ticket.external_id,
            repo_url: project.repo_url,
            default_branch: project.default_branch,
            vcs_provider: project.vcs_provider,
            vcs_token: project.vcs_token,
            title: ticket.title,
            description: ticket.description,
            comments: ticket.comments,
            ticket_provider: project.ticket_provider,
            ticket_provider_token: project.ticket_provider_token,
            ticket_provider_config: project.ticket_provider_config,
            sandbox_base_path: project
                .sandbox_base_path
                .unwrap_or_else(|| default_sandbox_base.to_string()),
            instructions_template: project.instructions_template,
            allowed_commands: project.allowed_commands,
            max_iterations: job.max_iterations,
            completion_promise: job.completion_promise,
            sandbox_path: job.sandbox_path,
            branch_name: job.branch_name,
        })
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

// ── Row helpers ───────────────────────────────────────────────────────

struct ProjectRow {
    id: String,
    name: String,
    repo_url: String,
    default_branch: String,
    vcs_provider: String,
    vcs_token: Option<String>,
    ticket_provider: Option<String>,
    ticket_provider_token: Option<String>,
    ticket_provider_config: String,
    sandbox_base_path: Option<String>,
    instructions_template: Option<String>,
    allowed_commands: String,
    max_iterations: u32,
    created_at: String,
    updated_at: String,
}

impl ProjectRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            repo_url: row.get(2)?,
            default_branch: row.get(3)?,
            vcs_provider: row.get(4)?,
            vcs_token: row.get(5)?,
            ticket_provider: row.get(6)?,
            ticket_provider_token: row.get(7)?,
            ticket_provider_config: row.get(8)?,
            sandbox_base_path: row.get(9)?,
            instructions_template: row.get(10)?,
            allowed_commands: row.get(11)?,
            max_iterations: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }

    fn into_project(self) -> Result<Project> {
        let ticket_provider_config = serde_json::from_str(&self.ticket_provider_config)
            .context("Failed to parse ticket provider config JSON")?;
        let allowed_commands = serde_json::from_str(&self.allowed_commands)
            .context("Failed to parse allowed commands JSON")?;
        Ok(Project {
            id: self.id,
            name: self.name,
            repo_url: self.repo_url,
            default_branch: self.default_branch,
            vcs_provider: self.vcs_provider,
            vcs_token: self.vcs_token,
            ticket_provider: self.ticket_provider,
            ticket_provider_token: self.ticket_provider_token,
            ticket_provider_config,
            sandbox_base_path: self.sandbox_base_path,
            instructions_template: self.instructions_template,
            allowed_commands,
            max_iterations: self.max_iterations,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct TicketRow {
    id: String,
    project_id: String,
    external_id: String,
    external_url: Option<String>,
    title: String,
    description: Option<String>,
    comments: String,
    external_status: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TicketRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            external_id: row.get(2)?,
            external_url: row.get(3)?,
            title: row.get(4)?,
            description: row.get(5)?,
            comments: row.get(6)?,
            external_status: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_ticket(self) -> Result<Ticket> {
        let comments: Vec<TicketComment> =
            serde_json::from_str(&self.comments).context("Failed to parse ticket comments JSON")?;
        Ok(Ticket {
            id: self.id,
            project_id: self.project_id,
            external_id: self.external_id,
            external_url: self.external_url,
            title: self.title,
            description: self.description,
            comments,
            external_status: self.external_status,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Intermediate row struct for jobs.
struct JobRow {
    id: String,
    project_id: String,
    ticket_id: String,
    status: String,
    iteration: u32,
    max_iterations: u32,
    completion_promise: String,
    sandbox_path: Option<String>,
    branch_name: Option<String>,
    pr_url: Option<String>,
    pr_number: Option<i64>,
    blocked_by_job_id: Option<String>,
    error_message: Option<String>,
    error_stack: Option<String>,
    worker_id: Option<String>,
    clarification_question: Option<String>,
    clarification_answer: Option<String>,
    pending_permission_request: Option<String>,
    final_output: Option<String>,
    created_at: String,
    updated_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            ticket_id: row.get(2)?,
            status: row.get(3)?,
            iteration: row.get(4)?,
            max_iterations: row.get(5)?,
            completion_promise: row.get(6)?,
            sandbox_path: row.get(7)?,
            branch_name: row.get(8)?,
            pr_url: row.get(9)?,
            pr_number: row.get(10)?,
            blocked_by_job_id: row.get(11)?,
            error_message: row.get(12)?,
            error_stack: row.get(13)?,
            worker_id: row.get(14)?,
            clarification_question: row.get(15)?,
            clarification_answer: row.get(16)?,
            pending_permission_request: row.get(17)?,
            final_output: row.get(18)?,
            created_at: row.get(19)?,
            updated_at: row.get(20)?,
            started_at: row.get(21)?,
            completed_at: row.get(22)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        let status = JobStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse job status")?;
        Ok(Job {
            id: self.id,
            project_id: self.project_id,
            ticket_id: self.ticket_id,
            status,
            iteration: self.iteration,
            max_iterations: self.max_iterations,
            completion_promise: self.completion_promise,
            sandbox_path: self.sandbox_path,
            branch_name: self.branch_name,
            pr_url: self.pr_url,
            pr_number: self.pr_number,
            blocked_by_job_id: self.blocked_by_job_id,
            error_message: self.error_message,
            error_stack: self.error_stack,
            worker_id: self.worker_id,
            clarification_question: self.clarification_question,
            clarification_answer: self.clarification_answer,
            pending_permission_request: self.pending_permission_request,
            final_output: self.final_output,
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

struct JobLogRow {
    id: i64,
    job_id: String,
    iteration: u32,
    event_type: String,
    event_data: Option<String>,
    agent_output: Option<String>,
    created_at: String,
}

impl JobLogRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            job_id: row.get(1)?,
            iteration: row.get(2)?,
            event_type: row.get(3)?,
            event_data: row.get(4)?,
            agent_output: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn into_job_log(self) -> Result<JobLog> {
        let event = JobLogEvent::from_str(&self.event_type)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse job log event")?;
        let event_data = self
            .event_data
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("Failed to parse job log event data")?;
        Ok(JobLog {
            id: self.id,
            job_id: self.job_id,
            iteration: self.iteration,
            event,
            event_data,
            agent_output: self.agent_output,
            created_at: self.created_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
