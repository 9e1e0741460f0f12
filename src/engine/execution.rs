//! The per-job execution loop.
//!
//! An `ExecutionLoop` owns one job's `ExecutionState` and drives it through
//! agent iterations until a signal, a failure, an abort, or the iteration
//! budget ends the run. Pausing (clarification, permission) returns from the
//! loop; a later resume rebuilds it from the database and continues with the
//! same iteration counter.
//!
//! Each iteration commits its output and status before the next message for
//! the job can be processed, so resuming from persisted state is always safe.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::db::{DbHandle, EngineDb, MAX_LOG_OUTPUT_CHARS};
use super::executor::{AbortReason, AbortSignal, AgentRunner, ExecutionRequest};
use super::models::Job;
use super::prompt::{Preamble, build_prompt};
use super::providers::{ProviderConfig, ProviderRegistry, STATUS_DONE, STATUS_IN_PROGRESS};
use super::registry::{LoopCommand, Registration, RegistrationGuard};
use super::sandbox::{Sandbox, SandboxManager};
use crate::config::{AgentSettings, WorkerSettings};
use crate::errors::EngineError;
use crate::signals::{PullRequestRef, Signal, SignalParser};
use crate::util::{truncate_chars, truncate_with_marker};
use ticketsmith_common::{JobLogEvent, JobSpec, JobStatus};

/// Prompt text kept on an `iteration_start` record.
const PROMPT_LOG_CHARS: usize = 1000;
/// Longest ticket comment posted on completion.
const COMMENT_MAX_CHARS: usize = 10_000;
const DEFAULT_COMPLETION_COMMENT: &str = "ticketsmith has completed work on this ticket.";

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub worker_id: String,
    pub iteration_timeout: Duration,
    /// Flush streamed output at least this often...
    pub flush_interval: Duration,
    /// ...or once this many bytes arrived since the last flush.
    pub flush_bytes: usize,
}

impl LoopSettings {
    pub fn new(worker: &WorkerSettings, agent: &AgentSettings) -> Self {
        Self {
            worker_id: worker.worker_id.clone(),
            iteration_timeout: Duration::from_secs(agent.iteration_timeout_secs),
            flush_interval: Duration::from_millis(agent.flush_interval_ms),
            flush_bytes: agent.flush_bytes,
        }
    }
}

/// Shared collaborators for every loop a worker runs.
#[derive(Clone)]
pub struct LoopContext {
    pub db: DbHandle,
    pub runner: Arc<dyn AgentRunner>,
    pub sandbox: Arc<SandboxManager>,
    pub providers: Arc<ProviderRegistry>,
    pub settings: LoopSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionState {
    pub iteration: u32,
    pub max_iterations: u32,
    pub completion_promise: String,
    /// Resume context prepended to every prompt until the next pause.
    pub preamble: Option<Preamble>,
    pub sandbox: Option<Sandbox>,
    pub last_output: Option<String>,
}

/// How a run of the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    Completed,
    PrCreated,
    NeedsClarification,
    NeedsPermission,
    Failed,
    Cancelled,
    /// Stopped by worker shutdown; the job is back to `pending`.
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pause {
    Clarification,
    Permission,
}

pub struct ExecutionLoop {
    ctx: LoopContext,
    spec: JobSpec,
    state: ExecutionState,
    abort: AbortSignal,
    commands: mpsc::UnboundedReceiver<LoopCommand>,
    _registration: RegistrationGuard,
}

impl ExecutionLoop {
    /// Build a loop for `job`, continuing from its persisted iteration.
    pub fn restore(ctx: LoopContext, spec: JobSpec, job: &Job, registration: Registration) -> Self {
        let state = ExecutionState {
            iteration: job.iteration,
            max_iterations: job.max_iterations,
            completion_promise: job.completion_promise.clone(),
            preamble: None,
            sandbox: None,
            last_output: None,
        };
        Self {
            ctx,
            spec,
            state,
            abort: registration.abort,
            commands: registration.commands,
            _registration: registration.guard,
        }
    }

    fn job_id(&self) -> String {
        self.spec.job_id.clone()
    }

    /// Start a pending job: provision or reuse its sandbox, mark it running,
    /// then iterate. A job released after a resume keeps its answer or
    /// permission decision.
    pub async fn run(mut self) -> Result<LoopOutcome> {
        info!(job_id = %self.spec.job_id, title = %self.spec.title, "Starting job");
        if self.abort.is_aborted() {
            return self.handle_abort().await;
        }
        let id = self.job_id();
        self.state.preamble = self.ctx.db.call(move |db| resume_preamble(db, &id)).await?;
        if self.state.preamble.is_some() {
            debug!(job_id = %self.spec.job_id, "Restored resume context");
        }
        let sandbox = match self.ensure_sandbox().await {
            Ok(sandbox) => sandbox,
            Err(e) => return self.fail(e).await,
        };

        let id = self.job_id();
        let path = sandbox.path.to_string_lossy().into_owned();
        let branch = sandbox.branch_name.clone();
        let worker_id = self.ctx.settings.worker_id.clone();
        self.ctx
            .db
            .call(move |db| db.start_job(&id, &path, &branch, &worker_id))
            .await?;
        info!(
            job_id = %self.spec.job_id,
            sandbox = %sandbox.path.display(),
            branch = %sandbox.branch_name,
            "Job running"
        );
        self.state.sandbox = Some(sandbox);
        self.notify_ticket(Some(STATUS_IN_PROGRESS), None).await;

        self.drive().await
    }

    /// Continue a job paused for clarification.
    pub async fn resume_with_answer(mut self, answer: String) -> Result<LoopOutcome> {
        self.apply_answer(answer).await?;
        self.resume().await
    }

    /// Continue a job paused for a permission decision.
    pub async fn resume_with_permission(mut self, approved: bool, command: String) -> Result<LoopOutcome> {
        self.apply_permission(approved, command).await?;
        self.resume().await
    }

    async fn resume(&mut self) -> Result<LoopOutcome> {
        let sandbox = match self.ensure_sandbox().await {
            Ok(sandbox) => sandbox,
            Err(e) => return self.fail(e).await,
        };
        let id = self.job_id();
        let path = sandbox.path.to_string_lossy().into_owned();
        let branch = sandbox.branch_name.clone();
        let worker_id = self.ctx.settings.worker_id.clone();
        self.ctx
            .db
            .call(move |db| db.assign_worker(&id, &path, &branch, &worker_id))
            .await?;
        self.state.sandbox = Some(sandbox);
        info!(job_id = %self.spec.job_id, iteration = self.state.iteration, "Job resumed");
        self.drive().await
    }

    async fn drive(&mut self) -> Result<LoopOutcome> {
        loop {
            if self.abort.is_aborted() {
                return self.handle_abort().await;
            }
            match self.run_iteration().await {
                // A cancel that raced the pause still wins.
                Ok(Some(LoopOutcome::NeedsClarification | LoopOutcome::NeedsPermission))
                    if self.abort.is_aborted() =>
                {
                    return self.handle_abort().await;
                }
                Ok(Some(outcome)) => return Ok(outcome),
                Ok(None) => {}
                Err(e) if self.abort.is_aborted() => {
                    debug!(job_id = %self.spec.job_id, error = %format!("{:#}", e), "Iteration aborted");
                    return self.handle_abort().await;
                }
                Err(e) => return self.fail(e).await,
            }
        }
    }

    /// One agent iteration. `Ok(None)` means keep going.
    async fn run_iteration(&mut self) -> Result<Option<LoopOutcome>> {
        let id = self.job_id();
        let current = self.ctx.db.call(move |db| db.require_job(&id)).await?;
        if current.status == JobStatus::Cancelled {
            info!(job_id = %self.spec.job_id, "Job was cancelled elsewhere; stopping");
            return Ok(Some(LoopOutcome::Cancelled));
        }

        let max = self.state.max_iterations;
        if self.state.iteration >= max {
            self.log(
                JobLogEvent::MaxIterationsReached,
                Some(json!({ "maxIterations": max })),
                None,
            )
            .await?;
            return Err(EngineError::MaxIterations { max }.into());
        }

        self.state.iteration += 1;
        let iteration = self.state.iteration;
        let id = self.job_id();
        self.ctx
            .db
            .call(move |db| db.set_iteration(&id, iteration))
            .await?;

        let prompt = build_prompt(&self.spec, iteration, max, self.state.preamble.as_ref());
        info!(job_id = %self.spec.job_id, iteration, max, "Iteration started");
        self.log(
            JobLogEvent::IterationStart,
            Some(json!({ "prompt": truncate_chars(&prompt, PROMPT_LOG_CHARS) })),
            None,
        )
        .await?;
        let output_log = self
            .log(JobLogEvent::IterationOutput, None, Some(String::new()))
            .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(stream_output(
            self.ctx.db.clone(),
            output_log,
            rx,
            self.ctx.settings.flush_interval,
            self.ctx.settings.flush_bytes,
        ));
        let request = ExecutionRequest {
            working_dir: self.sandbox_path(),
            prompt,
            timeout: self.ctx.settings.iteration_timeout,
        };
        let result = self.ctx.runner.execute(request, tx, &self.abort).await;
        if let Err(e) = writer.await {
            warn!(job_id = %self.spec.job_id, error = %e, "Output writer ended abnormally");
        }
        let result = result?;

        let output = result.output.clone();
        self.ctx
            .db
            .call(move |db| db.update_log_output(output_log, &output))
            .await?;

        let signals = SignalParser::new(self.state.completion_promise.clone()).parse(&result.output);
        self.log(
            JobLogEvent::IterationEnd,
            Some(json!({ "exitCode": result.exit_code, "signals": signals })),
            None,
        )
        .await?;
        debug!(
            job_id = %self.spec.job_id,
            iteration,
            exit_code = ?result.exit_code,
            signals = ?signals,
            "Iteration finished"
        );
        self.state.last_output = Some(result.output);

        if signals.decisive().is_some() && self.cancelled_elsewhere().await? {
            debug!(job_id = %self.spec.job_id, iteration, "Job was cancelled during the iteration; ignoring signals");
            return Ok(Some(LoopOutcome::Cancelled));
        }

        match signals.decisive() {
            None => Ok(None),
            Some(Signal::Completion) => self.on_completion().await.map(Some),
            Some(Signal::Clarification(question)) => self.on_clarification(question).await,
            Some(Signal::Permission(command)) => self.on_permission(command).await,
            Some(Signal::PullRequest(pr)) => self.on_pull_request(pr).await.map(Some),
        }
    }

    async fn on_completion(&mut self) -> Result<LoopOutcome> {
        let output = self.state.last_output.clone().unwrap_or_default();
        let id = self.job_id();
        let final_output = output.clone();
        self.ctx
            .db
            .call(move |db| db.complete_job(&id, &final_output))
            .await?;
        self.log(JobLogEvent::Completed, None, None).await?;
        info!(job_id = %self.spec.job_id, iteration = self.state.iteration, "Job completed");

        let comment = if output.trim().is_empty() {
            DEFAULT_COMPLETION_COMMENT.to_string()
        } else {
            truncate_with_marker(&output, COMMENT_MAX_CHARS)
        };
        self.notify_ticket(Some(STATUS_DONE), Some(&comment)).await;

        if let Some(sandbox) = self.state.sandbox.take() {
            self.ctx.sandbox.cleanup(&sandbox.path).await;
        }
        Ok(LoopOutcome::Completed)
    }

    async fn on_pull_request(&mut self, pr: PullRequestRef) -> Result<LoopOutcome> {
        let output = self.state.last_output.clone().unwrap_or_default();
        let id = self.job_id();
        let url = pr.url.clone();
        let number = pr.number;
        self.ctx
            .db
            .call(move |db| db.record_pull_request(&id, &url, number, &output))
            .await?;
        self.log(
            JobLogEvent::PrCreated,
            Some(json!({ "prUrl": pr.url, "prNumber": pr.number })),
            None,
        )
        .await?;
        info!(job_id = %self.spec.job_id, pr_url = %pr.url, "Pull request created");

        let comment = format!("Pull request created: {}", pr.url);
        self.notify_ticket(Some(STATUS_DONE), Some(&comment)).await;
        Ok(LoopOutcome::PrCreated)
    }

    async fn on_clarification(&mut self, question: String) -> Result<Option<LoopOutcome>> {
        let id = self.job_id();
        let q = question.clone();
        self.ctx
            .db
            .call(move |db| db.request_clarification(&id, &q))
            .await?;
        self.log(
            JobLogEvent::ClarificationRequested,
            Some(json!({ "question": question })),
            None,
        )
        .await?;
        info!(job_id = %self.spec.job_id, question = %question, "Clarification requested");
        self.pause(Pause::Clarification).await
    }

    async fn on_permission(&mut self, command: String) -> Result<Option<LoopOutcome>> {
        let id = self.job_id();
        let cmd = command.clone();
        self.ctx
            .db
            .call(move |db| db.request_permission(&id, &cmd))
            .await?;
        self.log(
            JobLogEvent::PermissionRequested,
            Some(json!({ "command": command })),
            None,
        )
        .await?;
        info!(job_id = %self.spec.job_id, command = %command, "Permission requested");
        self.pause(Pause::Permission).await
    }

    /// Stop accepting live commands and apply one that already arrived for
    /// this pause. Returns the pause outcome when there is none.
    async fn pause(&mut self, waiting_for: Pause) -> Result<Option<LoopOutcome>> {
        self.commands.close();
        let mut resolution = None;
        while let Ok(command) = self.commands.try_recv() {
            let fits = matches!(
                (waiting_for, &command),
                (Pause::Clarification, LoopCommand::Answer(_))
                    | (Pause::Permission, LoopCommand::Permission { .. })
            );
            if fits && resolution.is_none() {
                resolution = Some(command);
            } else {
                warn!(job_id = %self.spec.job_id, command = ?command, "Discarding command that does not match the pause");
            }
        }

        match resolution {
            Some(LoopCommand::Answer(answer)) => {
                self.apply_answer(answer).await?;
                Ok(None)
            }
            Some(LoopCommand::Permission { approved, command }) => {
                self.apply_permission(approved, command).await?;
                Ok(None)
            }
            None => Ok(Some(match waiting_for {
                Pause::Clarification => LoopOutcome::NeedsClarification,
                Pause::Permission => LoopOutcome::NeedsPermission,
            })),
        }
    }

    async fn apply_answer(&mut self, answer: String) -> Result<()> {
        let id = self.job_id();
        let stored = answer.clone();
        let question = self
            .ctx
            .db
            .call(move |db| {
                let job = db.require_job(&id)?;
                let question = match job.clarification_question {
                    Some(question) => question,
                    None => db
                        .latest_log(&id, JobLogEvent::ClarificationRequested)?
                        .and_then(|log| log.event_data)
                        .and_then(|data| {
                            data.get("question")
                                .and_then(|q| q.as_str())
                                .map(str::to_string)
                        })
                        .unwrap_or_default(),
                };
                db.answer_clarification(&id, &stored)?;
                Ok(question)
            })
            .await?;
        info!(job_id = %self.spec.job_id, "Clarification answered");
        self.state.preamble = Some(Preamble::Answer { question, answer });
        Ok(())
    }

    async fn apply_permission(&mut self, approved: bool, command: String) -> Result<()> {
        let id = self.job_id();
        self.ctx
            .db
            .call(move |db| db.resolve_permission(&id))
            .await?;
        let event = if approved {
            JobLogEvent::PermissionApproved
        } else {
            JobLogEvent::PermissionDenied
        };
        self.log(event, Some(json!({ "command": command })), None)
            .await?;
        info!(job_id = %self.spec.job_id, approved, command = %command, "Permission decided");
        self.state.preamble = Some(if approved {
            Preamble::PermissionApproved(command)
        } else {
            Preamble::PermissionDenied(command)
        });
        Ok(())
    }

    async fn handle_abort(&mut self) -> Result<LoopOutcome> {
        let id = self.job_id();
        match self.abort.reason() {
            Some(AbortReason::Cancelled(reason)) => {
                let cancelled = self.ctx.db.call(move |db| db.cancel_job(&id)).await?;
                if cancelled.is_some() {
                    self.log(
                        JobLogEvent::Error,
                        Some(json!({ "message": format!("Job cancelled: {}", reason) })),
                        None,
                    )
                    .await?;
                }
                info!(job_id = %self.spec.job_id, reason = %reason, "Job cancelled");
                Ok(LoopOutcome::Cancelled)
            }
            _ => {
                self.ctx
                    .db
                    .call(move |db| {
                        if db.require_job(&id)?.status == JobStatus::Running {
                            db.release_job(&id)?;
                        }
                        Ok(())
                    })
                    .await?;
                info!(job_id = %self.spec.job_id, iteration = self.state.iteration, "Job released for redelivery");
                Ok(LoopOutcome::Interrupted)
            }
        }
    }

    /// Mark the job failed with the error chain and keep the sandbox for
    /// inspection or retry.
    async fn fail(&mut self, err: anyhow::Error) -> Result<LoopOutcome> {
        let message = format!("{:#}", err);
        if self.cancelled_elsewhere().await.unwrap_or(false) {
            debug!(job_id = %self.spec.job_id, error = %message, "Job was cancelled elsewhere; not marking it failed");
            return Ok(LoopOutcome::Cancelled);
        }
        let stack = format!("{:?}", err);
        error!(
            job_id = %self.spec.job_id,
            iteration = self.state.iteration,
            error = %message,
            "Job failed"
        );
        let id = self.job_id();
        let stored = message.clone();
        if let Err(e) = self
            .ctx
            .db
            .call(move |db| db.fail_job(&id, &stored, Some(&stack)))
            .await
        {
            warn!(job_id = %self.spec.job_id, error = %format!("{:#}", e), "Could not mark job failed");
        }
        self.log(JobLogEvent::Error, Some(json!({ "message": message })), None)
            .await?;
        Ok(LoopOutcome::Failed)
    }

    async fn cancelled_elsewhere(&self) -> Result<bool> {
        let id = self.job_id();
        let job = self.ctx.db.call(move |db| db.require_job(&id)).await?;
        Ok(job.status == JobStatus::Cancelled)
    }

    async fn ensure_sandbox(&self) -> Result<Sandbox> {
        if let Some(path) = self.spec.sandbox_path.as_deref().map(PathBuf::from) {
            if self.ctx.sandbox.exists(&path) {
                debug!(job_id = %self.spec.job_id, path = %path.display(), "Reusing sandbox");
                let branch_name = self
                    .spec
                    .branch_name
                    .clone()
                    .unwrap_or_else(|| self.ctx.sandbox.branch_for(&self.spec));
                return Ok(Sandbox { path, branch_name });
            }
        }
        Ok(self.ctx.sandbox.create(&self.spec).await?)
    }

    fn sandbox_path(&self) -> PathBuf {
        match &self.state.sandbox {
            Some(sandbox) => sandbox.path.clone(),
            None => PathBuf::from(&self.spec.sandbox_base_path),
        }
    }

    async fn log(
        &self,
        event: JobLogEvent,
        data: Option<serde_json::Value>,
        output: Option<String>,
    ) -> Result<i64> {
        let id = self.job_id();
        let iteration = self.state.iteration;
        self.ctx
            .db
            .call(move |db| db.append_log(&id, iteration, event, data.as_ref(), output.as_deref()))
            .await
    }

    /// Provider calls never fail the job.
    async fn notify_ticket(&self, status: Option<&str>, comment: Option<&str>) {
        let Some(provider) = self
            .ctx
            .providers
            .resolve_name(self.spec.ticket_provider.as_deref())
        else {
            return;
        };
        let config = ProviderConfig {
            token: self.spec.ticket_provider_token.clone(),
            extra: self.spec.ticket_provider_config.clone(),
        };
        let external_id = &self.spec.external_ticket_id;

        if let Some(status) = status {
            match provider.update_status(external_id, status, &config).await {
                Ok(()) => debug!(job_id = %self.spec.job_id, status, "Ticket status updated"),
                Err(e) => warn!(job_id = %self.spec.job_id, error = %e, "Failed to update ticket status"),
            }
        }
        if let Some(comment) = comment {
            match provider.add_comment(external_id, comment, &config).await {
                Ok(()) => debug!(job_id = %self.spec.job_id, "Ticket comment added"),
                Err(e) => warn!(job_id = %self.spec.job_id, error = %e, "Failed to add ticket comment"),
            }
        }
    }
}

/// Resume context for a job that was answered or had a permission decided
/// and has not paused again since.
fn resume_preamble(db: &EngineDb, job_id: &str) -> Result<Option<Preamble>> {
    let latest = db.latest_log_of(
        job_id,
        &[
            JobLogEvent::ClarificationRequested,
            JobLogEvent::PermissionRequested,
            JobLogEvent::PermissionApproved,
            JobLogEvent::PermissionDenied,
        ],
    )?;
    let Some(log) = latest else {
        return Ok(None);
    };
    let logged = |key: &str| {
        log.event_data
            .as_ref()
            .and_then(|data| data.get(key))
            .and_then(|value| value.as_str())
            .map(str::to_string)
    };
    let preamble = match log.event {
        JobLogEvent::PermissionApproved => logged("command").map(Preamble::PermissionApproved),
        JobLogEvent::PermissionDenied => logged("command").map(Preamble::PermissionDenied),
        JobLogEvent::ClarificationRequested => {
            let job = db.require_job(job_id)?;
            job.clarification_answer.map(|answer| Preamble::Answer {
                question: job
                    .clarification_question
                    .or_else(|| logged("question"))
                    .unwrap_or_default(),
                answer,
            })
        }
        _ => None,
    };
    Ok(preamble)
}

/// Drain streamed output into the `iteration_output` record, flushing on
/// time or size since the last flush, and once more when the stream ends.
async fn stream_output(
    db: DbHandle,
    log_id: i64,
    mut chunks: mpsc::UnboundedReceiver<String>,
    flush_interval: Duration,
    flush_bytes: usize,
) {
    let mut output = String::new();
    let mut unflushed = 0usize;
    let mut last_flush = Instant::now();

    while let Some(chunk) = chunks.recv().await {
        unflushed += chunk.len();
        output.push_str(&chunk);
        if unflushed >= flush_bytes || last_flush.elapsed() >= flush_interval {
            flush_output(&db, log_id, &output).await;
            unflushed = 0;
            last_flush = Instant::now();
        }
    }
    if unflushed > 0 {
        flush_output(&db, log_id, &output).await;
    }
}

async fn flush_output(db: &DbHandle, log_id: i64, output: &str) {
    let snapshot = truncate_chars(output, MAX_LOG_OUTPUT_CHARS).to_string();
    if let Err(e) = db
        .call(move |db| db.update_log_output(log_id, &snapshot))
        .await
    {
        warn!(log_id, error = %format!("{:#}", e), "Failed to flush iteration output");
    }
}
