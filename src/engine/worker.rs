//! Queue subscribers that run execution loops.
//!
//! Every handler is idempotent against redelivery: it re-reads the job row
//! and only acts when the status says the message still applies. Messages
//! for a job that is running elsewhere are retried by the queue; messages
//! that no longer apply are acknowledged and dropped.

use std::sync::Arc;

use anyhow::{Result, bail};
use tracing::{debug, info, warn};

use super::dispatch::{Dispatcher, RecoveryReport};
use super::execution::{ExecutionLoop, LoopContext, LoopOutcome};
use super::executor::AbortReason;
use super::models::Job;
use super::queue::{Delivery, Queue};
use super::registry::{JobRegistry, LoopCommand};
use crate::errors::EngineError;
use ticketsmith_common::{
    JobCancelPayload, JobLogEvent, JobPermissionAnswerPayload, JobProcessPayload,
    JobResumePayload, JobSpec, JobStatus, topics,
};

const DEFAULT_CANCEL_REASON: &str = "Cancelled by user";

pub struct Worker {
    handlers: Arc<Handlers>,
    concurrency: usize,
}

struct Handlers {
    ctx: LoopContext,
    queue: Arc<Queue>,
    registry: JobRegistry,
    dispatcher: Dispatcher,
    default_sandbox_base: String,
}

impl Worker {
    pub fn new(
        ctx: LoopContext,
        queue: Arc<Queue>,
        default_sandbox_base: impl Into<String>,
        concurrency: usize,
    ) -> Self {
        let default_sandbox_base = default_sandbox_base.into();
        let dispatcher = Dispatcher::new(ctx.db.clone(), queue.clone(), default_sandbox_base.clone());
        Self {
            handlers: Arc::new(Handlers {
                ctx,
                queue,
                registry: JobRegistry::new(),
                dispatcher,
                default_sandbox_base,
            }),
            concurrency,
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.handlers.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.handlers.dispatcher
    }

    /// Start the queue, recover orphaned jobs, then subscribe to every topic.
    pub async fn start(&self) -> Result<RecoveryReport> {
        let queue = &self.handlers.queue;
        queue.start().await?;
        for topic in topics::ALL {
            queue.declare_topic(topic).await?;
        }

        let report = self.handlers.dispatcher.recover_orphaned_jobs().await?;

        let h = self.handlers.clone();
        queue
            .subscribe(topics::JOB_PROCESS, self.concurrency, move |d| {
                let h = h.clone();
                async move { h.handle_process(d).await }
            })
            .await?;
        let h = self.handlers.clone();
        queue
            .subscribe(topics::JOB_RESUME, self.concurrency, move |d| {
                let h = h.clone();
                async move { h.handle_resume(d).await }
            })
            .await?;
        let h = self.handlers.clone();
        queue
            .subscribe(topics::JOB_PERMISSION_ANSWER, self.concurrency, move |d| {
                let h = h.clone();
                async move { h.handle_permission(d).await }
            })
            .await?;
        let h = self.handlers.clone();
        queue
            .subscribe(topics::JOB_CANCEL, self.concurrency, move |d| {
                let h = h.clone();
                async move { h.handle_cancel(d).await }
            })
            .await?;

        info!(
            worker_id = %self.handlers.ctx.settings.worker_id,
            concurrency = self.concurrency,
            "Worker started"
        );
        Ok(report)
    }

    /// Interrupt live loops and wait for every handler to return. Running
    /// jobs go back to `pending` with a fresh `job-process` message.
    pub async fn stop(&self) {
        let aborted = self.handlers.registry.abort_all(AbortReason::Shutdown);
        if aborted > 0 {
            info!(count = aborted, "Interrupting live jobs");
        }
        self.handlers.queue.stop().await;
        info!("Worker stopped");
    }
}

impl Handlers {
    async fn load_job(&self, job_id: &str) -> Result<Option<Job>> {
        let id = job_id.to_string();
        self.ctx.db.call(move |db| db.get_job(&id)).await
    }

    async fn load_spec(&self, job_id: &str) -> Result<JobSpec> {
        let id = job_id.to_string();
        let base = self.default_sandbox_base.clone();
        self.ctx.db.call(move |db| db.job_spec(&id, &base)).await
    }

    /// Someone is working on the job: a loop in this process, or another
    /// delivery for it with an unexpired lease.
    async fn is_busy(&self, job_id: &str, delivery: &Delivery) -> Result<bool> {
        if self.registry.contains(job_id) {
            return Ok(true);
        }
        Ok(self.queue.has_live_lease(job_id, &delivery.id).await?)
    }

    async fn release(&self, job_id: &str) -> Result<Job> {
        let id = job_id.to_string();
        let job = self.ctx.db.call(move |db| db.release_job(&id)).await?;
        warn!(job_id, "Reclaimed job from a worker that is gone");
        Ok(job)
    }

    async fn handle_process(&self, delivery: Delivery) -> Result<()> {
        let JobProcessPayload { mut spec } = delivery.decode()?;
        let Some(mut job) = self.load_job(&spec.job_id).await? else {
            warn!(job_id = %spec.job_id, "Job no longer exists; dropping message");
            return Ok(());
        };

        match job.status {
            JobStatus::Pending if !self.is_busy(&job.id, &delivery).await? => {}
            JobStatus::Running if !self.is_busy(&job.id, &delivery).await? => {
                job = self.release(&job.id).await?;
            }
            status => {
                info!(
                    job_id = %job.id,
                    status = %status,
                    redelivery = delivery.is_redelivery(),
                    "Job already handled; skipping"
                );
                return Ok(());
            }
        }

        // A retained sandbox recorded on the row beats a stale snapshot.
        if spec.sandbox_path.is_none() {
            spec.sandbox_path = job.sandbox_path.clone();
        }
        if spec.branch_name.is_none() {
            spec.branch_name = job.branch_name.clone();
        }

        let registration = self.registry.register(&job.id);
        let outcome = ExecutionLoop::restore(self.ctx.clone(), spec, &job, registration)
            .run()
            .await?;
        self.finish(&job.id, outcome).await
    }

    async fn handle_resume(&self, delivery: Delivery) -> Result<()> {
        let JobResumePayload { job_id, answer } = delivery.decode()?;
        let Some(job) = self.load_job(&job_id).await? else {
            warn!(job_id = %job_id, "Job no longer exists; dropping answer");
            return Ok(());
        };

        match job.status {
            JobStatus::NeedsClarification => {
                let command = LoopCommand::Answer(answer);
                let Some(LoopCommand::Answer(answer)) = self.forward(&job_id, command) else {
                    return Ok(());
                };
                let spec = self.load_spec(&job_id).await?;
                let registration = self.registry.register(&job_id);
                let outcome = ExecutionLoop::restore(self.ctx.clone(), spec, &job, registration)
                    .resume_with_answer(answer)
                    .await?;
                self.finish(&job_id, outcome).await
            }
            status => self.stale_control(&job, &delivery, status, "answer").await,
        }
    }

    async fn handle_permission(&self, delivery: Delivery) -> Result<()> {
        let JobPermissionAnswerPayload {
            job_id,
            approved,
            command,
        } = delivery.decode()?;
        let Some(job) = self.load_job(&job_id).await? else {
            warn!(job_id = %job_id, "Job no longer exists; dropping permission decision");
            return Ok(());
        };

        match job.status {
            JobStatus::NeedsPermission => {
                let decision = LoopCommand::Permission { approved, command };
                let Some(LoopCommand::Permission { approved, command }) =
                    self.forward(&job_id, decision)
                else {
                    return Ok(());
                };
                let spec = self.load_spec(&job_id).await?;
                let registration = self.registry.register(&job_id);
                let outcome = ExecutionLoop::restore(self.ctx.clone(), spec, &job, registration)
                    .resume_with_permission(approved, command)
                    .await?;
                self.finish(&job_id, outcome).await
            }
            status => self.stale_control(&job, &delivery, status, "permission decision").await,
        }
    }

    /// Hand a command to a live loop that is just pausing. Gives the command
    /// back when the job has to be resumed cold.
    fn forward(&self, job_id: &str, command: LoopCommand) -> Option<LoopCommand> {
        let Some(handle) = self.registry.get(job_id) else {
            return Some(command);
        };
        match handle.send(command) {
            Ok(()) => {
                debug!(job_id, "Forwarded command to live loop");
                None
            }
            Err(command) => Some(command),
        }
    }

    /// A resume-type message arrived for a job that is not paused.
    async fn stale_control(
        &self,
        job: &Job,
        delivery: &Delivery,
        status: JobStatus,
        what: &str,
    ) -> Result<()> {
        match status {
            JobStatus::Running if self.is_busy(&job.id, delivery).await? => {
                bail!("Job {} is still running; {} will be retried", job.id, what)
            }
            JobStatus::Running => {
                self.release(&job.id).await?;
                self.requeue(&job.id).await?;
                Ok(())
            }
            _ => {
                warn!(job_id = %job.id, status = %status, "Job is not waiting for a {}; dropping message", what);
                Ok(())
            }
        }
    }

    async fn handle_cancel(&self, delivery: Delivery) -> Result<()> {
        let JobCancelPayload { job_id, reason } = delivery.decode()?;
        let reason = reason.unwrap_or_else(|| DEFAULT_CANCEL_REASON.to_string());

        if let Some(handle) = self.registry.get(&job_id) {
            info!(job_id = %job_id, reason = %reason, "Aborting live job");
            handle.abort.abort(AbortReason::Cancelled(reason));
            return Ok(());
        }

        let id = job_id.clone();
        let message = format!("Job cancelled: {}", reason);
        let cancelled = self
            .ctx
            .db
            .call(move |db| {
                let Some(job) = db.cancel_job(&id)? else {
                    return Ok(false);
                };
                db.append_log(
                    &id,
                    job.iteration,
                    JobLogEvent::Error,
                    Some(&serde_json::json!({ "message": message })),
                    None,
                )?;
                Ok(true)
            })
            .await;
        match cancelled {
            Ok(true) => info!(job_id = %job_id, reason = %reason, "Job cancelled"),
            Ok(false) => debug!(job_id = %job_id, "Job already finished; cancel ignored"),
            Err(e) if matches!(e.downcast_ref::<EngineError>(), Some(EngineError::JobNotFound { .. })) => {
                warn!(job_id = %job_id, "Cancel for unknown job ignored")
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    async fn finish(&self, job_id: &str, outcome: LoopOutcome) -> Result<()> {
        info!(job_id, outcome = ?outcome, "Loop finished");
        if outcome == LoopOutcome::Interrupted {
            let pending = self
                .load_job(job_id)
                .await?
                .is_some_and(|job| job.status == JobStatus::Pending);
            if pending {
                self.requeue(job_id).await?;
            }
        }
        Ok(())
    }

    async fn requeue(&self, job_id: &str) -> Result<()> {
        let spec = self.load_spec(job_id).await?;
        self.dispatcher.enqueue_process(&spec).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxSettings;
    use crate::engine::db::tests::{seed_project, seed_ticket};
    use crate::engine::db::{DbHandle, EngineDb};
    use crate::engine::execution::LoopSettings;
    use crate::engine::executor::{AbortSignal, AgentRunner, ExecutionRequest, ExecutionResult};
    use crate::engine::providers::ProviderRegistry;
    use crate::engine::queue::{MessageState, QueueConfig, QueueDb};
    use crate::engine::sandbox::SandboxManager;
    use crate::errors::ExecutorError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    /// Completes on the first iteration and counts how often it ran.
    #[derive(Default)]
    struct CompletingRunner {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl AgentRunner for CompletingRunner {
        async fn execute(
            &self,
            _request: ExecutionRequest,
            _output: mpsc::UnboundedSender<String>,
            _abort: &AbortSignal,
        ) -> Result<ExecutionResult, ExecutorError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(ExecutionResult {
                output: "<promise>TASK COMPLETE</promise>".to_string(),
                exit_code: Some(0),
            })
        }
    }

    struct Fixture {
        worker: Worker,
        db: DbHandle,
        queue: Arc<Queue>,
        runner: Arc<CompletingRunner>,
        job_id: String,
        _dir: TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let sandbox = dir.path().join("sandbox");
        std::fs::create_dir_all(sandbox.join(".git")).unwrap();

        let engine = EngineDb::new_in_memory().unwrap();
        let project = seed_project(&engine).unwrap();
        let ticket = seed_ticket(&engine, &project.id, "ENG-3").unwrap();
        let job = engine.create_job(&project.id, &ticket.id).unwrap();
        engine
            .assign_worker(&job.id, &sandbox.to_string_lossy(), "ticketsmith/ENG-3", "seed")
            .unwrap();
        let db = DbHandle::new(engine);

        let queue = Arc::new(Queue::new(
            QueueDb::new_in_memory().unwrap(),
            QueueConfig {
                worker_id: "worker-test".to_string(),
                poll_interval: Duration::from_millis(10),
                lease: Duration::from_secs(30),
                max_attempts: 3,
                retry_backoff: Duration::from_millis(10),
            },
        ));
        let runner = Arc::new(CompletingRunner::default());
        let ctx = LoopContext {
            db: db.clone(),
            runner: runner.clone(),
            sandbox: Arc::new(SandboxManager::new(SandboxSettings::default())),
            providers: Arc::new(ProviderRegistry::new()),
            settings: LoopSettings {
                worker_id: "worker-test".to_string(),
                iteration_timeout: Duration::from_secs(5),
                flush_interval: Duration::from_millis(10),
                flush_bytes: 1024,
            },
        };
        let worker = Worker::new(ctx, queue.clone(), dir.path().to_string_lossy(), 2);
        Fixture {
            worker,
            db,
            queue,
            runner,
            job_id: job.id,
            _dir: dir,
        }
    }

    fn status(f: &Fixture) -> JobStatus {
        f.db.lock_sync().unwrap().require_job(&f.job_id).unwrap().status
    }

    async fn wait_for_status(f: &Fixture, want: JobStatus) {
        for _ in 0..200 {
            if status(f) == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job never reached {}, still {}", want, status(f));
    }

    #[tokio::test]
    async fn test_recovery_then_process_completes_job() {
        let f = fixture().await;
        let report = f.worker.start().await.unwrap();
        assert_eq!(report.requeued, 1);

        wait_for_status(&f, JobStatus::Completed).await;
        f.worker.stop().await;
        assert_eq!(f.runner.runs.load(Ordering::SeqCst), 1);
        assert!(f.worker.registry().is_empty());
    }

    #[tokio::test]
    async fn test_process_redelivery_for_finished_job_is_acknowledged() {
        let f = fixture().await;
        f.worker.start().await.unwrap();
        wait_for_status(&f, JobStatus::Completed).await;

        let spec = f.handlers_spec().await;
        f.worker.dispatcher().enqueue_process(&spec).await.unwrap();
        for _ in 0..200 {
            let done = f
                .queue
                .db()
                .lock_sync()
                .unwrap()
                .count(topics::JOB_PROCESS, MessageState::Completed)
                .unwrap();
            if done == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        f.worker.stop().await;
        assert_eq!(f.runner.runs.load(Ordering::SeqCst), 1, "agent ran once");
    }

    #[tokio::test]
    async fn test_cold_cancel_marks_job_cancelled() {
        let f = fixture().await;
        let delivery = Delivery {
            id: "msg-1".to_string(),
            topic: topics::JOB_CANCEL.to_string(),
            payload: serde_json::json!({ "jobId": f.job_id, "reason": "duplicate" }),
            attempt: 1,
        };
        f.worker.handlers.handle_cancel(delivery).await.unwrap();

        assert_eq!(status(&f), JobStatus::Cancelled);
        let log = f
            .db
            .lock_sync()
            .unwrap()
            .latest_log(&f.job_id, JobLogEvent::Error)
            .unwrap()
            .unwrap();
        assert_eq!(log.event_data.unwrap()["message"], "Job cancelled: duplicate");
    }

    #[tokio::test]
    async fn test_cancel_for_unknown_job_is_acknowledged() {
        let f = fixture().await;
        let delivery = Delivery {
            id: "msg-1".to_string(),
            topic: topics::JOB_CANCEL.to_string(),
            payload: serde_json::json!({ "jobId": "missing" }),
            attempt: 1,
        };
        f.worker.handlers.handle_cancel(delivery).await.unwrap();
    }

    #[tokio::test]
    async fn test_answer_for_job_that_is_not_paused_is_dropped() {
        let f = fixture().await;
        let delivery = Delivery {
            id: "msg-1".to_string(),
            topic: topics::JOB_RESUME.to_string(),
            payload: serde_json::json!({ "jobId": f.job_id, "answer": "yes" }),
            attempt: 1,
        };
        f.worker.handlers.handle_resume(delivery).await.unwrap();
        assert_eq!(status(&f), JobStatus::Pending);
        assert_eq!(f.runner.runs.load(Ordering::SeqCst), 0);
    }

    impl Fixture {
        async fn handlers_spec(&self) -> JobSpec {
            self.worker.handlers.load_spec(&self.job_id).await.unwrap()
        }
    }
}
