//! Enqueueing work for the worker, plus startup recovery.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use super::db::DbHandle;
use super::models::Job;
use super::queue::Queue;
use ticketsmith_common::{
    JobCancelPayload, JobPermissionAnswerPayload, JobProcessPayload, JobResumePayload, JobSpec,
    JobStatus, topics,
};

/// What startup recovery changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// `running` jobs nobody was processing, put back to `pending`.
    pub released: usize,
    /// `pending` jobs that got a fresh `job-process` message.
    pub requeued: usize,
}

#[derive(Clone)]
pub struct Dispatcher {
    db: DbHandle,
    queue: Arc<Queue>,
    default_sandbox_base: String,
}

impl Dispatcher {
    pub fn new(db: DbHandle, queue: Arc<Queue>, default_sandbox_base: impl Into<String>) -> Self {
        Self {
            db,
            queue,
            default_sandbox_base: default_sandbox_base.into(),
        }
    }

    pub async fn enqueue_process(&self, spec: &JobSpec) -> Result<String> {
        let payload = JobProcessPayload { spec: spec.clone() };
        let id = self.queue.send(topics::JOB_PROCESS, &payload).await?;
        info!(job_id = %spec.job_id, message_id = %id, "Job enqueued");
        Ok(id)
    }

    pub async fn enqueue_resume(&self, job_id: &str, answer: &str) -> Result<String> {
        let payload = JobResumePayload {
            job_id: job_id.to_string(),
            answer: answer.to_string(),
        };
        Ok(self.queue.send(topics::JOB_RESUME, &payload).await?)
    }

    pub async fn enqueue_cancel(&self, job_id: &str, reason: Option<&str>) -> Result<String> {
        let payload = JobCancelPayload {
            job_id: job_id.to_string(),
            reason: reason.map(str::to_string),
        };
        Ok(self.queue.send(topics::JOB_CANCEL, &payload).await?)
    }

    pub async fn enqueue_permission_answer(
        &self,
        job_id: &str,
        approved: bool,
        command: &str,
    ) -> Result<String> {
        let payload = JobPermissionAnswerPayload {
            job_id: job_id.to_string(),
            approved,
            command: command.to_string(),
        };
        Ok(self
            .queue
            .send(topics::JOB_PERMISSION_ANSWER, &payload)
            .await?)
    }

    /// Create a pending job for the ticket and enqueue its snapshot. Fails
    /// with `EngineError::ActiveJobExists` while another job is live.
    pub async fn dispatch_ticket(&self, project_id: &str, ticket_id: &str) -> Result<Job> {
        let project_id = project_id.to_string();
        let ticket_id = ticket_id.to_string();
        let base = self.default_sandbox_base.clone();
        let (job, spec) = self
            .db
            .call(move |db| {
                let job = db.create_job(&project_id, &ticket_id)?;
                let spec = db.job_spec(&job.id, &base)?;
                Ok((job, spec))
            })
            .await?;
        self.enqueue_process(&spec).await?;
        Ok(job)
    }

    /// Reset a failed or cancelled job and enqueue it again.
    pub async fn retry_job(&self, job_id: &str) -> Result<Job> {
        let id = job_id.to_string();
        let base = self.default_sandbox_base.clone();
        let (job, spec) = self
            .db
            .call(move |db| {
                let job = db.reset_for_retry(&id)?;
                let spec = db.job_spec(&id, &base)?;
                Ok((job, spec))
            })
            .await?;
        self.enqueue_process(&spec).await?;
        info!(job_id = %job.id, "Job queued for retry");
        Ok(job)
    }

    /// Reconcile job rows with the queue before any subscription starts.
    pub async fn recover_orphaned_jobs(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        self.queue
            .sweep_exhausted()
            .await
            .context("Failed to sweep expired queue messages")?;

        let running = self
            .db
            .call(|db| db.jobs_with_status(JobStatus::Running))
            .await?;
        for job in running {
            if self.queue.has_in_flight(&job.id, None).await? {
                continue;
            }
            let id = job.id.clone();
            match self.db.call(move |db| db.release_job(&id)).await {
                Ok(_) => {
                    warn!(job_id = %job.id, worker_id = ?job.worker_id, "Released orphaned running job");
                    report.released += 1;
                }
                Err(e) => warn!(job_id = %job.id, error = %format!("{:#}", e), "Could not release orphaned job"),
            }
        }

        let pending = self
            .db
            .call(|db| db.jobs_with_status(JobStatus::Pending))
            .await?;
        for job in pending {
            if self
                .queue
                .has_in_flight(&job.id, Some(topics::JOB_PROCESS))
                .await?
            {
                continue;
            }
            let id = job.id.clone();
            let base = self.default_sandbox_base.clone();
            let spec = match self.db.call(move |db| db.job_spec(&id, &base)).await {
                Ok(spec) => spec,
                Err(e) => {
                    warn!(job_id = %job.id, error = %format!("{:#}", e), "Cannot rebuild job snapshot");
                    continue;
                }
            };
            self.enqueue_process(&spec).await?;
            report.requeued += 1;
        }

        info!(
            released = report.released,
            requeued = report.requeued,
            "Startup recovery finished"
        );
        Ok(report)
    }
}
