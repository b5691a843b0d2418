use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;

use crate::domain::{CronJob, CronJobRepository, CronJobRunner, CronJobStatus};
use crate::handler::{HandleOutcome, HandlerError, MessageHandler};
use crate::lock::{LockRefresher, LockService};
use crate::message::QueueMessage;

/// Runs a configured cron job, at most one execution per job at a time.
///
/// Command failures are recorded on the job and not retried; the schedule
/// fires the job again on its next tick.
pub struct CronJobHandler {
    jobs: Arc<dyn CronJobRepository>,
    runner: Arc<dyn CronJobRunner>,
    locks: Arc<dyn LockService>,
    lock_ttl: Duration,
}

impl CronJobHandler {
    pub const LOCK_PREFIX: &'static str = "cron_job_";

    pub fn new(
        jobs: Arc<dyn CronJobRepository>,
        runner: Arc<dyn CronJobRunner>,
        locks: Arc<dyn LockService>,
    ) -> Self {
        Self {
            jobs,
            runner,
            locks,
            lock_ttl: Duration::hours(1),
        }
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn lock_key(job_id: i64) -> String {
        format!("{}{}", Self::LOCK_PREFIX, job_id)
    }

    pub async fn handle_job(&self, job_id: i64) -> Result<HandleOutcome, HandlerError> {
        let job = match self.jobs.find(job_id).await.map_err(HandlerError::infrastructure)? {
            Some(job) if job.is_active => job,
            Some(_) => {
                tracing::info!(job_id, "cron job inactive, skipping");
                return Ok(HandleOutcome::skipped("cron job inactive"));
            }
            None => {
                tracing::warn!(job_id, "cron job not found, dropping message");
                return Ok(HandleOutcome::skipped("cron job not found"));
            }
        };

        let Some(token) = self
            .locks
            .try_acquire(&Self::lock_key(job.id), self.lock_ttl)
            .await
            .map_err(HandlerError::infrastructure)?
        else {
            tracing::warn!(job_id, name = %job.name, "cron job still running, marking locked");
            self.jobs
                .record_status(job.id, CronJobStatus::Locked, None)
                .await
                .map_err(HandlerError::infrastructure)?;
            return Ok(HandleOutcome::skipped("cron job locked"));
        };

        let result = self.run_locked(&job).await;

        if let Err(error) = self.locks.release(&token).await {
            tracing::warn!(job_id, error = ?error, "failed to release cron job lock");
        }
        result
    }

    async fn run_locked(&self, job: &CronJob) -> Result<HandleOutcome, HandlerError> {
        self.jobs
            .record_status(job.id, CronJobStatus::Running, None)
            .await
            .map_err(HandlerError::infrastructure)?;

        let (status, output) = match self.runner.run(job).await {
            Ok(run) if run.succeeded() => (CronJobStatus::Success, run.output),
            Ok(run) => {
                tracing::warn!(job_id = job.id, exit_code = run.exit_code, "cron job exited with failure");
                (CronJobStatus::Failed, run.output)
            }
            Err(error) => {
                tracing::error!(job_id = job.id, error = ?error, "cron job could not be run");
                (CronJobStatus::Failed, format!("{error:#}"))
            }
        };

        self.jobs
            .record_status(job.id, status, Some(output))
            .await
            .map_err(HandlerError::infrastructure)?;
        tracing::info!(job_id = job.id, status = ?status, "cron job finished");
        Ok(HandleOutcome::Handled)
    }
}

#[async_trait]
impl MessageHandler for CronJobHandler {
    fn handles(&self) -> &'static str {
        QueueMessage::CRON_JOB
    }

    async fn handle(
        &self,
        message: &QueueMessage,
        _refresher: Option<&dyn LockRefresher>,
    ) -> Result<HandleOutcome, HandlerError> {
        match message {
            QueueMessage::CronJob(message) => self.handle_job(message.job_id).await,
            other => Err(HandlerError::Unsupported {
                kind: other.kind().to_string(),
            }),
        }
    }
}
