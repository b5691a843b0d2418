//! Entities and repositories the handlers consume. Storage of these lives
//! outside this crate; only the shapes needed for routing and locking are
//! modelled here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// The run will not execute any further; only reporting remains.
    pub fn is_halted(&self) -> bool {
        matches!(self, RunStatus::Failed | RunStatus::Cancelled)
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(self, RunStatus::Pending | RunStatus::Running)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Manual,
    Scheduler,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub environment_id: i64,
    pub suite_id: Option<i64>,
    pub status: RunStatus,
    pub trigger: RunTrigger,
    pub send_notifications: bool,
}

#[async_trait]
pub trait RunRepository: Send + Sync {
    async fn find(&self, run_id: i64) -> anyhow::Result<Option<Run>>;

    /// Whether the environment has a pending or running run.
    async fn has_run_in_progress(&self, environment_id: i64) -> anyhow::Result<bool>;

    async fn create(
        &self,
        environment_id: i64,
        suite_id: Option<i64>,
        trigger: RunTrigger,
    ) -> anyhow::Result<Run>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub id: i64,
    pub name: String,
    pub is_active: bool,
}

#[async_trait]
pub trait EnvironmentRepository: Send + Sync {
    async fn find_active(&self) -> anyhow::Result<Vec<Environment>>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronJob {
    pub id: i64,
    pub name: String,
    pub command: String,
    pub cron_expression: Option<String>,
    pub is_active: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CronJobStatus {
    Running,
    Success,
    Failed,
    /// Skipped because a previous execution still holds the job lock.
    Locked,
}

#[async_trait]
pub trait CronJobRepository: Send + Sync {
    async fn find(&self, job_id: i64) -> anyhow::Result<Option<CronJob>>;

    async fn find_active(&self) -> anyhow::Result<Vec<CronJob>>;

    async fn record_status(
        &self,
        job_id: i64,
        status: CronJobStatus,
        output: Option<String>,
    ) -> anyhow::Result<()>;
}

/// Captured result of running a cron job command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CronRunOutput {
    pub exit_code: i32,
    pub output: String,
}

impl CronRunOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait CronJobRunner: Send + Sync {
    async fn run(&self, job: &CronJob) -> anyhow::Result<CronRunOutput>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suite {
    pub id: i64,
    pub name: String,
    pub cron_expression: Option<String>,
    pub is_active: bool,
}

#[async_trait]
pub trait SuiteRepository: Send + Sync {
    async fn find(&self, suite_id: i64) -> anyhow::Result<Option<Suite>>;

    /// Active suites, with or without a cron expression.
    async fn find_scheduled(&self) -> anyhow::Result<Vec<Suite>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_halted_statuses() {
        assert!(RunStatus::Cancelled.is_halted());
        assert!(RunStatus::Failed.is_halted());
        assert!(!RunStatus::Running.is_halted());
        assert!(RunStatus::Pending.is_in_progress());
        assert!(!RunStatus::Completed.is_in_progress());
    }
}
