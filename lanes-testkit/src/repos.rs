use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use lanes::*;
use parking_lot::Mutex;

#[derive(Clone, Default)]
pub struct InMemoryRunRepository {
    runs: Arc<Mutex<BTreeMap<i64, Run>>>,
    next_id: Arc<Mutex<i64>>,
    fail_finds: Arc<Mutex<bool>>,
}

impl InMemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a manual run with the given status and return it.
    pub fn insert(&self, run_id: i64, environment_id: i64, status: RunStatus) -> Run {
        let run = Run {
            id: run_id,
            environment_id,
            suite_id: None,
            status,
            trigger: RunTrigger::Manual,
            send_notifications: true,
        };
        self.runs.lock().insert(run_id, run.clone());
        let mut next = self.next_id.lock();
        *next = (*next).max(run_id);
        run
    }

    pub fn set_status(&self, run_id: i64, status: RunStatus) {
        if let Some(run) = self.runs.lock().get_mut(&run_id) {
            run.status = status;
        }
    }

    pub fn remove(&self, run_id: i64) {
        self.runs.lock().remove(&run_id);
    }

    pub fn all(&self) -> Vec<Run> {
        self.runs.lock().values().cloned().collect()
    }

    /// Make `find` return an error until reset.
    pub fn set_fail_finds(&self, fail: bool) {
        *self.fail_finds.lock() = fail;
    }
}

#[async_trait]
impl RunRepository for InMemoryRunRepository {
    async fn find(&self, run_id: i64) -> anyhow::Result<Option<Run>> {
        if *self.fail_finds.lock() {
            anyhow::bail!("run repository unavailable");
        }
        Ok(self.runs.lock().get(&run_id).cloned())
    }

    async fn has_run_in_progress(&self, environment_id: i64) -> anyhow::Result<bool> {
        Ok(self
            .runs
            .lock()
            .values()
            .any(|run| run.environment_id == environment_id && run.status.is_in_progress()))
    }

    async fn create(
        &self,
        environment_id: i64,
        suite_id: Option<i64>,
        trigger: RunTrigger,
    ) -> anyhow::Result<Run> {
        let id = {
            let mut next = self.next_id.lock();
            *next += 1;
            *next
        };
        let run = Run {
            id,
            environment_id,
            suite_id,
            status: RunStatus::Pending,
            trigger,
            send_notifications: true,
        };
        self.runs.lock().insert(id, run.clone());
        Ok(run)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryEnvironmentRepository {
    environments: Arc<Mutex<Vec<Environment>>>,
}

impl InMemoryEnvironmentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: i64, is_active: bool) {
        self.environments.lock().push(Environment {
            id,
            name: format!("env-{id}"),
            is_active,
        });
    }
}

#[async_trait]
impl EnvironmentRepository for InMemoryEnvironmentRepository {
    async fn find_active(&self) -> anyhow::Result<Vec<Environment>> {
        Ok(self
            .environments
            .lock()
            .iter()
            .filter(|environment| environment.is_active)
            .cloned()
            .collect())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusRecord {
    pub job_id: i64,
    pub status: CronJobStatus,
    pub output: Option<String>,
}

#[derive(Clone, Default)]
pub struct InMemoryCronJobRepository {
    jobs: Arc<Mutex<BTreeMap<i64, CronJob>>>,
    statuses: Arc<Mutex<Vec<StatusRecord>>>,
}

impl InMemoryCronJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: i64, cron_expression: Option<&str>, is_active: bool) {
        self.jobs.lock().insert(
            id,
            CronJob {
                id,
                name: format!("job-{id}"),
                command: format!("app:job-{id}"),
                cron_expression: cron_expression.map(str::to_string),
                is_active,
            },
        );
    }

    pub fn statuses(&self) -> Vec<StatusRecord> {
        self.statuses.lock().clone()
    }
}

#[async_trait]
impl CronJobRepository for InMemoryCronJobRepository {
    async fn find(&self, job_id: i64) -> anyhow::Result<Option<CronJob>> {
        Ok(self.jobs.lock().get(&job_id).cloned())
    }

    async fn find_active(&self) -> anyhow::Result<Vec<CronJob>> {
        Ok(self
            .jobs
            .lock()
            .values()
            .filter(|job| job.is_active)
            .cloned()
            .collect())
    }

    async fn record_status(
        &self,
        job_id: i64,
        status: CronJobStatus,
        output: Option<String>,
    ) -> anyhow::Result<()> {
        self.statuses.lock().push(StatusRecord {
            job_id,
            status,
            output,
        });
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemorySuiteRepository {
    suites: Arc<Mutex<BTreeMap<i64, Suite>>>,
}

impl InMemorySuiteRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: i64, cron_expression: Option<&str>, is_active: bool) {
        self.suites.lock().insert(
            id,
            Suite {
                id,
                name: format!("suite-{id}"),
                cron_expression: cron_expression.map(str::to_string),
                is_active,
            },
        );
    }
}

#[async_trait]
impl SuiteRepository for InMemorySuiteRepository {
    async fn find(&self, suite_id: i64) -> anyhow::Result<Option<Suite>> {
        Ok(self.suites.lock().get(&suite_id).cloned())
    }

    async fn find_scheduled(&self) -> anyhow::Result<Vec<Suite>> {
        Ok(self
            .suites
            .lock()
            .values()
            .filter(|suite| suite.is_active)
            .cloned()
            .collect())
    }
}
