use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use lanes::*;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Scripted behaviour of one phase.
#[derive(Clone, Debug)]
pub enum PhaseScript {
    Succeed,
    /// Return `PhaseOutcome::Failed` with this reason.
    Fail(String),
    /// Return an error.
    Error(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionRecord {
    pub run_id: i64,
    pub phase: Phase,
    /// Results of calling refresh and heartbeat, when the executor exercised them.
    pub refresh_ok: Option<bool>,
    pub heartbeat_ok: Option<bool>,
}

/// Phase executor that records calls and follows a per-phase script.
#[derive(Clone, Default)]
pub struct ScriptedExecutor {
    scripts: Arc<Mutex<HashMap<Phase, PhaseScript>>>,
    records: Arc<Mutex<Vec<ExecutionRecord>>>,
    exercise_refresher: Arc<Mutex<bool>>,
    gate: Arc<Mutex<Option<Arc<Notify>>>>,
    entered: Arc<Notify>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, phase: Phase, script: PhaseScript) {
        self.scripts.lock().insert(phase, script);
    }

    /// Call `refresh` and `heartbeat` on every execution.
    pub fn exercise_refresher(&self) {
        *self.exercise_refresher.lock() = true;
    }

    /// Block executions until the returned handle is notified.
    pub fn gate(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock() = Some(gate.clone());
        gate
    }

    /// Wait until an execution has started.
    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    pub fn records(&self) -> Vec<ExecutionRecord> {
        self.records.lock().clone()
    }

    pub fn phases(&self) -> Vec<Phase> {
        self.records.lock().iter().map(|record| record.phase).collect()
    }

    pub fn assert_execution_count_eq(&self, expected: usize) {
        let actual = self.records.lock().len();
        assert_eq!(actual, expected, "Expected {expected} executions, got {actual}");
    }
}

#[async_trait]
impl PhaseExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        phase: Phase,
        run: &Run,
        refresher: &dyn LockRefresher,
    ) -> anyhow::Result<PhaseOutcome> {
        self.entered.notify_one();
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let exercise = *self.exercise_refresher.lock();
        let (refresh_ok, heartbeat_ok) = if exercise {
            (
                Some(refresher.refresh().await.is_ok()),
                Some(refresher.heartbeat().await.is_ok()),
            )
        } else {
            (None, None)
        };
        self.records.lock().push(ExecutionRecord {
            run_id: run.id,
            phase,
            refresh_ok,
            heartbeat_ok,
        });

        let script = self
            .scripts
            .lock()
            .get(&phase)
            .cloned()
            .unwrap_or(PhaseScript::Succeed);
        match script {
            PhaseScript::Succeed => Ok(PhaseOutcome::Succeeded),
            PhaseScript::Fail(reason) => Ok(PhaseOutcome::Failed { reason }),
            PhaseScript::Error(message) => Err(anyhow::anyhow!(message)),
        }
    }
}

/// Bus that records envelopes instead of storing them.
#[derive(Clone, Default)]
pub struct RecordingBus {
    envelopes: Arc<Mutex<Vec<Envelope>>>,
    fail: Arc<Mutex<bool>>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        *self.fail.lock() = fail;
    }

    pub fn messages(&self) -> Vec<QueueMessage> {
        self.envelopes
            .lock()
            .iter()
            .map(|envelope| envelope.message().clone())
            .collect()
    }

    pub fn clear(&self) {
        self.envelopes.lock().clear();
    }
}

#[async_trait]
impl MessageBus for RecordingBus {
    async fn dispatch(&self, envelope: Envelope) -> anyhow::Result<DispatchReceipt> {
        if *self.fail.lock() {
            anyhow::bail!("bus unavailable");
        }
        let mut envelopes = self.envelopes.lock();
        envelopes.push(envelope);
        Ok(DispatchReceipt {
            message_id: MessageId(envelopes.len() as i64),
            queue_name: "recorded".to_string(),
        })
    }
}

/// Cron runner returning a fixed result per job and recording invocations.
#[derive(Clone, Default)]
pub struct ScriptedCronRunner {
    results: Arc<Mutex<HashMap<i64, Result<CronRunOutput, String>>>>,
    runs: Arc<Mutex<Vec<i64>>>,
}

impl ScriptedCronRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_result(&self, job_id: i64, result: Result<CronRunOutput, String>) {
        self.results.lock().insert(job_id, result);
    }

    pub fn runs(&self) -> Vec<i64> {
        self.runs.lock().clone()
    }
}

#[async_trait]
impl CronJobRunner for ScriptedCronRunner {
    async fn run(&self, job: &CronJob) -> anyhow::Result<CronRunOutput> {
        self.runs.lock().push(job.id);
        let result = self.results.lock().get(&job.id).cloned();
        match result {
            Some(Ok(output)) => Ok(output),
            Some(Err(message)) => Err(anyhow::anyhow!(message)),
            None => Ok(CronRunOutput {
                exit_code: 0,
                output: format!("{} done", job.command),
            }),
        }
    }
}
