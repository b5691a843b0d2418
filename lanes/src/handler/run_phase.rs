use std::sync::Arc;

use async_trait::async_trait;

use crate::bus::MessageBus;
use crate::domain::{Run, RunRepository};
use crate::handler::{HandleOutcome, HandlerError, MessageHandler};
use crate::lock::{LockRefresher, LockToken, RunLocks};
use crate::message::{Phase, QueueMessage, RunPhaseMessage};

/// Result reported by a phase executor that ran to completion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PhaseOutcome {
    Succeeded,
    /// The phase ran but the run failed in a way the workflow handles by
    /// moving on (e.g. a failing test suite still gets reported).
    Failed { reason: String },
}

/// Performs the actual work of a phase.
///
/// Long-running executors should call [`LockRefresher::refresh`] and
/// [`LockRefresher::heartbeat`] periodically; the refresher covers the run
/// lock and, when available, the partition claim.
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    async fn execute(
        &self,
        phase: Phase,
        run: &Run,
        refresher: &dyn LockRefresher,
    ) -> anyhow::Result<PhaseOutcome>;
}

/// What [`RunPhaseHandler::handle_phase`] did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunPhaseResult {
    /// The run no longer exists; the message is dropped.
    RunMissing,
    /// The run was cancelled or failed; execution was skipped.
    Skipped { next: Option<Phase> },
    Executed {
        outcome: PhaseOutcome,
        next: Option<Phase>,
    },
}

/// Drives one phase of a run per message and enqueues the next one.
pub struct RunPhaseHandler {
    runs: Arc<dyn RunRepository>,
    executor: Arc<dyn PhaseExecutor>,
    locks: RunLocks,
    bus: Arc<dyn MessageBus>,
}

impl RunPhaseHandler {
    pub fn new(
        runs: Arc<dyn RunRepository>,
        executor: Arc<dyn PhaseExecutor>,
        locks: RunLocks,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self {
            runs,
            executor,
            locks,
            bus,
        }
    }

    pub async fn handle_phase(
        &self,
        message: &RunPhaseMessage,
        refresher: Option<&dyn LockRefresher>,
    ) -> Result<RunPhaseResult, HandlerError> {
        let phase = message.phase()?;

        let Some(run) = self
            .runs
            .find(message.run_id)
            .await
            .map_err(HandlerError::infrastructure)?
        else {
            tracing::warn!(run_id = message.run_id, phase = %phase, "run not found, dropping message");
            return Ok(RunPhaseResult::RunMissing);
        };

        if refresher.is_none() {
            tracing::debug!(
                run_id = run.id,
                phase = %phase,
                "no receiver refresher; heartbeat and partition lock refresh degraded"
            );
        }

        let Some(token) = self
            .locks
            .try_lock(run.id, phase)
            .await
            .map_err(HandlerError::infrastructure)?
        else {
            tracing::info!(run_id = run.id, phase = %phase, "run locked by another worker");
            return Err(HandlerError::RunLocked { run_id: run.id });
        };

        let result = self.run_locked(message, phase, &run, &token, refresher).await;

        if let Err(error) = self.locks.release(&token).await {
            tracing::warn!(run_id = run.id, error = ?error, "failed to release run lock");
        }
        result
    }

    async fn run_locked(
        &self,
        message: &RunPhaseMessage,
        phase: Phase,
        run: &Run,
        token: &LockToken,
        partition: Option<&dyn LockRefresher>,
    ) -> Result<RunPhaseResult, HandlerError> {
        if run.status.is_halted() && matches!(phase, Phase::Prepare | Phase::Execute) {
            tracing::info!(
                run_id = run.id,
                phase = %phase,
                status = ?run.status,
                "run halted, skipping to report"
            );
            self.dispatch_next(message, Phase::Report).await?;
            return Ok(RunPhaseResult::Skipped {
                next: Some(Phase::Report),
            });
        }

        let refresher = PhaseRefresher {
            locks: &self.locks,
            token,
            partition,
        };
        tracing::info!(run_id = run.id, phase = %phase, "executing phase");
        let outcome = self
            .executor
            .execute(phase, run, &refresher)
            .await
            .map_err(|cause| {
                tracing::error!(run_id = run.id, phase = %phase, error = ?cause, "phase failed");
                HandlerError::Phase {
                    run_id: run.id,
                    phase,
                    cause,
                }
            })?;

        let next = match &outcome {
            PhaseOutcome::Succeeded => phase.next(),
            PhaseOutcome::Failed { reason } => {
                tracing::warn!(run_id = run.id, phase = %phase, reason = %reason, "phase reported failure");
                phase.next_after_failure()
            }
        };
        if let Some(next) = next {
            self.dispatch_next(message, next).await?;
        } else {
            tracing::info!(run_id = run.id, "run pipeline finished");
        }
        Ok(RunPhaseResult::Executed { outcome, next })
    }

    async fn dispatch_next(
        &self,
        message: &RunPhaseMessage,
        next: Phase,
    ) -> Result<(), HandlerError> {
        let receipt = self
            .bus
            .dispatch_message(
                RunPhaseMessage::new(message.run_id, message.environment_id, next).into(),
            )
            .await
            .map_err(HandlerError::dispatch)?;
        tracing::debug!(
            run_id = message.run_id,
            next = %next,
            queue_name = %receipt.queue_name,
            message_id = %receipt.message_id,
            "next phase dispatched"
        );
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for RunPhaseHandler {
    fn handles(&self) -> &'static str {
        QueueMessage::RUN_PHASE
    }

    async fn handle(
        &self,
        message: &QueueMessage,
        refresher: Option<&dyn LockRefresher>,
    ) -> Result<HandleOutcome, HandlerError> {
        let QueueMessage::RunPhase(message) = message else {
            return Err(HandlerError::Unsupported {
                kind: message.kind().to_string(),
            });
        };
        match self.handle_phase(message, refresher).await? {
            RunPhaseResult::RunMissing => Ok(HandleOutcome::skipped("run not found")),
            RunPhaseResult::Skipped { .. } => Ok(HandleOutcome::skipped("run halted")),
            RunPhaseResult::Executed { .. } => Ok(HandleOutcome::Handled),
        }
    }
}

/// Refresher handed to executors: renews the run lock, then delegates to
/// the receiver's claim refresher when there is one.
pub struct PhaseRefresher<'a> {
    locks: &'a RunLocks,
    token: &'a LockToken,
    partition: Option<&'a dyn LockRefresher>,
}

#[async_trait]
impl<'a> LockRefresher for PhaseRefresher<'a> {
    async fn refresh(&self) -> anyhow::Result<()> {
        if !self.locks.refresh(self.token).await? {
            anyhow::bail!("run lock {} lost", self.token.key);
        }
        if let Some(partition) = self.partition {
            partition.refresh().await?;
        }
        Ok(())
    }

    async fn heartbeat(&self) -> anyhow::Result<()> {
        match self.partition {
            Some(partition) => partition.heartbeat().await,
            None => Ok(()),
        }
    }
}
