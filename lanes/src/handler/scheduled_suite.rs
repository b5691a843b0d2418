use std::sync::Arc;

use async_trait::async_trait;

use crate::bus::MessageBus;
use crate::domain::{EnvironmentRepository, RunRepository, RunTrigger, SuiteRepository};
use crate::handler::{HandleOutcome, HandlerError, MessageHandler};
use crate::lock::LockRefresher;
use crate::message::{Phase, QueueMessage, RunPhaseMessage};

/// Starts a run of a scheduled suite on every active environment that is
/// not already busy.
pub struct ScheduledSuiteHandler {
    suites: Arc<dyn SuiteRepository>,
    environments: Arc<dyn EnvironmentRepository>,
    runs: Arc<dyn RunRepository>,
    bus: Arc<dyn MessageBus>,
}

impl ScheduledSuiteHandler {
    pub fn new(
        suites: Arc<dyn SuiteRepository>,
        environments: Arc<dyn EnvironmentRepository>,
        runs: Arc<dyn RunRepository>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self {
            suites,
            environments,
            runs,
            bus,
        }
    }

    /// Returns the ids of the runs that were created.
    pub async fn start_runs(&self, suite_id: i64) -> Result<Vec<i64>, HandlerError> {
        let suite = match self
            .suites
            .find(suite_id)
            .await
            .map_err(HandlerError::infrastructure)?
        {
            Some(suite) if suite.is_active => suite,
            _ => {
                tracing::info!(suite_id, "suite missing or inactive, skipping");
                return Ok(Vec::new());
            }
        };

        let environments = self
            .environments
            .find_active()
            .await
            .map_err(HandlerError::infrastructure)?;

        let mut started = Vec::new();
        for environment in environments {
            let busy = self
                .runs
                .has_run_in_progress(environment.id)
                .await
                .map_err(HandlerError::infrastructure)?;
            if busy {
                tracing::info!(
                    suite_id,
                    environment_id = environment.id,
                    "environment busy, not scheduling"
                );
                continue;
            }

            let run = self
                .runs
                .create(environment.id, Some(suite.id), RunTrigger::Scheduler)
                .await
                .map_err(HandlerError::infrastructure)?;
            self.bus
                .dispatch_message(RunPhaseMessage::new(run.id, environment.id, Phase::Prepare).into())
                .await
                .map_err(HandlerError::dispatch)?;
            tracing::info!(
                suite_id,
                suite = %suite.name,
                environment_id = environment.id,
                run_id = run.id,
                "scheduled run created"
            );
            started.push(run.id);
        }
        Ok(started)
    }
}

#[async_trait]
impl MessageHandler for ScheduledSuiteHandler {
    fn handles(&self) -> &'static str {
        QueueMessage::SCHEDULED_SUITE
    }

    async fn handle(
        &self,
        message: &QueueMessage,
        _refresher: Option<&dyn LockRefresher>,
    ) -> Result<HandleOutcome, HandlerError> {
        let QueueMessage::ScheduledSuite(message) = message else {
            return Err(HandlerError::Unsupported {
                kind: message.kind().to_string(),
            });
        };
        let started = self.start_runs(message.suite_id).await?;
        if started.is_empty() {
            Ok(HandleOutcome::skipped("no environment available"))
        } else {
            Ok(HandleOutcome::Handled)
        }
    }
}
