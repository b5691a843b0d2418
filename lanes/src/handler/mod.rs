/// Cron job execution under a per-job lock.
pub mod cron_job;
/// Multi-phase run workflow.
pub mod run_phase;
/// Fan-out of scheduled suites into runs.
pub mod scheduled_suite;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::lock::LockRefresher;
use crate::message::{Phase, QueueMessage, UnknownPhase};

pub use cron_job::CronJobHandler;
pub use run_phase::{PhaseExecutor, PhaseOutcome, PhaseRefresher, RunPhaseHandler, RunPhaseResult};
pub use scheduled_suite::ScheduledSuiteHandler;

/// Failures a handler reports to the worker.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    UnknownPhase(#[from] UnknownPhase),
    #[error("run {run_id} is locked by another worker")]
    RunLocked { run_id: i64 },
    #[error("phase {phase} of run {run_id} failed: {cause:#}")]
    Phase {
        run_id: i64,
        phase: Phase,
        cause: anyhow::Error,
    },
    #[error("failed to dispatch follow-up message: {cause:#}")]
    Dispatch { cause: anyhow::Error },
    #[error("infrastructure error: {cause:#}")]
    Infrastructure { cause: anyhow::Error },
    #[error("no handler for message type {kind}")]
    Unsupported { kind: String },
}

impl HandlerError {
    /// Whether re-delivering the same message can succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            HandlerError::UnknownPhase(_) | HandlerError::Unsupported { .. }
        )
    }

    pub fn infrastructure(cause: impl Into<anyhow::Error>) -> Self {
        HandlerError::Infrastructure {
            cause: cause.into(),
        }
    }

    pub fn dispatch(cause: impl Into<anyhow::Error>) -> Self {
        HandlerError::Dispatch {
            cause: cause.into(),
        }
    }
}

/// What a handler did with a message it accepted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandleOutcome {
    Handled,
    /// Nothing to do; the message is acknowledged anyway.
    Skipped { reason: String },
}

impl HandleOutcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        HandleOutcome::Skipped {
            reason: reason.into(),
        }
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Message type this handler accepts, as returned by [`QueueMessage::kind`].
    fn handles(&self) -> &'static str;

    async fn handle(
        &self,
        message: &QueueMessage,
        refresher: Option<&dyn LockRefresher>,
    ) -> Result<HandleOutcome, HandlerError>;
}

/// Routes messages to handlers by message type.
#[derive(Clone, Default)]
pub struct MessageRouter {
    handlers: HashMap<&'static str, Arc<dyn MessageHandler>>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same type.
    pub fn with_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers.insert(handler.handles(), handler);
        self
    }

    pub async fn route(
        &self,
        message: &QueueMessage,
        refresher: Option<&dyn LockRefresher>,
    ) -> Result<HandleOutcome, HandlerError> {
        match self.handlers.get(message.kind()) {
            Some(handler) => handler.handle(message, refresher).await,
            None => Err(HandlerError::Unsupported {
                kind: message.kind().to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::CronJobMessage;

    #[test]
    fn test_retryable_classification() {
        assert!(!HandlerError::from(UnknownPhase("deploy".into())).is_retryable());
        assert!(!HandlerError::Unsupported { kind: "x".into() }.is_retryable());
        assert!(HandlerError::RunLocked { run_id: 1 }.is_retryable());
        assert!(HandlerError::infrastructure(anyhow::anyhow!("db down")).is_retryable());
    }

    #[test]
    fn test_error_display_includes_cause() {
        let error = HandlerError::Phase {
            run_id: 3,
            phase: Phase::Execute,
            cause: anyhow::anyhow!("container exited"),
        };
        assert_eq!(
            error.to_string(),
            "phase execute of run 3 failed: container exited"
        );
    }

    #[tokio::test]
    async fn test_router_rejects_unregistered_type() {
        let router = MessageRouter::new();
        let result = router
            .route(&CronJobMessage { job_id: 1 }.into(), None)
            .await;
        assert!(matches!(result, Err(HandlerError::Unsupported { .. })));
    }
}
