use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::envelope::Stamp;
use crate::handler::{HandleOutcome, HandlerError, MessageRouter};
use crate::lock::LockRefresher;
use crate::receiver::{Claim, ClaimRefresher};
use crate::runtime::retry::{RetryDecision, RetryPolicy};
use crate::runtime::worker::WorkerConfig;
use crate::schedule::ScheduleRunner;
use crate::telemetry;
use crate::transport::PartitionTransport;

/// Token for signaling graceful shutdown to workers.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    /// Create a new shutdown token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check if cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// How a worker finished one claim.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProcessOutcome {
    Acked,
    Skipped { reason: String },
    Retried { attempt: u32, delay_ms: u64 },
    DeadLettered,
    /// The claim could not be settled. Its partition lock is left to expire
    /// and the row is left for stale redelivery.
    Abandoned,
}

impl ProcessOutcome {
    fn label(&self) -> &'static str {
        match self {
            ProcessOutcome::Acked | ProcessOutcome::Skipped { .. } => "acked",
            ProcessOutcome::Retried { .. } => "retried",
            ProcessOutcome::DeadLettered => "dead_lettered",
            ProcessOutcome::Abandoned => "abandoned",
        }
    }
}

/// Polls a transport and routes each claim to its handler.
pub struct Worker {
    transport: PartitionTransport,
    router: Arc<MessageRouter>,
    retry: RetryPolicy,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        transport: PartitionTransport,
        router: Arc<MessageRouter>,
        retry: RetryPolicy,
        config: WorkerConfig,
    ) -> Self {
        Self {
            transport,
            router,
            retry,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Poll once and process every claim concurrently. Claims come from
    /// distinct partitions, so this never breaks per-partition order.
    pub async fn run_once(&self) -> anyhow::Result<Vec<ProcessOutcome>> {
        let claims = self.transport.poll().await?;
        if !claims.is_empty() {
            tracing::debug!(worker_id = %self.config.worker_id, claims = claims.len(), "claims received");
        }
        Ok(join_all(claims.into_iter().map(|claim| self.process(claim))).await)
    }

    pub async fn process(&self, claim: Claim) -> ProcessOutcome {
        let started = Instant::now();
        let kind = claim.envelope.message().kind();
        let refresher = self.transport.refresher(&claim.ticket);

        let result = telemetry::instrument_handle(
            claim.ticket.message_id.to_string(),
            kind,
            self.handle_with_renewal(&claim, &refresher),
        )
        .await;

        let outcome = match result {
            Ok(HandleOutcome::Handled) => self.ack(&claim, ProcessOutcome::Acked).await,
            Ok(HandleOutcome::Skipped { reason }) => {
                tracing::info!(message_id = %claim.ticket.message_id, reason = %reason, "message skipped");
                self.ack(&claim, ProcessOutcome::Skipped { reason }).await
            }
            Err(error) if error.is_retryable() => self.retry(&claim, &error).await,
            Err(error) => {
                tracing::error!(message_id = %claim.ticket.message_id, error = %error, "fatal handler error");
                self.dead_letter(&claim).await
            }
        };

        telemetry::record_message_finished(kind, outcome.label(), started.elapsed().as_secs_f64());
        outcome
    }

    /// Run the handler while periodically refreshing the claim.
    async fn handle_with_renewal(
        &self,
        claim: &Claim,
        refresher: &ClaimRefresher,
    ) -> Result<HandleOutcome, HandlerError> {
        let handle = self
            .router
            .route(claim.envelope.message(), Some(refresher as &dyn LockRefresher));
        tokio::pin!(handle);

        let period = tokio::time::Duration::from_millis(self.config.renew_interval_ms.max(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                result = &mut handle => return result,
                _ = ticker.tick() => {
                    if let Err(error) = refresher.refresh().await {
                        tracing::warn!(message_id = %claim.ticket.message_id, error = ?error, "claim refresh failed");
                    }
                    if let Err(error) = refresher.heartbeat().await {
                        tracing::warn!(message_id = %claim.ticket.message_id, error = ?error, "claim heartbeat failed");
                    }
                }
            }
        }
    }

    async fn ack(&self, claim: &Claim, outcome: ProcessOutcome) -> ProcessOutcome {
        match self.transport.ack(&claim.ticket).await {
            Ok(()) => outcome,
            Err(error) => {
                tracing::error!(message_id = %claim.ticket.message_id, error = ?error, "ack failed");
                ProcessOutcome::Abandoned
            }
        }
    }

    async fn retry(&self, claim: &Claim, error: &HandlerError) -> ProcessOutcome {
        match self.retry.decide(claim.envelope.redelivery_attempt()) {
            RetryDecision::Retry { attempt, delay_ms } => {
                tracing::warn!(
                    message_id = %claim.ticket.message_id,
                    attempt,
                    delay_ms,
                    error = %error,
                    "handler failed, retrying"
                );
                let envelope = claim
                    .envelope
                    .clone()
                    .replace(Stamp::Partition {
                        queue_name: claim.ticket.queue_name.clone(),
                    })
                    .replace(Stamp::Redelivery { attempt })
                    .replace(Stamp::Delay { millis: delay_ms });
                self.resend_and_reject(claim, &envelope, ProcessOutcome::Retried { attempt, delay_ms })
                    .await
            }
            RetryDecision::DeadLetter => {
                tracing::error!(
                    message_id = %claim.ticket.message_id,
                    error = %error,
                    "retries exhausted"
                );
                self.dead_letter(claim).await
            }
        }
    }

    async fn dead_letter(&self, claim: &Claim) -> ProcessOutcome {
        let envelope = claim
            .envelope
            .clone()
            .replace(Stamp::Partition {
                queue_name: self.transport.config().failure_queue.clone(),
            })
            .replace(Stamp::Delay { millis: 0 });
        self.resend_and_reject(claim, &envelope, ProcessOutcome::DeadLettered)
            .await
    }

    async fn resend_and_reject(
        &self,
        claim: &Claim,
        envelope: &crate::envelope::Envelope,
        outcome: ProcessOutcome,
    ) -> ProcessOutcome {
        if let Err(error) = self.transport.send(envelope).await {
            tracing::error!(message_id = %claim.ticket.message_id, error = ?error, "re-send failed");
            return ProcessOutcome::Abandoned;
        }
        match self.transport.reject(&claim.ticket).await {
            Ok(()) => outcome,
            Err(error) => {
                tracing::error!(message_id = %claim.ticket.message_id, error = ?error, "reject failed");
                ProcessOutcome::Abandoned
            }
        }
    }

    /// Poll until shutdown, backing off while idle.
    pub async fn run(self: Arc<Self>, shutdown: ShutdownToken) {
        tracing::info!(worker_id = %self.config.worker_id, "worker started");
        let mut idle_polls = 0u32;
        while !shutdown.is_cancelled() {
            let delay = match self.run_once().await {
                Ok(outcomes) if outcomes.is_empty() => {
                    idle_polls = idle_polls.saturating_add(1);
                    Some(self.config.idle_delay(idle_polls))
                }
                Ok(_) => {
                    idle_polls = 0;
                    None
                }
                Err(error) => {
                    tracing::warn!(worker_id = %self.config.worker_id, error = ?error, "poll failed");
                    Some(std::time::Duration::from_millis(self.config.backoff_ms))
                }
            };
            if let Some(delay) = delay {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
        tracing::info!(worker_id = %self.config.worker_id, "worker shutting down");
    }
}

/// A set of workers plus an optional schedule runner sharing one shutdown token.
pub struct WorkerPool {
    shutdown: ShutdownToken,
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn every worker and the schedule runner onto the current runtime.
    pub fn spawn(workers: Vec<Worker>, schedule: Option<ScheduleRunner>) -> Self {
        let shutdown = ShutdownToken::new();
        let mut handles = Vec::with_capacity(workers.len() + 1);
        for worker in workers {
            let worker = Arc::new(worker);
            handles.push(tokio::spawn(worker.run(shutdown.clone())));
        }
        if let Some(runner) = schedule {
            let token = shutdown.clone();
            handles.push(tokio::spawn(async move { runner.run(token).await }));
        }
        Self {
            shutdown,
            handles: Mutex::new(handles),
        }
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    /// Signal shutdown and wait for every task to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(error) = handle.await {
                tracing::warn!(error = %error, "worker task ended abnormally");
            }
        }
    }
}
