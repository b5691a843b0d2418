use std::sync::Arc;

use lanes::*;

use crate::{InMemoryRunRepository, ScriptedExecutor};

/// In-memory transport plus run collaborators, wired the way a worker
/// process wires them.
#[derive(Clone)]
pub struct TestHarness {
    pub store: InMemoryQueueStore,
    pub lock_service: InMemoryLockService,
    pub transport: PartitionTransport,
    pub runs: InMemoryRunRepository,
    pub executor: ScriptedExecutor,
    pub run_locks: RunLockConfig,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(TransportConfig::default())
    }

    pub fn with_config(config: TransportConfig) -> Self {
        let store = InMemoryQueueStore::new();
        let lock_service = InMemoryLockService::new();
        let transport = PartitionTransport::new(
            Arc::new(store.clone()),
            Arc::new(lock_service.clone()),
            Arc::new(JsonSerializer),
            config,
        );
        Self {
            store,
            lock_service,
            transport,
            runs: InMemoryRunRepository::new(),
            executor: ScriptedExecutor::new(),
            run_locks: RunLockConfig::default(),
        }
    }

    /// Another transport over the same store and locks, as a second process would have.
    pub fn second_transport(&self) -> PartitionTransport {
        PartitionTransport::new(
            Arc::new(self.store.clone()),
            Arc::new(self.lock_service.clone()),
            Arc::new(JsonSerializer),
            self.transport.config().clone(),
        )
    }

    pub fn run_locks(&self) -> RunLocks {
        RunLocks::new(Arc::new(self.lock_service.clone()), self.run_locks.clone())
    }

    pub fn bus(&self) -> Arc<dyn MessageBus> {
        Arc::new(self.transport.bus())
    }

    /// Run phase handler dispatching follow-ups through this harness's transport.
    pub fn run_phase_handler(&self) -> RunPhaseHandler {
        self.run_phase_handler_with_bus(self.bus())
    }

    pub fn run_phase_handler_with_bus(&self, bus: Arc<dyn MessageBus>) -> RunPhaseHandler {
        RunPhaseHandler::new(
            Arc::new(self.runs.clone()),
            Arc::new(self.executor.clone()),
            self.run_locks(),
            bus,
        )
    }

    pub fn router(&self) -> MessageRouter {
        MessageRouter::new().with_handler(Arc::new(self.run_phase_handler()))
    }

    pub fn worker(&self, retry: RetryPolicy) -> Worker {
        Worker::new(
            self.transport.clone(),
            Arc::new(self.router()),
            retry,
            WorkerConfig::new("test-worker"),
        )
    }

    pub async fn enqueue_phase(
        &self,
        run_id: i64,
        environment_id: i64,
        phase: Phase,
    ) -> anyhow::Result<DispatchReceipt> {
        self.transport
            .bus()
            .dispatch_message(RunPhaseMessage::new(run_id, environment_id, phase).into())
            .await
    }

    /// Ids of messages currently stored in `queue_name`.
    pub fn stored_messages(&self, queue_name: &str) -> Vec<MessageId> {
        self.store
            .queue_names()
            .into_iter()
            .filter(|(_, name)| name == queue_name)
            .map(|(id, _)| id)
            .collect()
    }

    /// Drive the worker until a poll yields no claims, returning every outcome.
    pub async fn drain(&self, worker: &Worker, max_polls: usize) -> anyhow::Result<Vec<ProcessOutcome>> {
        let mut outcomes = Vec::new();
        for _ in 0..max_polls {
            let batch = worker.run_once().await?;
            if batch.is_empty() {
                break;
            }
            outcomes.extend(batch);
        }
        Ok(outcomes)
    }
}
