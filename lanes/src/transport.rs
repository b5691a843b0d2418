use std::sync::Arc;

use crate::bus::{PartitionRoutingMiddleware, TransportBus};
use crate::config::{TransportConfig, TRANSPORT_SCHEME};
use crate::envelope::Envelope;
use crate::lock::{LockService, PartitionLocks};
use crate::message::MessageId;
use crate::receiver::{Claim, ClaimRefresher, ClaimTicket, PartitionReceiver};
use crate::sender::PartitionSender;
use crate::serializer::{JsonSerializer, Serializer};
use crate::store::{InMemoryQueueStore, QueueSnapshot, QueueStore};
use crate::telemetry;

/// Storage a factory builds transports on.
#[derive(Clone)]
pub enum StoreBackend {
    InMemory(InMemoryQueueStore),
    #[cfg(feature = "postgres")]
    Postgres(sqlx::PgPool),
}

impl StoreBackend {
    #[cfg_attr(not(feature = "postgres"), allow(unused_variables))]
    fn open(&self, config: &TransportConfig) -> anyhow::Result<Arc<dyn QueueStore>> {
        match self {
            StoreBackend::InMemory(store) => Ok(Arc::new(store.clone())),
            #[cfg(feature = "postgres")]
            StoreBackend::Postgres(pool) => Ok(Arc::new(
                crate::persistence::PostgresQueueStore::new(pool.clone(), &config.table_name)?,
            )),
        }
    }
}

/// Receiver and sender sharing one store, lock service and configuration.
#[derive(Clone)]
pub struct PartitionTransport {
    receiver: Arc<PartitionReceiver>,
    sender: PartitionSender,
    store: Arc<dyn QueueStore>,
    locks: PartitionLocks,
    config: TransportConfig,
}

impl PartitionTransport {
    pub fn new(
        store: Arc<dyn QueueStore>,
        lock_service: Arc<dyn LockService>,
        serializer: Arc<dyn Serializer>,
        config: TransportConfig,
    ) -> Self {
        let locks = PartitionLocks::new(lock_service, &config);
        let receiver = PartitionReceiver::new(
            store.clone(),
            locks.clone(),
            serializer.clone(),
            config.clone(),
        );
        let sender = PartitionSender::new(store.clone(), serializer, config.clone());
        Self {
            receiver: Arc::new(receiver),
            sender,
            store,
            locks,
            config,
        }
    }

    pub async fn poll(&self) -> anyhow::Result<Vec<Claim>> {
        self.receiver.poll().await
    }

    pub async fn ack(&self, ticket: &ClaimTicket) -> anyhow::Result<()> {
        self.receiver.ack(ticket).await
    }

    pub async fn reject(&self, ticket: &ClaimTicket) -> anyhow::Result<()> {
        self.receiver.reject(ticket).await
    }

    pub async fn abandon(&self, ticket: &ClaimTicket) {
        self.receiver.abandon(ticket).await
    }

    pub fn refresher(&self, ticket: &ClaimTicket) -> ClaimRefresher {
        self.receiver.refresher(ticket)
    }

    pub async fn send(&self, envelope: &Envelope) -> anyhow::Result<MessageId> {
        self.sender.send(envelope).await
    }

    /// Bus with partition routing in front of this transport's sender.
    pub fn bus(&self) -> TransportBus {
        TransportBus::new(self.sender.clone())
            .with_middleware(Arc::new(PartitionRoutingMiddleware::new(&self.config)))
    }

    pub fn locks(&self) -> &PartitionLocks {
        &self.locks
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub async fn snapshot(&self) -> anyhow::Result<QueueSnapshot> {
        let snapshot = self.store.snapshot().await?;
        telemetry::record_queue_depth(&snapshot);
        Ok(snapshot)
    }
}

/// Builds transports from `per-partition://` DSNs.
#[derive(Clone)]
pub struct TransportFactory {
    backend: StoreBackend,
    lock_service: Arc<dyn LockService>,
}

impl TransportFactory {
    pub fn new(backend: StoreBackend, lock_service: Arc<dyn LockService>) -> Self {
        Self {
            backend,
            lock_service,
        }
    }

    pub fn supports(dsn: &str) -> bool {
        dsn.strip_prefix(TRANSPORT_SCHEME)
            .is_some_and(|rest| rest.starts_with("://"))
    }

    pub fn create(&self, dsn: &str) -> anyhow::Result<PartitionTransport> {
        let config = TransportConfig::from_dsn(dsn)?;
        let store = self.backend.open(&config)?;
        tracing::info!(
            table_name = %config.table_name,
            queue_prefix = %config.queue_prefix,
            "partition transport created"
        );
        Ok(PartitionTransport::new(
            store,
            self.lock_service.clone(),
            Arc::new(JsonSerializer),
            config,
        ))
    }
}
