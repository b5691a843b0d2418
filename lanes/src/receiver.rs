use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::Instrument;

use crate::config::TransportConfig;
use crate::envelope::Envelope;
use crate::lock::{LockRefresher, LockToken, PartitionLocks};
use crate::message::MessageId;
use crate::serializer::{EncodedEnvelope, Serializer};
use crate::store::{Eligibility, PartitionFilter, QueueStore, StoredMessage};
use crate::telemetry;

/// Everything needed to settle a claim. Owned by the caller; the receiver
/// keeps no per-claim state.
#[derive(Clone, Debug)]
pub struct ClaimTicket {
    pub message_id: MessageId,
    pub queue_name: String,
    pub lock: LockToken,
}

/// A decoded message together with its ticket.
#[derive(Clone, Debug)]
pub struct Claim {
    pub envelope: Envelope,
    pub ticket: ClaimTicket,
    /// The row had been delivered before and went stale.
    pub redelivered: bool,
}

/// Claims at most one message per partition per poll, guarded by the
/// partition lock, so each partition is consumed strictly in order.
pub struct PartitionReceiver {
    store: Arc<dyn QueueStore>,
    locks: PartitionLocks,
    serializer: Arc<dyn Serializer>,
    config: TransportConfig,
    filter: PartitionFilter,
}

enum PartitionClaim {
    Claimed(StoredMessage, Envelope),
    Empty,
    Undecodable,
}

impl PartitionReceiver {
    pub fn new(
        store: Arc<dyn QueueStore>,
        locks: PartitionLocks,
        serializer: Arc<dyn Serializer>,
        config: TransportConfig,
    ) -> Self {
        let filter = config.partition_filter();
        Self {
            store,
            locks,
            serializer,
            config,
            filter,
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// One pass over all eligible partitions. Never waits on a lock; a
    /// partition whose lock is held elsewhere is skipped. Failures are
    /// contained to their partition.
    pub async fn poll(&self) -> anyhow::Result<Vec<Claim>> {
        let eligibility = Eligibility::at(Utc::now(), self.config.redeliver_after());
        let partitions = self
            .store
            .pending_partitions(&self.filter, &eligibility)
            .await?;

        let mut claims = Vec::new();
        for queue_name in partitions {
            let result = self
                .claim_partition(&queue_name, &eligibility)
                .instrument(telemetry::claim_span(&queue_name))
                .await;
            match result {
                Ok(Some(claim)) => claims.push(claim),
                Ok(None) => {}
                Err(error) => {
                    tracing::error!(queue_name = %queue_name, error = ?error, "failed to claim from partition");
                    telemetry::record_partition_skipped(&queue_name, "error");
                }
            }
        }
        Ok(claims)
    }

    async fn claim_partition(
        &self,
        queue_name: &str,
        eligibility: &Eligibility,
    ) -> anyhow::Result<Option<Claim>> {
        let Some(lock) = self.locks.try_lock(queue_name).await? else {
            telemetry::record_partition_skipped(queue_name, "locked");
            return Ok(None);
        };

        match self.claim_locked(queue_name, eligibility).await {
            Ok(PartitionClaim::Claimed(row, envelope)) => {
                let redelivered = row.delivered_at.is_some();
                if let Some(previous) = row.delivered_at {
                    tracing::warn!(
                        message_id = %row.id,
                        queue_name = %queue_name,
                        delivered_at = %previous,
                        "redelivering stuck message"
                    );
                }
                telemetry::record_message_claimed(queue_name, envelope.message().kind());
                Ok(Some(Claim {
                    envelope,
                    ticket: ClaimTicket {
                        message_id: row.id,
                        queue_name: queue_name.to_string(),
                        lock,
                    },
                    redelivered,
                }))
            }
            Ok(PartitionClaim::Empty) => {
                self.release_lock(&lock).await;
                telemetry::record_partition_skipped(queue_name, "empty");
                Ok(None)
            }
            Ok(PartitionClaim::Undecodable) => {
                self.release_lock(&lock).await;
                Ok(None)
            }
            Err(error) => {
                self.release_lock(&lock).await;
                Err(error)
            }
        }
    }

    async fn claim_locked(
        &self,
        queue_name: &str,
        eligibility: &Eligibility,
    ) -> anyhow::Result<PartitionClaim> {
        let Some(row) = self.store.claim_next(queue_name, eligibility).await? else {
            return Ok(PartitionClaim::Empty);
        };

        let decoded = EncodedEnvelope::from_stored(row.body.clone(), &row.headers)
            .and_then(|encoded| self.serializer.decode(&encoded));
        match decoded {
            Ok(envelope) => Ok(PartitionClaim::Claimed(row, envelope)),
            Err(error) => {
                tracing::error!(
                    message_id = %row.id,
                    queue_name = %queue_name,
                    failure_queue = %self.config.failure_queue,
                    error = ?error,
                    "undecodable message moved to failure partition"
                );
                self.store
                    .relocate(row.id, &self.config.failure_queue)
                    .await?;
                Ok(PartitionClaim::Undecodable)
            }
        }
    }

    async fn release_lock(&self, lock: &LockToken) {
        if let Err(error) = self.locks.release(lock).await {
            tracing::warn!(lock_key = %lock.key, error = ?error, "failed to release partition lock");
        }
    }

    /// Delete the message and release its partition lock.
    pub async fn ack(&self, ticket: &ClaimTicket) -> anyhow::Result<()> {
        self.settle(ticket, "ack").await
    }

    /// Same cleanup as [`Self::ack`]; retry and dead-lettering are decided by
    /// the caller before rejecting.
    pub async fn reject(&self, ticket: &ClaimTicket) -> anyhow::Result<()> {
        self.settle(ticket, "reject").await
    }

    /// Release the partition lock but keep the row. It stays delivered and is
    /// picked up again by stale redelivery.
    pub async fn abandon(&self, ticket: &ClaimTicket) {
        tracing::warn!(
            message_id = %ticket.message_id,
            queue_name = %ticket.queue_name,
            "abandoning claim"
        );
        self.release_lock(&ticket.lock).await;
    }

    /// A failed delete keeps the partition lock until its TTL runs out, so
    /// no later message of the partition is claimed ahead of this one.
    async fn settle(&self, ticket: &ClaimTicket, action: &'static str) -> anyhow::Result<()> {
        let deleted = match self.store.delete(ticket.message_id).await {
            Ok(deleted) => deleted,
            Err(error) => {
                tracing::error!(
                    message_id = %ticket.message_id,
                    lock_key = %ticket.lock.key,
                    action,
                    error = ?error,
                    "delete failed, partition lock left to expire"
                );
                return Err(error);
            }
        };
        self.release_lock(&ticket.lock).await;
        if !deleted {
            tracing::debug!(
                message_id = %ticket.message_id,
                action,
                "claim already settled"
            );
        }
        Ok(())
    }

    /// Refresh capability for the handler working on `ticket`.
    pub fn refresher(&self, ticket: &ClaimTicket) -> ClaimRefresher {
        ClaimRefresher {
            store: self.store.clone(),
            locks: self.locks.clone(),
            ticket: ticket.clone(),
        }
    }
}

/// Extends the partition lock and keeps `delivered_at` fresh for one claim.
pub struct ClaimRefresher {
    store: Arc<dyn QueueStore>,
    locks: PartitionLocks,
    ticket: ClaimTicket,
}

#[async_trait]
impl LockRefresher for ClaimRefresher {
    async fn refresh(&self) -> anyhow::Result<()> {
        if !self.locks.refresh(&self.ticket.lock).await? {
            anyhow::bail!("partition lock {} lost", self.ticket.lock.key);
        }
        Ok(())
    }

    async fn heartbeat(&self) -> anyhow::Result<()> {
        if !self.store.touch(self.ticket.message_id, Utc::now()).await? {
            anyhow::bail!("message {} no longer stored", self.ticket.message_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{InMemoryLockService, LockService};
    use crate::message::{CronJobMessage, QueueMessage};
    use crate::serializer::JsonSerializer;
    use crate::store::{InMemoryQueueStore, NewMessage};

    fn receiver(store: &InMemoryQueueStore, locks: &InMemoryLockService) -> PartitionReceiver {
        let config = TransportConfig::default();
        PartitionReceiver::new(
            Arc::new(store.clone()),
            PartitionLocks::new(Arc::new(locks.clone()), &config),
            Arc::new(JsonSerializer),
            config,
        )
    }

    #[tokio::test]
    async fn test_undecodable_row_is_moved_aside() {
        let store = InMemoryQueueStore::new();
        let locks = InMemoryLockService::new();
        let now = Utc::now();
        let id = store
            .insert(NewMessage {
                body: "garbage".into(),
                headers: "{}".into(),
                queue_name: "env_1".into(),
                created_at: now,
                available_at: now,
            })
            .await
            .unwrap();

        let receiver = receiver(&store, &locks);
        assert!(receiver.poll().await.unwrap().is_empty());
        assert_eq!(store.queue_names(), vec![(id, "failed".to_string())]);
        assert!(!locks.is_held("partition_processing_1").await.unwrap());
    }

    #[tokio::test]
    async fn test_heartbeat_fails_after_ack() {
        let store = InMemoryQueueStore::new();
        let locks = InMemoryLockService::new();
        let receiver = receiver(&store, &locks);
        let encoded = JsonSerializer
            .encode(&Envelope::new(CronJobMessage { job_id: 1 }))
            .unwrap();
        let now = Utc::now();
        store
            .insert(NewMessage {
                body: encoded.body.clone(),
                headers: encoded.headers_json().unwrap(),
                queue_name: "default".into(),
                created_at: now,
                available_at: now,
            })
            .await
            .unwrap();

        let claim = receiver.poll().await.unwrap().pop().unwrap();
        let refresher = receiver.refresher(&claim.ticket);
        refresher.refresh().await.unwrap();
        refresher.heartbeat().await.unwrap();

        receiver.ack(&claim.ticket).await.unwrap();
        assert!(refresher.refresh().await.is_err());
        assert!(refresher.heartbeat().await.is_err());
    }

    #[tokio::test]
    async fn test_abandon_keeps_row() {
        let store = InMemoryQueueStore::new();
        let locks = InMemoryLockService::new();
        let receiver = receiver(&store, &locks);
        let encoded = JsonSerializer
            .encode(&Envelope::new(CronJobMessage { job_id: 1 }))
            .unwrap();
        let now = Utc::now();
        store
            .insert(NewMessage {
                body: encoded.body.clone(),
                headers: encoded.headers_json().unwrap(),
                queue_name: "default".into(),
                created_at: now,
                available_at: now,
            })
            .await
            .unwrap();

        let claim = receiver.poll().await.unwrap().pop().unwrap();
        receiver.abandon(&claim.ticket).await;
        assert_eq!(store.len(), 1);
        assert!(receiver.poll().await.unwrap().is_empty());
    }

    /// Fails the first `failures` deletes, then delegates.
    struct FlakyDeleteStore {
        inner: InMemoryQueueStore,
        failures: parking_lot::Mutex<u32>,
    }

    #[async_trait]
    impl QueueStore for FlakyDeleteStore {
        async fn insert(&self, message: NewMessage) -> anyhow::Result<MessageId> {
            self.inner.insert(message).await
        }

        async fn pending_partitions(
            &self,
            filter: &PartitionFilter,
            eligibility: &Eligibility,
        ) -> anyhow::Result<Vec<String>> {
            self.inner.pending_partitions(filter, eligibility).await
        }

        async fn claim_next(
            &self,
            queue_name: &str,
            eligibility: &Eligibility,
        ) -> anyhow::Result<Option<StoredMessage>> {
            self.inner.claim_next(queue_name, eligibility).await
        }

        async fn touch(&self, id: MessageId, at: chrono::DateTime<Utc>) -> anyhow::Result<bool> {
            self.inner.touch(id, at).await
        }

        async fn delete(&self, id: MessageId) -> anyhow::Result<bool> {
            {
                let mut failures = self.failures.lock();
                if *failures > 0 {
                    *failures -= 1;
                    anyhow::bail!("connection reset");
                }
            }
            self.inner.delete(id).await
        }

        async fn relocate(&self, id: MessageId, queue_name: &str) -> anyhow::Result<bool> {
            self.inner.relocate(id, queue_name).await
        }

        async fn snapshot(&self) -> anyhow::Result<crate::store::QueueSnapshot> {
            self.inner.snapshot().await
        }
    }

    #[tokio::test]
    async fn test_failed_ack_keeps_partition_locked() {
        let inner = InMemoryQueueStore::new();
        let locks = InMemoryLockService::new();
        let config = TransportConfig::default();
        let receiver = PartitionReceiver::new(
            Arc::new(FlakyDeleteStore {
                inner: inner.clone(),
                failures: parking_lot::Mutex::new(1),
            }),
            PartitionLocks::new(Arc::new(locks.clone()), &config),
            Arc::new(JsonSerializer),
            config,
        );
        let now = Utc::now();
        for job_id in [1, 2] {
            let encoded = JsonSerializer
                .encode(&Envelope::new(CronJobMessage { job_id }))
                .unwrap();
            inner
                .insert(NewMessage {
                    body: encoded.body.clone(),
                    headers: encoded.headers_json().unwrap(),
                    queue_name: "env_1".into(),
                    created_at: now + chrono::Duration::milliseconds(job_id),
                    available_at: now,
                })
                .await
                .unwrap();
        }

        let first = receiver.poll().await.unwrap().pop().unwrap();
        let error = receiver.ack(&first.ticket).await.unwrap_err();
        assert_eq!(error.to_string(), "connection reset");
        assert!(locks.is_held("partition_processing_1").await.unwrap());
        assert!(receiver.poll().await.unwrap().is_empty());
        assert_eq!(inner.len(), 2);

        receiver.ack(&first.ticket).await.unwrap();
        assert!(!locks.is_held("partition_processing_1").await.unwrap());
        let next = receiver.poll().await.unwrap().pop().unwrap();
        assert_eq!(
            next.envelope.message(),
            &QueueMessage::from(CronJobMessage { job_id: 2 })
        );
    }
}
