use std::sync::Arc;

use chrono::Utc;
use tracing::Instrument;

use crate::config::TransportConfig;
use crate::envelope::Envelope;
use crate::message::MessageId;
use crate::serializer::Serializer;
use crate::store::{NewMessage, QueueStore};
use crate::telemetry;

/// Writes envelopes into the store, one row per send.
#[derive(Clone)]
pub struct PartitionSender {
    store: Arc<dyn QueueStore>,
    serializer: Arc<dyn Serializer>,
    config: TransportConfig,
}

impl PartitionSender {
    pub fn new(
        store: Arc<dyn QueueStore>,
        serializer: Arc<dyn Serializer>,
        config: TransportConfig,
    ) -> Self {
        Self {
            store,
            serializer,
            config,
        }
    }

    /// Partition the envelope will be written to.
    pub fn resolve_queue<'a>(&'a self, envelope: &'a Envelope) -> &'a str {
        envelope.partition().unwrap_or(&self.config.default_queue)
    }

    /// Insert one row. Identical messages are stored as independent rows.
    pub async fn send(&self, envelope: &Envelope) -> anyhow::Result<MessageId> {
        let queue_name = self.resolve_queue(envelope).to_string();
        let kind = envelope.message().kind();
        async {
            let encoded = self.serializer.encode(envelope)?;
            let now = Utc::now();
            let available_at = match envelope.delay() {
                Some(delay) => now
                    .checked_add_signed(delay)
                    .ok_or_else(|| anyhow::anyhow!("delay of {delay} is out of range"))?,
                None => now,
            };
            let id = self
                .store
                .insert(NewMessage {
                    body: encoded.body.clone(),
                    headers: encoded.headers_json()?,
                    queue_name: queue_name.clone(),
                    created_at: now,
                    available_at,
                })
                .await?;
            telemetry::record_message_sent(&queue_name, kind);
            Ok::<_, anyhow::Error>(id)
        }
        .instrument(telemetry::send_span(&queue_name, kind))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Stamp;
    use crate::message::{CronJobMessage, Phase, RunPhaseMessage};
    use crate::serializer::JsonSerializer;
    use crate::store::InMemoryQueueStore;

    fn sender(store: &InMemoryQueueStore) -> PartitionSender {
        PartitionSender::new(
            Arc::new(store.clone()),
            Arc::new(JsonSerializer),
            TransportConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_unstamped_goes_to_default_queue() {
        let store = InMemoryQueueStore::new();
        let id = sender(&store)
            .send(&Envelope::new(CronJobMessage { job_id: 2 }))
            .await
            .unwrap();
        assert_eq!(store.queue_names(), vec![(id, "default".to_string())]);
    }

    #[tokio::test]
    async fn test_duplicates_are_independent_rows() {
        let store = InMemoryQueueStore::new();
        let sender = sender(&store);
        let envelope = Envelope::new(RunPhaseMessage::new(1, 3, Phase::Execute)).with(
            Stamp::Partition {
                queue_name: "env_3".into(),
            },
        );
        let first = sender.send(&envelope).await.unwrap();
        let second = sender.send(&envelope).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_delay_postpones_availability() {
        let store = InMemoryQueueStore::new();
        sender(&store)
            .send(&Envelope::new(CronJobMessage { job_id: 2 }).with(Stamp::Delay { millis: 60_000 }))
            .await
            .unwrap();
        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot.queues["default"].delayed_count, 1);
    }
}
