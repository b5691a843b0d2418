use std::sync::Arc;

use async_trait::async_trait;

use crate::config::TransportConfig;
use crate::envelope::{Envelope, Stamp};
use crate::message::{MessageId, QueueMessage};
use crate::sender::PartitionSender;

/// Where a dispatched message ended up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchReceipt {
    pub message_id: MessageId,
    pub queue_name: String,
}

/// Outgoing side used by handlers and schedule runners.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn dispatch(&self, envelope: Envelope) -> anyhow::Result<DispatchReceipt>;

    async fn dispatch_message(&self, message: QueueMessage) -> anyhow::Result<DispatchReceipt> {
        self.dispatch(Envelope::new(message)).await
    }
}

/// Synchronous transformation applied to every outgoing envelope.
pub trait Middleware: Send + Sync {
    fn handle(&self, envelope: Envelope) -> Envelope;
}

/// Stamps messages that carry an environment affinity with that
/// environment's partition. Anything else passes through untouched.
#[derive(Clone, Debug)]
pub struct PartitionRoutingMiddleware {
    config: TransportConfig,
}

impl PartitionRoutingMiddleware {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

impl Middleware for PartitionRoutingMiddleware {
    fn handle(&self, envelope: Envelope) -> Envelope {
        match envelope.message().partition_affinity() {
            Some(environment_id) => envelope.with(Stamp::Partition {
                queue_name: self.config.queue_name_for(environment_id),
            }),
            None => envelope,
        }
    }
}

/// Middleware chain in front of a [`PartitionSender`].
#[derive(Clone)]
pub struct TransportBus {
    middleware: Vec<Arc<dyn Middleware>>,
    sender: PartitionSender,
}

impl TransportBus {
    pub fn new(sender: PartitionSender) -> Self {
        Self {
            middleware: Vec::new(),
            sender,
        }
    }

    /// Append a middleware; they run in insertion order.
    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }
}

#[async_trait]
impl MessageBus for TransportBus {
    async fn dispatch(&self, envelope: Envelope) -> anyhow::Result<DispatchReceipt> {
        let envelope = self
            .middleware
            .iter()
            .fold(envelope, |envelope, middleware| middleware.handle(envelope));
        let queue_name = self.sender.resolve_queue(&envelope).to_string();
        let message_id = self.sender.send(&envelope).await?;
        Ok(DispatchReceipt {
            message_id,
            queue_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CronJobMessage, Phase, RunPhaseMessage};

    #[test]
    fn test_routing_tags_environment() {
        let middleware = PartitionRoutingMiddleware::new(&TransportConfig::default());
        let envelope = middleware.handle(Envelope::new(RunPhaseMessage::new(10, 4, Phase::Prepare)));
        assert_eq!(envelope.partition(), Some("env_4"));
    }

    #[test]
    fn test_routing_passes_through_unaffine() {
        let middleware = PartitionRoutingMiddleware::new(&TransportConfig::default());
        let envelope = middleware.handle(Envelope::new(CronJobMessage { job_id: 1 }));
        assert!(envelope.stamps().is_empty());
    }

    #[test]
    fn test_restamping_is_harmless() {
        let middleware = PartitionRoutingMiddleware::new(&TransportConfig::default());
        let once = middleware.handle(Envelope::new(RunPhaseMessage::new(10, 4, Phase::Prepare)));
        let twice = middleware.handle(once.clone());
        assert_eq!(once.partition(), twice.partition());
    }
}
