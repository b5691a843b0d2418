use serde::{Deserialize, Serialize};

use crate::message::QueueMessage;

/// Transport metadata attached to a message on its way through the bus.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stamp", rename_all = "snake_case")]
pub enum Stamp {
    /// Target partition (`queue_name`) for the sender.
    Partition { queue_name: String },
    /// Delay before the stored row becomes available.
    Delay { millis: u64 },
    /// Number of times the message has been re-sent after a failure.
    Redelivery { attempt: u32 },
}

/// A message plus its ordered list of stamps. Later stamps of the same
/// variant override earlier ones.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    message: QueueMessage,
    stamps: Vec<Stamp>,
}

impl Envelope {
    pub fn new(message: impl Into<QueueMessage>) -> Self {
        Self {
            message: message.into(),
            stamps: Vec::new(),
        }
    }

    pub fn from_parts(message: QueueMessage, stamps: Vec<Stamp>) -> Self {
        Self { message, stamps }
    }

    /// Append a stamp and return the envelope.
    pub fn with(mut self, stamp: Stamp) -> Self {
        self.stamps.push(stamp);
        self
    }

    pub fn message(&self) -> &QueueMessage {
        &self.message
    }

    pub fn stamps(&self) -> &[Stamp] {
        &self.stamps
    }

    pub fn partition(&self) -> Option<&str> {
        self.stamps.iter().rev().find_map(|stamp| match stamp {
            Stamp::Partition { queue_name } => Some(queue_name.as_str()),
            _ => None,
        })
    }

    pub fn delay(&self) -> Option<chrono::Duration> {
        self.stamps.iter().rev().find_map(|stamp| match stamp {
            Stamp::Delay { millis } => i64::try_from(*millis)
                .ok()
                .map(chrono::Duration::milliseconds),
            _ => None,
        })
    }

    pub fn redelivery_attempt(&self) -> u32 {
        self.stamps
            .iter()
            .rev()
            .find_map(|stamp| match stamp {
                Stamp::Redelivery { attempt } => Some(*attempt),
                _ => None,
            })
            .unwrap_or(0)
    }

    /// Drop every stamp of the same variant as `stamp`, then append it.
    pub fn replace(mut self, stamp: Stamp) -> Self {
        let variant = std::mem::discriminant(&stamp);
        self.stamps.retain(|s| std::mem::discriminant(s) != variant);
        self.stamps.push(stamp);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::CronJobMessage;

    #[test]
    fn test_last_partition_stamp_wins() {
        let envelope = Envelope::new(CronJobMessage { job_id: 1 })
            .with(Stamp::Partition {
                queue_name: "env_1".into(),
            })
            .with(Stamp::Partition {
                queue_name: "env_2".into(),
            });
        assert_eq!(envelope.partition(), Some("env_2"));
    }

    #[test]
    fn test_defaults_without_stamps() {
        let envelope = Envelope::new(CronJobMessage { job_id: 1 });
        assert_eq!(envelope.partition(), None);
        assert_eq!(envelope.delay(), None);
        assert_eq!(envelope.redelivery_attempt(), 0);
    }

    #[test]
    fn test_replace_keeps_single_stamp() {
        let envelope = Envelope::new(CronJobMessage { job_id: 1 })
            .with(Stamp::Redelivery { attempt: 1 })
            .with(Stamp::Delay { millis: 500 })
            .replace(Stamp::Redelivery { attempt: 2 });
        assert_eq!(envelope.redelivery_attempt(), 2);
        assert_eq!(envelope.stamps().len(), 2);
        assert_eq!(envelope.delay(), Some(chrono::Duration::milliseconds(500)));
    }
}
