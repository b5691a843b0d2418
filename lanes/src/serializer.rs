use std::collections::BTreeMap;

use anyhow::{bail, Context};

use crate::envelope::{Envelope, Stamp};
use crate::message::QueueMessage;

pub const TYPE_HEADER: &str = "type";
pub const STAMPS_HEADER: &str = "stamps";

/// Body and headers as they are written to the store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EncodedEnvelope {
    pub body: String,
    pub headers: BTreeMap<String, String>,
}

impl EncodedEnvelope {
    pub fn headers_json(&self) -> anyhow::Result<String> {
        serde_json::to_string(&self.headers).context("encode headers")
    }

    pub fn from_stored(body: String, headers_json: &str) -> anyhow::Result<Self> {
        let headers = if headers_json.trim().is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_str(headers_json).context("decode headers")?
        };
        Ok(Self { body, headers })
    }
}

/// Converts envelopes to and from their stored representation.
pub trait Serializer: Send + Sync {
    fn encode(&self, envelope: &Envelope) -> anyhow::Result<EncodedEnvelope>;
    fn decode(&self, encoded: &EncodedEnvelope) -> anyhow::Result<Envelope>;
}

/// JSON body with the message type and stamps carried as headers.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn encode(&self, envelope: &Envelope) -> anyhow::Result<EncodedEnvelope> {
        let body = serde_json::to_string(envelope.message()).context("encode message body")?;
        let mut headers = BTreeMap::new();
        headers.insert(TYPE_HEADER.to_string(), envelope.message().kind().to_string());
        if !envelope.stamps().is_empty() {
            let stamps = serde_json::to_string(envelope.stamps()).context("encode stamps")?;
            headers.insert(STAMPS_HEADER.to_string(), stamps);
        }
        Ok(EncodedEnvelope { body, headers })
    }

    fn decode(&self, encoded: &EncodedEnvelope) -> anyhow::Result<Envelope> {
        let message: QueueMessage =
            serde_json::from_str(&encoded.body).context("decode message body")?;
        if let Some(kind) = encoded.headers.get(TYPE_HEADER) {
            if kind != message.kind() {
                bail!(
                    "type header {kind} does not match body type {}",
                    message.kind()
                );
            }
        }
        let stamps: Vec<Stamp> = match encoded.headers.get(STAMPS_HEADER) {
            Some(raw) => serde_json::from_str(raw).context("decode stamps")?,
            None => Vec::new(),
        };
        Ok(Envelope::from_parts(message, stamps))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Phase, RunPhaseMessage};

    #[test]
    fn test_stamps_survive_encoding() {
        let envelope = Envelope::new(RunPhaseMessage::new(4, 2, Phase::Report))
            .with(Stamp::Partition {
                queue_name: "env_2".into(),
            })
            .with(Stamp::Redelivery { attempt: 3 });
        let encoded = JsonSerializer.encode(&envelope).unwrap();
        assert_eq!(encoded.headers[TYPE_HEADER], "run_phase");

        let stored = EncodedEnvelope::from_stored(
            encoded.body.clone(),
            &encoded.headers_json().unwrap(),
        )
        .unwrap();
        assert_eq!(JsonSerializer.decode(&stored).unwrap(), envelope);
    }

    #[test]
    fn test_mismatched_type_header_fails() {
        let envelope = Envelope::new(RunPhaseMessage::new(4, 2, Phase::Report));
        let mut encoded = JsonSerializer.encode(&envelope).unwrap();
        encoded
            .headers
            .insert(TYPE_HEADER.to_string(), "cron_job".to_string());
        assert!(JsonSerializer.decode(&encoded).is_err());
    }

    #[test]
    fn test_garbage_body_fails() {
        let encoded = EncodedEnvelope {
            body: "{not json".into(),
            headers: BTreeMap::new(),
        };
        assert!(JsonSerializer.decode(&encoded).is_err());
    }
}
