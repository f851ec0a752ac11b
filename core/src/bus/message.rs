//! Message envelope and headers.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::SCHEMA_VERSION;
use crate::error::TollHubError;

/// Headers carried by every bus message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHeaders {
    pub message_id: Uuid,
    /// Logical payload type, e.g. `raw_event`, `normalized_event`.
    pub message_type: String,
    pub schema_version: String,
    /// Threads one toll event through all stages for tracing.
    pub correlation_id: Uuid,
    pub produced_at: DateTime<Utc>,
    /// Producing component, e.g. `connector:etoll`, `stage:normalizer`.
    pub source: String,
    /// Incremented by DLQ replay; replay refuses past the configured cap.
    #[serde(default)]
    pub retry_count: u32,
}

impl MessageHeaders {
    pub fn new(message_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            message_type: message_type.into(),
            schema_version: SCHEMA_VERSION.to_string(),
            correlation_id: Uuid::new_v4(),
            produced_at: Utc::now(),
            source: source.into(),
            retry_count: 0,
        }
    }

    /// Keep the correlation chain from an upstream message.
    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Fix the message id; used where idempotence is keyed on a domain id
    /// (e.g. the persisted toll event id).
    pub fn with_message_id(mut self, message_id: Uuid) -> Self {
        self.message_id = message_id;
        self
    }
}

/// One record on a topic: headers, partition key, serialized payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub headers: MessageHeaders,
    pub key: String,
    pub payload: Vec<u8>,
}

impl Message {
    /// Serialize `value` as the payload.
    pub fn encode<T: Serialize>(
        headers: MessageHeaders,
        key: impl Into<String>,
        value: &T,
    ) -> Result<Self, TollHubError> {
        Ok(Self { headers, key: key.into(), payload: serde_json::to_vec(value)? })
    }

    /// Deserialize the payload. Unknown fields are ignored so additive
    /// schema evolution never breaks an older consumer.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, TollHubError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        plate: String,
    }

    #[test]
    fn encode_decode_roundtrip() {
        let headers = MessageHeaders::new("sample", "test");
        let msg = Message::encode(headers, "key", &Sample { plate: "ABC123".into() }).unwrap();
        let back: Sample = msg.decode().unwrap();
        assert_eq!(back, Sample { plate: "ABC123".into() });
        assert_eq!(msg.headers.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn correlation_survives_rebuild() {
        let upstream = MessageHeaders::new("raw_event", "connector:etoll");
        let downstream =
            MessageHeaders::new("normalized_event", "stage:normalizer")
                .with_correlation(upstream.correlation_id);
        assert_eq!(upstream.correlation_id, downstream.correlation_id);
        assert_ne!(upstream.message_id, downstream.message_id);
    }
}
