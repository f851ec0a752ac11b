//! Dead-letter queue handling.
//!
//! Every stage wraps its handler: after retries are exhausted the original
//! message goes to the DLQ with its provenance and error context. The
//! replay tool republishes a bounded range to the original topics with an
//! incremented retry count, refusing anything past the cap.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bus::{topics, Delivery, EventBus, Message, MessageHeaders};
use crate::error::TollHubError;

/// DLQ record: provenance plus the full original message (headers, key and
/// payload), serialized so replay can reconstruct it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub orig_topic: String,
    pub orig_partition: u32,
    pub orig_offset: u64,
    pub error_class: String,
    pub error_message: String,
    pub payload: Vec<u8>,
}

impl DeadLetter {
    pub fn original_message(&self) -> Result<Message, TollHubError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Routes failed deliveries to the DLQ. Cheap to clone per stage.
#[derive(Clone)]
pub struct DlqHandler {
    bus: EventBus,
    stage: String,
}

impl DlqHandler {
    pub fn new(bus: EventBus, stage: impl Into<String>) -> Self {
        Self { bus, stage: stage.into() }
    }

    pub fn route(&self, delivery: &Delivery, error: &TollHubError) -> Result<(), TollHubError> {
        let record = DeadLetter {
            orig_topic: delivery.topic.clone(),
            orig_partition: delivery.partition,
            orig_offset: delivery.offset,
            error_class: error.class().to_string(),
            error_message: error.to_string(),
            payload: serde_json::to_vec(&delivery.message)?,
        };
        let headers = MessageHeaders::new("dead_letter", format!("stage:{}", self.stage))
            .with_correlation(delivery.message.headers.correlation_id);
        let message = Message::encode(headers, delivery.topic.clone(), &record)?;
        self.bus.publish(topics::DEAD_LETTER, message)?;
        log::warn!(
            "[{}] dead-lettered {}@{}/{} ({}): {}",
            self.stage,
            record.orig_topic,
            record.orig_partition,
            record.orig_offset,
            record.error_class,
            record.error_message
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub replayed: usize,
    /// Past the retry cap; left for manual resolution.
    pub refused: usize,
}

/// Bounded DLQ replay. Reads through a consumer group so repeated
/// invocations make progress instead of replaying the same records.
pub struct ReplayTool {
    bus: EventBus,
    max_replays: u32,
}

impl ReplayTool {
    pub fn new(bus: EventBus, max_replays: u32) -> Self {
        Self { bus, max_replays }
    }

    pub async fn replay(&self, limit: usize) -> Result<ReplayReport, TollHubError> {
        let subscription = self.bus.subscribe("dlq-replay", topics::DEAD_LETTER)?;
        let mut report = ReplayReport::default();

        for _ in 0..limit {
            let Some(delivery) =
                subscription.poll(std::time::Duration::from_millis(100)).await?
            else {
                break;
            };
            let record: DeadLetter = delivery.message.decode()?;
            let original = record.original_message()?;

            if original.headers.retry_count >= self.max_replays {
                report.refused += 1;
                log::warn!(
                    "refusing replay of {}@{}/{}: retry_count {} at cap {}",
                    record.orig_topic,
                    record.orig_partition,
                    record.orig_offset,
                    original.headers.retry_count,
                    self.max_replays
                );
                subscription.commit(&delivery)?;
                continue;
            }

            // Fresh message id so the broker does not drop the republish as
            // a duplicate of the original append.
            let mut replayed = original;
            replayed.headers.message_id = Uuid::new_v4();
            replayed.headers.retry_count += 1;
            self.bus.publish(&record.orig_topic, replayed)?;
            subscription.commit(&delivery)?;
            report.replayed += 1;
        }
        Ok(report)
    }
}
