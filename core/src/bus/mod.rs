//! Event bus abstraction.
//!
//! A durable, partitioned, at-least-once log with consumer groups and
//! manual commits. Kafka is one valid transport; the pipeline only depends
//! on the semantics, and ships with an in-process broker that honors them:
//! per-partition FIFO, exclusive partition assignment per group, redelivery
//! of uncommitted messages, idempotent producers.

mod broker;
mod message;

pub use broker::{Delivery, EventBus, Producer, Subscription};
pub use message::{Message, MessageHeaders};

/// Topic names used by the pipeline.
pub mod topics {
    /// Agency-shaped events straight off the connectors. Key: agency_id.
    pub const RAW: &str = "toll.events.raw";
    /// Canonical events after dedup + normalization. Key: plate|plate_state.
    pub const NORMALIZED: &str = "toll.events.normalized";
    /// Matched and rated events ready to persist. Key: user_id.
    pub const MATCHED: &str = "toll.events.matched";
    /// Dispute service status transitions (disputed/voided). Key: user_id.
    pub const EVENT_STATUS: &str = "toll.events.status";
    /// Period-close commands. Key: user_id.
    pub const STATEMENTS_GENERATE: &str = "statements.generate";
    /// Finalized statements. Key: user_id.
    pub const STATEMENTS_CLOSED: &str = "statements.closed";
    /// Connector heartbeats. Key: agency_id.
    pub const CONNECTOR_HEALTH: &str = "connector.health";
    /// Identity-service vehicle upserts; drives matcher cache invalidation.
    pub const VEHICLE_UPDATES: &str = "identity.vehicles";
    /// Messages no stage could process. Key: original topic.
    pub const DEAD_LETTER: &str = "dead-letter-queue";

    /// Everything the broker provisions at startup.
    pub const ALL: &[&str] = &[
        RAW,
        NORMALIZED,
        MATCHED,
        EVENT_STATUS,
        STATEMENTS_GENERATE,
        STATEMENTS_CLOSED,
        CONNECTOR_HEALTH,
        VEHICLE_UPDATES,
        DEAD_LETTER,
    ];
}
