//! Domain model for the toll event pipeline.
//!
//! Entities flow through the pipeline in three shapes: the agency-shaped
//! `RawEvent`, the canonical `NormalizedEvent`, and the persisted `TollEvent`.
//! Statements accumulate per user per billing period. All cross-references
//! between entities are by id, never by object reference.

mod event;
mod period;
mod plate;
mod statement;
mod vehicle;

pub use event::{
    AgencyId, EventSource, EventStatus, GeoPoint, MatchResult, MatchType, NormalizedEvent,
    RawEvent, TollEvent,
};
pub use period::{BillingPeriod, PeriodConfig, PeriodKind, TimezoneSource};
pub use plate::{canonicalize_plate, canonicalize_plate_state, PlateError};
pub use statement::{Statement, StatementDraft, StatementLineItem, StatementStatus};
pub use vehicle::Vehicle;

/// Schema version stamped on every normalized event and bus message.
///
/// Evolution is additive-only: newer producers may add fields, consumers
/// ignore unknown fields via serde defaults.
pub const SCHEMA_VERSION: &str = "v1";
