//! The four-stage event pipeline.
//!
//! raw -> (dedup + normalize) -> normalized -> (match + rate) -> matched ->
//! (persist + statement upsert). Every stage runs behind the shared
//! [`StageWorker`] wrapper which owns the retry-vs-dead-letter policy; the
//! stages themselves are pure handlers over bus deliveries.

mod matcher;
mod normalizer;
mod persister;
mod rater;
mod stage;

pub use matcher::{MatchOutcome, Matcher, MatcherStage, MatchedRecord, PlateCache, VehicleUpdateStage};
pub use normalizer::{MapperRegistry, NormalizerStage, SchemaMapper};
pub use persister::{AggregatorStage, GenerateCommand, PersisterStage, StatusFeedStage, StatusUpdate};
pub use rater::{RateConfig, Rater};
pub use stage::{StageHandler, StageWorker};
