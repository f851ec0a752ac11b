//! Persistence seams.
//!
//! Narrow traits with thread-safe in-memory implementations. The traits are
//! where a SQL backend mounts; the pipeline only ever sees the trait
//! objects. Single-key operations are strongly consistent; the statement
//! store adds optimistic concurrency on draft versions.

mod cursor;
mod dedup;
mod review;
mod statements;
mod toll_events;
mod users;
mod vehicles;

pub use cursor::CursorStore;
pub use dedup::{DedupStore, InMemoryDedupStore};
pub use review::{InMemoryManualReviewQueue, ManualReviewQueue, ReviewItem};
pub use statements::{InMemoryStatementStore, StatementStore};
pub use toll_events::{InMemoryTollEventStore, InsertOutcome, TollEventStore};
pub use users::{InMemoryUserDirectory, UserDirectory};
pub use vehicles::{InMemoryVehicleCatalog, VehicleCatalog};
