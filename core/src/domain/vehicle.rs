//! Vehicle read model.
//!
//! Vehicles are owned by the identity service; the pipeline only reads them.
//! Updates arrive as upserts on the identity topic and feed the matcher's
//! catalog and cache invalidation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::event::GeoPoint;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: String,
    pub user_id: String,
    /// Canonical plate (uppercase alphanumeric).
    pub plate: String,
    /// Uppercase 2-letter code.
    pub plate_state: String,
    pub vehicle_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub axle_count: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    pub active: bool,
    /// Last telemetry sighting, used by the time-and-location strategy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_location: Option<GeoPoint>,
}

impl Vehicle {
    /// Ordering key for multi-hit tie-breaks: most recently seen first,
    /// vehicles that were never seen sort last.
    pub fn recency_key(&self) -> DateTime<Utc> {
        self.last_seen.unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}
