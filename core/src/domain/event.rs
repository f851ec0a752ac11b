//! Event entities: raw, normalized, matched and persisted shapes.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier for an external toll agency (e.g. `etoll`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgencyId(pub String);

impl AgencyId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgencyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgencyId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Where a raw event originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    /// Pulled from an agency transaction feed.
    AgencyFeed,
    /// Pay-by-plate lookup.
    PlatePay,
    /// Entered by an operator.
    Manual,
}

impl std::fmt::Display for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventSource::AgencyFeed => write!(f, "agency_feed"),
            EventSource::PlatePay => write!(f, "plate_pay"),
            EventSource::Manual => write!(f, "manual"),
        }
    }
}

/// A toll transaction exactly as a connector fetched it.
///
/// The payload stays an opaque, agency-shaped bag until normalization turns
/// it into a strongly typed [`NormalizedEvent`]. Immutable once published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    /// Opaque id, unique within the agency.
    pub event_id: String,
    pub agency_id: AgencyId,
    pub received_at: DateTime<Utc>,
    pub source: EventSource,
    pub payload: serde_json::Value,
}

impl RawEvent {
    /// Dedup key: `(agency_id, external_event_id)` is globally unique.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.agency_id, self.event_id)
    }
}

/// Geographic point attached to a toll event or a vehicle sighting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub road_name: Option<String>,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon, direction: None, road_name: None }
    }

    /// Coordinates must be a real point on the globe.
    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.lat) && (-180.0..=180.0).contains(&self.lon)
    }

    /// Great-circle distance in meters (Earth radius 6,371 km).
    pub fn haversine_meters(&self, other: &GeoPoint) -> f64 {
        const EARTH_RADIUS_M: f64 = 6_371_000.0;
        let lat1 = self.lat.to_radians();
        let lat2 = other.lat.to_radians();
        let dlat = (other.lat - self.lat).to_radians();
        let dlon = (other.lon - self.lon).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        EARTH_RADIUS_M * c
    }
}

/// Canonical event produced by normalization. Immutable.
///
/// Published at most once per `(agency_id, external_event_id)`; duplicates
/// are suppressed by the dedup store before this type is ever constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedEvent {
    /// Fresh UUID assigned at normalization time.
    pub normalized_id: Uuid,
    pub agency_id: AgencyId,
    pub external_event_id: String,
    /// Canonicalized: uppercase, `[A-Z0-9]` only, length 2..=10.
    pub plate: String,
    /// Uppercase 2-letter code.
    pub plate_state: String,
    pub event_timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gantry_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle_class: Option<String>,
    pub raw_amount: Decimal,
    pub fees: Decimal,
    /// ISO-4217 code.
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_uri: Option<String>,
    pub source: EventSource,
    pub schema_version: String,
}

/// How the matcher resolved an event to a vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    Fuzzy,
    TimeBased,
    ManualReview,
}

impl std::fmt::Display for MatchType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MatchType::Exact => write!(f, "exact"),
            MatchType::Fuzzy => write!(f, "fuzzy"),
            MatchType::TimeBased => write!(f, "time_based"),
            MatchType::ManualReview => write!(f, "manual_review"),
        }
    }
}

/// Outcome of matching a [`NormalizedEvent`] to `(user_id, vehicle_id)`.
/// Transient; travels on the matched topic alongside the toll event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchResult {
    pub matched: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle_id: Option<String>,
    /// Certainty in `[0, 1]`.
    pub confidence: f64,
    pub match_type: MatchType,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl MatchResult {
    pub fn unmatched(notes: Vec<String>) -> Self {
        Self {
            matched: false,
            user_id: None,
            vehicle_id: None,
            confidence: 0.0,
            match_type: MatchType::ManualReview,
            notes,
        }
    }
}

/// Lifecycle status of a persisted toll event.
///
/// `Disputed` and `Voided` transitions are owned by the dispute service and
/// arrive on the status topic; the pipeline only ever writes `Posted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Posted,
    Disputed,
    Voided,
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventStatus::Pending => write!(f, "pending"),
            EventStatus::Posted => write!(f, "posted"),
            EventStatus::Disputed => write!(f, "disputed"),
            EventStatus::Voided => write!(f, "voided"),
        }
    }
}

/// Canonical, persisted toll event.
///
/// Uniqueness invariant: `(agency_id, external_event_id)` is globally unique;
/// the store enforces it and the persister treats a violation as a duplicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TollEvent {
    pub id: Uuid,
    pub user_id: String,
    pub vehicle_id: String,
    pub agency_id: AgencyId,
    pub external_event_id: String,
    pub plate: String,
    pub plate_state: String,
    pub event_timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gantry_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
    pub vehicle_class: String,
    pub raw_amount: Decimal,
    pub rated_amount: Decimal,
    pub fees: Decimal,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_uri: Option<String>,
    pub source: EventSource,
    pub status: EventStatus,
    /// Set when the event arrived after its billing period closed and was
    /// rolled into the next open period.
    #[serde(default)]
    pub late_arrival: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TollEvent {
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.agency_id, self.external_event_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_known_distance() {
        // Golden Gate Bridge to Bay Bridge, roughly 13 km.
        let a = GeoPoint::new(37.8199, -122.4783);
        let b = GeoPoint::new(37.7983, -122.3778);
        let d = a.haversine_meters(&b);
        assert!((8_000.0..12_000.0).contains(&d), "unexpected distance {d}");
    }

    #[test]
    fn haversine_zero_for_same_point() {
        let p = GeoPoint::new(40.0, -75.0);
        assert!(p.haversine_meters(&p) < 1e-6);
    }

    #[test]
    fn geo_point_validation() {
        assert!(GeoPoint::new(90.0, 180.0).is_valid());
        assert!(!GeoPoint::new(90.5, 0.0).is_valid());
        assert!(!GeoPoint::new(0.0, -180.5).is_valid());
    }

    #[test]
    fn event_source_roundtrip() {
        let json = serde_json::to_string(&EventSource::AgencyFeed).unwrap();
        assert_eq!(json, "\"agency_feed\"");
        let back: EventSource = serde_json::from_str(&json).unwrap();
        assert_eq!(back, EventSource::AgencyFeed);
    }
}
