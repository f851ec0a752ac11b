//! Dedup and normalization stage.
//!
//! Checks the dedup store first (at most one normalized event per
//! `(agency_id, external_event_id)`), then runs the agency's pure schema
//! mapping into a canonical [`NormalizedEvent`] and publishes it. The
//! normalized publish happens before the raw offset commits; if the
//! publish fails after the dedup insert, the TTL lets a later retry
//! through.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::stage::StageHandler;
use crate::bus::{topics, Delivery, EventBus, Message, MessageHeaders};
use crate::domain::{
    canonicalize_plate, canonicalize_plate_state, AgencyId, GeoPoint, NormalizedEvent, RawEvent,
    SCHEMA_VERSION,
};
use crate::error::TollHubError;
use crate::health::PipelineMetrics;
use crate::store::DedupStore;

/// Pure payload mapping for one agency.
pub type SchemaMapper = fn(&RawEvent) -> Result<NormalizedEvent, TollHubError>;

/// `agency_id -> mapper`. Unknown agencies are a permanent error.
pub struct MapperRegistry {
    mappers: HashMap<String, SchemaMapper>,
}

impl MapperRegistry {
    pub fn with_builtins() -> Self {
        let mut mappers: HashMap<String, SchemaMapper> = HashMap::new();
        mappers.insert("etoll".into(), map_etoll);
        mappers.insert("expresstoll".into(), map_expresstoll);
        mappers.insert("fasttrack".into(), map_fasttrack);
        Self { mappers }
    }

    pub fn register(&mut self, agency_id: &str, mapper: SchemaMapper) {
        self.mappers.insert(agency_id.to_string(), mapper);
    }

    pub fn get(&self, agency_id: &AgencyId) -> Result<SchemaMapper, TollHubError> {
        self.mappers
            .get(agency_id.as_str())
            .copied()
            .ok_or_else(|| TollHubError::UnknownAgency { agency_id: agency_id.to_string() })
    }
}

impl Default for MapperRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

pub struct NormalizerStage {
    dedup: Arc<dyn DedupStore>,
    mappers: MapperRegistry,
    bus: EventBus,
    metrics: Arc<PipelineMetrics>,
}

impl NormalizerStage {
    pub fn new(
        dedup: Arc<dyn DedupStore>,
        mappers: MapperRegistry,
        bus: EventBus,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self { dedup, mappers, bus, metrics }
    }
}

#[async_trait]
impl StageHandler for NormalizerStage {
    fn stage_name(&self) -> &'static str {
        "normalizer"
    }

    async fn handle(&self, delivery: &Delivery) -> Result<(), TollHubError> {
        let raw: RawEvent = delivery.message.decode()?;

        if !self.dedup.check_and_set(&raw.dedup_key()) {
            PipelineMetrics::incr(&self.metrics.duplicates_suppressed);
            log::debug!("suppressed duplicate {}", raw.dedup_key());
            return Ok(());
        }

        let mapper = self.mappers.get(&raw.agency_id)?;
        let normalized = mapper(&raw)?;

        let key = format!("{}|{}", normalized.plate, normalized.plate_state);
        let headers = MessageHeaders::new("normalized_event", "stage:normalizer")
            .with_correlation(delivery.message.headers.correlation_id);
        let message = Message::encode(headers, key, &normalized)?;
        self.bus.publish(topics::NORMALIZED, message)?;
        PipelineMetrics::incr(&self.metrics.events_normalized);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-agency mappings
// ---------------------------------------------------------------------------

/// E-Toll: camelCase feed, plaza-coded gantries.
fn map_etoll(raw: &RawEvent) -> Result<NormalizedEvent, TollHubError> {
    let p = &raw.payload;
    build(
        raw,
        Fields {
            plate: str_field(p, &["licensePlate", "plate"]),
            plate_state: str_field(p, &["plateState", "state"]),
            timestamp: p.get("timestamp").cloned(),
            amount: p.get("amount").cloned(),
            fees: p.get("fees").cloned(),
            currency: str_field(p, &["currency"]),
            gantry_id: str_field(p, &["plaza", "plazaId"]),
            lat: num_field(p, &["latitude", "lat"]),
            lon: num_field(p, &["longitude", "lon"]),
            direction: str_field(p, &["direction"]),
            road_name: str_field(p, &["roadName"]),
            vehicle_class: str_field(p, &["vehicleClass"]),
            evidence_uri: str_field(p, &["evidenceUrl", "evidence_uri"]),
        },
    )
}

/// ExpressToll: snake_case feed.
fn map_expresstoll(raw: &RawEvent) -> Result<NormalizedEvent, TollHubError> {
    let p = &raw.payload;
    build(
        raw,
        Fields {
            plate: str_field(p, &["plate", "plate_number"]),
            plate_state: str_field(p, &["plate_state", "state"]),
            timestamp: p.get("occurred_at").or_else(|| p.get("timestamp")).cloned(),
            amount: p.get("toll_amount").or_else(|| p.get("amount")).cloned(),
            fees: p.get("fee_amount").or_else(|| p.get("fees")).cloned(),
            currency: str_field(p, &["currency"]),
            gantry_id: str_field(p, &["gantry", "gantry_id"]),
            lat: num_field(p, &["lat"]),
            lon: num_field(p, &["lon", "lng"]),
            direction: str_field(p, &["direction"]),
            road_name: str_field(p, &["road_name"]),
            vehicle_class: str_field(p, &["class", "vehicle_class"]),
            evidence_uri: str_field(p, &["evidence_uri"]),
        },
    )
}

/// FastTrack: nested charge/location objects.
fn map_fasttrack(raw: &RawEvent) -> Result<NormalizedEvent, TollHubError> {
    let p = &raw.payload;
    let charge = p.get("charge").cloned().unwrap_or_default();
    let location = p.get("location").cloned().unwrap_or_default();
    build(
        raw,
        Fields {
            plate: str_field(p, &["plateNumber"]),
            plate_state: str_field(p, &["plateIssuer"]),
            timestamp: p.get("eventTime").cloned(),
            amount: charge.get("amount").cloned(),
            fees: charge.get("fees").cloned(),
            currency: charge.get("currency").and_then(|v| v.as_str()).map(|s| s.to_string()),
            gantry_id: str_field(p, &["gantryRef"]),
            lat: location.get("lat").and_then(|v| v.as_f64()),
            lon: location.get("lng").and_then(|v| v.as_f64()),
            direction: location.get("direction").and_then(|v| v.as_str()).map(String::from),
            road_name: location.get("road").and_then(|v| v.as_str()).map(String::from),
            vehicle_class: str_field(p, &["vehicleCategory"]),
            evidence_uri: str_field(p, &["imageUrl", "evidence_uri"]),
        },
    )
}

struct Fields {
    plate: Option<String>,
    plate_state: Option<String>,
    timestamp: Option<serde_json::Value>,
    amount: Option<serde_json::Value>,
    fees: Option<serde_json::Value>,
    currency: Option<String>,
    gantry_id: Option<String>,
    lat: Option<f64>,
    lon: Option<f64>,
    direction: Option<String>,
    road_name: Option<String>,
    vehicle_class: Option<String>,
    evidence_uri: Option<String>,
}

/// Shared canonicalization: plate rules, timestamps to UTC, coordinate
/// ranges, non-negative fixed-point amounts.
fn build(raw: &RawEvent, fields: Fields) -> Result<NormalizedEvent, TollHubError> {
    let plate_raw = fields
        .plate
        .ok_or_else(|| validation("plate", "missing"))?;
    let plate = canonicalize_plate(&plate_raw)
        .map_err(|e| validation("plate", e.to_string()))?;
    let state_raw = fields
        .plate_state
        .ok_or_else(|| validation("plate_state", "missing"))?;
    let plate_state = canonicalize_plate_state(&state_raw)
        .map_err(|e| validation("plate_state", e.to_string()))?;

    let event_timestamp = parse_timestamp(
        fields.timestamp.as_ref().ok_or_else(|| validation("event_timestamp", "missing"))?,
    )?;

    let raw_amount = parse_amount(
        fields.amount.as_ref().ok_or_else(|| validation("raw_amount", "missing"))?,
        "raw_amount",
    )?;
    let fees = match fields.fees.as_ref() {
        Some(value) => parse_amount(value, "fees")?,
        None => Decimal::ZERO,
    };

    let location = match (fields.lat, fields.lon) {
        (Some(lat), Some(lon)) => {
            let point = GeoPoint {
                lat,
                lon,
                direction: fields.direction,
                road_name: fields.road_name,
            };
            if !point.is_valid() {
                return Err(validation("location", format!("out of range: {lat},{lon}")));
            }
            Some(point)
        }
        _ => None,
    };

    Ok(NormalizedEvent {
        normalized_id: Uuid::new_v4(),
        agency_id: raw.agency_id.clone(),
        external_event_id: raw.event_id.clone(),
        plate,
        plate_state,
        event_timestamp,
        gantry_id: fields.gantry_id,
        location,
        vehicle_class: fields.vehicle_class,
        raw_amount,
        fees,
        currency: fields.currency.unwrap_or_else(|| "USD".to_string()),
        evidence_uri: fields.evidence_uri,
        source: raw.source,
        schema_version: SCHEMA_VERSION.to_string(),
    })
}

fn validation(field: &str, message: impl Into<String>) -> TollHubError {
    TollHubError::Validation { field: field.to_string(), message: message.into() }
}

fn str_field(payload: &serde_json::Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| payload.get(*k))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn num_field(payload: &serde_json::Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| payload.get(*k)).and_then(|v| v.as_f64())
}

/// RFC3339 string or epoch seconds, parsed to a UTC instant.
fn parse_timestamp(value: &serde_json::Value) -> Result<DateTime<Utc>, TollHubError> {
    match value {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| validation("event_timestamp", format!("{s:?}: {e}"))),
        serde_json::Value::Number(n) => {
            let secs = n.as_i64().ok_or_else(|| validation("event_timestamp", "not an i64"))?;
            Utc.timestamp_opt(secs, 0)
                .single()
                .ok_or_else(|| validation("event_timestamp", format!("bad epoch {secs}")))
        }
        other => Err(validation("event_timestamp", format!("unexpected {other:?}"))),
    }
}

/// Fixed-point, non-negative. Strings parse exactly; JSON numbers go
/// through their decimal rendering to avoid float drift.
fn parse_amount(value: &serde_json::Value, field: &str) -> Result<Decimal, TollHubError> {
    let amount = match value {
        serde_json::Value::String(s) => {
            Decimal::from_str(s.trim()).map_err(|e| validation(field, format!("{s:?}: {e}")))?
        }
        serde_json::Value::Number(n) => Decimal::from_str(&n.to_string())
            .map_err(|e| validation(field, format!("{n}: {e}")))?,
        other => return Err(validation(field, format!("unexpected {other:?}"))),
    };
    if amount < Decimal::ZERO {
        return Err(validation(field, format!("negative amount {amount}")));
    }
    Ok(amount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryDedupStore;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use std::time::Duration;

    fn raw(agency: &str, event_id: &str, payload: serde_json::Value) -> RawEvent {
        RawEvent {
            event_id: event_id.into(),
            agency_id: AgencyId::new(agency),
            received_at: Utc::now(),
            source: crate::domain::EventSource::AgencyFeed,
            payload,
        }
    }

    fn etoll_payload() -> serde_json::Value {
        json!({
            "licensePlate": "abc 123",
            "plateState": "ca",
            "timestamp": "2025-03-10T14:22:00Z",
            "amount": "4.50",
            "currency": "USD",
            "plaza": "P-17"
        })
    }

    #[test]
    fn etoll_mapping_canonicalizes() {
        let event = map_etoll(&raw("etoll", "e1", etoll_payload())).unwrap();
        assert_eq!(event.plate, "ABC123");
        assert_eq!(event.plate_state, "CA");
        assert_eq!(event.raw_amount, dec!(4.50));
        assert_eq!(event.fees, dec!(0));
        assert_eq!(event.gantry_id.as_deref(), Some("P-17"));
        assert_eq!(event.event_timestamp.to_rfc3339(), "2025-03-10T14:22:00+00:00");
        assert_eq!(event.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn fasttrack_nested_charge_and_location() {
        let payload = json!({
            "plateNumber": "XYZ-999",
            "plateIssuer": "ny",
            "eventTime": "2025-03-10T09:00:00-04:00",
            "charge": {"amount": 2.25, "fees": "0.10", "currency": "USD"},
            "location": {"lat": 40.7, "lng": -74.0, "road": "I-95"},
            "gantryRef": "G42"
        });
        let event = map_fasttrack(&raw("fasttrack", "f1", payload)).unwrap();
        assert_eq!(event.plate, "XYZ999");
        assert_eq!(event.plate_state, "NY");
        assert_eq!(event.raw_amount, dec!(2.25));
        assert_eq!(event.fees, dec!(0.10));
        assert_eq!(event.location.as_ref().unwrap().road_name.as_deref(), Some("I-95"));
        // -04:00 local converts to UTC
        assert_eq!(event.event_timestamp.to_rfc3339(), "2025-03-10T13:00:00+00:00");
    }

    #[test]
    fn out_of_range_coordinates_fail() {
        let mut payload = etoll_payload();
        payload["latitude"] = json!(123.0);
        payload["longitude"] = json!(10.0);
        let err = map_etoll(&raw("etoll", "e1", payload)).unwrap_err();
        assert!(matches!(err, TollHubError::Validation { ref field, .. } if field == "location"));
    }

    #[test]
    fn negative_amount_fails() {
        let mut payload = etoll_payload();
        payload["amount"] = json!("-1.00");
        let err = map_etoll(&raw("etoll", "e1", payload)).unwrap_err();
        assert!(matches!(err, TollHubError::Validation { ref field, .. } if field == "raw_amount"));
    }

    #[test]
    fn missing_plate_fails() {
        let mut payload = etoll_payload();
        payload.as_object_mut().unwrap().remove("licensePlate");
        let err = map_etoll(&raw("etoll", "e1", payload)).unwrap_err();
        assert!(matches!(err, TollHubError::Validation { ref field, .. } if field == "plate"));
    }

    #[test]
    fn epoch_timestamps_accepted() {
        let mut payload = etoll_payload();
        payload["timestamp"] = json!(1_741_616_520);
        let event = map_etoll(&raw("etoll", "e1", payload)).unwrap();
        assert_eq!(event.event_timestamp.timestamp(), 1_741_616_520);
    }

    #[tokio::test]
    async fn stage_suppresses_duplicates_and_publishes_once() {
        let bus = EventBus::new(&Default::default());
        let stage = NormalizerStage::new(
            Arc::new(InMemoryDedupStore::new(7)),
            MapperRegistry::with_builtins(),
            bus.clone(),
            Arc::new(PipelineMetrics::default()),
        );

        let raw_event = raw("etoll", "e1", etoll_payload());
        let headers = MessageHeaders::new("raw_event", "connector:etoll");
        let message = Message::encode(headers, "etoll", &raw_event).unwrap();
        let delivery =
            Delivery { topic: topics::RAW.into(), partition: 0, offset: 0, message };

        stage.handle(&delivery).await.unwrap();
        // Same raw event delivered again (at-least-once): acked, no publish.
        stage.handle(&delivery).await.unwrap();
        assert_eq!(bus.depth(topics::NORMALIZED), 1);

        let sub = bus.subscribe("probe", topics::NORMALIZED).unwrap();
        let d = sub.poll(Duration::from_millis(100)).await.unwrap().unwrap();
        assert_eq!(d.message.key, "ABC123|CA");
        let normalized: NormalizedEvent = d.message.decode().unwrap();
        assert_eq!(normalized.external_event_id, "e1");
    }

    #[tokio::test]
    async fn unknown_agency_is_permanent() {
        let bus = EventBus::new(&Default::default());
        let stage = NormalizerStage::new(
            Arc::new(InMemoryDedupStore::new(7)),
            MapperRegistry::with_builtins(),
            bus.clone(),
            Arc::new(PipelineMetrics::default()),
        );
        let raw_event = raw("ghost", "g1", etoll_payload());
        let headers = MessageHeaders::new("raw_event", "connector:ghost");
        let message = Message::encode(headers, "ghost", &raw_event).unwrap();
        let delivery =
            Delivery { topic: topics::RAW.into(), partition: 0, offset: 0, message };
        let err = stage.handle(&delivery).await.unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(err.class(), "UnknownAgency");
    }
}
