//! Matching stage.
//!
//! Resolves a normalized event to `(user_id, vehicle_id)`: exact plate,
//! then fuzzy plate (Levenshtein <= 2 within the state), then
//! time-and-location against recent sightings. The first strategy whose
//! confidence clears the threshold wins; anything else queues for manual
//! review. Exact lookups go through a write-through cache invalidated by
//! identity-service vehicle updates.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::rater::Rater;
use super::stage::StageHandler;
use crate::bus::{topics, Delivery, EventBus, Message, MessageHeaders};
use crate::config::MatcherConfig;
use crate::domain::{
    EventStatus, MatchResult, MatchType, NormalizedEvent, TollEvent, Vehicle,
};
use crate::error::TollHubError;
use crate::health::PipelineMetrics;
use crate::store::{ManualReviewQueue, ReviewItem, VehicleCatalog};

/// Record on the matched topic: the proto toll event plus how it matched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchedRecord {
    pub toll_event: TollEvent,
    pub match_result: MatchResult,
}

/// Write-through cache of exact plate lookups, TTL'd.
pub struct PlateCache {
    entries: Mutex<HashMap<String, (Vec<Vehicle>, Instant)>>,
    ttl: Duration,
}

impl PlateCache {
    pub fn new(ttl: Duration) -> Self {
        Self { entries: Mutex::new(HashMap::new()), ttl }
    }

    fn key(plate: &str, plate_state: &str) -> String {
        format!("{plate}|{plate_state}")
    }

    pub fn get(&self, plate: &str, plate_state: &str) -> Option<Vec<Vehicle>> {
        let entries = self.entries.lock();
        entries
            .get(&Self::key(plate, plate_state))
            .filter(|(_, at)| at.elapsed() <= self.ttl)
            .map(|(vehicles, _)| vehicles.clone())
    }

    pub fn put(&self, plate: &str, plate_state: &str, vehicles: Vec<Vehicle>) {
        self.entries
            .lock()
            .insert(Self::key(plate, plate_state), (vehicles, Instant::now()));
    }

    /// Drop entries touching this vehicle (by plate key and by id, covering
    /// plate changes).
    pub fn invalidate_vehicle(&self, vehicle: &Vehicle) {
        let mut entries = self.entries.lock();
        entries.remove(&Self::key(&vehicle.plate, &vehicle.plate_state));
        entries.retain(|_, (vehicles, _)| !vehicles.iter().any(|v| v.id == vehicle.id));
    }
}

/// Outcome of the strategy chain.
pub enum MatchOutcome {
    Matched { vehicle: Vehicle, result: MatchResult },
    ManualReview { item: ReviewItem },
}

pub struct Matcher {
    catalog: Arc<dyn VehicleCatalog>,
    cache: Arc<PlateCache>,
    config: MatcherConfig,
}

impl Matcher {
    pub fn new(catalog: Arc<dyn VehicleCatalog>, cache: Arc<PlateCache>, config: MatcherConfig) -> Self {
        Self { catalog, cache, config }
    }

    pub fn match_event(&self, event: &NormalizedEvent) -> MatchOutcome {
        if let Some(outcome) = self.exact_match(event) {
            return outcome;
        }
        let (fuzzy_outcome, best_fuzzy) = self.fuzzy_match(event);
        if let Some(outcome) = fuzzy_outcome {
            return outcome;
        }
        let (time_outcome, best_time) = self.time_location_match(event);
        if let Some(outcome) = time_outcome {
            return outcome;
        }

        let (best_candidate, fuzzy_confidence) = best_fuzzy
            .map(|(v, c)| (Some(v.id), c))
            .unwrap_or((None, 0.0));
        MatchOutcome::ManualReview {
            item: ReviewItem {
                id: Uuid::new_v4(),
                normalized_event: event.clone(),
                reason: "no strategy reached the confidence threshold".into(),
                best_candidate,
                fuzzy_confidence,
                time_confidence: best_time,
                priority: 5,
                created_at: Utc::now(),
            },
        }
    }

    /// Strategy 1: exact canonical plate + state. Multiple active hits pick
    /// the most recently seen vehicle and flag the ambiguity.
    fn exact_match(&self, event: &NormalizedEvent) -> Option<MatchOutcome> {
        let vehicles = match self.cache.get(&event.plate, &event.plate_state) {
            Some(cached) => cached,
            None => {
                let loaded = self.catalog.find_by_plate(&event.plate, &event.plate_state);
                self.cache.put(&event.plate, &event.plate_state, loaded.clone());
                loaded
            }
        };
        if vehicles.is_empty() {
            return None;
        }
        let mut notes = Vec::new();
        let vehicle = if vehicles.len() == 1 {
            vehicles.into_iter().next().expect("len checked")
        } else {
            notes.push(format!("multi_match: {} active vehicles share plate", vehicles.len()));
            log::warn!(
                "multi_match on {}|{}: {} active vehicles",
                event.plate,
                event.plate_state,
                vehicles.len()
            );
            vehicles
                .into_iter()
                .max_by_key(|v| v.recency_key())
                .expect("non-empty")
        };
        let result = MatchResult {
            matched: true,
            user_id: Some(vehicle.user_id.clone()),
            vehicle_id: Some(vehicle.id.clone()),
            confidence: 1.0,
            match_type: MatchType::Exact,
            notes,
        };
        Some(MatchOutcome::Matched { vehicle, result })
    }

    /// Strategy 2: Levenshtein distance <= 2 within the same state. Returns
    /// the best sub-threshold candidate too, for the review queue.
    fn fuzzy_match(&self, event: &NormalizedEvent) -> (Option<MatchOutcome>, Option<(Vehicle, f64)>) {
        let mut best: Option<(Vehicle, f64)> = None;
        for candidate in self.catalog.find_by_state(&event.plate_state) {
            let distance = strsim::levenshtein(&candidate.plate, &event.plate);
            if distance > 2 {
                continue;
            }
            let score = fuzzy_score(&event.plate, &candidate.plate);
            let better = match &best {
                None => true,
                Some((current, current_score)) => {
                    score > *current_score
                        || (score == *current_score
                            && (candidate.recency_key() > current.recency_key()
                                || (candidate.recency_key() == current.recency_key()
                                    && candidate.plate < current.plate)))
                }
            };
            if better {
                best = Some((candidate, score));
            }
        }

        match best {
            Some((vehicle, score)) if score >= self.config.fuzzy_threshold => {
                let result = MatchResult {
                    matched: true,
                    user_id: Some(vehicle.user_id.clone()),
                    vehicle_id: Some(vehicle.id.clone()),
                    confidence: score,
                    match_type: MatchType::Fuzzy,
                    notes: vec![format!("fuzzy plate match on {}", vehicle.plate)],
                };
                (Some(MatchOutcome::Matched { vehicle, result }), None)
            }
            other => (None, other),
        }
    }

    /// Strategy 3: sightings within the time window, close enough on the
    /// great circle. Both subscores must clear 0.5; the average must clear
    /// the match threshold.
    fn time_location_match(&self, event: &NormalizedEvent) -> (Option<MatchOutcome>, f64) {
        let Some(event_location) = &event.location else {
            return (None, 0.0);
        };
        let window = ChronoDuration::minutes(self.config.time_window_minutes);
        let window_seconds = window.num_seconds() as f64;
        let candidates = self
            .catalog
            .seen_between(event.event_timestamp - window, event.event_timestamp + window);

        let mut best: Option<(Vehicle, f64)> = None;
        let mut best_time_conf = 0.0f64;
        for candidate in candidates {
            let (Some(last_seen), Some(last_location)) =
                (candidate.last_seen, candidate.last_location.clone())
            else {
                continue;
            };
            let dt = (event.event_timestamp - last_seen).num_seconds().abs() as f64;
            let time_conf = (1.0 - dt / window_seconds).max(0.0);
            let meters = event_location.haversine_meters(&last_location);
            let loc_conf = (1.0 - meters / self.config.distance_meters).max(0.0);
            best_time_conf = best_time_conf.max(time_conf);
            if time_conf < 0.5 || loc_conf < 0.5 {
                continue;
            }
            let score = (time_conf + loc_conf) / 2.0;
            if best.as_ref().map(|(_, s)| score > *s).unwrap_or(true) {
                best = Some((candidate, score));
            }
        }

        match best {
            Some((vehicle, score)) if score >= self.config.fuzzy_threshold => {
                let result = MatchResult {
                    matched: true,
                    user_id: Some(vehicle.user_id.clone()),
                    vehicle_id: Some(vehicle.id.clone()),
                    confidence: score,
                    match_type: MatchType::TimeBased,
                    notes: vec!["matched on recent sighting near the gantry".into()],
                };
                (Some(MatchOutcome::Matched { vehicle, result }), best_time_conf)
            }
            _ => (None, best_time_conf),
        }
    }
}

/// `1 - distance / max(len)`; never increases with distance.
pub(crate) fn fuzzy_score(plate: &str, candidate: &str) -> f64 {
    let distance = strsim::levenshtein(plate, candidate);
    let max_len = plate.len().max(candidate.len()).max(1);
    1.0 - distance as f64 / max_len as f64
}

/// Bus stage: match, rate, publish the proto toll event downstream.
pub struct MatcherStage {
    matcher: Matcher,
    rater: Arc<Rater>,
    review: Arc<dyn ManualReviewQueue>,
    bus: EventBus,
    metrics: Arc<PipelineMetrics>,
}

impl MatcherStage {
    pub fn new(
        matcher: Matcher,
        rater: Arc<Rater>,
        review: Arc<dyn ManualReviewQueue>,
        bus: EventBus,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self { matcher, rater, review, bus, metrics }
    }
}

#[async_trait]
impl StageHandler for MatcherStage {
    fn stage_name(&self) -> &'static str {
        "matcher"
    }

    async fn handle(&self, delivery: &Delivery) -> Result<(), TollHubError> {
        let event: NormalizedEvent = delivery.message.decode()?;
        match self.matcher.match_event(&event) {
            MatchOutcome::ManualReview { item } => {
                log::info!(
                    "queueing {}|{} for manual review ({})",
                    event.plate,
                    event.plate_state,
                    item.reason
                );
                self.review.enqueue(item);
                PipelineMetrics::incr(&self.metrics.manual_review_queued);
                Ok(())
            }
            MatchOutcome::Matched { vehicle, result } => {
                let vehicle_class = event
                    .vehicle_class
                    .clone()
                    .or_else(|| vehicle.class.clone())
                    .unwrap_or_else(|| "standard".to_string());
                let rated_amount = self.rater.rate(&event, &vehicle_class);
                let now = Utc::now();
                // Toll event id derives from the normalized id, so a
                // redelivered normalized event republishes under the same
                // message id and the broker drops the duplicate.
                let toll_event = TollEvent {
                    id: Uuid::new_v5(&Uuid::NAMESPACE_OID, event.normalized_id.as_bytes()),
                    user_id: vehicle.user_id.clone(),
                    vehicle_id: vehicle.id.clone(),
                    agency_id: event.agency_id.clone(),
                    external_event_id: event.external_event_id.clone(),
                    plate: event.plate.clone(),
                    plate_state: event.plate_state.clone(),
                    event_timestamp: event.event_timestamp,
                    gantry_id: event.gantry_id.clone(),
                    location: event.location.clone(),
                    vehicle_class,
                    raw_amount: event.raw_amount,
                    rated_amount,
                    fees: event.fees,
                    currency: event.currency.clone(),
                    evidence_uri: event.evidence_uri.clone(),
                    source: event.source,
                    status: EventStatus::Pending,
                    late_arrival: false,
                    created_at: now,
                    updated_at: now,
                };
                let record = MatchedRecord { toll_event, match_result: result };
                let headers = MessageHeaders::new("matched_event", "stage:matcher")
                    .with_correlation(delivery.message.headers.correlation_id)
                    .with_message_id(record.toll_event.id);
                let message =
                    Message::encode(headers, record.toll_event.user_id.clone(), &record)?;
                self.bus.publish(topics::MATCHED, message)?;
                PipelineMetrics::incr(&self.metrics.events_matched);
                Ok(())
            }
        }
    }
}

/// Consumes identity-service vehicle upserts: refresh the catalog, drop
/// affected cache entries.
pub struct VehicleUpdateStage {
    catalog: Arc<dyn VehicleCatalog>,
    cache: Arc<PlateCache>,
}

impl VehicleUpdateStage {
    pub fn new(catalog: Arc<dyn VehicleCatalog>, cache: Arc<PlateCache>) -> Self {
        Self { catalog, cache }
    }
}

#[async_trait]
impl StageHandler for VehicleUpdateStage {
    fn stage_name(&self) -> &'static str {
        "vehicle-updates"
    }

    async fn handle(&self, delivery: &Delivery) -> Result<(), TollHubError> {
        let vehicle: Vehicle = delivery.message.decode()?;
        self.cache.invalidate_vehicle(&vehicle);
        self.catalog.upsert(vehicle);
        Ok(())
    }
}
