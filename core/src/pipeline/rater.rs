//! Rating.
//!
//! `rated_amount = round_half_even(base_rate * time_mult * loc_mult, 2)`.
//! Rate configs are keyed by `(agency_id, gantry-or-location, vehicle
//! class)`. A missing config never blocks the pipeline: the raw amount
//! falls through unchanged and a counter records the gap.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use parking_lot::RwLock;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::domain::NormalizedEvent;
use crate::health::PipelineMetrics;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateConfig {
    pub base_rate: Decimal,
    /// Keyed `"{weekday}:{hour}"` (e.g. `mon:07`), with `"{weekday}"` and
    /// `"*"` fallbacks. Missing entries multiply by 1.
    #[serde(default)]
    pub time_multipliers: HashMap<String, Decimal>,
    /// Keyed by gantry or road name, `"*"` fallback.
    #[serde(default)]
    pub location_multipliers: HashMap<String, Decimal>,
}

pub struct Rater {
    rates: RwLock<HashMap<String, RateConfig>>,
    metrics: Arc<PipelineMetrics>,
}

impl Rater {
    pub fn new(metrics: Arc<PipelineMetrics>) -> Self {
        Self { rates: RwLock::new(HashMap::new()), metrics }
    }

    pub fn insert(&self, agency_id: &str, location_key: &str, vehicle_class: &str, config: RateConfig) {
        self.rates
            .write()
            .insert(rate_key(agency_id, location_key, vehicle_class), config);
    }

    /// Rated amount for a matched event. Lookup goes exact location first,
    /// then the agency-wide `default` entry, then falls through to the raw
    /// amount.
    pub fn rate(&self, event: &NormalizedEvent, vehicle_class: &str) -> Decimal {
        let location_key = event
            .gantry_id
            .clone()
            .or_else(|| event.location.as_ref().and_then(|l| l.road_name.clone()))
            .unwrap_or_else(|| "default".to_string());

        let rates = self.rates.read();
        let config = rates
            .get(&rate_key(event.agency_id.as_str(), &location_key, vehicle_class))
            .or_else(|| rates.get(&rate_key(event.agency_id.as_str(), "default", vehicle_class)));

        let Some(config) = config else {
            PipelineMetrics::incr(&self.metrics.missing_rate_config);
            log::debug!(
                "no rate config for {}/{}/{}, falling through to raw amount",
                event.agency_id,
                location_key,
                vehicle_class
            );
            return event.raw_amount;
        };

        let time_mult = time_multiplier(config, event.event_timestamp);
        let loc_mult = config
            .location_multipliers
            .get(&location_key)
            .or_else(|| config.location_multipliers.get("*"))
            .copied()
            .unwrap_or(Decimal::ONE);

        (config.base_rate * time_mult * loc_mult)
            .round_dp_with_strategy(2, RoundingStrategy::MidpointNearestEven)
    }
}

fn rate_key(agency_id: &str, location_key: &str, vehicle_class: &str) -> String {
    format!("{agency_id}|{location_key}|{vehicle_class}")
}

fn time_multiplier(config: &RateConfig, ts: DateTime<Utc>) -> Decimal {
    let weekday = weekday_key(ts.weekday());
    let hour_key = format!("{weekday}:{:02}", ts.hour());
    config
        .time_multipliers
        .get(&hour_key)
        .or_else(|| config.time_multipliers.get(weekday))
        .or_else(|| config.time_multipliers.get("*"))
        .copied()
        .unwrap_or(Decimal::ONE)
}

fn weekday_key(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "mon",
        Weekday::Tue => "tue",
        Weekday::Wed => "wed",
        Weekday::Thu => "thu",
        Weekday::Fri => "fri",
        Weekday::Sat => "sat",
        Weekday::Sun => "sun",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AgencyId, EventSource, SCHEMA_VERSION};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn event(ts: &str, gantry: Option<&str>) -> NormalizedEvent {
        NormalizedEvent {
            normalized_id: Uuid::new_v4(),
            agency_id: AgencyId::new("etoll"),
            external_event_id: "e1".into(),
            plate: "ABC123".into(),
            plate_state: "CA".into(),
            event_timestamp: ts.parse().unwrap(),
            gantry_id: gantry.map(String::from),
            location: None,
            vehicle_class: Some("2-axle".into()),
            raw_amount: dec!(4.50),
            fees: dec!(0.00),
            currency: "USD".into(),
            evidence_uri: None,
            source: EventSource::AgencyFeed,
            schema_version: SCHEMA_VERSION.into(),
        }
    }

    fn metrics() -> Arc<PipelineMetrics> {
        Arc::new(PipelineMetrics::default())
    }

    #[test]
    fn missing_config_falls_through_to_raw() {
        let metrics = metrics();
        let rater = Rater::new(metrics.clone());
        let rated = rater.rate(&event("2025-03-10T14:22:00Z", Some("P-17")), "2-axle");
        assert_eq!(rated, dec!(4.50));
        assert_eq!(PipelineMetrics::get(&metrics.missing_rate_config), 1);
    }

    #[test]
    fn peak_hour_multiplier_applies() {
        let rater = Rater::new(metrics());
        let mut time_multipliers = HashMap::new();
        // 2025-03-10 is a Monday; 14:00 UTC bucket at 1.5x.
        time_multipliers.insert("mon:14".to_string(), dec!(1.5));
        rater.insert(
            "etoll",
            "P-17",
            "2-axle",
            RateConfig { base_rate: dec!(3.00), time_multipliers, location_multipliers: HashMap::new() },
        );
        let rated = rater.rate(&event("2025-03-10T14:22:00Z", Some("P-17")), "2-axle");
        assert_eq!(rated, dec!(4.50));
        // Off-peak hour multiplies by 1.
        let rated = rater.rate(&event("2025-03-10T03:22:00Z", Some("P-17")), "2-axle");
        assert_eq!(rated, dec!(3.00));
    }

    #[test]
    fn rounding_is_half_even() {
        let rater = Rater::new(metrics());
        let mut time_multipliers = HashMap::new();
        time_multipliers.insert("*".to_string(), dec!(0.5));
        rater.insert(
            "etoll",
            "default",
            "2-axle",
            RateConfig { base_rate: dec!(0.05), time_multipliers, location_multipliers: HashMap::new() },
        );
        // 0.05 * 0.5 = 0.025 -> banker's rounding to 0.02, not 0.03.
        let rated = rater.rate(&event("2025-03-10T14:22:00Z", None), "2-axle");
        assert_eq!(rated, dec!(0.02));
    }

    #[test]
    fn agency_default_location_is_fallback() {
        let rater = Rater::new(metrics());
        rater.insert(
            "etoll",
            "default",
            "2-axle",
            RateConfig {
                base_rate: dec!(2.00),
                time_multipliers: HashMap::new(),
                location_multipliers: HashMap::new(),
            },
        );
        let rated = rater.rate(&event("2025-03-10T14:22:00Z", Some("unknown-gantry")), "2-axle");
        assert_eq!(rated, dec!(2.00));
    }

    #[test]
    fn location_multiplier_with_wildcard() {
        let rater = Rater::new(metrics());
        let mut location_multipliers = HashMap::new();
        location_multipliers.insert("P-17".to_string(), dec!(2.0));
        location_multipliers.insert("*".to_string(), dec!(1.0));
        rater.insert(
            "etoll",
            "P-17",
            "2-axle",
            RateConfig { base_rate: dec!(1.10), time_multipliers: HashMap::new(), location_multipliers },
        );
        let rated = rater.rate(&event("2025-03-10T14:22:00Z", Some("P-17")), "2-axle");
        assert_eq!(rated, dec!(2.20));
    }
}
