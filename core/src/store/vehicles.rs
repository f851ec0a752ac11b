//! Vehicle catalog read model.
//!
//! Mirrors the identity service's vehicle registry. Upserts arrive on the
//! vehicle-updates topic; the matcher queries by plate, by state, and by
//! last-seen window.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::domain::Vehicle;

pub trait VehicleCatalog: Send + Sync {
    /// Active vehicles with this exact canonical plate and state.
    fn find_by_plate(&self, plate: &str, plate_state: &str) -> Vec<Vehicle>;

    /// Active vehicles registered in a state; fuzzy-match candidate pool.
    fn find_by_state(&self, plate_state: &str) -> Vec<Vehicle>;

    /// Active vehicles whose `last_seen` falls within `[start, end]`.
    fn seen_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Vehicle>;

    fn upsert(&self, vehicle: Vehicle);

    fn get(&self, id: &str) -> Option<Vehicle>;
}

#[derive(Default)]
pub struct InMemoryVehicleCatalog {
    vehicles: RwLock<HashMap<String, Vehicle>>,
}

impl InMemoryVehicleCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VehicleCatalog for InMemoryVehicleCatalog {
    fn find_by_plate(&self, plate: &str, plate_state: &str) -> Vec<Vehicle> {
        self.vehicles
            .read()
            .values()
            .filter(|v| v.active && v.plate == plate && v.plate_state == plate_state)
            .cloned()
            .collect()
    }

    fn find_by_state(&self, plate_state: &str) -> Vec<Vehicle> {
        self.vehicles
            .read()
            .values()
            .filter(|v| v.active && v.plate_state == plate_state)
            .cloned()
            .collect()
    }

    fn seen_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Vehicle> {
        self.vehicles
            .read()
            .values()
            .filter(|v| {
                v.active
                    && v.last_seen.map(|seen| seen >= start && seen <= end).unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    fn upsert(&self, vehicle: Vehicle) {
        self.vehicles.write().insert(vehicle.id.clone(), vehicle);
    }

    fn get(&self, id: &str) -> Option<Vehicle> {
        self.vehicles.read().get(id).cloned()
    }
}
