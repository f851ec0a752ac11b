//! Canonical toll event store.
//!
//! Enforces the uniqueness invariant on `(agency_id, external_event_id)`;
//! the persister treats a duplicate insert as success because the work was
//! already done by an earlier delivery.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::{EventStatus, TollEvent};
use crate::error::TollHubError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Unique violation on `(agency_id, external_event_id)`.
    Duplicate,
}

pub trait TollEventStore: Send + Sync {
    fn insert(&self, event: TollEvent) -> Result<InsertOutcome, TollHubError>;

    fn get(&self, id: Uuid) -> Option<TollEvent>;

    /// Events for one user whose timestamp falls in `[start, end)`.
    fn by_user_in_range(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<TollEvent>;

    /// Status transition, owned by the dispute service feed.
    fn update_status(&self, id: Uuid, status: EventStatus) -> Result<(), TollHubError>;

    /// Audit flag for events that landed after their period closed.
    fn flag_late_arrival(&self, id: Uuid) -> Result<(), TollHubError>;

    fn count(&self) -> usize;
}

#[derive(Default)]
pub struct InMemoryTollEventStore {
    inner: RwLock<State>,
}

#[derive(Default)]
struct State {
    events: HashMap<Uuid, TollEvent>,
    /// Unique index: dedup key -> event id.
    by_external: HashMap<String, Uuid>,
}

impl InMemoryTollEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TollEventStore for InMemoryTollEventStore {
    fn insert(&self, event: TollEvent) -> Result<InsertOutcome, TollHubError> {
        let mut state = self.inner.write();
        let key = event.dedup_key();
        if state.by_external.contains_key(&key) {
            return Ok(InsertOutcome::Duplicate);
        }
        state.by_external.insert(key, event.id);
        state.events.insert(event.id, event);
        Ok(InsertOutcome::Inserted)
    }

    fn get(&self, id: Uuid) -> Option<TollEvent> {
        self.inner.read().events.get(&id).cloned()
    }

    fn by_user_in_range(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<TollEvent> {
        let state = self.inner.read();
        let mut events: Vec<TollEvent> = state
            .events
            .values()
            .filter(|e| {
                e.user_id == user_id && e.event_timestamp >= start && e.event_timestamp < end
            })
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.event_timestamp, e.id));
        events
    }

    fn update_status(&self, id: Uuid, status: EventStatus) -> Result<(), TollHubError> {
        let mut state = self.inner.write();
        let event = state
            .events
            .get_mut(&id)
            .ok_or_else(|| TollHubError::NotFound { entity: format!("toll_event {id}") })?;
        event.status = status;
        event.updated_at = Utc::now();
        Ok(())
    }

    fn flag_late_arrival(&self, id: Uuid) -> Result<(), TollHubError> {
        let mut state = self.inner.write();
        let event = state
            .events
            .get_mut(&id)
            .ok_or_else(|| TollHubError::NotFound { entity: format!("toll_event {id}") })?;
        event.late_arrival = true;
        event.updated_at = Utc::now();
        Ok(())
    }

    fn count(&self) -> usize {
        self.inner.read().events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AgencyId, EventSource};
    use rust_decimal_macros::dec;

    fn event(external_id: &str) -> TollEvent {
        let now = Utc::now();
        TollEvent {
            id: Uuid::new_v4(),
            user_id: "u7".into(),
            vehicle_id: "v1".into(),
            agency_id: AgencyId::new("etoll"),
            external_event_id: external_id.into(),
            plate: "ABC123".into(),
            plate_state: "CA".into(),
            event_timestamp: "2025-03-10T14:22:00Z".parse().unwrap(),
            gantry_id: None,
            location: None,
            vehicle_class: "2-axle".into(),
            raw_amount: dec!(4.50),
            rated_amount: dec!(4.50),
            fees: dec!(0.00),
            currency: "USD".into(),
            evidence_uri: None,
            source: EventSource::AgencyFeed,
            status: EventStatus::Posted,
            late_arrival: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn unique_violation_reports_duplicate() {
        let store = InMemoryTollEventStore::new();
        assert_eq!(store.insert(event("e1")).unwrap(), InsertOutcome::Inserted);
        // Same (agency, external id), different row id.
        assert_eq!(store.insert(event("e1")).unwrap(), InsertOutcome::Duplicate);
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn range_query_is_half_open_and_ordered() {
        let store = InMemoryTollEventStore::new();
        let mut early = event("e1");
        early.event_timestamp = "2025-03-01T00:00:00Z".parse().unwrap();
        let mut late = event("e2");
        late.event_timestamp = "2025-03-20T00:00:00Z".parse().unwrap();
        store.insert(late).unwrap();
        store.insert(early).unwrap();

        let found = store.by_user_in_range(
            "u7",
            "2025-03-01T00:00:00Z".parse().unwrap(),
            "2025-03-20T00:00:00Z".parse().unwrap(),
        );
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].external_event_id, "e1");
    }

    #[test]
    fn status_update_touches_updated_at() {
        let store = InMemoryTollEventStore::new();
        let e = event("e1");
        let id = e.id;
        store.insert(e).unwrap();
        store.update_status(id, EventStatus::Disputed).unwrap();
        assert_eq!(store.get(id).unwrap().status, EventStatus::Disputed);
        assert!(store.update_status(Uuid::new_v4(), EventStatus::Voided).is_err());
    }
}
