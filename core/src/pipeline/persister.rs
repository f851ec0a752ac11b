//! Persister and statement aggregator.
//!
//! The only strongly consistent step in the pipeline. Per matched event:
//! insert the canonical toll event (unique violation = latent duplicate =
//! success), upsert the user's statement draft for the period under
//! optimistic concurrency, and let everything upstream stay re-drivable.
//! Period close freezes the draft into an immutable statement; dispute
//! status changes arrive on their own topic and closed periods absorb them
//! as compensating credits in the next statement.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::matcher::MatchedRecord;
use super::stage::StageHandler;
use crate::bus::{topics, Delivery, EventBus, Message, MessageHeaders};
use crate::domain::{
    BillingPeriod, EventStatus, PeriodConfig, Statement, StatementLineItem, TimezoneSource,
    TollEvent,
};
use crate::error::TollHubError;
use crate::health::PipelineMetrics;
use crate::store::{InsertOutcome, StatementStore, TollEventStore, UserDirectory};

/// Bounded optimistic-concurrency retries on draft upserts.
const OCC_RETRIES: u32 = 5;

fn resolve_timezone(
    config: &PeriodConfig,
    users: &dyn UserDirectory,
    user_id: &str,
) -> Tz {
    match config.timezone_source {
        TimezoneSource::Utc => chrono_tz::UTC,
        TimezoneSource::User => users.timezone(user_id).unwrap_or(chrono_tz::UTC),
    }
}

/// The open period the event belongs to. Walking past closed periods marks
/// the event as a late arrival.
fn resolve_open_period(
    statements: &dyn StatementStore,
    config: &PeriodConfig,
    tz: Tz,
    user_id: &str,
    event_timestamp: DateTime<Utc>,
) -> (BillingPeriod, bool) {
    let mut period = BillingPeriod::containing(event_timestamp, tz, config);
    let mut late = false;
    while statements.is_closed(user_id, period.start) {
        late = true;
        period = period.next(config);
    }
    (period, late)
}

pub struct PersisterStage {
    events: Arc<dyn TollEventStore>,
    statements: Arc<dyn StatementStore>,
    users: Arc<dyn UserDirectory>,
    period_config: PeriodConfig,
    metrics: Arc<PipelineMetrics>,
}

impl PersisterStage {
    pub fn new(
        events: Arc<dyn TollEventStore>,
        statements: Arc<dyn StatementStore>,
        users: Arc<dyn UserDirectory>,
        period_config: PeriodConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self { events, statements, users, period_config, metrics }
    }

    /// Fold the event into its period draft, retrying version conflicts.
    fn upsert_draft(
        &self,
        event: &TollEvent,
        mut period: BillingPeriod,
    ) -> Result<(), TollHubError> {
        let mut attempts = 0;
        loop {
            let mut draft = match self.statements.load_or_new(&event.user_id, &period) {
                Ok(draft) => draft,
                Err(TollHubError::PeriodClosed { .. }) => {
                    // Closed between period resolution and here; roll over.
                    self.events.flag_late_arrival(event.id)?;
                    period = period.next(&self.period_config);
                    continue;
                }
                Err(err) => return Err(err),
            };
            if !draft.apply_event(event) {
                // Redelivery repair path: the draft already carries it.
                return Ok(());
            }
            match self.statements.save_draft(draft) {
                Ok(()) => return Ok(()),
                Err(TollHubError::VersionConflict { .. }) if attempts < OCC_RETRIES => {
                    attempts += 1;
                }
                Err(TollHubError::PeriodClosed { .. }) => {
                    self.events.flag_late_arrival(event.id)?;
                    period = period.next(&self.period_config);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl StageHandler for PersisterStage {
    fn stage_name(&self) -> &'static str {
        "persister"
    }

    async fn handle(&self, delivery: &Delivery) -> Result<(), TollHubError> {
        let record: MatchedRecord = delivery.message.decode()?;
        if !record.match_result.matched {
            return Err(TollHubError::Validation {
                field: "match_result".into(),
                message: "unmatched record on the matched topic".into(),
            });
        }

        let mut event = record.toll_event;
        // posted requires a successful match, checked above
        event.status = EventStatus::Posted;

        let tz = resolve_timezone(&self.period_config, self.users.as_ref(), &event.user_id);
        let (period, late) = resolve_open_period(
            self.statements.as_ref(),
            &self.period_config,
            tz,
            &event.user_id,
            event.event_timestamp,
        );
        event.late_arrival = late;

        match self.events.insert(event.clone())? {
            InsertOutcome::Inserted => {}
            InsertOutcome::Duplicate => {
                if self.events.get(event.id).is_none() {
                    // Same external event under a different row: a latent
                    // duplicate from another path. Done.
                    log::debug!(
                        "latent duplicate {}:{}",
                        event.agency_id,
                        event.external_event_id
                    );
                    return Ok(());
                }
                // Same row redelivered: fall through and make sure the
                // draft reflects it (repairs a crash between insert and
                // draft save). apply_event is idempotent per event id.
            }
        }

        self.upsert_draft(&event, period)?;
        PipelineMetrics::incr(&self.metrics.events_persisted);
        Ok(())
    }
}

/// Period-close command published by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateCommand {
    pub user_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

/// Freezes drafts into immutable statements on `statements.generate`.
pub struct AggregatorStage {
    events: Arc<dyn TollEventStore>,
    statements: Arc<dyn StatementStore>,
    bus: EventBus,
    metrics: Arc<PipelineMetrics>,
}

impl AggregatorStage {
    pub fn new(
        events: Arc<dyn TollEventStore>,
        statements: Arc<dyn StatementStore>,
        bus: EventBus,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self { events, statements, bus, metrics }
    }
}

#[async_trait]
impl StageHandler for AggregatorStage {
    fn stage_name(&self) -> &'static str {
        "aggregator"
    }

    async fn handle(&self, delivery: &Delivery) -> Result<(), TollHubError> {
        let command: GenerateCommand = delivery.message.decode()?;
        let draft = match self.statements.close_draft(&command.user_id, command.period_start) {
            Ok(draft) => draft,
            // Already closed (redelivered command) or never opened: done.
            Err(TollHubError::PeriodClosed { .. }) => return Ok(()),
            Err(TollHubError::NotFound { .. }) => {
                log::debug!(
                    "no draft to close for {} starting {}",
                    command.user_id,
                    command.period_start
                );
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        // Line items come straight from the draft's event id set, so the
        // statement references exactly what accumulated.
        let mut line_items = Vec::with_capacity(draft.event_ids.len());
        for event_id in &draft.event_ids {
            let Some(event) = self.events.get(*event_id) else {
                return Err(TollHubError::NotFound { entity: format!("toll_event {event_id}") });
            };
            line_items.push(StatementLineItem {
                toll_event_id: event.id,
                event_timestamp: event.event_timestamp,
                rated_amount: event.rated_amount,
                fees: event.fees,
                description: format!(
                    "{} toll at {}",
                    event.agency_id,
                    event.gantry_id.as_deref().unwrap_or("unknown gantry")
                ),
            });
        }

        let statement = Statement::from_draft(&draft, line_items);
        self.statements.put_statement(statement.clone())?;

        let headers = MessageHeaders::new("statement_closed", "stage:aggregator")
            .with_correlation(delivery.message.headers.correlation_id)
            .with_message_id(statement.id);
        let message = Message::encode(headers, statement.user_id.clone(), &statement)?;
        self.bus.publish(topics::STATEMENTS_CLOSED, message)?;
        PipelineMetrics::incr(&self.metrics.statements_closed);
        log::info!(
            "closed statement {} for {} ({} line items, total {})",
            statement.id,
            statement.user_id,
            statement.line_items.len(),
            statement.total
        );
        Ok(())
    }
}

/// Dispute-service status transition for a persisted toll event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub toll_event_id: Uuid,
    pub status: EventStatus,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Applies dispute-service transitions. A void against a still-open period
/// backs the event out of its draft; against a closed period it becomes a
/// compensating credit on the next open draft, never touching the closed
/// statement.
pub struct StatusFeedStage {
    events: Arc<dyn TollEventStore>,
    statements: Arc<dyn StatementStore>,
    users: Arc<dyn UserDirectory>,
    period_config: PeriodConfig,
}

impl StatusFeedStage {
    pub fn new(
        events: Arc<dyn TollEventStore>,
        statements: Arc<dyn StatementStore>,
        users: Arc<dyn UserDirectory>,
        period_config: PeriodConfig,
    ) -> Self {
        Self { events, statements, users, period_config }
    }

    fn apply_void(&self, event: &TollEvent) -> Result<(), TollHubError> {
        let tz = resolve_timezone(&self.period_config, self.users.as_ref(), &event.user_id);
        let event_period =
            BillingPeriod::containing(event.event_timestamp, tz, &self.period_config);

        if !self.statements.is_closed(&event.user_id, event_period.start) {
            // Period still open: remove the event from its draft.
            let mut attempts = 0;
            loop {
                let mut draft = self.statements.load_or_new(&event.user_id, &event_period)?;
                if !draft.remove_event(event) {
                    return Ok(());
                }
                match self.statements.save_draft(draft) {
                    Ok(()) => return Ok(()),
                    Err(TollHubError::VersionConflict { .. }) if attempts < OCC_RETRIES => {
                        attempts += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        // Closed period: compensate on the current open draft.
        let (current_period, _) = resolve_open_period(
            self.statements.as_ref(),
            &self.period_config,
            tz,
            &event.user_id,
            Utc::now(),
        );
        let credit = event.rated_amount + event.fees;
        let mut attempts = 0;
        loop {
            let mut draft = self.statements.load_or_new(&event.user_id, &current_period)?;
            draft.apply_credit(credit);
            match self.statements.save_draft(draft) {
                Ok(()) => return Ok(()),
                Err(TollHubError::VersionConflict { .. }) if attempts < OCC_RETRIES => {
                    attempts += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl StageHandler for StatusFeedStage {
    fn stage_name(&self) -> &'static str {
        "status-feed"
    }

    async fn handle(&self, delivery: &Delivery) -> Result<(), TollHubError> {
        let update: StatusUpdate = delivery.message.decode()?;
        let event = self.events.get(update.toll_event_id).ok_or_else(|| {
            TollHubError::NotFound { entity: format!("toll_event {}", update.toll_event_id) }
        })?;

        self.events.update_status(update.toll_event_id, update.status)?;
        if update.status == EventStatus::Voided {
            self.apply_void(&event)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AgencyId, EventSource, MatchResult, MatchType};
    use crate::store::{
        InMemoryStatementStore, InMemoryTollEventStore, InMemoryUserDirectory,
    };
    use rust_decimal_macros::dec;

    fn toll_event(external_id: &str, ts: &str, amount: rust_decimal::Decimal) -> TollEvent {
        let now = Utc::now();
        TollEvent {
            id: Uuid::new_v4(),
            user_id: "u7".into(),
            vehicle_id: "v1".into(),
            agency_id: AgencyId::new("etoll"),
            external_event_id: external_id.into(),
            plate: "ABC123".into(),
            plate_state: "CA".into(),
            event_timestamp: ts.parse().unwrap(),
            gantry_id: Some("P-17".into()),
            location: None,
            vehicle_class: "2-axle".into(),
            raw_amount: amount,
            rated_amount: amount,
            fees: dec!(0.00),
            currency: "USD".into(),
            evidence_uri: None,
            source: EventSource::AgencyFeed,
            status: EventStatus::Pending,
            late_arrival: false,
            created_at: now,
            updated_at: now,
        }
    }

    fn matched(event: TollEvent) -> MatchedRecord {
        MatchedRecord {
            toll_event: event,
            match_result: MatchResult {
                matched: true,
                user_id: Some("u7".into()),
                vehicle_id: Some("v1".into()),
                confidence: 1.0,
                match_type: MatchType::Exact,
                notes: vec![],
            },
        }
    }

    struct Fixture {
        events: Arc<InMemoryTollEventStore>,
        statements: Arc<InMemoryStatementStore>,
        users: Arc<InMemoryUserDirectory>,
        bus: EventBus,
        persister: PersisterStage,
        aggregator: AggregatorStage,
    }

    fn fixture() -> Fixture {
        let events = Arc::new(InMemoryTollEventStore::new());
        let statements = Arc::new(InMemoryStatementStore::new());
        let users = Arc::new(InMemoryUserDirectory::new());
        let bus = EventBus::new(&Default::default());
        let metrics = Arc::new(PipelineMetrics::default());
        let persister = PersisterStage::new(
            events.clone(),
            statements.clone(),
            users.clone(),
            PeriodConfig::default(),
            metrics.clone(),
        );
        let aggregator =
            AggregatorStage::new(events.clone(), statements.clone(), bus.clone(), metrics);
        Fixture { events, statements, users, bus, persister, aggregator }
    }

    fn delivery_for<T: Serialize>(topic: &str, key: &str, value: &T) -> Delivery {
        let headers = MessageHeaders::new("test", "test");
        let message = Message::encode(headers, key, value).unwrap();
        Delivery { topic: topic.into(), partition: 0, offset: 0, message }
    }

    #[tokio::test]
    async fn persists_and_accumulates() {
        let f = fixture();
        let record = matched(toll_event("e1", "2025-03-10T14:22:00Z", dec!(4.50)));
        f.persister
            .handle(&delivery_for(topics::MATCHED, "u7", &record))
            .await
            .unwrap();

        assert_eq!(f.events.count(), 1);
        let stored = f.events.get(record.toll_event.id).unwrap();
        assert_eq!(stored.status, EventStatus::Posted);

        let period = BillingPeriod::containing(
            "2025-03-10T00:00:00Z".parse().unwrap(),
            chrono_tz::UTC,
            &PeriodConfig::default(),
        );
        let draft = f.statements.load_or_new("u7", &period).unwrap();
        assert_eq!(draft.subtotal, dec!(4.50));
        assert_eq!(draft.event_ids.len(), 1);
    }

    #[tokio::test]
    async fn redelivery_is_idempotent() {
        let f = fixture();
        let record = matched(toll_event("e1", "2025-03-10T14:22:00Z", dec!(4.50)));
        let delivery = delivery_for(topics::MATCHED, "u7", &record);
        f.persister.handle(&delivery).await.unwrap();
        f.persister.handle(&delivery).await.unwrap();

        assert_eq!(f.events.count(), 1);
        let period = BillingPeriod::containing(
            "2025-03-10T00:00:00Z".parse().unwrap(),
            chrono_tz::UTC,
            &PeriodConfig::default(),
        );
        let draft = f.statements.load_or_new("u7", &period).unwrap();
        assert_eq!(draft.subtotal, dec!(4.50));
    }

    #[tokio::test]
    async fn close_freezes_and_late_event_rolls_over() {
        let f = fixture();
        let record = matched(toll_event("e1", "2025-03-10T14:22:00Z", dec!(4.50)));
        f.persister
            .handle(&delivery_for(topics::MATCHED, "u7", &record))
            .await
            .unwrap();

        let period = BillingPeriod::containing(
            "2025-03-10T00:00:00Z".parse().unwrap(),
            chrono_tz::UTC,
            &PeriodConfig::default(),
        );
        let command = GenerateCommand {
            user_id: "u7".into(),
            period_start: period.start,
            period_end: period.end,
        };
        f.aggregator
            .handle(&delivery_for(topics::STATEMENTS_GENERATE, "u7", &command))
            .await
            .unwrap();

        let statement = f.statements.statement_for_period("u7", period.start).unwrap();
        assert_eq!(statement.total, dec!(4.50));
        assert_eq!(statement.line_items.len(), 1);
        assert_eq!(f.bus.depth(topics::STATEMENTS_CLOSED), 1);

        // A second close command is a no-op.
        f.aggregator
            .handle(&delivery_for(topics::STATEMENTS_GENERATE, "u7", &command))
            .await
            .unwrap();
        assert_eq!(f.bus.depth(topics::STATEMENTS_CLOSED), 1);

        // March event arriving after the close lands in April, flagged.
        let late = matched(toll_event("e2", "2025-03-20T10:00:00Z", dec!(2.00)));
        f.persister
            .handle(&delivery_for(topics::MATCHED, "u7", &late))
            .await
            .unwrap();
        let stored = f.events.get(late.toll_event.id).unwrap();
        assert!(stored.late_arrival);
        let april = period.next(&PeriodConfig::default());
        let draft = f.statements.load_or_new("u7", &april).unwrap();
        assert_eq!(draft.subtotal, dec!(2.00));
    }

    #[tokio::test]
    async fn user_timezone_places_boundary_events() {
        let f = fixture();
        f.users.set_timezone("u7", chrono_tz::America::Los_Angeles);
        // 05:00 UTC on March 1 is still February in Los Angeles.
        let record = matched(toll_event("e1", "2025-03-01T05:00:00Z", dec!(1.00)));
        f.persister
            .handle(&delivery_for(topics::MATCHED, "u7", &record))
            .await
            .unwrap();

        let feb = BillingPeriod::containing(
            "2025-02-15T00:00:00Z".parse().unwrap(),
            chrono_tz::America::Los_Angeles,
            &PeriodConfig::default(),
        );
        let draft = f.statements.load_or_new("u7", &feb).unwrap();
        assert_eq!(draft.subtotal, dec!(1.00));
    }

    #[tokio::test]
    async fn void_in_open_period_backs_the_event_out() {
        let f = fixture();
        let record = matched(toll_event("e1", "2025-03-10T14:22:00Z", dec!(4.50)));
        f.persister
            .handle(&delivery_for(topics::MATCHED, "u7", &record))
            .await
            .unwrap();

        let stage = StatusFeedStage::new(
            f.events.clone(),
            f.statements.clone(),
            f.users.clone(),
            PeriodConfig::default(),
        );
        let update = StatusUpdate {
            toll_event_id: record.toll_event.id,
            status: EventStatus::Voided,
            reason: Some("dispute upheld".into()),
        };
        stage
            .handle(&delivery_for(topics::EVENT_STATUS, "u7", &update))
            .await
            .unwrap();

        assert_eq!(f.events.get(record.toll_event.id).unwrap().status, EventStatus::Voided);
        let period = BillingPeriod::containing(
            "2025-03-10T00:00:00Z".parse().unwrap(),
            chrono_tz::UTC,
            &PeriodConfig::default(),
        );
        let draft = f.statements.load_or_new("u7", &period).unwrap();
        assert_eq!(draft.subtotal, dec!(0.00));
        assert!(draft.event_ids.is_empty());
    }

    #[tokio::test]
    async fn unmatched_record_is_rejected() {
        let f = fixture();
        let mut record = matched(toll_event("e1", "2025-03-10T14:22:00Z", dec!(4.50)));
        record.match_result.matched = false;
        let err = f
            .persister
            .handle(&delivery_for(topics::MATCHED, "u7", &record))
            .await
            .unwrap_err();
        assert_eq!(err.class(), "ValidationError");
        assert_eq!(f.events.count(), 0);
    }
}
