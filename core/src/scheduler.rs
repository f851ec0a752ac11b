//! Period-close scheduler.
//!
//! Ticks over the open drafts and publishes a `statements.generate`
//! command once a draft's period end (plus grace) has passed. Command
//! message ids derive from `(user_id, period_start)`, so a command
//! re-published on the next tick is dropped by the broker until the
//! aggregator closes the draft.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::{topics, EventBus, Message, MessageHeaders};
use crate::domain::PeriodConfig;
use crate::error::TollHubError;
use crate::pipeline::GenerateCommand;
use crate::store::StatementStore;

pub struct PeriodCloseScheduler {
    statements: Arc<dyn StatementStore>,
    bus: EventBus,
    config: PeriodConfig,
    tick_interval: Duration,
}

impl PeriodCloseScheduler {
    pub fn new(statements: Arc<dyn StatementStore>, bus: EventBus, config: PeriodConfig) -> Self {
        Self { statements, bus, config, tick_interval: Duration::from_secs(60) }
    }

    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.tick_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("period-close scheduler stopping");
                    break;
                }
                _ = tick.tick() => {
                    if let Err(err) = self.tick() {
                        if matches!(err, TollHubError::BusClosed) {
                            break;
                        }
                        log::error!("period-close tick failed: {err}");
                    }
                }
            }
        }
    }

    /// Publish a close command for every draft whose period has ended.
    pub fn tick(&self) -> Result<usize, TollHubError> {
        let grace = ChronoDuration::hours(self.config.grace_period_hours as i64);
        let now = Utc::now();
        let mut published = 0;
        for draft in self.statements.open_drafts() {
            if now < draft.period_end + grace {
                continue;
            }
            let command = GenerateCommand {
                user_id: draft.user_id.clone(),
                period_start: draft.period_start,
                period_end: draft.period_end,
            };
            // Deterministic id: one close command per (user, period).
            let seed = format!("{}|{}", draft.user_id, draft.period_start.to_rfc3339());
            let message_id = Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes());
            let headers = MessageHeaders::new("statements_generate", "scheduler:period-close")
                .with_message_id(message_id);
            let message = Message::encode(headers, draft.user_id.clone(), &command)?;
            self.bus.publish(topics::STATEMENTS_GENERATE, message)?;
            published += 1;
            log::info!(
                "scheduled close for {} period {}..{}",
                command.user_id,
                command.period_start,
                command.period_end
            );
        }
        Ok(published)
    }
}
