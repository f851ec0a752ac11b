//! Statement drafts and closed statements.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::event::TollEvent;
use super::period::BillingPeriod;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementStatus {
    Open,
    Closed,
    Paid,
    Overdue,
}

impl std::fmt::Display for StatementStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatementStatus::Open => write!(f, "open"),
            StatementStatus::Closed => write!(f, "closed"),
            StatementStatus::Paid => write!(f, "paid"),
            StatementStatus::Overdue => write!(f, "overdue"),
        }
    }
}

/// Mutable per-user accumulation for the current billing period.
///
/// One draft exists per `(user_id, period_start)`. Lives from the first
/// event of the period until close-out, when it freezes into a [`Statement`].
/// Concurrent upserts go through optimistic concurrency on `version`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatementDraft {
    pub user_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub timezone: String,
    pub subtotal: Decimal,
    pub fees: Decimal,
    pub credits: Decimal,
    pub total: Decimal,
    pub event_ids: BTreeSet<Uuid>,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl StatementDraft {
    pub fn new(user_id: impl Into<String>, period: &BillingPeriod) -> Self {
        Self {
            user_id: user_id.into(),
            period_start: period.start,
            period_end: period.end,
            timezone: period.timezone.clone(),
            subtotal: Decimal::ZERO,
            fees: Decimal::ZERO,
            credits: Decimal::ZERO,
            total: Decimal::ZERO,
            event_ids: BTreeSet::new(),
            version: 0,
            updated_at: Utc::now(),
        }
    }

    /// Fold one posted event into the draft. Idempotent per event id: a
    /// redelivered event that is already on the draft changes nothing.
    pub fn apply_event(&mut self, event: &TollEvent) -> bool {
        if !self.event_ids.insert(event.id) {
            return false;
        }
        self.subtotal += event.rated_amount;
        self.fees += event.fees;
        self.recompute_total();
        self.updated_at = Utc::now();
        true
    }

    /// Back an event out of the draft (voided before period close).
    pub fn remove_event(&mut self, event: &TollEvent) -> bool {
        if !self.event_ids.remove(&event.id) {
            return false;
        }
        self.subtotal -= event.rated_amount;
        self.fees -= event.fees;
        self.recompute_total();
        self.updated_at = Utc::now();
        true
    }

    /// Apply a compensating credit (e.g. an upheld dispute from a prior
    /// period).
    pub fn apply_credit(&mut self, amount: Decimal) {
        self.credits += amount;
        self.recompute_total();
        self.updated_at = Utc::now();
    }

    fn recompute_total(&mut self) {
        self.total = self.subtotal + self.fees - self.credits;
    }
}

/// Line item on a closed statement; references the toll event by id only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatementLineItem {
    pub toll_event_id: Uuid,
    pub event_timestamp: DateTime<Utc>,
    pub rated_amount: Decimal,
    pub fees: Decimal,
    pub description: String,
}

/// Immutable snapshot of a closed draft.
///
/// Adjustments after close never mutate this record; they surface as
/// compensating entries on a later statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statement {
    pub id: Uuid,
    pub user_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub subtotal: Decimal,
    pub fees: Decimal,
    pub credits: Decimal,
    pub total: Decimal,
    pub status: StatementStatus,
    pub line_items: Vec<StatementLineItem>,
    pub created_at: DateTime<Utc>,
}

impl Statement {
    /// Freeze a draft. Line items are ordered by event timestamp so the
    /// statement reads in the order the tolls were incurred.
    pub fn from_draft(draft: &StatementDraft, mut line_items: Vec<StatementLineItem>) -> Self {
        line_items.sort_by(|a, b| {
            a.event_timestamp
                .cmp(&b.event_timestamp)
                .then_with(|| a.toll_event_id.cmp(&b.toll_event_id))
        });
        Self {
            id: Uuid::new_v4(),
            user_id: draft.user_id.clone(),
            period_start: draft.period_start,
            period_end: draft.period_end,
            subtotal: draft.subtotal,
            fees: draft.fees,
            credits: draft.credits,
            total: draft.total,
            status: StatementStatus::Closed,
            line_items,
            created_at: Utc::now(),
        }
    }
}
