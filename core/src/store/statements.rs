//! Statement draft and statement store.
//!
//! Drafts carry an optimistic-concurrency version: `save_draft` only
//! succeeds when the caller read the version it is replacing. Closed
//! periods refuse writes entirely; the persister rolls late arrivals into
//! the next open period. Closed statements are immutable.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::{BillingPeriod, Statement, StatementDraft};
use crate::error::TollHubError;

pub trait StatementStore: Send + Sync {
    /// Load the draft for `(user_id, period.start)`, creating an empty one
    /// if none exists. Fails with `PeriodClosed` once the period closed.
    fn load_or_new(
        &self,
        user_id: &str,
        period: &BillingPeriod,
    ) -> Result<StatementDraft, TollHubError>;

    /// Write back a mutated draft. The draft's `version` must equal the
    /// stored version; on success the stored version increments.
    fn save_draft(&self, draft: StatementDraft) -> Result<(), TollHubError>;

    /// Freeze the draft: no further writes to this period. Returns the
    /// final draft state; the caller assembles the immutable statement.
    fn close_draft(
        &self,
        user_id: &str,
        period_start: DateTime<Utc>,
    ) -> Result<StatementDraft, TollHubError>;

    fn is_closed(&self, user_id: &str, period_start: DateTime<Utc>) -> bool;

    /// Store a finalized statement. Refuses to replace an existing one.
    fn put_statement(&self, statement: Statement) -> Result<(), TollHubError>;

    fn get_statement(&self, id: Uuid) -> Option<Statement>;

    fn statement_for_period(
        &self,
        user_id: &str,
        period_start: DateTime<Utc>,
    ) -> Option<Statement>;

    /// All open drafts, for the period-close scheduler.
    fn open_drafts(&self) -> Vec<StatementDraft>;
}

type DraftKey = (String, DateTime<Utc>);

#[derive(Default)]
pub struct InMemoryStatementStore {
    inner: RwLock<State>,
}

#[derive(Default)]
struct State {
    drafts: HashMap<DraftKey, StatementDraft>,
    closed_periods: HashMap<DraftKey, Uuid>,
    statements: HashMap<Uuid, Statement>,
}

impl InMemoryStatementStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatementStore for InMemoryStatementStore {
    fn load_or_new(
        &self,
        user_id: &str,
        period: &BillingPeriod,
    ) -> Result<StatementDraft, TollHubError> {
        let key = (user_id.to_string(), period.start);
        let state = self.inner.read();
        if state.closed_periods.contains_key(&key) {
            return Err(TollHubError::PeriodClosed {
                user_id: user_id.to_string(),
                period_start: period.start.to_rfc3339(),
            });
        }
        Ok(state
            .drafts
            .get(&key)
            .cloned()
            .unwrap_or_else(|| StatementDraft::new(user_id, period)))
    }

    fn save_draft(&self, mut draft: StatementDraft) -> Result<(), TollHubError> {
        let key = (draft.user_id.clone(), draft.period_start);
        let mut state = self.inner.write();
        if state.closed_periods.contains_key(&key) {
            return Err(TollHubError::PeriodClosed {
                user_id: draft.user_id.clone(),
                period_start: draft.period_start.to_rfc3339(),
            });
        }
        let stored_version = state.drafts.get(&key).map(|d| d.version).unwrap_or(0);
        if draft.version != stored_version {
            return Err(TollHubError::VersionConflict { user_id: draft.user_id.clone() });
        }
        draft.version += 1;
        state.drafts.insert(key, draft);
        Ok(())
    }

    fn close_draft(
        &self,
        user_id: &str,
        period_start: DateTime<Utc>,
    ) -> Result<StatementDraft, TollHubError> {
        let key = (user_id.to_string(), period_start);
        let mut state = self.inner.write();
        if state.closed_periods.contains_key(&key) {
            return Err(TollHubError::PeriodClosed {
                user_id: user_id.to_string(),
                period_start: period_start.to_rfc3339(),
            });
        }
        let draft = state.drafts.remove(&key).ok_or_else(|| TollHubError::NotFound {
            entity: format!("statement draft for {user_id} starting {period_start}"),
        })?;
        // Marker statement id is filled in by put_statement; nil until then.
        state.closed_periods.insert(key, Uuid::nil());
        Ok(draft)
    }

    fn is_closed(&self, user_id: &str, period_start: DateTime<Utc>) -> bool {
        self.inner
            .read()
            .closed_periods
            .contains_key(&(user_id.to_string(), period_start))
    }

    fn put_statement(&self, statement: Statement) -> Result<(), TollHubError> {
        let mut state = self.inner.write();
        if state.statements.contains_key(&statement.id) {
            return Err(TollHubError::PeriodClosed {
                user_id: statement.user_id.clone(),
                period_start: statement.period_start.to_rfc3339(),
            });
        }
        state
            .closed_periods
            .insert((statement.user_id.clone(), statement.period_start), statement.id);
        state.statements.insert(statement.id, statement);
        Ok(())
    }

    fn get_statement(&self, id: Uuid) -> Option<Statement> {
        self.inner.read().statements.get(&id).cloned()
    }

    fn statement_for_period(
        &self,
        user_id: &str,
        period_start: DateTime<Utc>,
    ) -> Option<Statement> {
        let state = self.inner.read();
        let id = state.closed_periods.get(&(user_id.to_string(), period_start))?;
        state.statements.get(id).cloned()
    }

    fn open_drafts(&self) -> Vec<StatementDraft> {
        let state = self.inner.read();
        let mut drafts: Vec<StatementDraft> = state.drafts.values().cloned().collect();
        drafts.sort_by(|a, b| {
            a.user_id.cmp(&b.user_id).then_with(|| a.period_start.cmp(&b.period_start))
        });
        drafts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PeriodConfig;

    fn period() -> BillingPeriod {
        BillingPeriod::containing(
            "2025-03-10T00:00:00Z".parse().unwrap(),
            chrono_tz::UTC,
            &PeriodConfig::default(),
        )
    }

    #[test]
    fn save_bumps_version_and_detects_conflicts() {
        let store = InMemoryStatementStore::new();
        let p = period();
        let draft = store.load_or_new("u7", &p).unwrap();
        assert_eq!(draft.version, 0);
        store.save_draft(draft.clone()).unwrap();

        // Stale writer that still holds version 0 must conflict.
        assert!(matches!(
            store.save_draft(draft),
            Err(TollHubError::VersionConflict { .. })
        ));
        let fresh = store.load_or_new("u7", &p).unwrap();
        assert_eq!(fresh.version, 1);
        store.save_draft(fresh).unwrap();
    }

    #[test]
    fn closed_period_refuses_writes() {
        let store = InMemoryStatementStore::new();
        let p = period();
        let draft = store.load_or_new("u7", &p).unwrap();
        store.save_draft(draft).unwrap();
        let frozen = store.close_draft("u7", p.start).unwrap();
        assert_eq!(frozen.version, 1);

        assert!(matches!(
            store.load_or_new("u7", &p),
            Err(TollHubError::PeriodClosed { .. })
        ));
        assert!(store.is_closed("u7", p.start));
    }

    #[test]
    fn statements_are_write_once() {
        let store = InMemoryStatementStore::new();
        let p = period();
        let draft = StatementDraft::new("u7", &p);
        let statement = Statement::from_draft(&draft, Vec::new());
        let id = statement.id;
        store.put_statement(statement.clone()).unwrap();
        assert!(store.put_statement(statement).is_err());
        assert!(store.get_statement(id).is_some());
        assert!(store.statement_for_period("u7", p.start).is_some());
    }
}
