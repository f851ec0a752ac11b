//! Manual review queue.
//!
//! Events no strategy could match land here with whatever signal the
//! matcher gathered, for a human to resolve.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::NormalizedEvent;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewItem {
    pub id: Uuid,
    pub normalized_event: NormalizedEvent,
    pub reason: String,
    /// Best candidate vehicle id, when one scored below threshold.
    pub best_candidate: Option<String>,
    pub fuzzy_confidence: f64,
    pub time_confidence: f64,
    pub priority: u8,
    pub created_at: DateTime<Utc>,
}

pub trait ManualReviewQueue: Send + Sync {
    fn enqueue(&self, item: ReviewItem);

    /// Oldest first.
    fn list(&self) -> Vec<ReviewItem>;

    fn resolve(&self, id: Uuid) -> Option<ReviewItem>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
pub struct InMemoryManualReviewQueue {
    items: Mutex<Vec<ReviewItem>>,
}

impl InMemoryManualReviewQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ManualReviewQueue for InMemoryManualReviewQueue {
    fn enqueue(&self, item: ReviewItem) {
        self.items.lock().push(item);
    }

    fn list(&self) -> Vec<ReviewItem> {
        let mut items = self.items.lock().clone();
        items.sort_by_key(|i| i.created_at);
        items
    }

    fn resolve(&self, id: Uuid) -> Option<ReviewItem> {
        let mut items = self.items.lock();
        let idx = items.iter().position(|i| i.id == id)?;
        Some(items.remove(idx))
    }

    fn len(&self) -> usize {
        self.items.lock().len()
    }
}
