//! Connector health registry and pipeline metrics.
//!
//! Connectors publish heartbeats on the health topic; the registry keeps
//! the latest per agency with a TTL and aggregates worst-of. Pipeline
//! counters are plain atomics read out into a summary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::bus::{topics, EventBus};
use crate::config::HealthConfig;
use crate::connector::HealthStatus;
use crate::domain::AgencyId;

/// Heartbeat published by each connector every `heartbeat_interval_s`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthHeartbeat {
    pub agency_id: AgencyId,
    pub status: HealthStatus,
    pub response_time_ms: u64,
    pub error_rate: f64,
    pub last_success_at: Option<DateTime<Utc>>,
}

/// Latest heartbeat per agency, TTL'd.
pub struct HealthRegistry {
    config: HealthConfig,
    entries: RwLock<HashMap<AgencyId, (HealthHeartbeat, DateTime<Utc>)>>,
}

impl HealthRegistry {
    pub fn new(config: HealthConfig) -> Self {
        Self { config, entries: RwLock::new(HashMap::new()) }
    }

    pub fn record(&self, heartbeat: HealthHeartbeat) {
        let mut entries = self.entries.write();
        entries.insert(heartbeat.agency_id.clone(), (heartbeat, Utc::now()));
    }

    fn ttl(&self) -> Duration {
        Duration::seconds(self.config.registry_ttl_s.max(1) as i64)
    }

    /// Current heartbeat for one agency, if fresh.
    pub fn agency(&self, agency_id: &AgencyId) -> Option<HealthHeartbeat> {
        let entries = self.entries.read();
        entries
            .get(agency_id)
            .filter(|(_, at)| Utc::now() - *at <= self.ttl())
            .map(|(hb, _)| hb.clone())
    }

    /// All fresh heartbeats.
    pub fn snapshot(&self) -> Vec<HealthHeartbeat> {
        let ttl = self.ttl();
        let now = Utc::now();
        let entries = self.entries.read();
        let mut all: Vec<HealthHeartbeat> = entries
            .values()
            .filter(|(_, at)| now - *at <= ttl)
            .map(|(hb, _)| hb.clone())
            .collect();
        all.sort_by(|a, b| a.agency_id.cmp(&b.agency_id));
        all
    }

    /// Worst status across fresh agencies. Status is re-derived from the
    /// error-rate thresholds so a stale self-assessment cannot hide a bad
    /// error rate.
    pub fn overall(&self) -> HealthStatus {
        self.snapshot()
            .iter()
            .map(|hb| self.classify(hb))
            .max()
            .unwrap_or(HealthStatus::Healthy)
    }

    fn classify(&self, heartbeat: &HealthHeartbeat) -> HealthStatus {
        let by_rate = if heartbeat.error_rate > self.config.unhealthy_error_rate {
            HealthStatus::Unhealthy
        } else if heartbeat.error_rate > self.config.degraded_error_rate {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        by_rate.max(heartbeat.status)
    }

    /// Drop stale entries; returns how many were removed.
    pub fn purge_stale(&self) -> usize {
        let ttl = self.ttl();
        let now = Utc::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, (_, at)| now - *at <= ttl);
        before - entries.len()
    }
}

/// Pipeline-wide counters.
#[derive(Default)]
pub struct PipelineMetrics {
    pub raw_events_published: AtomicU64,
    pub events_normalized: AtomicU64,
    pub duplicates_suppressed: AtomicU64,
    pub events_matched: AtomicU64,
    pub events_persisted: AtomicU64,
    pub manual_review_queued: AtomicU64,
    pub missing_rate_config: AtomicU64,
    pub rate_limited_cycles: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub statements_closed: AtomicU64,
}

impl PipelineMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Point-in-time pipeline summary: overall status, per-stage consumer lag,
/// DLQ depth, counters.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub overall: HealthStatus,
    pub agencies: Vec<HealthHeartbeat>,
    pub stage_lag: HashMap<String, u64>,
    pub dlq_depth: u64,
    pub manual_review_queued: u64,
    pub missing_rate_config: u64,
    pub rate_limited_cycles: u64,
}

/// Consumer groups whose lag is worth watching, `(group, topic)`.
pub const STAGE_GROUPS: &[(&str, &str)] = &[
    ("normalizer", topics::RAW),
    ("matcher", topics::NORMALIZED),
    ("persister", topics::MATCHED),
    ("aggregator", topics::STATEMENTS_GENERATE),
];

pub fn summarize(
    registry: &HealthRegistry,
    bus: &EventBus,
    metrics: &PipelineMetrics,
) -> HealthSummary {
    let mut stage_lag = HashMap::new();
    for (group, topic) in STAGE_GROUPS {
        stage_lag.insert(format!("{group}@{topic}"), bus.lag(group, topic));
    }
    HealthSummary {
        overall: registry.overall(),
        agencies: registry.snapshot(),
        stage_lag,
        dlq_depth: bus.depth(topics::DEAD_LETTER),
        manual_review_queued: PipelineMetrics::get(&metrics.manual_review_queued),
        missing_rate_config: PipelineMetrics::get(&metrics.missing_rate_config),
        rate_limited_cycles: PipelineMetrics::get(&metrics.rate_limited_cycles),
    }
}

/// Bus stage that feeds heartbeats into the registry.
pub struct HeartbeatStage {
    registry: Arc<HealthRegistry>,
}

impl HeartbeatStage {
    pub fn new(registry: Arc<HealthRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait::async_trait]
impl crate::pipeline::StageHandler for HeartbeatStage {
    fn stage_name(&self) -> &'static str {
        "health-registry"
    }

    async fn handle(&self, delivery: &crate::bus::Delivery) -> Result<(), crate::error::TollHubError> {
        let heartbeat: HealthHeartbeat = delivery.message.decode()?;
        self.registry.record(heartbeat);
        Ok(())
    }
}
