//! Service bootstrap and graceful shutdown.
//!
//! Explicit dependency injection end to end: config builds stores, stores
//! and bus build stages, stages and pollers become tasks under one
//! cancellation token. No module-level globals. Shutdown cancels intake,
//! drains in-flight work, then closes the bus.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::{topics, EventBus};
use crate::config::Config;
use crate::connector::{ConnectorPoller, ConnectorRegistry};
use crate::dlq::{DlqHandler, ReplayTool};
use crate::error::TollHubError;
use crate::health::{
    summarize, HealthRegistry, HealthSummary, HeartbeatStage, PipelineMetrics,
};
use crate::pipeline::{
    AggregatorStage, MapperRegistry, Matcher, MatcherStage, NormalizerStage, PersisterStage,
    PlateCache, Rater, StageHandler, StageWorker, StatusFeedStage, VehicleUpdateStage,
};
use crate::scheduler::PeriodCloseScheduler;
use crate::store::{
    CursorStore, InMemoryDedupStore, InMemoryManualReviewQueue, InMemoryStatementStore,
    InMemoryTollEventStore, InMemoryUserDirectory, InMemoryVehicleCatalog, ManualReviewQueue,
    StatementStore, TollEventStore, UserDirectory, VehicleCatalog,
};

/// Consumer tasks per processing stage; partitions rebalance across them.
const STAGE_WORKERS: usize = 2;
/// Store maintenance cadence (dedup TTL purge, retention sweep, stale
/// heartbeat eviction).
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Service {
    config: Config,
    bus: EventBus,
    events: Arc<InMemoryTollEventStore>,
    statements: Arc<InMemoryStatementStore>,
    dedup: Arc<InMemoryDedupStore>,
    catalog: Arc<InMemoryVehicleCatalog>,
    review: Arc<InMemoryManualReviewQueue>,
    users: Arc<InMemoryUserDirectory>,
    rater: Arc<Rater>,
    metrics: Arc<PipelineMetrics>,
    health: Arc<HealthRegistry>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Service {
    /// Wire everything and spawn the worker tasks.
    pub async fn start(config: Config) -> Result<Self, TollHubError> {
        config
            .validate()
            .map_err(|e| TollHubError::Configuration { message: e.to_string() })?;

        // The cursor store is the startup probe for durable storage.
        let cursors = Arc::new(CursorStore::open(&config.db.data_dir).map_err(|e| {
            TollHubError::StoreUnavailable { message: e.to_string() }
        })?);

        let bus = EventBus::new(&config.bus);
        let events = Arc::new(InMemoryTollEventStore::new());
        let statements = Arc::new(InMemoryStatementStore::new());
        let dedup = Arc::new(InMemoryDedupStore::new(config.dedup.ttl_days));
        let catalog = Arc::new(InMemoryVehicleCatalog::new());
        let review = Arc::new(InMemoryManualReviewQueue::new());
        let users = Arc::new(InMemoryUserDirectory::new());
        let metrics = Arc::new(PipelineMetrics::default());
        let health = Arc::new(HealthRegistry::new(config.health.clone()));
        let rater = Arc::new(Rater::new(metrics.clone()));
        let cache = Arc::new(PlateCache::new(Duration::from_secs(config.matcher.cache_ttl_s)));

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        // Connector pollers, one task per agency.
        let registry = ConnectorRegistry::with_builtins();
        for connector_config in &config.connectors {
            let connector = registry.build(connector_config)?;
            let poller = ConnectorPoller::new(
                connector,
                connector_config.clone(),
                bus.clone(),
                cursors.clone(),
                metrics.clone(),
                &config.health,
            );
            log::info!("starting poller for {}", poller.agency_id());
            tasks.push(tokio::spawn(poller.run(cancel.child_token())));
        }

        // Stage workers.
        let normalizer = Arc::new(NormalizerStage::new(
            dedup.clone(),
            MapperRegistry::with_builtins(),
            bus.clone(),
            metrics.clone(),
        ));
        let matcher_stage = Arc::new(MatcherStage::new(
            Matcher::new(catalog.clone(), cache.clone(), config.matcher.clone()),
            rater.clone(),
            review.clone(),
            bus.clone(),
            metrics.clone(),
        ));
        let persister = Arc::new(PersisterStage::new(
            events.clone(),
            statements.clone(),
            users.clone(),
            config.statement.clone(),
            metrics.clone(),
        ));
        let aggregator = Arc::new(AggregatorStage::new(
            events.clone(),
            statements.clone(),
            bus.clone(),
            metrics.clone(),
        ));
        let status_feed = Arc::new(StatusFeedStage::new(
            events.clone(),
            statements.clone(),
            users.clone(),
            config.statement.clone(),
        ));
        let vehicle_updates = Arc::new(VehicleUpdateStage::new(catalog.clone(), cache));
        let heartbeats = Arc::new(HeartbeatStage::new(health.clone()));

        {
            let mut ctx = SpawnContext {
                bus: &bus,
                retry: &config.bus.retry,
                metrics: &metrics,
                cancel: &cancel,
                tasks: &mut tasks,
            };
            ctx.spawn("normalizer", topics::RAW, normalizer, STAGE_WORKERS)?;
            ctx.spawn("matcher", topics::NORMALIZED, matcher_stage, STAGE_WORKERS)?;
            ctx.spawn("persister", topics::MATCHED, persister, STAGE_WORKERS)?;
            ctx.spawn("aggregator", topics::STATEMENTS_GENERATE, aggregator, 1)?;
            ctx.spawn("status-feed", topics::EVENT_STATUS, status_feed, 1)?;
            ctx.spawn("vehicle-updates", topics::VEHICLE_UPDATES, vehicle_updates, 1)?;
            ctx.spawn("health-registry", topics::CONNECTOR_HEALTH, heartbeats, 1)?;
        }

        // Period close scheduler.
        let scheduler =
            PeriodCloseScheduler::new(statements.clone(), bus.clone(), config.statement.clone());
        tasks.push(tokio::spawn(scheduler.run(cancel.child_token())));

        // Store maintenance and periodic metrics readout.
        {
            let dedup = dedup.clone();
            let bus_for_sweep = bus.clone();
            let health = health.clone();
            let metrics = metrics.clone();
            let maintenance_cancel = cancel.child_token();
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(MAINTENANCE_INTERVAL);
                loop {
                    tokio::select! {
                        _ = maintenance_cancel.cancelled() => break,
                        _ = tick.tick() => {
                            use crate::store::DedupStore;
                            let purged = dedup.purge_expired();
                            if purged > 0 {
                                log::debug!("purged {purged} expired dedup keys");
                            }
                            bus_for_sweep.sweep_retention();
                            health.purge_stale();

                            let summary = summarize(&health, &bus_for_sweep, &metrics);
                            log::info!(
                                "pipeline {}: dlq depth {}, review queue {}, lag {:?}",
                                summary.overall,
                                summary.dlq_depth,
                                summary.manual_review_queued,
                                summary.stage_lag
                            );
                        }
                    }
                }
            }));
        }

        log::info!(
            "tollhub started: {} connectors, {} topics",
            config.connectors.len(),
            topics::ALL.len()
        );
        Ok(Self {
            config,
            bus,
            events,
            statements,
            dedup,
            catalog,
            review,
            users,
            rater,
            metrics,
            health,
            cancel,
            tasks,
        })
    }

    /// Stop intake, drain in-flight work, close resources.
    pub async fn shutdown(self) {
        log::info!("shutting down: draining in-flight work");
        self.cancel.cancel();
        for task in self.tasks {
            if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, task).await.is_err() {
                log::warn!("task did not drain within {SHUTDOWN_DRAIN_TIMEOUT:?}");
            }
        }
        self.bus.close();
        log::info!("shutdown complete");
    }

    pub fn health_summary(&self) -> HealthSummary {
        summarize(&self.health, &self.bus, &self.metrics)
    }

    pub fn replay_tool(&self) -> ReplayTool {
        ReplayTool::new(self.bus.clone(), self.config.dlq.max_replays)
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn vehicle_catalog(&self) -> Arc<dyn VehicleCatalog> {
        self.catalog.clone()
    }

    pub fn user_directory(&self) -> Arc<dyn UserDirectory> {
        self.users.clone()
    }

    pub fn toll_events(&self) -> Arc<dyn TollEventStore> {
        self.events.clone()
    }

    pub fn statements(&self) -> Arc<dyn StatementStore> {
        self.statements.clone()
    }

    pub fn review_queue(&self) -> Arc<dyn ManualReviewQueue> {
        self.review.clone()
    }

    pub fn rater(&self) -> Arc<Rater> {
        self.rater.clone()
    }

    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        self.metrics.clone()
    }

    pub fn dedup_store(&self) -> Arc<InMemoryDedupStore> {
        self.dedup.clone()
    }
}

/// Spawns stage workers against a consumer group.
struct SpawnContext<'a> {
    bus: &'a EventBus,
    retry: &'a crate::config::RetryConfig,
    metrics: &'a Arc<PipelineMetrics>,
    cancel: &'a CancellationToken,
    tasks: &'a mut Vec<JoinHandle<()>>,
}

impl SpawnContext<'_> {
    fn spawn<H: StageHandler + 'static>(
        &mut self,
        group: &str,
        topic: &str,
        handler: Arc<H>,
        workers: usize,
    ) -> Result<(), TollHubError> {
        for _ in 0..workers {
            let subscription = self.bus.subscribe(group, topic)?;
            let worker = StageWorker::new(
                subscription,
                handler.clone(),
                DlqHandler::new(self.bus.clone(), handler.stage_name()),
                self.retry.clone(),
                self.metrics.clone(),
            );
            self.tasks.push(tokio::spawn(worker.run(self.cancel.child_token())));
        }
        Ok(())
    }
}
