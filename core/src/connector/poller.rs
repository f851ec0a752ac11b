//! Per-agency poller task.
//!
//! Long-lived loop: reserve a rate-limit token, page through each account's
//! transactions from the durable cursor, publish raw events, advance the
//! cursor only after the page published. The cursor never moves past a
//! failed publish; duplicate publishes are fine because downstream dedup is
//! authoritative.

use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use chrono::{DateTime, Utc};
use futures::{pin_mut, Stream, StreamExt};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{AgencyConnector, Backoff, TokenBucket, TransactionPage};
use crate::bus::{topics, EventBus, Message, MessageHeaders, Producer};
use crate::config::{ConnectorConfig, HealthConfig};
use crate::domain::{EventSource, RawEvent};
use crate::error::TollHubError;
use crate::health::{HealthHeartbeat, PipelineMetrics};
use crate::store::CursorStore;

/// Whole-cycle deadline; a wedged agency cannot stall the poller forever.
const CYCLE_DEADLINE: Duration = Duration::from_secs(60);

pub struct ConnectorPoller {
    connector: Arc<dyn AgencyConnector>,
    config: ConnectorConfig,
    bus: EventBus,
    producer: Producer,
    cursors: Arc<CursorStore>,
    bucket: TokenBucket,
    metrics: Arc<PipelineMetrics>,
    heartbeat_interval: Duration,
    last_cycle_success: Mutex<Option<DateTime<Utc>>>,
}

impl ConnectorPoller {
    pub fn new(
        connector: Arc<dyn AgencyConnector>,
        config: ConnectorConfig,
        bus: EventBus,
        cursors: Arc<CursorStore>,
        metrics: Arc<PipelineMetrics>,
        health: &HealthConfig,
    ) -> Self {
        let producer = bus.producer(format!("connector:{}", config.agency_id));
        let bucket = TokenBucket::new(&config.rate_limit);
        Self {
            connector,
            config,
            bus,
            producer,
            cursors,
            bucket,
            metrics,
            heartbeat_interval: Duration::from_secs(health.heartbeat_interval_s.max(1)),
            last_cycle_success: Mutex::new(None),
        }
    }

    pub fn agency_id(&self) -> &str {
        &self.config.agency_id
    }

    pub async fn run(self, cancel: CancellationToken) {
        let agency = self.config.agency_id.clone();
        if let Err(err) = self.connector.initialize().await {
            // Health keeps reporting it; the poll loop keeps trying.
            log::error!("[{agency}] connector initialization failed: {err}");
        }

        let mut poll_tick = tokio::time::interval(Duration::from_secs(
            self.config.poll_interval_s.max(1),
        ));
        let mut heartbeat_tick = tokio::time::interval(self.heartbeat_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("[{agency}] poller stopping");
                    break;
                }
                _ = poll_tick.tick() => {
                    match tokio::time::timeout(CYCLE_DEADLINE, self.poll_cycle()).await {
                        Ok(Ok(published)) => {
                            *self.last_cycle_success.lock() = Some(Utc::now());
                            if published > 0 {
                                log::info!("[{agency}] published {published} raw events");
                            }
                        }
                        Ok(Err(err)) => {
                            log::warn!("[{agency}] poll cycle failed: {err}");
                        }
                        Err(_) => {
                            log::warn!("[{agency}] poll cycle exceeded {CYCLE_DEADLINE:?}");
                        }
                    }
                }
                _ = heartbeat_tick.tick() => {
                    self.publish_heartbeat().await;
                }
            }
        }
    }

    /// One poll cycle over every account.
    pub async fn poll_cycle(&self) -> Result<usize, TollHubError> {
        let interval = Duration::from_secs(self.config.poll_interval_s.max(1));
        if !self.bucket.acquire_within(interval.min(CYCLE_DEADLINE)).await {
            PipelineMetrics::incr(&self.metrics.rate_limited_cycles);
            log::debug!("[{}] rate limited, skipping cycle", self.config.agency_id);
            return Ok(0);
        }

        let accounts = self.connector.list_accounts().await?;
        let mut published = 0;
        for account in &accounts {
            published += self.drain_account(account).await?;
        }
        Ok(published)
    }

    /// Lazy page sequence for one account, starting from the given cursor.
    /// Finite, not restartable within a page, restartable from a persisted
    /// cursor.
    fn page_stream<'a>(
        &'a self,
        account: &'a str,
        mut cursor: Option<String>,
    ) -> impl Stream<Item = Result<TransactionPage, TollHubError>> + 'a {
        try_stream! {
            loop {
                let page = self.fetch_page(account, cursor.as_deref()).await?;
                let done = page.is_last();
                cursor = page.next_cursor.clone();
                yield page;
                if done {
                    break;
                }
            }
        }
    }

    /// Page through one account from its cursor. Each page publishes all of
    /// its events before the cursor commits; an error leaves the cursor at
    /// the last committed page.
    async fn drain_account(&self, account: &str) -> Result<usize, TollHubError> {
        let agency = &self.config.agency_id;
        let mut published = 0;

        let pages = self.page_stream(account, self.cursors.get(agency, account));
        pin_mut!(pages);
        while let Some(page) = pages.next().await {
            let page = page?;
            for transaction in &page.transactions {
                let mut payload = transaction.payload.clone();
                self.enrich_with_evidence(&transaction.external_event_id, &mut payload).await;
                let raw = RawEvent {
                    event_id: transaction.external_event_id.clone(),
                    agency_id: self.connector.agency_id().clone(),
                    received_at: Utc::now(),
                    source: EventSource::AgencyFeed,
                    payload,
                };
                let headers = MessageHeaders::new("raw_event", format!("connector:{agency}"));
                let message = Message::encode(headers, agency.clone(), &raw)?;
                self.producer.send(topics::RAW, message)?;
                published += 1;
            }
            PipelineMetrics::add(&self.metrics.raw_events_published, page.transactions.len() as u64);

            if let Some(next) = &page.next_cursor {
                self.cursors.commit(agency, account, next.clone()).map_err(|e| {
                    TollHubError::StoreUnavailable { message: e.to_string() }
                })?;
            }
        }
        Ok(published)
    }

    /// Attach an evidence URI to feeds that deliver it out of band. Best
    /// effort: evidence is optional and never blocks the cycle.
    async fn enrich_with_evidence(&self, external_event_id: &str, payload: &mut serde_json::Value) {
        if self.config.endpoints.evidence.is_none() {
            return;
        }
        let Some(object) = payload.as_object_mut() else { return };
        if object.contains_key("evidence_uri") {
            return;
        }
        match self.connector.fetch_evidence(external_event_id).await {
            Ok(Some(uri)) => {
                object.insert("evidence_uri".to_string(), serde_json::Value::String(uri));
            }
            Ok(None) => {}
            Err(err) => {
                log::debug!(
                    "[{}] evidence fetch for {external_event_id} failed: {err}",
                    self.config.agency_id
                );
            }
        }
    }

    /// Fetch one page, retrying per the error policy: 429 sleeps the
    /// suggested interval and re-enters, transient errors back off
    /// exponentially, everything else aborts the cycle.
    async fn fetch_page(
        &self,
        account: &str,
        cursor: Option<&str>,
    ) -> Result<TransactionPage, TollHubError> {
        let mut backoff = Backoff::new(&self.config.retry);
        let mut attempts = 0u32;
        loop {
            match self
                .connector
                .list_transactions(account, cursor, self.config.page_size)
                .await
            {
                Ok(page) => return Ok(page),
                Err(err @ TollHubError::RateLimitExceeded { .. }) => {
                    if attempts >= self.config.retry.max {
                        return Err(err);
                    }
                    attempts += 1;
                    let delay = err.retry_delay().unwrap_or(Duration::from_secs(60));
                    log::info!(
                        "[{}] 429 from agency, sleeping {delay:?} before re-entering",
                        self.config.agency_id
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) if err.is_transient() && attempts < self.config.retry.max => {
                    attempts += 1;
                    let delay = backoff.next_delay();
                    log::debug!(
                        "[{}] transient fetch error ({}), retry {attempts}/{} in {delay:?}",
                        self.config.agency_id,
                        err.class(),
                        self.config.retry.max
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn publish_heartbeat(&self) {
        let agency = self.connector.agency_id().clone();
        let probe = match self.connector.health_probe().await {
            Ok(probe) => probe,
            Err(err) => {
                log::warn!("[{agency}] health probe failed: {err}");
                super::HealthProbe {
                    status: super::HealthStatus::Unhealthy,
                    response_time_ms: 0,
                    error_rate_window: 1.0,
                }
            }
        };
        let heartbeat = HealthHeartbeat {
            agency_id: agency.clone(),
            status: probe.status,
            response_time_ms: probe.response_time_ms,
            error_rate: probe.error_rate_window,
            last_success_at: *self.last_cycle_success.lock(),
        };
        let headers = MessageHeaders::new("health_heartbeat", format!("connector:{agency}"));
        match Message::encode(headers, agency.to_string(), &heartbeat) {
            Ok(message) => {
                if let Err(err) = self.bus.publish(topics::CONNECTOR_HEALTH, message) {
                    log::warn!("[{agency}] failed to publish heartbeat: {err}");
                }
            }
            Err(err) => log::warn!("[{agency}] failed to encode heartbeat: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthType, ConnectorCredentials, ConnectorEndpoints, RateLimitConfig, RetryConfig};
    use crate::connector::{HealthProbe, HealthStatus, RawTransaction};
    use crate::domain::AgencyId;
    use async_trait::async_trait;
    use parking_lot::Mutex as PlMutex;
    use serde_json::json;

    /// Scripted connector: each call pops the next response.
    struct ScriptedConnector {
        agency_id: AgencyId,
        pages: PlMutex<Vec<Result<TransactionPage, TollHubError>>>,
        calls: PlMutex<Vec<Option<String>>>,
    }

    impl ScriptedConnector {
        fn new(pages: Vec<Result<TransactionPage, TollHubError>>) -> Self {
            Self {
                agency_id: AgencyId::new("etoll"),
                pages: PlMutex::new(pages),
                calls: PlMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AgencyConnector for ScriptedConnector {
        fn agency_id(&self) -> &AgencyId {
            &self.agency_id
        }
        async fn initialize(&self) -> Result<(), TollHubError> {
            Ok(())
        }
        async fn authenticate(&self) -> Result<(), TollHubError> {
            Ok(())
        }
        async fn refresh_auth(&self) -> Result<(), TollHubError> {
            Ok(())
        }
        async fn list_accounts(&self) -> Result<Vec<String>, TollHubError> {
            Ok(vec!["a1".into()])
        }
        async fn list_transactions(
            &self,
            _account_id: &str,
            cursor: Option<&str>,
            _page_size: usize,
        ) -> Result<TransactionPage, TollHubError> {
            self.calls.lock().push(cursor.map(|c| c.to_string()));
            let mut pages = self.pages.lock();
            if pages.is_empty() {
                return Ok(TransactionPage::default());
            }
            pages.remove(0)
        }
        async fn fetch_evidence(&self, _id: &str) -> Result<Option<String>, TollHubError> {
            Ok(None)
        }
        async fn health_probe(&self) -> Result<HealthProbe, TollHubError> {
            Ok(HealthProbe {
                status: HealthStatus::Healthy,
                response_time_ms: 10,
                error_rate_window: 0.0,
            })
        }
    }

    fn config() -> ConnectorConfig {
        ConnectorConfig {
            agency_id: "etoll".into(),
            base_url: "https://api.etoll.test".into(),
            auth_type: AuthType::ApiKey,
            credentials: ConnectorCredentials { api_key: Some("k".into()), ..Default::default() },
            endpoints: ConnectorEndpoints {
                accounts: None,
                transactions: "/tx".into(),
                evidence: None,
                health: None,
                token: None,
            },
            poll_interval_s: 60,
            rate_limit: RateLimitConfig { rpm: 6_000, burst: 100 },
            retry: RetryConfig { max: 3, initial_ms: 10, max_ms: 40 },
            timeout_ms: 1_000,
            account_ids: vec!["a1".into()],
            page_size: 10,
        }
    }

    fn page(ids: &[&str], next: Option<&str>) -> TransactionPage {
        TransactionPage {
            transactions: ids
                .iter()
                .map(|id| RawTransaction {
                    external_event_id: id.to_string(),
                    payload: json!({"id": id, "amount": "4.50"}),
                })
                .collect(),
            next_cursor: next.map(|c| c.to_string()),
        }
    }

    fn poller(
        connector: Arc<dyn AgencyConnector>,
        dir: &std::path::Path,
    ) -> (ConnectorPoller, EventBus) {
        let bus = EventBus::new(&Default::default());
        let cursors = Arc::new(CursorStore::open(dir).unwrap());
        let metrics = Arc::new(PipelineMetrics::default());
        let poller = ConnectorPoller::new(
            connector,
            config(),
            bus.clone(),
            cursors,
            metrics,
            &Default::default(),
        );
        (poller, bus)
    }

    #[tokio::test]
    async fn pages_publish_and_cursor_advances() {
        let dir = tempfile::tempdir().unwrap();
        let connector = Arc::new(ScriptedConnector::new(vec![
            Ok(page(&["e1", "e2"], Some("c1"))),
            Ok(page(&["e3"], None)),
        ]));
        let (poller, bus) = poller(connector.clone(), dir.path());

        let published = poller.poll_cycle().await.unwrap();
        assert_eq!(published, 3);
        assert_eq!(bus.depth(topics::RAW), 3);
        // First call had no cursor, second one carried the committed cursor.
        let calls = connector.calls.lock().clone();
        assert_eq!(calls, vec![None, Some("c1".to_string())]);
        assert_eq!(poller.cursors.get("etoll", "a1").as_deref(), Some("c1"));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_is_honored_and_nothing_is_lost() {
        let dir = tempfile::tempdir().unwrap();
        let connector = Arc::new(ScriptedConnector::new(vec![
            Err(TollHubError::RateLimitExceeded {
                agency_id: "etoll".into(),
                retry_after: Some(Duration::from_secs(2)),
            }),
            Ok(page(&["e1"], None)),
        ]));
        let (poller, bus) = poller(connector.clone(), dir.path());

        let started = tokio::time::Instant::now();
        let published = poller.poll_cycle().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(2), "did not honor Retry-After");
        assert_eq!(published, 1);
        assert_eq!(bus.depth(topics::RAW), 1);
        // Cursor untouched: the page that finally succeeded was the last.
        assert!(poller.cursors.get("etoll", "a1").is_none());
    }

    #[tokio::test]
    async fn failed_publish_leaves_cursor_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let connector = Arc::new(ScriptedConnector::new(vec![Ok(page(&["e1"], Some("c1")))]));
        let (poller, bus) = poller(connector, dir.path());
        bus.close();

        assert!(poller.poll_cycle().await.is_err());
        assert!(poller.cursors.get("etoll", "a1").is_none());
    }

    #[tokio::test]
    async fn permanent_error_aborts_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let connector = Arc::new(ScriptedConnector::new(vec![Err(
            TollHubError::AuthenticationFailed { agency_id: "etoll".into(), reason: "revoked".into() },
        )]));
        let (poller, _bus) = poller(connector, dir.path());
        let err = poller.poll_cycle().await.unwrap_err();
        assert_eq!(err.class(), "AuthenticationFailed");
    }
}
