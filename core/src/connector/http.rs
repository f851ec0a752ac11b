//! Generic HTTP agency connector.
//!
//! Drives any REST-shaped agency API from its `ConnectorConfig`: auth
//! handshake per scheme, cursor-paged transaction feed, evidence lookup,
//! health probe. Field-name aliases absorb the common spelling differences
//! between agencies; everything else stays opaque payload for the
//! normalizer.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::{Client as HttpClient, RequestBuilder, StatusCode};

use super::auth::{AuthManager, TokenResponse};
use super::{
    AgencyConnector, CircuitBreaker, HealthProbe, HealthStatus, RawTransaction, TransactionPage,
};
use crate::config::{AuthType, ConnectorConfig};
use crate::domain::AgencyId;
use crate::error::TollHubError;

/// Clock skew subtracted from token expiry before refreshing.
const TOKEN_SKEW_S: i64 = 30;
/// Latency samples kept for the health probe.
const LATENCY_WINDOW: usize = 32;

const DEGRADED_ERROR_RATE: f64 = 0.10;
const UNHEALTHY_ERROR_RATE: f64 = 0.30;

pub struct HttpAgencyConnector {
    agency_id: AgencyId,
    config: ConnectorConfig,
    client: HttpClient,
    auth: AuthManager,
    breaker: CircuitBreaker,
    latencies: Mutex<VecDeque<u64>>,
    last_success: Mutex<Option<DateTime<Utc>>>,
}

impl HttpAgencyConnector {
    pub fn new(config: ConnectorConfig) -> Result<Self, TollHubError> {
        let client = HttpClient::builder()
            .timeout(Duration::from_millis(config.timeout_ms.max(1)))
            .user_agent(concat!("tollhub/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TollHubError::Configuration {
                message: format!("failed to build http client: {e}"),
            })?;
        Ok(Self {
            agency_id: AgencyId::new(config.agency_id.clone()),
            config,
            client,
            auth: AuthManager::new(TOKEN_SKEW_S),
            breaker: CircuitBreaker::default(),
            latencies: Mutex::new(VecDeque::new()),
            last_success: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }

    fn token_url(&self) -> String {
        match &self.config.endpoints.token {
            Some(path) => self.url(path),
            None => self.url("/auth/login"),
        }
    }

    fn auth_failed(&self, reason: impl Into<String>) -> TollHubError {
        TollHubError::AuthenticationFailed {
            agency_id: self.agency_id.to_string(),
            reason: reason.into(),
        }
    }

    fn invalid_response(&self, message: impl Into<String>) -> TollHubError {
        TollHubError::InvalidResponse {
            agency_id: self.agency_id.to_string(),
            message: message.into(),
        }
    }

    async fn post_token_request(&self, request: RequestBuilder) -> Result<(), TollHubError> {
        let response = request.send().await.map_err(TollHubError::from)?;
        let status = response.status();
        if !status.is_success() {
            return Err(self.auth_failed(format!("token endpoint returned {status}")));
        }
        let tokens: TokenResponse = response
            .json()
            .await
            .map_err(|e| self.auth_failed(format!("bad token response: {e}")))?;
        self.auth.store(tokens).await;
        Ok(())
    }

    async fn authenticate_locked(&self) -> Result<(), TollHubError> {
        match self.config.auth_type {
            AuthType::ApiKey => Ok(()),
            AuthType::Oauth2 => {
                let client_id = self.config.credentials.client_id.clone().unwrap_or_default();
                let client_secret =
                    self.config.credentials.client_secret.clone().unwrap_or_default();
                let request = self.client.post(self.token_url()).form(&[
                    ("grant_type", "client_credentials"),
                    ("client_id", client_id.as_str()),
                    ("client_secret", client_secret.as_str()),
                ]);
                self.post_token_request(request).await
            }
            AuthType::Credentials => {
                let login = self.config.credentials.login.clone().unwrap_or_default();
                let password = self.config.credentials.password.clone().unwrap_or_default();
                // Basic header alongside the body covers both login styles
                // seen across agencies.
                let basic = base64::engine::general_purpose::STANDARD
                    .encode(format!("{login}:{password}"));
                let request = self
                    .client
                    .post(self.token_url())
                    .header("Authorization", format!("Basic {basic}"))
                    .json(&serde_json::json!({ "login": login, "password": password }));
                self.post_token_request(request).await
            }
        }
    }

    async fn refresh_locked(&self) -> Result<(), TollHubError> {
        if self.config.auth_type == AuthType::Oauth2 {
            if let Some(refresh_token) = self.auth.refresh_token().await {
                let request = self.client.post(self.token_url()).form(&[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", refresh_token.as_str()),
                ]);
                match self.post_token_request(request).await {
                    Ok(()) => return Ok(()),
                    Err(err) => {
                        // Dead refresh token: drop state and fall through to
                        // a full re-authentication.
                        log::warn!(
                            "[{}] token refresh failed, re-authenticating: {err}",
                            self.agency_id
                        );
                        self.auth.clear().await;
                    }
                }
            }
        }
        self.authenticate_locked().await
    }

    /// Issue one authenticated request. 401 triggers a single refresh and
    /// retry; 429 surfaces Retry-After; 5xx and transport errors feed the
    /// circuit breaker.
    async fn request_json(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<serde_json::Value, TollHubError> {
        if !self.breaker.allow() {
            return Err(TollHubError::CircuitOpen { agency_id: self.agency_id.to_string() });
        }
        if self.config.auth_type != AuthType::ApiKey && self.auth.needs_refresh().await {
            self.refresh_auth().await?;
        }

        let mut refreshed = false;
        loop {
            let mut request = self.client.get(self.url(path)).query(query);
            request = match self.config.auth_type {
                AuthType::ApiKey => request.header(
                    "X-Api-Key",
                    self.config.credentials.api_key.clone().unwrap_or_default(),
                ),
                _ => match self.auth.bearer().await {
                    Some(token) => request.bearer_auth(token),
                    None => request,
                },
            };

            let started = std::time::Instant::now();
            let response = match request.send().await {
                Ok(response) => response,
                Err(err) => {
                    self.breaker.record_failure();
                    return Err(TollHubError::from(err));
                }
            };
            let elapsed_ms = started.elapsed().as_millis() as u64;
            let status = response.status();

            if status == StatusCode::UNAUTHORIZED {
                if refreshed || self.config.auth_type == AuthType::ApiKey {
                    self.breaker.record_failure();
                    return Err(self.auth_failed("still unauthorized after refresh"));
                }
                refreshed = true;
                // The server rejected the current token regardless of its
                // claimed expiry; drop it so the refresh really re-auths.
                self.auth.clear().await;
                self.refresh_auth().await?;
                continue;
            }
            if status == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_secs);
                return Err(TollHubError::RateLimitExceeded {
                    agency_id: self.agency_id.to_string(),
                    retry_after,
                });
            }
            if !status.is_success() {
                if status.is_server_error() {
                    self.breaker.record_failure();
                }
                return Err(TollHubError::AgencyStatus {
                    agency_id: self.agency_id.to_string(),
                    status: status.as_u16(),
                });
            }

            self.breaker.record_success();
            self.record_latency(elapsed_ms);
            *self.last_success.lock() = Some(Utc::now());
            return response
                .json::<serde_json::Value>()
                .await
                .map_err(|e| self.invalid_response(format!("body is not json: {e}")));
        }
    }

    fn record_latency(&self, elapsed_ms: u64) {
        let mut latencies = self.latencies.lock();
        latencies.push_back(elapsed_ms);
        while latencies.len() > LATENCY_WINDOW {
            latencies.pop_front();
        }
    }

    fn avg_latency_ms(&self) -> u64 {
        let latencies = self.latencies.lock();
        if latencies.is_empty() {
            return 0;
        }
        latencies.iter().sum::<u64>() / latencies.len() as u64
    }

    pub fn last_success_at(&self) -> Option<DateTime<Utc>> {
        *self.last_success.lock()
    }

    fn parse_page(&self, value: serde_json::Value) -> Result<TransactionPage, TollHubError> {
        let (records, next_cursor) = match &value {
            serde_json::Value::Array(items) => (items.clone(), None),
            serde_json::Value::Object(map) => {
                let records = ["transactions", "data", "items"]
                    .iter()
                    .find_map(|k| map.get(*k))
                    .and_then(|v| v.as_array())
                    .cloned()
                    .ok_or_else(|| self.invalid_response("no transactions array"))?;
                let next_cursor = ["next_cursor", "nextCursor", "cursor"]
                    .iter()
                    .find_map(|k| map.get(*k))
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string());
                (records, next_cursor)
            }
            _ => return Err(self.invalid_response("unexpected page shape")),
        };

        let mut transactions = Vec::with_capacity(records.len());
        for record in records {
            let external_event_id = ["id", "transactionId", "transaction_id", "txn_id", "event_id", "eventId"]
                .iter()
                .find_map(|k| record.get(*k))
                .and_then(|v| match v {
                    serde_json::Value::String(s) => Some(s.clone()),
                    serde_json::Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .ok_or_else(|| self.invalid_response("transaction without an id"))?;
            transactions.push(RawTransaction { external_event_id, payload: record });
        }
        Ok(TransactionPage { transactions, next_cursor })
    }
}

#[async_trait]
impl AgencyConnector for HttpAgencyConnector {
    fn agency_id(&self) -> &AgencyId {
        &self.agency_id
    }

    async fn initialize(&self) -> Result<(), TollHubError> {
        self.config
            .validate()
            .map_err(|e| TollHubError::Configuration { message: e.to_string() })?;
        self.authenticate().await
    }

    async fn authenticate(&self) -> Result<(), TollHubError> {
        let _guard = self.auth.refresh_guard().await;
        self.authenticate_locked().await
    }

    async fn refresh_auth(&self) -> Result<(), TollHubError> {
        let _guard = self.auth.refresh_guard().await;
        // Another flight may have refreshed while we waited on the gate.
        if !self.auth.needs_refresh().await {
            return Ok(());
        }
        self.refresh_locked().await
    }

    async fn list_accounts(&self) -> Result<Vec<String>, TollHubError> {
        let Some(path) = self.config.endpoints.accounts.clone() else {
            return Ok(self.config.account_ids.clone());
        };
        let value = self.request_json(&path, &[]).await?;
        let records = value
            .get("accounts")
            .or_else(|| value.get("data"))
            .and_then(|v| v.as_array())
            .cloned()
            .or_else(|| value.as_array().cloned())
            .ok_or_else(|| self.invalid_response("no accounts array"))?;
        let mut accounts = Vec::with_capacity(records.len());
        for record in records {
            let id = record
                .get("id")
                .or_else(|| record.get("account_id"))
                .or_else(|| record.get("accountId"))
                .and_then(|v| match v {
                    serde_json::Value::String(s) => Some(s.clone()),
                    serde_json::Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .ok_or_else(|| self.invalid_response("account without an id"))?;
            accounts.push(id);
        }
        Ok(accounts)
    }

    async fn list_transactions(
        &self,
        account_id: &str,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<TransactionPage, TollHubError> {
        let path = self.config.endpoints.transactions.clone();
        let mut query: Vec<(&str, String)> = vec![
            ("account_id", account_id.to_string()),
            ("page_size", page_size.to_string()),
        ];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }
        let value = self.request_json(&path, &query).await?;
        self.parse_page(value)
    }

    async fn fetch_evidence(
        &self,
        external_event_id: &str,
    ) -> Result<Option<String>, TollHubError> {
        let Some(path) = self.config.endpoints.evidence.clone() else {
            return Ok(None);
        };
        let query = [("event_id", external_event_id.to_string())];
        match self.request_json(&path, &query).await {
            Ok(value) => Ok(["evidence_uri", "evidenceUri", "url"]
                .iter()
                .find_map(|k| value.get(*k))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())),
            // No evidence for this event is not an error.
            Err(TollHubError::AgencyStatus { status: 404, .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn health_probe(&self) -> Result<HealthProbe, TollHubError> {
        let mut response_time_ms = self.avg_latency_ms();
        if let Some(path) = self.config.endpoints.health.clone() {
            let started = std::time::Instant::now();
            if self.request_json(&path, &[]).await.is_ok() {
                response_time_ms = started.elapsed().as_millis() as u64;
            }
        }
        let error_rate = self.breaker.error_rate();
        let status = if self.breaker.state() != super::CircuitState::Closed
            || error_rate > UNHEALTHY_ERROR_RATE
        {
            HealthStatus::Unhealthy
        } else if error_rate > DEGRADED_ERROR_RATE {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        Ok(HealthProbe { status, response_time_ms, error_rate_window: error_rate })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectorCredentials, ConnectorEndpoints};
    use serde_json::json;

    fn connector() -> HttpAgencyConnector {
        HttpAgencyConnector::new(ConnectorConfig {
            agency_id: "etoll".into(),
            base_url: "https://api.etoll.test/".into(),
            auth_type: AuthType::ApiKey,
            credentials: ConnectorCredentials { api_key: Some("k".into()), ..Default::default() },
            endpoints: ConnectorEndpoints {
                accounts: Some("/v1/accounts".into()),
                transactions: "/v1/transactions".into(),
                evidence: None,
                health: None,
                token: None,
            },
            poll_interval_s: 60,
            rate_limit: Default::default(),
            retry: Default::default(),
            timeout_ms: 1_000,
            account_ids: vec![],
            page_size: 50,
        })
        .unwrap()
    }

    #[test]
    fn url_joining_handles_slashes() {
        let c = connector();
        assert_eq!(c.url("/v1/transactions"), "https://api.etoll.test/v1/transactions");
        assert_eq!(c.url("v1/transactions"), "https://api.etoll.test/v1/transactions");
    }

    #[test]
    fn parse_page_object_shape() {
        let c = connector();
        let page = c
            .parse_page(json!({
                "transactions": [
                    {"transactionId": "t1", "amount": "4.50"},
                    {"id": 42, "amount": "1.25"}
                ],
                "nextCursor": "abc"
            }))
            .unwrap();
        assert_eq!(page.transactions.len(), 2);
        assert_eq!(page.transactions[0].external_event_id, "t1");
        assert_eq!(page.transactions[1].external_event_id, "42");
        assert_eq!(page.next_cursor.as_deref(), Some("abc"));
        assert!(!page.is_last());
    }

    #[test]
    fn parse_page_bare_array_is_last() {
        let c = connector();
        let page = c.parse_page(json!([{"id": "a"}])).unwrap();
        assert_eq!(page.transactions.len(), 1);
        assert!(page.is_last());
    }

    #[test]
    fn parse_page_empty_cursor_means_done() {
        let c = connector();
        let page = c
            .parse_page(json!({"transactions": [], "next_cursor": ""}))
            .unwrap();
        assert!(page.is_last());
    }

    #[test]
    fn parse_page_rejects_missing_ids() {
        let c = connector();
        let err = c.parse_page(json!({"transactions": [{"amount": "1.00"}]})).unwrap_err();
        assert!(matches!(err, TollHubError::InvalidResponse { .. }));
    }
}
