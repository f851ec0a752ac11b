//! Agency connector runtime.
//!
//! Every agency integration implements the same capability set:
//! authenticate, page through transactions from a durable cursor, fetch
//! evidence, report health. Agency-specific behavior plugs in through the
//! registry as configuration variants over the shared HTTP implementation;
//! payload shapes stay opaque until normalization.

mod auth;
mod backoff;
mod circuit;
mod http;
mod poller;
mod rate_limit;
mod registry;

pub use auth::AuthManager;
pub use backoff::Backoff;
pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use http::HttpAgencyConnector;
pub use poller::ConnectorPoller;
pub use rate_limit::TokenBucket;
pub use registry::ConnectorRegistry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::AgencyId;
use crate::error::TollHubError;

/// One transaction as fetched, body untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTransaction {
    pub external_event_id: String,
    pub payload: serde_json::Value,
}

/// One page of the (finite) transaction feed. Restartable from a persisted
/// cursor, not from inside a page.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionPage {
    pub transactions: Vec<RawTransaction>,
    pub next_cursor: Option<String>,
}

impl TransactionPage {
    pub fn is_last(&self) -> bool {
        self.next_cursor.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Point-in-time connector health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthProbe {
    pub status: HealthStatus,
    pub response_time_ms: u64,
    /// Failure rate over the rolling request window, in `[0, 1]`.
    pub error_rate_window: f64,
}

/// Capability set required of every agency connector.
#[async_trait]
pub trait AgencyConnector: Send + Sync {
    fn agency_id(&self) -> &AgencyId;

    /// Validate config and establish auth. Fails with a configuration
    /// error when required endpoints or credentials are missing.
    async fn initialize(&self) -> Result<(), TollHubError>;

    /// Obtain an access token (and refresh token where the scheme has one).
    async fn authenticate(&self) -> Result<(), TollHubError>;

    /// Refresh when the token is near expiry. A failed refresh surfaces as
    /// `AuthenticationFailed` and forces a full re-authentication.
    async fn refresh_auth(&self) -> Result<(), TollHubError>;

    /// Accounts visible to our credentials.
    async fn list_accounts(&self) -> Result<Vec<String>, TollHubError>;

    /// One page of transactions for an account, from `cursor` (or the
    /// beginning). The caller persists the returned cursor only after the
    /// page was published.
    async fn list_transactions(
        &self,
        account_id: &str,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<TransactionPage, TollHubError>;

    /// Evidence URI for an event, when the agency offers one.
    async fn fetch_evidence(&self, external_event_id: &str)
        -> Result<Option<String>, TollHubError>;

    async fn health_probe(&self) -> Result<HealthProbe, TollHubError>;
}
