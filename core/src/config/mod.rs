//! Service configuration.
//!
//! Loaded from a YAML file, then overridden one-to-one by environment
//! variables (`TOLLHUB_` prefix, uppercased, dots become underscores:
//! `db.url` -> `TOLLHUB_DB_URL`). Validation runs at load time; a missing
//! endpoint or secret is a hard startup failure.

mod types;

pub use types::{AuthType, ConfigError, ConnectorCredentials, ConnectorEndpoints};

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::PeriodConfig;

/// Top-level service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bus: BusConfig,
    pub connectors: Vec<ConnectorConfig>,
    pub matcher: MatcherConfig,
    pub statement: PeriodConfig,
    pub dedup: DedupConfig,
    pub db: DbConfig,
    pub health: HealthConfig,
    pub dlq: DlqConfig,
}

/// Event bus settings. `brokers` is carried for deployments that back the
/// bus with an external cluster; the in-process broker only uses
/// `client_id`, partition counts and the retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub brokers: Vec<String>,
    pub client_id: String,
    /// Partitions per topic.
    pub partitions: u32,
    pub retry: RetryConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            brokers: Vec::new(),
            client_id: "tollhub".to_string(),
            partitions: 8,
            retry: RetryConfig::default(),
        }
    }
}

/// Shared retry shape: exponential backoff `min(initial * 2^attempt, max)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max: u32,
    pub initial_ms: u64,
    pub max_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max: 5, initial_ms: 500, max_ms: 30_000 }
    }
}

/// Per-agency connector settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    pub agency_id: String,
    pub base_url: String,
    pub auth_type: AuthType,
    #[serde(default)]
    pub credentials: ConnectorCredentials,
    pub endpoints: ConnectorEndpoints,
    #[serde(default = "default_poll_interval_s")]
    pub poll_interval_s: u64,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Accounts to poll when the agency has no accounts endpoint.
    #[serde(default)]
    pub account_ids: Vec<String>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_poll_interval_s() -> u64 {
    300
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_page_size() -> usize {
    100
}

/// Token bucket: `rpm` refills per minute, `burst` is bucket capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub rpm: u32,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { rpm: 60, burst: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    pub fuzzy_threshold: f64,
    pub time_window_minutes: i64,
    pub distance_meters: f64,
    /// Exact-match cache TTL.
    pub cache_ttl_s: u64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: 0.8,
            time_window_minutes: 30,
            distance_meters: 10_000.0,
            cache_ttl_s: 3_600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub ttl_days: i64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self { ttl_days: 7 }
    }
}

/// Durable store settings. The in-memory store only uses `data_dir` (poll
/// cursors); `url` and the pool sizes are honored by SQL-backed
/// implementations of the same store traits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    pub url: String,
    pub pool_max: u32,
    pub pool_min: u32,
    pub stmt_timeout_ms: u64,
    pub data_dir: String,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            pool_max: 16,
            pool_min: 2,
            stmt_timeout_ms: 5_000,
            data_dir: "./data".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Heartbeat publish interval per connector, seconds.
    pub heartbeat_interval_s: u64,
    /// Heartbeats older than this are dropped from the registry.
    pub registry_ttl_s: u64,
    /// Rolling error-rate thresholds.
    pub degraded_error_rate: f64,
    pub unhealthy_error_rate: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_s: 30,
            registry_ttl_s: 300,
            degraded_error_rate: 0.10,
            unhealthy_error_rate: 0.30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DlqConfig {
    /// Replays beyond this count refuse and require manual resolution.
    pub max_replays: u32,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self { max_replays: 3 }
    }
}

impl Config {
    /// Load from a YAML file, apply environment overrides, validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut config: Config = serde_yml::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides; used when no config file exists.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment variables mirror the file one-to-one: section and key
    /// uppercased and joined with underscores under the `TOLLHUB_` prefix.
    /// Connector credentials use the agency id:
    /// `TOLLHUB_CONNECTORS_ETOLL_API_KEY`.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_var("TOLLHUB_BUS_CLIENT_ID") {
            self.bus.client_id = v;
        }
        if let Some(v) = env_var("TOLLHUB_BUS_BROKERS") {
            self.bus.brokers = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Some(v) = parse_env("TOLLHUB_BUS_PARTITIONS") {
            self.bus.partitions = v;
        }
        if let Some(v) = env_var("TOLLHUB_DB_URL") {
            self.db.url = v;
        }
        if let Some(v) = env_var("TOLLHUB_DB_DATA_DIR") {
            self.db.data_dir = v;
        }
        if let Some(v) = parse_env("TOLLHUB_DB_POOL_MAX") {
            self.db.pool_max = v;
        }
        if let Some(v) = parse_env("TOLLHUB_DB_POOL_MIN") {
            self.db.pool_min = v;
        }
        if let Some(v) = parse_env("TOLLHUB_DB_STMT_TIMEOUT_MS") {
            self.db.stmt_timeout_ms = v;
        }
        if let Some(v) = parse_env("TOLLHUB_MATCHER_FUZZY_THRESHOLD") {
            self.matcher.fuzzy_threshold = v;
        }
        if let Some(v) = parse_env("TOLLHUB_MATCHER_TIME_WINDOW_MINUTES") {
            self.matcher.time_window_minutes = v;
        }
        if let Some(v) = parse_env("TOLLHUB_MATCHER_DISTANCE_METERS") {
            self.matcher.distance_meters = v;
        }
        if let Some(v) = parse_env("TOLLHUB_DEDUP_TTL_DAYS") {
            self.dedup.ttl_days = v;
        }
        if let Some(v) = parse_env("TOLLHUB_STATEMENT_CUT_DAY_OF_MONTH") {
            self.statement.cut_day_of_month = v;
        }
        if let Some(v) = parse_env("TOLLHUB_STATEMENT_GRACE_PERIOD_HOURS") {
            self.statement.grace_period_hours = v;
        }
        if let Some(v) = parse_env("TOLLHUB_DLQ_MAX_REPLAYS") {
            self.dlq.max_replays = v;
        }

        for connector in &mut self.connectors {
            let agency = connector.agency_id.to_uppercase().replace('-', "_");
            let prefix = format!("TOLLHUB_CONNECTORS_{agency}");
            if let Some(v) = env_var(&format!("{prefix}_BASE_URL")) {
                connector.base_url = v;
            }
            if let Some(v) = env_var(&format!("{prefix}_API_KEY")) {
                connector.credentials.api_key = Some(v);
            }
            if let Some(v) = env_var(&format!("{prefix}_CLIENT_ID")) {
                connector.credentials.client_id = Some(v);
            }
            if let Some(v) = env_var(&format!("{prefix}_CLIENT_SECRET")) {
                connector.credentials.client_secret = Some(v);
            }
            if let Some(v) = env_var(&format!("{prefix}_LOGIN")) {
                connector.credentials.login = Some(v);
            }
            if let Some(v) = env_var(&format!("{prefix}_PASSWORD")) {
                connector.credentials.password = Some(v);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus.partitions == 0 {
            return Err(ConfigError::Invalid("bus.partitions must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.matcher.fuzzy_threshold) {
            return Err(ConfigError::Invalid(
                "matcher.fuzzy_threshold must be within [0, 1]".into(),
            ));
        }
        if self.matcher.time_window_minutes <= 0 {
            return Err(ConfigError::Invalid(
                "matcher.time_window_minutes must be positive".into(),
            ));
        }
        if self.dedup.ttl_days <= 0 {
            return Err(ConfigError::Invalid("dedup.ttl_days must be positive".into()));
        }
        if !(1..=28).contains(&self.statement.cut_day_of_month) {
            return Err(ConfigError::Invalid(
                "statement.cut_day_of_month must be within 1..=28".into(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for connector in &self.connectors {
            connector.validate()?;
            if !seen.insert(connector.agency_id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate connector for agency {}",
                    connector.agency_id
                )));
            }
        }
        Ok(())
    }

    pub fn connector(&self, agency_id: &str) -> Option<&ConnectorConfig> {
        self.connectors.iter().find(|c| c.agency_id == agency_id)
    }
}

impl ConnectorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agency_id.trim().is_empty() {
            return Err(ConfigError::Invalid("connector agency_id is empty".into()));
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(ConfigError::MissingEndpoint {
                agency_id: self.agency_id.clone(),
                endpoint: format!("base_url is not an http(s) url: {:?}", self.base_url),
            });
        }
        if self.endpoints.transactions.trim().is_empty() {
            return Err(ConfigError::MissingEndpoint {
                agency_id: self.agency_id.clone(),
                endpoint: "transactions".into(),
            });
        }
        match self.auth_type {
            AuthType::Oauth2 => {
                if self.credentials.client_id.is_none() || self.credentials.client_secret.is_none()
                {
                    return Err(ConfigError::MissingCredentials {
                        agency_id: self.agency_id.clone(),
                        field: "client_id/client_secret".into(),
                    });
                }
                if self.endpoints.token.is_none() {
                    return Err(ConfigError::MissingEndpoint {
                        agency_id: self.agency_id.clone(),
                        endpoint: "token".into(),
                    });
                }
            }
            AuthType::Credentials => {
                if self.credentials.login.is_none() || self.credentials.password.is_none() {
                    return Err(ConfigError::MissingCredentials {
                        agency_id: self.agency_id.clone(),
                        field: "login/password".into(),
                    });
                }
            }
            AuthType::ApiKey => {
                if self.credentials.api_key.is_none() {
                    return Err(ConfigError::MissingCredentials {
                        agency_id: self.agency_id.clone(),
                        field: "api_key".into(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_var(name).and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn api_key_connector(agency: &str) -> ConnectorConfig {
        ConnectorConfig {
            agency_id: agency.to_string(),
            base_url: "https://api.example.com".into(),
            auth_type: AuthType::ApiKey,
            credentials: ConnectorCredentials {
                api_key: Some("k".into()),
                ..Default::default()
            },
            endpoints: ConnectorEndpoints {
                accounts: Some("/accounts".into()),
                transactions: "/transactions".into(),
                evidence: None,
                health: None,
                token: None,
            },
            poll_interval_s: 60,
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            timeout_ms: 5_000,
            account_ids: vec!["a1".into()],
            page_size: 50,
        }
    }

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn loads_yaml_with_defaults_filled() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "matcher:\n  fuzzy_threshold: 0.9\nconnectors:\n  - agency_id: etoll\n    base_url: https://api.etoll.test\n    auth_type: api_key\n    credentials:\n      api_key: secret\n    endpoints:\n      transactions: /v1/transactions\n"
        )
        .unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.matcher.fuzzy_threshold, 0.9);
        // untouched sections keep their defaults
        assert_eq!(config.dedup.ttl_days, 7);
        assert_eq!(config.connectors[0].poll_interval_s, 300);
    }

    #[test]
    fn missing_api_key_is_a_config_error() {
        let mut connector = api_key_connector("etoll");
        connector.credentials.api_key = None;
        let config = Config { connectors: vec![connector], ..Default::default() };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingCredentials { .. })
        ));
    }

    #[test]
    fn oauth2_requires_token_endpoint() {
        let mut connector = api_key_connector("etoll");
        connector.auth_type = AuthType::Oauth2;
        connector.credentials.client_id = Some("cid".into());
        connector.credentials.client_secret = Some("cs".into());
        let config = Config { connectors: vec![connector], ..Default::default() };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingEndpoint { .. })
        ));
    }

    #[test]
    fn duplicate_agencies_rejected() {
        let config = Config {
            connectors: vec![api_key_connector("etoll"), api_key_connector("etoll")],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_credentials() {
        // Vars no other test asserts on: config tests may run in parallel.
        std::env::set_var("TOLLHUB_CONNECTORS_ENVTEST_API_KEY", "from-env");
        std::env::set_var("TOLLHUB_DB_POOL_MAX", "32");
        let mut config =
            Config { connectors: vec![api_key_connector("envtest")], ..Default::default() };
        config.apply_env_overrides();
        assert_eq!(config.connectors[0].credentials.api_key.as_deref(), Some("from-env"));
        assert_eq!(config.db.pool_max, 32);
        std::env::remove_var("TOLLHUB_CONNECTORS_ENVTEST_API_KEY");
        std::env::remove_var("TOLLHUB_DB_POOL_MAX");
    }
}
