//! Connector auth shapes and configuration errors.

use serde::{Deserialize, Serialize};

/// Authentication schemes agencies expose.
///
/// Each connector declares one; the credentials block must carry the
/// matching fields or startup fails.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    /// OAuth2 client-credentials grant against `endpoints.token`.
    ///
    /// Requires: credentials.client_id, credentials.client_secret
    Oauth2,

    /// Login/password exchange for a bearer token.
    ///
    /// Requires: credentials.login, credentials.password
    Credentials,

    /// Static API key sent on every request.
    ///
    /// Requires: credentials.api_key
    #[default]
    ApiKey,
}

impl std::fmt::Display for AuthType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthType::Oauth2 => write!(f, "oauth2"),
            AuthType::Credentials => write!(f, "credentials"),
            AuthType::ApiKey => write!(f, "api_key"),
        }
    }
}

/// Secret material for one agency. All fields optional at parse time;
/// validation enforces the set required by the declared auth type.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectorCredentials {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub login: Option<String>,
    pub password: Option<String>,
    pub api_key: Option<String>,
}

impl ConnectorCredentials {
    /// Redacted debug form for logs.
    pub fn redacted(&self) -> String {
        let mark = |v: &Option<String>| if v.is_some() { "set" } else { "unset" };
        format!(
            "client_id={} client_secret={} login={} password={} api_key={}",
            mark(&self.client_id),
            mark(&self.client_secret),
            mark(&self.login),
            mark(&self.password),
            mark(&self.api_key),
        )
    }
}

/// Relative endpoint paths under the connector's base_url.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectorEndpoints {
    /// Lists the accounts visible to our credentials. Optional; connectors
    /// without one poll the configured `account_ids`.
    pub accounts: Option<String>,
    /// Transaction feed, cursor-paged. Required.
    pub transactions: String,
    /// Per-event evidence (images, receipts). Optional.
    pub evidence: Option<String>,
    /// Agency-side health probe. Optional; falls back to the accounts or
    /// transactions endpoint.
    pub health: Option<String>,
    /// OAuth2 token endpoint. Required for `auth_type: oauth2`.
    pub token: Option<String>,
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// IO error occurred while reading the config file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// YAML parsing error
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yml::Error),
    /// Semantically invalid configuration
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Required endpoint missing for a connector
    #[error("connector {agency_id}: missing endpoint {endpoint}")]
    MissingEndpoint { agency_id: String, endpoint: String },
    /// Required credential missing for a connector
    #[error("connector {agency_id}: missing credentials {field}")]
    MissingCredentials { agency_id: String, field: String },
}
