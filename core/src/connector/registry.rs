//! Connector registry.
//!
//! Maps `agency_id` to a factory. The known agencies (E-Toll, ExpressToll,
//! FastTrack) are configuration variants over the shared HTTP connector;
//! unknown agencies fall back to the generic factory so a new agency is a
//! config change, not a code change.

use std::collections::HashMap;
use std::sync::Arc;

use super::{AgencyConnector, HttpAgencyConnector};
use crate::config::ConnectorConfig;
use crate::error::TollHubError;

type ConnectorFactory =
    Box<dyn Fn(&ConnectorConfig) -> Result<Arc<dyn AgencyConnector>, TollHubError> + Send + Sync>;

pub struct ConnectorRegistry {
    factories: HashMap<String, ConnectorFactory>,
    fallback: ConnectorFactory,
}

impl ConnectorRegistry {
    /// Registry with the built-in agencies registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
            fallback: Box::new(http_factory),
        };
        for agency in ["etoll", "expresstoll", "fasttrack"] {
            registry.register(agency, Box::new(http_factory));
        }
        registry
    }

    pub fn register(&mut self, agency_id: &str, factory: ConnectorFactory) {
        self.factories.insert(agency_id.to_string(), factory);
    }

    /// Build a connector for the config's agency, falling back to the
    /// generic HTTP connector for agencies without a dedicated factory.
    pub fn build(&self, config: &ConnectorConfig) -> Result<Arc<dyn AgencyConnector>, TollHubError> {
        match self.factories.get(&config.agency_id) {
            Some(factory) => factory(config),
            None => {
                log::debug!(
                    "no dedicated factory for agency {}, using generic http connector",
                    config.agency_id
                );
                (self.fallback)(config)
            }
        }
    }

    pub fn known_agencies(&self) -> Vec<String> {
        let mut agencies: Vec<String> = self.factories.keys().cloned().collect();
        agencies.sort();
        agencies
    }
}

fn http_factory(config: &ConnectorConfig) -> Result<Arc<dyn AgencyConnector>, TollHubError> {
    Ok(Arc::new(HttpAgencyConnector::new(config.clone())?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthType, ConnectorCredentials, ConnectorEndpoints};

    fn config(agency: &str) -> ConnectorConfig {
        ConnectorConfig {
            agency_id: agency.into(),
            base_url: "https://api.test".into(),
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
            rate_limit: Default::default(),
            retry: Default::default(),
            timeout_ms: 1_000,
            account_ids: vec!["a1".into()],
            page_size: 50,
        }
    }

    #[test]
    fn builtin_agencies_resolve() {
        let registry = ConnectorRegistry::with_builtins();
        for agency in registry.known_agencies() {
            let connector = registry.build(&config(&agency)).unwrap();
            assert_eq!(connector.agency_id().as_str(), agency);
        }
    }

    #[test]
    fn unknown_agency_falls_back_to_generic() {
        let registry = ConnectorRegistry::with_builtins();
        let connector = registry.build(&config("brand-new-agency")).unwrap();
        assert_eq!(connector.agency_id().as_str(), "brand-new-agency");
    }
}
