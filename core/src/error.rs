//! Structured error types for the toll pipeline.
//!
//! One taxonomy drives every stage's retry-vs-dead-letter decision: transient
//! errors are retried in place, permanent errors go to the DLQ with their
//! class recorded, configuration errors fail startup.

use std::time::Duration;
use thiserror::Error;

/// Primary error type for pipeline operations.
#[derive(Error, Debug)]
pub enum TollHubError {
    // =========================================================================
    // Connector / Transport Errors
    // =========================================================================
    /// Network/connection error while talking to an agency
    #[error("network error: {message}")]
    Network { message: String },

    /// Outbound call exceeded its deadline
    #[error("operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// Authentication with an agency failed (401, bad credentials, refresh failure)
    #[error("authentication failed for {agency_id}: {reason}")]
    AuthenticationFailed { agency_id: String, reason: String },

    /// Agency throttled us (429 / Retry-After)
    #[error("rate limit exceeded for {agency_id}")]
    RateLimitExceeded {
        agency_id: String,
        retry_after: Option<Duration>,
    },

    /// Agency returned a payload we could not interpret
    #[error("invalid response from {agency_id}: {message}")]
    InvalidResponse { agency_id: String, message: String },

    /// Agency returned a server error
    #[error("agency {agency_id} returned status {status}")]
    AgencyStatus { agency_id: String, status: u16 },

    /// Circuit breaker is open for this agency
    #[error("circuit open for {agency_id}")]
    CircuitOpen { agency_id: String },

    // =========================================================================
    // Validation Errors (permanent -> DLQ)
    // =========================================================================
    /// Payload failed normalization
    #[error("validation failed on {field}: {message}")]
    Validation { field: String, message: String },

    /// No schema mapper registered for the agency
    #[error("no schema mapper for agency: {agency_id}")]
    UnknownAgency { agency_id: String },

    // =========================================================================
    // Logical Conflicts (treated as success by callers)
    // =========================================================================
    /// Unique violation on (agency_id, external_event_id)
    #[error("duplicate event {external_event_id} from {agency_id}")]
    DuplicateEvent {
        agency_id: String,
        external_event_id: String,
    },

    // =========================================================================
    // Bus Errors
    // =========================================================================
    /// Publish/consume against a topic that was never created
    #[error("unknown topic: {topic}")]
    UnknownTopic { topic: String },

    /// Consumer polled a partition it is not assigned
    #[error("partition {partition} of {topic} not assigned to this consumer")]
    NotAssigned { topic: String, partition: u32 },

    /// The bus has shut down
    #[error("event bus closed")]
    BusClosed,

    // =========================================================================
    // Store Errors
    // =========================================================================
    /// Optimistic concurrency conflict on a statement draft
    #[error("version conflict on statement draft for {user_id}")]
    VersionConflict { user_id: String },

    /// Write attempted against a closed billing period
    #[error("period starting {period_start} is closed for {user_id}")]
    PeriodClosed {
        user_id: String,
        period_start: String,
    },

    /// Entity not found
    #[error("not found: {entity}")]
    NotFound { entity: String },

    /// Durable store unavailable (startup probe failed)
    #[error("store unavailable: {message}")]
    StoreUnavailable { message: String },

    // =========================================================================
    // Configuration Errors (fail startup)
    // =========================================================================
    /// Missing endpoint, credential or other required setting
    #[error("configuration error: {message}")]
    Configuration { message: String },

    // =========================================================================
    // Catch-all
    // =========================================================================
    /// Unclassified failure; captured, dead-lettered, alerted
    #[error("unknown error: {message}")]
    Unknown { message: String },

    // =========================================================================
    // External Error Wrappers
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TollHubError {
    /// Transient errors are retried in place with backoff; everything else
    /// is permanent for the current delivery.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network { .. } => true,
            Self::Timeout { .. } => true,
            Self::RateLimitExceeded { .. } => true,
            Self::CircuitOpen { .. } => true,
            Self::VersionConflict { .. } => true,
            Self::StoreUnavailable { .. } => true,
            Self::AgencyStatus { status, .. } => matches!(status, 429 | 500 | 502 | 503 | 504),
            Self::Io(io_err) => matches!(
                io_err.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            ),

            Self::AuthenticationFailed { .. }
            | Self::InvalidResponse { .. }
            | Self::Validation { .. }
            | Self::UnknownAgency { .. }
            | Self::DuplicateEvent { .. }
            | Self::UnknownTopic { .. }
            | Self::NotAssigned { .. }
            | Self::BusClosed
            | Self::PeriodClosed { .. }
            | Self::NotFound { .. }
            | Self::Configuration { .. }
            | Self::Unknown { .. }
            | Self::Json(_) => false,
        }
    }

    /// A duplicate is not a failure: the work was already done.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateEvent { .. })
    }

    /// Short stable class name recorded on dead letters and health events.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Network { .. } => "NetworkError",
            Self::Timeout { .. } => "Timeout",
            Self::AuthenticationFailed { .. } => "AuthenticationFailed",
            Self::RateLimitExceeded { .. } => "RateLimitExceeded",
            Self::InvalidResponse { .. } => "InvalidResponse",
            Self::AgencyStatus { .. } => "AgencyStatus",
            Self::CircuitOpen { .. } => "CircuitOpen",
            Self::Validation { .. } => "ValidationError",
            Self::UnknownAgency { .. } => "UnknownAgency",
            Self::DuplicateEvent { .. } => "DuplicateEvent",
            Self::UnknownTopic { .. } => "UnknownTopic",
            Self::NotAssigned { .. } => "NotAssigned",
            Self::BusClosed => "BusClosed",
            Self::VersionConflict { .. } => "VersionConflict",
            Self::PeriodClosed { .. } => "PeriodClosed",
            Self::NotFound { .. } => "NotFound",
            Self::StoreUnavailable { .. } => "StoreUnavailable",
            Self::Configuration { .. } => "ConfigurationError",
            Self::Unknown { .. } => "UnknownError",
            Self::Io(_) => "IoError",
            Self::Json(_) => "JsonError",
        }
    }

    /// Suggested delay before retrying a transient error.
    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            Self::RateLimitExceeded { retry_after, .. } => {
                Some(retry_after.unwrap_or(Duration::from_secs(60)))
            }
            Self::Timeout { .. } => Some(Duration::from_secs(1)),
            Self::Network { .. } => Some(Duration::from_secs(2)),
            Self::AgencyStatus { .. } => Some(Duration::from_secs(5)),
            Self::VersionConflict { .. } => Some(Duration::from_millis(20)),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for TollHubError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout { duration: Duration::from_secs(0) }
        } else if err.is_connect() || err.is_request() {
            Self::Network { message: err.to_string() }
        } else {
            Self::Unknown { message: err.to_string() }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(TollHubError::Network { message: "refused".into() }.is_transient());
        assert!(TollHubError::AgencyStatus { agency_id: "etoll".into(), status: 503 }.is_transient());
        assert!(!TollHubError::AgencyStatus { agency_id: "etoll".into(), status: 404 }.is_transient());
        assert!(!TollHubError::Validation { field: "plate".into(), message: "empty".into() }
            .is_transient());
        assert!(!TollHubError::DuplicateEvent {
            agency_id: "etoll".into(),
            external_event_id: "e1".into()
        }
        .is_transient());
    }

    #[test]
    fn duplicate_is_success_shaped() {
        let err = TollHubError::DuplicateEvent {
            agency_id: "etoll".into(),
            external_event_id: "e1".into(),
        };
        assert!(err.is_duplicate());
        assert_eq!(err.class(), "DuplicateEvent");
    }

    #[test]
    fn rate_limit_honors_retry_after() {
        let err = TollHubError::RateLimitExceeded {
            agency_id: "etoll".into(),
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(err.retry_delay(), Some(Duration::from_secs(2)));
        let err = TollHubError::RateLimitExceeded { agency_id: "etoll".into(), retry_after: None };
        assert_eq!(err.retry_delay(), Some(Duration::from_secs(60)));
    }
}
