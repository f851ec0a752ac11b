//! Per-connector auth token state.
//!
//! Token state is instance state guarded by a lock; authenticate and
//! refresh serialize on the refresh gate so concurrent requests never race
//! a double refresh.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;

/// Token endpoint response; field aliases cover the common agency spellings.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    #[serde(alias = "accessToken", alias = "token")]
    pub access_token: String,
    #[serde(default, alias = "refreshToken")]
    pub refresh_token: Option<String>,
    /// Lifetime in seconds.
    #[serde(default, alias = "expiresIn")]
    pub expires_in: Option<i64>,
}

#[derive(Debug, Default, Clone)]
struct TokenState {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

pub struct AuthManager {
    state: Mutex<TokenState>,
    /// Serializes authenticate/refresh so only one flight refreshes.
    refresh_gate: Mutex<()>,
    skew: Duration,
}

impl AuthManager {
    pub fn new(skew_s: i64) -> Self {
        Self {
            state: Mutex::new(TokenState::default()),
            refresh_gate: Mutex::new(()),
            skew: Duration::seconds(skew_s),
        }
    }

    pub async fn bearer(&self) -> Option<String> {
        self.state.lock().await.access_token.clone()
    }

    pub async fn refresh_token(&self) -> Option<String> {
        self.state.lock().await.refresh_token.clone()
    }

    /// Refresh is due when there is no token, or `now + skew` reaches the
    /// known expiry. Tokens without expiry never refresh proactively.
    pub async fn needs_refresh(&self) -> bool {
        let state = self.state.lock().await;
        match (&state.access_token, &state.expires_at) {
            (None, _) => true,
            (Some(_), Some(expires_at)) => Utc::now() + self.skew >= *expires_at,
            (Some(_), None) => false,
        }
    }

    pub async fn store(&self, response: TokenResponse) {
        let mut state = self.state.lock().await;
        state.access_token = Some(response.access_token);
        if response.refresh_token.is_some() {
            state.refresh_token = response.refresh_token;
        }
        state.expires_at = response.expires_in.map(|s| Utc::now() + Duration::seconds(s));
    }

    /// Drop all token state, forcing a full re-authentication.
    pub async fn clear(&self) {
        *self.state.lock().await = TokenState::default();
    }

    /// Exclusive section for authenticate/refresh flows.
    pub async fn refresh_guard(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.refresh_gate.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_state_needs_refresh() {
        let auth = AuthManager::new(30);
        assert!(auth.needs_refresh().await);
        assert!(auth.bearer().await.is_none());
    }

    #[tokio::test]
    async fn fresh_token_does_not_refresh() {
        let auth = AuthManager::new(30);
        auth.store(TokenResponse {
            access_token: "t".into(),
            refresh_token: Some("r".into()),
            expires_in: Some(3600),
        })
        .await;
        assert!(!auth.needs_refresh().await);
        assert_eq!(auth.bearer().await.as_deref(), Some("t"));
        assert_eq!(auth.refresh_token().await.as_deref(), Some("r"));
    }

    #[tokio::test]
    async fn token_inside_skew_window_refreshes() {
        let auth = AuthManager::new(60);
        auth.store(TokenResponse {
            access_token: "t".into(),
            refresh_token: None,
            expires_in: Some(10),
        })
        .await;
        assert!(auth.needs_refresh().await);
    }

    #[tokio::test]
    async fn clear_forces_reauth() {
        let auth = AuthManager::new(30);
        auth.store(TokenResponse {
            access_token: "t".into(),
            refresh_token: None,
            expires_in: None,
        })
        .await;
        assert!(!auth.needs_refresh().await);
        auth.clear().await;
        assert!(auth.needs_refresh().await);
    }

    #[test]
    fn token_response_aliases() {
        let parsed: TokenResponse = serde_json::from_str(
            r#"{"accessToken": "abc", "refreshToken": "def", "expiresIn": 900}"#,
        )
        .unwrap();
        assert_eq!(parsed.access_token, "abc");
        assert_eq!(parsed.refresh_token.as_deref(), Some("def"));
        assert_eq!(parsed.expires_in, Some(900));
    }
}
