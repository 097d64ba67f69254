//! Single-flight access token refresh.
//!
//! At most one refresh call is outstanding at any time. Callers arriving while
//! it runs queue a waiter and receive the same outcome, in arrival order.

use std::sync::Arc;

use reqwest::Url;
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, error, info, warn};

use wander_types::api::{RefreshRequest, RefreshResponse};

use crate::error::RefreshError;
use crate::tokens::TokenStore;

type Waiter = oneshot::Sender<Result<String, RefreshError>>;

#[derive(Default)]
struct RefreshState {
    refreshing: bool,
    waiters: Vec<Waiter>,
}

pub struct TokenRefresher {
    store: Arc<TokenStore>,
    http: reqwest::Client,
    refresh_url: Url,
    state: Mutex<RefreshState>,
}

impl TokenRefresher {
    pub fn new(store: Arc<TokenStore>, http: reqwest::Client, refresh_url: Url) -> Arc<Self> {
        Arc::new(Self {
            store,
            http,
            refresh_url,
            state: Mutex::new(RefreshState::default()),
        })
    }

    /// Return a usable access token, refreshing only if the stored one is
    /// missing or expired.
    pub async fn ensure_fresh_token(self: &Arc<Self>) -> Result<String, RefreshError> {
        if let Some(token) = self.usable_token(None) {
            return Ok(token);
        }
        self.join_refresh(None).await
    }

    /// Called after the server rejected `rejected`. If another caller already
    /// replaced that token, the replacement is returned without a new refresh.
    pub async fn renew(self: &Arc<Self>, rejected: Option<&str>) -> Result<String, RefreshError> {
        if let Some(token) = self.usable_token(rejected) {
            return Ok(token);
        }
        self.join_refresh(rejected).await
    }

    /// Whether a refresh call is in flight right now.
    pub async fn is_refreshing(&self) -> bool {
        self.state.lock().await.refreshing
    }

    fn usable_token(&self, rejected: Option<&str>) -> Option<String> {
        self.store
            .access_token()
            .filter(|token| Some(token.as_str()) != rejected)
    }

    async fn join_refresh(self: &Arc<Self>, rejected: Option<&str>) -> Result<String, RefreshError> {
        let (tx, rx) = oneshot::channel();

        let leader = {
            let mut state = self.state.lock().await;
            if !state.refreshing {
                // A refresh may have finished between the caller's check and
                // taking the lock.
                if let Some(token) = self.usable_token(rejected) {
                    return Ok(token);
                }
            }
            state.waiters.push(tx);
            !std::mem::replace(&mut state.refreshing, true)
        };

        if leader {
            // Runs detached so a caller dropping its future cannot leave the
            // queue waiting forever.
            let this = Arc::clone(self);
            tokio::spawn(async move { this.run_refresh().await });
        } else {
            debug!("Refresh already in flight, waiting for its outcome");
        }

        rx.await.unwrap_or(Err(RefreshError::Aborted))
    }

    async fn run_refresh(&self) {
        let outcome = self.request_new_token().await;

        match &outcome {
            Ok(_) => info!("Access token refreshed"),
            Err(e) => {
                warn!("Token refresh failed, clearing session: {}", e);
                if let Err(e) = self.store.clear_all() {
                    error!("Failed to clear credentials after refresh failure: {}", e);
                }
            }
        }

        let waiters = {
            let mut state = self.state.lock().await;
            state.refreshing = false;
            std::mem::take(&mut state.waiters)
        };

        debug!(waiters = waiters.len(), "Resolving refresh waiters");
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    async fn request_new_token(&self) -> Result<String, RefreshError> {
        let refresh_token = self.store.refresh_token().ok_or(RefreshError::MissingRefreshToken)?;

        let response = self
            .http
            .post(self.refresh_url.clone())
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(|e| RefreshError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RefreshError::Rejected(status.as_u16()));
        }

        let body: RefreshResponse = response
            .json()
            .await
            .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;

        let stored = match &body.refresh_token {
            Some(rotated) => self.store.set_session(&body.access_token, body.expires_in, rotated),
            None => self.store.set_access_token(&body.access_token, body.expires_in).map(|_| ()),
        };
        stored.map_err(|e| RefreshError::Storage(e.to_string()))?;

        Ok(body.access_token)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::future::join_all;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::tokens::tests::memory_store;

    fn refresher(server: &MockServer, store: Arc<TokenStore>) -> Arc<TokenRefresher> {
        let url = format!("{}/auth/v1/token", server.uri()).parse().unwrap();
        TokenRefresher::new(store, reqwest::Client::new(), url)
    }

    fn expired_store() -> Arc<TokenStore> {
        let store = memory_store();
        store.set_session("stale", 0, "refresh-1").unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn valid_token_needs_no_network() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let store = memory_store();
        store.set_session("fresh", 600, "refresh-1").unwrap();
        let refresher = refresher(&server, Arc::new(store));

        assert_eq!(refresher.ensure_fresh_token().await.unwrap(), "fresh");
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .and(body_json(serde_json::json!({ "refresh_token": "refresh-1" })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({
                        "access_token": "fresh",
                        "expires_in": 3600,
                        "refresh_token": "refresh-2"
                    }))
                    .set_delay(Duration::from_millis(200)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let store = expired_store();
        let refresher = refresher(&server, store.clone());

        let results = join_all((0..10).map(|_| {
            let refresher = refresher.clone();
            async move { refresher.ensure_fresh_token().await }
        }))
        .await;

        assert!(results.iter().all(|r| r.as_deref() == Ok("fresh")));
        assert_eq!(store.refresh_token().as_deref(), Some("refresh-2"));
        assert!(!refresher.is_refreshing().await);
    }

    #[tokio::test]
    async fn failed_refresh_rejects_every_waiter_and_clears_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_delay(Duration::from_millis(200)))
            .expect(1)
            .mount(&server)
            .await;

        let store = expired_store();
        let refresher = refresher(&server, store.clone());

        let results = join_all((0..5).map(|_| {
            let refresher = refresher.clone();
            async move { refresher.ensure_fresh_token().await }
        }))
        .await;

        assert!(results.iter().all(|r| *r == Err(RefreshError::Rejected(401))));
        assert!(store.refresh_token().is_none());
        assert!(!store.is_authenticated());
    }

    #[tokio::test]
    async fn missing_refresh_token_fails_without_network() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let refresher = refresher(&server, Arc::new(memory_store()));
        assert_eq!(
            refresher.ensure_fresh_token().await,
            Err(RefreshError::MissingRefreshToken)
        );
    }

    #[tokio::test]
    async fn renew_skips_refresh_when_token_already_replaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let store = memory_store();
        store.set_session("replacement", 600, "refresh-1").unwrap();
        let refresher = refresher(&server, Arc::new(store));

        assert_eq!(refresher.renew(Some("rejected")).await.unwrap(), "replacement");
    }

    #[tokio::test]
    async fn late_joiner_after_completed_refresh_does_not_refresh_again() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "fresh",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let store = expired_store();
        let refresher = refresher(&server, store.clone());
        assert_eq!(refresher.ensure_fresh_token().await.unwrap(), "fresh");

        // Callers that saw the expired token before the refresh landed and
        // reach the queue only after it drained.
        assert_eq!(refresher.join_refresh(None).await.unwrap(), "fresh");
        assert_eq!(refresher.join_refresh(Some("stale")).await.unwrap(), "fresh");
        assert!(!refresher.is_refreshing().await);
    }

    #[tokio::test]
    async fn refresh_without_rotation_keeps_refresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "fresh",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;

        let store = expired_store();
        let refresher = refresher(&server, store.clone());

        assert_eq!(refresher.renew(Some("stale")).await.unwrap(), "fresh");
        assert_eq!(store.refresh_token().as_deref(), Some("refresh-1"));
        assert_eq!(store.access_token().as_deref(), Some("fresh"));
    }
}
