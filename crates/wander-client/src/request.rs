//! Authenticated HTTP requests against the marketplace API.
//!
//! A 401 on an authenticated request triggers one token renewal and one
//! replay of the identical request. Anything past that is a session expiry.

use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::refresh::TokenRefresher;
use crate::tokens::TokenStore;

#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: Method,
    pub body: Option<serde_json::Value>,
    pub headers: HeaderMap,
    pub requires_auth: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            method: Method::GET,
            body: None,
            headers: HeaderMap::new(),
            requires_auth: true,
        }
    }
}

impl RequestOptions {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            ..Default::default()
        }
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Send without credentials and surface 401s as plain HTTP errors.
    pub fn public(mut self) -> Self {
        self.requires_auth = false;
        self
    }
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
    tokens: Arc<TokenStore>,
    refresher: Arc<TokenRefresher>,
}

impl ApiClient {
    pub fn new(
        http: reqwest::Client,
        base_url: Url,
        tokens: Arc<TokenStore>,
        refresher: Arc<TokenRefresher>,
    ) -> Self {
        Self {
            http,
            base_url,
            tokens,
            refresher,
        }
    }

    pub async fn request<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<T, ApiError> {
        let url = self
            .base_url
            .join(endpoint)
            .map_err(|e| ApiError::InvalidRequest(format!("bad endpoint {endpoint:?}: {e}")))?;

        let mut token = if options.requires_auth {
            self.current_token().await?
        } else {
            None
        };
        let mut is_retry = false;

        loop {
            let response = self.send(&url, &options, token.as_deref()).await?;

            if response.status() != StatusCode::UNAUTHORIZED || !options.requires_auth {
                return read_response(response).await;
            }

            if is_retry {
                warn!(%url, "Request rejected again after token renewal");
                return Err(self.expire_session());
            }

            match self.refresher.renew(token.as_deref()).await {
                Ok(fresh) => {
                    debug!(%url, "Replaying request with renewed token");
                    token = Some(fresh);
                    is_retry = true;
                }
                Err(e) => {
                    warn!(%url, "Token renewal failed: {}", e);
                    return Err(self.expire_session());
                }
            }
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, ApiError> {
        self.request(endpoint, RequestOptions::new(Method::GET)).await
    }

    pub async fn post<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: serde_json::Value,
    ) -> Result<T, ApiError> {
        self.request(endpoint, RequestOptions::new(Method::POST).json(body)).await
    }

    pub async fn put<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: serde_json::Value,
    ) -> Result<T, ApiError> {
        self.request(endpoint, RequestOptions::new(Method::PUT).json(body)).await
    }

    pub async fn patch<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: serde_json::Value,
    ) -> Result<T, ApiError> {
        self.request(endpoint, RequestOptions::new(Method::PATCH).json(body)).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, ApiError> {
        self.request(endpoint, RequestOptions::new(Method::DELETE)).await
    }

    /// Token to attach before the first attempt. An expired token is renewed
    /// up front when a refresh token is available.
    async fn current_token(&self) -> Result<Option<String>, ApiError> {
        if let Some(token) = self.tokens.access_token() {
            return Ok(Some(token));
        }
        if self.tokens.refresh_token().is_none() {
            return Ok(None);
        }
        match self.refresher.ensure_fresh_token().await {
            Ok(token) => Ok(Some(token)),
            Err(e) => {
                warn!("Token refresh before request failed: {}", e);
                Err(self.expire_session())
            }
        }
    }

    async fn send(
        &self,
        url: &Url,
        options: &RequestOptions,
        token: Option<&str>,
    ) -> Result<Response, ApiError> {
        let mut builder = self
            .http
            .request(options.method.clone(), url.clone())
            .headers(options.headers.clone());
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &options.body {
            builder = builder.json(body);
        }

        builder.send().await.map_err(ApiError::Network)
    }

    fn expire_session(&self) -> ApiError {
        if let Err(e) = self.tokens.clear_all() {
            warn!("Failed to clear credentials on session expiry: {}", e);
        }
        ApiError::SessionExpired
    }
}

async fn read_response<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let status = response.status();

    if status.is_success() {
        let bytes = response.bytes().await.map_err(ApiError::Network)?;
        if bytes.is_empty() {
            return Ok(serde_json::from_value(serde_json::Value::Null)?);
        }
        return Ok(serde_json::from_slice(&bytes)?);
    }

    let text = response.text().await.unwrap_or_default();
    Err(ApiError::Http {
        status,
        status_text: status.canonical_reason().unwrap_or_default().to_string(),
        body: serde_json::from_str(&text).ok(),
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{Value, json};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::tokens::tests::memory_store;

    fn client(server: &MockServer, store: TokenStore) -> (ApiClient, Arc<TokenStore>) {
        let store = Arc::new(store);
        let http = reqwest::Client::new();
        let refresh_url = format!("{}/auth/v1/token", server.uri()).parse().unwrap();
        let refresher = TokenRefresher::new(store.clone(), http.clone(), refresh_url);
        let base_url = server.uri().parse().unwrap();
        (ApiClient::new(http, base_url, store.clone(), refresher), store)
    }

    async fn mount_refresh(server: &MockServer, expected_calls: u64) {
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "access_token": "fresh", "expires_in": 3600 }))
                    .set_delay(Duration::from_millis(100)),
            )
            .expect(expected_calls)
            .mount(server)
            .await;
    }

    fn signed_in(access: &str, expires_in: i64) -> TokenStore {
        let store = memory_store();
        store.set_session(access, expires_in, "refresh-1").unwrap();
        store
    }

    #[tokio::test]
    async fn attaches_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/bookings"))
            .and(header("authorization", "Bearer current"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "id": 1 }])))
            .expect(1)
            .mount(&server)
            .await;

        let (api, _) = client(&server, signed_in("current", 600));
        let bookings: Vec<Value> = api.get("/api/v1/bookings").await.unwrap();
        assert_eq!(bookings.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_401s_share_one_refresh_and_both_replay() {
        let server = MockServer::start().await;
        mount_refresh(&server, 1).await;
        Mock::given(method("GET"))
            .and(header("authorization", "Bearer revoked"))
            .respond_with(ResponseTemplate::new(401))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(header("authorization", "Bearer fresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
            .expect(2)
            .mount(&server)
            .await;

        let (api, store) = client(&server, signed_in("revoked", 600));
        let (a, b) = tokio::join!(
            api.get::<Value>("/api/v1/bookings"),
            api.get::<Value>("/api/v1/messages"),
        );

        assert_eq!(a.unwrap(), json!({ "ok": true }));
        assert_eq!(b.unwrap(), json!({ "ok": true }));
        assert_eq!(store.access_token().as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn retries_at_most_once() {
        let server = MockServer::start().await;
        mount_refresh(&server, 1).await;
        Mock::given(method("GET"))
            .and(path("/api/v1/profile"))
            .respond_with(ResponseTemplate::new(401))
            .expect(2)
            .mount(&server)
            .await;

        let (api, store) = client(&server, signed_in("revoked", 600));
        let err = api.get::<Value>("/api/v1/profile").await.unwrap_err();

        assert!(err.is_session_expired());
        assert!(!store.is_authenticated());
        assert!(store.refresh_token().is_none());
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_before_sending() {
        let server = MockServer::start().await;
        mount_refresh(&server, 1).await;
        Mock::given(method("GET"))
            .and(header("authorization", "Bearer fresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let (api, _) = client(&server, signed_in("stale", 0));
        let saved: Vec<Value> = api.get("/api/v1/saved").await.unwrap();
        assert!(saved.is_empty());
    }

    #[tokio::test]
    async fn failed_refresh_is_session_expired() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let (api, store) = client(&server, signed_in("revoked", 600));
        let err = api.get::<Value>("/api/v1/bookings").await.unwrap_err();
        assert!(err.is_session_expired());
        assert!(!store.is_authenticated());
    }

    #[tokio::test]
    async fn not_found_is_typed_and_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "message": "no such tour" })))
            .expect(1)
            .mount(&server)
            .await;

        let (api, _) = client(&server, signed_in("current", 600));
        match api.get::<Value>("/api/v1/tours/42").await.unwrap_err() {
            ApiError::Http { status, status_text, body } => {
                assert_eq!(status, StatusCode::NOT_FOUND);
                assert_eq!(status_text, "Not Found");
                assert_eq!(body, Some(json!({ "message": "no such tour" })));
            }
            other => panic!("expected HTTP error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn public_request_surfaces_401_without_refresh() {
        let server = MockServer::start().await;
        mount_refresh(&server, 0).await;
        Mock::given(method("POST"))
            .and(path("/api/v1/newsletter"))
            .respond_with(ResponseTemplate::new(401).set_body_string("nope"))
            .expect(1)
            .mount(&server)
            .await;

        let (api, store) = client(&server, signed_in("current", 600));
        let options = RequestOptions::new(Method::POST).json(json!({ "email": "a@b.c" })).public();
        let err = api.request::<Value>("/api/v1/newsletter", options).await.unwrap_err();

        assert_eq!(err.status(), Some(StatusCode::UNAUTHORIZED));
        assert!(matches!(err, ApiError::Http { body: None, .. }));
        assert!(store.is_authenticated());
    }

    #[tokio::test]
    async fn empty_success_body_decodes_as_unit() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let (api, _) = client(&server, signed_in("current", 600));
        api.delete::<()>("/api/v1/saved/tour-123").await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_host_is_network_error() {
        let store = Arc::new(signed_in("current", 600));
        let http = reqwest::Client::new();
        let refresher = TokenRefresher::new(
            store.clone(),
            http.clone(),
            "http://127.0.0.1:1/auth".parse().unwrap(),
        );
        let api = ApiClient::new(http, "http://127.0.0.1:1/".parse().unwrap(), store, refresher);

        assert!(matches!(
            api.get::<Value>("/api/v1/bookings").await,
            Err(ApiError::Network(_))
        ));
    }
}
