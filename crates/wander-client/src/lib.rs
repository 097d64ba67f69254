//! Client core of the Wander marketplace: credentials, authenticated
//! requests, saved items and conversations over one local database.

pub mod config;
pub mod conversations;
pub mod error;
pub mod presence;
pub mod refresh;
pub mod request;
pub mod saved;
pub mod tokens;

use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::cookie::Jar;
use tracing::info;

use wander_db::Database;

pub use config::ClientConfig;
pub use conversations::{ConversationFilter, ConversationStore};
pub use error::{ApiError, RefreshError, StoreError, TokenError};
pub use refresh::TokenRefresher;
pub use request::{ApiClient, RequestOptions};
pub use saved::{SavedItemsCache, SavedKind};
pub use tokens::TokenStore;

/// Every client component, wired over one database and one HTTP client.
pub struct Client {
    pub tokens: Arc<TokenStore>,
    pub refresher: Arc<TokenRefresher>,
    pub api: ApiClient,
    pub saved_tours: SavedItemsCache,
    pub saved_companies: SavedItemsCache,
    pub conversations: ConversationStore,
}

impl Client {
    pub fn open(config: &ClientConfig) -> Result<Self> {
        let db = Arc::new(Database::open(&config.data_path)?);
        let jar = Arc::new(Jar::default());

        let http = reqwest::Client::builder()
            .cookie_provider(jar.clone())
            .build()
            .context("failed to build HTTP client")?;

        let tokens = Arc::new(TokenStore::open(vec![
            Box::new(tokens::KvTokenChannel::new(db.clone())),
            Box::new(tokens::CookieTokenChannel::new(jar, config.api_url.clone())),
        ])?);
        let refresher = TokenRefresher::new(tokens.clone(), http.clone(), config.refresh_url.clone());
        let api = ApiClient::new(http, config.api_url.clone(), tokens.clone(), refresher.clone());

        let client = Self {
            saved_tours: SavedItemsCache::load(db.clone(), SavedKind::Tours)?,
            saved_companies: SavedItemsCache::load(db.clone(), SavedKind::Companies)?,
            conversations: ConversationStore::load(db)?,
            tokens,
            refresher,
            api,
        };

        info!(
            authenticated = client.tokens.is_authenticated(),
            saved_tours = client.saved_tours.len(),
            saved_companies = client.saved_companies.len(),
            "Client opened"
        );
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};
    use wiremock::matchers::{header, header_regex, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[tokio::test]
    async fn session_reaches_server_as_cookies_and_survives_restart() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/session"))
            .and(header("authorization", "Bearer signed-in"))
            .and(header_regex("cookie", "access_token=signed-in"))
            .and(header_regex("cookie", "token_expires_at=[0-9]+"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "authenticated": true })))
            .expect(2)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig::new(server.uri().parse().unwrap(), dir.path().join("wander.db")).unwrap();

        let client = Client::open(&config).unwrap();
        client.tokens.set_session("signed-in", 3600, "refresh-1").unwrap();
        let body: Value = client.api.get("/api/v1/session").await.unwrap();
        assert_eq!(body["authenticated"], true);
        drop(client);

        let reopened = Client::open(&config).unwrap();
        assert_eq!(reopened.tokens.refresh_token().as_deref(), Some("refresh-1"));
        let _: Value = reopened.api.get("/api/v1/session").await.unwrap();
    }

    #[tokio::test]
    async fn components_share_one_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig::new("http://localhost:3000".parse().unwrap(), dir.path().join("wander.db")).unwrap();

        let client = Client::open(&config).unwrap();
        client.saved_tours.toggle_saved("tour-1", None).unwrap();
        client.saved_companies.toggle_saved("company-9", None).unwrap();
        drop(client);

        let reopened = Client::open(&config).unwrap();
        assert!(reopened.saved_tours.is_saved("tour-1"));
        assert!(!reopened.saved_tours.is_saved("company-9"));
        assert!(reopened.saved_companies.is_saved("company-9"));
    }
}
