//! Credential storage.
//!
//! The access token and its expiry are mirrored into two channels: the local
//! database (read back on startup) and the HTTP client's cookie jar (sent to
//! the application server, whose middleware reads it). Every change goes
//! through [`TokenStore::commit`], which writes all channels or none.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, TimeZone, Utc};
use reqwest::Url;
use reqwest::cookie::{CookieStore, Jar};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use wander_db::Database;
use wander_types::api::{ACCESS_TOKEN_COOKIE, TOKEN_EXPIRES_COOKIE};

use crate::error::TokenError;

const SESSION_KEY: &str = "auth_session";

/// Everything a channel may hold. Channels are free to persist a subset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredTokens {
    pub access_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub refresh_token: Option<String>,
}

/// A place credentials are persisted to.
pub trait TokenChannel: Send + Sync {
    fn name(&self) -> &'static str;
    fn load(&self) -> anyhow::Result<StoredTokens>;
    fn save(&self, tokens: &StoredTokens) -> anyhow::Result<()>;
}

/// Durable channel backed by the local key/value table.
pub struct KvTokenChannel {
    db: Arc<Database>,
}

impl KvTokenChannel {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

impl TokenChannel for KvTokenChannel {
    fn name(&self) -> &'static str {
        "local"
    }

    fn load(&self) -> anyhow::Result<StoredTokens> {
        let Some(raw) = self.db.kv_get(SESSION_KEY)? else {
            return Ok(StoredTokens::default());
        };
        match serde_json::from_str(&raw) {
            Ok(tokens) => Ok(tokens),
            Err(e) => {
                warn!("Corrupt stored session, treating as signed out: {}", e);
                Ok(StoredTokens::default())
            }
        }
    }

    fn save(&self, tokens: &StoredTokens) -> anyhow::Result<()> {
        if *tokens == StoredTokens::default() {
            return self.db.kv_remove_many(&[SESSION_KEY]);
        }
        self.db.kv_set(SESSION_KEY, &serde_json::to_string(tokens)?)
    }
}

/// Cookie channel: the access token and expiry as cookies scoped to the
/// application server. The refresh token never leaves the local channel.
pub struct CookieTokenChannel {
    jar: Arc<Jar>,
    url: Url,
}

impl CookieTokenChannel {
    pub fn new(jar: Arc<Jar>, url: Url) -> Self {
        Self { jar, url }
    }

    fn set_cookie(&self, name: &str, value: Option<&str>) {
        let cookie = match value {
            Some(value) => format!("{name}={value}; Path=/; SameSite=Lax"),
            None => format!("{name}=; Path=/; Max-Age=0"),
        };
        self.jar.add_cookie_str(&cookie, &self.url);
    }
}

impl TokenChannel for CookieTokenChannel {
    fn name(&self) -> &'static str {
        "cookie"
    }

    fn load(&self) -> anyhow::Result<StoredTokens> {
        let mut tokens = StoredTokens::default();
        let Some(header) = self.jar.cookies(&self.url) else {
            return Ok(tokens);
        };
        for pair in header.to_str()?.split(';') {
            let Some((name, value)) = pair.trim().split_once('=') else {
                continue;
            };
            match name {
                ACCESS_TOKEN_COOKIE => tokens.access_token = Some(value.to_string()),
                TOKEN_EXPIRES_COOKIE => {
                    tokens.expires_at = value
                        .parse::<i64>()
                        .ok()
                        .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
                }
                _ => {}
            }
        }
        Ok(tokens)
    }

    fn save(&self, tokens: &StoredTokens) -> anyhow::Result<()> {
        self.set_cookie(ACCESS_TOKEN_COOKIE, tokens.access_token.as_deref());
        let expires = tokens.expires_at.map(|at| at.timestamp().to_string());
        self.set_cookie(TOKEN_EXPIRES_COOKIE, expires.as_deref());
        Ok(())
    }
}

/// Holds the current credential and answers validity questions without
/// network I/O.
pub struct TokenStore {
    state: Mutex<StoredTokens>,
    channels: Vec<Box<dyn TokenChannel>>,
}

impl TokenStore {
    /// The first channel is the source of truth on startup; the others are
    /// rewritten from it so they start in sync.
    pub fn open(channels: Vec<Box<dyn TokenChannel>>) -> Result<Self, TokenError> {
        let initial = match channels.first() {
            Some(primary) => primary.load().map_err(|source| TokenError::Channel {
                channel: primary.name(),
                source,
            })?,
            None => StoredTokens::default(),
        };

        let store = Self {
            state: Mutex::new(StoredTokens::default()),
            channels,
        };
        store.commit(initial)?;
        Ok(store)
    }

    /// Store a new access token valid for `expires_in_secs` from now.
    /// Returns the absolute expiry.
    pub fn set_access_token(&self, token: &str, expires_in_secs: i64) -> Result<DateTime<Utc>, TokenError> {
        validate_token(token)?;
        let expires_at = Utc::now() + Duration::seconds(expires_in_secs);
        let mut next = self.snapshot();
        next.access_token = Some(token.to_string());
        next.expires_at = Some(expires_at);
        self.commit(next)?;
        Ok(expires_at)
    }

    /// The access token, or `None` when absent or expired.
    pub fn access_token(&self) -> Option<String> {
        let state = self.state();
        match (&state.access_token, state.expires_at) {
            (Some(token), Some(expires_at)) if expires_at > Utc::now() => Some(token.clone()),
            _ => None,
        }
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.state().expires_at
    }

    pub fn set_refresh_token(&self, token: &str) -> Result<(), TokenError> {
        validate_token(token)?;
        let mut next = self.snapshot();
        next.refresh_token = Some(token.to_string());
        self.commit(next)
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.state().refresh_token.clone()
    }

    /// Store a full credential after sign-in or a rotating refresh.
    pub fn set_session(&self, access_token: &str, expires_in_secs: i64, refresh_token: &str) -> Result<(), TokenError> {
        validate_token(access_token)?;
        validate_token(refresh_token)?;
        self.commit(StoredTokens {
            access_token: Some(access_token.to_string()),
            expires_at: Some(Utc::now() + Duration::seconds(expires_in_secs)),
            refresh_token: Some(refresh_token.to_string()),
        })
    }

    /// An access token is present, even if it needs refreshing.
    pub fn is_authenticated(&self) -> bool {
        self.state().access_token.is_some()
    }

    /// Wipe every channel. The in-memory credential is dropped even if a
    /// channel fails, so a failed wipe never keeps a session alive.
    pub fn clear_all(&self) -> Result<(), TokenError> {
        let mut state = self.state();
        *state = StoredTokens::default();

        let mut first_err = None;
        for channel in &self.channels {
            if let Err(source) = channel.save(&StoredTokens::default()) {
                error!(channel = channel.name(), "Failed to clear credentials: {}", source);
                first_err.get_or_insert(TokenError::Channel {
                    channel: channel.name(),
                    source,
                });
            }
        }
        debug!("Credentials cleared");
        first_err.map_or(Ok(()), Err)
    }

    fn snapshot(&self) -> StoredTokens {
        self.state().clone()
    }

    fn state(&self) -> MutexGuard<'_, StoredTokens> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write `next` to every channel. If one fails, channels already written
    /// are restored to the current credential and memory is left untouched.
    fn commit(&self, next: StoredTokens) -> Result<(), TokenError> {
        let mut state = self.state();

        for (i, channel) in self.channels.iter().enumerate() {
            if let Err(source) = channel.save(&next) {
                for written in &self.channels[..i] {
                    if let Err(e) = written.save(&state) {
                        error!(channel = written.name(), "Credential rollback failed: {}", e);
                    }
                }
                return Err(TokenError::Channel {
                    channel: channel.name(),
                    source,
                });
            }
        }

        *state = next;
        Ok(())
    }
}

/// Tokens travel in cookie values and headers; reject anything that cannot.
fn validate_token(token: &str) -> Result<(), TokenError> {
    if token.is_empty() {
        return Err(TokenError::Invalid("token is empty".into()));
    }
    if let Some(c) = token
        .chars()
        .find(|c| !c.is_ascii_graphic() || matches!(c, ';' | ',' | '"' | '\\'))
    {
        return Err(TokenError::Invalid(format!("token contains {c:?}")));
    }
    Ok(())
}
