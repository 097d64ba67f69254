use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub http: reqwest::Client,
    pub upstream: UpstreamConfig,
}

impl AppStateInner {
    pub fn new(upstream: UpstreamConfig) -> Result<AppState> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("wander/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build upstream HTTP client")?;
        Ok(Arc::new(Self { http, upstream }))
    }
}

/// Where trip lookups are forwarded to, and how hard to try.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Unset URL or token is reported per request as a server misconfiguration
    /// rather than failing startup.
    pub base_url: Option<String>,
    pub token: Option<String>,
    /// Deadline for each attempt.
    pub timeout: Duration,
    /// Retries after the first attempt, for network failures only.
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            token: None,
            timeout: Duration::from_secs(15),
            max_retries: 2,
            backoff: Duration::from_secs(1),
        }
    }
}

impl UpstreamConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let timeout = match std::env::var("WANDER_UPSTREAM_TIMEOUT_SECS") {
            Ok(raw) => Duration::from_secs(raw.parse().context("WANDER_UPSTREAM_TIMEOUT_SECS")?),
            Err(_) => defaults.timeout,
        };
        let max_retries = match std::env::var("WANDER_UPSTREAM_RETRIES") {
            Ok(raw) => raw.parse().context("WANDER_UPSTREAM_RETRIES")?,
            Err(_) => defaults.max_retries,
        };

        Ok(Self {
            base_url: non_empty_var("EXTERNAL_API_URL"),
            token: non_empty_var("EXTERNAL_API_TOKEN"),
            timeout,
            max_retries,
            ..defaults
        })
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_retry_policy() {
        let upstream = UpstreamConfig::default();
        assert_eq!(upstream.timeout, Duration::from_secs(15));
        assert_eq!(upstream.max_retries, 2);
        assert_eq!(upstream.backoff, Duration::from_secs(1));
        assert!(upstream.base_url.is_none());
        assert!(upstream.token.is_none());
    }
}
