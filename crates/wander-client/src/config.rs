use std::path::PathBuf;

use anyhow::{Context, Result};
use reqwest::Url;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Application server; also the scope of the credential cookies.
    pub api_url: Url,
    pub refresh_url: Url,
    pub data_path: PathBuf,
}

impl ClientConfig {
    /// Config for `api_url` with the refresh endpoint on the same host.
    pub fn new(api_url: Url, data_path: impl Into<PathBuf>) -> Result<Self> {
        let refresh_url = default_refresh_url(&api_url)?;
        Ok(Self {
            api_url,
            refresh_url,
            data_path: data_path.into(),
        })
    }

    pub fn from_env() -> Result<Self> {
        let api_url: Url = std::env::var("WANDER_API_URL")
            .unwrap_or_else(|_| "http://localhost:3000".into())
            .parse()
            .context("WANDER_API_URL is not a valid URL")?;

        let refresh_url = match std::env::var("WANDER_REFRESH_URL") {
            Ok(raw) => raw.parse().context("WANDER_REFRESH_URL is not a valid URL")?,
            Err(_) => default_refresh_url(&api_url)?,
        };

        let data_path = std::env::var("WANDER_DATA_PATH").unwrap_or_else(|_| "wander.db".into());

        Ok(Self {
            api_url,
            refresh_url,
            data_path: data_path.into(),
        })
    }
}

fn default_refresh_url(api_url: &Url) -> Result<Url> {
    api_url
        .join("/auth/v1/token?grant_type=refresh_token")
        .context("cannot derive refresh URL")
}
