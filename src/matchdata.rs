use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;

use crate::config::FeedConfig;

#[derive(Debug, Error)]
pub(crate) enum FeedError {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("feed returned status {0}")]
    Status(StatusCode),
}

/// The bout currently in progress, before any winner exists.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct CurrentBout {
    pub(crate) red: String,
    pub(crate) blue: String,
    pub(crate) freshness: String,
}

/// A concluded (or concluding) bout from the feed's history.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Bout {
    pub(crate) id: String,
    pub(crate) red: String,
    pub(crate) blue: String,
    pub(crate) winner: Option<String>,
}

/// Read side of the external match-data service. Transient failures
/// surface as `FeedError`; retry policy belongs to the caller.
#[async_trait]
pub(crate) trait BoutFeed: Send + Sync {
    async fn current_bout(&self) -> Result<CurrentBout, FeedError>;
    async fn bout_after(&self, id: &str) -> Result<Option<Bout>, FeedError>;
    async fn most_recent_bout(&self) -> Result<Option<Bout>, FeedError>;
}

pub(crate) struct HttpBoutFeed {
    client: Client,
    base_url: String,
}

impl HttpBoutFeed {
    pub(crate) fn new(cfg: &FeedConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_seconds))
            .build()?;
        Ok(Self { client, base_url: cfg.base_url.trim_end_matches('/').to_string() })
    }

    async fn fetch_optional_bout(&self, url: String) -> Result<Option<Bout>, FeedError> {
        let resp = self.client.get(&url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(FeedError::Status(resp.status()));
        }
        Ok(Some(resp.json::<Bout>().await?))
    }
}

#[async_trait]
impl BoutFeed for HttpBoutFeed {
    async fn current_bout(&self) -> Result<CurrentBout, FeedError> {
        let resp = self
            .client
            .get(format!("{}/bouts/current", self.base_url))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(FeedError::Status(resp.status()));
        }
        Ok(resp.json::<CurrentBout>().await?)
    }

    async fn bout_after(&self, id: &str) -> Result<Option<Bout>, FeedError> {
        self.fetch_optional_bout(format!("{}/bouts/after/{}", self.base_url, id))
            .await
    }

    async fn most_recent_bout(&self) -> Result<Option<Bout>, FeedError> {
        self.fetch_optional_bout(format!("{}/bouts/latest", self.base_url))
            .await
    }
}
