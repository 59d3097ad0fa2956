//! Title-refresh webhook for Radarr and Sonarr.

use crate::config::{RefreshConfig, RefreshKind};
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{kind:?} rejected refresh command ({status}): {body}")]
    Rejected {
        kind: RefreshKind,
        status: u16,
        body: String,
    },
}

/// Posts refresh commands to a media-library manager.
pub struct RefreshClient {
    client: Client,
    kind: RefreshKind,
    base_url: String,
    api_key: String,
}

impl RefreshClient {
    pub fn new(config: &RefreshConfig) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build HTTP client with timeout: {}", e);
                Client::new()
            });

        Self {
            client,
            kind: config.kind,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        }
    }

    pub fn kind(&self) -> RefreshKind {
        self.kind
    }

    /// Command body refreshing the title with `id`.
    pub fn command(&self, id: u64) -> serde_json::Value {
        match self.kind {
            RefreshKind::Radarr => json!({ "name": "RefreshMovie", "movieIds": [id] }),
            RefreshKind::Sonarr => json!({ "name": "RefreshSeries", "seriesId": id }),
        }
    }

    pub async fn refresh(&self, id: u64) -> Result<(), RefreshError> {
        let response = self
            .client
            .post(format!("{}/api/v3/command", self.base_url))
            .header("X-Api-Key", &self.api_key)
            .json(&self.command(id))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RefreshError::Rejected {
                kind: self.kind,
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        info!(kind = ?self.kind, id, "Requested title refresh");
        Ok(())
    }
}
