//! Outbound HTTP capability used by C3 (index download) and C5 (archive
//! download). Kept as a small abstract trait per the design notes on
//! dynamic dispatch — an arena+index pattern is unnecessary here.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("not found")]
    NotFound,
    #[error("download failed: {0}")]
    Other(String),
}

#[async_trait::async_trait]
pub trait HttpClient: Send + Sync {
    /// GETs `url` with the given timeout, returning the full response body.
    async fn get_bytes(&self, url: &str, timeout: Duration) -> Result<Vec<u8>, DownloadError>;
}

pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl Default for ReqwestClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl HttpClient for ReqwestClient {
    async fn get_bytes(&self, url: &str, timeout: Duration) -> Result<Vec<u8>, DownloadError> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| DownloadError::Other(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(DownloadError::NotFound);
        }
        if !response.status().is_success() {
            return Err(DownloadError::Other(format!("status {}", response.status())));
        }

        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| DownloadError::Other(e.to_string()))
    }
}
