//! Fetching scripts over HTTP.
//!
//! A URL is fetched anonymously first. If that fails it is retried exactly
//! once with the default credentials from the `[download]` config section.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};
use url::Url;

use crate::config::DownloadSettings;
use crate::error::{FleetError, Result};

/// How a fetch authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchAuth {
    Anonymous,
    /// The configured default network credentials.
    DefaultCredentials,
}

/// Fetches script text from a URL.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Performs a single fetch attempt.
    async fn fetch(&self, url: &Url, auth: FetchAuth) -> Result<String>;
}

/// Downloads with one anonymous attempt and one retry using default credentials.
pub async fn download_with_retry(downloader: &dyn Downloader, url: &Url) -> Result<String> {
    let first = match downloader.fetch(url, FetchAuth::Anonymous).await {
        Ok(text) => return Ok(text),
        Err(e) => e,
    };

    warn!(%url, error = %first, "Download failed, retrying with default credentials");

    downloader
        .fetch(url, FetchAuth::DefaultCredentials)
        .await
        .map_err(|second| {
            FleetError::download(format!(
                "Failed to download {url}: {first}; retry with default credentials: {second}"
            ))
        })
}

/// HTTP downloader built on reqwest.
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    client: Client,
    user: Option<String>,
    password: Option<String>,
}

impl HttpDownloader {
    /// Creates a downloader from the download settings.
    pub fn new(settings: &DownloadSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| FleetError::internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            user: settings.user.clone(),
            password: settings.password.clone(),
        })
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn fetch(&self, url: &Url, auth: FetchAuth) -> Result<String> {
        let mut request = self.client.get(url.clone());

        if auth == FetchAuth::DefaultCredentials {
            let user = self.user.as_deref().ok_or_else(|| {
                FleetError::download(
                    "No default credentials configured (set SQLFLEET_HTTP_USER or [download] user)",
                )
            })?;
            request = request.basic_auth(user, self.password.as_deref());
        }

        debug!(%url, ?auth, "Fetching script");

        let response = request
            .send()
            .await
            .map_err(|e| FleetError::download(format!("Request to {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FleetError::download(format!("{url} returned HTTP {status}")));
        }

        response
            .text()
            .await
            .map_err(|e| FleetError::download(format!("Failed to read response from {url}: {e}")))
    }
}
