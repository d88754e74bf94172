//! Integration tests for sqlfleet.

pub mod batch_test;
pub mod cleanup_test;
pub mod membership_test;
pub mod resolve_test;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use url::Url;

use sqlfleet::batch::ConnectionBinder;
use sqlfleet::db::{ConnectOptions, MockConnector};
use sqlfleet::error::{FleetError, Result};
use sqlfleet::instance::SeparatorClassifier;
use sqlfleet::resolve::{Downloader, FetchAuth, InputResolver, TempArtifactManager};

/// Builds a binder over mock servers with default pooling.
pub fn mock_binder(connector: MockConnector) -> ConnectionBinder {
    ConnectionBinder::new(
        Arc::new(connector),
        ConnectOptions::default(),
        SeparatorClassifier::default().shared(),
    )
}

/// How a scripted URL responds to each authentication mode.
#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    pub anonymous: Option<String>,
    pub with_credentials: Option<String>,
}

/// Downloader serving canned responses and recording every attempt.
#[derive(Debug, Default)]
pub struct ScriptedDownloader {
    responses: HashMap<String, ScriptedResponse>,
    pub attempts: Mutex<Vec<(String, FetchAuth)>>,
}

impl ScriptedDownloader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(mut self, url: &str, anonymous: Option<&str>, with_credentials: Option<&str>) -> Self {
        self.responses.insert(
            url.to_string(),
            ScriptedResponse {
                anonymous: anonymous.map(String::from),
                with_credentials: with_credentials.map(String::from),
            },
        );
        self
    }

    pub fn attempts(&self) -> Vec<(String, FetchAuth)> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Downloader for ScriptedDownloader {
    async fn fetch(&self, url: &Url, auth: FetchAuth) -> Result<String> {
        self.attempts.lock().unwrap().push((url.to_string(), auth));
        let response = self
            .responses
            .get(url.as_str())
            .ok_or_else(|| FleetError::download(format!("{url} returned HTTP 404 Not Found")))?;
        let body = match auth {
            FetchAuth::Anonymous => &response.anonymous,
            FetchAuth::DefaultCredentials => &response.with_credentials,
        };
        body.clone()
            .ok_or_else(|| FleetError::download(format!("{url} returned HTTP 401 Unauthorized")))
    }
}

/// Builds a resolver with the given downloader and scratch directory.
pub fn resolver(downloader: Arc<dyn Downloader>, scratch: &Path) -> InputResolver {
    InputResolver::new(
        vec!["sql".to_string()],
        downloader,
        Arc::new(TempArtifactManager::new(scratch)),
    )
}

/// Number of entries in a directory (0 if it does not exist).
pub fn entries(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}
