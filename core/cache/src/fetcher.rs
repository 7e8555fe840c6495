//! Network side of the resource cache.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

use metapm_common::{Error, Result};

use crate::cache::{CachedResponse, ResourceRequest};

/// Performs the real request behind the cache.
///
/// Any HTTP status is a successful fetch; only an unreachable service or a
/// timeout is an error (`Error::Network`).
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &ResourceRequest) -> Result<CachedResponse>;
}

/// reqwest-backed fetcher rooted at the service origin.
pub struct HttpFetcher {
    http: Client,
    base_url: Url,
}

impl HttpFetcher {
    /// # Errors
    /// - `Config` if the base URL does not parse
    /// - `Network` if the HTTP client cannot be built
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("Invalid base URL '{}': {}", base_url, e)))?;
        let http = Client::builder()
            .user_agent(concat!("metapm-cache/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { http, base_url })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &ResourceRequest) -> Result<CachedResponse> {
        let url = self.base_url.join(&request.path).map_err(|e| {
            Error::InvalidInput(format!("Invalid request path '{}': {}", request.path, e))
        })?;

        let response = self
            .http
            .request(request.method.clone(), url)
            .send()
            .await
            .map_err(|e| fetch_error(&request.path, e))?;

        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| fetch_error(&request.path, e))?;

        Ok(CachedResponse {
            status,
            headers,
            body,
            fetched_at: Utc::now(),
        })
    }
}

fn fetch_error(path: &str, err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Network(format!("Fetching {} timed out", path))
    } else {
        Error::Network(format!("Fetching {} failed: {}", path, err))
    }
}
