//! Cached response types and the versioned cache store.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::Method;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use tracing::{debug, info};

use metapm_common::{Error, Result};

/// A read request as seen by the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    pub method: Method,
    /// Path plus query, e.g. `/static/capture.html`.
    pub path: String,
    /// Top-level navigation, eligible for the offline fallback page.
    pub document: bool,
}

impl ResourceRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            document: false,
        }
    }

    pub fn document(path: impl Into<String>) -> Self {
        Self {
            document: true,
            ..Self::get(path)
        }
    }

    /// Whether the request targets the JSON API.
    pub fn is_api(&self) -> bool {
        self.path.contains("/api/")
    }

    pub fn is_get(&self) -> bool {
        self.method == Method::GET
    }
}

/// A response body with the metadata the cache keeps.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub status: u16,
    /// Lower-cased header names.
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
    pub fetched_at: DateTime<Utc>,
}

impl CachedResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
            fetched_at: Utc::now(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Only complete 200 responses are stored.
    pub fn is_cacheable(&self) -> bool {
        self.status == 200
    }
}

/// Hit/miss counters for a caching front end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Responses served from cache after a network failure.
    pub stale_served: u64,
    /// Background refreshes that replaced a cached entry.
    pub refreshes: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Versioned store of cached responses.
///
/// Each version is a named cache; lookups search every version in creation
/// order.
#[async_trait]
pub trait ResourceCache: Send + Sync {
    /// Find a stored response for the request in any version.
    async fn match_request(&self, request: &ResourceRequest) -> Result<Option<CachedResponse>>;

    /// Store a response under `version`, creating the version if needed.
    ///
    /// # Errors
    /// - `InvalidInput` for anything other than a GET request
    async fn put(
        &self,
        version: &str,
        request: &ResourceRequest,
        response: CachedResponse,
    ) -> Result<()>;

    /// Version names in creation order.
    async fn versions(&self) -> Result<Vec<String>>;

    /// Drop one version. Returns whether it existed.
    async fn delete_version(&self, version: &str) -> Result<bool>;

    /// Drop every version other than `current`. Returns the dropped names.
    async fn delete_all_except(&self, current: &str) -> Result<Vec<String>> {
        let mut deleted = Vec::new();
        for version in self.versions().await? {
            if version != current && self.delete_version(&version).await? {
                deleted.push(version);
            }
        }
        Ok(deleted)
    }
}

/// In-memory cache store.
#[derive(Default)]
pub struct MemoryCache {
    versions: RwLock<Vec<(String, HashMap<String, CachedResponse>)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries held under `version`.
    pub fn entry_count(&self, version: &str) -> usize {
        self.versions
            .read()
            .map(|versions| {
                versions
                    .iter()
                    .find(|(name, _)| name == version)
                    .map_or(0, |(_, entries)| entries.len())
            })
            .unwrap_or(0)
    }
}

fn poisoned<T>(_: T) -> Error {
    Error::Storage("Cache lock poisoned".to_string())
}

#[async_trait]
impl ResourceCache for MemoryCache {
    async fn match_request(&self, request: &ResourceRequest) -> Result<Option<CachedResponse>> {
        if !request.is_get() {
            return Ok(None);
        }
        let versions = self.versions.read().map_err(poisoned)?;
        Ok(versions
            .iter()
            .find_map(|(_, entries)| entries.get(&request.path))
            .cloned())
    }

    async fn put(
        &self,
        version: &str,
        request: &ResourceRequest,
        response: CachedResponse,
    ) -> Result<()> {
        if !request.is_get() {
            return Err(Error::InvalidInput(format!(
                "Cannot cache {} {}",
                request.method, request.path
            )));
        }

        let mut versions = self.versions.write().map_err(poisoned)?;
        let index = match versions.iter().position(|(name, _)| name == version) {
            Some(index) => index,
            None => {
                debug!("Opening cache {}", version);
                versions.push((version.to_string(), HashMap::new()));
                versions.len() - 1
            }
        };
        versions[index].1.insert(request.path.clone(), response);
        Ok(())
    }

    async fn versions(&self) -> Result<Vec<String>> {
        let versions = self.versions.read().map_err(poisoned)?;
        Ok(versions.iter().map(|(name, _)| name.clone()).collect())
    }

    async fn delete_version(&self, version: &str) -> Result<bool> {
        let mut versions = self.versions.write().map_err(poisoned)?;
        let before = versions.len();
        versions.retain(|(name, _)| name != version);
        let removed = versions.len() != before;
        if removed {
            info!("Deleted cache {}", version);
        }
        Ok(removed)
    }
}
