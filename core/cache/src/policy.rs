//! Cache-first and network-first serving policies.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use metapm_common::{Error, Result};

use crate::cache::{CacheStats, CachedResponse, ResourceCache, ResourceRequest};
use crate::fetcher::Fetcher;

/// Header marking a response served from cache after a network failure.
pub const STALE_HEADER: &str = "x-metapm-cache";

/// How a request class is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CachePolicy {
    /// Serve cached copy immediately and refresh it in the background.
    CacheFirst,
    /// Try the network; fall back to a stale cached copy.
    NetworkFirst,
}

/// Configuration of the caching front end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Name of the current cache version.
    pub version: String,
    /// Paths stored on install.
    pub precache: Vec<String>,
    /// Page served for document requests when the network is unreachable.
    pub offline_fallback: Option<String>,
    /// Policy for requests outside `/api/`.
    pub static_policy: CachePolicy,
    /// Policy for `/api/` reads. `None` always goes to the network.
    pub api_policy: Option<CachePolicy>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            version: "metapm-v1".to_string(),
            precache: vec![
                "/static/capture.html".to_string(),
                "/static/manifest.json".to_string(),
            ],
            offline_fallback: Some("/static/capture.html".to_string()),
            static_policy: CachePolicy::CacheFirst,
            api_policy: None,
        }
    }
}

/// Fetch front end that consults a [`ResourceCache`] per [`CachePolicy`].
pub struct CachingFetcher<C: ?Sized, F: ?Sized> {
    cache: Arc<C>,
    fetcher: Arc<F>,
    config: CacheConfig,
    stats: Arc<Mutex<CacheStats>>,
}

impl<C, F> CachingFetcher<C, F>
where
    C: ResourceCache + ?Sized + 'static,
    F: Fetcher + ?Sized + 'static,
{
    pub fn new(cache: Arc<C>, fetcher: Arc<F>, config: CacheConfig) -> Self {
        Self {
            cache,
            fetcher,
            config,
            stats: Arc::new(Mutex::new(CacheStats::default())),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub async fn stats(&self) -> CacheStats {
        self.stats.lock().await.clone()
    }

    /// Fill the current version with every precache path.
    ///
    /// All-or-nothing: nothing is stored unless every path answers 200.
    ///
    /// # Errors
    /// - `Network` if a path cannot be fetched
    /// - `Http` if a path answers with anything but 200
    pub async fn install(&self) -> Result<usize> {
        let mut fetched = Vec::with_capacity(self.config.precache.len());
        for path in &self.config.precache {
            let request = ResourceRequest::get(path.as_str());
            let response = self.fetcher.fetch(&request).await?;
            if !response.is_cacheable() {
                return Err(Error::Http {
                    status: response.status,
                    body: format!("Precache of {} failed", path),
                });
            }
            fetched.push((request, response));
        }

        let count = fetched.len();
        for (request, response) in fetched {
            self.cache.put(&self.config.version, &request, response).await?;
        }
        info!("Precached {} resources into {}", count, self.config.version);
        Ok(count)
    }

    /// Drop every cache version except the current one.
    pub async fn activate(&self) -> Result<Vec<String>> {
        self.cache.delete_all_except(&self.config.version).await
    }

    /// Policy applied to a request, or `None` when it bypasses the cache.
    pub fn policy_for(&self, request: &ResourceRequest) -> Option<CachePolicy> {
        if !request.is_get() {
            return None;
        }
        if request.is_api() {
            self.config.api_policy
        } else {
            Some(self.config.static_policy)
        }
    }

    /// Serve a request.
    ///
    /// # Errors
    /// - `Network` when the network fails and no cached copy applies
    pub async fn handle(&self, request: &ResourceRequest) -> Result<CachedResponse> {
        match self.policy_for(request) {
            None => self.fetcher.fetch(request).await,
            Some(CachePolicy::CacheFirst) => self.cache_first(request).await,
            Some(CachePolicy::NetworkFirst) => self.network_first(request).await,
        }
    }

    async fn cache_first(&self, request: &ResourceRequest) -> Result<CachedResponse> {
        if let Some(cached) = self.lookup(request).await {
            self.stats.lock().await.hits += 1;
            self.spawn_refresh(request.clone());
            return Ok(cached);
        }
        self.stats.lock().await.misses += 1;

        match self.fetcher.fetch(request).await {
            Ok(response) => {
                self.store(request, &response).await;
                Ok(response)
            }
            Err(e) => self.offline_fallback(request, e).await,
        }
    }

    async fn network_first(&self, request: &ResourceRequest) -> Result<CachedResponse> {
        match self.fetcher.fetch(request).await {
            Ok(response) => {
                self.store(request, &response).await;
                Ok(response)
            }
            Err(e) => match self.lookup(request).await {
                Some(cached) => {
                    debug!("Serving stale {} after: {}", request.path, e);
                    self.stats.lock().await.stale_served += 1;
                    Ok(cached.with_header(STALE_HEADER, "stale"))
                }
                None => self.offline_fallback(request, e).await,
            },
        }
    }

    async fn offline_fallback(&self, request: &ResourceRequest, err: Error) -> Result<CachedResponse> {
        let fallback = match (&self.config.offline_fallback, request.document) {
            (Some(path), true) => path,
            _ => return Err(err),
        };
        match self.lookup(&ResourceRequest::get(fallback.as_str())).await {
            Some(page) => {
                debug!("Serving offline page for {}", request.path);
                Ok(page)
            }
            None => Err(err),
        }
    }

    async fn lookup(&self, request: &ResourceRequest) -> Option<CachedResponse> {
        match self.cache.match_request(request).await {
            Ok(found) => found,
            Err(e) => {
                warn!("Cache lookup for {} failed: {}", request.path, e);
                None
            }
        }
    }

    async fn store(&self, request: &ResourceRequest, response: &CachedResponse) {
        if !response.is_cacheable() {
            return;
        }
        if let Err(e) = self
            .cache
            .put(&self.config.version, request, response.clone())
            .await
        {
            warn!("Failed to cache {}: {}", request.path, e);
        }
    }

    fn spawn_refresh(&self, request: ResourceRequest) {
        let cache = self.cache.clone();
        let fetcher = self.fetcher.clone();
        let stats = self.stats.clone();
        let version = self.config.version.clone();

        tokio::spawn(async move {
            match fetcher.fetch(&request).await {
                Ok(response) if response.is_cacheable() => {
                    match cache.put(&version, &request, response).await {
                        Ok(()) => stats.lock().await.refreshes += 1,
                        Err(e) => warn!("Background refresh of {} not stored: {}", request.path, e),
                    }
                }
                Ok(response) => {
                    debug!("Background refresh of {} returned {}", request.path, response.status)
                }
                Err(e) => debug!("Background refresh of {} failed: {}", request.path, e),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use async_trait::async_trait;
    use bytes::Bytes;
    use reqwest::Method;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct MockFetcher {
        online: AtomicBool,
        calls: AtomicUsize,
        bodies: StdMutex<HashMap<String, (u16, &'static str)>>,
    }

    impl MockFetcher {
        fn new(routes: &[(&str, u16, &'static str)]) -> Self {
            Self {
                online: AtomicBool::new(true),
                calls: AtomicUsize::new(0),
                bodies: StdMutex::new(
                    routes
                        .iter()
                        .map(|(path, status, body)| (path.to_string(), (*status, *body)))
                        .collect(),
                ),
            }
        }

        fn set_body(&self, path: &str, body: &'static str) {
            self.bodies.lock().unwrap().insert(path.to_string(), (200, body));
        }
    }

    #[async_trait]
    impl Fetcher for MockFetcher {
        async fn fetch(&self, request: &ResourceRequest) -> Result<CachedResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.online.load(Ordering::SeqCst) {
                return Err(Error::Network("offline".to_string()));
            }
            let (status, body) = self
                .bodies
                .lock()
                .unwrap()
                .get(&request.path)
                .copied()
                .unwrap_or((404, ""));
            Ok(CachedResponse::new(status, body))
        }
    }

    fn front(
        fetcher: Arc<MockFetcher>,
        config: CacheConfig,
    ) -> (Arc<MemoryCache>, CachingFetcher<MemoryCache, MockFetcher>) {
        let cache = Arc::new(MemoryCache::new());
        (cache.clone(), CachingFetcher::new(cache, fetcher, config))
    }

    #[tokio::test]
    async fn test_install_and_offline_fallback() {
        let fetcher = Arc::new(MockFetcher::new(&[
            ("/static/capture.html", 200, "<html>capture</html>"),
            ("/static/manifest.json", 200, "{}"),
        ]));
        let (_cache, front) = front(fetcher.clone(), CacheConfig::default());

        assert_eq!(front.install().await.unwrap(), 2);

        fetcher.online.store(false, Ordering::SeqCst);
        let page = front.handle(&ResourceRequest::document("/dashboard")).await.unwrap();
        assert_eq!(page.body, Bytes::from_static(b"<html>capture</html>"));

        // Non-document misses surface the network error.
        let err = front
            .handle(&ResourceRequest::get("/static/app.js"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Network(_)));
    }

    #[tokio::test]
    async fn test_install_is_all_or_nothing() {
        let fetcher = Arc::new(MockFetcher::new(&[("/static/capture.html", 200, "x")]));
        let (cache, front) = front(fetcher, CacheConfig::default());

        let err = front.install().await.unwrap_err();
        assert!(matches!(err, Error::Http { status: 404, .. }));
        assert_eq!(cache.entry_count("metapm-v1"), 0);
    }

    #[tokio::test]
    async fn test_cache_first_refreshes_in_background() {
        let fetcher = Arc::new(MockFetcher::new(&[("/static/app.js", 200, "v1")]));
        let (cache, front) = front(fetcher.clone(), CacheConfig::default());
        let request = ResourceRequest::get("/static/app.js");

        assert_eq!(front.handle(&request).await.unwrap().body, Bytes::from_static(b"v1"));

        fetcher.set_body("/static/app.js", "v2");
        // Served from cache; the refresh happens behind it.
        assert_eq!(front.handle(&request).await.unwrap().body, Bytes::from_static(b"v1"));

        tokio::time::timeout(Duration::from_secs(5), async {
            while front.stats().await.refreshes == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let cached = cache.match_request(&request).await.unwrap().unwrap();
        assert_eq!(cached.body, Bytes::from_static(b"v2"));

        let stats = front.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_network_first_marks_stale() {
        let fetcher = Arc::new(MockFetcher::new(&[("/api/tasks", 200, "{\"tasks\":[]}")]));
        let config = CacheConfig {
            api_policy: Some(CachePolicy::NetworkFirst),
            ..CacheConfig::default()
        };
        let (_cache, front) = front(fetcher.clone(), config);
        let request = ResourceRequest::get("/api/tasks");

        let fresh = front.handle(&request).await.unwrap();
        assert!(fresh.header(STALE_HEADER).is_none());

        fetcher.online.store(false, Ordering::SeqCst);
        let stale = front.handle(&request).await.unwrap();
        assert_eq!(stale.header(STALE_HEADER), Some("stale"));
        assert_eq!(stale.body, fresh.body);
        assert_eq!(front.stats().await.stale_served, 1);
    }

    #[tokio::test]
    async fn test_api_and_writes_bypass_cache() {
        let fetcher = Arc::new(MockFetcher::new(&[("/api/tasks", 200, "{}")]));
        let (cache, front) = front(fetcher.clone(), CacheConfig::default());

        front.handle(&ResourceRequest::get("/api/tasks")).await.unwrap();
        let post = ResourceRequest {
            method: Method::POST,
            ..ResourceRequest::get("/static/app.js")
        };
        assert!(front.policy_for(&post).is_none());
        front.handle(&post).await.unwrap();

        assert_eq!(cache.entry_count("metapm-v1"), 0);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_200_not_cached() {
        let fetcher = Arc::new(MockFetcher::new(&[("/static/missing.css", 404, "")]));
        let (cache, front) = front(fetcher, CacheConfig::default());

        let response = front.handle(&ResourceRequest::get("/static/missing.css")).await.unwrap();
        assert_eq!(response.status, 404);
        assert_eq!(cache.entry_count("metapm-v1"), 0);
    }

    #[tokio::test]
    async fn test_activate_drops_old_versions() {
        let fetcher = Arc::new(MockFetcher::new(&[]));
        let config = CacheConfig {
            version: "metapm-v2".to_string(),
            ..CacheConfig::default()
        };
        let (cache, front) = front(fetcher, config);
        cache
            .put("metapm-v1", &ResourceRequest::get("/x"), CachedResponse::new(200, "old"))
            .await
            .unwrap();

        assert_eq!(front.activate().await.unwrap(), vec!["metapm-v1"]);
        assert!(cache.versions().await.unwrap().is_empty());
    }
}
