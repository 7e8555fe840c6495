//! Resource cache for MetaPM static assets and API reads
//!
//! Mirrors the browser cache used by the web client:
//! - Versioned named caches with activation cleanup
//! - Cache-first serving for static assets with background refresh
//! - Network-first serving with stale fallback for API reads
//! - Offline fallback document

pub mod cache;
pub mod fetcher;
pub mod policy;

pub use cache::{CacheStats, CachedResponse, MemoryCache, ResourceCache, ResourceRequest};
pub use fetcher::{Fetcher, HttpFetcher};
pub use policy::{CacheConfig, CachePolicy, CachingFetcher, STALE_HEADER};
