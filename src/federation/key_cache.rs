//! Public Key Caching
//!
//! Caches fetched peer public keys to reduce remote requests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use super::fetch::{ActorFetcher, PublishedKey};
use crate::error::AppError;

/// Cached public key entry
#[derive(Debug, Clone)]
struct CachedKey {
    key: PublishedKey,
    cached_at: Instant,
    ttl: Duration,
}

impl CachedKey {
    fn is_valid(&self) -> bool {
        self.cached_at.elapsed() < self.ttl
    }
}

/// Result of a cache lookup
#[derive(Debug, Clone)]
pub struct KeyLookup {
    pub key: PublishedKey,
    /// The key came from the cache rather than a fresh fetch
    pub cached: bool,
}

/// Public key cache
///
/// Thread-safe cache of peer public keys keyed by signature `keyId`.
pub struct PublicKeyCache {
    cache: Arc<RwLock<HashMap<String, CachedKey>>>,
    fetcher: Arc<ActorFetcher>,
    default_ttl: Duration,
}

impl PublicKeyCache {
    pub fn new(fetcher: Arc<ActorFetcher>, default_ttl: Duration) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            fetcher,
            default_ttl,
        }
    }

    /// Get public key for a key ID
    ///
    /// Checks cache first, fetches from remote if not cached or expired.
    pub async fn get(&self, key_id: &str) -> Result<KeyLookup, AppError> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(key_id) {
                if cached.is_valid() {
                    tracing::debug!(key_id = %key_id, "Public key cache hit");
                    crate::metrics::PUBLIC_KEY_CACHE_HITS
                        .with_label_values(&["hit"])
                        .inc();
                    return Ok(KeyLookup {
                        key: cached.key.clone(),
                        cached: true,
                    });
                }
                tracing::debug!(key_id = %key_id, "Public key cache expired");
            }
        }

        crate::metrics::PUBLIC_KEY_CACHE_HITS
            .with_label_values(&["miss"])
            .inc();
        tracing::debug!(key_id = %key_id, "Public key cache miss, fetching");
        let key = self.fetcher.fetch_public_key(key_id).await?;
        self.insert(key.clone()).await;

        Ok(KeyLookup { key, cached: false })
    }

    pub async fn insert(&self, key: PublishedKey) {
        let mut cache = self.cache.write().await;
        cache.insert(
            key.id.clone(),
            CachedKey {
                key,
                cached_at: Instant::now(),
                ttl: self.default_ttl,
            },
        );
    }

    /// Invalidate a cached key
    ///
    /// Used when a cached key fails to verify, typically after rotation.
    pub async fn invalidate(&self, key_id: &str) {
        let mut cache = self.cache.write().await;
        cache.remove(key_id);
        tracing::debug!(key_id = %key_id, "Invalidated public key cache entry");
    }

    /// Get cache statistics
    pub async fn stats(&self) -> CacheStats {
        let cache = self.cache.read().await;
        let total = cache.len();
        let valid = cache.values().filter(|v| v.is_valid()).count();

        CacheStats {
            total_entries: total,
            valid_entries: valid,
            expired_entries: total - valid,
        }
    }

    /// Prune expired entries
    ///
    /// Should be called periodically to clean up expired entries.
    pub async fn prune_expired(&self) {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|_, v| v.is_valid());
        let removed = before - cache.len();

        if removed > 0 {
            tracing::info!(removed, "Pruned expired public key cache entries");
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub total_entries: usize,
    pub valid_entries: usize,
    pub expired_entries: usize,
}
