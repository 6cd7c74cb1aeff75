//! Cache for decoded-adjacent index data: postings lists and series records.
//!
//! Keys are `P:<ulid>:<name>=<value>` and `S:<ulid>:<ref>`; values are the
//! raw index bytes. Backed by any `ObjectCache`, so the same code serves the
//! in-memory LRU tier and a memcached-style remote tier (whose client does
//! the batch splitting and bounded parallelism). Every requested key lands
//! in exactly one of hits or misses.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use ulid::Ulid;

use crate::objstore::cache::{InMemoryCache, ObjectCache};

pub const DEFAULT_INDEX_CACHE_TTL: Duration = Duration::from_secs(24 * 3600);

pub trait IndexCache: Send + Sync {
    fn store_postings<'a>(
        &'a self,
        block: Ulid,
        name: &'a str,
        value: &'a str,
        data: Vec<u8>,
    ) -> BoxFuture<'a, ()>;

    /// Returns hits keyed by `(name, value)` plus the missed pairs.
    #[allow(clippy::type_complexity)]
    fn fetch_multi_postings<'a>(
        &'a self,
        block: Ulid,
        keys: &'a [(String, String)],
    ) -> BoxFuture<'a, (HashMap<(String, String), Vec<u8>>, Vec<(String, String)>)>;

    fn store_series<'a>(&'a self, block: Ulid, series_ref: u64, data: Vec<u8>) -> BoxFuture<'a, ()>;

    #[allow(clippy::type_complexity)]
    fn fetch_multi_series<'a>(
        &'a self,
        block: Ulid,
        refs: &'a [u64],
    ) -> BoxFuture<'a, (HashMap<u64, Vec<u8>>, Vec<u64>)>;
}

fn postings_key(block: Ulid, name: &str, value: &str) -> String {
    format!("P:{}:{}={}", block, name, value)
}

fn series_key(block: Ulid, series_ref: u64) -> String {
    format!("S:{}:{}", block, series_ref)
}

/// `IndexCache` over an `ObjectCache` backend.
pub struct CacheIndexCache {
    cache: Arc<dyn ObjectCache>,
    ttl: Duration,
}

impl CacheIndexCache {
    pub fn new(cache: Arc<dyn ObjectCache>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    /// The in-memory tier: byte-budgeted LRU, effectively no TTL.
    pub fn in_memory(max_bytes: u64, max_item_bytes: u64) -> Self {
        Self::new(
            Arc::new(InMemoryCache::new("index-cache", max_bytes, max_item_bytes)),
            DEFAULT_INDEX_CACHE_TTL,
        )
    }
}

impl IndexCache for CacheIndexCache {
    fn store_postings<'a>(
        &'a self,
        block: Ulid,
        name: &'a str,
        value: &'a str,
        data: Vec<u8>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.cache
                .store(postings_key(block, name, value), data, self.ttl)
                .await;
        })
    }

    fn fetch_multi_postings<'a>(
        &'a self,
        block: Ulid,
        keys: &'a [(String, String)],
    ) -> BoxFuture<'a, (HashMap<(String, String), Vec<u8>>, Vec<(String, String)>)> {
        Box::pin(async move {
            let cache_keys: Vec<String> = keys
                .iter()
                .map(|(name, value)| postings_key(block, name, value))
                .collect();
            let mut raw = self.cache.fetch_multi(&cache_keys).await;

            let mut hits = HashMap::new();
            let mut misses = Vec::new();
            for (pair, cache_key) in keys.iter().zip(cache_keys.iter()) {
                match raw.remove(cache_key) {
                    Some(data) => {
                        hits.insert(pair.clone(), data);
                    }
                    None => misses.push(pair.clone()),
                }
            }
            (hits, misses)
        })
    }

    fn store_series<'a>(&'a self, block: Ulid, series_ref: u64, data: Vec<u8>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.cache
                .store(series_key(block, series_ref), data, self.ttl)
                .await;
        })
    }

    fn fetch_multi_series<'a>(
        &'a self,
        block: Ulid,
        refs: &'a [u64],
    ) -> BoxFuture<'a, (HashMap<u64, Vec<u8>>, Vec<u64>)> {
        Box::pin(async move {
            let cache_keys: Vec<String> = refs.iter().map(|r| series_key(block, *r)).collect();
            let mut raw = self.cache.fetch_multi(&cache_keys).await;

            let mut hits = HashMap::new();
            let mut misses = Vec::new();
            for (r, cache_key) in refs.iter().zip(cache_keys.iter()) {
                match raw.remove(cache_key) {
                    Some(data) => {
                        hits.insert(*r, data);
                    }
                    None => misses.push(*r),
                }
            }
            (hits, misses)
        })
    }
}

/// Two tiers chained: the in-memory tier is consulted first, remote misses
/// are backfilled into it.
pub struct TieredIndexCache {
    local: CacheIndexCache,
    remote: CacheIndexCache,
}

impl TieredIndexCache {
    pub fn new(local: CacheIndexCache, remote: CacheIndexCache) -> Self {
        Self { local, remote }
    }
}

impl IndexCache for TieredIndexCache {
    fn store_postings<'a>(
        &'a self,
        block: Ulid,
        name: &'a str,
        value: &'a str,
        data: Vec<u8>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.local
                .store_postings(block, name, value, data.clone())
                .await;
            self.remote.store_postings(block, name, value, data).await;
        })
    }

    fn fetch_multi_postings<'a>(
        &'a self,
        block: Ulid,
        keys: &'a [(String, String)],
    ) -> BoxFuture<'a, (HashMap<(String, String), Vec<u8>>, Vec<(String, String)>)> {
        Box::pin(async move {
            let (mut hits, misses) = self.local.fetch_multi_postings(block, keys).await;
            if misses.is_empty() {
                return (hits, misses);
            }
            let (remote_hits, remote_misses) =
                self.remote.fetch_multi_postings(block, &misses).await;
            for ((name, value), data) in remote_hits {
                self.local
                    .store_postings(block, &name, &value, data.clone())
                    .await;
                hits.insert((name, value), data);
            }
            (hits, remote_misses)
        })
    }

    fn store_series<'a>(&'a self, block: Ulid, series_ref: u64, data: Vec<u8>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.local.store_series(block, series_ref, data.clone()).await;
            self.remote.store_series(block, series_ref, data).await;
        })
    }

    fn fetch_multi_series<'a>(
        &'a self,
        block: Ulid,
        refs: &'a [u64],
    ) -> BoxFuture<'a, (HashMap<u64, Vec<u8>>, Vec<u64>)> {
        Box::pin(async move {
            let (mut hits, misses) = self.local.fetch_multi_series(block, refs).await;
            if misses.is_empty() {
                return (hits, misses);
            }
            let (remote_hits, remote_misses) = self.remote.fetch_multi_series(block, &misses).await;
            for (r, data) in remote_hits {
                self.local.store_series(block, r, data.clone()).await;
                hits.insert(r, data);
            }
            (hits, remote_misses)
        })
    }
}
