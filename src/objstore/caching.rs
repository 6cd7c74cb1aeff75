//! Transparent caching layer over a bucket.
//!
//! Each operation kind carries its own cache instance, TTL and object-name
//! matcher. Ranged reads over large files (index, chunk segments) are cached
//! as fixed-size aligned subranges; a read computes the touched subranges,
//! serves hits from cache and coalesces the misses into at most
//! `max_sub_requests` backing requests. Cached data may be stale up to its
//! TTL but is never newer than the backing bucket; writes bypass all read
//! caches.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::format_err;
use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;

use super::cache::ObjectCache;
use super::{range_bounds, BucketError, BucketResult, ObjectBucket};

pub const DEFAULT_CHUNK_SUBRANGE_SIZE: u64 = 16 * 1024;
pub const DEFAULT_INDEX_SUBRANGE_SIZE: u64 = 32 * 1024;
pub const DEFAULT_MAX_SUB_REQUESTS: usize = 3;

pub type NameMatcher = Arc<dyn Fn(&str) -> bool + Send + Sync>;

struct IterConfig {
    matcher: NameMatcher,
    cache: Arc<dyn ObjectCache>,
    ttl: Duration,
}

struct ExistsConfig {
    matcher: NameMatcher,
    cache: Arc<dyn ObjectCache>,
    exists_ttl: Duration,
    doesnt_exist_ttl: Duration,
}

struct GetConfig {
    matcher: NameMatcher,
    cache: Arc<dyn ObjectCache>,
    max_size: usize,
    content_ttl: Duration,
    exists_ttl: Duration,
    doesnt_exist_ttl: Duration,
}

struct SizeConfig {
    matcher: NameMatcher,
    cache: Arc<dyn ObjectCache>,
    ttl: Duration,
}

struct RangeConfig {
    matcher: NameMatcher,
    cache: Arc<dyn ObjectCache>,
    subrange_size: u64,
    subrange_ttl: Duration,
    size_ttl: Duration,
    max_sub_requests: usize,
}

/// Counters around the subrange path, also exercised by tests.
#[derive(Debug, Default)]
pub struct RangeStats {
    /// bytes of the requested windows
    pub requested_bytes: AtomicU64,
    /// bytes served out of the cache
    pub cached_bytes: AtomicU64,
    /// bytes fetched from the backing bucket
    pub fetched_bytes: AtomicU64,
    /// cached bytes refetched because of request coalescing
    pub refetched_bytes: AtomicU64,
    /// ranged requests issued to the backing bucket
    pub backing_requests: AtomicU64,
}

pub struct CachingBucket {
    backing: Arc<dyn ObjectBucket>,
    iter_configs: Vec<IterConfig>,
    exists_configs: Vec<ExistsConfig>,
    get_configs: Vec<GetConfig>,
    size_configs: Vec<SizeConfig>,
    range_configs: Vec<RangeConfig>,
    pub range_stats: RangeStats,
}

impl CachingBucket {
    pub fn new(backing: Arc<dyn ObjectBucket>) -> Self {
        Self {
            backing,
            iter_configs: Vec::new(),
            exists_configs: Vec::new(),
            get_configs: Vec::new(),
            size_configs: Vec::new(),
            range_configs: Vec::new(),
            range_stats: RangeStats::default(),
        }
    }

    pub fn cache_iter(mut self, matcher: NameMatcher, cache: Arc<dyn ObjectCache>, ttl: Duration) -> Self {
        self.iter_configs.push(IterConfig { matcher, cache, ttl });
        self
    }

    pub fn cache_exists(
        mut self,
        matcher: NameMatcher,
        cache: Arc<dyn ObjectCache>,
        exists_ttl: Duration,
        doesnt_exist_ttl: Duration,
    ) -> Self {
        self.exists_configs.push(ExistsConfig { matcher, cache, exists_ttl, doesnt_exist_ttl });
        self
    }

    pub fn cache_get(
        mut self,
        matcher: NameMatcher,
        cache: Arc<dyn ObjectCache>,
        max_size: usize,
        content_ttl: Duration,
        exists_ttl: Duration,
        doesnt_exist_ttl: Duration,
    ) -> Self {
        self.get_configs.push(GetConfig {
            matcher,
            cache,
            max_size,
            content_ttl,
            exists_ttl,
            doesnt_exist_ttl,
        });
        self
    }

    pub fn cache_object_size(
        mut self,
        matcher: NameMatcher,
        cache: Arc<dyn ObjectCache>,
        ttl: Duration,
    ) -> Self {
        self.size_configs.push(SizeConfig { matcher, cache, ttl });
        self
    }

    pub fn cache_get_range(
        mut self,
        matcher: NameMatcher,
        cache: Arc<dyn ObjectCache>,
        subrange_size: u64,
        subrange_ttl: Duration,
        size_ttl: Duration,
        max_sub_requests: usize,
    ) -> Self {
        self.range_configs.push(RangeConfig {
            matcher,
            cache,
            subrange_size,
            subrange_ttl,
            size_ttl,
            max_sub_requests: max_sub_requests.max(1),
        });
        self
    }

    async fn size_via_cache(
        &self,
        name: &str,
        cache: &dyn ObjectCache,
        ttl: Duration,
    ) -> BucketResult<u64> {
        let key = format!("size:{}", name);
        if let Some(data) = super::cache::fetch_one(cache, &key).await {
            if data.len() == 8 {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&data);
                return Ok(u64::from_le_bytes(buf));
            }
        }
        let size = self.backing.object_size(name).await?;
        cache.store(key, size.to_le_bytes().to_vec(), ttl).await;
        Ok(size)
    }

    async fn cached_get_range(
        &self,
        cfg: &RangeConfig,
        name: &str,
        offset: u64,
        length: i64,
    ) -> BucketResult<Bytes> {
        let size = self.size_via_cache(name, cfg.cache.as_ref(), cfg.size_ttl).await?;
        let (start, end) = range_bounds(size, offset, length)?;
        if start == end {
            return Ok(Bytes::new());
        }
        self.range_stats.requested_bytes.fetch_add(end - start, Ordering::Relaxed);

        let sub = cfg.subrange_size;
        let first_sub = start / sub;
        let last_sub = (end - 1) / sub; // inclusive

        let subrange_end = move |k: u64| ((k + 1) * sub).min(size);
        let key_of = |k: u64| format!("subrange:{}:{}:{}", name, k * sub, subrange_end(k));

        let keys: Vec<String> = (first_sub..=last_sub).map(key_of).collect();
        let cached = cfg.cache.fetch_multi(&keys).await;

        let mut parts: HashMap<u64, Bytes> = HashMap::with_capacity(keys.len());
        let mut missing: Vec<u64> = Vec::new();
        for (i, k) in (first_sub..=last_sub).enumerate() {
            match cached.get(&keys[i]) {
                Some(data) => {
                    self.range_stats.cached_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
                    parts.insert(k, Bytes::from(data.clone()));
                }
                None => missing.push(k),
            }
        }

        if !missing.is_empty() {
            let runs = coalesce_runs(&missing, cfg.max_sub_requests);

            let fetches = runs.iter().map(|&(run_start, run_end)| {
                let name = name.to_string();
                async move {
                    let byte_start = run_start * sub;
                    let byte_end = subrange_end(run_end);
                    self.range_stats.backing_requests.fetch_add(1, Ordering::Relaxed);
                    self.range_stats
                        .fetched_bytes
                        .fetch_add(byte_end - byte_start, Ordering::Relaxed);
                    let data = self
                        .backing
                        .get_range(&name, byte_start, (byte_end - byte_start) as i64)
                        .await?;
                    if data.len() as u64 != byte_end - byte_start {
                        return Err(BucketError::Other(format_err!(
                            "short range read on '{}': got {} want {}",
                            name,
                            data.len(),
                            byte_end - byte_start
                        )));
                    }
                    Ok::<_, BucketError>((run_start, run_end, data))
                }
            });

            let fetched = futures::future::try_join_all(fetches).await?;
            for (run_start, run_end, data) in fetched {
                for k in run_start..=run_end {
                    let rel_start = ((k - run_start) * sub) as usize;
                    let rel_end = (subrange_end(k) - run_start * sub) as usize;
                    let piece = data.slice(rel_start..rel_end);
                    if parts.contains_key(&k) {
                        // a coalescing gap, the cache already had it
                        self.range_stats
                            .refetched_bytes
                            .fetch_add(piece.len() as u64, Ordering::Relaxed);
                    } else {
                        cfg.cache
                            .store(key_of(k), piece.to_vec(), cfg.subrange_ttl)
                            .await;
                        parts.insert(k, piece);
                    }
                }
            }
        }

        // stitch the requested window out of the subranges
        let mut out = BytesMut::with_capacity((end - start) as usize);
        for k in first_sub..=last_sub {
            let piece = parts
                .get(&k)
                .ok_or_else(|| BucketError::Other(format_err!("missing subrange {}", k)))?;
            let piece_start = k * sub;
            let from = start.max(piece_start) - piece_start;
            let to = end.min(subrange_end(k)) - piece_start;
            out.extend_from_slice(&piece[from as usize..to as usize]);
        }
        Ok(out.freeze())
    }
}

/// Collapse missing subrange indices into contiguous `[start, end]` runs and
/// merge runs until at most `max_requests` remain, always closing the
/// smallest gap first.
fn coalesce_runs(missing: &[u64], max_requests: usize) -> Vec<(u64, u64)> {
    let mut runs: Vec<(u64, u64)> = Vec::new();
    for &k in missing {
        match runs.last_mut() {
            Some(run) if run.1 + 1 == k => run.1 = k,
            _ => runs.push((k, k)),
        }
    }

    while runs.len() > max_requests {
        let mut best = 1;
        for i in 2..runs.len() {
            let gap = runs[i].0 - runs[i - 1].1;
            if gap < runs[best].0 - runs[best - 1].1 {
                best = i;
            }
        }
        let merged_end = runs[best].1;
        runs[best - 1].1 = merged_end;
        runs.remove(best);
    }
    runs
}

fn compress(data: &[u8]) -> BucketResult<Vec<u8>> {
    let mut out = (data.len() as u32).to_le_bytes().to_vec();
    let compressed = zstd::block::compress(data, 1)
        .map_err(|err| BucketError::Other(format_err!("compress failed - {}", err)))?;
    out.extend_from_slice(&compressed);
    Ok(out)
}

fn decompress(data: &[u8]) -> BucketResult<Vec<u8>> {
    if data.len() < 4 {
        return Err(BucketError::Other(format_err!("compressed entry too short")));
    }
    let raw_len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    zstd::block::decompress(&data[4..], raw_len)
        .map_err(|err| BucketError::Other(format_err!("decompress failed - {}", err)))
}

impl ObjectBucket for CachingBucket {
    fn name(&self) -> &str {
        self.backing.name()
    }

    fn upload<'a>(&'a self, name: &'a str, data: Bytes) -> BoxFuture<'a, BucketResult<()>> {
        self.backing.upload(name, data)
    }

    fn get<'a>(&'a self, name: &'a str) -> BoxFuture<'a, BucketResult<Bytes>> {
        Box::pin(async move {
            let cfg = match self.get_configs.iter().find(|c| (c.matcher)(name)) {
                Some(cfg) => cfg,
                None => return self.backing.get(name).await,
            };

            let content_key = format!("content:{}", name);
            let exists_key = format!("exists:{}", name);

            if let Some(data) = super::cache::fetch_one(cfg.cache.as_ref(), &content_key).await {
                return Ok(Bytes::from(data));
            }
            if let Some(flag) = super::cache::fetch_one(cfg.cache.as_ref(), &exists_key).await {
                if flag == b"false" {
                    return Err(BucketError::NotFound(name.to_string()));
                }
            }

            match self.backing.get(name).await {
                Ok(data) => {
                    if data.len() <= cfg.max_size {
                        cfg.cache
                            .store(content_key, data.to_vec(), cfg.content_ttl)
                            .await;
                        cfg.cache
                            .store(exists_key, b"true".to_vec(), cfg.exists_ttl)
                            .await;
                    }
                    Ok(data)
                }
                Err(err) if err.is_not_found() => {
                    cfg.cache
                        .store(exists_key, b"false".to_vec(), cfg.doesnt_exist_ttl)
                        .await;
                    Err(err)
                }
                Err(err) => Err(err),
            }
        })
    }

    fn get_range<'a>(
        &'a self,
        name: &'a str,
        offset: u64,
        length: i64,
    ) -> BoxFuture<'a, BucketResult<Bytes>> {
        Box::pin(async move {
            match self.range_configs.iter().find(|c| (c.matcher)(name)) {
                Some(cfg) => self.cached_get_range(cfg, name, offset, length).await,
                None => self.backing.get_range(name, offset, length).await,
            }
        })
    }

    fn exists<'a>(&'a self, name: &'a str) -> BoxFuture<'a, BucketResult<bool>> {
        Box::pin(async move {
            let cfg = match self.exists_configs.iter().find(|c| (c.matcher)(name)) {
                Some(cfg) => cfg,
                None => return self.backing.exists(name).await,
            };

            let key = format!("exists:{}", name);
            if let Some(flag) = super::cache::fetch_one(cfg.cache.as_ref(), &key).await {
                return Ok(flag == b"true");
            }

            let exists = self.backing.exists(name).await?;
            let (value, ttl) = if exists {
                (b"true".to_vec(), cfg.exists_ttl)
            } else {
                (b"false".to_vec(), cfg.doesnt_exist_ttl)
            };
            cfg.cache.store(key, value, ttl).await;
            Ok(exists)
        })
    }

    fn iter<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, BucketResult<Vec<String>>> {
        Box::pin(async move {
            let cfg = match self.iter_configs.iter().find(|c| (c.matcher)(prefix)) {
                Some(cfg) => cfg,
                None => return self.backing.iter(prefix).await,
            };

            let key = format!("iter:{}", prefix);
            if let Some(data) = super::cache::fetch_one(cfg.cache.as_ref(), &key).await {
                if let Ok(names) = decompress(&data)
                    .and_then(|raw| serde_json::from_slice(&raw).map_err(|err| BucketError::Other(err.into())))
                {
                    return Ok(names);
                }
                // fall through on decode failure, the entry gets rewritten
            }

            let names = self.backing.iter(prefix).await?;
            let encoded = serde_json::to_vec(&names)
                .map_err(|err| BucketError::Other(err.into()))
                .and_then(|raw| compress(&raw));
            if let Ok(encoded) = encoded {
                cfg.cache.store(key, encoded, cfg.ttl).await;
            }
            Ok(names)
        })
    }

    fn object_size<'a>(&'a self, name: &'a str) -> BoxFuture<'a, BucketResult<u64>> {
        Box::pin(async move {
            match self.size_configs.iter().find(|c| (c.matcher)(name)) {
                Some(cfg) => self.size_via_cache(name, cfg.cache.as_ref(), cfg.ttl).await,
                None => self.backing.object_size(name).await,
            }
        })
    }

    fn delete<'a>(&'a self, name: &'a str) -> BoxFuture<'a, BucketResult<()>> {
        self.backing.delete(name)
    }
}

/// Matcher accepting every name.
pub fn match_all() -> NameMatcher {
    Arc::new(|_| true)
}

/// Matcher on a filename suffix, e.g. `/meta.json`.
pub fn match_suffix(suffix: &'static str) -> NameMatcher {
    Arc::new(move |name| name.ends_with(suffix))
}

/// Matcher on a path component, e.g. `/chunks/`.
pub fn match_component(component: &'static str) -> NameMatcher {
    Arc::new(move |name| name.contains(component))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objstore::cache::InMemoryCache;
    use crate::objstore::MemoryBucket;

    fn cache() -> Arc<InMemoryCache> {
        Arc::new(InMemoryCache::new("t", 64 * 1024 * 1024, 4 * 1024 * 1024))
    }

    fn ttl() -> Duration {
        Duration::from_secs(600)
    }

    #[test]
    fn test_coalesce_runs() {
        // contiguous
        assert_eq!(coalesce_runs(&[0, 1, 2], 3), vec![(0, 2)]);
        // split runs kept while under the limit
        assert_eq!(coalesce_runs(&[0, 2, 3], 3), vec![(0, 0), (2, 3)]);
        // smallest gap merged first
        assert_eq!(coalesce_runs(&[0, 2, 3, 9], 2), vec![(0, 3), (9, 9)]);
        assert_eq!(coalesce_runs(&[0, 2, 3, 9], 1), vec![(0, 9)]);
    }

    #[tokio::test]
    async fn test_subrange_cold_then_warm() {
        let backing = Arc::new(MemoryBucket::new("m"));
        let object: Vec<u8> = (0..100 * 1024).map(|i| (i % 251) as u8).collect();
        backing.upload("blk/index", Bytes::from(object.clone())).await.unwrap();

        let caching = CachingBucket::new(backing.clone()).cache_get_range(
            match_all(),
            cache(),
            16 * 1024,
            ttl(),
            ttl(),
            3,
        );

        let want = Bytes::from(object[0..48_000].to_vec());

        let cold = caching.get_range("blk/index", 0, 48_000).await.unwrap();
        assert_eq!(cold, want);
        // three aligned 16 KiB subranges in one coalesced request
        assert_eq!(caching.range_stats.fetched_bytes.load(Ordering::Relaxed), 48 * 1024);
        let cold_requests = backing.counters.get_range.load(Ordering::Relaxed);
        assert!(cold_requests <= 3);

        let warm = caching.get_range("blk/index", 0, 48_000).await.unwrap();
        assert_eq!(warm, want);
        assert_eq!(backing.counters.get_range.load(Ordering::Relaxed), cold_requests);
        assert_eq!(caching.range_stats.cached_bytes.load(Ordering::Relaxed), 48 * 1024);
    }

    #[tokio::test]
    async fn test_subrange_mixed_cache() {
        let backing = Arc::new(MemoryBucket::new("m"));
        let object: Vec<u8> = (0..64 * 1024).map(|i| (i % 13) as u8).collect();
        backing.upload("obj", Bytes::from(object.clone())).await.unwrap();

        let caching = CachingBucket::new(backing.clone())
            .cache_get_range(match_all(), cache(), 16 * 1024, ttl(), ttl(), 10);

        // warm only the middle subrange [16K, 32K)
        caching.get_range("obj", 20_000, 1_000).await.unwrap();

        // full read: subranges 0 and 2..3 missing, 1 cached
        let out = caching.get_range("obj", 0, 64 * 1024).await.unwrap();
        assert_eq!(out, Bytes::from(object.clone()));

        // cold read again must be identical
        let again = caching.get_range("obj", 0, 64 * 1024).await.unwrap();
        assert_eq!(again, out);
    }

    #[tokio::test]
    async fn test_subrange_tail_alignment() {
        let backing = Arc::new(MemoryBucket::new("m"));
        // size not a multiple of the stride
        let object: Vec<u8> = (0..40_000).map(|i| (i % 7) as u8).collect();
        backing.upload("obj", Bytes::from(object.clone())).await.unwrap();

        let caching = CachingBucket::new(backing.clone())
            .cache_get_range(match_all(), cache(), 16 * 1024, ttl(), ttl(), 3);

        let out = caching.get_range("obj", 30_000, -1).await.unwrap();
        assert_eq!(out, Bytes::from(object[30_000..].to_vec()));

        let again = caching.get_range("obj", 30_000, -1).await.unwrap();
        assert_eq!(again, out);
    }

    #[tokio::test]
    async fn test_exists_and_get_caching() {
        let backing = Arc::new(MemoryBucket::new("m"));
        backing.upload("blk/meta.json", Bytes::from_static(b"{\"v\":1}")).await.unwrap();

        let caching = CachingBucket::new(backing.clone())
            .cache_exists(match_suffix("meta.json"), cache(), ttl(), ttl())
            .cache_get(match_suffix("meta.json"), cache(), 1024, ttl(), ttl(), ttl());

        assert!(caching.exists("blk/meta.json").await.unwrap());
        assert!(caching.exists("blk/meta.json").await.unwrap());
        assert_eq!(backing.counters.exists.load(Ordering::Relaxed), 1);

        // negative existence is cached too
        assert!(!caching.exists("gone/meta.json").await.unwrap());
        assert!(!caching.exists("gone/meta.json").await.unwrap());
        assert_eq!(backing.counters.exists.load(Ordering::Relaxed), 2);

        assert_eq!(caching.get("blk/meta.json").await.unwrap(), Bytes::from_static(b"{\"v\":1}"));
        assert_eq!(caching.get("blk/meta.json").await.unwrap(), Bytes::from_static(b"{\"v\":1}"));
        assert_eq!(backing.counters.get.load(Ordering::Relaxed), 1);

        // cached not-found on get
        assert!(caching.get("gone2/meta.json").await.unwrap_err().is_not_found());
        assert!(caching.get("gone2/meta.json").await.unwrap_err().is_not_found());
        assert_eq!(backing.counters.get.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_iter_caching() {
        let backing = Arc::new(MemoryBucket::new("m"));
        backing.upload("blk1/meta.json", Bytes::from_static(b"x")).await.unwrap();
        backing.upload("blk2/meta.json", Bytes::from_static(b"x")).await.unwrap();

        let caching = CachingBucket::new(backing.clone()).cache_iter(match_all(), cache(), ttl());

        assert_eq!(caching.iter("").await.unwrap(), vec!["blk1/", "blk2/"]);

        // stale listing served from cache within TTL
        backing.upload("blk3/meta.json", Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(caching.iter("").await.unwrap(), vec!["blk1/", "blk2/"]);
        assert_eq!(backing.counters.iter.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_writes_bypass_caches() {
        let backing = Arc::new(MemoryBucket::new("m"));
        let caching = CachingBucket::new(backing.clone())
            .cache_get(match_all(), cache(), 1024, ttl(), ttl(), ttl());

        caching.upload("obj", Bytes::from_static(b"v1")).await.unwrap();
        assert_eq!(backing.get("obj").await.unwrap(), Bytes::from_static(b"v1"));

        caching.delete("obj").await.unwrap();
        assert!(backing.get("obj").await.unwrap_err().is_not_found());
    }
}
