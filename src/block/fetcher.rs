//! Block discovery: list the bucket, fetch metas, run the filter chain.
//!
//! The fetcher keeps a local meta cache (blocks are immutable, a cached meta
//! is never refetched) and downloads missing metas with bounded parallelism.
//! A malformed meta makes the block *partial*: it is counted, logged and
//! omitted, but the fetch itself only fails when listing fails. Filters run
//! in registration order over the fetched map.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use anyhow::Error;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use ulid::Ulid;

use super::meta::{BlockMeta, DeletionMark};
use crate::labels::{Labels, Matcher};
use crate::objstore::ObjectBucket;

pub const DEFAULT_META_FETCH_CONCURRENCY: usize = 20;

pub type MetaMap = BTreeMap<Ulid, Arc<BlockMeta>>;

/// One pass of the filter chain. Filters mutate the map in place; anything
/// they remove is invisible downstream.
pub trait MetaFilter: Send + Sync {
    fn name(&self) -> &'static str;

    fn filter<'a>(&'a self, metas: &'a mut MetaMap) -> BoxFuture<'a, Result<(), Error>>;
}

#[derive(Debug, Default)]
pub struct FetcherStats {
    pub syncs: AtomicU64,
    pub cached: AtomicU64,
    pub fetched: AtomicU64,
    pub parse_failures: AtomicU64,
}

pub struct MetaFetcher {
    bucket: Arc<dyn ObjectBucket>,
    concurrency: usize,
    filters: Vec<Box<dyn MetaFilter>>,
    cache: Mutex<HashMap<Ulid, Arc<BlockMeta>>>,
    pub stats: FetcherStats,
}

impl MetaFetcher {
    pub fn new(bucket: Arc<dyn ObjectBucket>, filters: Vec<Box<dyn MetaFilter>>) -> Self {
        Self {
            bucket,
            concurrency: DEFAULT_META_FETCH_CONCURRENCY,
            filters,
            cache: Mutex::new(HashMap::new()),
            stats: FetcherStats::default(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Discover blocks and return the filtered snapshot plus the ids whose
    /// meta could not be read (partial blocks).
    pub async fn fetch(&self) -> Result<(MetaMap, Vec<(Ulid, String)>), Error> {
        self.stats.syncs.fetch_add(1, Ordering::Relaxed);

        let mut candidates = Vec::new();
        for entry in self.bucket.iter("").await? {
            if let Some(id) = super::parse_block_entry(&entry) {
                candidates.push(id);
            }
        }

        let mut metas: MetaMap = BTreeMap::new();
        let mut to_fetch = Vec::new();
        {
            let cache = self.cache.lock().unwrap();
            for id in candidates {
                match cache.get(&id) {
                    Some(meta) => {
                        self.stats.cached.fetch_add(1, Ordering::Relaxed);
                        metas.insert(id, Arc::clone(meta));
                    }
                    None => to_fetch.push(id),
                }
            }
        }

        let mut partial = Vec::new();
        let results: Vec<(Ulid, Result<Option<BlockMeta>, String>)> = stream::iter(
            to_fetch.into_iter().map(|id| {
                let bucket = Arc::clone(&self.bucket);
                async move {
                    let result = match super::read_meta(bucket.as_ref(), id).await {
                        Ok(meta) => Ok(Some(meta)),
                        Err(err) if crate::objstore::is_not_found(&err) => Ok(None),
                        Err(err) => Err(err.to_string()),
                    };
                    (id, result)
                }
            }),
        )
        .buffer_unordered(self.concurrency)
        .collect()
        .await;

        for (id, result) in results {
            match result {
                Ok(Some(meta)) => {
                    self.stats.fetched.fetch_add(1, Ordering::Relaxed);
                    let meta = Arc::new(meta);
                    self.cache.lock().unwrap().insert(id, Arc::clone(&meta));
                    metas.insert(id, meta);
                }
                // meta not uploaded yet, the block is not visible
                Ok(None) => {}
                Err(reason) => {
                    self.stats.parse_failures.fetch_add(1, Ordering::Relaxed);
                    log::warn!("block {}: unreadable meta - {}", id, reason);
                    partial.push((id, reason));
                }
            }
        }

        for filter in &self.filters {
            let before = metas.len();
            filter.filter(&mut metas).await?;
            log::debug!(
                "meta filter '{}' kept {} of {} blocks",
                filter.name(),
                metas.len(),
                before
            );
        }

        Ok((metas, partial))
    }

    /// Forget cached metas of blocks that vanished from the bucket.
    pub fn evict(&self, live: &MetaMap) {
        let mut cache = self.cache.lock().unwrap();
        cache.retain(|id, _| live.contains_key(id));
    }
}

/// Drops blocks outside the configured time range.
pub struct TimeFilter {
    pub min_time: i64,
    pub max_time: i64,
}

impl MetaFilter for TimeFilter {
    fn name(&self) -> &'static str {
        "time-range"
    }

    fn filter<'a>(&'a self, metas: &'a mut MetaMap) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            metas.retain(|_, meta| meta.overlaps(self.min_time, self.max_time));
            Ok(())
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectorAction {
    Keep,
    Drop,
}

pub struct SelectorRule {
    pub action: SelectorAction,
    pub matchers: Vec<Matcher>,
}

/// Relabel-style selector over the block's external labels. Rules run in
/// order; the first rule whose matchers all apply decides. Blocks matching
/// no rule are kept.
pub struct LabelSelectorFilter {
    pub rules: Vec<SelectorRule>,
}

impl LabelSelectorFilter {
    fn decide(&self, labels: &Labels) -> SelectorAction {
        for rule in &self.rules {
            if crate::labels::matches_all(&rule.matchers, labels) {
                return rule.action;
            }
        }
        SelectorAction::Keep
    }
}

impl MetaFilter for LabelSelectorFilter {
    fn name(&self) -> &'static str {
        "label-selector"
    }

    fn filter<'a>(&'a self, metas: &'a mut MetaMap) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            metas.retain(|_, meta| self.decide(&meta.external_labels()) == SelectorAction::Keep);
            Ok(())
        })
    }
}

/// Records deletion marks and hides blocks whose mark is older than the
/// grace delay. Marked-but-in-grace blocks stay visible and readable.
pub struct DeletionMarkFilter {
    bucket: Arc<dyn ObjectBucket>,
    delete_delay: Duration,
    concurrency: usize,
    marks: Mutex<HashMap<Ulid, DeletionMark>>,
    now_unix: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl DeletionMarkFilter {
    pub fn new(bucket: Arc<dyn ObjectBucket>, delete_delay: Duration) -> Self {
        Self {
            bucket,
            delete_delay,
            concurrency: DEFAULT_META_FETCH_CONCURRENCY,
            marks: Mutex::new(HashMap::new()),
            now_unix: Box::new(|| {
                SystemTime::now()
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0)
            }),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, now_unix: Box<dyn Fn() -> i64 + Send + Sync>) -> Self {
        self.now_unix = now_unix;
        self
    }

    /// Marks observed during the last filter run.
    pub fn deletion_marks(&self) -> HashMap<Ulid, DeletionMark> {
        self.marks.lock().unwrap().clone()
    }
}

impl MetaFilter for DeletionMarkFilter {
    fn name(&self) -> &'static str {
        "deletion-mark"
    }

    fn filter<'a>(&'a self, metas: &'a mut MetaMap) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let ids: Vec<Ulid> = metas.keys().copied().collect();
            let marks: Vec<(Ulid, Option<DeletionMark>)> = stream::iter(ids.into_iter().map(|id| {
                let bucket = Arc::clone(&self.bucket);
                async move {
                    match super::read_deletion_mark(bucket.as_ref(), id).await {
                        Ok(mark) => (id, mark),
                        Err(err) => {
                            log::warn!("block {}: unreadable deletion mark - {}", id, err);
                            (id, None)
                        }
                    }
                }
            }))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

            let now = (self.now_unix)();
            let mut recorded = self.marks.lock().unwrap();
            recorded.clear();
            for (id, mark) in marks {
                if let Some(mark) = mark {
                    if now - mark.deletion_time > self.delete_delay.as_secs() as i64 {
                        metas.remove(&id);
                    }
                    recorded.insert(id, mark);
                }
            }
            Ok(())
        })
    }
}

/// Removes blocks whose compaction sources are a subset of another block
/// with the same shard identity. The removed ids are recorded for garbage
/// collection.
pub struct DeduplicationFilter {
    duplicates: Mutex<Vec<Ulid>>,
}

impl DeduplicationFilter {
    pub fn new() -> Self {
        Self { duplicates: Mutex::new(Vec::new()) }
    }

    pub fn duplicates(&self) -> Vec<Ulid> {
        self.duplicates.lock().unwrap().clone()
    }
}

impl Default for DeduplicationFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl MetaFilter for DeduplicationFilter {
    fn name(&self) -> &'static str {
        "deduplication"
    }

    fn filter<'a>(&'a self, metas: &'a mut MetaMap) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            // group by shard identity
            let mut groups: HashMap<(u64, i64), Vec<Arc<BlockMeta>>> = HashMap::new();
            for meta in metas.values() {
                let key = (meta.external_labels().stable_hash(), meta.resolution());
                groups.entry(key).or_default().push(Arc::clone(meta));
            }

            let mut remove = Vec::new();
            for group in groups.values() {
                for a in group {
                    let a_sources: HashSet<Ulid> = a.compaction.sources.iter().copied().collect();
                    for b in group {
                        if a.ulid == b.ulid {
                            continue;
                        }
                        let b_sources: HashSet<Ulid> =
                            b.compaction.sources.iter().copied().collect();
                        let subsumed = a_sources.is_subset(&b_sources)
                            && (a_sources.len() < b_sources.len()
                                // equal source sets: deterministic winner
                                || (a.compaction.level, b.ulid) < (b.compaction.level, a.ulid));
                        if subsumed {
                            remove.push(a.ulid);
                            break;
                        }
                    }
                }
            }

            let mut duplicates = self.duplicates.lock().unwrap();
            duplicates.clear();
            for id in remove {
                metas.remove(&id);
                duplicates.push(id);
            }
            Ok(())
        })
    }
}
