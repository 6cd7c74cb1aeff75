//! The storage gateway: serves Series, LabelNames and LabelValues straight
//! from blocks in the object store.
//!
//! Per request: snapshot the block set, pick overlapping blocks whose
//! external labels agree with the matchers, and query each block through
//! its lazy index header. Postings and series records are looked up in the
//! index cache first, misses are fetched with coalesced ranged reads and
//! written back. Decoded label sets are re-checked against the matchers
//! before any chunk is touched. Chunk bytes flow through the byte-budgeted
//! chunk pool.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{format_err, Error};
use ulid::Ulid;

use crate::block::fetcher::MetaFetcher;
use crate::block::header_pool::{HeaderReaderPool, LazyHeaderReader};
use crate::block::index_cache::IndexCache;
use crate::block::index_header::IndexHeader;
use crate::block::meta::{self, BlockMeta};
use crate::labels::{Labels, Matcher};
use crate::objstore::ObjectBucket;
use crate::store::chunk_pool::ChunkPool;
use crate::store::proto::{self, PartialResponseStrategy};
use crate::tsdb::index::{self, ChunkMeta};

/// Ranged reads separated by less than this are merged into one request.
const MAX_RANGE_GAP: u64 = 512 * 1024;
/// Over-fetch window appended to a series record run; records larger than
/// this fall back to an exact two-step read.
const SERIES_FETCH_SLACK: u64 = 16 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error(transparent)]
    Other(#[from] Error),
}

pub struct BucketStoreConfig {
    /// bound on concurrently served Series requests
    pub series_concurrency: usize,
    /// global chunk buffer budget in bytes
    pub chunk_pool_bytes: u64,
    /// index header idle release
    pub header_idle_timeout: Duration,
}

impl Default for BucketStoreConfig {
    fn default() -> Self {
        Self {
            series_concurrency: 20,
            chunk_pool_bytes: 2 * 1024 * 1024 * 1024,
            header_idle_timeout: crate::block::header_pool::DEFAULT_IDLE_TIMEOUT,
        }
    }
}

struct BlockHandle {
    meta: Arc<BlockMeta>,
    header: Arc<LazyHeaderReader>,
    external_labels: Labels,
}

type BlockMap = BTreeMap<Ulid, Arc<BlockHandle>>;

pub struct BucketStore {
    bucket: Arc<dyn ObjectBucket>,
    fetcher: Arc<MetaFetcher>,
    index_cache: Arc<dyn IndexCache>,
    header_pool: HeaderReaderPool,
    chunk_pool: Arc<ChunkPool>,
    series_gate: Arc<tokio::sync::Semaphore>,
    blocks: RwLock<Arc<BlockMap>>,
}

impl BucketStore {
    pub fn new(
        bucket: Arc<dyn ObjectBucket>,
        fetcher: Arc<MetaFetcher>,
        index_cache: Arc<dyn IndexCache>,
        config: BucketStoreConfig,
    ) -> Self {
        Self {
            header_pool: HeaderReaderPool::new(Arc::clone(&bucket), config.header_idle_timeout),
            chunk_pool: ChunkPool::new(config.chunk_pool_bytes),
            series_gate: Arc::new(tokio::sync::Semaphore::new(config.series_concurrency)),
            bucket,
            fetcher,
            index_cache,
            blocks: RwLock::new(Arc::new(BTreeMap::new())),
        }
    }

    /// Discover new blocks and drop vanished ones. Runs periodically and
    /// once at startup before serving.
    pub async fn sync_blocks(&self) -> Result<(), Error> {
        let (metas, partial) = self.fetcher.fetch().await?;
        if !partial.is_empty() {
            log::warn!("gateway sync: {} blocks with unreadable meta", partial.len());
        }

        let current = self.snapshot();
        let mut next: BlockMap = BTreeMap::new();
        for (id, block_meta) in &metas {
            match current.get(id) {
                Some(handle) => {
                    next.insert(*id, Arc::clone(handle));
                }
                None => {
                    next.insert(
                        *id,
                        Arc::new(BlockHandle {
                            external_labels: block_meta.external_labels(),
                            header: self.header_pool.acquire(*id),
                            meta: Arc::clone(block_meta),
                        }),
                    );
                    log::debug!("gateway sync: block {} added", id);
                }
            }
        }
        for id in current.keys() {
            if !next.contains_key(id) {
                self.header_pool.remove(*id);
                log::debug!("gateway sync: block {} dropped", id);
            }
        }

        *self.blocks.write().unwrap() = Arc::new(next);
        self.fetcher.evict(&metas);
        Ok(())
    }

    /// Release idle index headers; driven by a background tick.
    pub fn release_idle_headers(&self) {
        self.header_pool.release_idle();
    }

    pub fn block_count(&self) -> usize {
        self.snapshot().len()
    }

    fn snapshot(&self) -> Arc<BlockMap> {
        Arc::clone(&self.blocks.read().unwrap())
    }

    pub async fn info(&self) -> proto::InfoResponse {
        let blocks = self.snapshot();
        let mut min_time = i64::MAX;
        let mut max_time = i64::MIN;
        let mut label_sets: Vec<Labels> = Vec::new();
        for handle in blocks.values() {
            min_time = min_time.min(handle.meta.min_time);
            max_time = max_time.max(handle.meta.max_time);
            if !label_sets.contains(&handle.external_labels) {
                label_sets.push(handle.external_labels.clone());
            }
        }
        if blocks.is_empty() {
            min_time = 0;
            max_time = 0;
        }
        proto::InfoResponse {
            min_time,
            max_time,
            label_sets: label_sets
                .iter()
                .map(|ls| proto::LabelSet { labels: proto::labels_to_proto(ls) })
                .collect(),
            store_type: proto::StoreType::Gateway as i32,
        }
    }

    /// Serve a Series request: all matching series in ascending label set
    /// order, chunks of the same series concatenated across blocks, plus
    /// per-block warnings under the WARN strategy.
    pub async fn series(
        &self,
        req: &proto::SeriesRequest,
    ) -> Result<(Vec<proto::Series>, Vec<String>), StoreError> {
        let _permit = Arc::clone(&self.series_gate)
            .acquire_owned()
            .await
            .map_err(|_| StoreError::Other(format_err!("store shutting down")))?;

        let matchers = proto::matchers_from_proto(&req.matchers).map_err(StoreError::Other)?;
        let abort = req.partial_response_strategy == PartialResponseStrategy::Abort as i32;

        let blocks = self.snapshot();
        let mut tasks = Vec::new();
        for handle in blocks.values() {
            if !handle.meta.overlaps(req.min_time, req.max_time) {
                continue;
            }
            if handle.meta.resolution() > req.max_resolution_window {
                continue;
            }
            match split_block_matchers(&matchers, &handle.external_labels) {
                Some(block_matchers) => tasks.push((Arc::clone(handle), block_matchers)),
                // external labels ruled the block out
                None => continue,
            }
        }

        let results = futures::future::join_all(tasks.iter().map(|(handle, block_matchers)| {
            let handle = Arc::clone(handle);
            async move {
                let result = self
                    .block_series(&handle, block_matchers, req.min_time, req.max_time)
                    .await;
                (handle.meta.ulid, result)
            }
        }))
        .await;

        let mut warnings = Vec::new();
        let mut merged: BTreeMap<Labels, Vec<proto::Chunk>> = BTreeMap::new();
        let mut total_samples: u64 = 0;

        for (id, result) in results {
            match result {
                Ok(series_list) => {
                    for (labels, chunks) in series_list {
                        for chunk in &chunks {
                            let encoding = crate::tsdb::chunkenc::Encoding::from_u8(
                                chunk.encoding as u8,
                            )
                            .unwrap_or(crate::tsdb::chunkenc::Encoding::Xor);
                            total_samples +=
                                crate::tsdb::chunkenc::sample_count(encoding, &chunk.data) as u64;
                        }
                        if req.sample_limit > 0 && total_samples > req.sample_limit {
                            return Err(StoreError::ResourceExhausted(format!(
                                "series request touched more than {} samples",
                                req.sample_limit
                            )));
                        }
                        merged.entry(labels).or_default().extend(chunks);
                    }
                }
                Err(err) => {
                    if abort {
                        return Err(StoreError::Other(
                            err.context(format!("block {}", id)),
                        ));
                    }
                    warnings.push(format!("block {}: {}", id, err));
                }
            }
        }

        let mut series = Vec::with_capacity(merged.len());
        for (labels, mut chunks) in merged {
            chunks.sort_by_key(|c| c.min_time);
            series.push(proto::Series { labels: proto::labels_to_proto(&labels), chunks });
        }
        Ok((series, warnings))
    }

    pub async fn label_names(
        &self,
        req: &proto::LabelNamesRequest,
    ) -> Result<proto::LabelNamesResponse, StoreError> {
        let abort = req.partial_response_strategy == PartialResponseStrategy::Abort as i32;
        let blocks = self.snapshot();

        let mut names: Vec<String> = Vec::new();
        let mut warnings = Vec::new();
        for handle in blocks.values() {
            if !handle.meta.overlaps(req.min_time, req.max_time) {
                continue;
            }
            match handle.header.header().await {
                Ok(header) => {
                    names.extend(header.label_names());
                    names.extend(handle.external_labels.iter().map(|l| l.name.clone()));
                }
                Err(err) if abort => {
                    return Err(StoreError::Other(
                        err.context(format!("block {}", handle.meta.ulid)),
                    ))
                }
                Err(err) => warnings.push(format!("block {}: {}", handle.meta.ulid, err)),
            }
        }
        names.sort();
        names.dedup();
        Ok(proto::LabelNamesResponse { names, warnings })
    }

    pub async fn label_values(
        &self,
        req: &proto::LabelValuesRequest,
    ) -> Result<proto::LabelValuesResponse, StoreError> {
        let abort = req.partial_response_strategy == PartialResponseStrategy::Abort as i32;
        let blocks = self.snapshot();

        let mut values: Vec<String> = Vec::new();
        let mut warnings = Vec::new();
        for handle in blocks.values() {
            if !handle.meta.overlaps(req.min_time, req.max_time) {
                continue;
            }
            if let Some(ext) = handle.external_labels.get(&req.label) {
                values.push(ext.to_string());
            }
            match handle.header.header().await {
                Ok(header) => values.extend(header.label_values(&req.label).iter().cloned()),
                Err(err) if abort => {
                    return Err(StoreError::Other(
                        err.context(format!("block {}", handle.meta.ulid)),
                    ))
                }
                Err(err) => warnings.push(format!("block {}: {}", handle.meta.ulid, err)),
            }
        }
        values.sort();
        values.dedup();
        Ok(proto::LabelValuesResponse { values, warnings })
    }

    /// Query one block: postings, series records, definitive matcher check,
    /// chunk fetch. Returns series with external labels already applied.
    async fn block_series(
        &self,
        handle: &BlockHandle,
        matchers: &[Matcher],
        min_time: i64,
        max_time: i64,
    ) -> Result<Vec<(Labels, Vec<proto::Chunk>)>, Error> {
        let header = handle.header.header().await?;
        let id = handle.meta.ulid;

        let refs = self.resolve_postings(id, &header, matchers).await?;
        if refs.is_empty() {
            return Ok(Vec::new());
        }

        let records = self.fetch_series_records(id, &header, &refs).await?;

        let mut out = Vec::new();
        for series in records {
            // hash collisions and cache poisoning end here
            if !crate::labels::matches_all(matchers, &series.labels) {
                continue;
            }
            let wanted: Vec<ChunkMeta> = series
                .chunks
                .iter()
                .filter(|c| c.min_time < max_time && min_time <= c.max_time)
                .copied()
                .collect();
            if wanted.is_empty() {
                continue;
            }
            let chunks = self.fetch_chunks(id, &wanted).await?;
            let labels = series.labels.merge(&handle.external_labels);
            out.push((labels, chunks));
        }
        Ok(out)
    }

    /// Translate matchers into postings groups, fetch the postings lists
    /// (cache first, then coalesced ranged reads) and evaluate the groups.
    async fn resolve_postings(
        &self,
        id: Ulid,
        header: &IndexHeader,
        matchers: &[Matcher],
    ) -> Result<Vec<u64>, Error> {
        let mut groups = Vec::with_capacity(matchers.len());
        let mut need_all = matchers.is_empty();
        for matcher in matchers {
            let group = PostingsGroup::build(matcher, header);
            if !group.add_all && group.add.is_empty() {
                return Ok(Vec::new()); // nothing can match
            }
            need_all = need_all || group.add_all;
            groups.push(group);
        }

        let mut keys: Vec<(String, String)> = Vec::new();
        if need_all {
            keys.push((String::new(), String::new()));
        }
        for group in &groups {
            for value in group.add.iter().chain(group.remove.iter()) {
                keys.push((group.name.clone(), value.clone()));
            }
        }
        keys.sort();
        keys.dedup();

        let postings = self.fetch_postings(id, header, &keys).await?;
        let empty: Vec<u64> = Vec::new();
        fn lookup<'m>(
            postings: &'m HashMap<(String, String), Vec<u64>>,
            empty: &'m Vec<u64>,
            name: &str,
            value: &str,
        ) -> &'m Vec<u64> {
            postings
                .get(&(name.to_string(), value.to_string()))
                .unwrap_or(empty)
        }

        let mut result: Option<Vec<u64>> = if groups.is_empty() {
            Some(lookup(&postings, &empty, "", "").clone())
        } else {
            None
        };
        for group in &groups {
            let refs = if group.add_all {
                let removed = group.remove.iter().fold(Vec::new(), |acc, v| {
                    union_sorted(&acc, lookup(&postings, &empty, &group.name, v))
                });
                subtract_sorted(lookup(&postings, &empty, "", ""), &removed)
            } else {
                group.add.iter().fold(Vec::new(), |acc, v| {
                    union_sorted(&acc, lookup(&postings, &empty, &group.name, v))
                })
            };
            result = Some(match result {
                Some(current) => intersect_sorted(&current, &refs),
                None => refs,
            });
            if result.as_ref().map(|r| r.is_empty()).unwrap_or(false) {
                return Ok(Vec::new());
            }
        }
        Ok(result.unwrap_or_default())
    }

    async fn fetch_postings(
        &self,
        id: Ulid,
        header: &IndexHeader,
        keys: &[(String, String)],
    ) -> Result<HashMap<(String, String), Vec<u64>>, Error> {
        let (hits, misses) = self.index_cache.fetch_multi_postings(id, keys).await;

        let mut out = HashMap::with_capacity(keys.len());
        for (key, raw) in hits {
            out.insert(key, index::decode_postings(&raw)?);
        }
        if misses.is_empty() {
            return Ok(out);
        }

        // exact byte range of every missing list, merged into few reads
        let mut ranges: Vec<(u64, u64, (String, String))> = Vec::new();
        for key in misses {
            if let Some((off, len)) = header.postings_range(&key.0, &key.1) {
                ranges.push((off, off + len as u64, key));
            }
            // values absent from the header have no postings; skip
        }
        ranges.sort_by_key(|r| r.0);

        let index_name = meta::index_name(id);
        for part in partition_ranges(&ranges, MAX_RANGE_GAP) {
            let (part_start, part_end) = part.bounds;
            let window = self
                .bucket
                .get_range(&index_name, part_start, (part_end - part_start) as i64)
                .await?;
            for &(start, end, ref key) in part.items {
                let raw = &window[(start - part_start) as usize..(end - part_start) as usize];
                self.index_cache
                    .store_postings(id, &key.0, &key.1, raw.to_vec())
                    .await;
                out.insert(key.clone(), index::decode_postings(raw)?);
            }
        }
        Ok(out)
    }

    /// Resolve series records for the refs: cache first, then ranged reads
    /// over the series section with slack, with an exact two-step fallback
    /// for records larger than the slack window.
    async fn fetch_series_records(
        &self,
        id: Ulid,
        header: &IndexHeader,
        refs: &[u64],
    ) -> Result<Vec<index::IndexSeries>, Error> {
        let (hits, misses) = self.index_cache.fetch_multi_series(id, refs).await;

        let mut decoded: BTreeMap<u64, index::IndexSeries> = BTreeMap::new();
        for (r, raw) in hits {
            decoded.insert(r, index::decode_series(&raw, header.symbols())?.0);
        }
        if !misses.is_empty() {
            let (_, series_end) = header.series_section();
            let index_name = meta::index_name(id);

            let mut sorted = misses.clone();
            sorted.sort_unstable();
            let ranges: Vec<(u64, u64, u64)> = sorted
                .iter()
                .map(|&r| (r, (r + SERIES_FETCH_SLACK).min(series_end), r))
                .collect();

            for part in partition_ranges(&ranges, MAX_RANGE_GAP) {
                let (part_start, part_end) = part.bounds;
                let window = self
                    .bucket
                    .get_range(&index_name, part_start, (part_end - part_start) as i64)
                    .await?;
                for &(start, _, r) in part.items {
                    let rel = (start - part_start) as usize;
                    match index::decode_series(&window[rel..], header.symbols()) {
                        Ok((series, used)) => {
                            self.index_cache
                                .store_series(id, r, window[rel..rel + used].to_vec())
                                .await;
                            decoded.insert(r, series);
                        }
                        Err(_) => {
                            // record longer than the slack window
                            let series = self.fetch_series_exact(id, header, r).await?;
                            decoded.insert(r, series);
                        }
                    }
                }
            }
        }
        Ok(decoded.into_iter().map(|(_, s)| s).collect())
    }

    async fn fetch_series_exact(
        &self,
        id: Ulid,
        header: &IndexHeader,
        series_ref: u64,
    ) -> Result<index::IndexSeries, Error> {
        let index_name = meta::index_name(id);
        let len_raw = self.bucket.get_range(&index_name, series_ref, 4).await?;
        let payload_len =
            u32::from_le_bytes([len_raw[0], len_raw[1], len_raw[2], len_raw[3]]) as u64;
        let raw = self
            .bucket
            .get_range(&index_name, series_ref, 4 + payload_len as i64)
            .await?;
        let (series, used) = index::decode_series(&raw, header.symbols())?;
        self.index_cache
            .store_series(id, series_ref, raw[..used].to_vec())
            .await;
        Ok(series)
    }

    /// Fetch chunk payloads through the chunk pool, coalescing reads per
    /// segment file.
    async fn fetch_chunks(
        &self,
        id: Ulid,
        chunk_metas: &[ChunkMeta],
    ) -> Result<Vec<proto::Chunk>, Error> {
        let mut by_segment: BTreeMap<u32, Vec<(u64, u64, ChunkMeta)>> = BTreeMap::new();
        for &cm in chunk_metas {
            by_segment.entry(cm.segment()).or_default().push((
                cm.offset() as u64,
                cm.offset() as u64 + cm.len as u64,
                cm,
            ));
        }

        let mut out = Vec::with_capacity(chunk_metas.len());
        for (segment, mut ranges) in by_segment {
            ranges.sort_by_key(|r| r.0);
            let segment_name = meta::chunk_segment_name(id, segment);
            for part in partition_ranges(&ranges, MAX_RANGE_GAP) {
                let (part_start, part_end) = part.bounds;
                // budget gate on the bytes held in flight
                let mut buf = self.chunk_pool.acquire((part_end - part_start) as usize).await?;
                let window = self
                    .bucket
                    .get_range(&segment_name, part_start, (part_end - part_start) as i64)
                    .await?;
                buf.as_mut_vec().extend_from_slice(&window);
                drop(window);

                for &(start, _, cm) in part.items {
                    let rel = (start - part_start) as usize;
                    let (chunk, _) =
                        crate::tsdb::block::decode_chunk_record(&buf[rel..rel + cm.len as usize])?;
                    out.push(proto::Chunk {
                        min_time: cm.min_time,
                        max_time: cm.max_time,
                        encoding: chunk.encoding.as_u8() as u32,
                        data: chunk.data,
                    });
                }
            }
        }
        out.sort_by_key(|c| c.min_time);
        Ok(out)
    }
}

/// Check matchers naming external labels against the block's labels and
/// return the remaining in-block matchers. `None` means the block cannot
/// match.
fn split_block_matchers(matchers: &[Matcher], external: &Labels) -> Option<Vec<Matcher>> {
    let mut block_matchers = Vec::with_capacity(matchers.len());
    for matcher in matchers {
        match external.get(&matcher.name) {
            Some(value) => {
                if !matcher.matches_value(value) {
                    return None;
                }
            }
            None => block_matchers.push(matcher.clone()),
        }
    }
    Some(block_matchers)
}

struct PostingsGroup {
    name: String,
    add_all: bool,
    add: Vec<String>,
    remove: Vec<String>,
}

impl PostingsGroup {
    /// A matcher accepting the empty value also matches series lacking the
    /// label entirely: start from all postings and subtract the values the
    /// matcher rejects. Otherwise union the accepted values.
    fn build(matcher: &Matcher, header: &IndexHeader) -> Self {
        let values = header.label_values(&matcher.name);
        if matcher.matches_empty() {
            PostingsGroup {
                name: matcher.name.clone(),
                add_all: true,
                add: Vec::new(),
                remove: values
                    .iter()
                    .filter(|v| !matcher.matches_value(v))
                    .cloned()
                    .collect(),
            }
        } else {
            PostingsGroup {
                name: matcher.name.clone(),
                add_all: false,
                add: values
                    .iter()
                    .filter(|v| matcher.matches_value(v))
                    .cloned()
                    .collect(),
                remove: Vec::new(),
            }
        }
    }
}

struct RangePart<'a, T> {
    bounds: (u64, u64),
    items: &'a [T],
}

trait RangeItem {
    fn start(&self) -> u64;
    fn end(&self) -> u64;
}

impl<T> RangeItem for (u64, u64, T) {
    fn start(&self) -> u64 {
        self.0
    }
    fn end(&self) -> u64 {
        self.1
    }
}

/// Split sorted `[start, end)` items into parts whose gaps stay below
/// `max_gap`; each part becomes one backing request.
fn partition_ranges<T: RangeItem>(ranges: &[T], max_gap: u64) -> Vec<RangePart<'_, T>> {
    let mut parts = Vec::new();
    let mut begin = 0;
    for i in 1..=ranges.len() {
        let split = i == ranges.len()
            || ranges[i].start() > ranges[i - 1].end() + max_gap;
        if split && i > begin {
            let bounds = (
                ranges[begin].start(),
                ranges[begin..i].iter().map(|r| r.end()).max().unwrap(),
            );
            parts.push(RangePart { bounds, items: &ranges[begin..i] });
            begin = i;
        }
    }
    parts
}

fn intersect_sorted(a: &[u64], b: &[u64]) -> Vec<u64> {
    let mut out = Vec::with_capacity(a.len().min(b.len()));
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}

fn union_sorted(a: &[u64], b: &[u64]) -> Vec<u64> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() || j < b.len() {
        let next = match (a.get(i), b.get(j)) {
            (Some(&x), Some(&y)) if x < y => {
                i += 1;
                x
            }
            (Some(&x), Some(&y)) if x > y => {
                j += 1;
                y
            }
            (Some(&x), Some(_)) => {
                i += 1;
                j += 1;
                x
            }
            (Some(&x), None) => {
                i += 1;
                x
            }
            (None, Some(&y)) => {
                j += 1;
                y
            }
            (None, None) => break,
        };
        out.push(next);
    }
    out
}

fn subtract_sorted(a: &[u64], b: &[u64]) -> Vec<u64> {
    let mut out = Vec::with_capacity(a.len());
    let mut j = 0;
    for &x in a {
        while j < b.len() && b[j] < x {
            j += 1;
        }
        if j >= b.len() || b[j] != x {
            out.push(x);
        }
    }
    out
}
