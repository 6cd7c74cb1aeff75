//! Lazy index-header reader pool.
//!
//! The gateway holds one `LazyHeaderReader` per block. The decoded header is
//! loaded on first use and shared by all concurrent readers of the block;
//! after `idle_timeout` without use the pool releases the decoded state and
//! the next access transparently re-loads it. Closing the pool drops every
//! loaded header; outstanding readers simply re-open on next use.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Error;
use ulid::Ulid;

use super::index_header::{self, IndexHeader};
use crate::objstore::ObjectBucket;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub struct LazyHeaderReader {
    bucket: Arc<dyn ObjectBucket>,
    id: Ulid,
    state: tokio::sync::Mutex<Option<Arc<IndexHeader>>>,
    last_used: Mutex<Instant>,
    loads: std::sync::atomic::AtomicU64,
}

impl LazyHeaderReader {
    fn new(bucket: Arc<dyn ObjectBucket>, id: Ulid) -> Self {
        Self {
            bucket,
            id,
            state: tokio::sync::Mutex::new(None),
            last_used: Mutex::new(Instant::now()),
            loads: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn block_id(&self) -> Ulid {
        self.id
    }

    /// Times the header has been (re-)loaded; visible for tests and logs.
    pub fn load_count(&self) -> u64 {
        self.loads.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// The decoded header, loading it if released. Concurrent callers share
    /// one load.
    pub async fn header(&self) -> Result<Arc<IndexHeader>, Error> {
        *self.last_used.lock().unwrap() = Instant::now();

        let mut state = self.state.lock().await;
        if let Some(header) = state.as_ref() {
            return Ok(Arc::clone(header));
        }

        let header = Arc::new(index_header::ensure_header(self.bucket.as_ref(), self.id).await?);
        self.loads.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        *state = Some(Arc::clone(&header));
        Ok(header)
    }

    fn release_if_idle(&self, idle_timeout: Duration) -> bool {
        let last_used = *self.last_used.lock().unwrap();
        if last_used.elapsed() < idle_timeout {
            return false;
        }
        // skip when a load is in flight
        if let Ok(mut state) = self.state.try_lock() {
            if state.take().is_some() {
                return true;
            }
        }
        false
    }

    fn release(&self) {
        if let Ok(mut state) = self.state.try_lock() {
            state.take();
        }
    }
}

pub struct HeaderReaderPool {
    bucket: Arc<dyn ObjectBucket>,
    idle_timeout: Duration,
    readers: Mutex<HashMap<Ulid, Arc<LazyHeaderReader>>>,
}

impl HeaderReaderPool {
    pub fn new(bucket: Arc<dyn ObjectBucket>, idle_timeout: Duration) -> Self {
        Self {
            bucket,
            idle_timeout,
            readers: Mutex::new(HashMap::new()),
        }
    }

    /// Reader for the given block; all callers share one instance.
    pub fn acquire(&self, id: Ulid) -> Arc<LazyHeaderReader> {
        let mut readers = self.readers.lock().unwrap();
        Arc::clone(
            readers
                .entry(id)
                .or_insert_with(|| Arc::new(LazyHeaderReader::new(Arc::clone(&self.bucket), id))),
        )
    }

    /// Drop the reader of a removed block.
    pub fn remove(&self, id: Ulid) {
        if let Some(reader) = self.readers.lock().unwrap().remove(&id) {
            reader.release();
        }
    }

    /// Release decoded headers that have not been used within the idle
    /// timeout. Returns how many were released.
    pub fn release_idle(&self) -> usize {
        let readers: Vec<Arc<LazyHeaderReader>> =
            self.readers.lock().unwrap().values().cloned().collect();
        readers
            .iter()
            .filter(|r| r.release_if_idle(self.idle_timeout))
            .count()
    }

    /// Release everything. Outstanding readers re-open on next use.
    pub fn close(&self) {
        let readers: Vec<Arc<LazyHeaderReader>> =
            self.readers.lock().unwrap().values().cloned().collect();
        for reader in readers {
            reader.release();
        }
    }

    pub fn len(&self) -> usize {
        self.readers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.readers.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::Labels;
    use crate::objstore::MemoryBucket;
    use crate::tsdb::block::{cut_chunks, write_block, BlockSeries};

    async fn upload_block(bucket: &MemoryBucket) -> Ulid {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("blk");
        let meta = super::super::meta::BlockMeta::new_level1(
            crate::tsdb::block::new_block_id(1),
            0,
            1000,
            Labels::from_pairs(vec![("r", "1")]).unwrap(),
            super::super::meta::SourceType::Receiver,
        );
        let series = vec![BlockSeries {
            labels: Labels::from_pairs(vec![("a", "1")]).unwrap(),
            chunks: cut_chunks(&[(0, 1.0)]).unwrap(),
        }];
        let meta = write_block(&dir, meta, series).unwrap();
        super::super::upload_block(bucket, &dir).await.unwrap();
        meta.ulid
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shared_reader_single_load() {
        let bucket = Arc::new(MemoryBucket::new("m"));
        let id = upload_block(&bucket).await;

        let pool = HeaderReaderPool::new(bucket, DEFAULT_IDLE_TIMEOUT);
        let r1 = pool.acquire(id);
        let r2 = pool.acquire(id);
        assert!(Arc::ptr_eq(&r1, &r2));

        r1.header().await.unwrap();
        r2.header().await.unwrap();
        assert_eq!(r1.load_count(), 1);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_idle_release_and_reopen() {
        let bucket = Arc::new(MemoryBucket::new("m"));
        let id = upload_block(&bucket).await;

        let pool = HeaderReaderPool::new(bucket, Duration::from_millis(0));
        let reader = pool.acquire(id);
        reader.header().await.unwrap();

        assert_eq!(pool.release_idle(), 1);
        // still usable while a reference exists, reopens transparently
        reader.header().await.unwrap();
        assert_eq!(reader.load_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_releases_all() {
        let bucket = Arc::new(MemoryBucket::new("m"));
        let id = upload_block(&bucket).await;

        let pool = HeaderReaderPool::new(bucket, DEFAULT_IDLE_TIMEOUT);
        let reader = pool.acquire(id);
        reader.header().await.unwrap();
        pool.close();

        reader.header().await.unwrap();
        assert_eq!(reader.load_count(), 2);

        pool.remove(id);
        assert!(pool.is_empty());
    }
}
