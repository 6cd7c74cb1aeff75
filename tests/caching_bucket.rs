//! Range-request coalescing through the caching bucket.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cairn::objstore::cache::InMemoryCache;
use cairn::objstore::caching::{match_all, CachingBucket};
use cairn::objstore::{MemoryBucket, ObjectBucket};

const SUBRANGE: u64 = 16 * 1024;

fn caching(backing: Arc<MemoryBucket>, max_sub_requests: usize) -> CachingBucket {
    let cache = Arc::new(InMemoryCache::new("range", 64 * 1024 * 1024, 4 * 1024 * 1024));
    CachingBucket::new(backing).cache_get_range(
        match_all(),
        cache,
        SUBRANGE,
        Duration::from_secs(600),
        Duration::from_secs(600),
        max_sub_requests,
    )
}

#[tokio::test]
async fn cold_warm_mixed_reads_are_identical() {
    let backing = Arc::new(MemoryBucket::new("m"));
    let object: Vec<u8> = (0..100 * 1024).map(|i| (i * 31 % 251) as u8).collect();
    backing.upload("blk/index", Bytes::from(object.clone())).await.unwrap();

    let caching = caching(backing.clone(), 3);
    let want = Bytes::from(object[0..48_000].to_vec());

    // cold: at most three backing requests fetching exactly the three
    // touched 16 KiB subranges
    let cold = caching.get_range("blk/index", 0, 48_000).await.unwrap();
    assert_eq!(cold, want);
    assert!(backing.counters.get_range.load(Ordering::Relaxed) <= 3);
    assert_eq!(
        caching.range_stats.fetched_bytes.load(Ordering::Relaxed),
        48 * 1024
    );

    // warm: zero backing requests, same bytes
    let requests_before = backing.counters.get_range.load(Ordering::Relaxed);
    let warm = caching.get_range("blk/index", 0, 48_000).await.unwrap();
    assert_eq!(warm, want);
    assert_eq!(backing.counters.get_range.load(Ordering::Relaxed), requests_before);

    // mixed: a wider window reuses the cached prefix
    let mixed = caching.get_range("blk/index", 0, 80_000).await.unwrap();
    assert_eq!(mixed, Bytes::from(object[0..80_000].to_vec()));

    // and a second mixed read is fully warm
    let requests_before = backing.counters.get_range.load(Ordering::Relaxed);
    let again = caching.get_range("blk/index", 0, 80_000).await.unwrap();
    assert_eq!(again, mixed);
    assert_eq!(backing.counters.get_range.load(Ordering::Relaxed), requests_before);
}

#[tokio::test]
async fn sub_request_limit_coalesces_scattered_misses() {
    let backing = Arc::new(MemoryBucket::new("m"));
    let object: Vec<u8> = (0..256 * 1024).map(|i| (i % 253) as u8).collect();
    backing.upload("obj", Bytes::from(object.clone())).await.unwrap();

    let caching = caching(backing.clone(), 2);

    // touch scattered subranges so the next read has interleaved misses
    caching.get_range("obj", 40_000, 100).await.unwrap();
    caching.get_range("obj", 200_000, 100).await.unwrap();

    let requests_before = backing.counters.get_range.load(Ordering::Relaxed);
    let full = caching.get_range("obj", 0, 256 * 1024).await.unwrap();
    assert_eq!(full, Bytes::from(object));

    // scattered misses merged into at most two backing requests
    assert!(backing.counters.get_range.load(Ordering::Relaxed) - requests_before <= 2);
}

#[tokio::test]
async fn unaligned_object_tail() {
    let backing = Arc::new(MemoryBucket::new("m"));
    // size deliberately not a multiple of the subrange stride
    let object: Vec<u8> = (0..50_001).map(|i| (i % 7) as u8).collect();
    backing.upload("obj", Bytes::from(object.clone())).await.unwrap();

    let caching = caching(backing.clone(), 3);

    let tail = caching.get_range("obj", 49_000, -1).await.unwrap();
    assert_eq!(tail, Bytes::from(object[49_000..].to_vec()));

    let warm = caching.get_range("obj", 49_000, -1).await.unwrap();
    assert_eq!(warm, tail);

    // whole object through the cache equals the original
    let full = caching.get_range("obj", 0, -1).await.unwrap();
    assert_eq!(full, Bytes::from(object));
}
