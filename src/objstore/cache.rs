//! Cache backends used by the caching bucket and the index cache.
//!
//! Cache failures are never surfaced to callers: a failed store is dropped,
//! a failed fetch degrades to a miss and the caller falls back to the
//! backing bucket.

use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use lru::LruCache;
use serde::Deserialize;
use siphasher::sip::SipHasher13;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;

/// Byte cache with TTL semantics. Values may be dropped at any time.
pub trait ObjectCache: Send + Sync {
    fn name(&self) -> &str;

    fn store<'a>(&'a self, key: String, value: Vec<u8>, ttl: Duration) -> BoxFuture<'a, ()>;

    /// Fetch many keys; the result holds an entry for every hit. Keys not in
    /// the result are misses.
    fn fetch_multi<'a>(
        &'a self,
        keys: &'a [String],
    ) -> BoxFuture<'a, HashMap<String, Vec<u8>>>;
}

/// Fetch a single key.
pub async fn fetch_one(cache: &dyn ObjectCache, key: &str) -> Option<Vec<u8>> {
    let keys = [key.to_string()];
    cache.fetch_multi(&keys).await.remove(key)
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CacheConfig {
    #[serde(rename = "in-memory")]
    InMemory {
        #[serde(default = "default_max_bytes")]
        max_bytes: u64,
        #[serde(default = "default_max_item_bytes")]
        max_item_bytes: u64,
    },
    Memcached {
        addr: String,
        #[serde(default = "default_memcached_timeout_ms")]
        timeout_ms: u64,
        #[serde(default = "default_memcached_connections")]
        connections: usize,
        #[serde(default = "default_memcached_batch_size")]
        batch_size: usize,
    },
}

fn default_max_bytes() -> u64 {
    256 * 1024 * 1024
}

fn default_max_item_bytes() -> u64 {
    1024 * 1024
}

fn default_memcached_timeout_ms() -> u64 {
    500
}

fn default_memcached_connections() -> usize {
    4
}

fn default_memcached_batch_size() -> usize {
    64
}

pub fn create_cache(config: &CacheConfig) -> Arc<dyn ObjectCache> {
    match config {
        CacheConfig::InMemory { max_bytes, max_item_bytes } => {
            Arc::new(InMemoryCache::new("in-memory", *max_bytes, *max_item_bytes))
        }
        CacheConfig::Memcached { addr, timeout_ms, connections, batch_size } => {
            Arc::new(MemcachedClient::new(
                "memcached",
                addr.clone(),
                Duration::from_millis(*timeout_ms),
                *connections,
                *batch_size,
            ))
        }
    }
}

struct Entry {
    data: Vec<u8>,
    expires_at: Instant,
}

struct InMemoryInner {
    lru: LruCache<String, Entry>,
    current_bytes: u64,
}

/// Byte-budgeted LRU cache. Size accounting includes key bytes; items above
/// the per-item limit are rejected outright.
pub struct InMemoryCache {
    name: String,
    max_bytes: u64,
    max_item_bytes: u64,
    inner: Mutex<InMemoryInner>,
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub rejected: AtomicU64,
}

impl InMemoryCache {
    pub fn new(name: &str, max_bytes: u64, max_item_bytes: u64) -> Self {
        Self {
            name: name.to_string(),
            max_bytes,
            max_item_bytes,
            inner: Mutex::new(InMemoryInner {
                lru: LruCache::unbounded(),
                current_bytes: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn current_bytes(&self) -> u64 {
        self.inner.lock().unwrap().current_bytes
    }

    fn entry_size(key: &str, data: &[u8]) -> u64 {
        (key.len() + data.len()) as u64
    }
}

impl ObjectCache for InMemoryCache {
    fn name(&self) -> &str {
        &self.name
    }

    fn store<'a>(&'a self, key: String, value: Vec<u8>, ttl: Duration) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let size = Self::entry_size(&key, &value);
            if size > self.max_item_bytes {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                return;
            }
            let mut inner = self.inner.lock().unwrap();
            if let Some(old) = inner.lru.pop(&key) {
                inner.current_bytes -= Self::entry_size(&key, &old.data);
            }
            inner.current_bytes += size;
            inner.lru.put(key, Entry { data: value, expires_at: Instant::now() + ttl });

            while inner.current_bytes > self.max_bytes {
                match inner.lru.pop_lru() {
                    Some((k, e)) => {
                        inner.current_bytes -= Self::entry_size(&k, &e.data);
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                    }
                    None => break,
                }
            }
        })
    }

    fn fetch_multi<'a>(&'a self, keys: &'a [String]) -> BoxFuture<'a, HashMap<String, Vec<u8>>> {
        Box::pin(async move {
            let mut hits = HashMap::new();
            let now = Instant::now();
            let mut inner = self.inner.lock().unwrap();
            for key in keys {
                let found = match inner.lru.get(key) {
                    Some(entry) if entry.expires_at > now => Some(entry.data.clone()),
                    Some(_) => None, // expired
                    None => {
                        self.misses.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                };
                match found {
                    Some(data) => {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        hits.insert(key.clone(), data);
                    }
                    None => {
                        if let Some(old) = inner.lru.pop(key) {
                            inner.current_bytes -= Self::entry_size(key, &old.data);
                        }
                        self.misses.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            hits
        })
    }
}

type Connection = BufStream<TcpStream>;

/// Minimal memcached text protocol client with a small connection pool.
/// Multi-gets are split into batches spread over the pool connections.
pub struct MemcachedClient {
    name: String,
    addr: String,
    timeout: Duration,
    batch_size: usize,
    pool: Vec<tokio::sync::Mutex<Option<Connection>>>,
    next_conn: AtomicUsize,
}

impl MemcachedClient {
    pub fn new(
        name: &str,
        addr: String,
        timeout: Duration,
        connections: usize,
        batch_size: usize,
    ) -> Self {
        let pool = (0..connections.max(1)).map(|_| tokio::sync::Mutex::new(None)).collect();
        Self {
            name: name.to_string(),
            addr,
            timeout,
            batch_size: batch_size.max(1),
            pool,
            next_conn: AtomicUsize::new(0),
        }
    }

    /// Memcached keys are limited to 250 bytes without whitespace; longer or
    /// unsafe keys are replaced by a hash.
    fn sanitize_key(key: &str) -> String {
        let safe = key.len() <= 250
            && key
                .bytes()
                .all(|b| b > 32 && b != 127);
        if safe {
            key.to_string()
        } else {
            let mut hasher = SipHasher13::new();
            hasher.write(key.as_bytes());
            format!("H:{:016x}:{}", hasher.finish(), key.len())
        }
    }

    /// Lock a pool slot, connecting it on first use. On error the slot is
    /// reset so the next request reconnects.
    async fn lock_slot(
        &self,
    ) -> std::io::Result<tokio::sync::MutexGuard<'_, Option<Connection>>> {
        let idx = self.next_conn.fetch_add(1, Ordering::Relaxed) % self.pool.len();
        let mut slot = self.pool[idx].lock().await;
        if slot.is_none() {
            let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr))
                .await
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timeout"))??;
            *slot = Some(BufStream::new(stream));
        }
        Ok(slot)
    }

    async fn get_batch(&self, keys: &[String]) -> std::io::Result<HashMap<String, Vec<u8>>> {
        let mut sanitized: HashMap<String, &String> = HashMap::with_capacity(keys.len());
        let mut command = String::from("get");
        for key in keys {
            let s = Self::sanitize_key(key);
            command.push(' ');
            command.push_str(&s);
            sanitized.insert(s, key);
        }
        command.push_str("\r\n");

        let mut slot = self.lock_slot().await?;
        let conn = slot.as_mut().unwrap();
        let result = tokio::time::timeout(self.timeout, Self::run_get(conn, &command, &sanitized))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "request timeout"))
            .and_then(|r| r);
        if result.is_err() {
            // drop the possibly desynchronized connection
            *slot = None;
        }
        result
    }

    async fn run_get(
        conn: &mut Connection,
        command: &str,
        sanitized: &HashMap<String, &String>,
    ) -> std::io::Result<HashMap<String, Vec<u8>>> {
        conn.write_all(command.as_bytes()).await?;
        conn.flush().await?;

        let mut hits = HashMap::new();
        loop {
            let mut line = String::new();
            if conn.read_line(&mut line).await? == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed mid response",
                ));
            }
            let line = line.trim_end();
            if line == "END" {
                return Ok(hits);
            }
            let mut parts = line.split(' ');
            if parts.next() != Some("VALUE") {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unexpected response line '{}'", line),
                ));
            }
            let key = parts.next().unwrap_or("").to_string();
            let _flags = parts.next();
            let len: usize = parts.next().and_then(|s| s.parse().ok()).ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, "bad VALUE header")
            })?;

            let mut data = vec![0u8; len + 2];
            conn.read_exact(&mut data).await?;
            data.truncate(len); // strip trailing \r\n
            if let Some(original) = sanitized.get(&key) {
                hits.insert((*original).clone(), data);
            }
        }
    }

    async fn run_set(
        conn: &mut Connection,
        key: &str,
        exptime: u64,
        value: &[u8],
    ) -> std::io::Result<()> {
        let header = format!("set {} 0 {} {}\r\n", key, exptime, value.len());
        conn.write_all(header.as_bytes()).await?;
        conn.write_all(value).await?;
        conn.write_all(b"\r\n").await?;
        conn.flush().await?;

        let mut line = String::new();
        conn.read_line(&mut line).await?;
        if line.trim_end() != "STORED" {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("set failed: {}", line.trim_end()),
            ));
        }
        Ok(())
    }
}

impl ObjectCache for MemcachedClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn store<'a>(&'a self, key: String, value: Vec<u8>, ttl: Duration) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let key = Self::sanitize_key(&key);
            let exptime = ttl.as_secs().max(1);

            let result = match self.lock_slot().await {
                Ok(mut slot) => {
                    let conn = slot.as_mut().unwrap();
                    let result =
                        tokio::time::timeout(self.timeout, Self::run_set(conn, &key, exptime, &value))
                            .await
                            .map_err(|_| {
                                std::io::Error::new(std::io::ErrorKind::TimedOut, "request timeout")
                            })
                            .and_then(|r| r);
                    if result.is_err() {
                        *slot = None;
                    }
                    result
                }
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                log::warn!("memcached store failed: {}", err);
            }
        })
    }

    fn fetch_multi<'a>(&'a self, keys: &'a [String]) -> BoxFuture<'a, HashMap<String, Vec<u8>>> {
        Box::pin(async move {
            use futures::stream::{FuturesUnordered, StreamExt};

            let batches: Vec<&[String]> = keys.chunks(self.batch_size).collect();
            let mut futures: FuturesUnordered<_> = batches
                .into_iter()
                .map(|batch| self.get_batch(batch))
                .collect();

            let mut hits = HashMap::new();
            while let Some(result) = futures.next().await {
                match result {
                    Ok(batch_hits) => hits.extend(batch_hits),
                    // a failed batch degrades to misses for its keys
                    Err(err) => log::warn!("memcached multi-get batch failed: {}", err),
                }
            }
            hits
        })
    }
}
