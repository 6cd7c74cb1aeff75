//! Byte-budgeted buffer pool for chunk data.
//!
//! Buffers come from power-of-two size classes and count against one global
//! byte ceiling. When the ceiling is reached, acquisition waits until
//! another request releases its buffers; the caller bounds the wait with
//! its request deadline. Guards return their bytes on drop.

use std::sync::{Arc, Mutex};

use anyhow::Error;
use tokio::sync::Notify;

pub const MIN_BUCKET_SIZE: usize = 1024;
pub const MAX_BUCKET_SIZE: usize = 16 * 1024 * 1024;

pub struct ChunkPool {
    max_total: u64,
    used: Mutex<u64>,
    free_lists: Vec<Mutex<Vec<Vec<u8>>>>,
    released: Notify,
}

impl ChunkPool {
    pub fn new(max_total: u64) -> Arc<Self> {
        let mut classes = 0;
        let mut size = MIN_BUCKET_SIZE;
        while size <= MAX_BUCKET_SIZE {
            classes += 1;
            size *= 2;
        }
        Arc::new(Self {
            max_total,
            used: Mutex::new(0),
            free_lists: (0..classes).map(|_| Mutex::new(Vec::new())).collect(),
            released: Notify::new(),
        })
    }

    fn class_of(size: usize) -> Option<(usize, usize)> {
        let mut class_size = MIN_BUCKET_SIZE;
        let mut idx = 0;
        while class_size <= MAX_BUCKET_SIZE {
            if size <= class_size {
                return Some((idx, class_size));
            }
            class_size *= 2;
            idx += 1;
        }
        None
    }

    pub fn used_bytes(&self) -> u64 {
        *self.used.lock().unwrap()
    }

    /// Acquire a buffer of at least `size` bytes. Waits while the pool is at
    /// its ceiling; callers run under their request deadline.
    pub async fn acquire(self: &Arc<Self>, size: usize) -> Result<PooledBuf, Error> {
        let (class, class_size) = match Self::class_of(size) {
            Some(found) => found,
            None => anyhow::bail!(
                "requested buffer of {} bytes exceeds largest pool class {}",
                size,
                MAX_BUCKET_SIZE
            ),
        };
        if class_size as u64 > self.max_total {
            anyhow::bail!(
                "requested buffer of {} bytes exceeds pool budget {}",
                size,
                self.max_total
            );
        }

        loop {
            // register for wakeup before checking, a release between the
            // check and the await must not be lost
            let released = self.released.notified();
            {
                let mut used = self.used.lock().unwrap();
                if *used + class_size as u64 <= self.max_total {
                    *used += class_size as u64;
                    let mut data = self.free_lists[class]
                        .lock()
                        .unwrap()
                        .pop()
                        .unwrap_or_else(|| Vec::with_capacity(class_size));
                    data.clear();
                    return Ok(PooledBuf { data, class, class_size, pool: Arc::clone(self) });
                }
            }
            released.await;
        }
    }
}

/// A pooled byte buffer; returns to the pool on drop.
pub struct PooledBuf {
    data: Vec<u8>,
    class: usize,
    class_size: usize,
    pool: Arc<ChunkPool>,
}

impl PooledBuf {
    pub fn as_mut_vec(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }
}

impl std::ops::Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        // keep the allocation only if it stayed within its class
        if data.capacity() <= self.class_size * 2 {
            self.pool.free_lists[self.class].lock().unwrap().push(data);
        }
        *self.pool.used.lock().unwrap() -= self.class_size as u64;
        self.pool.released.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_release() {
        let pool = ChunkPool::new(1024 * 1024);

        let mut buf = pool.acquire(100).await.unwrap();
        buf.as_mut_vec().extend_from_slice(b"hello");
        assert_eq!(&*buf, b"hello");
        assert_eq!(pool.used_bytes(), MIN_BUCKET_SIZE as u64);

        drop(buf);
        assert_eq!(pool.used_bytes(), 0);
    }

    #[tokio::test]
    async fn test_size_classes() {
        assert_eq!(ChunkPool::class_of(1), Some((0, 1024)));
        assert_eq!(ChunkPool::class_of(1024), Some((0, 1024)));
        assert_eq!(ChunkPool::class_of(1025), Some((1, 2048)));
        assert_eq!(ChunkPool::class_of(MAX_BUCKET_SIZE), Some((14, MAX_BUCKET_SIZE)));
        assert!(ChunkPool::class_of(MAX_BUCKET_SIZE + 1).is_none());
    }

    #[tokio::test]
    async fn test_blocks_until_release() {
        let pool = ChunkPool::new(2048);
        let held = pool.acquire(2000).await.unwrap();

        // budget exhausted: acquisition must wait
        let waiting = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(1000).await.map(|b| b.len()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        drop(held);
        let result = tokio::time::timeout(Duration::from_secs(1), waiting).await.unwrap();
        assert!(result.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_oversized_request_fails_fast() {
        let pool = ChunkPool::new(1024);
        assert!(pool.acquire(4096).await.is_err());
        assert!(pool.acquire(MAX_BUCKET_SIZE + 1).await.is_err());
    }

    #[tokio::test]
    async fn test_buffer_reuse() {
        let pool = ChunkPool::new(1024 * 1024);
        let mut buf = pool.acquire(512).await.unwrap();
        buf.as_mut_vec().resize(512, 7);
        let ptr = buf.as_mut_vec().as_ptr();
        drop(buf);

        let buf = pool.acquire(512).await.unwrap();
        assert!(buf.is_empty());
        assert_eq!(buf.as_ptr(), ptr);
    }
}
