//! Object storage abstraction.
//!
//! Every component talks to remote blob storage through the `ObjectBucket`
//! trait: whole-object and ranged reads, idempotent uploads, non-recursive
//! listing and deletes. Backends are selected from a tagged configuration at
//! startup. Read-after-write consistency is assumed at the object level;
//! listings are treated as eventually consistent by all callers.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::format_err;
use bytes::Bytes;
use futures::future::BoxFuture;
use serde::Deserialize;

pub mod cache;
pub mod caching;
pub mod fs;

pub use caching::CachingBucket;
pub use fs::FsBucket;

/// Error category of a bucket operation. Callers branch on `NotFound`
/// everywhere; `Transient` marks retry-eligible failures.
#[derive(Debug, thiserror::Error)]
pub enum BucketError {
    #[error("object '{0}' not found")]
    NotFound(String),
    #[error("access to object '{0}' denied")]
    Permission(String),
    #[error("transient failure on object '{name}' - {reason}")]
    Transient { name: String, reason: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type BucketResult<T> = Result<T, BucketError>;

/// Whether an error (possibly wrapped in `anyhow::Error`) is the
/// distinguished not-found condition.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<BucketError>() {
        Some(BucketError::NotFound(_)) => true,
        _ => false,
    }
}

impl BucketError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BucketError::NotFound(_))
    }
}

/// Uniform access to remote blob storage.
///
/// `iter` lists immediate children of a prefix, directories suffixed with
/// `/`. `get_range` returns exactly `[offset, offset+length)`; a length of
/// `-1` reads to the object end.
pub trait ObjectBucket: Send + Sync {
    fn name(&self) -> &str;

    fn upload<'a>(&'a self, name: &'a str, data: Bytes) -> BoxFuture<'a, BucketResult<()>>;

    fn get<'a>(&'a self, name: &'a str) -> BoxFuture<'a, BucketResult<Bytes>>;

    fn get_range<'a>(
        &'a self,
        name: &'a str,
        offset: u64,
        length: i64,
    ) -> BoxFuture<'a, BucketResult<Bytes>>;

    fn exists<'a>(&'a self, name: &'a str) -> BoxFuture<'a, BucketResult<bool>>;

    fn iter<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, BucketResult<Vec<String>>>;

    fn object_size<'a>(&'a self, name: &'a str) -> BoxFuture<'a, BucketResult<u64>>;

    fn delete<'a>(&'a self, name: &'a str) -> BoxFuture<'a, BucketResult<()>>;
}

/// Delete every object under a prefix. Not atomic; callers delete the
/// meta.json first so readers stop considering the block.
pub async fn delete_prefix(bucket: &dyn ObjectBucket, prefix: &str) -> BucketResult<()> {
    let children = bucket.iter(prefix).await?;
    for child in children {
        if child.ends_with('/') {
            let sub = format!("{}{}", prefix_with_slash(prefix), child);
            Box::pin(delete_prefix(bucket, sub.trim_end_matches('/'))).await?;
        } else {
            let name = format!("{}{}", prefix_with_slash(prefix), child);
            match bucket.delete(&name).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
    }
    Ok(())
}

fn prefix_with_slash(prefix: &str) -> String {
    if prefix.is_empty() || prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{}/", prefix)
    }
}

/// Compute the slice bounds for a ranged read against an object of known
/// size, honoring the `-1` to-end convention.
pub fn range_bounds(size: u64, offset: u64, length: i64) -> BucketResult<(u64, u64)> {
    if offset > size {
        return Err(BucketError::Other(format_err!(
            "range offset {} beyond object size {}",
            offset,
            size
        )));
    }
    let end = if length < 0 {
        size
    } else {
        (offset + length as u64).min(size)
    };
    Ok((offset, end))
}

/// Tagged bucket configuration, selected at startup.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BucketConfig {
    Memory,
    Filesystem { directory: PathBuf },
}

pub fn create_bucket(config: &BucketConfig) -> BucketResult<Arc<dyn ObjectBucket>> {
    match config {
        BucketConfig::Memory => Ok(Arc::new(MemoryBucket::new("memory"))),
        BucketConfig::Filesystem { directory } => {
            Ok(Arc::new(FsBucket::new("filesystem", directory.clone())?))
        }
    }
}

/// Per-operation call counters, used by tests and surfaced in debug logs.
#[derive(Debug, Default)]
pub struct OpCounters {
    pub get: AtomicU64,
    pub get_range: AtomicU64,
    pub upload: AtomicU64,
    pub exists: AtomicU64,
    pub iter: AtomicU64,
    pub object_size: AtomicU64,
    pub delete: AtomicU64,
}

/// In-memory bucket used by tests and as cache-light local deployments.
pub struct MemoryBucket {
    name: String,
    objects: RwLock<std::collections::BTreeMap<String, Bytes>>,
    pub counters: OpCounters,
}

impl MemoryBucket {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            objects: RwLock::new(Default::default()),
            counters: OpCounters::default(),
        }
    }

    pub fn object_names(&self) -> Vec<String> {
        self.objects.read().unwrap().keys().cloned().collect()
    }

    fn read_object(&self, name: &str) -> BucketResult<Bytes> {
        self.objects
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| BucketError::NotFound(name.to_string()))
    }
}

impl ObjectBucket for MemoryBucket {
    fn name(&self) -> &str {
        &self.name
    }

    fn upload<'a>(&'a self, name: &'a str, data: Bytes) -> BoxFuture<'a, BucketResult<()>> {
        self.counters.upload.fetch_add(1, Ordering::Relaxed);
        let name = name.to_string();
        Box::pin(async move {
            self.objects.write().unwrap().insert(name, data);
            Ok(())
        })
    }

    fn get<'a>(&'a self, name: &'a str) -> BoxFuture<'a, BucketResult<Bytes>> {
        self.counters.get.fetch_add(1, Ordering::Relaxed);
        Box::pin(async move { self.read_object(name) })
    }

    fn get_range<'a>(
        &'a self,
        name: &'a str,
        offset: u64,
        length: i64,
    ) -> BoxFuture<'a, BucketResult<Bytes>> {
        self.counters.get_range.fetch_add(1, Ordering::Relaxed);
        Box::pin(async move {
            let data = self.read_object(name)?;
            let (start, end) = range_bounds(data.len() as u64, offset, length)?;
            Ok(data.slice(start as usize..end as usize))
        })
    }

    fn exists<'a>(&'a self, name: &'a str) -> BoxFuture<'a, BucketResult<bool>> {
        self.counters.exists.fetch_add(1, Ordering::Relaxed);
        Box::pin(async move { Ok(self.objects.read().unwrap().contains_key(name)) })
    }

    fn iter<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, BucketResult<Vec<String>>> {
        self.counters.iter.fetch_add(1, Ordering::Relaxed);
        Box::pin(async move {
            let prefix = prefix_with_slash(prefix);
            let objects = self.objects.read().unwrap();
            let mut children = BTreeSet::new();
            for name in objects.keys() {
                if let Some(rest) = name.strip_prefix(&prefix) {
                    if rest.is_empty() {
                        continue;
                    }
                    match rest.find('/') {
                        Some(idx) => {
                            children.insert(format!("{}/", &rest[..idx]));
                        }
                        None => {
                            children.insert(rest.to_string());
                        }
                    }
                }
            }
            Ok(children.into_iter().collect())
        })
    }

    fn object_size<'a>(&'a self, name: &'a str) -> BoxFuture<'a, BucketResult<u64>> {
        self.counters.object_size.fetch_add(1, Ordering::Relaxed);
        Box::pin(async move { Ok(self.read_object(name)?.len() as u64) })
    }

    fn delete<'a>(&'a self, name: &'a str) -> BoxFuture<'a, BucketResult<()>> {
        self.counters.delete.fetch_add(1, Ordering::Relaxed);
        Box::pin(async move {
            match self.objects.write().unwrap().remove(name) {
                Some(_) => Ok(()),
                None => Err(BucketError::NotFound(name.to_string())),
            }
        })
    }
}
