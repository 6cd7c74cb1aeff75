//! Filesystem-backed bucket.
//!
//! Object names map to paths below a root directory. Uploads are atomic
//! (temporary sibling plus rename) so concurrent readers never observe a
//! partially written object.

use std::path::{Path, PathBuf};

use anyhow::format_err;
use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::{range_bounds, BucketError, BucketResult, ObjectBucket};
use crate::tools;

pub struct FsBucket {
    name: String,
    root: PathBuf,
}

impl FsBucket {
    pub fn new(name: &str, root: PathBuf) -> BucketResult<Self> {
        std::fs::create_dir_all(&root)
            .map_err(|err| format_err!("unable to create bucket root {:?} - {}", root, err))?;
        Ok(Self { name: name.to_string(), root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, name: &str) -> BucketResult<PathBuf> {
        if name.is_empty() {
            return Err(BucketError::Other(format_err!("empty object name")));
        }
        let mut path = self.root.clone();
        for part in name.split('/') {
            if part.is_empty() || part == "." || part == ".." {
                return Err(BucketError::Other(format_err!(
                    "invalid object name '{}'",
                    name
                )));
            }
            path.push(part);
        }
        Ok(path)
    }

    fn map_io(name: &str, err: std::io::Error) -> BucketError {
        match err.kind() {
            std::io::ErrorKind::NotFound => BucketError::NotFound(name.to_string()),
            std::io::ErrorKind::PermissionDenied => BucketError::Permission(name.to_string()),
            _ => BucketError::Transient { name: name.to_string(), reason: err.to_string() },
        }
    }
}

impl ObjectBucket for FsBucket {
    fn name(&self) -> &str {
        &self.name
    }

    fn upload<'a>(&'a self, name: &'a str, data: Bytes) -> BoxFuture<'a, BucketResult<()>> {
        Box::pin(async move {
            let path = self.object_path(name)?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|err| Self::map_io(name, err))?;
            }
            tools::runtime::block_in_place(|| tools::file_set_contents(&path, &data))
                .map_err(BucketError::Other)
        })
    }

    fn get<'a>(&'a self, name: &'a str) -> BoxFuture<'a, BucketResult<Bytes>> {
        Box::pin(async move {
            let path = self.object_path(name)?;
            let data = tokio::fs::read(&path)
                .await
                .map_err(|err| Self::map_io(name, err))?;
            Ok(Bytes::from(data))
        })
    }

    fn get_range<'a>(
        &'a self,
        name: &'a str,
        offset: u64,
        length: i64,
    ) -> BoxFuture<'a, BucketResult<Bytes>> {
        Box::pin(async move {
            let path = self.object_path(name)?;
            let mut file = tokio::fs::File::open(&path)
                .await
                .map_err(|err| Self::map_io(name, err))?;
            let size = file
                .metadata()
                .await
                .map_err(|err| Self::map_io(name, err))?
                .len();
            let (start, end) = range_bounds(size, offset, length)?;

            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|err| Self::map_io(name, err))?;
            let mut buf = vec![0u8; (end - start) as usize];
            file.read_exact(&mut buf)
                .await
                .map_err(|err| Self::map_io(name, err))?;
            Ok(Bytes::from(buf))
        })
    }

    fn exists<'a>(&'a self, name: &'a str) -> BoxFuture<'a, BucketResult<bool>> {
        Box::pin(async move {
            let path = self.object_path(name)?;
            match tokio::fs::metadata(&path).await {
                Ok(meta) => Ok(meta.is_file()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(err) => Err(Self::map_io(name, err)),
            }
        })
    }

    fn iter<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, BucketResult<Vec<String>>> {
        Box::pin(async move {
            let dir = if prefix.is_empty() {
                self.root.clone()
            } else {
                self.object_path(prefix.trim_end_matches('/'))?
            };

            let mut children = Vec::new();
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    return Ok(children);
                }
                Err(err) => return Err(Self::map_io(prefix, err)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|err| Self::map_io(prefix, err))?
            {
                let file_name = match entry.file_name().into_string() {
                    Ok(s) => s,
                    Err(_) => continue, // skip non-utf8 names
                };
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|err| Self::map_io(prefix, err))?;
                if file_type.is_dir() {
                    children.push(format!("{}/", file_name));
                } else if !file_name.ends_with(".tmp") {
                    children.push(file_name);
                }
            }
            children.sort();
            Ok(children)
        })
    }

    fn object_size<'a>(&'a self, name: &'a str) -> BoxFuture<'a, BucketResult<u64>> {
        Box::pin(async move {
            let path = self.object_path(name)?;
            let meta = tokio::fs::metadata(&path)
                .await
                .map_err(|err| Self::map_io(name, err))?;
            if !meta.is_file() {
                return Err(BucketError::NotFound(name.to_string()));
            }
            Ok(meta.len())
        })
    }

    fn delete<'a>(&'a self, name: &'a str) -> BoxFuture<'a, BucketResult<()>> {
        Box::pin(async move {
            let path = self.object_path(name)?;
            tokio::fs::remove_file(&path)
                .await
                .map_err(|err| Self::map_io(name, err))?;
            // drop empty parents up to the bucket root, listings stay clean
            let mut parent = path.parent().map(Path::to_owned);
            while let Some(dir) = parent {
                if dir == self.root || std::fs::remove_dir(&dir).is_err() {
                    break;
                }
                parent = dir.parent().map(Path::to_owned);
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs_bucket() -> (tempfile::TempDir, FsBucket) {
        let dir = tempfile::tempdir().unwrap();
        let bucket = FsBucket::new("fs", dir.path().join("bucket")).unwrap();
        (dir, bucket)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fs_roundtrip() {
        let (_tmp, bucket) = fs_bucket();

        bucket.upload("blk/meta.json", Bytes::from_static(b"{}")).await.unwrap();
        bucket.upload("blk/chunks/000001", Bytes::from_static(b"0123456789")).await.unwrap();

        assert!(bucket.exists("blk/meta.json").await.unwrap());
        assert_eq!(bucket.get("blk/chunks/000001").await.unwrap(), Bytes::from_static(b"0123456789"));
        assert_eq!(bucket.get_range("blk/chunks/000001", 3, 4).await.unwrap(), Bytes::from_static(b"3456"));
        assert_eq!(bucket.get_range("blk/chunks/000001", 3, -1).await.unwrap(), Bytes::from_static(b"3456789"));
        assert_eq!(bucket.object_size("blk/chunks/000001").await.unwrap(), 10);

        assert_eq!(bucket.iter("").await.unwrap(), vec!["blk/"]);
        assert_eq!(bucket.iter("blk").await.unwrap(), vec!["chunks/", "meta.json"]);

        match bucket.get("blk/none").await {
            Err(err) => assert!(err.is_not_found()),
            Ok(_) => panic!("expected not-found"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fs_delete_cleans_dirs() {
        let (_tmp, bucket) = fs_bucket();
        bucket.upload("blk/chunks/000001", Bytes::from_static(b"x")).await.unwrap();
        bucket.delete("blk/chunks/000001").await.unwrap();

        assert_eq!(bucket.iter("").await.unwrap(), Vec::<String>::new());
        assert!(bucket.delete("blk/chunks/000001").await.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fs_rejects_traversal() {
        let (_tmp, bucket) = fs_bucket();
        assert!(bucket.get("../escape").await.is_err());
        assert!(bucket.get("a//b").await.is_err());
    }
}
