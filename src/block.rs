//! Block-level bucket operations and block metadata handling.
//!
//! Upload order is the one ordering readers rely on: `chunks/*` first, then
//! `index`, then `meta.json` last. A reader that observes a block's meta can
//! therefore read every file the meta references. Deletion inverts this:
//! the meta goes first so the block vanishes from listings-with-meta before
//! its data files do.

use std::path::Path;

use anyhow::{bail, format_err, Error};
use bytes::Bytes;
use ulid::Ulid;
use walkdir::WalkDir;

use crate::objstore::{self, ObjectBucket};

pub mod fetcher;
pub mod header_pool;
pub mod index_cache;
pub mod index_header;
pub mod meta;
pub mod repair;

pub use meta::{BlockMeta, DeletionMark};

/// Upload a local block directory to the bucket in the mandated order.
/// The meta must carry non-empty external labels; anonymous blocks are not
/// allowed into shared storage.
pub async fn upload_block(bucket: &dyn ObjectBucket, dir: &Path) -> Result<BlockMeta, Error> {
    let block_meta = BlockMeta::read_from_dir(dir)?;
    if block_meta.cairn.labels.is_empty() {
        bail!(
            "refusing to upload block {} without external labels",
            block_meta.ulid
        );
    }
    let id = block_meta.ulid;

    // chunk segments first
    let chunks_dir = dir.join(meta::CHUNKS_DIRNAME);
    let mut segments = Vec::new();
    for entry in WalkDir::new(&chunks_dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|err| format_err!("unable to list {:?} - {}", chunks_dir, err))?;
        if let Some(name) = entry.file_name().to_str() {
            if let Ok(seg) = name.parse::<u32>() {
                segments.push((seg, entry.path().to_owned()));
            }
        }
    }
    segments.sort();
    for (seg, path) in segments {
        let data = tokio::fs::read(&path)
            .await
            .map_err(|err| format_err!("unable to read segment {:?} - {}", path, err))?;
        bucket
            .upload(&meta::chunk_segment_name(id, seg), Bytes::from(data))
            .await?;
    }

    // then the index
    let index_data = tokio::fs::read(dir.join(meta::INDEX_FILENAME))
        .await
        .map_err(|err| format_err!("unable to read block index in {:?} - {}", dir, err))?;
    bucket
        .upload(&meta::index_name(id), Bytes::from(index_data))
        .await?;

    // precomputed header if present
    let header_path = dir.join(meta::INDEX_HEADER_FILENAME);
    if header_path.exists() {
        let data = tokio::fs::read(&header_path).await?;
        bucket
            .upload(&meta::index_header_name(id), Bytes::from(data))
            .await?;
    }

    // meta.json last makes the block visible
    bucket
        .upload(&meta::meta_name(id), Bytes::from(block_meta.encode()?))
        .await?;

    Ok(block_meta)
}

/// Read a block's meta from the bucket.
pub async fn read_meta(bucket: &dyn ObjectBucket, id: Ulid) -> Result<BlockMeta, Error> {
    let data = bucket.get(&meta::meta_name(id)).await?;
    BlockMeta::decode(&data)
}

/// Download meta, index and chunk segments of a block into `dest/<ulid>/`.
pub async fn download_block(
    bucket: &dyn ObjectBucket,
    id: Ulid,
    dest: &Path,
) -> Result<std::path::PathBuf, Error> {
    let dir = dest.join(id.to_string());
    let chunks_dir = dir.join(meta::CHUNKS_DIRNAME);
    tokio::fs::create_dir_all(&chunks_dir).await?;

    let children = bucket
        .iter(&format!("{}/{}", id, meta::CHUNKS_DIRNAME))
        .await?;
    for child in children {
        if child.ends_with('/') {
            continue;
        }
        let seg: u32 = match child.parse() {
            Ok(seg) => seg,
            Err(_) => continue,
        };
        let data = bucket.get(&meta::chunk_segment_name(id, seg)).await?;
        tokio::fs::write(chunks_dir.join(child), data).await?;
    }

    let index = bucket.get(&meta::index_name(id)).await?;
    tokio::fs::write(dir.join(meta::INDEX_FILENAME), index).await?;

    // local meta last, mirroring the upload visibility rule
    let meta_data = bucket.get(&meta::meta_name(id)).await?;
    tokio::fs::write(dir.join(meta::META_FILENAME), meta_data).await?;

    Ok(dir)
}

/// Write a deletion mark for the block unless one already exists.
pub async fn mark_for_deletion(
    bucket: &dyn ObjectBucket,
    id: Ulid,
    deletion_time: i64,
) -> Result<bool, Error> {
    let name = meta::deletion_mark_name(id);
    if bucket.exists(&name).await? {
        return Ok(false);
    }
    let mark = DeletionMark::new(id, deletion_time);
    bucket.upload(&name, Bytes::from(mark.encode()?)).await?;
    log::info!("block {} marked for deletion", id);
    Ok(true)
}

/// Read a block's deletion mark, `None` when the block is not marked.
pub async fn read_deletion_mark(
    bucket: &dyn ObjectBucket,
    id: Ulid,
) -> Result<Option<DeletionMark>, Error> {
    match bucket.get(&meta::deletion_mark_name(id)).await {
        Ok(data) => Ok(Some(DeletionMark::decode(&data)?)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Physically erase a block. The meta goes first so readers relying on
/// meta-visibility stop serving the block; the deletion mark goes last so a
/// crashed deletion is retried.
pub async fn delete_block(bucket: &dyn ObjectBucket, id: Ulid) -> Result<(), Error> {
    match bucket.delete(&meta::meta_name(id)).await {
        Ok(()) => {}
        Err(err) if err.is_not_found() => {}
        Err(err) => return Err(err.into()),
    }

    let prefix = id.to_string();
    let children = bucket.iter(&prefix).await?;
    for child in children {
        if child == meta::DELETION_MARK_FILENAME {
            continue;
        }
        let name = format!("{}/{}", prefix, child.trim_end_matches('/'));
        if child.ends_with('/') {
            objstore::delete_prefix(bucket, &name).await?;
        } else {
            match bucket.delete(&name).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    match bucket.delete(&meta::deletion_mark_name(id)).await {
        Ok(()) => {}
        Err(err) if err.is_not_found() => {}
        Err(err) => return Err(err.into()),
    }
    log::info!("block {} deleted from bucket", id);
    Ok(())
}

/// Parse a bucket root entry (`<ulid>/`) into a block id.
pub fn parse_block_entry(entry: &str) -> Option<Ulid> {
    entry.strip_suffix('/')?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::Labels;
    use crate::objstore::MemoryBucket;
    use crate::tsdb::block::{cut_chunks, write_block, BlockSeries};
    use meta::SourceType;

    fn write_local_block(dir: &Path) -> BlockMeta {
        let samples: Vec<(i64, f64)> = (0..100).map(|i| (i * 10, i as f64)).collect();
        let series = vec![BlockSeries {
            labels: Labels::from_pairs(vec![("a", "1")]).unwrap(),
            chunks: cut_chunks(&samples).unwrap(),
        }];
        let meta = BlockMeta::new_level1(
            crate::tsdb::block::new_block_id(7),
            0,
            1000,
            Labels::from_pairs(vec![("ext1", "value1")]).unwrap(),
            SourceType::Receiver,
        );
        write_block(dir, meta, series).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_upload_download_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let local = tmp.path().join("local");
        let meta = write_local_block(&local);

        let bucket = MemoryBucket::new("m");
        let uploaded = upload_block(&bucket, &local).await.unwrap();
        assert_eq!(uploaded.ulid, meta.ulid);

        let names = bucket.object_names();
        assert!(names.contains(&meta::meta_name(meta.ulid)));
        assert!(names.contains(&meta::index_name(meta.ulid)));
        assert!(names.contains(&meta::chunk_segment_name(meta.ulid, 1)));

        let fetched = read_meta(&bucket, meta.ulid).await.unwrap();
        assert_eq!(fetched, meta);

        let dest = tmp.path().join("dest");
        let dir = download_block(&bucket, meta.ulid, &dest).await.unwrap();
        let reader = crate::tsdb::BlockReader::open(&dir).unwrap();
        assert_eq!(reader.meta().ulid, meta.ulid);
        assert_eq!(reader.all_series_data().unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_upload_requires_labels() {
        let tmp = tempfile::tempdir().unwrap();
        let local = tmp.path().join("local");
        let mut meta = write_local_block(&local);
        meta.cairn.labels.clear();
        meta.write_to_dir(&local).unwrap();

        let bucket = MemoryBucket::new("m");
        assert!(upload_block(&bucket, &local).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_mark_and_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let local = tmp.path().join("local");
        let meta = write_local_block(&local);

        let bucket = MemoryBucket::new("m");
        upload_block(&bucket, &local).await.unwrap();

        assert!(read_deletion_mark(&bucket, meta.ulid).await.unwrap().is_none());
        assert!(mark_for_deletion(&bucket, meta.ulid, 1_000).await.unwrap());
        // idempotent
        assert!(!mark_for_deletion(&bucket, meta.ulid, 2_000).await.unwrap());

        let mark = read_deletion_mark(&bucket, meta.ulid).await.unwrap().unwrap();
        assert_eq!(mark.deletion_time, 1_000);

        delete_block(&bucket, meta.ulid).await.unwrap();
        assert!(bucket.object_names().is_empty());
    }

    #[test]
    fn test_parse_block_entry() {
        assert!(parse_block_entry("01ARZ3NDEKTSV4RRFFQ69G5FAV/").is_some());
        assert!(parse_block_entry("01ARZ3NDEKTSV4RRFFQ69G5FAV").is_none());
        assert!(parse_block_entry("debug/").is_none());
    }
}
