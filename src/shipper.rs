//! Ships sealed local blocks into the object store.
//!
//! Every tick the shipper scans its directory for block dirs, uploads
//! level-1 blocks the bucket does not hold yet (chunks, index, meta last)
//! and records uploaded ids in a small state file so restarts do not
//! re-upload. Failures are retried forever on subsequent ticks.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{format_err, Error};
use serde::{Deserialize, Serialize};
use ulid::Ulid;
use walkdir::WalkDir;

use crate::block::meta::{BlockMeta, META_FILENAME};
use crate::objstore::ObjectBucket;
use crate::tools;

pub const DEFAULT_SHIP_INTERVAL: Duration = Duration::from_secs(30);
pub const STATE_FILENAME: &str = "cairn.shipper.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct ShipperState {
    uploaded: Vec<Ulid>,
}

pub struct Shipper {
    bucket: std::sync::Arc<dyn ObjectBucket>,
    dir: PathBuf,
    uploaded: Mutex<HashSet<Ulid>>,
}

impl Shipper {
    pub fn new(bucket: std::sync::Arc<dyn ObjectBucket>, dir: PathBuf) -> Result<Self, Error> {
        let state_path = dir.join(STATE_FILENAME);
        let uploaded = match tools::file_get_optional_contents(&state_path)? {
            Some(data) => {
                let state: ShipperState = serde_json::from_slice(&data)
                    .map_err(|err| format_err!("corrupt shipper state {:?} - {}", state_path, err))?;
                state.uploaded.into_iter().collect()
            }
            None => HashSet::new(),
        };
        Ok(Self { bucket, dir, uploaded: Mutex::new(uploaded) })
    }

    fn persist_state(&self) -> Result<(), Error> {
        let mut uploaded: Vec<Ulid> = self.uploaded.lock().unwrap().iter().copied().collect();
        uploaded.sort();
        let state = ShipperState { uploaded };
        tools::file_set_contents(
            self.dir.join(STATE_FILENAME),
            &serde_json::to_vec_pretty(&state)?,
        )
    }

    /// Block directories below the shipper root: `<dir>/<ulid>/` and the
    /// per-tenant layout `<dir>/<tenant>/<ulid>/`.
    fn sealed_block_dirs(&self) -> Vec<(Ulid, PathBuf)> {
        let mut out = Vec::new();
        for entry in WalkDir::new(&self.dir)
            .min_depth(1)
            .max_depth(2)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_dir() {
                continue;
            }
            let id: Ulid = match entry.file_name().to_str().and_then(|n| n.parse().ok()) {
                Some(id) => id,
                None => continue,
            };
            // sealed means the local meta commit happened
            if entry.path().join(META_FILENAME).exists() {
                out.push((id, entry.path().to_owned()));
            }
        }
        out.sort();
        out
    }

    /// One shipping pass; returns the number of uploaded blocks.
    pub async fn ship_once(&self) -> Result<usize, Error> {
        let mut shipped = 0;
        for (id, dir) in self.sealed_block_dirs() {
            if self.uploaded.lock().unwrap().contains(&id) {
                continue;
            }

            let block_meta = match BlockMeta::read_from_dir(&dir) {
                Ok(meta) => meta,
                Err(err) => {
                    log::warn!("shipper: skipping {:?} - {}", dir, err);
                    continue;
                }
            };
            // only freshly sealed blocks travel; compacted ones are the
            // compactor's business
            if block_meta.compaction.level != 1 {
                continue;
            }

            let exists = self
                .bucket
                .exists(&crate::block::meta::meta_name(id))
                .await?;
            if !exists {
                crate::block::upload_block(self.bucket.as_ref(), &dir).await?;
                log::info!("shipper: uploaded block {}", id);
                shipped += 1;
            }

            self.uploaded.lock().unwrap().insert(id);
            self.persist_state()?;
        }
        Ok(shipped)
    }

    /// Shipping loop: tick every `interval`, retry forever on failure,
    /// stop on cancellation.
    pub async fn run(
        &self,
        interval: Duration,
        shutdown: tokio_util::sync::CancellationToken,
    ) {
        let mut backoff = interval;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            match self.ship_once().await {
                Ok(_) => backoff = interval,
                Err(err) => {
                    log::warn!("shipper: pass failed - {}", err);
                    // simple bounded backoff
                    backoff = (backoff * 2).min(Duration::from_secs(300));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::Labels;
    use crate::objstore::MemoryBucket;
    use crate::tsdb::block::{cut_chunks, write_block, BlockSeries};
    use std::sync::Arc;

    fn seal_block(parent: &Path, level: u32) -> BlockMeta {
        let ulid = crate::tsdb::block::new_block_id(rand::random::<u16>() as u64);
        let mut meta = BlockMeta::new_level1(
            ulid,
            0,
            1000,
            Labels::from_pairs(vec![("tenant_id", "t1")]).unwrap(),
            crate::block::meta::SourceType::Receiver,
        );
        meta.compaction.level = level;
        let series = vec![BlockSeries {
            labels: Labels::from_pairs(vec![("a", "1")]).unwrap(),
            chunks: cut_chunks(&[(0, 1.0)]).unwrap(),
        }];
        write_block(&parent.join(ulid.to_string()), meta, series).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ships_level1_blocks_once() {
        let tmp = tempfile::tempdir().unwrap();
        let bucket = Arc::new(MemoryBucket::new("m"));

        let meta = seal_block(tmp.path(), 1);
        seal_block(tmp.path(), 2); // not the shipper's business

        let shipper = Shipper::new(bucket.clone(), tmp.path().to_owned()).unwrap();
        assert_eq!(shipper.ship_once().await.unwrap(), 1);
        assert!(bucket
            .exists(&crate::block::meta::meta_name(meta.ulid))
            .await
            .unwrap());

        // second pass is a no-op
        assert_eq!(shipper.ship_once().await.unwrap(), 0);
        let uploads = bucket.counters.upload.load(std::sync::atomic::Ordering::Relaxed);
        shipper.ship_once().await.unwrap();
        assert_eq!(
            bucket.counters.upload.load(std::sync::atomic::Ordering::Relaxed),
            uploads
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_state_survives_restart() {
        let tmp = tempfile::tempdir().unwrap();
        let bucket = Arc::new(MemoryBucket::new("m"));
        seal_block(tmp.path(), 1);

        let shipper = Shipper::new(bucket.clone(), tmp.path().to_owned()).unwrap();
        assert_eq!(shipper.ship_once().await.unwrap(), 1);
        drop(shipper);

        let restarted = Shipper::new(bucket.clone(), tmp.path().to_owned()).unwrap();
        assert_eq!(restarted.ship_once().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ships_tenant_subdirectories() {
        let tmp = tempfile::tempdir().unwrap();
        let bucket = Arc::new(MemoryBucket::new("m"));

        let tenant_dir = tmp.path().join("tenant-a");
        std::fs::create_dir_all(&tenant_dir).unwrap();
        let meta = seal_block(&tenant_dir, 1);

        let shipper = Shipper::new(bucket.clone(), tmp.path().to_owned()).unwrap();
        assert_eq!(shipper.ship_once().await.unwrap(), 1);
        assert!(bucket
            .exists(&crate::block::meta::meta_name(meta.ulid))
            .await
            .unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_skips_blocks_already_in_bucket() {
        let tmp = tempfile::tempdir().unwrap();
        let bucket = Arc::new(MemoryBucket::new("m"));

        let meta = seal_block(tmp.path(), 1);
        // block already present remotely (another replica shipped it)
        crate::block::upload_block(bucket.as_ref(), &tmp.path().join(meta.ulid.to_string()))
            .await
            .unwrap();
        let uploads = bucket.counters.upload.load(std::sync::atomic::Ordering::Relaxed);

        let shipper = Shipper::new(bucket.clone(), tmp.path().to_owned()).unwrap();
        assert_eq!(shipper.ship_once().await.unwrap(), 0);
        assert_eq!(
            bucket.counters.upload.load(std::sync::atomic::Ordering::Relaxed),
            uploads
        );
    }
}
