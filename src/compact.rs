//! The compactor: meta sync, garbage collection, group planning,
//! compaction, downsampling and retention.
//!
//! One iteration runs sync -> GC -> plan -> compact -> downsample ->
//! retention. Groups (same external labels and resolution) are processed by
//! a bounded worker pool; a group is single-writer. A halt condition
//! (overlap without vertical compaction, critical index defect) stops the
//! loop until an operator intervenes; the halted flag stays visible.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{format_err, Error};
use futures::stream::{self, StreamExt};
use ulid::Ulid;

use crate::block::fetcher::{DeduplicationFilter, DeletionMarkFilter, MetaFetcher, MetaMap};
use crate::block::meta::{BlockMeta, RES_1H, RES_5M, RES_RAW};
use crate::block::repair;
use crate::objstore::ObjectBucket;
use crate::tsdb::{merge, Planner};

pub mod downsample;

/// Why a compaction iteration stopped.
#[derive(Debug, thiserror::Error)]
pub enum CompactError {
    /// unrecoverable state; the loop suspends until an operator intervenes
    #[error("compaction halted: {0}")]
    Halt(String),
    /// transient; retried on the next tick
    #[error(transparent)]
    Retry(#[from] Error),
}

pub struct CompactorConfig {
    pub work_dir: PathBuf,
    /// grace between deletion mark and physical deletion
    pub deletion_delay: Duration,
    /// merge overlapping blocks instead of halting
    pub enable_vertical_compaction: bool,
    /// tolerate non-critical index defects instead of halting
    pub accept_malformed_index: bool,
    /// worker pool size for group compaction
    pub concurrency: usize,
    /// raw blocks older than this get a 5m counterpart
    pub downsample_raw_age: Duration,
    /// 5m blocks older than this get a 1h counterpart
    pub downsample_5m_age: Duration,
    /// per-resolution retention; zero means keep forever
    pub retention_raw: Duration,
    pub retention_5m: Duration,
    pub retention_1h: Duration,
}

impl CompactorConfig {
    pub fn new(work_dir: PathBuf) -> Self {
        Self {
            work_dir,
            deletion_delay: Duration::from_secs(48 * 3600),
            enable_vertical_compaction: false,
            accept_malformed_index: false,
            concurrency: 1,
            downsample_raw_age: Duration::from_secs(40 * 3600),
            downsample_5m_age: Duration::from_secs(10 * 24 * 3600),
            retention_raw: Duration::from_secs(0),
            retention_5m: Duration::from_secs(0),
            retention_1h: Duration::from_secs(0),
        }
    }
}

#[derive(Debug, Default)]
pub struct CompactorMetrics {
    pub iterations: AtomicU64,
    pub halted: AtomicBool,
    pub groups_compacted: AtomicU64,
    pub blocks_marked: AtomicU64,
    pub blocks_deleted: AtomicU64,
    pub blocks_downsampled: AtomicU64,
    pub blocks_repaired: AtomicU64,
}

/// Blocks sharing `(external labels, resolution)`; the unit of compaction.
struct Group {
    key: String,
    metas: Vec<Arc<BlockMeta>>,
}

fn group_key(meta: &BlockMeta) -> String {
    format!("{}@{}", meta.resolution(), meta.external_labels().stable_hash())
}

fn group_blocks(metas: &MetaMap) -> Vec<Group> {
    let mut groups: HashMap<String, Group> = HashMap::new();
    for meta in metas.values() {
        let key = group_key(meta);
        groups
            .entry(key.clone())
            .or_insert_with(|| Group { key, metas: Vec::new() })
            .metas
            .push(Arc::clone(meta));
    }
    let mut out: Vec<Group> = groups.into_iter().map(|(_, g)| g).collect();
    out.sort_by(|a, b| a.key.cmp(&b.key));
    out
}

enum GroupOutcome {
    Nothing,
    Compacted(Ulid),
    RepairRequired(Ulid),
}

pub struct Compactor {
    bucket: Arc<dyn ObjectBucket>,
    fetcher: MetaFetcher,
    dedup_filter: Arc<DeduplicationFilter>,
    deletion_filter: Arc<DeletionMarkFilter>,
    planner: Planner,
    config: CompactorConfig,
    pub metrics: CompactorMetrics,
}

struct ArcFilter<F>(Arc<F>);

impl<F: crate::block::fetcher::MetaFilter> crate::block::fetcher::MetaFilter for ArcFilter<F> {
    fn name(&self) -> &'static str {
        self.0.name()
    }

    fn filter<'a>(
        &'a self,
        metas: &'a mut MetaMap,
    ) -> futures::future::BoxFuture<'a, Result<(), Error>> {
        self.0.filter(metas)
    }
}

impl Compactor {
    pub fn new(bucket: Arc<dyn ObjectBucket>, config: CompactorConfig) -> Self {
        let dedup_filter = Arc::new(DeduplicationFilter::new());
        let deletion_filter = Arc::new(DeletionMarkFilter::new(
            Arc::clone(&bucket),
            config.deletion_delay,
        ));
        let fetcher = MetaFetcher::new(
            Arc::clone(&bucket),
            vec![
                Box::new(ArcFilter(Arc::clone(&deletion_filter))),
                Box::new(ArcFilter(Arc::clone(&dedup_filter))),
            ],
        );
        Self {
            bucket,
            fetcher,
            dedup_filter,
            deletion_filter,
            planner: Planner::default(),
            config,
            metrics: CompactorMetrics::default(),
        }
    }

    pub fn halted(&self) -> bool {
        self.metrics.halted.load(Ordering::Relaxed)
    }

    /// Clear a halt after operator intervention.
    pub fn resume(&self) {
        self.metrics.halted.store(false, Ordering::Relaxed);
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// One full iteration. Transient errors bubble up as `Retry`; the
    /// caller keeps ticking. A `Halt` freezes the loop.
    pub async fn run_once(&self) -> Result<(), CompactError> {
        if self.halted() {
            return Err(CompactError::Halt("compactor is halted".to_string()));
        }

        let result = self.iterate().await;
        if let Err(CompactError::Halt(reason)) = &result {
            self.metrics.halted.store(true, Ordering::Relaxed);
            log::error!("compactor halted: {}", reason);
        }
        result
    }

    async fn iterate(&self) -> Result<(), CompactError> {
        self.metrics.iterations.fetch_add(1, Ordering::Relaxed);

        let (metas, partial) = self.fetcher.fetch().await.map_err(CompactError::Retry)?;
        if !partial.is_empty() {
            log::warn!("compactor sync: {} partial blocks skipped", partial.len());
        }

        self.garbage_collect().await?;
        self.apply_retention(&metas).await?;
        self.delete_expired_marks().await?;

        // compact groups through the worker pool, one group single-writer
        let groups = group_blocks(&metas);
        let outcomes: Vec<(String, Result<GroupOutcome, CompactError>)> =
            stream::iter(groups.into_iter().map(|group| async move {
                let key = group.key.clone();
                let outcome = self.process_group(&group).await;
                (key, outcome)
            }))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let mut repairs = Vec::new();
        for (key, outcome) in outcomes {
            match outcome {
                Ok(GroupOutcome::Nothing) => {}
                Ok(GroupOutcome::Compacted(id)) => {
                    self.metrics.groups_compacted.fetch_add(1, Ordering::Relaxed);
                    log::info!("group {}: compacted into {}", key, id);
                }
                Ok(GroupOutcome::RepairRequired(id)) => repairs.push(id),
                Err(CompactError::Halt(reason)) => {
                    return Err(CompactError::Halt(format!("group {}: {}", key, reason)))
                }
                Err(CompactError::Retry(err)) => {
                    // this group retries next tick, others were unaffected
                    log::warn!("group {}: compaction failed - {}", key, err);
                }
            }
        }

        for id in repairs {
            self.repair_block(id).await?;
        }

        self.downsample_pass(&metas).await?;
        Ok(())
    }

    /// Mark blocks subsumed by the dedup filter for deletion.
    async fn garbage_collect(&self) -> Result<(), CompactError> {
        let now = (Self::now_ms() / 1000) as i64;
        for id in self.dedup_filter.duplicates() {
            if crate::block::mark_for_deletion(self.bucket.as_ref(), id, now)
                .await
                .map_err(CompactError::Retry)?
            {
                self.metrics.blocks_marked.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    async fn apply_retention(&self, metas: &MetaMap) -> Result<(), CompactError> {
        let now_ms = Self::now_ms() as i64;
        let now = now_ms / 1000;
        for meta in metas.values() {
            let ttl = match meta.resolution() {
                RES_RAW => self.config.retention_raw,
                RES_5M => self.config.retention_5m,
                RES_1H => self.config.retention_1h,
                _ => Duration::from_secs(0),
            };
            if ttl.as_secs() == 0 {
                continue;
            }
            if now_ms - meta.max_time > ttl.as_millis() as i64 {
                if crate::block::mark_for_deletion(self.bucket.as_ref(), meta.ulid, now)
                    .await
                    .map_err(CompactError::Retry)?
                {
                    self.metrics.blocks_marked.fetch_add(1, Ordering::Relaxed);
                    log::info!("block {}: retention expired", meta.ulid);
                }
            }
        }
        Ok(())
    }

    /// Physically delete marked blocks whose grace elapsed. The deletion
    /// filter already hides them from the fetched view.
    async fn delete_expired_marks(&self) -> Result<(), CompactError> {
        let now = (Self::now_ms() / 1000) as i64;
        let grace = self.config.deletion_delay.as_secs() as i64;
        for (id, mark) in self.deletion_filter.deletion_marks() {
            if now - mark.deletion_time > grace {
                crate::block::delete_block(self.bucket.as_ref(), id)
                    .await
                    .map_err(CompactError::Retry)?;
                self.metrics.blocks_deleted.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    async fn process_group(&self, group: &Group) -> Result<GroupOutcome, CompactError> {
        // overlap detection comes first: without vertical compaction it is
        // a halt condition, with it the overlapping set is the plan
        let mut sorted: Vec<&Arc<BlockMeta>> = group.metas.iter().collect();
        sorted.sort_by_key(|m| (m.min_time, m.ulid));
        let mut overlapping: Vec<Ulid> = Vec::new();
        for pair in sorted.windows(2) {
            if pair[1].min_time < pair[0].max_time {
                if !overlapping.contains(&pair[0].ulid) {
                    overlapping.push(pair[0].ulid);
                }
                overlapping.push(pair[1].ulid);
            }
        }

        let plan: Vec<Ulid> = if !overlapping.is_empty() {
            if !self.config.enable_vertical_compaction {
                return Err(CompactError::Halt(format!(
                    "blocks {:?} overlap and vertical compaction is disabled",
                    overlapping
                )));
            }
            overlapping
        } else {
            let metas: Vec<BlockMeta> = group.metas.iter().map(|m| (**m).clone()).collect();
            self.planner.plan(&metas)
        };

        if plan.len() < 2 {
            return Ok(GroupOutcome::Nothing);
        }
        log::info!("group {}: compacting {} blocks", group.key, plan.len());

        // clean group work dir
        let group_dir = self.config.work_dir.join(&group.key);
        if group_dir.exists() {
            std::fs::remove_dir_all(&group_dir)
                .map_err(|err| CompactError::Retry(format_err!("clean {:?} - {}", group_dir, err)))?;
        }
        std::fs::create_dir_all(&group_dir)
            .map_err(|err| CompactError::Retry(format_err!("create {:?} - {}", group_dir, err)))?;

        // download and inspect the sources
        let mut source_dirs = Vec::with_capacity(plan.len());
        for id in &plan {
            let dir = crate::block::download_block(self.bucket.as_ref(), *id, &group_dir)
                .await
                .map_err(CompactError::Retry)?;

            let stats = crate::tools::runtime::block_in_place(|| repair::gather_index_issues(&dir))
                .map_err(CompactError::Retry)?;
            if stats.repairable() {
                log::warn!("block {}: repairable defect ({})", id, stats);
                return Ok(GroupOutcome::RepairRequired(*id));
            }
            if stats.critical() {
                if self.config.accept_malformed_index
                    && stats.complete_outside_chunks == 0
                    && stats.corrupted_chunks == 0
                {
                    log::warn!("block {}: accepting malformed index ({})", id, stats);
                } else {
                    return Err(CompactError::Halt(format!(
                        "block {} has critical index defects: {}",
                        id, stats
                    )));
                }
            }
            source_dirs.push(dir);
        }

        // merge; an empty result still supersedes the sources
        let compacted = crate::tools::runtime::block_in_place(|| {
            merge::compact_blocks(&group_dir, &source_dirs, Self::now_ms())
        })
        .map_err(CompactError::Retry)?;

        let now = (Self::now_ms() / 1000) as i64;
        let new_id = match compacted {
            None => {
                log::info!("group {}: compaction produced no samples", group.key);
                for id in &plan {
                    crate::block::mark_for_deletion(self.bucket.as_ref(), *id, now)
                        .await
                        .map_err(CompactError::Retry)?;
                }
                let _ = std::fs::remove_dir_all(&group_dir);
                return Ok(GroupOutcome::Nothing);
            }
            Some((new_dir, new_meta)) => {
                crate::tools::runtime::block_in_place(|| {
                    repair::verify_block(&new_dir)?;
                    // precompute the header so the gateway never has to
                    let index = crate::tsdb::index::IndexReader::open_file(
                        &new_dir.join(crate::block::meta::INDEX_FILENAME),
                    )?;
                    let header = crate::block::index_header::IndexHeader::from_index_reader(&index);
                    crate::tools::file_set_contents(
                        new_dir.join(crate::block::meta::INDEX_HEADER_FILENAME),
                        &header.encode(),
                    )
                })
                .map_err(CompactError::Retry)?;

                crate::block::upload_block(self.bucket.as_ref(), &new_dir)
                    .await
                    .map_err(CompactError::Retry)?;
                new_meta.ulid
            }
        };

        for id in &plan {
            crate::block::mark_for_deletion(self.bucket.as_ref(), *id, now)
                .await
                .map_err(CompactError::Retry)?;
            self.metrics.blocks_marked.fetch_add(1, Ordering::Relaxed);
        }
        let _ = std::fs::remove_dir_all(&group_dir);
        Ok(GroupOutcome::Compacted(new_id))
    }

    async fn repair_block(&self, id: Ulid) -> Result<(), CompactError> {
        let repair_dir = self.config.work_dir.join("repair");
        if repair_dir.exists() {
            let _ = std::fs::remove_dir_all(&repair_dir);
        }
        std::fs::create_dir_all(&repair_dir)
            .map_err(|err| CompactError::Retry(format_err!("create {:?} - {}", repair_dir, err)))?;

        let src = crate::block::download_block(self.bucket.as_ref(), id, &repair_dir)
            .await
            .map_err(CompactError::Retry)?;
        let (new_dir, new_meta) = crate::tools::runtime::block_in_place(|| {
            repair::repair_out_of_bounds(&src, &repair_dir, Self::now_ms())
        })
        .map_err(CompactError::Retry)?;

        crate::block::upload_block(self.bucket.as_ref(), &new_dir)
            .await
            .map_err(CompactError::Retry)?;
        crate::block::mark_for_deletion(
            self.bucket.as_ref(),
            id,
            (Self::now_ms() / 1000) as i64,
        )
        .await
        .map_err(CompactError::Retry)?;

        self.metrics.blocks_repaired.fetch_add(1, Ordering::Relaxed);
        log::info!("block {}: repaired into {}", id, new_meta.ulid);
        let _ = std::fs::remove_dir_all(&repair_dir);
        Ok(())
    }

    /// Produce missing 5m and 1h counterparts for aged blocks.
    async fn downsample_pass(&self, metas: &MetaMap) -> Result<(), CompactError> {
        let now_ms = Self::now_ms() as i64;

        for meta in metas.values() {
            let (age_gate, target) = match meta.resolution() {
                RES_RAW => (self.config.downsample_raw_age, RES_5M),
                RES_5M => (self.config.downsample_5m_age, RES_1H),
                _ => continue,
            };
            if now_ms - meta.max_time < age_gate.as_millis() as i64 {
                continue;
            }
            // skip when a counterpart already exists
            let done = metas.values().any(|other| {
                other.resolution() == target
                    && other.cairn.labels == meta.cairn.labels
                    && other.compaction.parents.contains(&meta.ulid)
            });
            if done {
                continue;
            }

            let ds_dir = self.config.work_dir.join("downsample");
            if ds_dir.exists() {
                let _ = std::fs::remove_dir_all(&ds_dir);
            }
            std::fs::create_dir_all(&ds_dir)
                .map_err(|err| CompactError::Retry(format_err!("create {:?} - {}", ds_dir, err)))?;

            let src = crate::block::download_block(self.bucket.as_ref(), meta.ulid, &ds_dir)
                .await
                .map_err(CompactError::Retry)?;
            let result = crate::tools::runtime::block_in_place(|| {
                downsample::downsample_block(&src, &ds_dir, Self::now_ms())
            })
            .map_err(CompactError::Retry)?;

            if let Some((new_dir, new_meta)) = result {
                crate::block::upload_block(self.bucket.as_ref(), &new_dir)
                    .await
                    .map_err(CompactError::Retry)?;
                self.metrics.blocks_downsampled.fetch_add(1, Ordering::Relaxed);
                log::info!(
                    "block {}: downsampled to {} at {}",
                    meta.ulid,
                    new_meta.ulid,
                    target
                );
            }
            let _ = std::fs::remove_dir_all(&ds_dir);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::meta::SourceType;
    use crate::labels::Labels;
    use crate::objstore::MemoryBucket;
    use crate::tsdb::block::{cut_chunks, write_block, BlockSeries};

    const HOUR: i64 = 3_600_000;

    fn config(dir: &std::path::Path) -> CompactorConfig {
        let mut config = CompactorConfig::new(dir.to_owned());
        config.deletion_delay = Duration::from_secs(0);
        config
    }

    async fn upload_block(
        bucket: &MemoryBucket,
        min: i64,
        max: i64,
        samples: Vec<(i64, f64)>,
    ) -> BlockMeta {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("blk");
        let meta = BlockMeta::new_level1(
            crate::tsdb::block::new_block_id(min.max(0) as u64 + 1),
            min,
            max,
            Labels::from_pairs(vec![("replica", "a")]).unwrap(),
            SourceType::Receiver,
        );
        let series = vec![BlockSeries {
            labels: Labels::from_pairs(vec![("job", "x")]).unwrap(),
            chunks: cut_chunks(&samples).unwrap(),
        }];
        let meta = write_block(&dir, meta, series).unwrap();
        crate::block::upload_block(bucket, &dir).await.unwrap();
        meta
    }

    fn block_ids(bucket: &MemoryBucket) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = bucket
            .object_names()
            .iter()
            .filter(|n| n.ends_with("/meta.json"))
            .filter_map(|n| n.split('/').next().unwrap().parse().ok())
            .collect();
        ids.sort();
        ids
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_compacts_filled_window() {
        let bucket = Arc::new(MemoryBucket::new("m"));
        // three 2h blocks filling [0, 6h) plus a newer guard block
        let a = upload_block(&bucket, 0, 2 * HOUR, vec![(0, 1.0), (HOUR, 2.0)]).await;
        let b = upload_block(&bucket, 2 * HOUR, 4 * HOUR, vec![(2 * HOUR, 3.0)]).await;
        let c = upload_block(&bucket, 4 * HOUR, 6 * HOUR, vec![(4 * HOUR, 4.0)]).await;
        upload_block(&bucket, 6 * HOUR, 8 * HOUR, vec![(6 * HOUR, 5.0)]).await;

        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = config(tmp.path());
        // keep marked blocks around so the assertion can inspect them
        cfg.deletion_delay = Duration::from_secs(3600);
        let compactor = Compactor::new(bucket.clone(), cfg);

        compactor.run_once().await.unwrap();
        assert_eq!(compactor.metrics.groups_compacted.load(Ordering::Relaxed), 1);

        // sources are marked, not deleted
        for id in [a.ulid, b.ulid, c.ulid] {
            assert!(crate::block::read_deletion_mark(bucket.as_ref(), id)
                .await
                .unwrap()
                .is_some());
        }

        // the compacted block carries the full source lineage
        let mut compacted = None;
        for id in block_ids(&bucket) {
            let meta = crate::block::read_meta(bucket.as_ref(), id).await.unwrap();
            if meta.compaction.level == 2 {
                compacted = Some(meta);
            }
        }
        let compacted = compacted.expect("compacted block present");

        assert_eq!(compacted.min_time, 0);
        assert_eq!(compacted.max_time, 6 * HOUR);
        for id in [a.ulid, b.ulid, c.ulid] {
            assert!(compacted.compaction.sources.contains(&id));
        }
        assert_eq!(compacted.cairn.source, SourceType::Compactor);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_overlap_without_vertical_halts() {
        let bucket = Arc::new(MemoryBucket::new("m"));
        upload_block(&bucket, 0, 2 * HOUR, vec![(0, 1.0)]).await;
        upload_block(&bucket, HOUR, 3 * HOUR, vec![(HOUR, 2.0)]).await;

        let tmp = tempfile::tempdir().unwrap();
        let compactor = Compactor::new(bucket, config(tmp.path()));

        match compactor.run_once().await {
            Err(CompactError::Halt(_)) => {}
            other => panic!("expected halt, got {:?}", other.is_ok()),
        }
        assert!(compactor.halted());

        // the loop stays frozen until resumed
        assert!(matches!(compactor.run_once().await, Err(CompactError::Halt(_))));
        let iterations = compactor.metrics.iterations.load(Ordering::Relaxed);
        let _ = compactor.run_once().await;
        assert_eq!(compactor.metrics.iterations.load(Ordering::Relaxed), iterations);

        compactor.resume();
        assert!(!compactor.halted());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_vertical_compaction_merges_overlap() {
        let bucket = Arc::new(MemoryBucket::new("m"));
        upload_block(&bucket, 0, 2 * HOUR, vec![(0, 1.0), (HOUR, 2.0)]).await;
        upload_block(&bucket, HOUR, 3 * HOUR, vec![(HOUR, 99.0), (2 * HOUR, 3.0)]).await;

        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = config(tmp.path());
        cfg.enable_vertical_compaction = true;
        cfg.deletion_delay = Duration::from_secs(3600);
        let compactor = Compactor::new(bucket.clone(), cfg);

        compactor.run_once().await.unwrap();
        assert_eq!(compactor.metrics.groups_compacted.load(Ordering::Relaxed), 1);
        assert!(!compactor.halted());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_gc_deletes_after_grace() {
        let bucket = Arc::new(MemoryBucket::new("m"));
        let meta = upload_block(&bucket, 0, 2 * HOUR, vec![(0, 1.0)]).await;
        // marked in the distant past
        crate::block::mark_for_deletion(bucket.as_ref(), meta.ulid, 1000).await.unwrap();

        let tmp = tempfile::tempdir().unwrap();
        let compactor = Compactor::new(bucket.clone(), config(tmp.path()));
        compactor.run_once().await.unwrap();

        assert_eq!(compactor.metrics.blocks_deleted.load(Ordering::Relaxed), 1);
        assert!(block_ids(&bucket).is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dedup_duplicate_gets_marked() {
        let bucket = Arc::new(MemoryBucket::new("m"));
        let a = upload_block(&bucket, 0, 2 * HOUR, vec![(0, 1.0)]).await;

        // a level-2 block subsuming a's sources
        let tmp_block = tempfile::tempdir().unwrap();
        let dir = tmp_block.path().join("blk");
        let mut meta = BlockMeta::new_level1(
            crate::tsdb::block::new_block_id(500),
            0,
            2 * HOUR,
            Labels::from_pairs(vec![("replica", "a")]).unwrap(),
            SourceType::Compactor,
        );
        meta.compaction.level = 2;
        meta.compaction.sources = vec![a.ulid, crate::tsdb::block::new_block_id(900)];
        let series = vec![BlockSeries {
            labels: Labels::from_pairs(vec![("job", "x")]).unwrap(),
            chunks: cut_chunks(&[(0, 1.0)]).unwrap(),
        }];
        let b = write_block(&dir, meta, series).unwrap();
        crate::block::upload_block(bucket.as_ref(), &dir).await.unwrap();

        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = config(tmp.path());
        cfg.deletion_delay = Duration::from_secs(3600);
        let compactor = Compactor::new(bucket.clone(), cfg);
        compactor.run_once().await.unwrap();

        assert!(crate::block::read_deletion_mark(bucket.as_ref(), a.ulid)
            .await
            .unwrap()
            .is_some());
        assert!(crate::block::read_deletion_mark(bucket.as_ref(), b.ulid)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_downsample_pass_creates_5m_block() {
        let bucket = Arc::new(MemoryBucket::new("m"));
        // an old block, far past the downsample age
        let samples: Vec<(i64, f64)> = (0..600).map(|i| (i * 10_000, i as f64)).collect();
        upload_block(&bucket, 0, 2 * HOUR, samples).await;

        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = config(tmp.path());
        cfg.downsample_raw_age = Duration::from_secs(0);
        // keep the produced 5m block out of the 1h pass
        cfg.downsample_5m_age = Duration::from_secs(u32::MAX as u64);
        let compactor = Compactor::new(bucket.clone(), cfg);

        compactor.run_once().await.unwrap();
        assert_eq!(compactor.metrics.blocks_downsampled.load(Ordering::Relaxed), 1);

        let mut found = false;
        for id in block_ids(&bucket) {
            let meta = crate::block::read_meta(bucket.as_ref(), id).await.unwrap();
            if meta.resolution() == RES_5M {
                found = true;
                assert_eq!(meta.min_time, 0);
                assert_eq!(meta.max_time, 2 * HOUR);
            }
        }
        assert!(found);

        // idempotent: the counterpart exists now
        compactor.run_once().await.unwrap();
        assert_eq!(compactor.metrics.blocks_downsampled.load(Ordering::Relaxed), 1);
    }
}
