//! Index issue detection and block repair.
//!
//! Before compacting a group the compactor inspects every source block.
//! Most defects are critical and halt the group; the known out-of-bounds
//! chunk defect (chunks sticking slightly past the block's time range, as
//! produced by old ingesters) is repairable: the block is rewritten with
//! the offending samples clamped and the original is marked for deletion.

use std::path::{Path, PathBuf};

use anyhow::{bail, Error};

use crate::block::meta::{BlockMeta, SourceType};
use crate::tsdb::block::{self, BlockReader, BlockSeries};
use crate::tsdb::chunkenc;

/// Defect counts of one block's index and chunks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IndexIssueStats {
    /// series records not in ascending label order
    pub out_of_order_series: u64,
    /// chunk list of a series not ordered / overlapping
    pub out_of_order_chunks: u64,
    /// chunks entirely outside the block's time range
    pub complete_outside_chunks: u64,
    /// chunks overlapping the range but sticking out of it
    pub out_of_bounds_chunks: u64,
    /// chunk payloads failing decode or checksum
    pub corrupted_chunks: u64,
}

impl IndexIssueStats {
    /// Defects that make the block unusable; compaction must halt.
    pub fn critical(&self) -> bool {
        self.out_of_order_series > 0
            || self.out_of_order_chunks > 0
            || self.complete_outside_chunks > 0
            || self.corrupted_chunks > 0
    }

    /// The known repairable defect, absent critical ones.
    pub fn repairable(&self) -> bool {
        !self.critical() && self.out_of_bounds_chunks > 0
    }

    pub fn healthy(&self) -> bool {
        *self == IndexIssueStats::default()
    }
}

impl std::fmt::Display for IndexIssueStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "out-of-order series: {}, out-of-order chunks: {}, outside chunks: {}, out-of-bounds chunks: {}, corrupted chunks: {}",
            self.out_of_order_series,
            self.out_of_order_chunks,
            self.complete_outside_chunks,
            self.out_of_bounds_chunks,
            self.corrupted_chunks
        )
    }
}

/// Inspect a local block directory.
pub fn gather_index_issues(dir: &Path) -> Result<IndexIssueStats, Error> {
    let reader = BlockReader::open(dir)?;
    let meta = reader.meta();
    let mut stats = IndexIssueStats::default();

    let all = reader.index().all_series()?;
    for window in all.windows(2) {
        if window[0].labels >= window[1].labels {
            stats.out_of_order_series += 1;
        }
    }

    for series in &all {
        for window in series.chunks.windows(2) {
            if window[1].min_time <= window[0].max_time {
                stats.out_of_order_chunks += 1;
            }
        }
        for chunk_meta in &series.chunks {
            if chunk_meta.min_time > chunk_meta.max_time {
                stats.out_of_order_chunks += 1;
                continue;
            }
            if chunk_meta.max_time < meta.min_time || chunk_meta.min_time >= meta.max_time {
                stats.complete_outside_chunks += 1;
            } else if chunk_meta.min_time < meta.min_time || chunk_meta.max_time >= meta.max_time {
                stats.out_of_bounds_chunks += 1;
            }

            if reader.chunk(chunk_meta).is_err() {
                stats.corrupted_chunks += 1;
            }
        }
    }

    Ok(stats)
}

/// Fail unless the block is defect free. Run on every freshly produced
/// block before upload.
pub fn verify_block(dir: &Path) -> Result<(), Error> {
    let stats = gather_index_issues(dir)?;
    if !stats.healthy() {
        bail!("block {:?} failed verification: {}", dir, stats);
    }
    Ok(())
}

/// Rewrite a block with out-of-bounds samples dropped. The repaired block
/// gets a fresh ulid, keeps the original's compaction sources and records
/// the original as parent. The caller uploads it and marks the original
/// for deletion.
pub fn repair_out_of_bounds(
    src_dir: &Path,
    dest_parent: &Path,
    wall_clock_ms: u64,
) -> Result<(PathBuf, BlockMeta), Error> {
    let reader = BlockReader::open(src_dir)?;
    let src_meta = reader.meta().clone();
    let (min_time, max_time) = (src_meta.min_time, src_meta.max_time);

    let mut repaired = Vec::new();
    for series in reader.all_series_data()? {
        let mut chunks = Vec::with_capacity(series.chunks.len());
        for data in series.chunks {
            if data.min_time >= min_time && data.max_time < max_time {
                chunks.push(data);
                continue;
            }
            // clamp by re-encoding only the in-range samples
            let samples: Vec<(i64, f64)> = chunkenc::decode_all(&data.chunk)?
                .into_iter()
                .filter(|&(t, _)| t >= min_time && t < max_time)
                .collect();
            chunks.extend(block::cut_chunks(&samples)?);
        }
        if !chunks.is_empty() {
            repaired.push(BlockSeries { labels: series.labels, chunks });
        }
    }

    let ulid = block::new_block_id(wall_clock_ms);
    let mut meta = src_meta.clone();
    meta.ulid = ulid;
    meta.stats = Default::default();
    meta.compaction.parents = vec![src_meta.ulid];
    meta.cairn.source = SourceType::BucketRepair;

    let dir = dest_parent.join(ulid.to_string());
    let meta = block::write_block(&dir, meta, repaired)?;
    verify_block(&dir)?;

    log::info!(
        "repaired block {} into {} ({} series)",
        src_meta.ulid,
        meta.ulid,
        meta.stats.num_series
    );
    Ok((dir, meta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::Labels;
    use crate::tsdb::block::{cut_chunks, write_block};
    use crate::tsdb::index::ChunkMeta;

    fn labels(job: &str) -> Labels {
        Labels::from_pairs(vec![("job", job)]).unwrap()
    }

    fn healthy_block(dir: &Path) -> BlockMeta {
        let meta = BlockMeta::new_level1(
            block::new_block_id(1),
            0,
            1000,
            Labels::from_pairs(vec![("r", "1")]).unwrap(),
            SourceType::Receiver,
        );
        let series = vec![BlockSeries {
            labels: labels("a"),
            chunks: cut_chunks(&[(0, 1.0), (500, 2.0)]).unwrap(),
        }];
        write_block(dir, meta, series).unwrap()
    }

    fn block_with_chunk_bounds(dir: &Path, chunk_min: i64, chunk_max: i64) -> BlockMeta {
        let meta = BlockMeta::new_level1(
            block::new_block_id(1),
            0,
            1000,
            Labels::from_pairs(vec![("r", "1")]).unwrap(),
            SourceType::Receiver,
        );
        let samples: Vec<(i64, f64)> = vec![(chunk_min, 1.0), (chunk_max, 2.0)];
        let series = vec![BlockSeries { labels: labels("a"), chunks: cut_chunks(&samples).unwrap() }];
        write_block(dir, meta, series).unwrap()
    }

    #[test]
    fn test_healthy_block_verifies() {
        let tmp = tempfile::tempdir().unwrap();
        healthy_block(tmp.path());
        let stats = gather_index_issues(tmp.path()).unwrap();
        assert!(stats.healthy());
        verify_block(tmp.path()).unwrap();
    }

    #[test]
    fn test_out_of_bounds_detected_as_repairable() {
        let tmp = tempfile::tempdir().unwrap();
        // chunk [500, 1200] sticks past max_time 1000
        block_with_chunk_bounds(tmp.path(), 500, 1200);

        let stats = gather_index_issues(tmp.path()).unwrap();
        assert_eq!(stats.out_of_bounds_chunks, 1);
        assert!(stats.repairable());
        assert!(!stats.critical());
        assert!(verify_block(tmp.path()).is_err());
    }

    #[test]
    fn test_complete_outsider_is_critical() {
        let tmp = tempfile::tempdir().unwrap();
        // chunk entirely past the block range
        block_with_chunk_bounds(tmp.path(), 5000, 6000);

        let stats = gather_index_issues(tmp.path()).unwrap();
        assert_eq!(stats.complete_outside_chunks, 1);
        assert!(stats.critical());
        assert!(!stats.repairable());
    }

    #[test]
    fn test_out_of_order_chunks_critical() {
        // hand-build an index with a reversed chunk list
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        let meta = BlockMeta::new_level1(
            block::new_block_id(1),
            0,
            1000,
            Labels::from_pairs(vec![("r", "1")]).unwrap(),
            SourceType::Receiver,
        );

        let c1 = cut_chunks(&[(600, 1.0), (900, 2.0)]).unwrap().remove(0);
        let c2 = cut_chunks(&[(0, 1.0), (500, 2.0)]).unwrap().remove(0);
        let mut segments = crate::tsdb::block::SegmentWriter::create(dir).unwrap();
        let (r1, l1) = segments.write(&c1.chunk).unwrap();
        let (r2, l2) = segments.write(&c2.chunk).unwrap();
        segments.finish().unwrap();

        let series = vec![crate::tsdb::IndexSeries {
            labels: labels("a"),
            chunks: vec![
                ChunkMeta { min_time: c1.min_time, max_time: c1.max_time, chunk_ref: r1, len: l1 },
                ChunkMeta { min_time: c2.min_time, max_time: c2.max_time, chunk_ref: r2, len: l2 },
            ],
        }];
        let (index_data, _) = crate::tsdb::index::write_index(&series, &[4]).unwrap();
        crate::tools::file_set_contents(dir.join("index"), &index_data).unwrap();
        meta.write_to_dir(dir).unwrap();

        let stats = gather_index_issues(dir).unwrap();
        assert!(stats.out_of_order_chunks > 0);
        assert!(stats.critical());
    }

    #[test]
    fn test_repair_strips_out_of_bounds() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        let src_meta = block_with_chunk_bounds(&src, 500, 1200);

        let dest = tmp.path().join("out");
        std::fs::create_dir_all(&dest).unwrap();
        let (repaired_dir, repaired) = repair_out_of_bounds(&src, &dest, 99).unwrap();

        assert_ne!(repaired.ulid, src_meta.ulid);
        assert_eq!(repaired.compaction.parents, vec![src_meta.ulid]);
        assert_eq!(repaired.compaction.sources, src_meta.compaction.sources);
        assert_eq!(repaired.cairn.source, SourceType::BucketRepair);
        // the 1200 sample is gone
        assert_eq!(repaired.stats.num_samples, 1);

        verify_block(&repaired_dir).unwrap();
    }
}
