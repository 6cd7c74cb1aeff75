//! Merging source blocks into one compacted block.
//!
//! Sources are merged series-wise in label order. Chunk lists of the same
//! series are concatenated when their time ranges are disjoint; overlapping
//! raw chunks (vertical compaction) are decoded, deduplicated by timestamp
//! with older-block priority, and re-cut. Overlapping aggregate chunks
//! cannot be merged sample-wise and are rejected.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Error};
use ulid::Ulid;

use super::block::{self, BlockReader, BlockSeries, ChunkData};
use super::chunkenc::Encoding;
use crate::block::meta::{BlockCompaction, BlockMeta, ShardMeta, SourceType, META_VERSION};

/// Merge the given source block directories into a new block under
/// `dest_parent`. Returns `None` when the merge yields no samples (the
/// caller then just drops the sources). Sources must belong to one
/// compaction group (same external labels and resolution).
pub fn compact_blocks(
    dest_parent: &Path,
    sources: &[PathBuf],
    wall_clock_ms: u64,
) -> Result<Option<(PathBuf, BlockMeta)>, Error> {
    if sources.len() < 2 {
        bail!("compaction needs at least two source blocks");
    }

    let mut readers = Vec::with_capacity(sources.len());
    for dir in sources {
        readers.push(BlockReader::open(dir)?);
    }
    // older blocks first; ties broken by ulid for determinism
    readers.sort_by_key(|r| (r.meta().min_time, r.meta().ulid));

    let group_labels = readers[0].meta().cairn.labels.clone();
    let group_resolution = readers[0].meta().resolution();
    for reader in &readers[1..] {
        if reader.meta().cairn.labels != group_labels
            || reader.meta().resolution() != group_resolution
        {
            bail!(
                "block {} does not belong to compaction group of {}",
                reader.meta().ulid,
                readers[0].meta().ulid
            );
        }
    }

    let mut min_time = i64::MAX;
    let mut max_time = i64::MIN;
    let mut level = 0u32;
    let mut source_ids: Vec<Ulid> = Vec::new();
    let mut parents: Vec<Ulid> = Vec::new();

    let mut merged: BTreeMap<crate::labels::Labels, Vec<ChunkData>> = BTreeMap::new();
    for reader in &readers {
        let meta = reader.meta();
        min_time = min_time.min(meta.min_time);
        max_time = max_time.max(meta.max_time);
        level = level.max(meta.compaction.level);
        source_ids.extend(&meta.compaction.sources);
        parents.push(meta.ulid);

        for series in reader.all_series_data()? {
            merged.entry(series.labels).or_default().extend(series.chunks);
        }
    }
    source_ids.sort();
    source_ids.dedup();

    let mut block_series = Vec::with_capacity(merged.len());
    let mut total_samples = 0u64;
    for (labels, chunks) in merged {
        let chunks = merge_series_chunks(chunks)?;
        total_samples += chunks.iter().map(|c| c.num_samples).sum::<u64>();
        if !chunks.is_empty() {
            block_series.push(BlockSeries { labels, chunks });
        }
    }

    if total_samples == 0 {
        return Ok(None);
    }

    let ulid = block::new_block_id(wall_clock_ms);
    let meta = BlockMeta {
        version: META_VERSION,
        ulid,
        min_time,
        max_time,
        stats: Default::default(),
        compaction: BlockCompaction {
            level: level + 1,
            sources: source_ids,
            parents,
        },
        cairn: ShardMeta {
            labels: group_labels,
            downsample: crate::block::meta::Downsample { resolution: group_resolution },
            source: SourceType::Compactor,
        },
    };

    let dir = dest_parent.join(ulid.to_string());
    let meta = block::write_block(&dir, meta, block_series)?;
    Ok(Some((dir, meta)))
}

/// Merge the chunk list of one series gathered across source blocks.
fn merge_series_chunks(mut chunks: Vec<ChunkData>) -> Result<Vec<ChunkData>, Error> {
    // stable sort keeps source priority for equal start times
    chunks.sort_by_key(|c| c.min_time);

    let overlapping = chunks
        .windows(2)
        .any(|w| w[1].min_time <= w[0].max_time);
    if !overlapping {
        return Ok(chunks);
    }

    if chunks.iter().any(|c| c.chunk.encoding == Encoding::Aggr) {
        bail!("cannot vertically merge overlapping aggregate chunks");
    }

    // first writer wins per timestamp; chunks arrive in source order within
    // equal start times, so older blocks take priority
    let mut samples: BTreeMap<i64, f64> = BTreeMap::new();
    for data in &chunks {
        for sample in data.chunk.iter()? {
            let (t, v) = sample?;
            samples.entry(t).or_insert(v);
        }
    }

    let flat: Vec<(i64, f64)> = samples.into_iter().collect();
    block::cut_chunks(&flat)
}
