//! In-memory appendable head.
//!
//! The receiver appends incoming samples here; on flush the head is sealed
//! into a level-1 block directory which the shipper then uploads. Timestamps
//! are enforced monotonically increasing per series.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Error};
use ulid::Ulid;

use super::block::{self, BlockSeries};
use crate::block::meta::{BlockMeta, SourceType};
use crate::labels::Labels;

#[derive(Debug, Default)]
struct MemSeries {
    samples: Vec<(i64, f64)>,
}

impl MemSeries {
    fn append(&mut self, t: i64, v: f64) -> Result<(), Error> {
        if let Some(&(last_t, last_v)) = self.samples.last() {
            if t < last_t {
                bail!("out of order sample: ts {} before head ts {}", t, last_t);
            }
            if t == last_t {
                if v.to_bits() != last_v.to_bits() {
                    bail!("duplicate sample for ts {} with different value", t);
                }
                return Ok(()); // idempotent re-append
            }
        }
        self.samples.push((t, v));
        Ok(())
    }
}

/// Appendable in-memory series store for one tenant-local TSDB.
pub struct Head {
    series: BTreeMap<Labels, MemSeries>,
    min_time: i64,
    max_time: i64,
    num_samples: u64,
}

impl Head {
    pub fn new() -> Self {
        Self {
            series: BTreeMap::new(),
            min_time: i64::MAX,
            max_time: i64::MIN,
            num_samples: 0,
        }
    }

    pub fn append(&mut self, labels: Labels, t: i64, v: f64) -> Result<(), Error> {
        if labels.is_empty() {
            bail!("cannot append series with empty label set");
        }
        self.series.entry(labels).or_default().append(t, v)?;
        self.min_time = self.min_time.min(t);
        self.max_time = self.max_time.max(t);
        self.num_samples += 1;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn num_series(&self) -> usize {
        self.series.len()
    }

    pub fn num_samples(&self) -> u64 {
        self.num_samples
    }

    /// Inclusive time bounds of appended data; `None` while empty.
    pub fn time_bounds(&self) -> Option<(i64, i64)> {
        if self.is_empty() {
            None
        } else {
            Some((self.min_time, self.max_time))
        }
    }

    /// Seal the head into a level-1 block under `tsdb_dir/<ulid>/` and reset
    /// it. Returns `None` when the head holds no samples.
    pub fn seal(
        &mut self,
        tsdb_dir: &Path,
        external_labels: Labels,
        wall_clock_ms: u64,
    ) -> Result<Option<(PathBuf, BlockMeta)>, Error> {
        if self.is_empty() {
            return Ok(None);
        }

        let ulid = block::new_block_id(wall_clock_ms);
        let series = std::mem::take(&mut self.series);
        let (min_time, max_time) = (self.min_time, self.max_time);
        self.min_time = i64::MAX;
        self.max_time = i64::MIN;
        self.num_samples = 0;

        let mut block_series = Vec::with_capacity(series.len());
        for (labels, mem) in series {
            block_series.push(BlockSeries {
                labels,
                chunks: block::cut_chunks(&mem.samples)?,
            });
        }

        // block ranges are half-open; the sealed block covers [min, max]
        let meta = BlockMeta::new_level1(
            ulid,
            min_time,
            max_time + 1,
            external_labels,
            SourceType::Receiver,
        );

        let dir = tsdb_dir.join(ulid.to_string());
        let meta = block::write_block(&dir, meta, block_series)?;
        Ok(Some((dir, meta)))
    }
}

impl Default for Head {
    fn default() -> Self {
        Self::new()
    }
}

/// List sealed block ULIDs under a local TSDB directory.
pub fn list_local_blocks(tsdb_dir: &Path) -> Result<Vec<Ulid>, Error> {
    let mut blocks = Vec::new();
    if !tsdb_dir.exists() {
        return Ok(blocks);
    }
    for entry in std::fs::read_dir(tsdb_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if let Ok(ulid) = name.parse::<Ulid>() {
                // visible only once the local meta commit happened
                if entry.path().join(crate::block::meta::META_FILENAME).exists() {
                    blocks.push(ulid);
                }
            }
        }
    }
    blocks.sort();
    Ok(blocks)
}
