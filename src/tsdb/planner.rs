//! Leveled compaction planning.
//!
//! Given the metas of one compaction group, the planner picks a set of
//! adjacent blocks to merge into one higher-level block. Blocks are bucketed
//! into time windows from an exponential range ladder; the first window (in
//! ascending range order) holding at least two fully contained blocks is the
//! plan. The window containing the newest block is skipped, its range may
//! still receive uploads.
//!
//! Overlapping blocks are the vertical-compaction case and are handled by
//! the compactor before planning; the planner assumes disjoint inputs.

use ulid::Ulid;

use crate::block::meta::BlockMeta;

/// Two hours, the expected duration of level-1 blocks.
pub const DEFAULT_BASE_RANGE: i64 = 2 * 60 * 60 * 1000;

/// Range ladder `base * 3^n`, n in `0..steps`.
pub fn exponential_ranges(base: i64, steps: usize) -> Vec<i64> {
    let mut ranges = Vec::with_capacity(steps);
    let mut current = base;
    for _ in 0..steps {
        ranges.push(current);
        current *= 3;
    }
    ranges
}

pub struct Planner {
    ranges: Vec<i64>,
}

impl Planner {
    pub fn new(ranges: Vec<i64>) -> Self {
        Self { ranges }
    }

    pub fn ranges(&self) -> &[i64] {
        &self.ranges
    }

    /// Select the next set of block ids to compact; empty means no work.
    pub fn plan(&self, metas: &[BlockMeta]) -> Vec<Ulid> {
        if metas.len() < 2 {
            return Vec::new();
        }

        let mut sorted: Vec<&BlockMeta> = metas.iter().collect();
        sorted.sort_by_key(|m| (m.min_time, m.ulid));

        let newest_max = sorted.iter().map(|m| m.max_time).max().unwrap();

        // the base range holds fresh level-1 blocks; start one step up
        for &range in self.ranges.iter().skip(1) {
            let mut window_start = None;
            let mut window_blocks: Vec<&BlockMeta> = Vec::new();

            for &meta in &sorted {
                let start = window_of(meta.min_time, range);
                // only blocks fully inside their window are candidates
                if meta.max_time > start + range {
                    continue;
                }
                if Some(start) != window_start {
                    if let Some(plan) = Self::emit(&window_blocks, range, newest_max) {
                        return plan;
                    }
                    window_start = Some(start);
                    window_blocks.clear();
                }
                window_blocks.push(meta);
            }
            if let Some(plan) = Self::emit(&window_blocks, range, newest_max) {
                return plan;
            }
        }

        Vec::new()
    }

    fn emit(window_blocks: &[&BlockMeta], range: i64, newest_max: i64) -> Option<Vec<Ulid>> {
        if window_blocks.len() < 2 {
            return None;
        }
        let start = window_of(window_blocks[0].min_time, range);
        if newest_max > start && newest_max <= start + range {
            return None; // window still open for uploads
        }
        Some(window_blocks.iter().map(|m| m.ulid).collect())
    }
}

impl Default for Planner {
    fn default() -> Self {
        Self::new(exponential_ranges(DEFAULT_BASE_RANGE, 5))
    }
}

// floor division keeps windows aligned for negative timestamps too
fn window_of(t: i64, range: i64) -> i64 {
    t.div_euclid(range) * range
}
