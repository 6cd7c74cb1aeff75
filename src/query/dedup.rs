//! Replica deduplication.
//!
//! Series that differ only in the replica label are views of the same data
//! written by redundant producers. The dedup iterator streams one merged
//! sample sequence: it sticks with one replica while its samples keep
//! coming, switches to a covering replica when the active one has a gap
//! larger than the threshold, and never emits duplicate timestamps. Given a
//! fixed replica order the output is deterministic.

pub const DEFAULT_DEDUP_GAP_MS: i64 = 5 * 60 * 1000;

/// Iterator over replicas of one series. Replicas must arrive in a
/// deterministic order (the federator sorts them by replica label value)
/// with each sample list ascending in time.
pub struct DedupIterator {
    replicas: Vec<Vec<(i64, f64)>>,
    cursors: Vec<usize>,
    active: usize,
    last_t: i64,
    gap_ms: i64,
}

impl DedupIterator {
    pub fn new(replicas: Vec<Vec<(i64, f64)>>, gap_ms: i64) -> Self {
        let cursors = vec![0; replicas.len()];
        // start on the replica with the earliest sample; ties keep the
        // first (lowest replica value)
        let active = replicas
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.is_empty())
            .min_by_key(|(idx, r)| (r[0].0, *idx))
            .map(|(idx, _)| idx)
            .unwrap_or(0);
        Self { replicas, cursors, active, last_t: i64::MIN, gap_ms }
    }

    fn peek(&self, replica: usize) -> Option<(i64, f64)> {
        self.replicas[replica].get(self.cursors[replica]).copied()
    }

    /// Drop everything at or before the last emitted timestamp.
    fn skip_emitted(&mut self) {
        for replica in 0..self.replicas.len() {
            while let Some((t, _)) = self.peek(replica) {
                if t <= self.last_t {
                    self.cursors[replica] += 1;
                } else {
                    break;
                }
            }
        }
    }
}

impl Iterator for DedupIterator {
    type Item = (i64, f64);

    fn next(&mut self) -> Option<(i64, f64)> {
        self.skip_emitted();

        let active_next = self.peek(self.active);
        let within_gap = |t: i64, last: i64| last == i64::MIN || t - last <= self.gap_ms;

        let chosen = match active_next {
            Some((t, _)) if within_gap(t, self.last_t) => self.active,
            _ => {
                // active replica has a gap (or ended): switch to the
                // replica covering the earliest next timestamp
                let best = (0..self.replicas.len())
                    .filter_map(|idx| self.peek(idx).map(|(t, _)| (t, idx)))
                    .min();
                match best {
                    Some((_, idx)) => {
                        self.active = idx;
                        idx
                    }
                    None => return None,
                }
            }
        };

        let (t, v) = self.peek(chosen)?;
        self.cursors[chosen] += 1;
        self.last_t = t;
        Some((t, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(replicas: Vec<Vec<(i64, f64)>>, gap: i64) -> Vec<(i64, f64)> {
        DedupIterator::new(replicas, gap).collect()
    }

    #[test]
    fn test_single_replica_passthrough() {
        let samples = vec![(0, 1.0), (10, 2.0), (20, 3.0)];
        assert_eq!(collect(vec![samples.clone()], 100), samples);
    }

    #[test]
    fn test_identical_replicas_emit_once() {
        let samples: Vec<(i64, f64)> = (0..50).map(|i| (i * 10, i as f64)).collect();
        let out = collect(vec![samples.clone(), samples.clone()], 100);
        assert_eq!(out, samples);
    }

    #[test]
    fn test_offset_replicas_no_duplicate_timestamps() {
        // replica b samples half-shifted; identical timestamps collapse
        let a: Vec<(i64, f64)> = (0..10).map(|i| (i * 10, 1.0)).collect();
        let b: Vec<(i64, f64)> = (0..10).map(|i| (i * 10 + 5, 2.0)).collect();
        let out = collect(vec![a, b], 100);

        let mut timestamps: Vec<i64> = out.iter().map(|s| s.0).collect();
        let len = timestamps.len();
        timestamps.dedup();
        assert_eq!(timestamps.len(), len);
        // sticks to replica a, b's interleaved samples are skipped only
        // when behind the emitted cursor; strictly increasing output
        for pair in out.windows(2) {
            assert!(pair[0].0 < pair[1].0);
        }
    }

    #[test]
    fn test_gap_failover_and_return() {
        // replica a dies between t=30 and t=300, b covers the hole
        let a = vec![(0, 1.0), (10, 1.0), (20, 1.0), (30, 1.0), (300, 1.0), (310, 1.0)];
        let b: Vec<(i64, f64)> = (0..32).map(|i| (i * 10, 2.0)).collect();

        let out = collect(vec![a, b], 50);

        // the hole is filled by replica b values
        assert!(out.iter().any(|&(t, v)| t > 30 && t < 300 && v == 2.0));
        // all timestamps strictly increasing
        for pair in out.windows(2) {
            assert!(pair[0].0 < pair[1].0);
        }
        // the range is fully covered
        assert_eq!(out.first().unwrap().0, 0);
        assert_eq!(out.last().unwrap().0, 310);
    }

    #[test]
    fn test_deterministic_given_replica_order() {
        let a = vec![(0, 1.0), (100, 1.0)];
        let b = vec![(0, 2.0), (100, 2.0)];
        let first = collect(vec![a.clone(), b.clone()], 1000);
        let second = collect(vec![a, b], 1000);
        assert_eq!(first, second);
        // replica priority: the first replica's values win
        assert!(first.iter().all(|&(_, v)| v == 1.0));
    }

    #[test]
    fn test_empty_replicas() {
        assert!(collect(vec![], 100).is_empty());
        assert!(collect(vec![vec![], vec![]], 100).is_empty());
        assert_eq!(collect(vec![vec![], vec![(5, 1.0)]], 100), vec![(5, 1.0)]);
    }
}
