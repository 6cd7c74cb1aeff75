//! Downsampling: raw -> 5m and 5m -> 1h aggregate blocks.
//!
//! Each aggregation window of a series produces five values: count, sum,
//! min, max and a reset-adjusted counter. They are stored as five XOR
//! sub-chunks wrapped into one aggregate chunk. Window samples carry the
//! timestamp of the window's last millisecond.
//!
//! Counter sub-chunks have extra structure so that counter-reset detection
//! survives chunk boundaries and re-downsampling:
//!
//! ```text
//! (t_first_raw, first raw value)
//! (window_ts,  reset-adjusted cumulative value) per window
//! (last_ts+1,  last true raw value)              <- signaling sample
//! ```
//!
//! `CounterSeriesIterator` consumes sequences of such chunks, uses the
//! signaling samples for cross-chunk reset detection and never emits them.

use std::path::{Path, PathBuf};

use anyhow::{bail, Error};

use crate::block::meta::{BlockMeta, SourceType, RES_1H, RES_5M};
use crate::tsdb::block::{self, BlockReader, BlockSeries, ChunkData};
use crate::tsdb::chunkenc::{self, Chunk, Encoding};

/// Target ceiling for aggregated samples per chunk.
pub const MAX_SAMPLES_PER_AGGR_CHUNK: usize = 140;

/// Decoded aggregate chunk: five optional XOR sub-chunks.
#[derive(Clone, Debug, Default)]
pub struct AggrChunk {
    pub count: Option<Vec<u8>>,
    pub sum: Option<Vec<u8>>,
    pub min: Option<Vec<u8>>,
    pub max: Option<Vec<u8>>,
    pub counter: Option<Vec<u8>>,
}

impl AggrChunk {
    pub fn decode(chunk: &Chunk) -> Result<Self, Error> {
        if chunk.encoding != Encoding::Aggr {
            bail!("not an aggregate chunk");
        }
        let mut out = AggrChunk::default();
        for (typ, bytes) in chunkenc::aggr_decode(&chunk.data)? {
            let slot = match typ {
                chunkenc::AGGR_COUNT => &mut out.count,
                chunkenc::AGGR_SUM => &mut out.sum,
                chunkenc::AGGR_MIN => &mut out.min,
                chunkenc::AGGR_MAX => &mut out.max,
                chunkenc::AGGR_COUNTER => &mut out.counter,
                other => bail!("unknown aggregate type {}", other),
            };
            *slot = Some(bytes.to_vec());
        }
        Ok(out)
    }

    pub fn encode(&self) -> Chunk {
        let mut parts: Vec<(u8, &[u8])> = Vec::with_capacity(5);
        if let Some(b) = &self.count {
            parts.push((chunkenc::AGGR_COUNT, b));
        }
        if let Some(b) = &self.sum {
            parts.push((chunkenc::AGGR_SUM, b));
        }
        if let Some(b) = &self.min {
            parts.push((chunkenc::AGGR_MIN, b));
        }
        if let Some(b) = &self.max {
            parts.push((chunkenc::AGGR_MAX, b));
        }
        if let Some(b) = &self.counter {
            parts.push((chunkenc::AGGR_COUNTER, b));
        }
        Chunk { encoding: Encoding::Aggr, data: chunkenc::aggr_encode(&parts) }
    }

    fn samples(bytes: &Option<Vec<u8>>) -> Result<Vec<(i64, f64)>, Error> {
        match bytes {
            Some(b) => chunkenc::XorIterator::new(b).collect(),
            None => Ok(Vec::new()),
        }
    }

    pub fn count_samples(&self) -> Result<Vec<(i64, f64)>, Error> {
        Self::samples(&self.count)
    }
    pub fn sum_samples(&self) -> Result<Vec<(i64, f64)>, Error> {
        Self::samples(&self.sum)
    }
    pub fn min_samples(&self) -> Result<Vec<(i64, f64)>, Error> {
        Self::samples(&self.min)
    }
    pub fn max_samples(&self) -> Result<Vec<(i64, f64)>, Error> {
        Self::samples(&self.max)
    }
    pub fn counter_samples(&self) -> Result<Vec<(i64, f64)>, Error> {
        Self::samples(&self.counter)
    }
}

/// One aggregation window of one series.
#[derive(Clone, Copy, Debug)]
struct WindowAggregate {
    ts: i64,
    count: f64,
    sum: f64,
    min: f64,
    max: f64,
    /// reset-adjusted cumulative value at window end
    counter: f64,
}

fn window_ts(t: i64, resolution: i64) -> i64 {
    t.div_euclid(resolution) * resolution + resolution - 1
}

/// Aggregate ordered raw samples into windows. The adjusted counter starts
/// at the first raw value and adds `v` on every reset, `v - prev` otherwise.
fn aggregate_windows(samples: &[(i64, f64)], resolution: i64) -> Vec<WindowAggregate> {
    let mut out: Vec<WindowAggregate> = Vec::new();
    let mut adjusted = 0.0;
    let mut prev_v: Option<f64> = None;

    for &(t, v) in samples {
        match prev_v {
            None => adjusted = v,
            Some(prev) => {
                if v >= prev {
                    adjusted += v - prev;
                } else {
                    adjusted += v; // counter reset
                }
            }
        }
        prev_v = Some(v);

        let ts = window_ts(t, resolution);
        match out.last_mut() {
            Some(window) if window.ts == ts => {
                window.count += 1.0;
                window.sum += v;
                window.min = window.min.min(v);
                window.max = window.max.max(v);
                window.counter = adjusted;
            }
            _ => out.push(WindowAggregate {
                ts,
                count: 1.0,
                sum: v,
                min: v,
                max: v,
                counter: adjusted,
            }),
        }
    }
    out
}

fn encode_xor(samples: &[(i64, f64)]) -> Result<Option<Vec<u8>>, Error> {
    if samples.is_empty() {
        return Ok(None);
    }
    Ok(Some(chunkenc::encode_all(samples)?.data))
}

/// Build one aggregate chunk from a run of windows plus the raw first/last
/// samples needed by the counter structure.
fn build_aggr_chunk(
    windows: &[WindowAggregate],
    first_raw: (i64, f64),
    last_raw: (i64, f64),
) -> Result<ChunkData, Error> {
    let count: Vec<(i64, f64)> = windows.iter().map(|w| (w.ts, w.count)).collect();
    let sum: Vec<(i64, f64)> = windows.iter().map(|w| (w.ts, w.sum)).collect();
    let min: Vec<(i64, f64)> = windows.iter().map(|w| (w.ts, w.min)).collect();
    let max: Vec<(i64, f64)> = windows.iter().map(|w| (w.ts, w.max)).collect();

    let mut counter: Vec<(i64, f64)> = Vec::with_capacity(windows.len() + 2);
    counter.push(first_raw);
    for w in windows {
        if w.ts > counter.last().unwrap().0 {
            counter.push((w.ts, w.counter));
        }
    }
    // signaling sample: the last true raw value, one past the last window
    let signal_ts = counter.last().unwrap().0.max(last_raw.0) + 1;
    counter.push((signal_ts, last_raw.1));

    let aggr = AggrChunk {
        count: encode_xor(&count)?,
        sum: encode_xor(&sum)?,
        min: encode_xor(&min)?,
        max: encode_xor(&max)?,
        counter: encode_xor(&counter)?,
    };

    Ok(ChunkData {
        min_time: windows[0].ts,
        max_time: signal_ts,
        num_samples: windows.len() as u64,
        chunk: aggr.encode(),
    })
}

/// Downsample one series of raw samples into aggregate chunks.
fn downsample_raw_series(samples: &[(i64, f64)], resolution: i64) -> Result<Vec<ChunkData>, Error> {
    if samples.is_empty() {
        return Ok(Vec::new());
    }
    let windows = aggregate_windows(samples, resolution);

    let mut chunks = Vec::new();
    for window_run in windows.chunks(MAX_SAMPLES_PER_AGGR_CHUNK) {
        // raw bounds of this run for the counter structure
        let run_start = window_run[0].ts - (resolution - 1);
        let run_end = window_run[window_run.len() - 1].ts;
        let in_run: Vec<(i64, f64)> = samples
            .iter()
            .filter(|&&(t, _)| t >= run_start && t <= run_end)
            .copied()
            .collect();
        chunks.push(build_aggr_chunk(
            window_run,
            in_run[0],
            in_run[in_run.len() - 1],
        )?);
    }
    Ok(chunks)
}

/// Explicit-state iterator over counter sub-chunks of one series. Emits
/// `(t, cumulative adjusted value)` and swallows signaling samples, using
/// them to detect resets across chunk gaps.
pub struct CounterSeriesIterator {
    chunks: Vec<Vec<(i64, f64)>>,
    chunk_idx: usize,
    sample_idx: usize,
    last_t: i64,
    /// true raw value at the end of the previous chunk
    last_true: Option<f64>,
    /// emitted cumulative value
    total: f64,
    /// first stored value of the current chunk (its first raw value)
    chunk_base: f64,
    /// total at entry of the current chunk
    chunk_total_base: f64,
}

impl CounterSeriesIterator {
    pub fn new(chunks: Vec<Vec<(i64, f64)>>) -> Self {
        Self {
            chunks,
            chunk_idx: 0,
            sample_idx: 0,
            last_t: i64::MIN,
            last_true: None,
            total: 0.0,
            chunk_base: 0.0,
            chunk_total_base: 0.0,
        }
    }

    /// The last true raw value seen, for building follow-up signal samples.
    pub fn last_true_value(&self) -> Option<f64> {
        self.last_true
    }
}

impl Iterator for CounterSeriesIterator {
    type Item = (i64, f64);

    fn next(&mut self) -> Option<(i64, f64)> {
        loop {
            let chunk = self.chunks.get(self.chunk_idx)?;
            if chunk.len() < 2 {
                // degenerate chunk, skip
                self.chunk_idx += 1;
                self.sample_idx = 0;
                continue;
            }

            if self.sample_idx == 0 {
                // chunk entry: first stored sample is the first raw value
                let (t, v) = chunk[0];
                self.chunk_base = v;
                self.chunk_total_base = match self.last_true {
                    Some(last) => {
                        let gap = if v >= last { v - last } else { v };
                        self.total + gap
                    }
                    None => v,
                };
                self.sample_idx = 1;
                self.total = self.chunk_total_base;
                if t > self.last_t {
                    self.last_t = t;
                    return Some((t, self.total));
                }
                continue;
            }

            if self.sample_idx == chunk.len() - 1 {
                // signaling sample: record the true value, move on
                self.last_true = Some(chunk[chunk.len() - 1].1);
                self.chunk_idx += 1;
                self.sample_idx = 0;
                continue;
            }

            let (t, adjusted) = chunk[self.sample_idx];
            self.sample_idx += 1;
            // stored values accumulate from the chunk's first raw value
            self.total = self.chunk_total_base + (adjusted - self.chunk_base);
            if t > self.last_t {
                self.last_t = t;
                return Some((t, self.total));
            }
        }
    }
}

/// Re-aggregate 5m aggregate chunks of one series into 1h chunks.
fn downsample_aggr_series(
    chunks: &[ChunkData],
    resolution: i64,
) -> Result<Vec<ChunkData>, Error> {
    #[derive(Clone, Copy)]
    struct ReWindow {
        ts: i64,
        count: f64,
        sum: f64,
        min: f64,
        max: f64,
        counter: f64,
    }

    let mut decoded = Vec::with_capacity(chunks.len());
    for data in chunks {
        decoded.push(AggrChunk::decode(&data.chunk)?);
    }

    // combine the plain aggregates window-wise
    fn upsert(windows: &mut Vec<ReWindow>, ts: i64) -> usize {
        match windows.iter().position(|w| w.ts == ts) {
            Some(idx) => idx,
            None => {
                windows.push(ReWindow {
                    ts,
                    count: 0.0,
                    sum: 0.0,
                    min: f64::INFINITY,
                    max: f64::NEG_INFINITY,
                    counter: 0.0,
                });
                windows.len() - 1
            }
        }
    }

    let mut windows: Vec<ReWindow> = Vec::new();
    for aggr in &decoded {
        for (t, v) in aggr.count_samples()? {
            let idx = upsert(&mut windows, window_ts(t, resolution));
            windows[idx].count += v;
        }
        for (t, v) in aggr.sum_samples()? {
            let idx = upsert(&mut windows, window_ts(t, resolution));
            windows[idx].sum += v;
        }
        for (t, v) in aggr.min_samples()? {
            let idx = upsert(&mut windows, window_ts(t, resolution));
            windows[idx].min = windows[idx].min.min(v);
        }
        for (t, v) in aggr.max_samples()? {
            let idx = upsert(&mut windows, window_ts(t, resolution));
            windows[idx].max = windows[idx].max.max(v);
        }
    }
    windows.sort_by_key(|w| w.ts);

    // the counter series runs through the reset-aware iterator
    let counter_chunks: Vec<Vec<(i64, f64)>> = decoded
        .iter()
        .map(|a| a.counter_samples())
        .collect::<Result<_, _>>()?;
    let mut counter_iter = CounterSeriesIterator::new(counter_chunks);
    let mut first_counter: Option<(i64, f64)> = None;
    for (t, total) in &mut counter_iter {
        if first_counter.is_none() {
            first_counter = Some((t, total));
        }
        if let Some(idx) = windows
            .iter()
            .position(|w| w.ts == window_ts(t, resolution))
        {
            windows[idx].counter = total;
        }
    }
    let last_true = counter_iter.last_true_value();

    if windows.is_empty() {
        return Ok(Vec::new());
    }

    let mut out = Vec::new();
    for run in windows.chunks(MAX_SAMPLES_PER_AGGR_CHUNK) {
        let count: Vec<(i64, f64)> = run.iter().map(|w| (w.ts, w.count)).collect();
        let sum: Vec<(i64, f64)> = run.iter().map(|w| (w.ts, w.sum)).collect();
        let min: Vec<(i64, f64)> = run.iter().map(|w| (w.ts, w.min)).collect();
        let max: Vec<(i64, f64)> = run.iter().map(|w| (w.ts, w.max)).collect();

        let mut counter: Vec<(i64, f64)> = Vec::with_capacity(run.len() + 2);
        if let Some(first) = first_counter {
            counter.push(first);
        }
        for w in run {
            if counter.last().map(|l| w.ts > l.0).unwrap_or(true) {
                counter.push((w.ts, w.counter));
            }
        }
        if let (Some(last), Some(true_v)) = (counter.last().copied(), last_true) {
            counter.push((last.0 + 1, true_v));
        }

        let aggr = AggrChunk {
            count: encode_xor(&count)?,
            sum: encode_xor(&sum)?,
            min: encode_xor(&min)?,
            max: encode_xor(&max)?,
            counter: encode_xor(&counter)?,
        };
        out.push(ChunkData {
            min_time: run[0].ts,
            max_time: run[run.len() - 1].ts + 1,
            num_samples: run.len() as u64,
            chunk: aggr.encode(),
        });
    }
    Ok(out)
}

/// Downsample a block directory into `dest_parent/<new ulid>/`. Raw blocks
/// go to 5m, 5m blocks to 1h. Returns `None` when nothing survives.
pub fn downsample_block(
    src_dir: &Path,
    dest_parent: &Path,
    wall_clock_ms: u64,
) -> Result<Option<(PathBuf, BlockMeta)>, Error> {
    let reader = BlockReader::open(src_dir)?;
    let src_meta = reader.meta().clone();

    let target_resolution = match src_meta.resolution() {
         0 => RES_5M,
        RES_5M => RES_1H,
        other => bail!("block {} already at resolution {}", src_meta.ulid, other),
    };

    let mut out_series = Vec::new();
    for series in reader.all_series_data()? {
        let chunks = if src_meta.resolution() == 0 {
            let samples: Vec<(i64, f64)> = series
                .chunks
                .iter()
                .map(|c| chunkenc::decode_all(&c.chunk))
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .flatten()
                .collect();
            downsample_raw_series(&samples, target_resolution)?
        } else {
            downsample_aggr_series(&series.chunks, target_resolution)?
        };
        if !chunks.is_empty() {
            out_series.push(BlockSeries { labels: series.labels, chunks });
        }
    }

    if out_series.is_empty() {
        return Ok(None);
    }

    let ulid = block::new_block_id(wall_clock_ms);
    let mut meta = src_meta.clone();
    meta.ulid = ulid;
    meta.stats = Default::default();
    // the downsampled block covers the same range as its raw ancestor
    meta.compaction.parents = vec![src_meta.ulid];
    meta.cairn.downsample.resolution = target_resolution;
    meta.cairn.source = SourceType::Compactor;

    let dir = dest_parent.join(ulid.to_string());
    let meta = block::write_block(&dir, meta, out_series)?;
    log::info!(
        "downsampled block {} to {} at resolution {}",
        src_meta.ulid,
        meta.ulid,
        target_resolution
    );
    Ok(Some((dir, meta)))
}

/// Per-second rate of a counter over the window `[min_t, max_t]` from its
/// cumulative samples: increase between the first and last sample inside
/// the window, divided by the window duration. Used by tests and by
/// engines without native counter support.
pub fn counter_rate(samples: &[(i64, f64)], min_t: i64, max_t: i64) -> Option<f64> {
    if max_t <= min_t {
        return None;
    }
    let in_range: Vec<&(i64, f64)> = samples
        .iter()
        .filter(|&&(t, _)| t >= min_t && t <= max_t)
        .collect();
    let first = in_range.first()?;
    let last = in_range.last()?;
    if last.0 == first.0 {
        return None;
    }
    Some((last.1 - first.1) / ((max_t - min_t) as f64 / 1000.0))
}
