//! Downsample and query round-trip: rates from the 5m block match rates
//! from the raw source, across chunk boundaries and through a reset.

use std::path::Path;

use cairn::block::meta::{BlockMeta, SourceType, RES_5M};
use cairn::compact::downsample::{self, AggrChunk, CounterSeriesIterator};
use cairn::labels::Labels;
use cairn::tsdb::block::{cut_chunks, new_block_id, write_block, BlockReader, BlockSeries};
use cairn::tsdb::chunkenc;

const DAY_MS: i64 = 24 * 3_600_000;

/// A counter sampled every six seconds over 24h with one reset.
fn counter_samples() -> Vec<(i64, f64)> {
    let mut samples = Vec::new();
    let mut v = 0.0;
    let step_ms = 6_000;
    let total = DAY_MS / step_ms;
    for i in 0..total {
        if i == total / 2 {
            v = 0.0; // counter reset half way
        }
        v += 10.0;
        samples.push((i * step_ms, v));
    }
    samples
}

fn write_raw_block(dir: &Path, samples: &[(i64, f64)]) -> BlockMeta {
    let meta = BlockMeta::new_level1(
        new_block_id(1),
        0,
        DAY_MS,
        Labels::from_pairs(vec![("r", "1")]).unwrap(),
        SourceType::Receiver,
    );
    let series = vec![BlockSeries {
        labels: Labels::from_pairs(vec![("__name__", "requests_total")]).unwrap(),
        chunks: cut_chunks(samples).unwrap(),
    }];
    write_block(dir, meta, series).unwrap()
}

/// Reset-adjusted cumulative totals straight from raw samples.
fn adjusted_totals(samples: &[(i64, f64)]) -> Vec<(i64, f64)> {
    let mut out = Vec::with_capacity(samples.len());
    let mut total = 0.0;
    let mut prev: Option<f64> = None;
    for &(t, v) in samples {
        total = match prev {
            None => v,
            Some(p) if v >= p => total + (v - p),
            Some(_) => total + v,
        };
        prev = Some(v);
        out.push((t, total));
    }
    out
}

#[tokio::test(flavor = "multi_thread")]
async fn downsampled_counter_rate_matches_raw() {
    let tmp = tempfile::tempdir().unwrap();
    let raw_dir = tmp.path().join("raw");
    let samples = counter_samples();
    write_raw_block(&raw_dir, &samples);

    let out_dir = tmp.path().join("out");
    std::fs::create_dir_all(&out_dir).unwrap();
    let (ds_dir, ds_meta) = downsample::downsample_block(&raw_dir, &out_dir, 99)
        .unwrap()
        .expect("downsampled block");

    // same coverage and lineage as the raw ancestor (I5)
    assert_eq!(ds_meta.min_time, 0);
    assert_eq!(ds_meta.max_time, DAY_MS);
    assert_eq!(ds_meta.resolution(), RES_5M);
    assert_eq!(ds_meta.cairn.source, SourceType::Compactor);

    // decode the counter aggregate through the reset-aware iterator,
    // stitching all aggregate chunks of the series
    let reader = BlockReader::open(&ds_dir).unwrap();
    let all = reader.all_series_data().unwrap();
    assert_eq!(all.len(), 1);
    // multiple chunks force the cross-chunk signaling path
    assert!(all[0].chunks.len() > 1);

    let counter_chunks: Vec<Vec<(i64, f64)>> = all[0]
        .chunks
        .iter()
        .map(|c| {
            AggrChunk::decode(&c.chunk)
                .unwrap()
                .counter_samples()
                .unwrap()
        })
        .collect();
    let ds_totals: Vec<(i64, f64)> = CounterSeriesIterator::new(counter_chunks).collect();
    let raw_totals = adjusted_totals(&samples);

    // full range
    let raw_rate = downsample::counter_rate(&raw_totals, 0, DAY_MS).unwrap();
    let ds_rate = downsample::counter_rate(&ds_totals, 0, DAY_MS).unwrap();
    assert!(
        (raw_rate - ds_rate).abs() < 1e-6,
        "full range: raw {} vs downsampled {}",
        raw_rate,
        ds_rate
    );

    // a window straddling the reset and several chunk boundaries; the
    // downsampled edges snap to aggregation windows, so compare loosely
    let (win_min, win_max) = (DAY_MS / 4, 3 * DAY_MS / 4);
    let raw_rate = downsample::counter_rate(&raw_totals, win_min, win_max).unwrap();
    let ds_rate = downsample::counter_rate(&ds_totals, win_min, win_max).unwrap();
    let relative = (raw_rate - ds_rate).abs() / raw_rate;
    assert!(relative < 0.02, "window: raw {} vs downsampled {}", raw_rate, ds_rate);
}

#[tokio::test(flavor = "multi_thread")]
async fn gauge_aggregates_survive_roundtrip() {
    let tmp = tempfile::tempdir().unwrap();
    let raw_dir = tmp.path().join("raw");

    // sawtooth gauge
    let samples: Vec<(i64, f64)> = (0..DAY_MS / 60_000)
        .map(|i| (i * 60_000, (i % 10) as f64))
        .collect();
    write_raw_block(&raw_dir, &samples);

    let out_dir = tmp.path().join("out");
    std::fs::create_dir_all(&out_dir).unwrap();
    let (ds_dir, _) = downsample::downsample_block(&raw_dir, &out_dir, 99)
        .unwrap()
        .expect("downsampled block");

    let reader = BlockReader::open(&ds_dir).unwrap();
    let all = reader.all_series_data().unwrap();

    let mut total_count = 0.0;
    let mut total_sum = 0.0;
    let mut seen_min = f64::INFINITY;
    let mut seen_max = f64::NEG_INFINITY;
    for chunk in &all[0].chunks {
        let aggr = AggrChunk::decode(&chunk.chunk).unwrap();
        for (_, v) in aggr.count_samples().unwrap() {
            total_count += v;
        }
        for (_, v) in aggr.sum_samples().unwrap() {
            total_sum += v;
        }
        for (_, v) in aggr.min_samples().unwrap() {
            seen_min = seen_min.min(v);
        }
        for (_, v) in aggr.max_samples().unwrap() {
            seen_max = seen_max.max(v);
        }
        // every aggregate chunk respects the target size
        assert!(chunk.chunk.num_samples() <= downsample::MAX_SAMPLES_PER_AGGR_CHUNK);
    }

    assert_eq!(total_count, samples.len() as f64);
    assert_eq!(total_sum, samples.iter().map(|s| s.1).sum::<f64>());
    assert_eq!(seen_min, 0.0);
    assert_eq!(seen_max, 9.0);

    // raw XOR samples in the source survive byte-identical chunk decode
    let raw_reader = BlockReader::open(&raw_dir).unwrap();
    let raw_series = raw_reader.all_series_data().unwrap();
    let decoded: Vec<(i64, f64)> = raw_series[0]
        .chunks
        .iter()
        .flat_map(|c| chunkenc::decode_all(&c.chunk).unwrap())
        .collect();
    assert_eq!(decoded, samples);
}
