//! Local block directory I/O: chunk segment files, block writing, block
//! reading.
//!
//! A block directory holds `meta.json`, `index` and `chunks/NNNNNN` segment
//! files. Chunks are stored as `len u32 | encoding u8 | payload | crc32 u32`
//! records; the CRC covers encoding byte and payload. A chunk reference is
//! `(segment << 32) | record offset`.

use std::convert::TryInto;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};
use ulid::Ulid;

use super::chunkenc::{Chunk, Encoding};
use super::index::{self, ChunkMeta, IndexReader, IndexSeries};
use crate::block::meta::{BlockMeta, CHUNKS_DIRNAME, INDEX_FILENAME};
use crate::labels::Labels;

/// Upper bound for one chunk segment file.
pub const DEFAULT_SEGMENT_SIZE: u64 = 512 * 1024 * 1024;

/// Target raw samples per chunk when cutting series data.
pub const SAMPLES_PER_CHUNK: usize = 120;

/// An encoded chunk with its time bounds, ready for segment placement.
#[derive(Clone, Debug)]
pub struct ChunkData {
    pub min_time: i64,
    pub max_time: i64,
    pub num_samples: u64,
    pub chunk: Chunk,
}

/// One series with materialized chunks, the unit fed into `write_block`.
#[derive(Clone, Debug)]
pub struct BlockSeries {
    pub labels: Labels,
    pub chunks: Vec<ChunkData>,
}

/// Split ordered samples into XOR chunks of roughly `SAMPLES_PER_CHUNK`.
pub fn cut_chunks(samples: &[(i64, f64)]) -> Result<Vec<ChunkData>, Error> {
    cut_chunks_with(samples, SAMPLES_PER_CHUNK)
}

pub fn cut_chunks_with(samples: &[(i64, f64)], per_chunk: usize) -> Result<Vec<ChunkData>, Error> {
    let mut chunks = Vec::new();
    for part in samples.chunks(per_chunk.max(1)) {
        if part.is_empty() {
            continue;
        }
        chunks.push(ChunkData {
            min_time: part[0].0,
            max_time: part[part.len() - 1].0,
            num_samples: part.len() as u64,
            chunk: super::chunkenc::encode_all(part)?,
        });
    }
    Ok(chunks)
}

/// Appends chunk records to numbered segment files, rolling over at the
/// configured size limit.
pub struct SegmentWriter {
    dir: PathBuf,
    segment_size: u64,
    segment: u32,
    offset: u64,
    file: Option<File>,
}

impl SegmentWriter {
    pub fn create(block_dir: &Path) -> Result<Self, Error> {
        Self::with_segment_size(block_dir, DEFAULT_SEGMENT_SIZE)
    }

    pub fn with_segment_size(block_dir: &Path, segment_size: u64) -> Result<Self, Error> {
        let dir = block_dir.join(CHUNKS_DIRNAME);
        std::fs::create_dir_all(&dir)
            .map_err(|err| format_err!("unable to create {:?} - {}", dir, err))?;
        Ok(Self {
            dir,
            segment_size,
            segment: 0,
            offset: 0,
            file: None,
        })
    }

    fn cut_segment(&mut self) -> Result<(), Error> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        self.segment += 1;
        self.offset = 0;
        let path = self.dir.join(format!("{:06}", self.segment));
        self.file = Some(
            File::create(&path)
                .map_err(|err| format_err!("unable to create segment {:?} - {}", path, err))?,
        );
        Ok(())
    }

    /// Write one chunk, returning its reference and record length.
    pub fn write(&mut self, chunk: &Chunk) -> Result<(u64, u32), Error> {
        let record_len = 4 + 1 + chunk.data.len() + 4;
        if self.file.is_none() || (self.offset > 0 && self.offset + record_len as u64 > self.segment_size)
        {
            self.cut_segment()?;
        }

        let mut record = Vec::with_capacity(record_len);
        record.extend_from_slice(&(chunk.data.len() as u32).to_le_bytes());
        record.push(chunk.encoding.as_u8());
        record.extend_from_slice(&chunk.data);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&record[4..]);
        record.extend_from_slice(&hasher.finalize().to_le_bytes());

        let chunk_ref = ((self.segment as u64) << 32) | self.offset;
        self.file.as_mut().unwrap().write_all(&record)?;
        self.offset += record.len() as u64;
        Ok((chunk_ref, record.len() as u32))
    }

    pub fn finish(mut self) -> Result<(), Error> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        Ok(())
    }
}

/// Decode one chunk record from a byte slice starting at the record and
/// possibly extending beyond it. Returns the chunk and the record length.
pub fn decode_chunk_record(bytes: &[u8]) -> Result<(Chunk, usize), Error> {
    if bytes.len() < 5 {
        bail!("chunk record truncated");
    }
    let data_len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
    let total = 4 + 1 + data_len + 4;
    if bytes.len() < total {
        bail!("chunk record truncated ({} < {})", bytes.len(), total);
    }
    let encoding = Encoding::from_u8(bytes[4])?;
    let data = bytes[5..5 + data_len].to_vec();

    let crc_stored = u32::from_le_bytes(bytes[5 + data_len..total].try_into().unwrap());
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&bytes[4..5 + data_len]);
    if hasher.finalize() != crc_stored {
        bail!("chunk record checksum mismatch");
    }

    Ok((Chunk { encoding, data }, total))
}

/// Write a complete block directory: chunk segments, index, then meta.json
/// last. `meta` carries identity and compaction lineage; stats are filled
/// from the written data. Series must be sorted by label set.
pub fn write_block(
    dir: &Path,
    meta: BlockMeta,
    series: Vec<BlockSeries>,
) -> Result<BlockMeta, Error> {
    write_block_with_segment_size(dir, meta, series, DEFAULT_SEGMENT_SIZE)
}

pub fn write_block_with_segment_size(
    dir: &Path,
    mut meta: BlockMeta,
    series: Vec<BlockSeries>,
    segment_size: u64,
) -> Result<BlockMeta, Error> {
    std::fs::create_dir_all(dir)
        .map_err(|err| format_err!("unable to create block dir {:?} - {}", dir, err))?;

    let mut segments = SegmentWriter::with_segment_size(dir, segment_size)?;
    let mut index_series = Vec::with_capacity(series.len());
    let mut samples_per_series = Vec::with_capacity(series.len());

    for s in &series {
        let mut chunks = Vec::with_capacity(s.chunks.len());
        let mut samples = 0u64;
        for data in &s.chunks {
            let (chunk_ref, len) = segments.write(&data.chunk)?;
            chunks.push(ChunkMeta {
                min_time: data.min_time,
                max_time: data.max_time,
                chunk_ref,
                len,
            });
            samples += data.num_samples;
        }
        index_series.push(IndexSeries { labels: s.labels.clone(), chunks });
        samples_per_series.push(samples);
    }
    segments.finish()?;

    let (index_data, stats) = index::write_index(&index_series, &samples_per_series)?;
    crate::tools::file_set_contents(dir.join(INDEX_FILENAME), &index_data)?;

    meta.stats.num_series = stats.num_series;
    meta.stats.num_chunks = stats.num_chunks;
    meta.stats.num_samples = stats.num_samples;
    meta.write_to_dir(dir)?;

    Ok(meta)
}

/// Reader over a local block directory.
pub struct BlockReader {
    dir: PathBuf,
    meta: BlockMeta,
    index: IndexReader,
}

impl BlockReader {
    pub fn open(dir: &Path) -> Result<Self, Error> {
        let meta = BlockMeta::read_from_dir(dir)?;
        let index = IndexReader::open_file(&dir.join(INDEX_FILENAME))?;
        Ok(Self { dir: dir.to_owned(), meta, index })
    }

    pub fn meta(&self) -> &BlockMeta {
        &self.meta
    }

    pub fn index(&self) -> &IndexReader {
        &self.index
    }

    /// Load one chunk by its meta.
    pub fn chunk(&self, chunk_meta: &ChunkMeta) -> Result<Chunk, Error> {
        let path = self
            .dir
            .join(CHUNKS_DIRNAME)
            .join(format!("{:06}", chunk_meta.segment()));
        let mut file = File::open(&path)
            .map_err(|err| format_err!("unable to open segment {:?} - {}", path, err))?;
        file.seek(SeekFrom::Start(chunk_meta.offset() as u64))?;
        let mut record = vec![0u8; chunk_meta.len as usize];
        file.read_exact(&mut record)
            .map_err(|err| format_err!("short chunk read in {:?} - {}", path, err))?;
        let (chunk, _) = decode_chunk_record(&record)?;
        Ok(chunk)
    }

    /// All series with loaded chunk payloads, in label order.
    pub fn all_series_data(&self) -> Result<Vec<BlockSeries>, Error> {
        let mut out = Vec::new();
        for s in self.index.all_series()? {
            let mut chunks = Vec::with_capacity(s.chunks.len());
            for cm in &s.chunks {
                let chunk = self.chunk(cm)?;
                let num_samples = chunk.num_samples() as u64;
                chunks.push(ChunkData {
                    min_time: cm.min_time,
                    max_time: cm.max_time,
                    num_samples,
                    chunk,
                });
            }
            out.push(BlockSeries { labels: s.labels, chunks });
        }
        Ok(out)
    }
}

/// Generate a new block ULID from a millisecond timestamp.
pub fn new_block_id(timestamp_ms: u64) -> Ulid {
    Ulid::from_parts(timestamp_ms, rand::random())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::meta::SourceType;
    use crate::tsdb::chunkenc;

    fn sample_series(n: usize) -> Vec<BlockSeries> {
        (0..n)
            .map(|i| {
                let labels =
                    Labels::from_pairs(vec![("__name__", "up"), ("job", &format!("job-{:02}", i)[..])])
                        .unwrap();
                let samples: Vec<(i64, f64)> = (0..300).map(|s| (s * 1000, s as f64)).collect();
                BlockSeries { labels, chunks: cut_chunks(&samples).unwrap() }
            })
            .collect()
    }

    fn block_meta() -> BlockMeta {
        BlockMeta::new_level1(
            new_block_id(0),
            0,
            300_000,
            Labels::from_pairs(vec![("tenant", "t1")]).unwrap(),
            SourceType::Receiver,
        )
    }

    #[test]
    fn test_write_read_block() {
        let dir = tempfile::tempdir().unwrap();
        let series = sample_series(4);

        let meta = write_block(dir.path(), block_meta(), series.clone()).unwrap();
        assert_eq!(meta.stats.num_series, 4);
        assert_eq!(meta.stats.num_samples, 4 * 300);

        let reader = BlockReader::open(dir.path()).unwrap();
        assert_eq!(reader.meta().stats, meta.stats);

        let read_back = reader.all_series_data().unwrap();
        assert_eq!(read_back.len(), 4);
        for (got, want) in read_back.iter().zip(series.iter()) {
            assert_eq!(got.labels, want.labels);
            let got_samples: Vec<_> = got
                .chunks
                .iter()
                .flat_map(|c| chunkenc::decode_all(&c.chunk).unwrap())
                .collect();
            let want_samples: Vec<_> = want
                .chunks
                .iter()
                .flat_map(|c| chunkenc::decode_all(&c.chunk).unwrap())
                .collect();
            assert_eq!(got_samples, want_samples);
        }
    }

    #[test]
    fn test_segment_rollover() {
        let dir = tempfile::tempdir().unwrap();
        // tiny segment size forces one chunk per segment
        let meta = write_block_with_segment_size(dir.path(), block_meta(), sample_series(3), 64).unwrap();
        assert_eq!(meta.stats.num_series, 3);

        let segments: Vec<_> = std::fs::read_dir(dir.path().join(CHUNKS_DIRNAME))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert!(segments.len() > 1);
        assert!(segments.iter().any(|s| s == "000001"));

        // chunks remain readable across segment boundaries
        let reader = BlockReader::open(dir.path()).unwrap();
        assert_eq!(reader.all_series_data().unwrap().len(), 3);
    }

    #[test]
    fn test_chunk_crc_detects_corruption() {
        let chunk = chunkenc::encode_all(&[(0, 1.0), (1000, 2.0)]).unwrap();
        let mut record = Vec::new();
        record.extend_from_slice(&(chunk.data.len() as u32).to_le_bytes());
        record.push(chunk.encoding.as_u8());
        record.extend_from_slice(&chunk.data);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&record[4..]);
        record.extend_from_slice(&hasher.finalize().to_le_bytes());

        assert!(decode_chunk_record(&record).is_ok());
        record[7] ^= 0xff;
        assert!(decode_chunk_record(&record).is_err());
    }

    #[test]
    fn test_cut_chunks_bounds() {
        let samples: Vec<(i64, f64)> = (0..250).map(|i| (i * 10, 1.0)).collect();
        let chunks = cut_chunks(&samples).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].min_time, 0);
        assert_eq!(chunks[0].num_samples, 120);
        assert_eq!(chunks[2].num_samples, 10);
        assert_eq!(chunks[2].max_time, 2490);
    }

    #[test]
    fn test_block_ids_sort_by_time() {
        let a = new_block_id(1_000);
        let b = new_block_id(2_000);
        assert!(a < b);
    }
}
