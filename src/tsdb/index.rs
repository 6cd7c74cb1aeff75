//! Binary block index.
//!
//! Layout (all integers little endian):
//!
//! ```text
//! header:   magic u32, version u8
//! symbols:  count u32, then per symbol len u32 + utf8 bytes, sorted
//! series:   sequence of records; a series ref is the absolute file offset
//!           of its record. record = payload_len u32, then:
//!             labels  count u16, per label (name_sym u32, value_sym u32)
//!             chunks  count u16, per chunk min_time i64, max_time i64,
//!                     ref u64, len u32
//! postings: per (name,value) entry count u32 + series refs u64, ascending;
//!           the entry under the empty name/value lists every series
//! table:    count u32, per entry name_sym u32, value_sym u32,
//!           offset u64, len u32
//! toc:      symbols_off u64, series_off u64, postings_off u64,
//!           table_off u64, crc32 u32 over the preceding 32 bytes
//! ```
//!
//! Postings entries and series records are self-contained byte ranges, which
//! is what lets the storage gateway fetch exactly the ranges it needs from
//! the object store and decode them against the symbol table held in the
//! index header.

use std::collections::{BTreeMap, BTreeSet};
use std::convert::TryInto;

use anyhow::{bail, format_err, Error};

use crate::labels::{Label, Labels};

pub const INDEX_MAGIC: u32 = 0x4344_4943; // "CIDC"
pub const INDEX_VERSION: u8 = 1;
pub const TOC_LEN: usize = 4 * 8 + 4;

/// Reference to one encoded chunk inside the block's segment files.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkMeta {
    pub min_time: i64,
    pub max_time: i64,
    /// `(segment << 32) | offset` into `chunks/NNNNNN`
    pub chunk_ref: u64,
    pub len: u32,
}

impl ChunkMeta {
    pub fn segment(&self) -> u32 {
        (self.chunk_ref >> 32) as u32
    }

    pub fn offset(&self) -> u32 {
        (self.chunk_ref & 0xffff_ffff) as u32
    }
}

/// One indexed series: label set plus time-ordered chunk references.
#[derive(Clone, Debug)]
pub struct IndexSeries {
    pub labels: Labels,
    pub chunks: Vec<ChunkMeta>,
}

/// Sorted symbol table shared by index and index header.
#[derive(Clone, Debug, Default)]
pub struct SymbolTable(Vec<String>);

impl SymbolTable {
    pub fn new(symbols: Vec<String>) -> Self {
        Self(symbols)
    }

    pub fn lookup(&self, sym: u32) -> Result<&str, Error> {
        self.0
            .get(sym as usize)
            .map(|s| s.as_str())
            .ok_or_else(|| format_err!("symbol reference {} out of range", sym))
    }

    pub fn reference(&self, s: &str) -> Result<u32, Error> {
        self.0
            .binary_search_by(|probe| probe.as_str().cmp(s))
            .map(|idx| idx as u32)
            .map_err(|_| format_err!("string '{}' not in symbol table", s))
    }

    pub fn iter(&self) -> std::slice::Iter<String> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Postings offset table entry: the exact byte range of one postings list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PostingsOffset {
    pub name: String,
    pub value: String,
    pub offset: u64,
    pub len: u32,
}

/// Counts gathered while writing an index, fed into block meta stats.
#[derive(Clone, Copy, Debug, Default)]
pub struct IndexStats {
    pub num_series: u64,
    pub num_chunks: u64,
    pub num_samples: u64,
}

struct Cursor {
    buf: Vec<u8>,
}

impl Cursor {
    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn pos(&self) -> u64 {
        self.buf.len() as u64
    }
}

/// Serialize a block index. `series` must be sorted ascending by label set
/// with no duplicates; chunk sample counts go into the returned stats.
pub fn write_index(series: &[IndexSeries], samples_per_chunk: &[u64]) -> Result<(Vec<u8>, IndexStats), Error> {
    for window in series.windows(2) {
        if window[0].labels >= window[1].labels {
            bail!("series out of order in index writer");
        }
    }

    // symbol table: all names and values plus the all-postings sentinel
    let mut symbol_set: BTreeSet<&str> = BTreeSet::new();
    symbol_set.insert("");
    for s in series {
        for label in s.labels.iter() {
            symbol_set.insert(&label.name);
            symbol_set.insert(&label.value);
        }
    }
    let symbols = SymbolTable::new(symbol_set.iter().map(|s| s.to_string()).collect());

    let mut cur = Cursor { buf: Vec::new() };
    cur.u32(INDEX_MAGIC);
    cur.buf.push(INDEX_VERSION);

    let symbols_off = cur.pos();
    cur.u32(symbols.len() as u32);
    for sym in symbols.iter() {
        cur.u32(sym.len() as u32);
        cur.buf.extend_from_slice(sym.as_bytes());
    }

    // series records; collect postings as we go
    let series_off = cur.pos();
    let mut postings: BTreeMap<(u32, u32), Vec<u64>> = BTreeMap::new();
    let all_key = (symbols.reference("")?, symbols.reference("")?);
    let mut stats = IndexStats::default();

    for (i, s) in series.iter().enumerate() {
        let series_ref = cur.pos();

        let mut payload = Cursor { buf: Vec::new() };
        payload.u16(s.labels.len() as u16);
        for label in s.labels.iter() {
            payload.u32(symbols.reference(&label.name)?);
            payload.u32(symbols.reference(&label.value)?);
        }
        payload.u16(s.chunks.len() as u16);
        for chunk in &s.chunks {
            payload.i64(chunk.min_time);
            payload.i64(chunk.max_time);
            payload.u64(chunk.chunk_ref);
            payload.u32(chunk.len);
        }

        cur.u32(payload.buf.len() as u32);
        cur.buf.extend_from_slice(&payload.buf);

        postings.entry(all_key).or_default().push(series_ref);
        for label in s.labels.iter() {
            let key = (symbols.reference(&label.name)?, symbols.reference(&label.value)?);
            postings.entry(key).or_default().push(series_ref);
        }

        stats.num_series += 1;
        stats.num_chunks += s.chunks.len() as u64;
        if let Some(n) = samples_per_chunk.get(i) {
            stats.num_samples += n;
        }
    }

    let postings_off = cur.pos();
    let mut table: Vec<(u32, u32, u64, u32)> = Vec::with_capacity(postings.len());
    for (&(name_sym, value_sym), refs) in &postings {
        let entry_off = cur.pos();
        cur.u32(refs.len() as u32);
        for &r in refs {
            cur.u64(r);
        }
        let entry_len = (cur.pos() - entry_off) as u32;
        table.push((name_sym, value_sym, entry_off, entry_len));
    }

    let table_off = cur.pos();
    cur.u32(table.len() as u32);
    for (name_sym, value_sym, off, len) in table {
        cur.u32(name_sym);
        cur.u32(value_sym);
        cur.u64(off);
        cur.u32(len);
    }

    let toc_start = cur.buf.len();
    cur.u64(symbols_off);
    cur.u64(series_off);
    cur.u64(postings_off);
    cur.u64(table_off);
    let crc = {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&cur.buf[toc_start..toc_start + 32]);
        hasher.finalize()
    };
    cur.u32(crc);

    Ok((cur.buf, stats))
}

/// Table of contents read back from the end of an index file.
#[derive(Clone, Copy, Debug)]
pub struct Toc {
    pub symbols_off: u64,
    pub series_off: u64,
    pub postings_off: u64,
    pub table_off: u64,
}

impl Toc {
    /// Parse the TOC from the trailing `TOC_LEN` bytes of the index.
    pub fn decode(trailer: &[u8]) -> Result<Toc, Error> {
        if trailer.len() != TOC_LEN {
            bail!("index TOC has wrong length {}", trailer.len());
        }
        let crc_stored = u32::from_le_bytes(trailer[32..36].try_into().unwrap());
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&trailer[..32]);
        if hasher.finalize() != crc_stored {
            bail!("index TOC checksum mismatch");
        }
        Ok(Toc {
            symbols_off: u64::from_le_bytes(trailer[0..8].try_into().unwrap()),
            series_off: u64::from_le_bytes(trailer[8..16].try_into().unwrap()),
            postings_off: u64::from_le_bytes(trailer[16..24].try_into().unwrap()),
            table_off: u64::from_le_bytes(trailer[24..32].try_into().unwrap()),
        })
    }
}

fn read_u32(data: &[u8], pos: &mut usize) -> Result<u32, Error> {
    if *pos + 4 > data.len() {
        bail!("index truncated at offset {}", pos);
    }
    let v = u32::from_le_bytes(data[*pos..*pos + 4].try_into().unwrap());
    *pos += 4;
    Ok(v)
}

fn read_u16(data: &[u8], pos: &mut usize) -> Result<u16, Error> {
    if *pos + 2 > data.len() {
        bail!("index truncated at offset {}", pos);
    }
    let v = u16::from_le_bytes(data[*pos..*pos + 2].try_into().unwrap());
    *pos += 2;
    Ok(v)
}

fn read_u64(data: &[u8], pos: &mut usize) -> Result<u64, Error> {
    if *pos + 8 > data.len() {
        bail!("index truncated at offset {}", pos);
    }
    let v = u64::from_le_bytes(data[*pos..*pos + 8].try_into().unwrap());
    *pos += 8;
    Ok(v)
}

fn read_i64(data: &[u8], pos: &mut usize) -> Result<i64, Error> {
    Ok(read_u64(data, pos)? as i64)
}

/// Decode the symbol section starting at the given offset.
pub fn decode_symbols(data: &[u8], symbols_off: u64) -> Result<SymbolTable, Error> {
    let mut pos = symbols_off as usize;
    let count = read_u32(data, &mut pos)? as usize;
    let mut symbols = Vec::with_capacity(count);
    for _ in 0..count {
        let len = read_u32(data, &mut pos)? as usize;
        if pos + len > data.len() {
            bail!("index symbol table truncated");
        }
        symbols.push(String::from_utf8(data[pos..pos + len].to_vec())?);
        pos += len;
    }
    Ok(SymbolTable::new(symbols))
}

/// Decode the postings offset table section.
pub fn decode_postings_table(
    data: &[u8],
    table_off: u64,
    symbols: &SymbolTable,
) -> Result<Vec<PostingsOffset>, Error> {
    let mut pos = table_off as usize;
    let count = read_u32(data, &mut pos)? as usize;
    let mut table = Vec::with_capacity(count);
    for _ in 0..count {
        let name_sym = read_u32(data, &mut pos)?;
        let value_sym = read_u32(data, &mut pos)?;
        let offset = read_u64(data, &mut pos)?;
        let len = read_u32(data, &mut pos)?;
        table.push(PostingsOffset {
            name: symbols.lookup(name_sym)?.to_string(),
            value: symbols.lookup(value_sym)?.to_string(),
            offset,
            len,
        });
    }
    Ok(table)
}

/// Decode one postings entry fetched as an exact byte range.
pub fn decode_postings(bytes: &[u8]) -> Result<Vec<u64>, Error> {
    let mut pos = 0usize;
    let count = read_u32(bytes, &mut pos)? as usize;
    if bytes.len() < pos + count * 8 {
        bail!("postings entry truncated");
    }
    let mut refs = Vec::with_capacity(count);
    for _ in 0..count {
        refs.push(read_u64(bytes, &mut pos)?);
    }
    Ok(refs)
}

/// Decode a series record. `bytes` must start at the record's length field
/// and may extend past its end (range reads over-fetch). Returns the series
/// and the total encoded record length.
pub fn decode_series(bytes: &[u8], symbols: &SymbolTable) -> Result<(IndexSeries, usize), Error> {
    let mut pos = 0usize;
    let payload_len = read_u32(bytes, &mut pos)? as usize;
    if bytes.len() < pos + payload_len {
        bail!("series record truncated");
    }

    let labels_count = read_u16(bytes, &mut pos)? as usize;
    let mut labels = Vec::with_capacity(labels_count);
    for _ in 0..labels_count {
        let name_sym = read_u32(bytes, &mut pos)?;
        let value_sym = read_u32(bytes, &mut pos)?;
        labels.push(Label::new(symbols.lookup(name_sym)?, symbols.lookup(value_sym)?));
    }

    let chunks_count = read_u16(bytes, &mut pos)? as usize;
    let mut chunks = Vec::with_capacity(chunks_count);
    for _ in 0..chunks_count {
        let min_time = read_i64(bytes, &mut pos)?;
        let max_time = read_i64(bytes, &mut pos)?;
        let chunk_ref = read_u64(bytes, &mut pos)?;
        let len = read_u32(bytes, &mut pos)?;
        chunks.push(ChunkMeta { min_time, max_time, chunk_ref, len });
    }

    Ok((
        IndexSeries { labels: Labels::new(labels)?, chunks },
        4 + payload_len,
    ))
}

/// Whole-index reader over an in-memory or local file copy. The compactor
/// and the verification pass use this; the gateway reads ranges instead.
pub struct IndexReader {
    data: Vec<u8>,
    toc: Toc,
    symbols: SymbolTable,
    table: Vec<PostingsOffset>,
}

impl IndexReader {
    pub fn open(data: Vec<u8>) -> Result<Self, Error> {
        if data.len() < TOC_LEN + 5 {
            bail!("index too small ({} bytes)", data.len());
        }
        let mut pos = 0usize;
        let magic = read_u32(&data, &mut pos)?;
        if magic != INDEX_MAGIC {
            bail!("invalid index magic {:#x}", magic);
        }
        if data[4] != INDEX_VERSION {
            bail!("unsupported index version {}", data[4]);
        }
        let toc = Toc::decode(&data[data.len() - TOC_LEN..])?;
        let symbols = decode_symbols(&data, toc.symbols_off)?;
        let table = decode_postings_table(&data, toc.table_off, &symbols)?;
        Ok(Self { data, toc, symbols, table })
    }

    pub fn open_file(path: &std::path::Path) -> Result<Self, Error> {
        let data = std::fs::read(path)
            .map_err(|err| format_err!("unable to read index {:?} - {}", path, err))?;
        Self::open(data)
    }

    pub fn toc(&self) -> Toc {
        self.toc
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn postings_table(&self) -> &[PostingsOffset] {
        &self.table
    }

    /// Series refs carrying `name=value`; empty when the pair is not indexed.
    pub fn postings(&self, name: &str, value: &str) -> Result<Vec<u64>, Error> {
        match self
            .table
            .iter()
            .find(|e| e.name == name && e.value == value)
        {
            Some(entry) => {
                let start = entry.offset as usize;
                let end = start + entry.len as usize;
                if end > self.data.len() {
                    bail!("postings range out of bounds");
                }
                decode_postings(&self.data[start..end])
            }
            None => Ok(Vec::new()),
        }
    }

    /// All series refs in the block.
    pub fn all_postings(&self) -> Result<Vec<u64>, Error> {
        self.postings("", "")
    }

    pub fn series_at(&self, series_ref: u64) -> Result<IndexSeries, Error> {
        let start = series_ref as usize;
        if start >= self.data.len() {
            bail!("series ref {} out of bounds", series_ref);
        }
        decode_series(&self.data[start..], &self.symbols).map(|(s, _)| s)
    }

    /// Iterate every series in storage order.
    pub fn all_series(&self) -> Result<Vec<IndexSeries>, Error> {
        self.all_postings()?
            .into_iter()
            .map(|r| self.series_at(r))
            .collect()
    }

    pub fn label_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .table
            .iter()
            .filter(|e| !e.name.is_empty())
            .map(|e| e.name.clone())
            .collect();
        names.dedup();
        names
    }

    pub fn label_values(&self, name: &str) -> Vec<String> {
        self.table
            .iter()
            .filter(|e| e.name == name)
            .map(|e| e.value.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_series() -> Vec<IndexSeries> {
        let mk = |pairs: &[(&str, &str)], chunks: Vec<ChunkMeta>| IndexSeries {
            labels: Labels::from_pairs(pairs.to_vec()).unwrap(),
            chunks,
        };
        let chunk = |min, max, r| ChunkMeta { min_time: min, max_time: max, chunk_ref: r, len: 100 };
        vec![
            mk(&[("a", "1"), ("b", "1")], vec![chunk(0, 999, 1 << 32)]),
            mk(&[("a", "1"), ("b", "2")], vec![chunk(0, 999, (1 << 32) | 108)]),
            mk(&[("a", "2"), ("b", "1")], vec![chunk(0, 500, (1 << 32) | 216), chunk(500, 999, (1 << 32) | 324)]),
        ]
    }

    #[test]
    fn test_write_read_roundtrip() {
        let series = test_series();
        let (data, stats) = write_index(&series, &[100, 100, 200]).unwrap();
        assert_eq!(stats.num_series, 3);
        assert_eq!(stats.num_chunks, 4);
        assert_eq!(stats.num_samples, 400);

        let reader = IndexReader::open(data).unwrap();
        assert_eq!(reader.all_postings().unwrap().len(), 3);

        let a1 = reader.postings("a", "1").unwrap();
        assert_eq!(a1.len(), 2);
        let decoded = reader.series_at(a1[0]).unwrap();
        assert_eq!(decoded.labels, series[0].labels);
        assert_eq!(decoded.chunks, series[0].chunks);

        // storage order equals label lex order
        let all = reader.all_series().unwrap();
        let labels: Vec<_> = all.iter().map(|s| s.labels.clone()).collect();
        let mut sorted = labels.clone();
        sorted.sort();
        assert_eq!(labels, sorted);
    }

    #[test]
    fn test_label_lookup() {
        let (data, _) = write_index(&test_series(), &[0, 0, 0]).unwrap();
        let reader = IndexReader::open(data).unwrap();

        assert_eq!(reader.label_names(), vec!["a", "b"]);
        assert_eq!(reader.label_values("a"), vec!["1", "2"]);
        assert_eq!(reader.label_values("missing"), Vec::<String>::new());
        assert!(reader.postings("a", "3").unwrap().is_empty());
    }

    #[test]
    fn test_out_of_order_series_rejected() {
        let mut series = test_series();
        series.swap(0, 2);
        assert!(write_index(&series, &[0, 0, 0]).is_err());
    }

    #[test]
    fn test_corrupt_toc_detected() {
        let (mut data, _) = write_index(&test_series(), &[0, 0, 0]).unwrap();
        let len = data.len();
        data[len - 10] ^= 0xff;
        assert!(IndexReader::open(data).is_err());
    }

    #[test]
    fn test_ranged_decode_matches_full_reader() {
        // simulate the gateway path: TOC + symbols + table from ranges,
        // then exact postings and series ranges
        let (data, _) = write_index(&test_series(), &[0, 0, 0]).unwrap();
        let toc = Toc::decode(&data[data.len() - TOC_LEN..]).unwrap();
        let symbols = decode_symbols(&data, toc.symbols_off).unwrap();
        let table = decode_postings_table(&data, toc.table_off, &symbols).unwrap();

        let entry = table.iter().find(|e| e.name == "b" && e.value == "1").unwrap();
        let refs =
            decode_postings(&data[entry.offset as usize..(entry.offset + entry.len as u64) as usize])
                .unwrap();
        assert_eq!(refs.len(), 2);

        let (series, _) = decode_series(&data[refs[0] as usize..], &symbols).unwrap();
        assert_eq!(series.labels.get("b"), Some("1"));
    }
}
