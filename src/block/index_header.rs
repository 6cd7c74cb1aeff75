//! Precomputed binary index header.
//!
//! The header carries everything the gateway needs to plan ranged index
//! reads without touching the full index: the symbol table, per-label-name
//! sorted value lists and the byte range of every postings list. It is
//! built from three ranged reads against the block index (TOC, symbols,
//! postings offset table) and stored beside the block as
//! `index-header.bin`.

use std::collections::BTreeMap;
use std::convert::TryInto;

use anyhow::{bail, format_err, Error};
use bytes::Bytes;
use ulid::Ulid;

use super::meta;
use crate::objstore::ObjectBucket;
use crate::tsdb::index::{self, PostingsOffset, SymbolTable, Toc, TOC_LEN};

const HEADER_MAGIC: u32 = 0x4448_4943; // "CIHD"
const HEADER_VERSION: u8 = 1;

pub struct IndexHeader {
    symbols: SymbolTable,
    label_values: BTreeMap<String, Vec<String>>,
    postings: BTreeMap<(String, String), (u64, u32)>,
    /// byte range of the series record section in the index
    series_section: (u64, u64),
}

impl IndexHeader {
    fn from_parts(symbols: SymbolTable, table: Vec<PostingsOffset>, series_section: (u64, u64)) -> Self {
        let mut label_values: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut postings = BTreeMap::new();
        for entry in table {
            if !entry.name.is_empty() {
                label_values
                    .entry(entry.name.clone())
                    .or_default()
                    .push(entry.value.clone());
            }
            postings.insert((entry.name, entry.value), (entry.offset, entry.len));
        }
        // table iteration is (name, value) ordered, values arrive sorted
        Self { symbols, label_values, postings, series_section }
    }

    /// Build from a fully loaded index (compactor side).
    pub fn from_index_reader(reader: &index::IndexReader) -> Self {
        let toc = reader.toc();
        Self::from_parts(
            reader.symbols().clone(),
            reader.postings_table().to_vec(),
            (toc.series_off, toc.postings_off),
        )
    }

    /// Build via ranged reads against the block's index object.
    pub async fn build_from_bucket(bucket: &dyn ObjectBucket, id: Ulid) -> Result<Self, Error> {
        let index_name = meta::index_name(id);
        let size = bucket.object_size(&index_name).await?;
        if (size as usize) < TOC_LEN {
            bail!("block {}: index too small ({} bytes)", id, size);
        }

        let trailer = bucket
            .get_range(&index_name, size - TOC_LEN as u64, TOC_LEN as i64)
            .await?;
        let toc = Toc::decode(&trailer)?;

        if toc.symbols_off >= toc.series_off || toc.table_off as usize + TOC_LEN > size as usize {
            bail!("block {}: corrupt index TOC offsets", id);
        }

        let symbols_raw = bucket
            .get_range(
                &index_name,
                toc.symbols_off,
                (toc.series_off - toc.symbols_off) as i64,
            )
            .await?;
        let symbols = index::decode_symbols(&symbols_raw, 0)?;

        let table_raw = bucket
            .get_range(
                &index_name,
                toc.table_off,
                (size - TOC_LEN as u64 - toc.table_off) as i64,
            )
            .await?;
        // entry offsets in the table are absolute; decoding needs no base
        let table = index::decode_postings_table(&table_raw, 0, &symbols)?;

        Ok(Self::from_parts(
            symbols,
            table,
            (toc.series_off, toc.postings_off),
        ))
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// Byte range `[start, end)` of the series records in the index.
    pub fn series_section(&self) -> (u64, u64) {
        self.series_section
    }

    /// Byte range `[offset, offset+len)` of one postings list in the index.
    pub fn postings_range(&self, name: &str, value: &str) -> Option<(u64, u32)> {
        self.postings
            .get(&(name.to_string(), value.to_string()))
            .copied()
    }

    /// Range of the all-series postings list.
    pub fn all_postings_range(&self) -> Option<(u64, u32)> {
        self.postings_range("", "")
    }

    pub fn label_names(&self) -> Vec<String> {
        self.label_values.keys().cloned().collect()
    }

    /// Sorted values of one label name; empty when unknown.
    pub fn label_values(&self, name: &str) -> &[String] {
        self.label_values
            .get(name)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&HEADER_MAGIC.to_le_bytes());
        buf.push(HEADER_VERSION);
        buf.extend_from_slice(&self.series_section.0.to_le_bytes());
        buf.extend_from_slice(&self.series_section.1.to_le_bytes());

        buf.extend_from_slice(&(self.symbols.len() as u32).to_le_bytes());
        for sym in self.symbols.iter() {
            buf.extend_from_slice(&(sym.len() as u32).to_le_bytes());
            buf.extend_from_slice(sym.as_bytes());
        }

        buf.extend_from_slice(&(self.postings.len() as u32).to_le_bytes());
        for ((name, value), (offset, len)) in &self.postings {
            write_str(&mut buf, name);
            write_str(&mut buf, value);
            buf.extend_from_slice(&offset.to_le_bytes());
            buf.extend_from_slice(&len.to_le_bytes());
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        let mut pos = 0usize;
        if data.len() < 5 || u32::from_le_bytes(data[0..4].try_into().unwrap()) != HEADER_MAGIC {
            bail!("invalid index header magic");
        }
        if data[4] != HEADER_VERSION {
            bail!("unsupported index header version {}", data[4]);
        }
        pos += 5;
        let series_start = read_u64(data, &mut pos)?;
        let series_end = read_u64(data, &mut pos)?;

        let count = read_u32(data, &mut pos)? as usize;
        let mut symbols = Vec::with_capacity(count);
        for _ in 0..count {
            symbols.push(read_str(data, &mut pos)?);
        }
        let symbols = SymbolTable::new(symbols);

        let count = read_u32(data, &mut pos)? as usize;
        let mut table = Vec::with_capacity(count);
        for _ in 0..count {
            let name = read_str(data, &mut pos)?;
            let value = read_str(data, &mut pos)?;
            let offset = read_u64(data, &mut pos)?;
            let len = read_u32(data, &mut pos)?;
            table.push(PostingsOffset { name, value, offset, len });
        }

        Ok(Self::from_parts(symbols, table, (series_start, series_end)))
    }
}

fn write_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn read_u32(data: &[u8], pos: &mut usize) -> Result<u32, Error> {
    if *pos + 4 > data.len() {
        bail!("index header truncated");
    }
    let v = u32::from_le_bytes(data[*pos..*pos + 4].try_into().unwrap());
    *pos += 4;
    Ok(v)
}

fn read_u64(data: &[u8], pos: &mut usize) -> Result<u64, Error> {
    if *pos + 8 > data.len() {
        bail!("index header truncated");
    }
    let v = u64::from_le_bytes(data[*pos..*pos + 8].try_into().unwrap());
    *pos += 8;
    Ok(v)
}

fn read_str(data: &[u8], pos: &mut usize) -> Result<String, Error> {
    let len = read_u32(data, pos)? as usize;
    if *pos + len > data.len() {
        bail!("index header truncated");
    }
    let s = String::from_utf8(data[*pos..*pos + len].to_vec())
        .map_err(|err| format_err!("index header holds invalid utf8 - {}", err))?;
    *pos += len;
    Ok(s)
}

/// Load the block's header from the bucket, building and uploading it on
/// first use.
pub async fn ensure_header(bucket: &dyn ObjectBucket, id: Ulid) -> Result<IndexHeader, Error> {
    let name = meta::index_header_name(id);
    match bucket.get(&name).await {
        Ok(data) => return IndexHeader::decode(&data),
        Err(err) if err.is_not_found() => {}
        Err(err) => return Err(err.into()),
    }

    let header = IndexHeader::build_from_bucket(bucket, id).await?;
    // best effort: a lost upload just means the next reader rebuilds
    if let Err(err) = bucket.upload(&name, Bytes::from(header.encode())).await {
        log::warn!("block {}: unable to upload index header - {}", id, err);
    }
    Ok(header)
}
