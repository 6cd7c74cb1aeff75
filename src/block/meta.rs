//! Block metadata (`meta.json`) and deletion marks.
//!
//! The meta file is committed last when a block is uploaded; a block without
//! a readable meta is treated as not yet visible everywhere in the system.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, format_err, Error};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::labels::Labels;
use crate::tools;

pub const META_FILENAME: &str = "meta.json";
pub const INDEX_FILENAME: &str = "index";
pub const CHUNKS_DIRNAME: &str = "chunks";
pub const INDEX_HEADER_FILENAME: &str = "index-header.bin";
pub const DELETION_MARK_FILENAME: &str = "deletion-mark.json";

pub const META_VERSION: u32 = 1;
pub const DELETION_MARK_VERSION: u32 = 1;

/// Downsampling resolution in milliseconds.
pub const RES_RAW: i64 = 0;
pub const RES_5M: i64 = 300_000;
pub const RES_1H: i64 = 3_600_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceType {
    #[serde(rename = "sidecar")]
    Sidecar,
    #[serde(rename = "receiver")]
    Receiver,
    #[serde(rename = "compactor")]
    Compactor,
    #[serde(rename = "ruler")]
    Ruler,
    #[serde(rename = "bucket.repair")]
    BucketRepair,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockStats {
    #[serde(default)]
    pub num_samples: u64,
    #[serde(default)]
    pub num_series: u64,
    #[serde(default)]
    pub num_chunks: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockCompaction {
    pub level: u32,
    pub sources: Vec<Ulid>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<Ulid>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Downsample {
    pub resolution: i64,
}

/// Shard-identity extension section of the block meta.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMeta {
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub downsample: Downsample,
    pub source: SourceType,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockMeta {
    pub version: u32,
    pub ulid: Ulid,
    pub min_time: i64,
    pub max_time: i64,
    #[serde(default)]
    pub stats: BlockStats,
    pub compaction: BlockCompaction,
    pub cairn: ShardMeta,
}

impl BlockMeta {
    /// Fresh level-1 meta for a block sealed out of an in-memory head.
    pub fn new_level1(
        ulid: Ulid,
        min_time: i64,
        max_time: i64,
        labels: Labels,
        source: SourceType,
    ) -> Self {
        Self {
            version: META_VERSION,
            ulid,
            min_time,
            max_time,
            stats: BlockStats::default(),
            compaction: BlockCompaction {
                level: 1,
                sources: vec![ulid],
                parents: Vec::new(),
            },
            cairn: ShardMeta {
                labels: labels.into(),
                downsample: Downsample { resolution: RES_RAW },
                source,
            },
        }
    }

    pub fn external_labels(&self) -> Labels {
        self.cairn.labels.clone().into()
    }

    pub fn resolution(&self) -> i64 {
        self.cairn.downsample.resolution
    }

    /// Half-open `[min_time, max_time)` overlap with the given range.
    pub fn overlaps(&self, min_time: i64, max_time: i64) -> bool {
        self.min_time < max_time && min_time < self.max_time
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.version != META_VERSION {
            bail!("unsupported meta version {}", self.version);
        }
        if self.min_time > self.max_time {
            bail!(
                "block {}: min time {} after max time {}",
                self.ulid,
                self.min_time,
                self.max_time
            );
        }
        if self.compaction.level == 0 {
            bail!("block {}: compaction level 0", self.ulid);
        }
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        let meta: BlockMeta = serde_json::from_slice(data)?;
        meta.validate()?;
        Ok(meta)
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let mut data = serde_json::to_vec_pretty(self)?;
        data.push(b'\n');
        Ok(data)
    }

    /// Read `<dir>/meta.json`.
    pub fn read_from_dir(dir: &Path) -> Result<Self, Error> {
        let path = dir.join(META_FILENAME);
        let data = std::fs::read(&path)
            .map_err(|err| format_err!("unable to read {:?} - {}", path, err))?;
        Self::decode(&data)
    }

    /// Atomically write `<dir>/meta.json`. This is the local block finalize
    /// step; everything else under the block dir must exist already.
    pub fn write_to_dir(&self, dir: &Path) -> Result<(), Error> {
        tools::file_set_contents(dir.join(META_FILENAME), &self.encode()?)
    }
}

/// Marker object scheduling a block for deletion after a grace period.
/// The block stays readable until the compactor erases it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionMark {
    pub id: Ulid,
    /// unix seconds
    pub deletion_time: i64,
    pub version: u32,
}

impl DeletionMark {
    pub fn new(id: Ulid, deletion_time: i64) -> Self {
        Self { id, deletion_time, version: DELETION_MARK_VERSION }
    }

    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        let mark: DeletionMark = serde_json::from_slice(data)?;
        if mark.version != DELETION_MARK_VERSION {
            bail!("unsupported deletion mark version {}", mark.version);
        }
        Ok(mark)
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Object names under one block prefix.
pub fn meta_name(id: Ulid) -> String {
    format!("{}/{}", id, META_FILENAME)
}

pub fn index_name(id: Ulid) -> String {
    format!("{}/{}", id, INDEX_FILENAME)
}

pub fn index_header_name(id: Ulid) -> String {
    format!("{}/{}", id, INDEX_HEADER_FILENAME)
}

pub fn chunk_segment_name(id: Ulid, segment: u32) -> String {
    format!("{}/{}/{:06}", id, CHUNKS_DIRNAME, segment)
}

pub fn deletion_mark_name(id: Ulid) -> String {
    format!("{}/{}", id, DELETION_MARK_FILENAME)
}
