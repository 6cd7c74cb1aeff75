//! Embedded single-node TSDB layer.
//!
//! Provides exactly the surface the platform needs from a local time-series
//! store: chunk encodings, the binary block index, block directory I/O, an
//! appendable in-memory head, compaction planning and block merging. The
//! directory layout it produces (`meta.json`, `index`, `chunks/NNNNNN`) is
//! the object layout uploaded to the bucket and is immutable once written.

pub mod block;
pub mod chunkenc;
pub mod head;
pub mod index;
pub mod merge;
pub mod planner;

pub use block::{BlockReader, BlockSeries, ChunkData};
pub use head::Head;
pub use index::{ChunkMeta, IndexReader, IndexSeries, SymbolTable};
pub use planner::Planner;
