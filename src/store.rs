//! Block-aware StoreAPI serving: the storage gateway and its wire types.

pub mod chunk_pool;
pub mod gateway;
pub mod proto;

pub use chunk_pool::ChunkPool;
pub use gateway::{BucketStore, BucketStoreConfig, StoreError};
