//! Cairn turns independent single-node TSDB instances into a horizontally
//! scalable metrics cluster: remote-write ingestion with hashring
//! replication, durable block storage in an object store, continuous
//! compaction and downsampling, and cross-shard query federation.
//!
//! The block is the universal currency. Every component produces,
//! transforms, serves or deletes blocks:
//!
//! ```text
//! receiver -> local tsdb -> shipper -> bucket -> compactor -> bucket
//!                                         |                     |
//!                                         +-----> gateway <-----+
//!                                                    |
//!                                               federator -> engine
//! ```

pub mod block;
pub mod compact;
pub mod labels;
pub mod objstore;
pub mod query;
pub mod receive;
pub mod server;
pub mod shipper;
pub mod store;
pub mod tools;
pub mod tsdb;
