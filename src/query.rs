//! Query federation: fan-out over StoreAPI endpoints, merge, replica
//! deduplication.

pub mod client;
pub mod dedup;
pub mod federator;

pub use client::HttpStoreClient;
pub use dedup::DedupIterator;
pub use federator::{QueryFederator, QuerySeries, SelectOptions, StoreClient};
