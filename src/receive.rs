//! Remote-write ingestion: hashring routing, replication, local TSDB
//! append.

pub mod handler;
pub mod hashring;
pub mod writer;

pub use handler::{HttpForwarder, Receiver, ReceiverConfig, WriteError};
pub use hashring::{Hashring, HashringEntry, HashringWatcher};
pub use writer::TsdbWriter;
