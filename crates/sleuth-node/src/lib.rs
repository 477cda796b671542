//! # sleuth-node
//! RocksDB persistence and ingestion composition.
//!
//! - [`storage::RocksStore`]: applied blocks, height index, unspent-output
//!   mirror and forest snapshot backed by RocksDB
//! - [`ingest::Ingestor`]: wires archive, store, tracker, clustering engine
//!   and walker into one run
//! - [`config::IngestConfig`]: layered configuration

pub mod config;
pub mod ingest;
pub mod storage;

pub use config::IngestConfig;
pub use ingest::{IngestReport, Ingestor};
pub use storage::{RocksStore, StoredBlock};
