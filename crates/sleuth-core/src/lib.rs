//! # sleuth-core
//! Shared types, archive reader and unspent-output tracker for Sleuth.

pub mod archive;
pub mod cancel;
pub mod chain_store;
pub mod constants;
pub mod error;
pub mod reader;
pub mod traits;
pub mod types;
pub mod utxo;
