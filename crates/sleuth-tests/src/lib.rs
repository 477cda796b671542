//! End-to-end test suite for Sleuth.
//!
//! Builds real consensus-encoded regtest chains, lays them out as
//! `blkNNNNN.dat` archives in arbitrary order, and checks causal ordering,
//! resume and clustering through the public crates.

pub mod helpers;
