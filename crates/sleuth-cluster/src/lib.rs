//! # sleuth-cluster
//! Address clustering over the causal chain.
//!
//! - **Disjoint-set forest**: union by rank with full path compression over
//!   address tokens, snapshot-able for durable storage.
//! - **CoinJoin filter**: equal-output mixes are excluded from merging.
//! - **Clustering engine**: a [`ChainVisitor`](sleuth_core::traits::ChainVisitor)
//!   applying the common-input-ownership rule per transaction.
//! - **Export**: `address,cluster` rows after flattening the forest.

pub mod coinjoin;
pub mod disjoint_set;
pub mod engine;
pub mod export;

pub use coinjoin::is_coinjoin;
pub use disjoint_set::DisjointSet;
pub use engine::{output_token, ClusterEngine, ClusterStats, ForestSink};
pub use export::write_clusters;
