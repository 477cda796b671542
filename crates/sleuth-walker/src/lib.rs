//! # sleuth-walker
//! Causal ordering of archived blocks: skipped-block cache, fork handling,
//! checkpoint resume and live tail.

pub mod checkpoint;
pub mod skipped;
pub mod walker;

pub use checkpoint::{plan_resume, ResumePoint};
pub use skipped::SkippedBlocks;
pub use walker::{ChainWalker, WalkOutcome, WalkPhase, WalkState, WalkerConfig};
