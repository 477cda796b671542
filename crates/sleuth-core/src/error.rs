//! Error types for Sleuth.
use bitcoin::{BlockHash, Txid};
use thiserror::Error;

/// Outcome of reading one record out of an archive region.
///
/// `EndOfRegion` and `IncompleteRegion` are expected stop conditions, not
/// failures; see [`ReadError::is_end_of_region`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    #[error("end of region")] EndOfRegion,
    #[error("unwritten padding from offset {offset}")] IncompleteRegion { offset: usize },
    #[error("framing error at offset {offset}: {reason}")] Framing { offset: usize, reason: String },
    #[error("decode error at offset {offset}: {reason}")] Decode { offset: usize, reason: String },
}

impl ReadError {
    /// Whether this error only signals that the region has nothing more to give.
    pub fn is_end_of_region(&self) -> bool {
        matches!(self, Self::EndOfRegion | Self::IncompleteRegion { .. })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalkError {
    #[error("too many skipped blocks: bound {bound} exceeded at height {height} awaiting {awaiting}")]
    TooManySkipped { bound: usize, awaiting: BlockHash, height: u64 },
    #[error("checkpoint not found in archive: height {height} hash {hash}")]
    CheckpointNotFound { height: u64, hash: BlockHash },
    #[error("fork contender {hash} no longer held in skipped cache")]
    ForkContenderMissing { hash: BlockHash },
    #[error("archive region {region}: {source}")]
    Archive { region: u32, source: ReadError },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UtxoError {
    #[error("unspent output not found: {txid}:{}", index_label(.index))]
    NotFound { txid: Txid, index: Option<u32> },
    #[error("utxo mirror: {0}")] Mirror(String),
}

fn index_label(index: &Option<u32>) -> String {
    index.map_or_else(|| "*".to_string(), |i| i.to_string())
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    #[error("unknown token: {0}")] UnknownToken(String),
    #[error("unknown forest index: {0}")] UnknownIndex(usize),
    #[error("corrupt forest snapshot: {0}")] CorruptSnapshot(String),
}

#[derive(Error, Debug)]
pub enum SleuthError {
    #[error(transparent)] Read(#[from] ReadError),
    #[error(transparent)] Walk(#[from] WalkError),
    #[error(transparent)] Utxo(#[from] UtxoError),
    #[error(transparent)] Cluster(#[from] ClusterError),
    #[error("storage: {0}")] Storage(String),
    #[error("io: {0}")] Io(String),
    #[error("config: {0}")] Config(String),
}

impl From<std::io::Error> for SleuthError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
