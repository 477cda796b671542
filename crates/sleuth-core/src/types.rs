//! Block types passed between the archive, the walker and visitors.
//!
//! A [`ParsedBlock`] is what the archive yields: decoded, hashed, located,
//! but without a height. The walker turns it into an [`AppliedBlock`] once
//! it is causally placed.

use std::fmt;

use bitcoin::hashes::Hash;
use bitcoin::{Block, BlockHash, Transaction, Txid};
use serde::{Deserialize, Serialize};

/// Address token extracted from an output's locking script.
pub type Token = String;

/// Position of a block record inside the archive.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockLocation {
    /// Region (file) index, `blkNNNNN.dat`.
    pub region: u32,
    /// Byte offset of the record's magic within the region.
    pub offset: u64,
}

impl fmt::Display for BlockLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blk{:05}.dat+{}", self.region, self.offset)
    }
}

/// A block read from the archive whose place in the chain is not yet decided.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedBlock {
    pub hash: BlockHash,
    pub block: Block,
    pub location: BlockLocation,
}

impl ParsedBlock {
    pub fn new(block: Block, location: BlockLocation) -> Self {
        Self {
            hash: block.block_hash(),
            block,
            location,
        }
    }

    /// Hash of the parent this block declares.
    pub fn prev_hash(&self) -> BlockHash {
        self.block.header.prev_blockhash
    }
}

/// A block placed in causal order, carrying the height the walker assigned.
#[derive(Clone, Debug, PartialEq)]
pub struct AppliedBlock {
    pub height: u64,
    pub hash: BlockHash,
    pub block: Block,
    pub location: BlockLocation,
}

impl AppliedBlock {
    pub fn from_parsed(parsed: ParsedBlock, height: u64) -> Self {
        Self {
            height,
            hash: parsed.hash,
            block: parsed.block,
            location: parsed.location,
        }
    }

    pub fn prev_hash(&self) -> BlockHash {
        self.block.header.prev_blockhash
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            height: self.height,
            hash: self.hash,
        }
    }
}

/// `(height, hash)` of the last durably applied block.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Checkpoint {
    pub height: u64,
    pub hash: BlockHash,
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.hash, self.height)
    }
}

/// Per-transaction context handed to visitor hooks.
#[derive(Clone, Copy, Debug)]
pub struct TxContext<'a> {
    pub height: u64,
    /// Position of the transaction inside its block.
    pub index: usize,
    pub txid: Txid,
    pub tx: &'a Transaction,
}

impl TxContext<'_> {
    pub fn is_coinbase(&self) -> bool {
        self.tx.is_coinbase()
    }
}

/// Whether an input spends the coinbase marker outpoint (all-zero txid).
pub fn is_coinbase_outpoint(outpoint: &bitcoin::OutPoint) -> bool {
    outpoint.txid == Txid::all_zeros()
}
