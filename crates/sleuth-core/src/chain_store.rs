//! In-memory [`BlockStore`].
//!
//! Suitable for tests and dry runs; the production ingestor uses RocksDB
//! (sleuth-node). The store checks that heights arrive contiguously and that
//! no block is stored twice, so a walker bug shows up as an error here
//! rather than as a silently corrupt chain.

use std::collections::{BTreeMap, HashMap, HashSet};

use bitcoin::BlockHash;
use parking_lot::RwLock;

use crate::error::SleuthError;
use crate::traits::BlockStore;
use crate::types::{AppliedBlock, BlockLocation, Checkpoint};

#[derive(Default)]
struct Inner {
    /// hash → (height, location)
    blocks: HashMap<BlockHash, (u64, BlockLocation)>,
    /// height → hash
    heights: BTreeMap<u64, BlockHash>,
}

/// Hash-map backed block store with no persistence.
#[derive(Default)]
pub struct MemoryBlockStore {
    inner: RwLock<Inner>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blocks.
    pub fn len(&self) -> usize {
        self.inner.read().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().blocks.is_empty()
    }

    /// Hash stored at `height`.
    pub fn hash_at(&self, height: u64) -> Option<BlockHash> {
        self.inner.read().heights.get(&height).copied()
    }

    /// Stored hashes in height order.
    pub fn chain(&self) -> Vec<BlockHash> {
        self.inner.read().heights.values().copied().collect()
    }
}

impl BlockStore for MemoryBlockStore {
    fn store_block(&self, block: &AppliedBlock) -> Result<(), SleuthError> {
        let mut inner = self.inner.write();
        let expected = inner.heights.keys().next_back().map_or(0, |h| h + 1);
        if block.height != expected {
            return Err(SleuthError::Storage(format!(
                "height mismatch: expected {expected}, got {}",
                block.height
            )));
        }
        if inner.blocks.contains_key(&block.hash) {
            return Err(SleuthError::Storage(format!("duplicate block {}", block.hash)));
        }
        inner
            .blocks
            .insert(block.hash, (block.height, block.location));
        inner.heights.insert(block.height, block.hash);
        Ok(())
    }

    fn last_applied_height(&self) -> Result<Option<u64>, SleuthError> {
        Ok(self.inner.read().heights.keys().next_back().copied())
    }

    fn last_applied(&self) -> Result<Option<Checkpoint>, SleuthError> {
        Ok(self
            .inner
            .read()
            .heights
            .iter()
            .next_back()
            .map(|(height, hash)| Checkpoint {
                height: *height,
                hash: *hash,
            }))
    }

    fn list_stored_after(&self, height: u64) -> Result<HashSet<BlockHash>, SleuthError> {
        Ok(self
            .inner
            .read()
            .heights
            .range(height.saturating_add(1)..)
            .map(|(_, hash)| *hash)
            .collect())
    }

    fn contains_block(&self, hash: &BlockHash) -> Result<bool, SleuthError> {
        Ok(self.inner.read().blocks.contains_key(hash))
    }

    fn region_of_height(&self, height: u64) -> Result<Option<u32>, SleuthError> {
        let inner = self.inner.read();
        Ok(inner
            .heights
            .get(&height)
            .and_then(|hash| inner.blocks.get(hash))
            .map(|(_, location)| location.region))
    }
}
