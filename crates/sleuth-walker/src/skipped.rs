//! Skipped-block cache.
//!
//! Holds blocks parsed before their parent was applied, keyed by the parent
//! hash they are waiting for. An entry leaves the cache exactly when its key
//! becomes the walker's goal. The cache never refuses an insert; the walker
//! checks [`SkippedBlocks::exceeds_bound`] afterwards and aborts the run.

use std::collections::HashMap;

use bitcoin::BlockHash;
use sleuth_core::types::ParsedBlock;
use tracing::warn;

pub struct SkippedBlocks {
    /// awaited parent hash → block
    blocks: HashMap<BlockHash, ParsedBlock>,
    bound: usize,
}

impl SkippedBlocks {
    pub fn new(bound: usize) -> Self {
        Self {
            blocks: HashMap::new(),
            bound,
        }
    }

    /// Hold `block` until its parent is applied.
    ///
    /// Only one block waits per parent; a second one replaces the first,
    /// which is returned.
    pub fn insert(&mut self, block: ParsedBlock) -> Option<ParsedBlock> {
        let replaced = self.blocks.insert(block.prev_hash(), block);
        if let Some(old) = &replaced {
            warn!(
                parent = %old.prev_hash(),
                dropped = %old.hash,
                location = %old.location,
                "skipped block replaced by a sibling"
            );
        }
        replaced
    }

    /// Remove and return the block waiting on `parent`.
    pub fn take(&mut self, parent: &BlockHash) -> Option<ParsedBlock> {
        self.blocks.remove(parent)
    }

    /// Whether a block is waiting on `parent`.
    pub fn contains(&self, parent: &BlockHash) -> bool {
        self.blocks.contains_key(parent)
    }

    pub fn get(&self, parent: &BlockHash) -> Option<&ParsedBlock> {
        self.blocks.get(parent)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn bound(&self) -> usize {
        self.bound
    }

    pub fn exceeds_bound(&self) -> bool {
        self.blocks.len() > self.bound
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::blockdata::constants::genesis_block;
    use bitcoin::hashes::Hash;
    use bitcoin::Network;
    use proptest::prelude::*;
    use sleuth_core::types::BlockLocation;

    fn block_with_parent(parent: BlockHash, nonce: u32) -> ParsedBlock {
        let mut block = genesis_block(Network::Regtest);
        block.header.prev_blockhash = parent;
        block.header.nonce = nonce;
        ParsedBlock::new(block, BlockLocation::default())
    }

    fn parent(seed: u8) -> BlockHash {
        BlockHash::from_byte_array([seed; 32])
    }

    #[test]
    fn insert_and_take() {
        let mut cache = SkippedBlocks::new(10);
        let block = block_with_parent(parent(1), 1);
        assert!(cache.insert(block.clone()).is_none());
        assert!(cache.contains(&parent(1)));
        assert_eq!(cache.len(), 1);

        let taken = cache.take(&parent(1)).unwrap();
        assert_eq!(taken.hash, block.hash);
        assert!(cache.is_empty());
        assert!(cache.take(&parent(1)).is_none());
    }

    #[test]
    fn sibling_replaces_older_entry() {
        let mut cache = SkippedBlocks::new(10);
        let first = block_with_parent(parent(2), 1);
        let second = block_with_parent(parent(2), 2);
        cache.insert(first.clone());
        let replaced = cache.insert(second.clone()).unwrap();
        assert_eq!(replaced.hash, first.hash);
        assert_eq!(cache.get(&parent(2)).unwrap().hash, second.hash);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn bound_is_exceeded_only_past_limit() {
        let mut cache = SkippedBlocks::new(2);
        cache.insert(block_with_parent(parent(1), 1));
        cache.insert(block_with_parent(parent(2), 2));
        assert!(!cache.exceeds_bound());
        cache.insert(block_with_parent(parent(3), 3));
        assert!(cache.exceeds_bound());
    }

    proptest! {
        #[test]
        fn len_tracks_distinct_parents(seeds in proptest::collection::vec(0u8..32, 0..64), bound in 1usize..40) {
            let mut cache = SkippedBlocks::new(bound);
            let mut distinct = std::collections::HashSet::new();
            for (i, seed) in seeds.iter().enumerate() {
                cache.insert(block_with_parent(parent(*seed), i as u32));
                distinct.insert(*seed);
                prop_assert_eq!(cache.len(), distinct.len());
                prop_assert_eq!(cache.exceeds_bound(), distinct.len() > bound);
            }
        }
    }
}
