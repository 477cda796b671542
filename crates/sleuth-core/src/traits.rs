//! Trait interfaces between Sleuth crates.
//!
//! - [`BlockStore`]: durable record of causally applied blocks (sleuth-node implements)
//! - [`ChainVisitor`]: per-block/transaction/input/output callbacks (sleuth-cluster implements)

use std::collections::HashSet;

use bitcoin::{BlockHash, TxIn, TxOut};

use crate::error::SleuthError;
use crate::types::{AppliedBlock, Checkpoint, TxContext};

/// Persistence collaborator of the chain walker.
///
/// Every block the walker applies is stored here before any visitor sees it,
/// so the last stored block is always a valid resume checkpoint. Any error
/// aborts the current walk.
pub trait BlockStore: Send + Sync {
    /// Persist a block at its assigned height.
    fn store_block(&self, block: &AppliedBlock) -> Result<(), SleuthError>;

    /// Height of the last applied block, `None` before the first one.
    fn last_applied_height(&self) -> Result<Option<u64>, SleuthError>;

    /// `(height, hash)` of the last applied block.
    fn last_applied(&self) -> Result<Option<Checkpoint>, SleuthError>;

    /// Hashes of every stored block with height strictly greater than `height`.
    fn list_stored_after(&self, height: u64) -> Result<HashSet<BlockHash>, SleuthError>;

    /// Whether a block with this hash has been stored.
    fn contains_block(&self, hash: &BlockHash) -> Result<bool, SleuthError>;

    /// Archive region the block at `height` was read from.
    fn region_of_height(&self, height: u64) -> Result<Option<u32>, SleuthError>;
}

impl<T: BlockStore + ?Sized> BlockStore for std::sync::Arc<T> {
    fn store_block(&self, block: &AppliedBlock) -> Result<(), SleuthError> {
        (**self).store_block(block)
    }

    fn last_applied_height(&self) -> Result<Option<u64>, SleuthError> {
        (**self).last_applied_height()
    }

    fn last_applied(&self) -> Result<Option<Checkpoint>, SleuthError> {
        (**self).last_applied()
    }

    fn list_stored_after(&self, height: u64) -> Result<HashSet<BlockHash>, SleuthError> {
        (**self).list_stored_after(height)
    }

    fn contains_block(&self, hash: &BlockHash) -> Result<bool, SleuthError> {
        (**self).contains_block(hash)
    }

    fn region_of_height(&self, height: u64) -> Result<Option<u32>, SleuthError> {
        (**self).region_of_height(height)
    }
}

/// Callbacks invoked for every causally applied block.
///
/// Hooks run in strict height order; within a block, transactions in block
/// order, and inputs then outputs in wire order. All hooks default to no-ops.
pub trait ChainVisitor: Send {
    fn block_begin(&mut self, _block: &AppliedBlock) -> Result<(), SleuthError> {
        Ok(())
    }

    fn transaction_begin(&mut self, _ctx: &TxContext<'_>) -> Result<(), SleuthError> {
        Ok(())
    }

    fn input(&mut self, _ctx: &TxContext<'_>, _index: usize, _input: &TxIn) -> Result<(), SleuthError> {
        Ok(())
    }

    fn output(
        &mut self,
        _ctx: &TxContext<'_>,
        _index: usize,
        _output: &TxOut,
    ) -> Result<(), SleuthError> {
        Ok(())
    }

    fn transaction_end(&mut self, _ctx: &TxContext<'_>) -> Result<(), SleuthError> {
        Ok(())
    }

    fn block_end(&mut self, _block: &AppliedBlock) -> Result<(), SleuthError> {
        Ok(())
    }

    /// Called after `block` has been visited and durably stored.
    fn block_committed(&mut self, _block: &AppliedBlock) -> Result<(), SleuthError> {
        Ok(())
    }
}

/// Visitor that ignores everything. Used when only block persistence is wanted.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullVisitor;

impl ChainVisitor for NullVisitor {}

/// Drive `visitor` over every transaction of `block` in wire order.
pub fn visit_block<V: ChainVisitor + ?Sized>(
    visitor: &mut V,
    block: &AppliedBlock,
) -> Result<(), SleuthError> {
    visitor.block_begin(block)?;
    for (index, tx) in block.block.txdata.iter().enumerate() {
        let ctx = TxContext {
            height: block.height,
            index,
            txid: tx.compute_txid(),
            tx,
        };
        visitor.transaction_begin(&ctx)?;
        for (i, input) in tx.input.iter().enumerate() {
            visitor.input(&ctx, i, input)?;
        }
        for (i, output) in tx.output.iter().enumerate() {
            visitor.output(&ctx, i, output)?;
        }
        visitor.transaction_end(&ctx)?;
    }
    visitor.block_end(block)
}

impl<V: ChainVisitor + ?Sized> ChainVisitor for Box<V> {
    fn block_begin(&mut self, block: &AppliedBlock) -> Result<(), SleuthError> {
        (**self).block_begin(block)
    }

    fn transaction_begin(&mut self, ctx: &TxContext<'_>) -> Result<(), SleuthError> {
        (**self).transaction_begin(ctx)
    }

    fn input(&mut self, ctx: &TxContext<'_>, index: usize, input: &TxIn) -> Result<(), SleuthError> {
        (**self).input(ctx, index, input)
    }

    fn output(&mut self, ctx: &TxContext<'_>, index: usize, output: &TxOut) -> Result<(), SleuthError> {
        (**self).output(ctx, index, output)
    }

    fn transaction_end(&mut self, ctx: &TxContext<'_>) -> Result<(), SleuthError> {
        (**self).transaction_end(ctx)
    }

    fn block_end(&mut self, block: &AppliedBlock) -> Result<(), SleuthError> {
        (**self).block_end(block)
    }

    fn block_committed(&mut self, block: &AppliedBlock) -> Result<(), SleuthError> {
        (**self).block_committed(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_store::MemoryBlockStore;
    use crate::types::{BlockLocation, ParsedBlock};
    use bitcoin::blockdata::constants::genesis_block;
    use bitcoin::Network;

    // ------------------------------------------------------------------
    // Recording visitor
    // ------------------------------------------------------------------

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
    }

    impl ChainVisitor for Recorder {
        fn block_begin(&mut self, block: &AppliedBlock) -> Result<(), SleuthError> {
            self.events.push(format!("block {}", block.height));
            Ok(())
        }

        fn transaction_begin(&mut self, ctx: &TxContext<'_>) -> Result<(), SleuthError> {
            self.events.push(format!("tx {}", ctx.index));
            Ok(())
        }

        fn input(&mut self, _ctx: &TxContext<'_>, index: usize, _input: &TxIn) -> Result<(), SleuthError> {
            self.events.push(format!("in {index}"));
            Ok(())
        }

        fn output(&mut self, _ctx: &TxContext<'_>, index: usize, _output: &TxOut) -> Result<(), SleuthError> {
            self.events.push(format!("out {index}"));
            Ok(())
        }

        fn transaction_end(&mut self, _ctx: &TxContext<'_>) -> Result<(), SleuthError> {
            self.events.push("tx end".into());
            Ok(())
        }

        fn block_end(&mut self, _block: &AppliedBlock) -> Result<(), SleuthError> {
            self.events.push("block end".into());
            Ok(())
        }
    }

    struct Failing;

    impl ChainVisitor for Failing {
        fn input(&mut self, _ctx: &TxContext<'_>, _index: usize, _input: &TxIn) -> Result<(), SleuthError> {
            Err(SleuthError::Storage("boom".into()))
        }
    }

    fn genesis_applied() -> AppliedBlock {
        let parsed = ParsedBlock::new(genesis_block(Network::Regtest), BlockLocation::default());
        AppliedBlock::from_parsed(parsed, 0)
    }

    // ------------------------------------------------------------------
    // Object safety
    // ------------------------------------------------------------------

    fn _assert_block_store_object_safe(store: &dyn BlockStore) {
        let _ = store.last_applied();
    }

    fn _assert_visitor_object_safe(visitor: &mut dyn ChainVisitor) {
        let _ = visitor.block_end(&genesis_applied());
    }

    // ------------------------------------------------------------------
    // visit_block
    // ------------------------------------------------------------------

    #[test]
    fn visit_block_emits_events_in_wire_order() {
        let mut rec = Recorder::default();
        visit_block(&mut rec, &genesis_applied()).unwrap();
        assert_eq!(
            rec.events,
            vec!["block 0", "tx 0", "in 0", "out 0", "tx end", "block end"]
        );
    }

    #[test]
    fn visitor_error_stops_the_block() {
        let err = visit_block(&mut Failing, &genesis_applied()).unwrap_err();
        assert!(matches!(err, SleuthError::Storage(_)));
    }

    #[test]
    fn boxed_visitor_forwards() {
        let mut boxed: Box<dyn ChainVisitor> = Box::new(NullVisitor);
        assert!(visit_block(&mut boxed, &genesis_applied()).is_ok());
    }

    // ------------------------------------------------------------------
    // BlockStore via the memory store
    // ------------------------------------------------------------------

    #[test]
    fn block_store_as_dyn() {
        let store = MemoryBlockStore::new();
        let dyn_store: &dyn BlockStore = &store;
        assert_eq!(dyn_store.last_applied().unwrap(), None);
        dyn_store.store_block(&genesis_applied()).unwrap();
        assert_eq!(dyn_store.last_applied_height().unwrap(), Some(0));
    }
}
