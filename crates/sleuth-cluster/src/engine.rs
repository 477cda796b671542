//! Clustering engine implementing [`ChainVisitor`].
//!
//! Applies the common-input-ownership heuristic to every applied block:
//! the address tokens behind a transaction's inputs are merged into one set
//! unless the transaction is a coinbase or has a CoinJoin shape.
//!
//! Per block, output tokens are extracted on the rayon pool (one task per
//! transaction, results kept in block order). Per transaction, prior-output
//! lookups for wide transactions also fan out on the pool. Spends, inserts
//! and unions stay on the walker thread in wire order.
//!
//! With a [`ForestSink`] attached, the forest is snapshotted every few
//! committed blocks, so a crash rewinds clustering to a recent checkpoint
//! rather than to the start of the run.

use std::sync::Arc;

use bitcoin::{Address, Network, Script, TxIn, TxOut};
use rayon::prelude::*;
use rayon::ThreadPool;
use serde::Serialize;
use sleuth_core::constants::NetworkType;
use sleuth_core::error::{SleuthError, UtxoError};
use sleuth_core::traits::ChainVisitor;
use sleuth_core::types::{is_coinbase_outpoint, AppliedBlock, Token, TxContext};
use sleuth_core::utxo::{OutputSet, UtxoTracker};
use tracing::{debug, trace};

use crate::coinjoin::is_coinjoin;
use crate::disjoint_set::DisjointSet;

/// Inputs per transaction above which prior-output lookups run on the pool.
const PARALLEL_LOOKUP_MIN: usize = 16;

/// Address token for a locking script, `None` when no standard address decodes.
pub fn output_token(script: &Script, network: Network) -> Option<Token> {
    Address::from_script(script, network)
        .ok()
        .map(|address| address.to_string())
}

/// Durable home for forest snapshots.
pub trait ForestSink: Send + Sync {
    fn save_forest(&self, forest: &DisjointSet) -> Result<(), SleuthError>;
}

/// Running counters, for logging and the ingest report.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ClusterStats {
    pub blocks: u64,
    pub transactions: u64,
    pub coinbase: u64,
    /// Transactions excluded from merging by the CoinJoin filter.
    pub coinjoins: u64,
    pub unions: u64,
    /// Inputs whose prior output was not tracked (undecodable or unknown).
    pub unresolved_inputs: u64,
    pub undecodable_outputs: u64,
}

pub struct ClusterEngine {
    tracker: Arc<UtxoTracker>,
    forest: DisjointSet,
    network: Network,
    pool: Arc<ThreadPool>,
    stats: ClusterStats,
    /// Output tokens of the current block, `[tx][output]`.
    block_outputs: Vec<Vec<Option<Token>>>,
    /// Prior-output tokens of the current transaction, by input index.
    resolved: Vec<Option<Token>>,
    input_tokens: Vec<Token>,
    new_outputs: OutputSet,
    snapshots: Option<(Arc<dyn ForestSink>, u64)>,
}

impl ClusterEngine {
    pub fn new(tracker: Arc<UtxoTracker>, network: NetworkType, pool: Arc<ThreadPool>) -> Self {
        Self::with_forest(tracker, network, pool, DisjointSet::new())
    }

    /// Continue clustering on top of an existing forest.
    pub fn with_forest(
        tracker: Arc<UtxoTracker>,
        network: NetworkType,
        pool: Arc<ThreadPool>,
        forest: DisjointSet,
    ) -> Self {
        Self {
            tracker,
            forest,
            network: network.network(),
            pool,
            stats: ClusterStats::default(),
            block_outputs: Vec::new(),
            resolved: Vec::new(),
            input_tokens: Vec::new(),
            new_outputs: OutputSet::new(),
            snapshots: None,
        }
    }

    /// Save the forest to `sink` after every `interval`th committed block. 0 disables.
    pub fn with_snapshots(mut self, sink: Arc<dyn ForestSink>, interval: u64) -> Self {
        self.snapshots = (interval > 0).then_some((sink, interval));
        self
    }

    pub fn stats(&self) -> &ClusterStats {
        &self.stats
    }

    pub fn forest(&self) -> &DisjointSet {
        &self.forest
    }

    pub fn forest_mut(&mut self) -> &mut DisjointSet {
        &mut self.forest
    }

    pub fn tracker(&self) -> &Arc<UtxoTracker> {
        &self.tracker
    }

    fn lookup(tracker: &UtxoTracker, input: &TxIn) -> Option<Token> {
        let outpoint = &input.previous_output;
        if is_coinbase_outpoint(outpoint) {
            return None;
        }
        tracker.get(&outpoint.txid, outpoint.vout).ok()
    }
}

impl ChainVisitor for ClusterEngine {
    fn block_begin(&mut self, block: &AppliedBlock) -> Result<(), SleuthError> {
        let network = self.network;
        let txdata = &block.block.txdata;
        self.block_outputs = self.pool.install(|| {
            txdata
                .par_iter()
                .map(|tx| {
                    tx.output
                        .iter()
                        .map(|out| output_token(&out.script_pubkey, network))
                        .collect()
                })
                .collect()
        });
        self.stats.blocks += 1;
        Ok(())
    }

    fn transaction_begin(&mut self, ctx: &TxContext<'_>) -> Result<(), SleuthError> {
        self.stats.transactions += 1;
        if ctx.is_coinbase() {
            self.stats.coinbase += 1;
        }
        self.input_tokens.clear();
        self.new_outputs.clear();

        let tracker = &self.tracker;
        let inputs = &ctx.tx.input;
        self.resolved = if inputs.len() >= PARALLEL_LOOKUP_MIN {
            self.pool
                .install(|| inputs.par_iter().map(|i| Self::lookup(tracker, i)).collect())
        } else {
            inputs.iter().map(|i| Self::lookup(tracker, i)).collect()
        };
        Ok(())
    }

    fn input(&mut self, ctx: &TxContext<'_>, index: usize, input: &TxIn) -> Result<(), SleuthError> {
        let outpoint = &input.previous_output;
        if is_coinbase_outpoint(outpoint) {
            return Ok(());
        }
        let Some(token) = self.resolved.get_mut(index).and_then(Option::take) else {
            self.stats.unresolved_inputs += 1;
            trace!(height = ctx.height, txid = %ctx.txid, input = index, "spent output not tracked");
            return Ok(());
        };
        match self.tracker.delete(&outpoint.txid, outpoint.vout) {
            Ok(()) => self.input_tokens.push(token),
            // the same outpoint listed twice in one transaction
            Err(UtxoError::NotFound { .. }) => self.stats.unresolved_inputs += 1,
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn output(&mut self, ctx: &TxContext<'_>, index: usize, _output: &TxOut) -> Result<(), SleuthError> {
        let token = self
            .block_outputs
            .get(ctx.index)
            .and_then(|outputs| outputs.get(index))
            .cloned()
            .flatten();
        match token {
            Some(token) => {
                self.new_outputs.insert(index as u32, token);
            }
            None => self.stats.undecodable_outputs += 1,
        }
        Ok(())
    }

    fn transaction_end(&mut self, ctx: &TxContext<'_>) -> Result<(), SleuthError> {
        if !self.new_outputs.is_empty() {
            self.tracker
                .put(ctx.txid, std::mem::take(&mut self.new_outputs))?;
        }

        let tokens = std::mem::take(&mut self.input_tokens);
        if tokens.len() < 2 {
            return Ok(());
        }
        if is_coinjoin(ctx.tx) {
            self.stats.coinjoins += 1;
            debug!(height = ctx.height, txid = %ctx.txid, inputs = tokens.len(), "coinjoin excluded from merge");
            return Ok(());
        }
        for token in &tokens {
            self.forest.make_set(token);
        }
        for pair in tokens.windows(2) {
            if self.forest.same_set(&pair[0], &pair[1])? {
                continue;
            }
            self.forest.union(&pair[0], &pair[1])?;
            self.stats.unions += 1;
        }
        Ok(())
    }

    fn block_end(&mut self, block: &AppliedBlock) -> Result<(), SleuthError> {
        self.block_outputs.clear();
        let flushed = self.tracker.flush()?;
        trace!(
            height = block.height,
            flushed,
            labels = self.forest.len(),
            unspent = self.tracker.len(),
            "block clustered"
        );
        Ok(())
    }

    fn block_committed(&mut self, block: &AppliedBlock) -> Result<(), SleuthError> {
        let Some((sink, interval)) = &self.snapshots else {
            return Ok(());
        };
        if (block.height + 1) % interval == 0 {
            sink.save_forest(&self.forest)?;
            debug!(height = block.height, labels = self.forest.len(), "forest snapshot");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::blockdata::constants::genesis_block;
    use bitcoin::hashes::Hash;
    use bitcoin::transaction::Version;
    use bitcoin::{
        Amount, Block, OutPoint, PubkeyHash, ScriptBuf, Sequence, Transaction, Txid, Witness,
    };
    use sleuth_core::traits::visit_block;
    use sleuth_core::types::{BlockLocation, ParsedBlock};
    use sleuth_core::utxo::MemoryMirror;

    // ------------------------------------------------------------------
    // Fixtures
    // ------------------------------------------------------------------

    fn p2pkh(seed: u8) -> ScriptBuf {
        ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array([seed; 20]))
    }

    fn token(seed: u8) -> Token {
        output_token(&p2pkh(seed), Network::Regtest).unwrap()
    }

    fn txin(txid: Txid, vout: u32) -> TxIn {
        TxIn {
            previous_output: OutPoint { txid, vout },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }
    }

    fn coinbase(tag: u8, pays: u8) -> Transaction {
        let mut input = txin(Txid::all_zeros(), u32::MAX);
        input.script_sig = ScriptBuf::from_bytes(vec![0x01, tag]);
        Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![input],
            output: vec![TxOut {
                value: Amount::from_sat(50_000),
                script_pubkey: p2pkh(pays),
            }],
        }
    }

    fn spend(prevs: &[(Txid, u32)], outs: &[(ScriptBuf, u64)]) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: prevs.iter().map(|(t, v)| txin(*t, *v)).collect(),
            output: outs
                .iter()
                .map(|(script, value)| TxOut {
                    value: Amount::from_sat(*value),
                    script_pubkey: script.clone(),
                })
                .collect(),
        }
    }

    fn applied(height: u64, txdata: Vec<Transaction>) -> AppliedBlock {
        let mut block: Block = genesis_block(Network::Regtest);
        block.header.nonce = height as u32 + 1;
        block.txdata = txdata;
        AppliedBlock::from_parsed(ParsedBlock::new(block, BlockLocation::default()), height)
    }

    fn engine(tracker: Arc<UtxoTracker>) -> ClusterEngine {
        let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
        ClusterEngine::new(tracker, NetworkType::Regtest, Arc::new(pool))
    }

    // ------------------------------------------------------------------
    // Heuristic
    // ------------------------------------------------------------------

    #[test]
    fn multi_input_spend_merges_owners() {
        let tracker = Arc::new(UtxoTracker::new());
        let mut e = engine(Arc::clone(&tracker));
        let cb_a = coinbase(0, 0xA1);
        let cb_b = coinbase(1, 0xB1);
        let spent = cb_a.compute_txid();
        let merge = spend(
            &[(spent, 0), (cb_b.compute_txid(), 0)],
            &[(p2pkh(0xD1), 90_000)],
        );

        visit_block(&mut e, &applied(0, vec![cb_a])).unwrap();
        visit_block(&mut e, &applied(1, vec![cb_b])).unwrap();
        visit_block(&mut e, &applied(2, vec![coinbase(2, 0xC1), merge.clone()])).unwrap();

        let forest = e.forest_mut();
        assert!(forest.same_set(&token(0xA1), &token(0xB1)).unwrap());
        assert_eq!(forest.len(), 2, "only input owners are labelled");

        assert_eq!(tracker.get(&merge.compute_txid(), 0).unwrap(), token(0xD1));
        assert!(tracker.get(&spent, 0).is_err());
        assert_eq!(e.stats().unions, 1);
        assert_eq!(e.stats().coinbase, 3);
    }

    #[test]
    fn coinbase_only_block_makes_no_unions() {
        let tracker = Arc::new(UtxoTracker::new());
        let mut e = engine(Arc::clone(&tracker));
        visit_block(&mut e, &applied(0, vec![coinbase(0, 1)])).unwrap();
        assert!(e.forest().is_empty());
        assert_eq!(e.stats().unions, 0);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn coinjoin_inputs_stay_apart() {
        let tracker = Arc::new(UtxoTracker::new());
        let mut e = engine(Arc::clone(&tracker));
        let cb_e = coinbase(0, 0xE1);
        let cb_f = coinbase(1, 0xF1);
        let mix = spend(
            &[(cb_e.compute_txid(), 0), (cb_f.compute_txid(), 0)],
            &[
                (p2pkh(0x01), 90_000),
                (p2pkh(0x02), 50_000),
                (p2pkh(0x03), 50_000),
                (p2pkh(0x04), 10_000),
            ],
        );

        visit_block(&mut e, &applied(0, vec![cb_e, cb_f])).unwrap();
        visit_block(&mut e, &applied(1, vec![coinbase(2, 0x11), mix])).unwrap();

        assert!(!e.forest().contains(&token(0xE1)));
        assert!(!e.forest().contains(&token(0xF1)));
        assert_eq!(e.stats().coinjoins, 1);
        assert_eq!(e.stats().unions, 0);
    }

    #[test]
    fn spend_within_same_block() {
        let tracker = Arc::new(UtxoTracker::new());
        let mut e = engine(Arc::clone(&tracker));
        let cb = coinbase(0, 0x21);
        let first = spend(&[(cb.compute_txid(), 0)], &[(p2pkh(0x22), 10), (p2pkh(0x23), 20)]);
        let second = spend(
            &[(first.compute_txid(), 0), (first.compute_txid(), 1)],
            &[(p2pkh(0x24), 30)],
        );
        visit_block(&mut e, &applied(0, vec![cb, first, second])).unwrap();

        assert!(e.forest_mut().same_set(&token(0x22), &token(0x23)).unwrap());
        assert_eq!(tracker.len(), 1);
        assert_eq!(e.stats().unresolved_inputs, 0);
    }

    #[test]
    fn undecodable_outputs_contribute_nothing() {
        let tracker = Arc::new(UtxoTracker::new());
        let mut e = engine(Arc::clone(&tracker));
        let cb = coinbase(0, 0x31);
        let weird = spend(
            &[(cb.compute_txid(), 0)],
            &[(ScriptBuf::from_bytes(vec![0x6a, 0x01, 0x00]), 0), (p2pkh(0x32), 5)],
        );
        let spend_weird = spend(
            &[(weird.compute_txid(), 0), (weird.compute_txid(), 1)],
            &[(p2pkh(0x33), 5)],
        );
        visit_block(&mut e, &applied(0, vec![cb, weird.clone()])).unwrap();
        assert_eq!(tracker.get_set(&weird.compute_txid()).unwrap().len(), 1);

        visit_block(&mut e, &applied(1, vec![coinbase(1, 0x34), spend_weird])).unwrap();
        assert_eq!(e.stats().undecodable_outputs, 1);
        assert_eq!(e.stats().unresolved_inputs, 1);
        assert_eq!(e.stats().unions, 0, "one resolved input is not enough to merge");
        assert!(e.forest().is_empty());
    }

    #[test]
    fn inputs_from_one_address_count_no_union() {
        let tracker = Arc::new(UtxoTracker::new());
        let mut e = engine(Arc::clone(&tracker));
        let first = coinbase(0, 0x61);
        let second = coinbase(1, 0x61);
        let sweep = spend(
            &[(first.compute_txid(), 0), (second.compute_txid(), 0)],
            &[(p2pkh(0x62), 90_000)],
        );
        visit_block(&mut e, &applied(0, vec![first, second])).unwrap();
        visit_block(&mut e, &applied(1, vec![coinbase(2, 0x63), sweep])).unwrap();

        assert_eq!(e.stats().unions, 0);
        assert_eq!(e.forest().len(), 1);
        assert_eq!(e.stats().unresolved_inputs, 0);
    }

    #[test]
    fn wide_transaction_uses_parallel_lookup() {
        let tracker = Arc::new(UtxoTracker::new());
        let mut e = engine(Arc::clone(&tracker));
        let coinbases: Vec<Transaction> = (0..20u8).map(|i| coinbase(i, 0x40 + i)).collect();
        let prevs: Vec<(Txid, u32)> = coinbases.iter().map(|tx| (tx.compute_txid(), 0)).collect();
        let sweep = spend(&prevs, &[(p2pkh(0x99), 1_000)]);

        visit_block(&mut e, &applied(0, coinbases)).unwrap();
        visit_block(&mut e, &applied(1, vec![coinbase(99, 0x98), sweep])).unwrap();

        let forest = e.forest_mut();
        let root = forest.find(&token(0x40)).unwrap();
        for i in 0..20u8 {
            assert_eq!(forest.find(&token(0x40 + i)).unwrap(), root);
        }
        assert_eq!(forest.cluster_count(), 1);
    }

    #[derive(Default)]
    struct Snapshots {
        saved: std::sync::Mutex<Vec<usize>>,
    }

    impl ForestSink for Snapshots {
        fn save_forest(&self, forest: &DisjointSet) -> Result<(), SleuthError> {
            self.saved.lock().unwrap().push(forest.len());
            Ok(())
        }
    }

    #[test]
    fn forest_snapshot_every_interval() {
        let tracker = Arc::new(UtxoTracker::new());
        let sink = Arc::new(Snapshots::default());
        let mut e = engine(Arc::clone(&tracker)).with_snapshots(sink.clone(), 2);
        let cb_a = coinbase(0, 0x71);
        let cb_b = coinbase(1, 0x72);
        let merge = spend(
            &[(cb_a.compute_txid(), 0), (cb_b.compute_txid(), 0)],
            &[(p2pkh(0x73), 90_000)],
        );
        let blocks = [
            applied(0, vec![cb_a]),
            applied(1, vec![cb_b]),
            applied(2, vec![coinbase(2, 0x74), merge]),
            applied(3, vec![coinbase(3, 0x75)]),
            applied(4, vec![coinbase(4, 0x76)]),
        ];
        for block in &blocks {
            visit_block(&mut e, block).unwrap();
            e.block_committed(block).unwrap();
        }
        // after heights 1 and 3
        assert_eq!(*sink.saved.lock().unwrap(), vec![0, 2]);
    }

    #[test]
    fn zero_interval_disables_snapshots() {
        let sink = Arc::new(Snapshots::default());
        let mut e = engine(Arc::new(UtxoTracker::new())).with_snapshots(sink.clone(), 0);
        let block = applied(0, vec![coinbase(0, 0x77)]);
        visit_block(&mut e, &block).unwrap();
        e.block_committed(&block).unwrap();
        assert!(sink.saved.lock().unwrap().is_empty());
    }

    #[test]
    fn block_end_flushes_mirror() {
        let mirror = Arc::new(MemoryMirror::new());
        let tracker = Arc::new(UtxoTracker::with_mirror(Box::new(Arc::clone(&mirror)), 1_000));
        let mut e = engine(Arc::clone(&tracker));
        let cb = coinbase(0, 0x51);
        let txid = cb.compute_txid();
        visit_block(&mut e, &applied(0, vec![cb])).unwrap();
        assert_eq!(tracker.pending_ops(), 0);
        assert_eq!(mirror.bucket(&txid).unwrap().get(&0), Some(&token(0x51)));
    }
}
