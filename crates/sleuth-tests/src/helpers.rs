//! Shared test helpers for end-to-end tests.

use std::path::Path;

use bitcoin::absolute::LockTime;
use bitcoin::block::Header;
use bitcoin::blockdata::constants::genesis_block;
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, Block, BlockHash, Network, OutPoint, PubkeyHash, ScriptBuf, Sequence, Transaction,
    TxIn, TxMerkleNode, TxOut, Witness,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use sleuth_cluster::output_token;
use sleuth_core::archive::Archive;
use sleuth_core::constants::NetworkType;
use sleuth_core::reader::encode_record;
use sleuth_core::types::Token;

/// Network every synthetic chain is built for.
pub const NETWORK: NetworkType = NetworkType::Regtest;

/// Zero bytes appended after each region's last record, as bitcoind pre-allocates.
pub const REGION_PADDING: usize = 1024;

/// Pay-to-pubkey-hash locking script for a seed byte.
pub fn p2pkh(seed: u8) -> ScriptBuf {
    ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array([seed; 20]))
}

/// Address token the clustering engine derives for `p2pkh(seed)`.
pub fn token(seed: u8) -> Token {
    output_token(&p2pkh(seed), NETWORK.network()).unwrap()
}

fn txin(previous_output: OutPoint) -> TxIn {
    TxIn {
        previous_output,
        script_sig: ScriptBuf::new(),
        sequence: Sequence::MAX,
        witness: Witness::new(),
    }
}

/// Coinbase paying 50 000 sats to `pays`; `tag` keeps the txid unique.
pub fn coinbase(tag: u32, pays: u8) -> Transaction {
    let mut input = txin(OutPoint::null());
    let mut script_sig = vec![0x04];
    script_sig.extend_from_slice(&tag.to_le_bytes());
    input.script_sig = ScriptBuf::from_bytes(script_sig);
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

/// Transaction spending `prevs`, paying `(seed, sats)` outputs.
pub fn spend(prevs: &[OutPoint], outs: &[(u8, u64)]) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: prevs.iter().copied().map(txin).collect(),
        output: outs
            .iter()
            .map(|(seed, sats)| TxOut {
                value: Amount::from_sat(*sats),
                script_pubkey: p2pkh(*seed),
            })
            .collect(),
    }
}

pub fn outpoint(tx: &Transaction, vout: u32) -> OutPoint {
    OutPoint {
        txid: tx.compute_txid(),
        vout,
    }
}

/// Regtest-shaped block on `prev` with a correct merkle root. `tag` makes the header unique.
pub fn make_block(prev: BlockHash, tag: u32, txdata: Vec<Transaction>) -> Block {
    let template = genesis_block(Network::Regtest).header;
    let mut block = Block {
        header: Header {
            version: template.version,
            prev_blockhash: prev,
            merkle_root: TxMerkleNode::all_zeros(),
            time: template.time + tag,
            bits: template.bits,
            nonce: tag,
        },
        txdata,
    };
    if let Some(root) = block.compute_merkle_root() {
        block.header.merkle_root = root;
    }
    block
}

/// Builds a linear chain from the zero parent, one unique coinbase per block.
#[derive(Default)]
pub struct ChainBuilder {
    blocks: Vec<Block>,
    next_tag: u32,
}

impl ChainBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash the next pushed block will reference.
    pub fn tip(&self) -> BlockHash {
        self.blocks
            .last()
            .map_or_else(BlockHash::all_zeros, Block::block_hash)
    }

    fn tag(&mut self) -> u32 {
        self.next_tag += 1;
        self.next_tag
    }

    /// Append a block whose coinbase pays `miner`, followed by `txs`. Returns the coinbase.
    pub fn push(&mut self, miner: u8, txs: Vec<Transaction>) -> Transaction {
        let tag = self.tag();
        let cb = coinbase(tag, miner);
        let mut txdata = vec![cb.clone()];
        txdata.extend(txs);
        let block = make_block(self.tip(), tag, txdata);
        self.blocks.push(block);
        cb
    }

    /// Append `n` coinbase-only blocks paying miner `0xEE`.
    pub fn push_empty(&mut self, n: usize) {
        for _ in 0..n {
            self.push(0xEE, Vec::new());
        }
    }

    /// Off-chain block on `parent`. Not added to the chain.
    pub fn detached(&mut self, parent: BlockHash) -> Block {
        let tag = self.tag();
        make_block(parent, tag, vec![coinbase(tag, 0xEF)])
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn hashes(&self) -> Vec<BlockHash> {
        self.blocks.iter().map(Block::block_hash).collect()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Write one `blkNNNNN.dat` region holding `blocks` in order, followed by zero padding.
pub fn write_region(dir: &Path, index: u32, blocks: &[&Block]) {
    let magic = NETWORK.magic_value();
    let mut bytes = Vec::new();
    for block in blocks {
        bytes.extend_from_slice(&encode_record(block, magic));
    }
    bytes.extend_from_slice(&[0u8; REGION_PADDING]);
    std::fs::write(dir.join(Archive::region_name(index)), bytes).unwrap();
}

/// Lay `blocks` out in file order, `per_region` records per region, starting at region `first`.
/// Returns the index after the last region written.
pub fn write_archive_from(dir: &Path, first: u32, blocks: &[Block], per_region: usize) -> u32 {
    let mut index = first;
    for chunk in blocks.chunks(per_region.max(1)) {
        let refs: Vec<&Block> = chunk.iter().collect();
        write_region(dir, index, &refs);
        index += 1;
    }
    index
}

pub fn write_archive(dir: &Path, blocks: &[Block], per_region: usize) -> u32 {
    write_archive_from(dir, 0, blocks, per_region)
}

/// `blocks` in a seeded random order.
pub fn shuffled(blocks: &[Block], seed: u64) -> Vec<Block> {
    let mut out = blocks.to_vec();
    out.shuffle(&mut StdRng::seed_from_u64(seed));
    out
}
