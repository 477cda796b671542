//! RocksStore persistence across reopen: block index, mirror and forest.

use std::sync::Arc;

use bitcoin::blockdata::constants::genesis_block;
use bitcoin::hashes::Hash;
use bitcoin::{Block, BlockHash, Network, Txid};

use sleuth_cluster::DisjointSet;
use sleuth_core::traits::BlockStore;
use sleuth_core::types::{AppliedBlock, BlockLocation, ParsedBlock};
use sleuth_core::utxo::{OutputSet, UtxoTracker};
use sleuth_node_lib::storage::RocksStore;

fn chain(n: usize) -> Vec<AppliedBlock> {
    let mut blocks = Vec::with_capacity(n);
    let mut prev = BlockHash::all_zeros();
    for height in 0..n {
        let mut block: Block = genesis_block(Network::Regtest);
        if height > 0 {
            block.header.prev_blockhash = prev;
            block.header.nonce = height as u32;
        }
        let location = BlockLocation {
            region: 0,
            offset: height as u64 * 293,
        };
        let applied = AppliedBlock::from_parsed(ParsedBlock::new(block, location), height as u64);
        prev = applied.hash;
        blocks.push(applied);
    }
    blocks
}

fn outputs(entries: &[(u32, &str)]) -> OutputSet {
    entries.iter().map(|(i, t)| (*i, t.to_string())).collect()
}

#[test]
fn checkpoint_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chaindata");
    let blocks = chain(4);
    {
        let store = RocksStore::open(&path).unwrap();
        for b in &blocks {
            store.store_block(b).unwrap();
        }
        store.flush().unwrap();
    }

    let store = RocksStore::open(&path).unwrap();
    assert_eq!(store.last_applied().unwrap(), Some(blocks[3].checkpoint()));
    assert!(store.contains_block(&blocks[0].hash).unwrap());
    assert!(store.store_block(&blocks[3]).is_err(), "tip already stored");
}

#[test]
fn tracker_restores_from_rocks_mirror() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("utxo");
    let a = Txid::from_byte_array([1; 32]);
    let b = Txid::from_byte_array([2; 32]);
    {
        let tracker = UtxoTracker::with_mirror(Box::new(RocksStore::open(&path).unwrap()), 100);
        tracker.put(a, outputs(&[(0, "alice"), (1, "bob")])).unwrap();
        tracker.put(b, outputs(&[(4, "carol")])).unwrap();
        assert_eq!(tracker.spend(&a, 0).unwrap(), "alice");
        tracker.spend(&b, 4).unwrap();
        tracker.flush().unwrap();
    }

    let tracker = UtxoTracker::with_mirror(Box::new(RocksStore::open(&path).unwrap()), 100);
    assert_eq!(tracker.restore().unwrap(), 1);
    assert_eq!(tracker.get(&a, 1).unwrap(), "bob");
    assert!(tracker.get(&a, 0).is_err());
    assert!(tracker.get_set(&b).is_err());
}

#[test]
fn unflushed_mirror_ops_are_not_durable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("utxo");
    let a = Txid::from_byte_array([3; 32]);
    {
        let tracker = UtxoTracker::with_mirror(Box::new(RocksStore::open(&path).unwrap()), 100);
        tracker.put(a, outputs(&[(0, "dave")])).unwrap();
    }

    let store = Arc::new(RocksStore::open(&path).unwrap());
    let tracker = UtxoTracker::with_mirror(Box::new(Arc::clone(&store)), 100);
    assert_eq!(tracker.restore().unwrap(), 0);
}

#[test]
fn forest_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chaindata");
    {
        let store = RocksStore::open(&path).unwrap();
        let mut forest = DisjointSet::new();
        for token in ["a", "b", "c", "d", "e"] {
            forest.make_set(token);
        }
        forest.union("a", "b").unwrap();
        forest.union("c", "d").unwrap();
        forest.union("b", "d").unwrap();
        store.save_forest(&forest).unwrap();
    }

    let store = RocksStore::open(&path).unwrap();
    let mut forest = store.load_forest().unwrap().unwrap();
    assert_eq!(forest.len(), 5);
    assert_eq!(forest.cluster_count(), 2);
    assert!(forest.same_set("a", "c").unwrap());
    assert!(!forest.same_set("a", "e").unwrap());
}
