//! Causal ordering over shuffled multi-region archives.
//!
//! Whatever order blocks are laid out in, the walker must apply them in
//! strict parent-before-child order with heights 0, 1, 2, ...

use std::path::Path;

use bitcoin::hashes::Hash;
use bitcoin::BlockHash;
use proptest::prelude::*;

use sleuth_core::archive::Archive;
use sleuth_core::cancel::CancelToken;
use sleuth_core::chain_store::MemoryBlockStore;
use sleuth_core::error::{SleuthError, WalkError};
use sleuth_core::traits::{BlockStore, ChainVisitor};
use sleuth_core::types::AppliedBlock;
use sleuth_tests::helpers::*;
use sleuth_walker::{ChainWalker, WalkOutcome, WalkerConfig};

#[derive(Default)]
struct Heights {
    applied: Vec<(u64, BlockHash, BlockHash)>,
}

impl ChainVisitor for Heights {
    fn block_begin(&mut self, block: &AppliedBlock) -> Result<(), SleuthError> {
        self.applied.push((block.height, block.hash, block.prev_hash()));
        Ok(())
    }
}

fn walk(
    dir: &Path,
    skipped_bound: usize,
) -> Result<(ChainWalker<MemoryBlockStore, Heights>, WalkOutcome), SleuthError> {
    let archive = Archive::open(dir, NETWORK)?;
    let config = WalkerConfig {
        skipped_bound,
        ..WalkerConfig::default()
    };
    let mut walker = ChainWalker::new(archive, MemoryBlockStore::new(), Heights::default(), config)?;
    let outcome = walker.run(&CancelToken::new())?;
    Ok((walker, outcome))
}

/// Applied blocks form the chain prefix in order: every block but the last (still pending).
fn assert_prefix(walker: &ChainWalker<MemoryBlockStore, Heights>, chain: &ChainBuilder) {
    let expected = chain.hashes();
    let applied = &walker.visitor().applied;
    assert_eq!(applied.len(), expected.len() - 1);

    let mut parent = BlockHash::all_zeros();
    for (i, (height, hash, prev)) in applied.iter().enumerate() {
        assert_eq!(*height, i as u64);
        assert_eq!(*prev, parent, "height {height} applied before its parent");
        assert_eq!(*hash, expected[i]);
        parent = *hash;
    }
    assert_eq!(walker.store().chain(), expected[..expected.len() - 1].to_vec());
}

// ----------------------------------------------------------------------
// Shuffled layouts
// ----------------------------------------------------------------------

#[test]
fn shuffled_regions_apply_in_height_order() {
    let mut chain = ChainBuilder::new();
    chain.push_empty(40);

    for seed in 0..10 {
        let dir = tempfile::tempdir().unwrap();
        write_archive(dir.path(), &shuffled(chain.blocks(), seed), 7);

        let (walker, outcome) = walk(dir.path(), 100).unwrap();
        assert_prefix(&walker, &chain);
        assert_eq!(outcome, WalkOutcome::Exhausted(walker.store().last_applied().unwrap()));
        assert!(walker.state().skipped.is_empty(), "seed {seed} left blocks held");
    }
}

#[test]
fn in_order_archive_holds_nothing() {
    let mut chain = ChainBuilder::new();
    chain.push_empty(25);
    let dir = tempfile::tempdir().unwrap();
    write_archive(dir.path(), chain.blocks(), 10);

    let (walker, _) = walk(dir.path(), 1).unwrap();
    assert_prefix(&walker, &chain);
    assert_eq!(walker.state().pending.as_ref().unwrap().hash, chain.hashes()[24]);
}

#[test]
fn duplicated_records_are_applied_once() {
    let mut chain = ChainBuilder::new();
    chain.push_empty(10);
    let mut layout = chain.blocks().to_vec();
    layout.extend_from_slice(&chain.blocks()[3..6]);
    let dir = tempfile::tempdir().unwrap();
    write_archive(dir.path(), &layout, 4);

    let (walker, _) = walk(dir.path(), 10).unwrap();
    assert_prefix(&walker, &chain);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn any_permutation_is_causal(
        order in Just((0..24usize).collect::<Vec<_>>()).prop_shuffle(),
        per_region in 1usize..9,
    ) {
        let mut chain = ChainBuilder::new();
        chain.push_empty(24);
        let layout: Vec<_> = order.iter().map(|i| chain.blocks()[*i].clone()).collect();
        let dir = tempfile::tempdir().unwrap();
        write_archive(dir.path(), &layout, per_region);

        let (walker, _) = walk(dir.path(), 24).unwrap();
        let applied = &walker.visitor().applied;
        prop_assert_eq!(applied.len(), 23);
        for (i, (height, hash, _)) in applied.iter().enumerate() {
            prop_assert_eq!(*height, i as u64);
            prop_assert_eq!(*hash, chain.hashes()[i]);
        }
    }
}

// ----------------------------------------------------------------------
// Skipped-block bound
// ----------------------------------------------------------------------

#[test]
fn reversed_archive_exceeds_bound() {
    let mut chain = ChainBuilder::new();
    chain.push_empty(20);
    let mut reversed = chain.blocks().to_vec();
    reversed.reverse();
    let dir = tempfile::tempdir().unwrap();
    write_archive(dir.path(), &reversed, 5);

    match walk(dir.path(), 5) {
        Err(SleuthError::Walk(WalkError::TooManySkipped { bound, awaiting, .. })) => {
            assert_eq!(bound, 5);
            assert_eq!(awaiting, BlockHash::all_zeros());
        }
        other => panic!("expected TooManySkipped, got {:?}", other.map(|(_, o)| o)),
    }
}

#[test]
fn reversed_archive_within_bound_completes() {
    let mut chain = ChainBuilder::new();
    chain.push_empty(20);
    let mut reversed = chain.blocks().to_vec();
    reversed.reverse();
    let dir = tempfile::tempdir().unwrap();
    write_archive(dir.path(), &reversed, 5);

    let (walker, _) = walk(dir.path(), 20).unwrap();
    assert_prefix(&walker, &chain);
}

// ----------------------------------------------------------------------
// Forks
// ----------------------------------------------------------------------

#[test]
fn fork_outcome_does_not_depend_on_region_split() {
    let mut chain = ChainBuilder::new();
    chain.push_empty(8);
    let b = chain.blocks().to_vec();
    let rival = chain.detached(b[3].block_hash());
    let rival_child = chain.detached(rival.block_hash());

    // rival arrives while b[4] is pending; b[5] (child of b[4]) arrives first
    let layout = vec![
        b[0].clone(), b[1].clone(), b[2].clone(), b[3].clone(), b[4].clone(),
        rival.clone(), b[5].clone(), rival_child.clone(), b[6].clone(), b[7].clone(),
    ];

    for per_region in [1, 2, 3, 10] {
        let dir = tempfile::tempdir().unwrap();
        write_archive(dir.path(), &layout, per_region);
        let (walker, _) = walk(dir.path(), 10).unwrap();
        assert_prefix(&walker, &chain);
        let applied: Vec<_> = walker.visitor().applied.iter().map(|a| a.1).collect();
        assert!(!applied.contains(&rival.block_hash()));
    }
}
