//! Chain walker.
//!
//! Pulls blocks out of the archive in file order and applies them in causal
//! order. One parsed block is always held back as *pending*: it is applied
//! only once a block referencing it (or a drained descendant) shows up, so a
//! same-parent sibling arriving in between can still be recognised as a
//! two-block fork. Everything that arrives ahead of its parent waits in the
//! [`SkippedBlocks`] cache.
//!
//! Forks are settled first-seen-child: whichever contender is referenced
//! first wins, no work comparison is made.

use std::collections::HashSet;
use std::time::Duration;

use bitcoin::hashes::Hash;
use bitcoin::BlockHash;
use sleuth_core::archive::Archive;
use sleuth_core::cancel::CancelToken;
use sleuth_core::constants::{
    DEFAULT_POLL_INTERVAL_MS, DEFAULT_PROGRESS_INTERVAL, DEFAULT_RESTORE_WINDOW,
    DEFAULT_SKIPPED_BOUND,
};
use sleuth_core::error::{SleuthError, WalkError};
use sleuth_core::traits::{visit_block, BlockStore, ChainVisitor};
use sleuth_core::types::{AppliedBlock, Checkpoint, ParsedBlock};
use tracing::{debug, info, trace, warn};

use crate::checkpoint::{plan_resume, ResumePoint};
use crate::skipped::SkippedBlocks;

/// Walker tuning.
#[derive(Clone, Debug)]
pub struct WalkerConfig {
    /// Held out-of-order blocks allowed before the run aborts.
    pub skipped_bound: usize,
    /// Blocks before the checkpoint whose regions are rescanned on resume.
    pub restore_window: u64,
    /// Keep polling for appended blocks instead of stopping at the end.
    pub live_tail: bool,
    pub poll_interval: Duration,
    /// Applied blocks between progress log lines. 0 disables them.
    pub progress_interval: u64,
}

impl Default for WalkerConfig {
    fn default() -> Self {
        Self {
            skipped_bound: DEFAULT_SKIPPED_BOUND,
            restore_window: DEFAULT_RESTORE_WINDOW,
            live_tail: false,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

/// What the walker is currently doing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalkPhase {
    /// Reading blocks, waiting for one that extends the goal.
    Seeking,
    /// Persisting and visiting the pending block.
    ApplyingPending,
    /// Two blocks share a parent; waiting for a child of either.
    ForkDetected,
    /// Pulling a run of previously held blocks out of the cache.
    Draining,
    /// Live-tail poll between archive reads.
    Waiting,
    /// All regions consumed.
    Exhausted,
}

/// How a [`ChainWalker::run`] call ended. Both variants carry the last applied block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalkOutcome {
    Exhausted(Option<Checkpoint>),
    Cancelled(Option<Checkpoint>),
}

impl WalkOutcome {
    pub fn checkpoint(&self) -> Option<Checkpoint> {
        match self {
            Self::Exhausted(cp) | Self::Cancelled(cp) => *cp,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

/// Everything needed to continue a walk.
pub struct WalkState {
    /// Hash the next accepted block must reference.
    pub goal_prev_hash: BlockHash,
    /// Height the next applied block receives.
    pub next_height: u64,
    pub last_applied: Option<Checkpoint>,
    /// Parsed block waiting for a child before it is applied.
    pub pending: Option<ParsedBlock>,
    /// Held sibling of `pending` while a fork is unresolved.
    pub fork: Option<BlockHash>,
    pub skipped: SkippedBlocks,
}

impl WalkState {
    /// State before any block is applied: the goal is the zero parent of genesis.
    pub fn genesis(skipped_bound: usize) -> Self {
        Self {
            goal_prev_hash: BlockHash::all_zeros(),
            next_height: 0,
            last_applied: None,
            pending: None,
            fork: None,
            skipped: SkippedBlocks::new(skipped_bound),
        }
    }

    /// State continuing after `checkpoint`.
    pub fn resume(checkpoint: Checkpoint, skipped_bound: usize) -> Self {
        Self {
            goal_prev_hash: checkpoint.hash,
            next_height: checkpoint.height + 1,
            last_applied: Some(checkpoint),
            pending: None,
            fork: None,
            skipped: SkippedBlocks::new(skipped_bound),
        }
    }
}

/// Causal-order walker over an archive.
pub struct ChainWalker<S, V> {
    archive: Archive,
    store: S,
    visitor: V,
    config: WalkerConfig,
    state: WalkState,
    phase: WalkPhase,
    /// Stored blocks seen again by the resume scan.
    known: HashSet<BlockHash>,
    /// Set until the checkpoint's child is found.
    awaiting_checkpoint: Option<Checkpoint>,
    applied: u64,
}

impl<S: BlockStore, V: ChainVisitor> ChainWalker<S, V> {
    /// Build a walker, resuming from the store's last applied block when there is one.
    pub fn new(
        mut archive: Archive,
        store: S,
        visitor: V,
        config: WalkerConfig,
    ) -> Result<Self, SleuthError> {
        archive.set_live_tail(config.live_tail);
        let (state, known, awaiting_checkpoint) =
            match plan_resume(&store, config.restore_window)? {
                Some(ResumePoint {
                    checkpoint,
                    start_region,
                    known,
                }) => {
                    archive.seek(start_region);
                    (
                        WalkState::resume(checkpoint, config.skipped_bound),
                        known,
                        Some(checkpoint),
                    )
                }
                None => (
                    WalkState::genesis(config.skipped_bound),
                    HashSet::new(),
                    None,
                ),
            };

        Ok(Self {
            archive,
            store,
            visitor,
            config,
            state,
            phase: WalkPhase::Seeking,
            known,
            awaiting_checkpoint,
            applied: 0,
        })
    }

    /// Walk until the archive is exhausted (or, in live-tail mode, until cancelled).
    ///
    /// Cancellation is checked once per block read, never in the middle of
    /// applying one.
    pub fn run(&mut self, cancel: &CancelToken) -> Result<WalkOutcome, SleuthError> {
        loop {
            if cancel.is_cancelled() {
                info!(
                    height = ?self.state.last_applied.map(|cp| cp.height),
                    skipped = self.state.skipped.len(),
                    "walk cancelled"
                );
                return Ok(WalkOutcome::Cancelled(self.state.last_applied));
            }

            match self.archive.next_block()? {
                Some(block) => self.process(block)?,
                None => {
                    if let Some(cp) = self.awaiting_checkpoint {
                        return Err(WalkError::CheckpointNotFound {
                            height: cp.height,
                            hash: cp.hash,
                        }
                        .into());
                    }
                    if !self.config.live_tail {
                        self.set_phase(WalkPhase::Exhausted);
                        info!(
                            applied = self.applied,
                            height = ?self.state.last_applied.map(|cp| cp.height),
                            skipped = self.state.skipped.len(),
                            "archive exhausted"
                        );
                        return Ok(WalkOutcome::Exhausted(self.state.last_applied));
                    }
                    self.set_phase(WalkPhase::Waiting);
                    cancel.sleep(self.config.poll_interval);
                }
            }
        }
    }

    fn process(&mut self, block: ParsedBlock) -> Result<(), SleuthError> {
        trace!(hash = %block.hash, location = %block.location, "parsed block");
        if self.known.contains(&block.hash) {
            debug!(hash = %block.hash, "already stored, skipping");
            return Ok(());
        }
        if self.state.pending.as_ref().is_some_and(|p| p.hash == block.hash) {
            debug!(hash = %block.hash, "duplicate of pending block, skipping");
            return Ok(());
        }

        match self.state.fork {
            Some(rival) => self.contest(block, rival)?,
            None => self.accept(block)?,
        }
        self.settle()?;

        let phase = if self.state.fork.is_some() {
            WalkPhase::ForkDetected
        } else {
            WalkPhase::Seeking
        };
        self.set_phase(phase);
        Ok(())
    }

    /// Normal handling of a candidate: extend the goal, or hold it.
    fn accept(&mut self, block: ParsedBlock) -> Result<(), SleuthError> {
        if block.prev_hash() != self.state.goal_prev_hash {
            let sibling_of_pending = self
                .state
                .pending
                .as_ref()
                .is_some_and(|p| p.prev_hash() == block.prev_hash());
            let hash = block.hash;
            if self.hold(block)? && sibling_of_pending {
                warn!(
                    height = self.state.next_height,
                    pending = ?self.state.pending.as_ref().map(|p| p.hash),
                    rival = %hash,
                    "two-block fork detected"
                );
                self.state.fork = Some(hash);
            }
            return Ok(());
        }

        if let Some(cp) = self.awaiting_checkpoint.take() {
            info!(checkpoint = %cp, child = %block.hash, "checkpoint child found");
        }
        if let Some(pending) = self.state.pending.take() {
            self.apply(pending)?;
        }
        self.state.goal_prev_hash = block.hash;
        self.state.pending = Some(block);
        Ok(())
    }

    /// Candidate seen while a fork is open.
    fn contest(&mut self, block: ParsedBlock, rival: BlockHash) -> Result<(), SleuthError> {
        if block.prev_hash() == self.state.goal_prev_hash {
            info!(
                winner = %self.state.goal_prev_hash,
                abandoned = %rival,
                "fork resolved for the pending block"
            );
            self.state.fork = None;
            return self.accept(block);
        }
        if block.prev_hash() == rival {
            self.promote_rival(rival)?;
            return self.accept(block);
        }
        self.hold(block).map(|_| ())
    }

    /// Swap the held rival in as the pending block; the old pending block takes its cache slot.
    fn promote_rival(&mut self, rival: BlockHash) -> Result<(), SleuthError> {
        let missing = || WalkError::ForkContenderMissing { hash: rival };
        let parent = self
            .state
            .pending
            .as_ref()
            .map(ParsedBlock::prev_hash)
            .ok_or_else(missing)?;
        let promoted = self
            .state
            .skipped
            .take(&parent)
            .filter(|b| b.hash == rival)
            .ok_or_else(missing)?;

        self.state.fork = None;
        self.state.goal_prev_hash = rival;
        if let Some(loser) = self.state.pending.replace(promoted) {
            info!(winner = %rival, abandoned = %loser.hash, "fork resolved for the rival");
            self.state.skipped.insert(loser);
        }
        Ok(())
    }

    /// Hold an out-of-order block. Returns `false` when it was already stored.
    fn hold(&mut self, block: ParsedBlock) -> Result<bool, SleuthError> {
        if self.store.contains_block(&block.hash)? {
            debug!(hash = %block.hash, "already stored, not holding");
            return Ok(false);
        }
        trace!(
            hash = %block.hash,
            awaiting = %block.prev_hash(),
            location = %block.location,
            "holding out-of-order block"
        );
        self.state.skipped.insert(block);
        if self.state.skipped.exceeds_bound() {
            return Err(WalkError::TooManySkipped {
                bound: self.state.skipped.bound(),
                awaiting: self.state.goal_prev_hash,
                height: self.state.next_height,
            }
            .into());
        }
        Ok(true)
    }

    /// Resolve an open fork from the cache if possible, then drain.
    fn settle(&mut self) -> Result<(), SleuthError> {
        if let Some(rival) = self.state.fork {
            if !self.state.skipped.contains(&rival) {
                return Ok(());
            }
            debug!(rival = %rival, "rival already has a held child");
            self.promote_rival(rival)?;
        }
        self.drain()
    }

    /// Apply the run of held blocks that now extends the goal. The last one stays pending.
    fn drain(&mut self) -> Result<(), SleuthError> {
        loop {
            let goal = self.state.goal_prev_hash;
            let Some(next) = self.state.skipped.take(&goal) else {
                return Ok(());
            };
            self.set_phase(WalkPhase::Draining);
            if let Some(pending) = self.state.pending.take() {
                self.apply(pending)?;
            }
            debug!(
                hash = %next.hash,
                remaining = self.state.skipped.len(),
                "drained held block"
            );
            self.state.goal_prev_hash = next.hash;
            self.state.pending = Some(next);
        }
    }

    fn apply(&mut self, parsed: ParsedBlock) -> Result<(), SleuthError> {
        self.set_phase(WalkPhase::ApplyingPending);
        let block = AppliedBlock::from_parsed(parsed, self.state.next_height);
        // a block is only checkpointed once the visitor has seen all of it
        visit_block(&mut self.visitor, &block)?;
        self.store.store_block(&block)?;
        self.visitor.block_committed(&block)?;

        self.state.next_height += 1;
        self.state.last_applied = Some(block.checkpoint());
        self.applied += 1;

        trace!(height = block.height, hash = %block.hash, "applied block");
        if self.config.progress_interval > 0 && block.height % self.config.progress_interval == 0 {
            info!(
                height = block.height,
                hash = %block.hash,
                location = %block.location,
                skipped = self.state.skipped.len(),
                "walk progress"
            );
        }
        Ok(())
    }

    fn set_phase(&mut self, phase: WalkPhase) {
        if self.phase != phase {
            trace!(from = ?self.phase, to = ?phase, "walk phase");
            self.phase = phase;
        }
    }

    pub fn phase(&self) -> WalkPhase {
        self.phase
    }

    pub fn state(&self) -> &WalkState {
        &self.state
    }

    /// Blocks applied by this walker instance.
    pub fn applied_blocks(&self) -> u64 {
        self.applied
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn visitor(&self) -> &V {
        &self.visitor
    }

    pub fn visitor_mut(&mut self) -> &mut V {
        &mut self.visitor
    }
}
