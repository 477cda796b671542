//! Resume planning from the last durably applied block.
//!
//! The archive is append-only and written in arrival order, so the child of
//! the checkpoint can sit in a region before the checkpoint's own. The scan
//! therefore starts at the earliest region holding any of the last
//! `restore_window` stored blocks; regions before it are never read again.

use std::collections::HashSet;

use bitcoin::BlockHash;
use sleuth_core::error::SleuthError;
use sleuth_core::traits::BlockStore;
use sleuth_core::types::Checkpoint;
use tracing::{debug, info};

/// Where and how a resumed walk starts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResumePoint {
    pub checkpoint: Checkpoint,
    /// First region the scan reads.
    pub start_region: u32,
    /// Blocks stored inside the window; these are skipped, not held.
    pub known: HashSet<BlockHash>,
}

/// Plan a resume from `store`. `None` when nothing has been applied yet.
pub fn plan_resume<S: BlockStore + ?Sized>(
    store: &S,
    restore_window: u64,
) -> Result<Option<ResumePoint>, SleuthError> {
    let Some(checkpoint) = store.last_applied()? else {
        debug!("no checkpoint stored, walking from genesis");
        return Ok(None);
    };

    let floor = checkpoint.height.saturating_sub(restore_window);
    let mut start_region: Option<u32> = None;
    for height in floor..=checkpoint.height {
        if let Some(region) = store.region_of_height(height)? {
            start_region = Some(start_region.map_or(region, |r| r.min(region)));
        }
    }
    let start_region = start_region.unwrap_or(0);
    let known = store.list_stored_after(floor)?;

    info!(
        height = checkpoint.height,
        hash = %checkpoint.hash,
        start_region,
        window_floor = floor,
        known = known.len(),
        "resuming from checkpoint"
    );

    Ok(Some(ResumePoint {
        checkpoint,
        start_region,
        known,
    }))
}
