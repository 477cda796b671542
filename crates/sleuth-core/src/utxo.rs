//! Unspent-output tracker.
//!
//! Maps `(txid, output index)` to the token of the address that output pays.
//! The in-memory map is authoritative and sits behind a reader/writer lock so
//! lookups can run from worker threads. An optional [`UtxoMirror`] receives the
//! same mutations in batches; a batch is only queued after the in-memory view
//! has changed, so the mirror can lag but never lead.

use std::collections::{BTreeMap, HashMap};

use bitcoin::Txid;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::UtxoError;
use crate::types::Token;

/// Output index → token for one transaction.
pub type OutputSet = BTreeMap<u32, Token>;

/// One queued mutation for the durable mirror.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MirrorOp {
    /// Replace every entry of the bucket with `outputs`.
    ReplaceSet { txid: Txid, outputs: OutputSet },
    /// Remove a single entry.
    Delete { txid: Txid, index: u32 },
    /// Remove the whole bucket.
    DeleteSet { txid: Txid },
}

/// Durable side-store for the tracker.
///
/// Buckets are keyed by txid; entries inside a bucket by the big-endian
/// 8-byte output index.
pub trait UtxoMirror: Send + Sync {
    /// Apply `ops` in order as one atomic write.
    fn apply(&self, ops: &[MirrorOp]) -> Result<(), UtxoError>;

    /// Every bucket currently stored.
    fn load_all(&self) -> Result<Vec<(Txid, OutputSet)>, UtxoError>;
}

struct MirrorHandle {
    mirror: Box<dyn UtxoMirror>,
    queue: Mutex<Vec<MirrorOp>>,
    batch_size: usize,
}

/// Unspent-output index, in memory with an optional durable mirror.
pub struct UtxoTracker {
    sets: RwLock<HashMap<Txid, OutputSet>>,
    mirror: Option<MirrorHandle>,
}

impl Default for UtxoTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl UtxoTracker {
    /// Memory-only tracker.
    pub fn new() -> Self {
        Self {
            sets: RwLock::new(HashMap::new()),
            mirror: None,
        }
    }

    /// Tracker mirroring every mutation to `mirror`, flushing every `batch_size` ops.
    pub fn with_mirror(mirror: Box<dyn UtxoMirror>, batch_size: usize) -> Self {
        Self {
            sets: RwLock::new(HashMap::new()),
            mirror: Some(MirrorHandle {
                mirror,
                queue: Mutex::new(Vec::new()),
                batch_size: batch_size.max(1),
            }),
        }
    }

    /// Replace the full output set of `txid`.
    pub fn put(&self, txid: Txid, outputs: OutputSet) -> Result<(), UtxoError> {
        let op = self.mirror.as_ref().map(|_| MirrorOp::ReplaceSet {
            txid,
            outputs: outputs.clone(),
        });
        self.sets.write().insert(txid, outputs);
        self.enqueue(op)
    }

    pub fn get(&self, txid: &Txid, index: u32) -> Result<Token, UtxoError> {
        self.sets
            .read()
            .get(txid)
            .and_then(|set| set.get(&index))
            .cloned()
            .ok_or(UtxoError::NotFound {
                txid: *txid,
                index: Some(index),
            })
    }

    pub fn get_set(&self, txid: &Txid) -> Result<OutputSet, UtxoError> {
        self.sets
            .read()
            .get(txid)
            .cloned()
            .ok_or(UtxoError::NotFound {
                txid: *txid,
                index: None,
            })
    }

    /// Remove one entry; the bucket goes with its last entry.
    pub fn delete(&self, txid: &Txid, index: u32) -> Result<(), UtxoError> {
        let emptied = {
            let mut sets = self.sets.write();
            let set = sets.get_mut(txid).ok_or(UtxoError::NotFound {
                txid: *txid,
                index: Some(index),
            })?;
            if set.remove(&index).is_none() {
                return Err(UtxoError::NotFound {
                    txid: *txid,
                    index: Some(index),
                });
            }
            let emptied = set.is_empty();
            if emptied {
                sets.remove(txid);
            }
            emptied
        };
        let op = self.mirror.as_ref().map(|_| {
            if emptied {
                MirrorOp::DeleteSet { txid: *txid }
            } else {
                MirrorOp::Delete { txid: *txid, index }
            }
        });
        self.enqueue(op)
    }

    /// Look up and remove one entry under a single write lock.
    pub fn spend(&self, txid: &Txid, index: u32) -> Result<Token, UtxoError> {
        let (token, emptied) = {
            let mut sets = self.sets.write();
            let not_found = UtxoError::NotFound {
                txid: *txid,
                index: Some(index),
            };
            let set = sets.get_mut(txid).ok_or_else(|| not_found.clone())?;
            let token = set.remove(&index).ok_or(not_found)?;
            let emptied = set.is_empty();
            if emptied {
                sets.remove(txid);
            }
            (token, emptied)
        };
        let op = self.mirror.as_ref().map(|_| {
            if emptied {
                MirrorOp::DeleteSet { txid: *txid }
            } else {
                MirrorOp::Delete { txid: *txid, index }
            }
        });
        self.enqueue(op)?;
        Ok(token)
    }

    /// Remove every entry of `txid`.
    pub fn delete_set(&self, txid: &Txid) -> Result<(), UtxoError> {
        if self.sets.write().remove(txid).is_none() {
            return Err(UtxoError::NotFound {
                txid: *txid,
                index: None,
            });
        }
        let op = self.mirror.as_ref().map(|_| MirrorOp::DeleteSet { txid: *txid });
        self.enqueue(op)
    }

    /// Rebuild the in-memory view from the mirror. Returns the number of buckets loaded.
    ///
    /// Without a mirror this is a no-op returning 0.
    pub fn restore(&self) -> Result<usize, UtxoError> {
        let Some(handle) = &self.mirror else {
            return Ok(0);
        };
        let buckets = handle.mirror.load_all()?;
        let count = buckets.len();
        let mut sets = self.sets.write();
        sets.clear();
        sets.extend(buckets.into_iter().filter(|(_, set)| !set.is_empty()));
        info!(buckets = count, "restored unspent outputs from mirror");
        Ok(count)
    }

    /// Push every queued mirror op. The queue lock is released before the write.
    pub fn flush(&self) -> Result<usize, UtxoError> {
        let Some(handle) = &self.mirror else {
            return Ok(0);
        };
        let ops = std::mem::take(&mut *handle.queue.lock());
        if ops.is_empty() {
            return Ok(0);
        }
        handle.mirror.apply(&ops)?;
        debug!(ops = ops.len(), "flushed utxo mirror batch");
        Ok(ops.len())
    }

    /// Mirror ops waiting for the next flush.
    pub fn pending_ops(&self) -> usize {
        self.mirror.as_ref().map_or(0, |h| h.queue.lock().len())
    }

    /// Number of transactions with at least one unspent entry.
    pub fn len(&self) -> usize {
        self.sets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.read().is_empty()
    }

    /// Total unspent entries across all transactions.
    pub fn entry_count(&self) -> usize {
        self.sets.read().values().map(BTreeMap::len).sum()
    }

    fn enqueue(&self, op: Option<MirrorOp>) -> Result<(), UtxoError> {
        let (Some(handle), Some(op)) = (&self.mirror, op) else {
            return Ok(());
        };
        let full = {
            let mut queue = handle.queue.lock();
            queue.push(op);
            queue.len() >= handle.batch_size
        };
        if full {
            self.flush()?;
        }
        Ok(())
    }
}

/// In-memory [`UtxoMirror`] for tests and dry runs.
#[derive(Default)]
pub struct MemoryMirror {
    buckets: Mutex<HashMap<Txid, OutputSet>>,
    fail_writes: std::sync::atomic::AtomicBool,
}

impl MemoryMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later `apply` fail.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn bucket(&self, txid: &Txid) -> Option<OutputSet> {
        self.buckets.lock().get(txid).cloned()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }
}

impl UtxoMirror for MemoryMirror {
    fn apply(&self, ops: &[MirrorOp]) -> Result<(), UtxoError> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(UtxoError::Mirror("write rejected".into()));
        }
        let mut buckets = self.buckets.lock();
        for op in ops {
            match op {
                MirrorOp::ReplaceSet { txid, outputs } => {
                    buckets.insert(*txid, outputs.clone());
                }
                MirrorOp::Delete { txid, index } => {
                    if let Some(set) = buckets.get_mut(txid) {
                        set.remove(index);
                        if set.is_empty() {
                            buckets.remove(txid);
                        }
                    }
                }
                MirrorOp::DeleteSet { txid } => {
                    buckets.remove(txid);
                }
            }
        }
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<(Txid, OutputSet)>, UtxoError> {
        Ok(self
            .buckets
            .lock()
            .iter()
            .map(|(txid, set)| (*txid, set.clone()))
            .collect())
    }
}

impl<M: UtxoMirror + ?Sized> UtxoMirror for std::sync::Arc<M> {
    fn apply(&self, ops: &[MirrorOp]) -> Result<(), UtxoError> {
        (**self).apply(ops)
    }

    fn load_all(&self) -> Result<Vec<(Txid, OutputSet)>, UtxoError> {
        (**self).load_all()
    }
}
