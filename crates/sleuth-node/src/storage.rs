//! RocksDB-backed persistent ingestion state.
//!
//! Implements [`BlockStore`] and [`UtxoMirror`] using RocksDB column families
//! for applied blocks, the height index, unspent-output buckets, the
//! clustering forest snapshot, and metadata. All multi-key mutations use an
//! atomic [`WriteBatch`].

use std::collections::HashSet;
use std::path::Path;

use bitcoin::block::Header;
use bitcoin::consensus;
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, Txid};
use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use tracing::debug;

use sleuth_cluster::{DisjointSet, ForestSink};
use sleuth_core::error::{SleuthError, UtxoError};
use sleuth_core::traits::BlockStore;
use sleuth_core::types::{AppliedBlock, BlockLocation, Checkpoint};
use sleuth_core::utxo::{MirrorOp, OutputSet, UtxoMirror};

// --- Column family names ---

const CF_BLOCKS: &str = "blocks";
const CF_HEIGHT_INDEX: &str = "height_index";
const CF_UTXOS: &str = "utxos";
const CF_FOREST: &str = "forest";
const CF_METADATA: &str = "metadata";

/// All column family names.
const ALL_CFS: &[&str] = &[CF_BLOCKS, CF_HEIGHT_INDEX, CF_UTXOS, CF_FOREST, CF_METADATA];

// --- Metadata keys ---

const META_TIP_HEIGHT: &[u8] = b"tip_height";
const META_TIP_HASH: &[u8] = b"tip_hash";

const FOREST_KEY: &[u8] = b"snapshot";

/// Length of a mirror key: txid || index(BE u64).
const UTXO_KEY_LEN: usize = 40;

/// Durable record of an applied block.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct StoredBlock {
    pub height: u64,
    pub location: BlockLocation,
    /// Consensus-encoded 80-byte header.
    pub header: Vec<u8>,
    pub tx_count: u32,
}

impl StoredBlock {
    fn from_applied(block: &AppliedBlock) -> Self {
        Self {
            height: block.height,
            location: block.location,
            header: consensus::serialize(&block.block.header),
            tx_count: block.block.txdata.len() as u32,
        }
    }

    pub fn header(&self) -> Result<Header, SleuthError> {
        consensus::deserialize(&self.header).map_err(|e| SleuthError::Storage(e.to_string()))
    }
}

/// RocksDB-backed ingestion state.
///
/// One instance holds the block index and forest; when the unspent-output
/// mirror is enabled a second instance at the mirror path serves
/// [`UtxoMirror`] from its `utxos` family.
pub struct RocksStore {
    db: DB,
}

impl RocksStore {
    /// Open or create a RocksDB database at the given path.
    ///
    /// Creates all column families if they don't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SleuthError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors)
            .map_err(storage_err)?;
        debug!(path = %path.as_ref().display(), "rocks store opened");
        Ok(Self { db })
    }

    /// Flush all in-memory buffers to disk.
    pub fn flush(&self) -> Result<(), SleuthError> {
        self.db.flush().map_err(storage_err)
    }

    /// Trigger manual compaction across all column families.
    pub fn compact(&self) -> Result<(), SleuthError> {
        for cf_name in ALL_CFS {
            let cf = self.cf_handle(cf_name)?;
            self.db.compact_range_cf(cf, None::<&[u8]>, None::<&[u8]>);
        }
        Ok(())
    }

    /// Durable record for `hash`, if it was applied.
    pub fn stored_block(&self, hash: &BlockHash) -> Result<Option<StoredBlock>, SleuthError> {
        let cf = self.cf_handle(CF_BLOCKS)?;
        match self
            .db
            .get_cf(cf, hash.to_byte_array())
            .map_err(storage_err)?
        {
            Some(data) => {
                let (block, _): (StoredBlock, _) =
                    bincode::decode_from_slice(&data, bincode::config::standard())
                        .map_err(storage_err)?;
                Ok(Some(block))
            }
            None => Ok(None),
        }
    }

    /// Hash applied at `height`.
    pub fn block_hash_at(&self, height: u64) -> Result<Option<BlockHash>, SleuthError> {
        let cf = self.cf_handle(CF_HEIGHT_INDEX)?;
        match self
            .db
            .get_cf(cf, Self::height_key(height))
            .map_err(storage_err)?
        {
            Some(bytes) => Ok(Some(decode_hash(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Persist the whole clustering forest as one write.
    pub fn save_forest(&self, forest: &DisjointSet) -> Result<(), SleuthError> {
        let bytes = forest.snapshot()?;
        let cf = self.cf_handle(CF_FOREST)?;
        self.db.put_cf(cf, FOREST_KEY, &bytes).map_err(storage_err)?;
        debug!(labels = forest.len(), bytes = bytes.len(), "forest saved");
        Ok(())
    }

    /// The last saved forest, if any.
    pub fn load_forest(&self) -> Result<Option<DisjointSet>, SleuthError> {
        let cf = self.cf_handle(CF_FOREST)?;
        match self.db.get_cf(cf, FOREST_KEY).map_err(storage_err)? {
            Some(bytes) => Ok(Some(DisjointSet::from_snapshot(&bytes)?)),
            None => Ok(None),
        }
    }

    // --- Internal helpers ---

    /// Get a column family handle.
    fn cf_handle(&self, name: &str) -> Result<&rocksdb::ColumnFamily, SleuthError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| SleuthError::Storage(format!("missing column family: {name}")))
    }

    /// Encode a height as big-endian bytes for ordered iteration.
    fn height_key(height: u64) -> [u8; 8] {
        height.to_be_bytes()
    }

    /// Encode a mirror key: txid || index(BE).
    fn utxo_key(txid: &Txid, index: u64) -> [u8; UTXO_KEY_LEN] {
        let mut key = [0u8; UTXO_KEY_LEN];
        key[..32].copy_from_slice(&txid.to_byte_array());
        key[32..].copy_from_slice(&index.to_be_bytes());
        key
    }

    /// Key range covering every output of `txid`.
    fn utxo_range(txid: &Txid) -> ([u8; UTXO_KEY_LEN], [u8; UTXO_KEY_LEN]) {
        (
            Self::utxo_key(txid, 0),
            Self::utxo_key(txid, u64::from(u32::MAX) + 1),
        )
    }

    fn mirror_batch(&self, ops: &[MirrorOp]) -> Result<WriteBatch, SleuthError> {
        let cf = self.cf_handle(CF_UTXOS)?;
        let mut batch = WriteBatch::default();
        for op in ops {
            match op {
                MirrorOp::ReplaceSet { txid, outputs } => {
                    let (from, to) = Self::utxo_range(txid);
                    batch.delete_range_cf(cf, from, to);
                    for (index, token) in outputs {
                        batch.put_cf(cf, Self::utxo_key(txid, u64::from(*index)), token.as_bytes());
                    }
                }
                MirrorOp::Delete { txid, index } => {
                    batch.delete_cf(cf, Self::utxo_key(txid, u64::from(*index)));
                }
                MirrorOp::DeleteSet { txid } => {
                    let (from, to) = Self::utxo_range(txid);
                    batch.delete_range_cf(cf, from, to);
                }
            }
        }
        Ok(batch)
    }

    fn scan_utxos(&self) -> Result<Vec<(Txid, OutputSet)>, SleuthError> {
        let cf = self.cf_handle(CF_UTXOS)?;
        let mut sets: Vec<(Txid, OutputSet)> = Vec::new();

        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item.map_err(storage_err)?;
            if key.len() != UTXO_KEY_LEN {
                return Err(SleuthError::Storage(format!(
                    "invalid utxo key length: {}",
                    key.len()
                )));
            }
            let mut txid_bytes = [0u8; 32];
            txid_bytes.copy_from_slice(&key[..32]);
            let txid = Txid::from_byte_array(txid_bytes);
            let mut index_bytes = [0u8; 8];
            index_bytes.copy_from_slice(&key[32..]);
            let index = u32::try_from(u64::from_be_bytes(index_bytes))
                .map_err(|e| SleuthError::Storage(e.to_string()))?;
            let token = String::from_utf8(value.to_vec()).map_err(storage_err)?;

            // keys sort by txid, so one bucket's entries are adjacent
            if let Some((last, outputs)) = sets.last_mut() {
                if *last == txid {
                    outputs.insert(index, token);
                    continue;
                }
            }
            sets.push((txid, OutputSet::from([(index, token)])));
        }
        Ok(sets)
    }

    fn tip_hash(&self) -> Result<Option<BlockHash>, SleuthError> {
        let cf = self.cf_handle(CF_METADATA)?;
        match self.db.get_cf(cf, META_TIP_HASH).map_err(storage_err)? {
            Some(bytes) => Ok(Some(decode_hash(&bytes)?)),
            None => Ok(None),
        }
    }

    fn tip_height(&self) -> Result<Option<u64>, SleuthError> {
        let cf = self.cf_handle(CF_METADATA)?;
        match self.db.get_cf(cf, META_TIP_HEIGHT).map_err(storage_err)? {
            Some(bytes) if bytes.len() == 8 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes);
                Ok(Some(u64::from_le_bytes(raw)))
            }
            Some(_) => Err(SleuthError::Storage("invalid metadata value length".into())),
            None => Ok(None),
        }
    }
}

impl BlockStore for RocksStore {
    fn store_block(&self, block: &AppliedBlock) -> Result<(), SleuthError> {
        let expected = self.tip_height()?.map_or(0, |h| h + 1);
        if block.height != expected {
            return Err(SleuthError::Storage(format!(
                "height mismatch: expected {expected}, got {}",
                block.height
            )));
        }
        if self.contains_block(&block.hash)? {
            return Err(SleuthError::Storage(format!(
                "block {} already stored",
                block.hash
            )));
        }

        let record = bincode::encode_to_vec(
            StoredBlock::from_applied(block),
            bincode::config::standard(),
        )
        .map_err(storage_err)?;
        let hash = block.hash.to_byte_array();

        let cf_blocks = self.cf_handle(CF_BLOCKS)?;
        let cf_height = self.cf_handle(CF_HEIGHT_INDEX)?;
        let cf_meta = self.cf_handle(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_blocks, hash, record);
        batch.put_cf(cf_height, Self::height_key(block.height), hash);
        batch.put_cf(cf_meta, META_TIP_HEIGHT, block.height.to_le_bytes());
        batch.put_cf(cf_meta, META_TIP_HASH, hash);
        self.db.write(batch).map_err(storage_err)
    }

    fn last_applied_height(&self) -> Result<Option<u64>, SleuthError> {
        self.tip_height()
    }

    fn last_applied(&self) -> Result<Option<Checkpoint>, SleuthError> {
        match (self.tip_height()?, self.tip_hash()?) {
            (Some(height), Some(hash)) => Ok(Some(Checkpoint { height, hash })),
            _ => Ok(None),
        }
    }

    fn list_stored_after(&self, height: u64) -> Result<HashSet<BlockHash>, SleuthError> {
        let Some(start) = height.checked_add(1) else {
            return Ok(HashSet::new());
        };
        let cf = self.cf_handle(CF_HEIGHT_INDEX)?;
        let start_key = Self::height_key(start);
        let mut hashes = HashSet::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&start_key, Direction::Forward))
        {
            let (_, value) = item.map_err(storage_err)?;
            hashes.insert(decode_hash(&value)?);
        }
        Ok(hashes)
    }

    fn contains_block(&self, hash: &BlockHash) -> Result<bool, SleuthError> {
        let cf = self.cf_handle(CF_BLOCKS)?;
        Ok(self
            .db
            .get_pinned_cf(cf, hash.to_byte_array())
            .map_err(storage_err)?
            .is_some())
    }

    fn region_of_height(&self, height: u64) -> Result<Option<u32>, SleuthError> {
        let Some(hash) = self.block_hash_at(height)? else {
            return Ok(None);
        };
        Ok(self.stored_block(&hash)?.map(|b| b.location.region))
    }
}

impl ForestSink for RocksStore {
    fn save_forest(&self, forest: &DisjointSet) -> Result<(), SleuthError> {
        RocksStore::save_forest(self, forest)
    }
}

impl UtxoMirror for RocksStore {
    fn apply(&self, ops: &[MirrorOp]) -> Result<(), UtxoError> {
        let batch = self
            .mirror_batch(ops)
            .map_err(|e| UtxoError::Mirror(e.to_string()))?;
        self.db
            .write(batch)
            .map_err(|e| UtxoError::Mirror(e.to_string()))
    }

    fn load_all(&self) -> Result<Vec<(Txid, OutputSet)>, UtxoError> {
        self.scan_utxos().map_err(|e| UtxoError::Mirror(e.to_string()))
    }
}

fn storage_err(e: impl std::fmt::Display) -> SleuthError {
    SleuthError::Storage(e.to_string())
}

fn decode_hash(bytes: &[u8]) -> Result<BlockHash, SleuthError> {
    let raw: [u8; 32] = bytes
        .try_into()
        .map_err(|_| SleuthError::Storage(format!("invalid hash length: {}", bytes.len())))?;
    Ok(BlockHash::from_byte_array(raw))
}
