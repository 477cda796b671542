//! Ingestion composition.
//!
//! The [`Ingestor`] wires the archive, the RocksDB block store, the
//! unspent-output tracker (optionally mirrored), the rayon pool and the
//! clustering engine into one [`ChainWalker`].

use std::fs::File;
use std::sync::Arc;

use tracing::{info, warn};

use sleuth_cluster::{write_clusters, ClusterEngine, ClusterStats, ForestSink};
use sleuth_core::archive::Archive;
use sleuth_core::cancel::CancelToken;
use sleuth_core::error::SleuthError;
use sleuth_core::traits::BlockStore;
use sleuth_core::utxo::UtxoTracker;
use sleuth_walker::{ChainWalker, WalkOutcome};

use crate::config::IngestConfig;
use crate::storage::RocksStore;

/// Summary of one [`Ingestor::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct IngestReport {
    pub outcome: WalkOutcome,
    /// Blocks applied during this run.
    pub applied_blocks: u64,
    /// Blocks still held awaiting a parent when the walk stopped.
    pub skipped_pending: usize,
    pub stats: ClusterStats,
    pub labels: usize,
    pub clusters: usize,
    /// Rows written to the export file, when one is configured.
    pub exported_rows: Option<usize>,
}

pub struct Ingestor {
    config: IngestConfig,
    store: Arc<RocksStore>,
    tracker: Arc<UtxoTracker>,
    walker: ChainWalker<Arc<RocksStore>, ClusterEngine>,
}

impl Ingestor {
    /// Open storage, restore durable state and position the walker.
    pub fn open(config: IngestConfig) -> Result<Self, SleuthError> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;

        let store = Arc::new(RocksStore::open(config.db_path())?);
        let checkpoint = store.last_applied()?;

        let tracker = if config.utxo_mirror {
            let mirror = RocksStore::open(config.mirror_path())?;
            let tracker = UtxoTracker::with_mirror(Box::new(mirror), config.mirror_batch_size);
            let restored = tracker.restore()?;
            info!(
                restored,
                path = %config.mirror_path().display(),
                "unspent outputs restored from mirror"
            );
            tracker
        } else {
            if let Some(cp) = checkpoint {
                warn!(
                    height = cp.height,
                    "resuming without utxo mirror: spends of earlier outputs will be unresolved"
                );
            }
            UtxoTracker::new()
        };
        let tracker = Arc::new(tracker);

        let forest = store.load_forest()?.unwrap_or_default();
        if !forest.is_empty() {
            info!(labels = forest.len(), "clustering forest restored");
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_threads)
            .thread_name(|i| format!("sleuth-worker-{i}"))
            .build()
            .map_err(|e| SleuthError::Config(e.to_string()))?;
        let engine = ClusterEngine::with_forest(
            Arc::clone(&tracker),
            config.network,
            Arc::new(pool),
            forest,
        )
        .with_snapshots(
            Arc::clone(&store) as Arc<dyn ForestSink>,
            config.snapshot_interval,
        );

        let archive = Archive::open(config.archive_dir.clone(), config.network)?;
        info!(
            archive = %config.archive_dir.display(),
            regions = archive.region_count(),
            network = %config.network,
            checkpoint = ?checkpoint,
            "ingestor opened"
        );
        let walker = ChainWalker::new(archive, Arc::clone(&store), engine, config.walker_config())?;

        Ok(Self {
            config,
            store,
            tracker,
            walker,
        })
    }

    /// Walk the archive, then flush the tracker, persist the forest and
    /// write the export when configured.
    ///
    /// A failed walk still persists what was applied before the error, so
    /// the next run resumes with the clusters built so far.
    pub fn run(&mut self, cancel: &CancelToken) -> Result<IngestReport, SleuthError> {
        let outcome = match self.walker.run(cancel) {
            Ok(outcome) => outcome,
            Err(err) => {
                if let Err(persist_err) = self.persist() {
                    warn!(error = %persist_err, "could not persist state after walk failure");
                }
                return Err(err);
            }
        };

        let flushed = self.persist()?;

        let exported_rows = match &self.config.export_path {
            Some(path) => {
                let file = File::create(path)?;
                Some(write_clusters(self.walker.visitor_mut().forest_mut(), file)?)
            }
            None => None,
        };

        let engine = self.walker.visitor();
        let report = IngestReport {
            outcome,
            applied_blocks: self.walker.applied_blocks(),
            skipped_pending: self.walker.state().skipped.len(),
            stats: engine.stats().clone(),
            labels: engine.forest().len(),
            clusters: engine.forest().cluster_count(),
            exported_rows,
        };
        info!(
            cancelled = outcome.is_cancelled(),
            height = ?outcome.checkpoint().map(|cp| cp.height),
            applied = report.applied_blocks,
            skipped = report.skipped_pending,
            flushed,
            labels = report.labels,
            clusters = report.clusters,
            "ingestion finished"
        );
        Ok(report)
    }

    /// Flush the tracker mirror, snapshot the forest and flush the store.
    /// Returns the number of mirror operations flushed.
    fn persist(&self) -> Result<usize, SleuthError> {
        let flushed = self.tracker.flush()?;
        self.store.save_forest(self.walker.visitor().forest())?;
        self.store.flush()?;
        Ok(flushed)
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<RocksStore> {
        &self.store
    }

    pub fn tracker(&self) -> &Arc<UtxoTracker> {
        &self.tracker
    }

    pub fn walker(&self) -> &ChainWalker<Arc<RocksStore>, ClusterEngine> {
        &self.walker
    }
}
