//! Ingestion configuration.
//!
//! Sources are layered: defaults, then an optional TOML file, then
//! `SLEUTH_*` environment variables. The binary applies CLI flags last.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use sleuth_core::constants::{
    NetworkType, DEFAULT_MIRROR_BATCH, DEFAULT_POLL_INTERVAL_MS, DEFAULT_PROGRESS_INTERVAL,
    DEFAULT_RESTORE_WINDOW, DEFAULT_SKIPPED_BOUND, DEFAULT_SNAPSHOT_INTERVAL,
};
use sleuth_core::error::SleuthError;
use sleuth_walker::WalkerConfig;

const ENV_PREFIX: &str = "SLEUTH";

/// Configuration for one ingestion run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Directory holding `blkNNNNN.dat` regions.
    pub archive_dir: PathBuf,
    /// Root directory for all persistent data.
    pub data_dir: PathBuf,
    pub network: NetworkType,
    /// Maximum number of blocks held while awaiting their parent.
    pub skipped_bound: usize,
    /// Blocks below the checkpoint rescanned on resume.
    pub restore_window: u64,
    /// Keep polling the last region for new blocks instead of stopping.
    pub live_tail: bool,
    pub poll_interval_ms: u64,
    /// Mirror the unspent-output map to RocksDB.
    pub utxo_mirror: bool,
    /// Defaults to `<data_dir>/utxo`.
    pub utxo_mirror_path: Option<PathBuf>,
    pub mirror_batch_size: usize,
    /// Rayon pool size; 0 means one thread per core.
    pub worker_threads: usize,
    pub progress_interval: u64,
    /// Committed blocks between forest snapshots; 0 saves only when a run ends.
    pub snapshot_interval: u64,
    /// Write `address,cluster` rows here after the walk.
    pub export_path: Option<PathBuf>,
    /// Log level filter string (e.g. "info", "debug", "sleuth_walker=trace").
    pub log_level: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sleuth");
        let archive_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".bitcoin")
            .join("blocks");

        Self {
            archive_dir,
            data_dir,
            network: NetworkType::Mainnet,
            skipped_bound: DEFAULT_SKIPPED_BOUND,
            restore_window: DEFAULT_RESTORE_WINDOW,
            live_tail: false,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            utxo_mirror: false,
            utxo_mirror_path: None,
            mirror_batch_size: DEFAULT_MIRROR_BATCH,
            worker_threads: 0,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
            export_path: None,
            log_level: "info".to_string(),
        }
    }
}

impl IngestConfig {
    /// Load from an optional TOML file overlaid by `SLEUTH_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, SleuthError> {
        Self::load_with_env(path, None)
    }

    /// Like [`load`](Self::load), reading variables from `env` instead of the process.
    pub fn load_with_env(
        path: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self, SleuthError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .source(env),
        );

        builder
            .build()
            .and_then(|settings| settings.try_deserialize::<IngestConfig>())
            .map_err(|e| SleuthError::Config(e.to_string()))
    }

    /// Reject settings the walker cannot run with.
    pub fn validate(&self) -> Result<(), SleuthError> {
        if self.skipped_bound == 0 {
            return Err(SleuthError::Config("skipped_bound must be positive".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(SleuthError::Config("poll_interval_ms must be positive".into()));
        }
        if self.mirror_batch_size == 0 {
            return Err(SleuthError::Config("mirror_batch_size must be positive".into()));
        }
        if !self.archive_dir.is_dir() {
            return Err(SleuthError::Config(format!(
                "archive directory not found: {}",
                self.archive_dir.display()
            )));
        }
        Ok(())
    }

    /// Path to the RocksDB chain data directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("chaindata")
    }

    /// Path to the RocksDB unspent-output mirror.
    pub fn mirror_path(&self) -> PathBuf {
        self.utxo_mirror_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("utxo"))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn walker_config(&self) -> WalkerConfig {
        WalkerConfig {
            skipped_bound: self.skipped_bound,
            restore_window: self.restore_window,
            live_tail: self.live_tail,
            poll_interval: self.poll_interval(),
            progress_interval: self.progress_interval,
        }
    }
}
