//! Sleuth ingestion binary.
//!
//! Walks a Bitcoin block archive in causal order, persists progress to
//! RocksDB and clusters addresses by common input ownership. Ctrl+C stops
//! the walk after the current block; a later run resumes from the checkpoint.

use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use sleuth_core::cancel::CancelToken;
use sleuth_core::constants::NetworkType;
use sleuth_node_lib::{IngestConfig, IngestReport, Ingestor};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "sleuth-ingest",
    version,
    about = "Causal block-archive walker with address clustering"
)]
struct Args {
    /// TOML configuration file (overlaid by SLEUTH_* environment variables)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding blkNNNNN.dat files
    #[arg(long)]
    archive_dir: Option<PathBuf>,

    /// Data directory for RocksDB state
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Network (mainnet, testnet, signet, regtest)
    #[arg(long)]
    network: Option<NetworkType>,

    /// Keep polling the archive for new blocks until Ctrl+C
    #[arg(long)]
    live: bool,

    /// Mirror unspent outputs to RocksDB so later runs can resume them
    #[arg(long)]
    utxo_mirror: bool,

    /// Rayon worker threads (0 = one per core)
    #[arg(long)]
    threads: Option<usize>,

    /// Write address,cluster rows to this file after the walk
    #[arg(long)]
    export: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format ("text" or "json")
    #[arg(long, default_value = "text")]
    log_format: String,
}

impl Args {
    /// Load the layered config and apply CLI overrides on top.
    fn into_config(self) -> Result<(IngestConfig, String)> {
        let mut config = IngestConfig::load(self.config.as_deref())
            .context("failed to load configuration")?;

        if let Some(network) = self.network {
            config.network = network;
        }
        if let Some(dir) = self.archive_dir {
            config.archive_dir = dir;
        }
        if let Some(dir) = self.data_dir {
            config.data_dir = dir;
        }
        if self.live {
            config.live_tail = true;
        }
        if self.utxo_mirror {
            config.utxo_mirror = true;
        }
        if let Some(threads) = self.threads {
            config.worker_threads = threads;
        }
        if self.export.is_some() {
            config.export_path = self.export;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }

        Ok((config, self.log_format))
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let (config, log_format) = match args.into_config() {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("error: {e:#}");
            process::exit(1);
        }
    };

    init_logging(&config.log_level, &log_format);

    info!("Sleuth ingest v{}", env!("CARGO_PKG_VERSION"));
    info!(
        network = %config.network,
        archive_dir = %config.archive_dir.display(),
        data_dir = %config.data_dir.display(),
        live_tail = config.live_tail,
        utxo_mirror = config.utxo_mirror,
        "configuration loaded"
    );

    let cancel = CancelToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, stopping after the current block");
            on_signal.cancel();
        }
    });

    let outcome = tokio::task::spawn_blocking(move || ingest(config, &cancel)).await;
    match outcome {
        Ok(Ok(report)) => match serde_json::to_string_pretty(&report.stats) {
            Ok(stats) => println!("{stats}"),
            Err(e) => error!("failed to render stats: {}", e),
        },
        Ok(Err(e)) => {
            error!("ingestion failed: {:#}", e);
            process::exit(1);
        }
        Err(e) => {
            error!("ingestion task aborted: {}", e);
            process::exit(1);
        }
    }
}

fn ingest(config: IngestConfig, cancel: &CancelToken) -> Result<IngestReport> {
    let mut ingestor = Ingestor::open(config).context("failed to open ingestor")?;
    let report = ingestor.run(cancel).context("walk failed")?;
    if report.outcome.is_cancelled() {
        info!(
            height = ?report.outcome.checkpoint().map(|cp| cp.height),
            "walk cancelled; rerun to resume"
        );
    }
    if let Some(rows) = report.exported_rows {
        info!(rows, "clusters exported");
    }
    Ok(report)
}

/// Initialize tracing subscriber with the given log level and output format.
///
/// `RUST_LOG` takes precedence over `level_str`. Pass `format = "json"` for
/// structured JSON output; any other value gives human-readable text.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
