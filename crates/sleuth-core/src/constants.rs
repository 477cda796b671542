//! Archive, walker and clustering constants.

use std::fmt;
use std::str::FromStr;

use bitcoin::Network;
use serde::{Deserialize, Serialize};

/// Size of a serialized block header; smaller record sizes are framing errors.
pub const BLOCK_HEADER_SIZE: usize = 80;

/// Magic (4 bytes) plus record size (4 bytes) preceding every archived block.
pub const RECORD_PREFIX_SIZE: usize = 8;

/// File name prefix of archive regions (`blk00000.dat`, `blk00001.dat`, ...).
pub const REGION_PREFIX: &str = "blk";

/// File name suffix of archive regions.
pub const REGION_SUFFIX: &str = ".dat";

/// Output-count values that mark a dust-change group rather than a mix.
pub const DUST_GROUP_COUNTS: [usize; 2] = [546, 2730];

/// Default bound on simultaneously held out-of-order blocks.
pub const DEFAULT_SKIPPED_BOUND: usize = 5_000;

/// Default number of blocks before the checkpoint the resume scan starts from.
pub const DEFAULT_RESTORE_WINDOW: u64 = 100;

/// Default interval between live-tail polls, in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;

/// Default number of queued mirror operations before a flush is forced.
pub const DEFAULT_MIRROR_BATCH: usize = 10_000;

/// Default number of applied blocks between progress log lines.
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 1_000;

/// Default number of committed blocks between clustering forest snapshots.
pub const DEFAULT_SNAPSHOT_INTERVAL: u64 = 1_000;

/// Network parameter set.
///
/// Selects the archive magic and the address encoding used for tokens.
///
/// # Examples
///
/// ```
/// use sleuth_core::constants::NetworkType;
/// let net: NetworkType = "regtest".parse().unwrap();
/// assert_eq!(net, NetworkType::Regtest);
/// assert_eq!(NetworkType::Mainnet.magic(), [0xF9, 0xBE, 0xB4, 0xD9]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    #[default]
    Mainnet,
    Testnet,
    Signet,
    Regtest,
}

impl NetworkType {
    /// The matching `bitcoin` crate network.
    pub fn network(&self) -> Network {
        match self {
            Self::Mainnet => Network::Bitcoin,
            Self::Testnet => Network::Testnet,
            Self::Signet => Network::Signet,
            Self::Regtest => Network::Regtest,
        }
    }

    /// Four magic bytes starting every archive record, in file order.
    pub fn magic(&self) -> [u8; 4] {
        self.network().magic().to_bytes()
    }

    /// Magic as the little-endian value read from the archive.
    pub fn magic_value(&self) -> u32 {
        u32::from_le_bytes(self.magic())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
            Self::Signet => "signet",
            Self::Regtest => "regtest",
        }
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" | "bitcoin" | "main" => Ok(Self::Mainnet),
            "testnet" | "test" => Ok(Self::Testnet),
            "signet" => Ok(Self::Signet),
            "regtest" => Ok(Self::Regtest),
            other => Err(format!("unknown network: {other}")),
        }
    }
}
