//! Archive regions: the numbered `blkNNNNN.dat` files a node appends blocks to.
//!
//! [`Archive`] walks regions in file order, memory-mapping one at a time and
//! decoding records with [`read_block`]. When the last region runs out it keeps
//! its position and drops the mapping, so the next call re-maps the file and
//! sees anything appended since. With live tail enabled, a record cut short at
//! the end of the last region is treated the same way: the node is still
//! writing it.

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use tracing::{debug, trace};

use crate::constants::{NetworkType, REGION_PREFIX, REGION_SUFFIX};
use crate::error::{ReadError, SleuthError, WalkError};
use crate::reader::{read_block, record_is_truncated, RegionCursor};
use crate::types::{BlockLocation, ParsedBlock};

/// Bytes of one mapped region.
enum RegionData {
    Mapped(Mmap),
    Empty,
}

impl RegionData {
    fn open(path: &Path) -> Result<Self, SleuthError> {
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Ok(Self::Empty);
        }
        // SAFETY: regions are opened read-only and only ever appended to by the
        // writing node; bytes already mapped are never rewritten.
        let map = unsafe { Mmap::map(&file)? };
        Ok(Self::Mapped(map))
    }

    fn bytes(&self) -> &[u8] {
        match self {
            Self::Mapped(map) => map,
            Self::Empty => &[],
        }
    }
}

/// Sequential reader over every region of an archive directory.
pub struct Archive {
    dir: PathBuf,
    magic: u32,
    region: u32,
    offset: usize,
    current: Option<RegionData>,
    live_tail: bool,
}

impl Archive {
    /// Open the archive rooted at `dir` for `network`.
    pub fn open(dir: impl Into<PathBuf>, network: NetworkType) -> Result<Self, SleuthError> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(SleuthError::Io(format!(
                "archive directory not found: {}",
                dir.display()
            )));
        }
        Ok(Self {
            dir,
            magic: network.magic_value(),
            region: 0,
            offset: 0,
            current: None,
            live_tail: false,
        })
    }

    /// Treat a truncated final record as not yet written instead of corrupt.
    pub fn set_live_tail(&mut self, enabled: bool) {
        self.live_tail = enabled;
    }

    /// File name of region `index`.
    pub fn region_name(index: u32) -> String {
        format!("{REGION_PREFIX}{index:05}{REGION_SUFFIX}")
    }

    pub fn region_path(&self, index: u32) -> PathBuf {
        self.dir.join(Self::region_name(index))
    }

    pub fn region_exists(&self, index: u32) -> bool {
        self.region_path(index).is_file()
    }

    /// Number of consecutive regions present, counting from zero.
    pub fn region_count(&self) -> u32 {
        let mut count = 0;
        while self.region_exists(count) {
            count += 1;
        }
        count
    }

    /// Current `(region, offset)` read position.
    pub fn position(&self) -> BlockLocation {
        BlockLocation {
            region: self.region,
            offset: self.offset as u64,
        }
    }

    /// Restart reading at the beginning of `region`; earlier regions are never visited.
    pub fn seek(&mut self, region: u32) {
        debug!(region, "archive seek");
        self.region = region;
        self.offset = 0;
        self.current = None;
    }

    /// Next complete block, or `None` when nothing more is available right now.
    ///
    /// Expected end-of-region conditions move on to the next region when its
    /// file exists. Framing and decode errors are fatal and name the region.
    pub fn next_block(&mut self) -> Result<Option<ParsedBlock>, SleuthError> {
        loop {
            if self.current.is_none() {
                let path = self.region_path(self.region);
                if !path.is_file() {
                    return Ok(None);
                }
                trace!(region = self.region, "mapping region");
                self.current = Some(RegionData::open(&path)?);
            }

            let Some(data) = self.current.as_ref() else {
                return Ok(None);
            };
            let mut cursor = RegionCursor::at(data.bytes(), self.offset);
            match read_block(&mut cursor, self.magic) {
                Ok((offset, block)) => {
                    self.offset = cursor.position();
                    let location = BlockLocation {
                        region: self.region,
                        offset: offset as u64,
                    };
                    return Ok(Some(ParsedBlock::new(block, location)));
                }
                Err(e) if e.is_end_of_region() => {
                    self.offset = cursor.position();
                    self.current = None;
                    if self.region_exists(self.region + 1) {
                        debug!(region = self.region, reason = %e, "region finished");
                        self.region += 1;
                        self.offset = 0;
                        continue;
                    }
                    return Ok(None);
                }
                Err(ReadError::Decode { offset, .. })
                    if self.live_tail
                        && !self.region_exists(self.region + 1)
                        && record_is_truncated(data.bytes(), offset) =>
                {
                    trace!(region = self.region, offset, "record still being written");
                    self.offset = offset;
                    self.current = None;
                    return Ok(None);
                }
                Err(source) => {
                    return Err(WalkError::Archive {
                        region: self.region,
                        source,
                    }
                    .into());
                }
            }
        }
    }
}
