//! Engine configuration
//!
//! Geometry, index shape, space watermarks and reclamation limits. Every
//! field has a default so a TOML file only needs to name what it changes.

use crate::error::{Result, StorageError};
use crate::key::KeyHash;
use crate::node::{align_up, DATA_NODE_SIZE, IDX_NODE_SIZE, IDX_BRANCH_SIZE, MIN_WRITE_SIZE};
use crate::node::{NNODE_SIZE, PNODE_SIZE, LEDGER_FANOUT};
use serde::{Deserialize, Serialize};
use std::path::Path;
use validator::Validate;

/// Number of fixed master record slots
pub const MASTER_EUS: u32 = 2;

/// Number of alternating orphan area units
pub const ORPHAN_EUS: u32 = 2;

/// Smallest index the budget ever assumes, in units
pub const MIN_INDEX_EUS: u32 = 2;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    /// Size of one erasable unit in bytes
    #[validate(range(min = 1024, max = 268435456))]
    pub eu_size: u32,

    /// Units available for journal data and index nodes
    #[validate(range(min = 8))]
    pub main_eus: u32,

    /// Units in the circular log area
    #[validate(range(min = 2, max = 256))]
    pub log_eus: u32,

    /// Units in the ledger area
    #[validate(range(min = 2, max = 64))]
    pub ledger_eus: u32,

    /// Write granularity; every write is aligned and padded to it
    #[validate(range(min = 8, max = 65536))]
    pub min_io_size: u32,

    /// Maximum branches per index node
    #[validate(range(min = 3, max = 64))]
    pub fanout: usize,

    /// Maximum payload carried by one data node
    #[validate(range(min = 8))]
    pub block_size: u32,

    /// Free+dirty space below which a unit is written off as dead
    pub dead_watermark: Option<u32>,

    /// Free+dirty space that may be unusable for the largest node
    pub dark_watermark: Option<u32>,

    /// Multiplier applied to the index size to allow for consolidation
    #[validate(range(min = 1, max = 16))]
    pub idx_overprovision: u32,

    /// Capacity of each categorization heap
    #[validate(range(min = 1))]
    pub heap_capacity: usize,

    /// How many times a budget reservation retries reclamation
    pub budget_retries: u32,

    /// GC iterations without progress before a non-forced run gives up
    #[validate(range(min = 1))]
    pub gc_soft_limit: u32,

    /// GC iterations before any run gives up
    #[validate(range(min = 1))]
    pub gc_hard_limit: u32,

    /// Journal bytes written since the last commit that wake the background committer
    pub bg_commit_bytes: u64,

    /// Background thread polling interval
    pub bg_interval_ms: u64,

    /// Upper bound on resident index nodes; exceeding it yields `NoMemory`
    #[validate(range(min = 16))]
    pub max_resident_znodes: usize,

    /// Index nodes the background shrinker tries to evict per pass
    pub shrink_batch: usize,

    /// Retries for transient read failures
    pub read_retries: u32,

    /// Hash used for directory and attribute entry names
    pub key_hash: KeyHash,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            eu_size: 128 * 1024,
            main_eus: 64,
            log_eus: 4,
            ledger_eus: 2,
            min_io_size: 8,
            fanout: 8,
            block_size: 4096,
            dead_watermark: None,
            dark_watermark: None,
            idx_overprovision: 3,
            heap_capacity: 128,
            budget_retries: 3,
            gc_soft_limit: 4,
            gc_hard_limit: 32,
            bg_commit_bytes: 4 * 128 * 1024,
            bg_interval_ms: 500,
            max_resident_znodes: 1 << 20,
            shrink_batch: 64,
            read_retries: 2,
            key_hash: KeyHash::Xxh3,
        }
    }
}

impl Config {
    /// Small geometry used throughout the tests
    pub fn small(eu_size: u32, main_eus: u32) -> Self {
        Config {
            eu_size,
            main_eus,
            log_eus: 2,
            block_size: 512,
            bg_commit_bytes: 4 * eu_size as u64,
            ..Config::default()
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.check()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Validate field ranges and cross-field constraints
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| StorageError::Config(e.to_string()))?;

        if !self.min_io_size.is_power_of_two() {
            return Err(StorageError::Config(format!(
                "min_io_size {} is not a power of two",
                self.min_io_size
            )));
        }
        if self.eu_size % self.min_io_size != 0 {
            return Err(StorageError::Config(format!(
                "eu_size {} is not a multiple of min_io_size {}",
                self.eu_size, self.min_io_size
            )));
        }
        if self.block_size % 8 != 0 {
            return Err(StorageError::Config(format!(
                "block_size {} is not 8-byte aligned",
                self.block_size
            )));
        }
        if self.max_node_size() * 2 > self.eu_size {
            return Err(StorageError::Config(format!(
                "largest node ({} bytes) does not fit twice into a {} byte unit",
                self.max_node_size(),
                self.eu_size
            )));
        }
        if self.max_idx_node_size() > self.eu_size / 2 {
            return Err(StorageError::Config(format!(
                "index node of fanout {} is too large for the unit size",
                self.fanout
            )));
        }
        if self.dead_wm() > self.dark_wm() {
            return Err(StorageError::Config(
                "dead watermark exceeds dark watermark".to_string(),
            ));
        }
        if self.ledger_tree_size() > self.eu_size {
            return Err(StorageError::Config(format!(
                "ledger tree for {} units does not fit into one ledger unit",
                self.main_eus
            )));
        }
        if self.gc_soft_limit > self.gc_hard_limit {
            return Err(StorageError::Config(
                "gc_soft_limit exceeds gc_hard_limit".to_string(),
            ));
        }
        Ok(())
    }

    pub fn total_eus(&self) -> u32 {
        self.main_first() + self.main_eus
    }

    pub fn log_first(&self) -> u32 {
        MASTER_EUS
    }

    pub fn ledger_first(&self) -> u32 {
        self.log_first() + self.log_eus
    }

    pub fn orphan_first(&self) -> u32 {
        self.ledger_first() + self.ledger_eus
    }

    pub fn main_first(&self) -> u32 {
        self.orphan_first() + ORPHAN_EUS
    }

    pub fn is_main(&self, eu: u32) -> bool {
        eu >= self.main_first() && eu < self.total_eus()
    }

    pub fn main_bytes(&self) -> u64 {
        self.main_eus as u64 * self.eu_size as u64
    }

    pub fn align(&self, len: u32) -> u32 {
        align_up(len, self.min_io_size)
    }

    pub fn max_node_size(&self) -> u32 {
        DATA_NODE_SIZE + self.block_size
    }

    pub fn max_idx_node_size(&self) -> u32 {
        IDX_NODE_SIZE + self.fanout as u32 * IDX_BRANCH_SIZE
    }

    /// Free+dirty space below which a unit cannot take even the smallest write
    pub fn dead_wm(&self) -> u32 {
        self.dead_watermark
            .unwrap_or_else(|| self.align(MIN_WRITE_SIZE))
    }

    /// Free+dirty space that may stay unusable because the next node is large
    pub fn dark_wm(&self) -> u32 {
        self.dark_watermark
            .unwrap_or_else(|| self.align(self.max_node_size()))
    }

    /// Bytes needed to write the whole ledger tree at once
    pub fn ledger_tree_size(&self) -> u32 {
        let fanout = LEDGER_FANOUT as u32;
        let mut count = self.main_eus.div_ceil(fanout).max(1);
        let mut total = count * align_up(PNODE_SIZE, self.min_io_size);
        while count > 1 {
            count = count.div_ceil(fanout);
            total += count * align_up(NNODE_SIZE, self.min_io_size);
        }
        // An empty nnode root always sits above the pnodes.
        if self.main_eus <= fanout as u32 {
            total += align_up(NNODE_SIZE, self.min_io_size);
        }
        total
    }
}
