//! # Flashlog - Log-Structured Storage for Erasable Media
//!
//! `flashlog-rs` stores keyed nodes on media made of erasable units, the
//! way flash file systems do:
//!
//! - **Journal** - every change is appended; nothing is overwritten in place
//! - **Copy-on-write index** - a B-tree mapping keys to node locations,
//!   written out by periodic two-phase commits
//! - **Space ledger** - free and dirty bytes of every unit, driving
//!   allocation and garbage collection
//! - **Budgeting** - a change is only admitted if it can be committed later
//! - **Recovery** - torn writes are cut off and the journal is replayed on mount
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use flashlog::{InodeNode, Key, Result, StoreBuilder};
//!
//! # fn main() -> Result<()> {
//! let store = StoreBuilder::new().path("volume.img").build()?;
//!
//! let inum = store.next_inum();
//! store.write_inode(&InodeNode::new(inum, 0o100644))?;
//! store.write_data(inum, 0, b"Hello, flash!")?;
//!
//! let node = store.read_node(&Key::data(inum, 0))?;
//! assert!(node.is_some());
//!
//! store.unmount()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Background Commits
//!
//! ```rust,no_run
//! use flashlog::{spawn_background, Config, StoreBuilder};
//! use std::sync::Arc;
//!
//! # fn main() -> flashlog::Result<()> {
//! let store = Arc::new(StoreBuilder::new().config(Config::default()).build()?);
//! let bg = spawn_background(&store);
//! // ... journal operations from any thread ...
//! drop(bg);
//! store.unmount()?;
//! # Ok(())
//! # }
//! ```

pub mod core;

#[allow(unused_imports)]
pub(crate) use core::{
    background, budget, commit, config, error, gc, io, journal, key, ledger, log, master, node,
    ops, orphan, replay, scan, store, tnc,
};

pub use crate::core::{
    background::{spawn_background, BackgroundCommit},
    budget::{BudgetRequest, BudgetSnapshot},
    config::Config,
    error::{RecoveryOutcome, Result, StorageError},
    gc::GcOutcome,
    io::{Device, FileDevice, Geometry, MemDevice},
    key::{Key, KeyHash, KeyType},
    ledger::LedgerStats,
    master::recover_master,
    node::{DataNode, EntryNode, EuProps, InodeNode, Location, Node},
    replay::replay_journal,
    store::{MountMode, Store},
    tnc::IndexStats,
};

use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Builder for opening a [`Store`]
///
/// Without a path the volume lives in memory. A path that does not exist
/// yet is created and formatted.
///
/// # Examples
///
/// ```rust,no_run
/// use flashlog::{Config, MountMode, StoreBuilder};
///
/// # fn main() -> flashlog::Result<()> {
/// let store = StoreBuilder::new()
///     .path("/data/volume.img")
///     .config(Config::small(4096, 64))
///     .mode(MountMode::ReadOnly)
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct StoreBuilder {
    path: Option<PathBuf>,
    config: Option<Config>,
    mode: MountMode,
    format: bool,
}

impl StoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Back the volume by a file
    pub fn path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Load the configuration from a TOML file
    pub fn config_file<P: AsRef<std::path::Path>>(mut self, path: P) -> Result<Self> {
        self.config = Some(Config::from_file(path)?);
        Ok(self)
    }

    pub fn mode(mut self, mode: MountMode) -> Self {
        self.mode = mode;
        self
    }

    /// Format even if the device already holds a volume
    pub fn reformat(mut self) -> Self {
        self.format = true;
        self
    }

    pub fn build(self) -> Result<Store> {
        let config = self.config.unwrap_or_default();
        config.check()?;
        let geometry = Geometry::for_config(&config);

        let (dev, fresh): (Arc<dyn Device>, bool) = match &self.path {
            Some(path) if path.exists() && !self.format => {
                (Arc::new(FileDevice::open(path, geometry)?), false)
            }
            Some(path) => (Arc::new(FileDevice::create(path, geometry)?), true),
            None => (Arc::new(MemDevice::for_config(&config)), true),
        };
        if fresh {
            if self.mode == MountMode::ReadOnly {
                return Err(StorageError::InvalidArgument(
                    "cannot format a volume mounted read-only".to_string(),
                ));
            }
            info!("formatting new volume");
            Store::format(&*dev, &config)?;
        }
        Store::mount(dev, config, self.mode)
    }
}
