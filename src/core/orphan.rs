//! Orphans
//!
//! Inodes that are unlinked but still in use are orphans. The set is
//! committed into one of two alternating orphan units, chosen by the parity
//! of the commit number, so the copy of the committed master is never
//! overwritten by the commit that replaces it.

use crate::config::{Config, ORPHAN_EUS};
use crate::error::{Result, StorageError};
use crate::io::Device;
use crate::node::{align_up, GroupFlag, Node, OrphanNode, ORPHAN_NODE_SIZE};
use crate::scan::{pad_to, scan_eu, ScanMode};
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Serialized orphan set for one commit
#[derive(Debug, Clone)]
pub struct OrphanWrite {
    pub eu: u32,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct Orphans {
    set: BTreeSet<u64>,
}

impl Orphans {
    pub fn new(inums: impl IntoIterator<Item = u64>) -> Self {
        Orphans {
            set: inums.into_iter().collect(),
        }
    }

    /// Returns false if the inode already was an orphan
    pub fn add(&mut self, inum: u64) -> bool {
        self.set.insert(inum)
    }

    pub fn remove(&mut self, inum: u64) -> bool {
        self.set.remove(&inum)
    }

    pub fn contains(&self, inum: u64) -> bool {
        self.set.contains(&inum)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.set.iter().copied()
    }

    /// Encode the set for commit `cmt_no`
    ///
    /// An empty set is still written so the committed unit always tells
    /// which commit it belongs to.
    pub fn prepare_commit(&self, config: &Config, cmt_no: u64, sqnum: &mut dyn FnMut() -> u64) -> Result<OrphanWrite> {
        let per_node = ((config.eu_size / 4 - ORPHAN_NODE_SIZE) / 8).max(1) as usize;
        let inums: Vec<u64> = self.set.iter().copied().collect();
        let chunks: Vec<&[u64]> = if inums.is_empty() {
            vec![&[]]
        } else {
            inums.chunks(per_node).collect()
        };

        let mut bytes = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            let node = Node::Orphan(OrphanNode {
                cmt_no,
                last: i + 1 == chunks.len(),
                inums: chunk.to_vec(),
            });
            bytes.extend_from_slice(&node.encode(sqnum(), GroupFlag::None));
            bytes.resize(align_up(bytes.len() as u32, 8) as usize, 0);
        }
        pad_to(&mut bytes, config.min_io_size);
        if bytes.len() as u32 > config.eu_size {
            return Err(StorageError::NoSpace);
        }
        Ok(OrphanWrite {
            eu: orphan_eu(config, cmt_no),
            bytes,
        })
    }
}

pub fn orphan_eu(config: &Config, cmt_no: u64) -> u32 {
    config.orphan_first() + (cmt_no % ORPHAN_EUS as u64) as u32
}

/// Orphans recorded by commit `cmt_no`
///
/// A unit whose nodes belong to another commit or lack the closing node
/// contributes nothing.
pub fn load_orphans(dev: &dyn Device, config: &Config, cmt_no: u64) -> Result<Orphans> {
    let eu = orphan_eu(config, cmt_no);
    let scanned = scan_eu(dev, eu, 0, ScanMode::Tolerant, config.read_retries)?;
    let mut inums = Vec::new();
    let mut closed = false;
    for n in &scanned.nodes {
        match &n.node {
            Node::Orphan(o) if o.cmt_no == cmt_no => {
                inums.extend_from_slice(&o.inums);
                closed = o.last;
            }
            _ => {}
        }
    }
    if !closed {
        if cmt_no > 0 {
            warn!("orphan unit {} holds no complete set for commit {}", eu, cmt_no);
        }
        return Ok(Orphans::default());
    }
    debug!("{} orphans from commit {}", inums.len(), cmt_no);
    Ok(Orphans::new(inums))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemDevice;

    #[test]
    fn test_commit_and_load() {
        let config = Config::small(4096, 16);
        let dev = MemDevice::for_config(&config);
        let mut orphans = Orphans::default();
        for inum in [7, 3, 12] {
            assert!(orphans.add(inum));
        }
        assert!(!orphans.add(3));
        let mut sq = 0;
        let w = orphans.prepare_commit(&config, 5, &mut || { sq += 1; sq }).unwrap();
        assert_eq!(w.eu, config.orphan_first() + 1);
        dev.change(w.eu, &w.bytes).unwrap();

        let loaded = load_orphans(&dev, &config, 5).unwrap();
        assert_eq!(loaded.iter().collect::<Vec<_>>(), vec![3, 7, 12]);
        // Another commit's unit
        assert!(load_orphans(&dev, &config, 6).unwrap().is_empty());
        assert!(load_orphans(&dev, &config, 7).unwrap().is_empty());
    }

    #[test]
    fn test_large_sets_span_nodes() {
        let config = Config::small(4096, 16);
        let dev = MemDevice::for_config(&config);
        let orphans = Orphans::new(100..400);
        let mut sq = 0;
        let w = orphans.prepare_commit(&config, 2, &mut || { sq += 1; sq }).unwrap();
        dev.change(w.eu, &w.bytes).unwrap();
        let scanned = scan_eu(&dev, w.eu, 0, ScanMode::Strict, 0).unwrap();
        assert!(scanned.nodes.len() > 1);

        let loaded = load_orphans(&dev, &config, 2).unwrap();
        assert_eq!(loaded.len(), 300);
        assert!(loaded.contains(399));
    }
}
