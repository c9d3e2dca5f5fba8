//! Writing the dirty index and re-dirtying nodes for garbage collection

use super::{Step, Tnc, ZnodeId};
use crate::error::{Result, StorageError};
use crate::key::Key;
use crate::node::{Location, Node};
use tracing::debug;

/// Outcome of laying out the dirty index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutSummary {
    /// Index nodes written
    pub written: usize,
    pub root: Option<Location>,
    /// Bytes of live index on media after this commit
    pub idx_size: u64,
}

impl Tnc {
    /// Write every dirty znode, children before parents
    ///
    /// `place` stores one index node and returns where it went. Afterwards
    /// the whole tree is clean and the written nodes belong to an in-flight
    /// commit until [`Tnc::commit_done`]; the shrinker leaves them alone.
    pub fn layout(&mut self, place: &mut dyn FnMut(&Node) -> Result<Location>) -> Result<LayoutSummary> {
        let gen = self.commit_gen;
        let mut written = 0;
        if let Some(root) = self.root {
            if self.node(root)?.dirty {
                self.write_dirty(root, gen, place, &mut written)?;
            }
        }
        if self.dirty_cnt != 0 {
            return Err(StorageError::Internal(format!(
                "{} dirty znodes unreachable from the root",
                self.dirty_cnt
            )));
        }
        self.inflight = Some(gen);
        self.commit_gen += 1;
        let summary = LayoutSummary {
            written,
            root: self.root_loc(),
            idx_size: self.idx_size,
        };
        debug!(
            "laid out {} index nodes, root {:?}, index size {}",
            written, summary.root, summary.idx_size
        );
        Ok(summary)
    }

    fn write_dirty(
        &mut self,
        id: ZnodeId,
        gen: u64,
        place: &mut dyn FnMut(&Node) -> Result<Location>,
        written: &mut usize,
    ) -> Result<Location> {
        let count = self.node(id)?.branches.len();
        for i in 0..count {
            let Some(child) = self.node(id)?.branches[i].child else {
                continue;
            };
            if self.node(child)?.dirty {
                let loc = self.write_dirty(child, gen, place, written)?;
                self.node_mut(id)?.branches[i].loc = Some(loc);
            }
        }

        let idx = self
            .node(id)?
            .to_idx()
            .ok_or_else(|| StorageError::Internal("dirty znode has an unplaced branch".to_string()))?;
        let loc = place(&Node::Idx(idx))?;

        let z = self.node_mut(id)?;
        z.loc = Some(loc);
        z.dirty = false;
        z.written_in = Some(gen);
        self.idx_size += loc.aligned_len() as u64;
        self.dirty_cnt -= 1;
        self.lru.put(id, ());
        *written += 1;
        Ok(loc)
    }

    /// The last laid out commit reached media
    pub fn commit_done(&mut self) {
        self.inflight = None;
    }

    /// Dirty the index node written at `loc`, if the tree still uses it
    ///
    /// `level` and `first` are the level and first branch key recorded in
    /// the node itself. Returns false for an obsolete node.
    pub fn dirty_index_node(&mut self, level: u16, first: &Key, loc: Location) -> Result<bool> {
        let Some(root) = self.root else {
            return Ok(false);
        };
        let z = self.node(root)?;
        if z.level < level {
            return Ok(false);
        }
        if z.level == level {
            if z.loc != Some(loc) {
                return Ok(false);
            }
            self.reserve_nodes(1)?;
            let mut path = vec![Step { id: root, idx: 0 }];
            self.dirty_path(&mut path)?;
            return Ok(true);
        }

        // Branches equal to `first` may start in an earlier sibling
        let mut path = Vec::new();
        let mut id = root;
        loop {
            let z = self.node(id)?;
            let idx = z.search_below(first).max(0) as usize;
            let parent_level = z.level;
            path.push(Step { id, idx });
            if parent_level == level + 1 {
                break;
            }
            id = self.child(id, idx)?;
        }
        loop {
            let br = self.branch(&path)?;
            if br.key > *first {
                return Ok(false);
            }
            if br.loc == Some(loc) {
                break;
            }
            if !self.next(&mut path)? {
                return Ok(false);
            }
        }

        let Step { id, idx } = path[path.len() - 1];
        let child = self.child(id, idx)?;
        path.push(Step { id: child, idx: 0 });
        self.reserve_nodes(path.len())?;
        self.dirty_path(&mut path)?;
        Ok(true)
    }
}
