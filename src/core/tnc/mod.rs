//! Key index
//!
//! A B-tree from keys to node locations, partially resident in memory.
//! Resident nodes (znodes) live in a generation-tagged arena and are
//! addressed by [`ZnodeId`]. Clean znodes mirror an index node on media;
//! mutation copies every clean znode on the path into a fresh slot first,
//! so a node handed to a commit is never changed in place.
//!
//! There are no parent pointers. Descents record the path they took and
//! every structural operation works on that path.

mod collide;
mod commit;
mod insert;
mod remove;
mod shrink;
mod znode;

pub use commit::LayoutSummary;
pub use znode::{Arena, Zbranch, Znode, ZnodeId};

use crate::config::Config;
use crate::error::{Result, StorageError};
use crate::io::{read_node, Device};
use crate::key::Key;
use crate::node::{Location, Node};
use lru::LruCache;
use std::sync::Arc;
use tracing::debug;

/// One level of a descent: a znode and the branch taken in it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Step {
    pub id: ZnodeId,
    pub idx: usize,
}

pub(crate) type Path = Vec<Step>;

/// Where a key falls in the tree
pub(crate) enum Seek {
    Empty,
    /// Below every key; the path ends at position 0 of the leftmost leaf
    Before(Path),
    /// The path ends at the last branch whose key is `<=` the target
    At(Path),
}

/// Resident index statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub resident: usize,
    pub dirty: usize,
    pub height: usize,
    /// Bytes of index nodes the next commit will leave on media, not
    /// counting dirty nodes
    pub idx_size: u64,
}

pub struct Tnc {
    dev: Arc<dyn Device>,
    arena: Arena,
    root: Option<ZnodeId>,
    fanout: usize,
    max_resident: usize,
    retries: u32,
    dirty_cnt: usize,
    idx_size: u64,
    /// Index nodes made obsolete since the last drain
    stale: Vec<Location>,
    /// Clean znodes, least recently used first out
    lru: LruCache<ZnodeId, ()>,
    commit_gen: u64,
    inflight: Option<u64>,
}

impl Tnc {
    /// Empty index
    pub fn new(dev: Arc<dyn Device>, config: &Config) -> Self {
        Tnc {
            dev,
            arena: Arena::default(),
            root: None,
            fanout: config.fanout,
            max_resident: config.max_resident_znodes,
            retries: config.read_retries,
            dirty_cnt: 0,
            idx_size: 0,
            stale: Vec::new(),
            lru: LruCache::unbounded(),
            commit_gen: 1,
            inflight: None,
        }
    }

    /// Index rooted at a committed location
    pub fn load(dev: Arc<dyn Device>, config: &Config, root: Option<Location>, idx_size: u64) -> Result<Self> {
        let mut tnc = Self::new(dev, config);
        tnc.idx_size = idx_size;
        if let Some(loc) = root {
            let (_, node) = read_node(&*tnc.dev, loc, None, tnc.retries)?;
            let znode = match node {
                Node::Idx(idx) if !idx.branches.is_empty() => Znode::from_media(idx, loc),
                other => {
                    return Err(StorageError::corrupt(
                        loc.eu,
                        loc.offs,
                        format!("index root is a {:?} node", other.node_type()),
                    ))
                }
            };
            debug!("index root at {} (level {})", loc, znode.level);
            tnc.root = Some(tnc.arena.insert(znode));
        }
        Ok(tnc)
    }

    pub fn fanout(&self) -> usize {
        self.fanout
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty_cnt
    }

    pub fn idx_size(&self) -> u64 {
        self.idx_size
    }

    pub fn stats(&self) -> IndexStats {
        let height = self
            .root
            .and_then(|id| self.arena.get(id))
            .map_or(0, |z| z.level as usize + 1);
        IndexStats {
            resident: self.arena.live(),
            dirty: self.dirty_cnt,
            height,
            idx_size: self.idx_size,
        }
    }

    /// Committed location of the root, once it is clean
    pub fn root_loc(&self) -> Option<Location> {
        self.root.and_then(|id| self.arena.get(id)).and_then(|z| z.loc)
    }

    /// Obsolete index node locations accumulated since the last call
    pub fn take_stale(&mut self) -> Vec<Location> {
        std::mem::take(&mut self.stale)
    }

    pub(crate) fn node(&self, id: ZnodeId) -> Result<&Znode> {
        self.arena
            .get(id)
            .ok_or_else(|| StorageError::Internal(format!("stale znode handle {:?}", id)))
    }

    pub(crate) fn node_mut(&mut self, id: ZnodeId) -> Result<&mut Znode> {
        self.arena
            .get_mut(id)
            .ok_or_else(|| StorageError::Internal(format!("stale znode handle {:?}", id)))
    }

    pub(crate) fn branch(&self, path: &Path) -> Result<&Zbranch> {
        let step = last(path)?;
        self.node(step.id)?
            .branches
            .get(step.idx)
            .ok_or_else(|| StorageError::Internal(format!("branch {} out of range", step.idx)))
    }

    fn touch(&mut self, id: ZnodeId) {
        self.lru.promote(&id);
    }

    /// Resident child behind branch `idx` of `id`, loading it if needed
    pub(crate) fn child(&mut self, id: ZnodeId, idx: usize) -> Result<ZnodeId> {
        let parent = self.node(id)?;
        let level = parent.level;
        let (child, loc) = parent
            .branches
            .get(idx)
            .map(|br| (br.child, br.loc))
            .ok_or_else(|| StorageError::Internal(format!("branch {} out of range", idx)))?;
        if level == 0 {
            return Err(StorageError::Internal("leaf znodes have no children".to_string()));
        }
        if let Some(c) = child {
            if self.arena.get(c).is_some() {
                self.touch(c);
                return Ok(c);
            }
        }
        let loc = loc
            .ok_or_else(|| StorageError::Internal("branch has neither child nor location".to_string()))?;

        let (_, node) = read_node(&*self.dev, loc, None, self.retries)?;
        let znode = match node {
            Node::Idx(idx) if idx.level + 1 == level && !idx.branches.is_empty() => Znode::from_media(idx, loc),
            Node::Idx(idx) => {
                return Err(StorageError::corrupt(
                    loc.eu,
                    loc.offs,
                    format!(
                        "index node of level {} with {} branches under level {}",
                        idx.level,
                        idx.branches.len(),
                        level
                    ),
                ))
            }
            other => {
                return Err(StorageError::corrupt(
                    loc.eu,
                    loc.offs,
                    format!("expected index node, found {:?}", other.node_type()),
                ))
            }
        };
        let c = self.arena.insert(znode);
        self.lru.put(c, ());
        self.node_mut(id)?.branches[idx].child = Some(c);
        Ok(c)
    }

    /// Find where `key` falls
    pub(crate) fn seek(&mut self, key: &Key) -> Result<Seek> {
        let Some(mut id) = self.root else {
            return Ok(Seek::Empty);
        };
        let mut path = Vec::new();
        loop {
            self.touch(id);
            let z = self.node(id)?;
            let (pos, is_leaf) = (z.search(key), z.is_leaf());
            if is_leaf {
                if pos >= 0 {
                    path.push(Step { id, idx: pos as usize });
                    return Ok(Seek::At(path));
                }
                // Parent keys are lower bounds; the key may still belong
                // at the end of the previous leaf
                path.push(Step { id, idx: 0 });
                let mut prev = path.clone();
                if self.prev(&mut prev)? {
                    return Ok(Seek::At(prev));
                }
                return Ok(Seek::Before(path));
            }
            let idx = pos.max(0) as usize;
            path.push(Step { id, idx });
            id = self.child(id, idx)?;
        }
    }

    /// Path to the first branch with key `>= key`, if any
    pub(crate) fn seek_ge(&mut self, key: &Key) -> Result<Option<Path>> {
        match self.seek(key)? {
            Seek::Empty => Ok(None),
            Seek::Before(path) => Ok(Some(path)),
            Seek::At(mut path) => {
                if self.branch(&path)?.key == *key {
                    // First of a run of equal keys
                    let mut prev = path.clone();
                    while self.prev(&mut prev)? && self.branch(&prev)?.key == *key {
                        path = prev.clone();
                    }
                    return Ok(Some(path));
                }
                Ok(self.next(&mut path)?.then_some(path))
            }
        }
    }

    /// Move the last step of `path` one branch left at its level
    pub(crate) fn prev(&mut self, path: &mut Path) -> Result<bool> {
        let depth = path.len();
        let Some(mut d) = depth.checked_sub(1) else {
            return Ok(false);
        };
        while path[d].idx == 0 {
            if d == 0 {
                return Ok(false);
            }
            d -= 1;
        }
        path[d].idx -= 1;
        path.truncate(d + 1);
        while path.len() < depth {
            let Step { id, idx } = path[path.len() - 1];
            let c = self.child(id, idx)?;
            let last = self.node(c)?.branches.len().saturating_sub(1);
            path.push(Step { id: c, idx: last });
        }
        Ok(true)
    }

    /// Move the last step of `path` one branch right at its level
    pub(crate) fn next(&mut self, path: &mut Path) -> Result<bool> {
        let depth = path.len();
        let Some(mut d) = depth.checked_sub(1) else {
            return Ok(false);
        };
        loop {
            let len = self.node(path[d].id)?.branches.len();
            if path[d].idx + 1 < len {
                break;
            }
            if d == 0 {
                return Ok(false);
            }
            d -= 1;
        }
        path[d].idx += 1;
        path.truncate(d + 1);
        while path.len() < depth {
            let Step { id, idx } = path[path.len() - 1];
            let c = self.child(id, idx)?;
            path.push(Step { id: c, idx: 0 });
        }
        Ok(true)
    }

    /// Location of the node with `key`
    ///
    /// For entry keys, which are not unique, this is the last entry with
    /// the hash; use [`Tnc::lookup_nm`] to match a name.
    pub fn lookup(&mut self, key: &Key) -> Result<Option<Location>> {
        match self.seek(key)? {
            Seek::At(path) => {
                let br = self.branch(&path)?;
                Ok(if br.key == *key { br.loc } else { None })
            }
            _ => Ok(None),
        }
    }

    /// Read the leaf node a branch points at, using the leaf cache
    pub(crate) fn read_leaf(&mut self, path: &Path) -> Result<Arc<Node>> {
        let br = self.branch(path)?;
        if let Some(leaf) = &br.leaf {
            return Ok(leaf.clone());
        }
        let key = br.key;
        let loc = br
            .loc
            .ok_or_else(|| StorageError::Internal(format!("leaf branch {} has no location", key)))?;
        let (_, node) = read_node(&*self.dev, loc, Some(&key), self.retries)?;
        let node = Arc::new(node);
        if key.is_hashed() {
            let step = last(path)?;
            self.node_mut(step.id)?.branches[step.idx].leaf = Some(node.clone());
        }
        Ok(node)
    }

    /// Every key and location in `[low, high]`, in order
    pub fn range(&mut self, low: &Key, high: &Key) -> Result<Vec<(Key, Location)>> {
        let mut out = Vec::new();
        let Some(mut path) = self.seek_ge(low)? else {
            return Ok(out);
        };
        loop {
            let br = self.branch(&path)?;
            if br.key > *high {
                break;
            }
            if let Some(loc) = br.loc {
                out.push((br.key, loc));
            }
            if !self.next(&mut path)? {
                break;
            }
        }
        Ok(out)
    }

    /// Fail with `NoMemory` unless a mutation along a path of `depth`
    /// znodes can allocate every node it may need
    pub(crate) fn reserve_nodes(&self, depth: usize) -> Result<()> {
        if self.arena.live() + 2 * depth + 1 > self.max_resident {
            return Err(StorageError::NoMemory(self.max_resident));
        }
        Ok(())
    }

    /// Evict clean znodes until `ops` single-key mutations are sure to fit
    pub fn ensure_room(&mut self, ops: usize, batch: usize) -> Result<()> {
        let depth = self.stats().height + 1;
        let need = ops * (2 * depth + 1);
        while self.arena.live() + need > self.max_resident {
            if self.shrink(batch.max(1)) == 0 {
                return Err(StorageError::NoMemory(self.max_resident));
            }
        }
        Ok(())
    }

    /// Copy a clean znode into a fresh slot and mark the copy dirty
    fn cow(&mut self, id: ZnodeId) -> Result<ZnodeId> {
        let mut copy = self.node(id)?.clone();
        if let Some(loc) = copy.loc.take() {
            self.stale.push(loc);
            self.idx_size = self.idx_size.saturating_sub(loc.aligned_len() as u64);
        }
        copy.dirty = true;
        copy.written_in = None;
        let new_id = self.arena.insert(copy);
        self.arena.remove(id);
        self.lru.pop(&id);
        self.dirty_cnt += 1;
        Ok(new_id)
    }

    /// Make every znode on `path` dirty, leaf first
    ///
    /// The caller has already checked the arena has room, so no pointer is
    /// swapped unless every copy can be made.
    pub(crate) fn dirty_path(&mut self, path: &mut Path) -> Result<()> {
        let mut below: Option<ZnodeId> = None;
        for d in (0..path.len()).rev() {
            let Step { id, idx } = path[d];
            let id = if self.node(id)?.dirty { id } else { self.cow(id)? };
            if let Some(child) = below {
                let br = &mut self.node_mut(id)?.branches[idx];
                br.child = Some(child);
                br.loc = None;
            }
            path[d].id = id;
            below = Some(id);
        }
        self.root = below.or(self.root);
        Ok(())
    }

    /// Drop a znode that left the tree
    pub(crate) fn free_node(&mut self, id: ZnodeId) -> Result<()> {
        let node = self
            .arena
            .remove(id)
            .ok_or_else(|| StorageError::Internal(format!("freeing stale znode {:?}", id)))?;
        self.lru.pop(&id);
        if node.dirty {
            self.dirty_cnt -= 1;
        }
        if let Some(loc) = node.loc {
            self.stale.push(loc);
            self.idx_size = self.idx_size.saturating_sub(loc.aligned_len() as u64);
        }
        Ok(())
    }

    /// Drop all resident state, as after a failed mount
    pub fn clear(&mut self) {
        self.arena.clear();
        self.lru.clear();
        self.root = None;
        self.dirty_cnt = 0;
        self.stale.clear();
    }
}

pub(crate) fn last(path: &Path) -> Result<Step> {
    path.last()
        .copied()
        .ok_or_else(|| StorageError::Internal("empty index path".to_string()))
}
