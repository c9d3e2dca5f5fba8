//! Insertion, replacement and node splitting

use super::{last, Path, Seek, Tnc, Zbranch, Znode};
use crate::error::{Result, StorageError};
use crate::key::{Key, KeyType};
use crate::node::Location;

impl Tnc {
    /// Map a unique key to `loc`, returning the location it displaced
    pub fn add(&mut self, key: &Key, loc: Location) -> Result<Option<Location>> {
        if key.is_hashed() {
            return Err(StorageError::InvalidArgument(format!(
                "entry key {} needs a name",
                key
            )));
        }
        if let Seek::At(mut path) = self.seek(key)? {
            if self.branch(&path)?.key == *key {
                self.reserve_nodes(path.len())?;
                self.dirty_path(&mut path)?;
                return self.set_leaf(&path, loc);
            }
        }
        self.insert_new(key, loc)
            .map(|_| None)
    }

    /// Map an entry key and name to `loc`
    pub fn add_nm(&mut self, key: &Key, name: &[u8], loc: Location) -> Result<Option<Location>> {
        self.add_named(key, name, loc, false)
    }

    /// Like [`Tnc::add_nm`], but a branch whose node cannot be read is
    /// taken to be the entry when nothing matches the name exactly
    pub fn add_nm_fallible(&mut self, key: &Key, name: &[u8], loc: Location) -> Result<Option<Location>> {
        self.add_named(key, name, loc, true)
    }

    fn add_named(&mut self, key: &Key, name: &[u8], loc: Location, fallible: bool) -> Result<Option<Location>> {
        if let Some(mut path) = self.find_name(key, name, fallible)? {
            self.reserve_nodes(path.len())?;
            self.dirty_path(&mut path)?;
            return self.set_leaf(&path, loc);
        }
        self.insert_new(key, loc).map(|_| None)
    }

    /// Point `key` at `new` only if it still points at `old`
    ///
    /// Used by garbage collection, which may race with a mutation that
    /// already moved the key elsewhere.
    pub fn replace(&mut self, key: &Key, old: Location, new: Location) -> Result<bool> {
        let Seek::At(mut path) = self.seek(key)? else {
            return Ok(false);
        };
        loop {
            let br = self.branch(&path)?;
            if br.key != *key {
                return Ok(false);
            }
            if br.loc == Some(old) {
                break;
            }
            if !key.is_hashed() || !self.prev(&mut path)? {
                return Ok(false);
            }
        }
        self.reserve_nodes(path.len())?;
        self.dirty_path(&mut path)?;
        self.set_leaf(&path, new)?;
        Ok(true)
    }

    fn set_leaf(&mut self, path: &Path, loc: Location) -> Result<Option<Location>> {
        let step = last(path)?;
        let br = &mut self.node_mut(step.id)?.branches[step.idx];
        br.leaf = None;
        Ok(br.loc.replace(loc))
    }

    /// Add a branch for a key that has no exact match
    fn insert_new(&mut self, key: &Key, loc: Location) -> Result<()> {
        let (mut path, pos) = match self.seek(key)? {
            Seek::Empty => {
                self.reserve_nodes(0)?;
                let root = self.arena.insert(Znode::new_dirty(0, vec![Zbranch::leaf(*key, loc)]));
                self.dirty_cnt += 1;
                self.root = Some(root);
                return Ok(());
            }
            Seek::Before(path) => (path, 0),
            Seek::At(path) => {
                let idx = last(&path)?.idx;
                (path, idx + 1)
            }
        };
        self.reserve_nodes(path.len())?;
        self.dirty_path(&mut path)?;
        self.insert_at(path, pos, Zbranch::leaf(*key, loc))
    }

    /// Insert `br` at `pos` of the dirty znode at the end of `path`,
    /// splitting upwards as needed
    fn insert_at(&mut self, mut path: Path, pos: usize, br: Zbranch) -> Result<()> {
        let id = last(&path)?.id;
        let fanout = self.fanout;
        let node = self.node_mut(id)?;
        let level = node.level;

        if node.branches.len() < fanout {
            node.branches.insert(pos, br);
            if pos == 0 {
                self.fix_lower_bounds(&path)?;
            }
            return Ok(());
        }

        let mut all = std::mem::take(&mut node.branches);
        all.insert(pos, br);
        let keep = split_point(&all, pos, level, fanout);
        let moved = all.split_off(keep);
        let right_key = moved[0].key;
        self.node_mut(id)?.branches = all;
        let right = self.arena.insert(Znode::new_dirty(level, moved));
        self.dirty_cnt += 1;
        if pos == 0 {
            self.fix_lower_bounds(&path)?;
        }

        path.pop();
        if path.is_empty() {
            let left_key = self.node(id)?.branches[0].key;
            let root = self.arena.insert(Znode::new_dirty(
                level + 1,
                vec![Zbranch::internal(left_key, id), Zbranch::internal(right_key, right)],
            ));
            self.dirty_cnt += 1;
            self.root = Some(root);
            return Ok(());
        }
        let parent_pos = last(&path)?.idx + 1;
        self.insert_at(path, parent_pos, Zbranch::internal(right_key, right))
    }

    /// Lower ancestor keys after the first key of the node at the end of
    /// `path` got smaller
    fn fix_lower_bounds(&mut self, path: &Path) -> Result<()> {
        let Some(first) = self
            .node(last(path)?.id)?
            .branches
            .first()
            .map(|b| b.key)
        else {
            return Ok(());
        };
        for d in (0..path.len().saturating_sub(1)).rev() {
            let step = path[d];
            let br = &mut self.node_mut(step.id)?.branches[step.idx];
            if first < br.key {
                br.key = first;
            }
            if step.idx != 0 {
                break;
            }
        }
        Ok(())
    }
}

/// Number of branches the left half keeps when `all` (one over fanout)
/// is split after inserting at `pos`
fn split_point(all: &[Zbranch], pos: usize, level: u16, fanout: usize) -> usize {
    let key = all[pos].key;
    if level == 0 && key.kind() == KeyType::Data {
        let same_run = |k: &Key| k.kind() == KeyType::Data && k.inum() == key.inum();
        if pos == fanout {
            // Appending to a file: leave the full node behind
            if same_run(&all[pos - 1].key) {
                return fanout;
            }
        } else if pos >= (fanout + 1) / 2 && same_run(&all[0].key) && !same_run(&all[pos + 1].key) {
            // End of a run of data blocks: split right after it
            return pos + 1;
        }
    }
    (fanout + 1) / 2
}
