//! Removal and tree collapse

use super::{last, Path, Seek, Tnc};
use crate::error::{Result, StorageError};
use crate::key::Key;
use crate::node::Location;

impl Tnc {
    /// Drop a unique key, returning the location it pointed at
    pub fn remove(&mut self, key: &Key) -> Result<Option<Location>> {
        if key.is_hashed() {
            return Err(StorageError::InvalidArgument(format!(
                "entry key {} needs a name",
                key
            )));
        }
        let Seek::At(path) = self.seek(key)? else {
            return Ok(None);
        };
        if self.branch(&path)?.key != *key {
            return Ok(None);
        }
        self.remove_at(path).map(Some)
    }

    /// Drop the entry with `key` and `name`
    pub fn remove_nm(&mut self, key: &Key, name: &[u8]) -> Result<Option<Location>> {
        match self.find_name(key, name, false)? {
            Some(path) => self.remove_at(path).map(Some),
            None => Ok(None),
        }
    }

    /// Like [`Tnc::remove_nm`], but drops an unreadable branch with the
    /// same hash when no name matches
    pub fn remove_nm_fallible(&mut self, key: &Key, name: &[u8]) -> Result<Option<Location>> {
        match self.find_name(key, name, true)? {
            Some(path) => self.remove_at(path).map(Some),
            None => Ok(None),
        }
    }

    /// Drop every key in `[low, high]`, returning the displaced locations
    pub fn remove_range(&mut self, low: &Key, high: &Key) -> Result<Vec<Location>> {
        let mut removed = Vec::new();
        while let Some(path) = self.seek_ge(low)? {
            if self.branch(&path)?.key > *high {
                break;
            }
            removed.push(self.remove_at(path)?);
        }
        Ok(removed)
    }

    /// Remove the leaf branch at the end of `path`
    pub(crate) fn remove_at(&mut self, mut path: Path) -> Result<Location> {
        self.reserve_nodes(path.len())?;
        self.dirty_path(&mut path)?;
        let step = last(&path)?;
        let br = self.node_mut(step.id)?.branches.remove(step.idx);
        let loc = br
            .loc
            .ok_or_else(|| StorageError::Internal(format!("leaf branch {} has no location", br.key)))?;

        // Empty nodes leave their parents, possibly all the way up
        loop {
            let step = last(&path)?;
            if !self.node(step.id)?.branches.is_empty() {
                break;
            }
            path.pop();
            self.free_node(step.id)?;
            match path.last() {
                Some(parent) => {
                    let parent = *parent;
                    self.node_mut(parent.id)?.branches.remove(parent.idx);
                }
                None => {
                    self.root = None;
                    return Ok(loc);
                }
            }
        }

        // A root with one child is redundant
        while let Some(root) = self.root {
            let z = self.node(root)?;
            if z.is_leaf() || z.branches.len() != 1 {
                break;
            }
            let child = self.child(root, 0)?;
            self.free_node(root)?;
            self.root = Some(child);
        }
        Ok(loc)
    }
}
