//! Journal operations
//!
//! Each operation reserves its budget, appends one node group, points the
//! index at the new nodes and charges whatever they displaced to the
//! ledger. A full log makes the operation commit and try again.

use crate::budget::BudgetRequest;
use crate::error::{Result, StorageError};
use crate::io::read_node;
use crate::journal::{BASE_HEAD, DATA_HEAD};
use crate::key::{Key, MAX_KEY_VALUE};
use crate::node::{
    DataNode, EntryNode, InodeNode, Location, Node, TruncNode, MAX_INLINE_DATA, MAX_NAME_LEN,
};
use crate::store::{Locked, Store};
use std::sync::atomic::Ordering;
use tracing::{debug, trace};

/// Mode bits given to extended attribute inodes
pub const XATTR_MODE: u32 = 0o100000;

fn check_name(name: &[u8]) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(StorageError::InvalidArgument(format!(
            "name of {} bytes",
            name.len()
        )));
    }
    Ok(())
}

fn node_len(node: &Node) -> u64 {
    node.encoded_len() as u64
}

impl Store {
    /// Run `op` under the journal locks with `req` reserved
    ///
    /// `op` returns `None` when the log had no room; nothing has been
    /// changed then, and it is retried after a commit.
    fn journal_op<T>(
        &self,
        req: &BudgetRequest,
        mut op: impl FnMut(&mut Locked<'_>) -> Result<Option<T>>,
    ) -> Result<T> {
        self.check_writable()?;
        self.reserve_budget(req)?;
        let result = self.retry_on_full_log(&mut op);
        self.release_budget(req);
        self.guard(result)
    }

    fn retry_on_full_log<T>(
        &self,
        op: &mut dyn FnMut(&mut Locked<'_>) -> Result<Option<T>>,
    ) -> Result<T> {
        let mut reclaimed = 0;
        loop {
            let attempt = {
                let _sem = self.commit_sem.read();
                let mut l = self.lock_all();
                l.tnc
                    .ensure_room(4, self.config.shrink_batch)
                    .and_then(|_| {
                        let before = l.journal.written();
                        let out = op(&mut l)?;
                        Ok((out, l.journal.written().saturating_sub(before)))
                    })
            };
            match attempt {
                Ok((Some(v), written)) => {
                    self.note_written(written);
                    return Ok(v);
                }
                Ok((None, _)) => {
                    debug!("log full, committing before retrying");
                    self.run_commit(true)?;
                }
                // No unit for a journal head: the space is held by dirty
                // units of the current window
                Err(StorageError::NoSpace) if reclaimed < self.config.budget_retries => {
                    reclaimed += 1;
                    debug!("journal out of units, reclaiming (attempt {})", reclaimed);
                    self.run_commit(true)?;
                    self.make_free_unit()?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn find_locked(&self, l: &mut Locked<'_>, key: &Key) -> Result<Option<(Location, Node)>> {
        let Some(loc) = l.tnc.lookup(key)? else {
            return Ok(None);
        };
        let (_, node) = read_node(&*self.dev, loc, Some(key), self.config.read_retries)?;
        Ok(Some((loc, node)))
    }

    fn find_entry_locked(&self, l: &mut Locked<'_>, key: &Key, name: &[u8]) -> Result<Option<(Location, EntryNode)>> {
        let Some(loc) = l.tnc.lookup_nm(key, name)? else {
            return Ok(None);
        };
        match read_node(&*self.dev, loc, Some(key), self.config.read_retries)? {
            (_, Node::Dent(e)) | (_, Node::Xent(e)) => Ok(Some((loc, e))),
            (_, other) => Err(StorageError::corrupt(
                loc.eu,
                loc.offs,
                format!("{:?} node where an entry was indexed", other.node_type()),
            )),
        }
    }

    fn inode_locked(&self, l: &mut Locked<'_>, inum: u64) -> Result<InodeNode> {
        match self.find_locked(l, &Key::inode(inum))? {
            Some((_, Node::Inode(ino))) => Ok(ino),
            _ => Err(StorageError::InvalidArgument(format!("no inode {}", inum))),
        }
    }

    /// Allocate an inode number
    pub fn next_inum(&self) -> u64 {
        self.highest_inum.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn read_inode(&self, inum: u64) -> Result<Option<InodeNode>> {
        match self.read_node(&Key::inode(inum))? {
            Some(Node::Inode(ino)) => Ok(Some(ino)),
            _ => Ok(None),
        }
    }

    /// Write a live inode
    pub fn write_inode(&self, ino: &InodeNode) -> Result<()> {
        if ino.nlink == 0 {
            return Err(StorageError::InvalidArgument(format!(
                "inode {} without links; use delete_inode",
                ino.inum()
            )));
        }
        if ino.data.len() > MAX_INLINE_DATA {
            return Err(StorageError::InvalidArgument(format!(
                "{} bytes of inline data",
                ino.data.len()
            )));
        }
        let node = Node::Inode(ino.clone());
        let len = node_len(&node);
        let req = if self.lookup(&ino.key)?.is_some() {
            BudgetRequest::new(0, 0, len)
        } else {
            BudgetRequest::new(1, len, 0)
        };
        self.journal_op(&req, |l| {
            let Some(locs) = l.write(BASE_HEAD, std::slice::from_ref(&node))? else {
                return Ok(None);
            };
            let old = l.tnc.add(&ino.key, locs[0])?;
            l.dirt(old)?;
            Ok(Some(()))
        })?;
        self.highest_inum.fetch_max(ino.inum(), Ordering::AcqRel);
        trace!("wrote inode {}", ino.inum());
        Ok(())
    }

    /// Write one data block of an inode
    pub fn write_data(&self, inum: u64, block: u32, data: &[u8]) -> Result<()> {
        if data.len() as u32 > self.config.block_size || block > MAX_KEY_VALUE {
            return Err(StorageError::InvalidArgument(format!(
                "block {} of {} bytes",
                block,
                data.len()
            )));
        }
        let key = Key::data(inum, block);
        let node = Node::Data(DataNode {
            key,
            data: data.to_vec(),
        });
        let len = node_len(&node);
        let req = if self.lookup(&key)?.is_some() {
            BudgetRequest::new(0, 0, len)
        } else {
            BudgetRequest::new(1, len, 0)
        };
        self.journal_op(&req, |l| {
            let Some(locs) = l.write(DATA_HEAD, std::slice::from_ref(&node))? else {
                return Ok(None);
            };
            let old = l.tnc.add(&key, locs[0])?;
            l.dirt(old)?;
            Ok(Some(()))
        })
    }

    /// Link `target` into directory `dir` under `name`
    ///
    /// An existing entry of the same name is replaced.
    pub fn add_entry(&self, dir: u64, name: &[u8], target: u64, dtype: u8) -> Result<()> {
        check_name(name)?;
        if target == 0 {
            return Err(StorageError::InvalidArgument("entry without target".to_string()));
        }
        let key = Key::dent(dir, name, self.config.key_hash);
        let dent = Node::Dent(EntryNode {
            key,
            target,
            dtype,
            name: name.to_vec(),
        });
        let req = BudgetRequest::new(1, node_len(&dent), node_len(&dent) + 512);
        self.journal_op(&req, |l| {
            let mut dir_ino = self.inode_locked(l, dir)?;
            let replacing = l.tnc.lookup_nm(&key, name)?.is_some();
            if !replacing {
                dir_ino.size += name.len() as u64;
            }
            let nodes = [dent.clone(), Node::Inode(dir_ino)];
            let Some(locs) = l.write(BASE_HEAD, &nodes)? else {
                return Ok(None);
            };
            let old = l.tnc.add_nm(&key, name, locs[0])?;
            l.dirt(old)?;
            let old = l.tnc.add(&Key::inode(dir), locs[1])?;
            l.dirt(old)?;
            Ok(Some(()))
        })
    }

    /// Unlink `name` from `dir`; false if there was no such entry
    pub fn remove_entry(&self, dir: u64, name: &[u8]) -> Result<bool> {
        check_name(name)?;
        let key = Key::dent(dir, name, self.config.key_hash);
        self.journal_op(&BudgetRequest::default(), |l| {
            if l.tnc.lookup_nm(&key, name)?.is_none() {
                return Ok(Some(false));
            }
            let mut dir_ino = self.inode_locked(l, dir)?;
            dir_ino.size = dir_ino.size.saturating_sub(name.len() as u64);
            let nodes = [
                Node::Dent(EntryNode {
                    key,
                    target: 0,
                    dtype: 0,
                    name: name.to_vec(),
                }),
                Node::Inode(dir_ino),
            ];
            let Some(locs) = l.write(BASE_HEAD, &nodes)? else {
                return Ok(None);
            };
            let old = l.tnc.remove_nm(&key, name)?;
            l.dirt(old.into_iter().chain(Some(locs[0])))?;
            let old = l.tnc.add(&Key::inode(dir), locs[1])?;
            l.dirt(old)?;
            Ok(Some(true))
        })
    }

    /// Look a directory entry up by name; returns the target inode
    pub fn lookup_entry(&self, dir: u64, name: &[u8]) -> Result<Option<u64>> {
        let key = Key::dent(dir, name, self.config.key_hash);
        match self.read_entry(&key, name)? {
            Some(Node::Dent(e)) => Ok(Some(e.target)),
            _ => Ok(None),
        }
    }

    /// Set an extended attribute of `host`; returns the attribute's inode
    pub fn set_xattr(&self, host: u64, name: &[u8], value: &[u8]) -> Result<u64> {
        check_name(name)?;
        if value.len() > MAX_INLINE_DATA {
            return Err(StorageError::InvalidArgument(format!(
                "attribute value of {} bytes",
                value.len()
            )));
        }
        let key = Key::xent(host, name, self.config.key_hash);
        let xinum = self.next_inum();
        let xent = Node::Xent(EntryNode {
            key,
            target: xinum,
            dtype: 0,
            name: name.to_vec(),
        });
        let mut xino = InodeNode::new(xinum, XATTR_MODE);
        xino.size = value.len() as u64;
        xino.data = value.to_vec();
        let xino = Node::Inode(xino);
        let req = BudgetRequest::new(2, node_len(&xent) + node_len(&xino), 512);

        self.journal_op(&req, |l| {
            let mut host_ino = self.inode_locked(l, host)?;
            let previous = self.find_entry_locked(l, &key, name)?.map(|(_, e)| e.target);
            let mut nodes = vec![xent.clone(), xino.clone()];
            if let Some(old) = previous {
                let mut gone = InodeNode::new(old, XATTR_MODE);
                gone.nlink = 0;
                nodes.push(Node::Inode(gone));
            } else {
                host_ino.xattr_count += 1;
            }
            nodes.push(Node::Inode(host_ino));

            let Some(locs) = l.write(BASE_HEAD, &nodes)? else {
                return Ok(None);
            };
            let old = l.tnc.add_nm(&key, name, locs[0])?;
            l.dirt(old)?;
            let old = l.tnc.add(&Key::inode(xinum), locs[1])?;
            l.dirt(old)?;
            if let Some(old) = previous {
                let gone = l.tnc.remove_range(&Key::lowest(old), &Key::highest(old))?;
                l.dirt(gone.into_iter().chain(Some(locs[2])))?;
            }
            let old = l.tnc.add(&Key::inode(host), locs[locs.len() - 1])?;
            l.dirt(old)?;
            Ok(Some(()))
        })?;
        self.highest_inum.fetch_max(xinum, Ordering::AcqRel);
        Ok(xinum)
    }

    pub fn get_xattr(&self, host: u64, name: &[u8]) -> Result<Option<Vec<u8>>> {
        let key = Key::xent(host, name, self.config.key_hash);
        let Some(Node::Xent(e)) = self.read_entry(&key, name)? else {
            return Ok(None);
        };
        Ok(self.read_inode(e.target)?.map(|ino| ino.data))
    }

    /// Remove an extended attribute; false if `host` had none of that name
    pub fn remove_xattr(&self, host: u64, name: &[u8]) -> Result<bool> {
        check_name(name)?;
        let key = Key::xent(host, name, self.config.key_hash);
        self.journal_op(&BudgetRequest::default(), |l| {
            let Some((_, xent)) = self.find_entry_locked(l, &key, name)? else {
                return Ok(Some(false));
            };
            let mut host_ino = self.inode_locked(l, host)?;
            host_ino.xattr_count = host_ino.xattr_count.saturating_sub(1);
            let mut gone = InodeNode::new(xent.target, XATTR_MODE);
            gone.nlink = 0;
            let nodes = [
                Node::Xent(EntryNode {
                    key,
                    target: 0,
                    dtype: 0,
                    name: name.to_vec(),
                }),
                Node::Inode(gone),
                Node::Inode(host_ino),
            ];
            let Some(locs) = l.write(BASE_HEAD, &nodes)? else {
                return Ok(None);
            };
            let old = l.tnc.remove_nm(&key, name)?;
            l.dirt(old)?;
            let gone = l
                .tnc
                .remove_range(&Key::lowest(xent.target), &Key::highest(xent.target))?;
            l.dirt(gone.into_iter().chain([locs[0], locs[1]]))?;
            let old = l.tnc.add(&Key::inode(host), locs[2])?;
            l.dirt(old)?;
            Ok(Some(true))
        })
    }

    /// Change the size of an inode, dropping blocks past the new end
    pub fn truncate(&self, inum: u64, new_size: u64) -> Result<()> {
        let bs = self.config.block_size as u64;
        let trun = TruncNode {
            inum,
            old_size: 0,
            new_size,
        };
        let req = BudgetRequest::new(0, node_len(&Node::Trun(trun)), 512);
        self.journal_op(&req, |l| {
            let mut ino = self.inode_locked(l, inum)?;
            let old_size = ino.size;
            ino.size = new_size;
            if new_size >= old_size {
                let Some(locs) = l.write(BASE_HEAD, &[Node::Inode(ino)])? else {
                    return Ok(None);
                };
                let old = l.tnc.add(&Key::inode(inum), locs[0])?;
                l.dirt(old)?;
                return Ok(Some(()));
            }

            let nodes = [
                Node::Trun(TruncNode {
                    inum,
                    old_size,
                    new_size,
                }),
                Node::Inode(ino),
            ];
            let Some(locs) = l.write(BASE_HEAD, &nodes)? else {
                return Ok(None);
            };
            let first = new_size.div_ceil(bs).min(MAX_KEY_VALUE as u64) as u32;
            let gone = l
                .tnc
                .remove_range(&Key::data(inum, first), &Key::data(inum, MAX_KEY_VALUE))?;
            debug!("truncated inode {} to {}, {} blocks dropped", inum, new_size, gone.len());
            l.dirt(gone.into_iter().chain(Some(locs[0])))?;
            let old = l.tnc.add(&Key::inode(inum), locs[1])?;
            l.dirt(old)?;
            Ok(Some(()))
        })
    }

    /// Delete an inode with all its data, entries and attributes
    ///
    /// Deleting an inode that does not exist succeeds.
    pub fn delete_inode(&self, inum: u64) -> Result<()> {
        self.journal_op(&BudgetRequest::default(), |l| {
            let Some((_, Node::Inode(mut ino))) = self.find_locked(l, &Key::inode(inum))? else {
                self.orphans.lock().remove(inum);
                return Ok(Some(()));
            };

            let mut xinums = Vec::new();
            for (key, loc) in l.tnc.range(&Key::xent_hash(inum, 0), &Key::highest(inum))? {
                if let (_, Node::Xent(e)) = read_node(&*self.dev, loc, Some(&key), self.config.read_retries)? {
                    xinums.push(e.target);
                }
            }

            ino.nlink = 0;
            let mut nodes = vec![Node::Inode(ino)];
            for &x in &xinums {
                let mut gone = InodeNode::new(x, XATTR_MODE);
                gone.nlink = 0;
                nodes.push(Node::Inode(gone));
            }
            let Some(locs) = l.write(BASE_HEAD, &nodes)? else {
                return Ok(None);
            };
            for x in std::iter::once(inum).chain(xinums.iter().copied()) {
                let gone = l.tnc.remove_range(&Key::lowest(x), &Key::highest(x))?;
                l.dirt(gone)?;
            }
            l.dirt(locs)?;
            self.orphans.lock().remove(inum);
            debug!("deleted inode {} and {} attributes", inum, xinums.len());
            Ok(Some(()))
        })
    }

    /// Remember an unlinked inode that is still in use
    pub fn add_orphan(&self, inum: u64) -> Result<()> {
        self.check_writable()?;
        if self.orphans.lock().add(inum) {
            trace!("inode {} orphaned", inum);
        }
        Ok(())
    }

    pub fn remove_orphan(&self, inum: u64) -> Result<bool> {
        self.check_writable()?;
        Ok(self.orphans.lock().remove(inum))
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::io::MemDevice;
    use crate::store::MountMode;
    use std::sync::Arc;

    const DIR: u64 = 1;

    fn mounted() -> (Arc<MemDevice>, Store) {
        let config = Config::small(4096, 16);
        let dev = Arc::new(MemDevice::for_config(&config));
        Store::format(&*dev, &config).unwrap();
        let store = Store::mount(dev.clone(), config, MountMode::ReadWrite).unwrap();
        store.write_inode(&InodeNode::new(DIR, 0o040755)).unwrap();
        (dev, store)
    }

    fn remount(dev: &Arc<MemDevice>, store: Store) -> Store {
        let config = store.config().clone();
        drop(store);
        Store::mount(Arc::new(dev.snapshot()), config, MountMode::ReadWrite).unwrap()
    }

    #[test]
    fn test_rejects_bad_arguments() {
        let (_dev, store) = mounted();
        let mut dead = InodeNode::new(5, 0o644);
        dead.nlink = 0;
        assert!(matches!(store.write_inode(&dead), Err(StorageError::InvalidArgument(_))));
        let big = vec![0u8; store.config().block_size as usize + 1];
        assert!(matches!(store.write_data(5, 0, &big), Err(StorageError::InvalidArgument(_))));
        assert!(matches!(store.add_entry(DIR, b"", 5, 0), Err(StorageError::InvalidArgument(_))));
        assert!(matches!(store.add_entry(99, b"x", 5, 0), Err(StorageError::InvalidArgument(_))));
    }

    #[test]
    fn test_entries_link_and_unlink() {
        let (dev, store) = mounted();
        let file = store.next_inum();
        store.write_inode(&InodeNode::new(file, 0o100644)).unwrap();
        store.add_entry(DIR, b"a.txt", file, 1).unwrap();
        assert_eq!(store.lookup_entry(DIR, b"a.txt").unwrap(), Some(file));
        assert_eq!(store.read_inode(DIR).unwrap().unwrap().size, 5);

        assert!(store.remove_entry(DIR, b"a.txt").unwrap());
        assert!(!store.remove_entry(DIR, b"a.txt").unwrap());
        assert_eq!(store.lookup_entry(DIR, b"a.txt").unwrap(), None);

        store.add_entry(DIR, b"b.txt", file, 1).unwrap();
        let store = remount(&dev, store);
        assert_eq!(store.lookup_entry(DIR, b"b.txt").unwrap(), Some(file));
        assert_eq!(store.lookup_entry(DIR, b"a.txt").unwrap(), None);
    }

    #[test]
    fn test_xattrs_replace_and_remove() {
        let (dev, store) = mounted();
        let x1 = store.set_xattr(DIR, b"user.tag", b"one").unwrap();
        let x2 = store.set_xattr(DIR, b"user.tag", b"two").unwrap();
        assert_ne!(x1, x2);
        assert_eq!(store.get_xattr(DIR, b"user.tag").unwrap(), Some(b"two".to_vec()));
        assert!(store.read_inode(x1).unwrap().is_none());
        assert_eq!(store.read_inode(DIR).unwrap().unwrap().xattr_count, 1);

        let store = remount(&dev, store);
        assert_eq!(store.get_xattr(DIR, b"user.tag").unwrap(), Some(b"two".to_vec()));
        assert!(store.remove_xattr(DIR, b"user.tag").unwrap());
        assert!(!store.remove_xattr(DIR, b"user.tag").unwrap());
        assert!(store.read_inode(x2).unwrap().is_none());
        assert_eq!(store.read_inode(DIR).unwrap().unwrap().xattr_count, 0);
    }

    #[test]
    fn test_truncate_drops_tail_blocks() {
        let (dev, store) = mounted();
        let bs = store.config().block_size as usize;
        let mut ino = InodeNode::new(10, 0o100644);
        ino.size = (bs * 4) as u64;
        store.write_inode(&ino).unwrap();
        for b in 0..4 {
            store.write_data(10, b, &vec![b as u8; bs]).unwrap();
        }
        store.truncate(10, bs as u64 + 1).unwrap();
        assert!(store.lookup(&Key::data(10, 1)).unwrap().is_some());
        assert!(store.lookup(&Key::data(10, 2)).unwrap().is_none());
        assert_eq!(store.read_inode(10).unwrap().unwrap().size, bs as u64 + 1);

        let store = remount(&dev, store);
        assert!(store.lookup(&Key::data(10, 2)).unwrap().is_none());
        assert!(store.lookup(&Key::data(10, 3)).unwrap().is_none());
        assert_eq!(store.read_inode(10).unwrap().unwrap().size, bs as u64 + 1);
    }

    #[test]
    fn test_delete_inode_removes_everything() {
        let (dev, store) = mounted();
        store.write_inode(&InodeNode::new(20, 0o100644)).unwrap();
        store.write_data(20, 0, b"payload").unwrap();
        let x = store.set_xattr(20, b"user.a", b"v").unwrap();
        store.delete_inode(20).unwrap();
        assert!(store.read_inode(20).unwrap().is_none());
        assert!(store.lookup(&Key::data(20, 0)).unwrap().is_none());
        assert!(store.read_inode(x).unwrap().is_none());
        store.delete_inode(20).unwrap();

        let store = remount(&dev, store);
        assert!(store.read_inode(20).unwrap().is_none());
        assert!(store.read_inode(x).unwrap().is_none());
    }

    #[test]
    fn test_orphans_are_deleted_on_mount() {
        let (dev, store) = mounted();
        store.write_inode(&InodeNode::new(30, 0o100644)).unwrap();
        store.add_orphan(30).unwrap();
        store.run_commit(true).unwrap();
        assert_eq!(store.orphan_count(), 1);

        let store = remount(&dev, store);
        assert!(store.read_inode(30).unwrap().is_none());
        assert_eq!(store.orphan_count(), 0);
    }

    #[test]
    fn test_full_log_commits_and_retries() {
        let (_dev, store) = mounted();
        let before = store.commit_number();
        for round in 0..40u8 {
            for b in 0..8 {
                store.write_data(DIR, b, &[round; 300]).unwrap();
            }
        }
        assert!(store.commit_number() > before);
        match store.read_node(&Key::data(DIR, 7)).unwrap() {
            Some(Node::Data(d)) => assert_eq!(d.data, vec![39u8; 300]),
            other => panic!("unexpected {:?}", other),
        }
        store.check_ledger().unwrap();
    }
}
