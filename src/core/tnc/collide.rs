//! Entry keys and hash collisions
//!
//! Directory and attribute entries are keyed by a hash of their name, so
//! several branches may carry the same key. Equal keys sit next to each
//! other in insertion order; resolving one means reading the entries and
//! comparing names.

use super::{Path, Seek, Tnc};
use crate::error::Result;
use crate::key::Key;
use crate::node::{Location, Node};
use std::sync::Arc;
use tracing::warn;

impl Tnc {
    /// Path to the branch holding `key` with `name`
    ///
    /// With `fallible`, a branch whose node fails to read as a valid entry
    /// stands in for the name when no readable branch matches. Replay uses
    /// this: the unreadable node may be the very entry being replayed, lost
    /// to an unclean unmount after the index was committed.
    pub(crate) fn find_name(&mut self, key: &Key, name: &[u8], fallible: bool) -> Result<Option<Path>> {
        let Seek::At(mut path) = self.seek(key)? else {
            return Ok(None);
        };
        let mut dangling = None;
        loop {
            if self.branch(&path)?.key != *key {
                break;
            }
            match self.read_leaf(&path) {
                Ok(node) if node.name() == Some(name) => return Ok(Some(path)),
                Ok(_) => {}
                Err(e) if fallible && e.is_corruption() => {
                    warn!("dangling branch for {}: {}", key, e);
                    if dangling.is_none() {
                        dangling = Some(path.clone());
                    }
                }
                Err(e) => return Err(e),
            }
            if !self.prev(&mut path)? {
                break;
            }
        }
        Ok(dangling)
    }

    /// Location of the entry with `key` and `name`
    pub fn lookup_nm(&mut self, key: &Key, name: &[u8]) -> Result<Option<Location>> {
        match self.find_name(key, name, false)? {
            Some(path) => Ok(self.branch(&path)?.loc),
            None => Ok(None),
        }
    }

    /// Whether a branch with `key` points at `loc`
    ///
    /// Garbage collection asks this of every node it finds; entry keys are
    /// matched by location among their duplicates, without reading names.
    pub fn contains(&mut self, key: &Key, loc: Location) -> Result<bool> {
        let Seek::At(mut path) = self.seek(key)? else {
            return Ok(false);
        };
        loop {
            let br = self.branch(&path)?;
            if br.key != *key {
                return Ok(false);
            }
            if br.loc == Some(loc) {
                return Ok(true);
            }
            if !key.is_hashed() || !self.prev(&mut path)? {
                return Ok(false);
            }
        }
    }

    /// The entry following `(key, name)` among entries of the same owner
    /// and type
    ///
    /// Without a name, returns the first entry at or after `key`, so
    /// iteration starts from `key.first_of()`.
    pub fn next_entry(&mut self, key: &Key, name: Option<&[u8]>) -> Result<Option<(Key, Location, Arc<Node>)>> {
        let found = match name {
            Some(name) => match self.find_name(key, name, false)? {
                Some(mut path) => self.next(&mut path)?.then_some(path),
                None => self.seek_after(key)?,
            },
            None => self.seek_ge(key)?,
        };
        let Some(path) = found else {
            return Ok(None);
        };
        let br = self.branch(&path)?;
        let (next_key, loc) = (br.key, br.loc);
        if next_key.inum() != key.inum() || next_key.kind() != key.kind() {
            return Ok(None);
        }
        let Some(loc) = loc else {
            return Ok(None);
        };
        let node = self.read_leaf(&path)?;
        Ok(Some((next_key, loc, node)))
    }

    /// Path to the first branch with key `> key`
    fn seek_after(&mut self, key: &Key) -> Result<Option<Path>> {
        match self.seek(key)? {
            Seek::Empty => Ok(None),
            Seek::Before(path) => Ok(Some(path)),
            Seek::At(mut path) => Ok(self.next(&mut path)?.then_some(path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::tnc;
    use super::*;
    use crate::io::Device;
    use crate::key::KeyHash;
    use crate::node::{EntryNode, GroupFlag};
    use crate::scan::pad_to;

    struct Writer {
        eu: u32,
        offs: u32,
    }

    impl Writer {
        fn entry(&mut self, t: &Tnc, dir: u64, name: &[u8]) -> (Key, Location) {
            let key = Key::dent(dir, name, KeyHash::Simple);
            let node = Node::Dent(EntryNode {
                key,
                target: 100 + name.len() as u64,
                dtype: 1,
                name: name.to_vec(),
            });
            let mut bytes = node.encode(1, GroupFlag::None);
            let len = bytes.len() as u32;
            pad_to(&mut bytes, 8);
            t.dev.write(self.eu, self.offs, &bytes).unwrap();
            let loc = Location::new(self.eu, self.offs, len);
            self.offs += bytes.len() as u32;
            (key, loc)
        }
    }

    fn writer() -> Writer {
        Writer { eu: 8, offs: 0 }
    }

    #[test]
    fn test_colliding_names_resolve() {
        let mut t = tnc(3);
        let mut w = writer();
        let names: [&[u8]; 4] = [b"listen", b"silent", b"enlist", b"tinsel"];
        let mut locs = Vec::new();
        for name in names {
            let (key, loc) = w.entry(&t, 1, name);
            assert_eq!(t.add_nm(&key, name, loc).unwrap(), None);
            locs.push(loc);
        }
        let key = Key::dent(1, b"listen", KeyHash::Simple);
        for (name, loc) in names.iter().zip(&locs) {
            assert_eq!(t.lookup_nm(&key, name).unwrap(), Some(*loc));
        }
        assert_eq!(t.lookup_nm(&key, b"inlets").unwrap(), None);

        // Re-adding a name replaces only that entry
        let (_, newer) = w.entry(&t, 1, b"silent");
        assert_eq!(t.add_nm(&key, b"silent", newer).unwrap(), Some(locs[1]));
        assert_eq!(t.lookup_nm(&key, b"silent").unwrap(), Some(newer));
        assert_eq!(t.lookup_nm(&key, b"tinsel").unwrap(), Some(locs[3]));

        assert_eq!(t.remove_nm(&key, b"enlist").unwrap(), Some(locs[2]));
        assert_eq!(t.lookup_nm(&key, b"enlist").unwrap(), None);
        assert_eq!(t.lookup_nm(&key, b"listen").unwrap(), Some(locs[0]));
    }

    #[test]
    fn test_replace_picks_duplicate_by_location() {
        let mut t = tnc(3);
        let mut w = writer();
        let (key, a) = w.entry(&t, 1, b"ab");
        let (_, b) = w.entry(&t, 1, b"ba");
        t.add_nm(&key, b"ab", a).unwrap();
        t.add_nm(&key, b"ba", b).unwrap();

        let (_, moved) = w.entry(&t, 1, b"ab");
        assert!(t.contains(&key, a).unwrap());
        assert!(t.replace(&key, a, moved).unwrap());
        assert_eq!(t.lookup_nm(&key, b"ab").unwrap(), Some(moved));
        assert_eq!(t.lookup_nm(&key, b"ba").unwrap(), Some(b));
        assert!(!t.contains(&key, a).unwrap());
        assert!(t.contains(&key, b).unwrap());
        assert!(t.contains(&key, moved).unwrap());
    }

    #[test]
    fn test_next_entry_walks_a_directory() {
        let mut t = tnc(3);
        let mut w = writer();
        let names: [&[u8]; 6] = [b"a", b"bb", b"ab", b"ba", b"c", b"zz"];
        for name in names {
            let (key, loc) = w.entry(&t, 4, name);
            t.add_nm(&key, name, loc).unwrap();
        }
        let (other, loc) = w.entry(&t, 5, b"x");
        t.add_nm(&other, b"x", loc).unwrap();
        t.add(&Key::inode(4), Location::new(9, 0, 48)).unwrap();

        let mut seen = Vec::new();
        let mut cursor = Key::dent_hash(4, 0);
        let mut last: Option<Vec<u8>> = None;
        while let Some((key, _, node)) = t.next_entry(&cursor, last.as_deref()).unwrap() {
            let name = node.name().unwrap().to_vec();
            cursor = key;
            seen.push(name.clone());
            last = Some(name);
        }
        let mut expected: Vec<Vec<u8>> = names.iter().map(|n| n.to_vec()).collect();
        expected.sort();
        seen.sort();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_fallible_match_takes_unreadable_branch() {
        let mut t = tnc(4);
        let mut w = writer();
        let (key, good) = w.entry(&t, 1, b"ab");
        t.add_nm(&key, b"ab", good).unwrap();
        // A branch pointing at erased space
        let dangling = Location::new(9, 0, 56);
        t.add_nm_fallible(&key, b"ba", dangling).unwrap();
        assert!(matches!(t.lookup_nm(&key, b"ba"), Err(e) if e.is_corruption()));

        assert_eq!(t.remove_nm_fallible(&key, b"ba").unwrap(), Some(dangling));
        assert_eq!(t.lookup_nm(&key, b"ab").unwrap(), Some(good));
        assert_eq!(t.remove_nm_fallible(&key, b"ba").unwrap(), None);
    }
}
