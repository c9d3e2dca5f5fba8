//! Garbage collection
//!
//! A victim unit's live nodes are copied to the GC journal head and the
//! unit is erased. Index units are never copied here: their live nodes are
//! dirtied in the index instead and the next commit writes them elsewhere.

use crate::error::{Result, StorageError};
use crate::journal::GC_HEAD;
use crate::key::{Key, KeyType};
use crate::ledger::{EU_INDEX, EU_TAKEN};
use crate::node::{Location, Node};
use crate::scan::{scan_eu, ScanMode};
use crate::store::{Locked, Store};
use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use tracing::{debug, info, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcOutcome {
    /// The unit is empty now
    Freed(u32),
    /// Only a commit can make progress: index nodes were dirtied or the
    /// log is full
    CommitNeeded,
}

/// What moving a unit's live nodes achieved
enum Moved {
    Done,
    LogFull,
}

impl Store {
    /// Reclaim one unit
    ///
    /// Without `force` freeable units are preferred and the search gives up
    /// after a few fruitless rounds. Fails with [`StorageError::NoSpace`]
    /// when nothing can be reclaimed.
    pub fn garbage_collect(&self, force: bool) -> Result<GcOutcome> {
        self.check_writable()?;
        let result = {
            let _sem = self.commit_sem.read();
            let mut l = self.lock_all();
            self.gc_locked(&mut l, force)
        };
        self.guard(result)
    }

    /// Collect until a journal head may switch to an empty unit
    ///
    /// That takes an empty unit beyond those kept for the index. A freed
    /// unit may simply replace the one GC itself just consumed, so a single
    /// pass is not always enough.
    pub(crate) fn make_free_unit(&self) -> Result<bool> {
        for _ in 0..self.config.gc_hard_limit {
            let stats = self.ledger_stats();
            if stats.empty_eus > stats.taken_empty_eus && stats.spare_eus() > self.budget.idx_reserve(&stats) {
                return Ok(true);
            }
            match self.garbage_collect(false) {
                Ok(GcOutcome::Freed(_)) => {}
                Ok(GcOutcome::CommitNeeded) => self.run_commit(true)?,
                Err(StorageError::NoSpace) => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }

    fn gc_locked(&self, l: &mut Locked<'_>, force: bool) -> Result<GcOutcome> {
        let dead_wm = self.config.dead_wm();
        let max_space = self.config.dark_wm().max(dead_wm);
        let mut min_space = dead_wm;
        let mut tried = BTreeSet::new();
        let mut commit_needed = false;

        for round in 0..self.config.gc_hard_limit {
            if !force && round >= self.config.gc_soft_limit {
                break;
            }
            let buds: BTreeSet<u32> = l.journal.bud_eus().into_iter().collect();
            let gc_eu = l.journal.gc_eu();
            let exclude = |eu: u32| buds.contains(&eu) || Some(eu) == gc_eu || tried.contains(&eu);
            let mut found = l.ledger.find_dirty(min_space, !force, &exclude);
            if found.is_none() && min_space > dead_wm {
                min_space = dead_wm;
                found = l.ledger.find_dirty(min_space, !force, &exclude);
            }
            let Some(eu) = found else {
                break;
            };
            tried.insert(eu);

            let p = l.ledger.lookup(eu)?;
            trace!("gc victim {}: free {}, dirty {}", eu, p.free, p.dirty);
            if p.flags & EU_INDEX != 0 {
                if self.dirty_index_eu(l, eu)? {
                    commit_needed = true;
                }
                min_space = (min_space * 2).min(max_space);
                continue;
            }

            if p.free + p.dirty < self.config.eu_size {
                l.ledger.set_flags(eu, EU_TAKEN)?;
                match self.move_nodes(l, eu) {
                    Ok(Moved::Done) => {}
                    Ok(Moved::LogFull) => {
                        l.ledger.clear_flags(eu, EU_TAKEN)?;
                        debug!("gc stopped at unit {}: log full", eu);
                        return Ok(GcOutcome::CommitNeeded);
                    }
                    Err(e) => {
                        l.ledger.clear_flags(eu, EU_TAKEN)?;
                        return Err(e);
                    }
                }
            }
            self.release_unit(l, eu)?;
            return Ok(GcOutcome::Freed(eu));
        }

        if commit_needed {
            Ok(GcOutcome::CommitNeeded)
        } else {
            Err(StorageError::NoSpace)
        }
    }

    /// Dirty every index node of `eu` the tree still uses
    fn dirty_index_eu(&self, l: &mut Locked<'_>, eu: u32) -> Result<bool> {
        let scanned = scan_eu(&*self.dev, eu, 0, ScanMode::Strict, self.config.read_retries)?;
        let mut dirtied = 0;
        for n in &scanned.nodes {
            let Node::Idx(idx) = &n.node else {
                continue;
            };
            let Some(first) = idx.branches.first() else {
                continue;
            };
            let loc = Location::new(eu, n.offs, n.header.len);
            if l.tnc.dirty_index_node(idx.level, &first.key, loc)? {
                dirtied += 1;
            }
        }
        debug!("index unit {}: {} nodes dirtied", eu, dirtied);
        Ok(dirtied > 0)
    }

    /// Copy the live nodes of `eu` to the GC head
    ///
    /// Inodes and entries go first, then data in key order so that a
    /// file's blocks stay together.
    fn move_nodes(&self, l: &mut Locked<'_>, eu: u32) -> Result<Moved> {
        let scanned = scan_eu(&*self.dev, eu, 0, ScanMode::Strict, self.config.read_retries)?;
        let mut data: Vec<(Key, Location, Node)> = Vec::new();
        let mut other: Vec<(Key, Location, Node)> = Vec::new();
        for n in scanned.nodes {
            let Some(key) = n.node.key() else {
                continue;
            };
            let loc = Location::new(eu, n.offs, n.header.len);
            if !l.tnc.contains(&key, loc)? {
                continue;
            }
            if key.kind() == KeyType::Data {
                data.push((key, loc, n.node));
            } else {
                other.push((key, loc, n.node));
            }
        }
        data.sort_by_key(|(key, ..)| *key);
        other.sort_by_key(|(key, ..)| (key.kind() != KeyType::Inode, *key));

        let count = data.len() + other.len();
        for (key, old, node) in other.into_iter().chain(data) {
            let Some(locs) = l.write(GC_HEAD, std::slice::from_ref(&node))? else {
                return Ok(Moved::LogFull);
            };
            let new = locs[0];
            if !l.tnc.replace(&key, old, new)? {
                // Superseded while being copied
                l.dirt(Some(new))?;
            }
        }
        trace!("moved {} live nodes out of unit {}", count, eu);
        Ok(Moved::Done)
    }

    /// Erase a reclaimed unit and hand it to GC if GC has none
    fn release_unit(&self, l: &mut Locked<'_>, eu: u32) -> Result<()> {
        self.dev.sync()?;
        self.dev.unmap(eu)?;
        l.ledger.make_empty(eu)?;
        if l.journal.gc_eu().is_none() {
            l.ledger.set_flags(eu, EU_TAKEN)?;
            l.journal.set_gc_eu(Some(eu));
        }
        self.gc_seq.fetch_add(1, Ordering::AcqRel);
        info!("gc freed unit {}", eu);
        Ok(())
    }
}
