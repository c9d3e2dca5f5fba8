//! Journal heads and buds
//!
//! New nodes are appended at one of three heads: garbage collection output,
//! metadata, and bulk data. A unit a head writes into is a bud; its
//! reference goes to the log before the first byte of new data, so replay
//! can find everything written since the last commit.

use crate::config::Config;
use crate::error::{Result, StorageError};
use crate::io::Device;
use crate::ledger::{Ledger, EU_TAKEN};
use crate::log::Log;
use crate::node::{align_up, GroupFlag, Location, Node, RefNode};
use crate::scan::{pad_to, padding};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

pub const GC_HEAD: usize = 0;
pub const BASE_HEAD: usize = 1;
pub const DATA_HEAD: usize = 2;
pub const HEAD_CNT: usize = 3;

/// Hand out the next sequence number
pub fn next_sqnum(counter: &AtomicU64) -> u64 {
    counter.fetch_add(1, Ordering::SeqCst) + 1
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Jhead {
    pub eu: Option<u32>,
    pub offs: u32,
}

#[derive(Debug, Clone)]
pub struct Journal {
    heads: [Jhead; HEAD_CNT],
    log: Log,
    /// Units written since their reference was logged, tagged with the
    /// commit whose log window references them
    buds: BTreeMap<u32, u64>,
    cmt_no: u64,
    gc_eu: Option<u32>,
    eu_size: u32,
    min_io: u32,
    /// Bytes appended since the last commit started
    written: u64,
    /// Spare units to keep for the index
    idx_reserve: u32,
}

impl Journal {
    pub fn new(config: &Config, log: Log, cmt_no: u64, buds: BTreeMap<u32, u64>, gc_eu: Option<u32>) -> Self {
        Journal {
            heads: [Jhead::default(); HEAD_CNT],
            log,
            buds,
            cmt_no,
            gc_eu,
            eu_size: config.eu_size,
            min_io: config.min_io_size,
            written: 0,
            idx_reserve: 0,
        }
    }

    pub fn head(&self, head: usize) -> Jhead {
        self.heads[head]
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn cmt_no(&self) -> u64 {
        self.cmt_no
    }

    pub fn gc_eu(&self) -> Option<u32> {
        self.gc_eu
    }

    pub fn set_gc_eu(&mut self, eu: Option<u32>) {
        self.gc_eu = eu;
    }

    pub fn is_bud(&self, eu: u32) -> bool {
        self.buds.contains_key(&eu)
    }

    pub fn bud_eus(&self) -> Vec<u32> {
        self.buds.keys().copied().collect()
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn set_idx_reserve(&mut self, eus: u32) {
        self.idx_reserve = eus;
    }

    /// Append `nodes` as one group at `head`
    ///
    /// Returns the node locations, or `None` when no unit could be opened
    /// because the log is full.
    pub fn write(
        &mut self,
        dev: &dyn Device,
        ledger: &mut Ledger,
        sqnum: &AtomicU64,
        head: usize,
        nodes: &[Node],
    ) -> Result<Option<Vec<Location>>> {
        let total: u32 = nodes.iter().map(|n| align_up(n.encoded_len(), 8)).sum();
        let need = align_up(total, self.min_io);
        if nodes.is_empty() || need > self.eu_size {
            return Err(StorageError::InvalidArgument(format!(
                "journal write of {} nodes, {} bytes",
                nodes.len(),
                need
            )));
        }

        let fits = match self.heads[head].eu {
            Some(_) => self.heads[head].offs + need <= self.eu_size,
            None => false,
        };
        if !fits && !self.switch_unit(dev, ledger, sqnum, head, need)? {
            return Ok(None);
        }
        let Jhead { eu: Some(eu), offs } = self.heads[head] else {
            return Err(StorageError::Internal(format!("journal head {} has no unit", head)));
        };

        let mut buf = Vec::with_capacity(need as usize);
        let mut locs = Vec::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            let group = match (nodes.len(), i + 1 == nodes.len()) {
                (1, _) => GroupFlag::None,
                (_, true) => GroupFlag::LastOfGroup,
                _ => GroupFlag::InGroup,
            };
            let bytes = node.encode(next_sqnum(sqnum), group);
            locs.push(Location::new(eu, offs + buf.len() as u32, bytes.len() as u32));
            buf.extend_from_slice(&bytes);
            buf.resize(align_up(buf.len() as u32, 8) as usize, 0);
        }
        pad_to(&mut buf, self.min_io);
        dev.write(eu, offs, &buf)?;

        let end = offs + buf.len() as u32;
        let pad = buf.len() as u32 - total;
        self.heads[head].offs = end;
        self.written += buf.len() as u64;
        let p = ledger.lookup(eu)?;
        ledger.change(eu, Some(self.eu_size - end), Some(p.dirty + pad), None)?;
        trace!("head {} wrote {} nodes at {}:{}", head, nodes.len(), eu, offs);
        Ok(Some(locs))
    }

    /// Move `head` to a unit with room for `need` bytes
    fn switch_unit(
        &mut self,
        dev: &dyn Device,
        ledger: &mut Ledger,
        sqnum: &AtomicU64,
        head: usize,
        need: u32,
    ) -> Result<bool> {
        if let Some(old) = self.heads[head].eu.take() {
            let offs = self.heads[head].offs;
            if offs < self.eu_size {
                dev.write(old, offs, &padding(self.eu_size - offs))?;
                let p = ledger.lookup(old)?;
                ledger.change(old, Some(0), Some(p.dirty + (self.eu_size - offs)), None)?;
            }
            ledger.clear_flags(old, EU_TAKEN)?;
        }

        let from_gc = head == GC_HEAD && self.gc_eu.is_some();
        let eu = match self.gc_eu.filter(|_| head == GC_HEAD) {
            Some(eu) => eu,
            None => {
                let gc_eu = self.gc_eu;
                let exclude = |eu: u32| Some(eu) == gc_eu;
                // Empty units go to the index first
                let pick_empty = head == GC_HEAD || ledger.stats().spare_eus() > self.idx_reserve;
                ledger.find_free(need, pick_empty, &exclude).ok_or(StorageError::NoSpace)?
            }
        };

        // Garbage from an interrupted commit or a fully obsolete unit is
        // erased before the head starts over at offset 0. A bud of the
        // current window is resumed where it ends instead.
        let mut p = ledger.lookup(eu)?;
        if p.free + p.dirty == self.eu_size && p.free != self.eu_size && !self.is_bud(eu) {
            dev.unmap(eu)?;
            ledger.change(eu, Some(self.eu_size), Some(0), None)?;
            p = ledger.lookup(eu)?;
        } else if p.free == self.eu_size && dev.is_mapped(eu)? {
            dev.unmap(eu)?;
        }
        let offs = self.eu_size - p.free;
        if offs + need > self.eu_size {
            return Err(StorageError::Internal(format!(
                "unit {} has {} free bytes, {} needed",
                eu, p.free, need
            )));
        }

        let r = RefNode {
            eu,
            offs,
            jhead: head as u32,
        };
        if !self.log.add_ref(dev, r, next_sqnum(sqnum))? {
            return Ok(false);
        }
        if from_gc {
            self.gc_eu = None;
        }
        ledger.set_flags(eu, EU_TAKEN)?;
        self.buds.insert(eu, self.cmt_no);
        self.heads[head] = Jhead { eu: Some(eu), offs };
        debug!("head {} moves to unit {} at {}", head, eu, offs);
        Ok(true)
    }

    /// Log the commit-start record and references to the current heads
    ///
    /// Returns the new commit number, the unit holding its commit-start
    /// node and the node's sequence number.
    pub fn start_commit(&mut self, dev: &dyn Device, sqnum: &AtomicU64) -> Result<(u64, u32, u64)> {
        let cmt_no = self.cmt_no + 1;
        let cs_sqnum = next_sqnum(sqnum);
        let refs: Vec<(RefNode, u64)> = self
            .heads
            .iter()
            .enumerate()
            .filter_map(|(i, h)| {
                h.eu.map(|eu| {
                    (
                        RefNode {
                            eu,
                            offs: h.offs,
                            jhead: i as u32,
                        },
                        next_sqnum(sqnum),
                    )
                })
            })
            .collect();
        let tail = self.log.start_commit(dev, cmt_no, cs_sqnum, &refs)?;

        self.cmt_no = cmt_no;
        for (r, _) in &refs {
            self.buds.insert(r.eu, cmt_no);
        }
        self.written = 0;
        Ok((cmt_no, tail, cs_sqnum))
    }

    /// The commit started by [`Journal::start_commit`] reached media
    pub fn end_commit(&mut self, new_tail: u32) {
        self.log.end_commit(new_tail);
        let cmt_no = self.cmt_no;
        self.buds.retain(|_, tag| *tag == cmt_no);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemDevice;
    use crate::ledger::LedgerGeometry;
    use crate::node::{DataNode, InodeNode};
    use crate::key::Key;
    use crate::scan::{scan_eu, ScanMode};

    struct Rig {
        config: Config,
        dev: MemDevice,
        ledger: Ledger,
        sqnum: AtomicU64,
        journal: Journal,
    }

    fn rig() -> Rig {
        let config = Config::small(4096, 16);
        let dev = MemDevice::for_config(&config);
        let ledger = Ledger::format(LedgerGeometry::from_config(&config));
        let first = config.log_first();
        let log = Log::new(&config, first, first, 0);
        let journal = Journal::new(&config, log, 0, BTreeMap::new(), None);
        Rig {
            config,
            dev,
            ledger,
            sqnum: AtomicU64::new(0),
            journal,
        }
    }

    fn data(block: u32, len: usize) -> Node {
        Node::Data(DataNode {
            key: Key::data(5, block),
            data: vec![block as u8; len],
        })
    }

    #[test]
    fn test_write_logs_bud_and_accounts_space() {
        let mut r = rig();
        let locs = r
            .journal
            .write(&r.dev, &mut r.ledger, &r.sqnum, DATA_HEAD, &[data(0, 100)])
            .unwrap()
            .unwrap();
        let loc = locs[0];
        let eu = loc.eu;
        assert!(r.config.is_main(eu));
        assert!(r.journal.is_bud(eu));

        let p = r.ledger.lookup(eu).unwrap();
        assert_eq!(p.free, r.config.eu_size - loc.aligned_len());
        assert_eq!(p.dirty, 0);
        assert_ne!(p.flags & EU_TAKEN, 0);

        // The reference went to the log first
        let log = scan_eu(&r.dev, r.config.log_first(), 0, ScanMode::Strict, 0).unwrap();
        assert!(matches!(&log.nodes[0].node, Node::Ref(rf) if rf.eu == eu && rf.offs == 0 && rf.jhead == 2));
        assert!(log.nodes[0].header.sqnum < 2);
        r.ledger.check().unwrap();
    }

    #[test]
    fn test_groups_are_flagged() {
        let mut r = rig();
        let nodes = [
            Node::Inode(InodeNode::new(5, 0o644)),
            data(0, 16),
            data(1, 16),
        ];
        let locs = r
            .journal
            .write(&r.dev, &mut r.ledger, &r.sqnum, BASE_HEAD, &nodes)
            .unwrap()
            .unwrap();
        let scanned = scan_eu(&r.dev, locs[0].eu, 0, ScanMode::Strict, 0).unwrap();
        let flags: Vec<_> = scanned.nodes.iter().map(|n| n.header.group).collect();
        assert_eq!(
            flags,
            vec![GroupFlag::InGroup, GroupFlag::InGroup, GroupFlag::LastOfGroup]
        );
        let sqnums: Vec<_> = scanned.nodes.iter().map(|n| n.header.sqnum).collect();
        assert!(sqnums.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_full_unit_is_padded_and_released() {
        let mut r = rig();
        let mut first = None;
        let mut moved = None;
        for block in 0..16 {
            let loc = r
                .journal
                .write(&r.dev, &mut r.ledger, &r.sqnum, DATA_HEAD, &[data(block, 500)])
                .unwrap()
                .unwrap()[0];
            match first {
                None => first = Some(loc.eu),
                Some(eu) if eu != loc.eu => {
                    moved = Some(loc.eu);
                    break;
                }
                _ => {}
            }
        }
        let (old, new) = (first.unwrap(), moved.unwrap());
        let p = r.ledger.lookup(old).unwrap();
        assert_eq!(p.free, 0);
        assert_eq!(p.flags & EU_TAKEN, 0);
        assert!(p.dirty > 0);
        assert!(r.journal.is_bud(old) && r.journal.is_bud(new));

        let scanned = scan_eu(&r.dev, old, 0, ScanMode::Strict, 0).unwrap();
        assert!(scanned.outcome.is_clean());
        assert_eq!(scanned.end, r.config.eu_size);
        r.ledger.check().unwrap();
    }

    #[test]
    fn test_gc_head_takes_reserved_unit() {
        let mut r = rig();
        let gc = r.config.main_first() + 7;
        r.ledger.set_flags(gc, EU_TAKEN).unwrap();
        r.journal.set_gc_eu(Some(gc));
        let loc = r
            .journal
            .write(&r.dev, &mut r.ledger, &r.sqnum, GC_HEAD, &[data(3, 8)])
            .unwrap()
            .unwrap()[0];
        assert_eq!(loc.eu, gc);
        assert_eq!(r.journal.gc_eu(), None);
    }

    #[test]
    fn test_commit_retags_buds() {
        let mut r = rig();
        let a = r
            .journal
            .write(&r.dev, &mut r.ledger, &r.sqnum, DATA_HEAD, &[data(0, 8)])
            .unwrap()
            .unwrap()[0]
            .eu;
        let (cmt_no, tail, _) = r.journal.start_commit(&r.dev, &r.sqnum).unwrap();
        assert_eq!(cmt_no, 1);
        r.journal.end_commit(tail);
        assert_eq!(r.journal.log().tail(), tail);
        // Still the data head, so still a bud of the new window
        assert!(r.journal.is_bud(a));
        assert_eq!(r.journal.written(), 0);
    }
}
