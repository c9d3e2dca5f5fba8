//! Commit log
//!
//! A ring of units holding commit-start nodes and references to buds. The
//! live window starts at the unit with the last commit-start node (the
//! tail) and runs to the head, where new references are appended. Units
//! outside the window are stale and get unmapped when the head enters them.

use crate::config::Config;
use crate::error::{Result, StorageError};
use crate::io::Device;
use crate::node::{CommitStartNode, GroupFlag, Node, RefNode};
use crate::scan::pad_to;
use tracing::{debug, trace};

#[derive(Debug, Clone)]
pub struct Log {
    first: u32,
    count: u32,
    eu_size: u32,
    min_io: u32,
    ltail: u32,
    lhead: u32,
    lhead_offs: u32,
}

impl Log {
    pub fn new(config: &Config, ltail: u32, lhead: u32, lhead_offs: u32) -> Self {
        Log {
            first: config.log_first(),
            count: config.log_eus,
            eu_size: config.eu_size,
            min_io: config.min_io_size,
            ltail,
            lhead,
            lhead_offs,
        }
    }

    pub fn tail(&self) -> u32 {
        self.ltail
    }

    pub fn head(&self) -> (u32, u32) {
        (self.lhead, self.lhead_offs)
    }

    /// The log unit after `eu` in ring order
    pub fn next(&self, eu: u32) -> u32 {
        self.first + (eu - self.first + 1) % self.count
    }

    fn enter(&mut self, dev: &dyn Device, eu: u32) -> Result<()> {
        if dev.is_mapped(eu)? {
            dev.unmap(eu)?;
        }
        trace!("log head moves to unit {}", eu);
        self.lhead = eu;
        self.lhead_offs = 0;
        Ok(())
    }

    /// Append a bud reference
    ///
    /// Returns false when the log is full; the caller has to commit, which
    /// moves the tail, and try again.
    pub fn add_ref(&mut self, dev: &dyn Device, r: RefNode, sqnum: u64) -> Result<bool> {
        let mut bytes = Node::Ref(r).encode(sqnum, GroupFlag::None);
        pad_to(&mut bytes, self.min_io);
        let len = bytes.len() as u32;

        if self.lhead_offs + len > self.eu_size {
            let next = self.next(self.lhead);
            // The window may not wrap into its own tail, and the unit after
            // the new head must stay free for the next commit-start node
            if next == self.ltail || self.next(next) == self.ltail {
                debug!("log full (tail {}, head {})", self.ltail, self.lhead);
                return Ok(false);
            }
            self.enter(dev, next)?;
        }
        dev.write(self.lhead, self.lhead_offs, &bytes)?;
        self.lhead_offs += len;
        Ok(true)
    }

    /// Write a commit-start node followed by references to the current
    /// journal heads into a fresh unit
    ///
    /// Returns the unit, which becomes the tail once the commit is on media.
    pub fn start_commit(&mut self, dev: &dyn Device, cmt_no: u64, cs_sqnum: u64, refs: &[(RefNode, u64)]) -> Result<u32> {
        let next = self.next(self.lhead);
        if next == self.ltail {
            return Err(StorageError::Internal(format!(
                "no log unit left for commit {} (tail {}, head {})",
                cmt_no, self.ltail, self.lhead
            )));
        }

        let mut bytes = Node::CommitStart(CommitStartNode { cmt_no }).encode(cs_sqnum, GroupFlag::None);
        for (r, sqnum) in refs {
            bytes.resize(crate::node::align_up(bytes.len() as u32, 8) as usize, 0);
            bytes.extend_from_slice(&Node::Ref(r.clone()).encode(*sqnum, GroupFlag::None));
        }
        pad_to(&mut bytes, self.min_io);
        if bytes.len() as u32 > self.eu_size {
            return Err(StorageError::Internal(format!(
                "commit-start record of {} bytes exceeds a log unit",
                bytes.len()
            )));
        }

        self.enter(dev, next)?;
        dev.write(next, 0, &bytes)?;
        self.lhead_offs = bytes.len() as u32;
        debug!("commit {} starts in log unit {}", cmt_no, next);
        Ok(next)
    }

    /// The commit that started in `new_tail` reached media
    pub fn end_commit(&mut self, new_tail: u32) {
        self.ltail = new_tail;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemDevice;
    use crate::scan::{scan_eu, ScanMode};

    fn setup() -> (Config, MemDevice, Log) {
        let config = Config::small(4096, 16);
        let dev = MemDevice::for_config(&config);
        let first = config.log_first();
        let log = Log::new(&config, first, first, 0);
        (config, dev, log)
    }

    fn bud(eu: u32) -> RefNode {
        RefNode { eu, offs: 0, jhead: 1 }
    }

    #[test]
    fn test_refs_fill_the_ring_then_report_full() {
        let (config, dev, mut log) = setup();
        let first = config.log_first();
        log.start_commit(&dev, 1, 1, &[]).unwrap();
        log.end_commit(first + 1);

        let mut sqnum = 2;
        let mut added = 0;
        while log.add_ref(&dev, bud(8), sqnum).unwrap() {
            sqnum += 1;
            added += 1;
        }
        // Two units: the head may never wrap into the tail
        assert!(added > 0);
        assert_eq!(log.head().0, first + 1);
        assert!(!log.add_ref(&dev, bud(9), sqnum).unwrap());
    }

    #[test]
    fn test_commit_start_opens_fresh_unit() {
        let config = Config {
            log_eus: 3,
            ..Config::small(4096, 16)
        };
        let dev = MemDevice::for_config(&config);
        let first = config.log_first();
        let mut log = Log::new(&config, first, first, 0);
        log.add_ref(&dev, bud(8), 5).unwrap();

        let refs = [(bud(10), 8), (RefNode { eu: 11, offs: 512, jhead: 2 }, 9)];
        let tail = log.start_commit(&dev, 4, 7, &refs).unwrap();
        assert_eq!(tail, first + 1);
        log.end_commit(tail);

        let scanned = scan_eu(&dev, tail, 0, ScanMode::Strict, 0).unwrap();
        assert!(scanned.outcome.is_clean());
        assert_eq!(scanned.nodes.len(), 3);
        assert!(matches!(&scanned.nodes[0].node, Node::CommitStart(cs) if cs.cmt_no == 4));
        assert_eq!(scanned.nodes[0].header.sqnum, 7);
        assert!(matches!(&scanned.nodes[2].node, Node::Ref(r) if r.eu == 11 && r.offs == 512));
        assert_eq!(log.head(), (tail, scanned.end));
    }

    #[test]
    fn test_entering_a_unit_erases_it() {
        let (config, dev, mut log) = setup();
        let first = config.log_first();
        dev.write(first + 1, 0, &[0u8; 8]).unwrap();
        log.start_commit(&dev, 1, 1, &[]).unwrap();
        let scanned = scan_eu(&dev, first + 1, 0, ScanMode::Strict, 0).unwrap();
        assert_eq!(scanned.nodes.len(), 1);
    }
}
