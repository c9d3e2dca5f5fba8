//! Two-phase commit
//!
//! Phase one runs with every mutation shut out: it starts a new log window,
//! lays the dirty index out into index units and snapshots the ledger and
//! the orphan set. Phase two writes all of that and then the master record
//! without holding any lock, so journal writers only stall for phase one.

use crate::config::Config;
use crate::error::{Result, StorageError};
use crate::journal::next_sqnum;
use crate::ledger::{Ledger, LedgerWrite, EU_INDEX, EU_TAKEN};
use crate::node::{align_up, GroupFlag, Location, MasterNode, Node, MST_DIRTY};
use crate::orphan::OrphanWrite;
use crate::scan::pad_to;
use crate::store::{fill_stats, write_ledger, CommitState, Locked, MasterState, Store};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, trace};

/// Index nodes bound for one unit
#[derive(Debug)]
struct IndexChunk {
    eu: u32,
    offs: u32,
    bytes: Vec<u8>,
    /// Bytes of nodes, excluding trailing padding
    used: u32,
    /// The unit was free or freeable and must be erased first
    fresh: bool,
}

/// Places index nodes during layout
///
/// The first node goes to the tail of the current index head if it fits.
/// Further units are taken empty, then freeable. Every chosen unit is
/// marked taken until the commit finishes.
struct IndexPlacer<'a> {
    config: &'a Config,
    ledger: &'a mut Ledger,
    sqnum: &'a AtomicU64,
    exclude: BTreeSet<u32>,
    ihead: Option<(u32, u32)>,
    cur: Option<IndexChunk>,
    done: Vec<IndexChunk>,
}

impl<'a> IndexPlacer<'a> {
    fn new(
        config: &'a Config,
        ledger: &'a mut Ledger,
        sqnum: &'a AtomicU64,
        exclude: BTreeSet<u32>,
        ihead: Option<(u32, u32)>,
    ) -> Self {
        IndexPlacer {
            config,
            ledger,
            sqnum,
            exclude,
            ihead,
            cur: None,
            done: Vec::new(),
        }
    }

    fn place(&mut self, node: &Node) -> Result<Location> {
        let bytes = node.encode(next_sqnum(self.sqnum), GroupFlag::None);
        let len = align_up(bytes.len() as u32, 8);
        let fits = |c: &IndexChunk| c.offs + c.used + len <= self.config.eu_size;
        if !self.cur.as_ref().is_some_and(fits) {
            self.close()?;
            self.open(len)?;
        }
        let Some(chunk) = self.cur.as_mut() else {
            return Err(StorageError::Internal("index placer has no open unit".to_string()));
        };
        let loc = Location::new(chunk.eu, chunk.offs + chunk.used, bytes.len() as u32);
        chunk.bytes.extend_from_slice(&bytes);
        chunk.bytes.resize((chunk.used + len) as usize, 0);
        chunk.used += len;
        Ok(loc)
    }

    fn open(&mut self, len: u32) -> Result<()> {
        let eu_size = self.config.eu_size;
        if let Some((eu, offs)) = self.ihead.take() {
            if offs + len <= eu_size && !self.exclude.contains(&eu) {
                self.ledger.set_flags(eu, EU_TAKEN)?;
                self.exclude.insert(eu);
                trace!("index continues in unit {} at {}", eu, offs);
                self.cur = Some(IndexChunk {
                    eu,
                    offs,
                    bytes: Vec::new(),
                    used: 0,
                    fresh: false,
                });
                return Ok(());
            }
        }

        let exclude = &self.exclude;
        let skip = |eu: u32| exclude.contains(&eu);
        let eu = self
            .ledger
            .find_empty(&skip)
            .or_else(|| self.ledger.find_freeable(&skip))
            .ok_or(StorageError::NoSpace)?;
        self.ledger
            .change(eu, Some(eu_size), Some(0), Some(EU_INDEX | EU_TAKEN))?;
        self.exclude.insert(eu);
        trace!("index opens unit {}", eu);
        self.cur = Some(IndexChunk {
            eu,
            offs: 0,
            bytes: Vec::new(),
            used: 0,
            fresh: true,
        });
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let Some(mut chunk) = self.cur.take() else {
            return Ok(());
        };
        pad_to(&mut chunk.bytes, self.config.min_io_size);
        let pad = chunk.bytes.len() as u32 - chunk.used;
        let end = chunk.offs + chunk.bytes.len() as u32;
        let p = self.ledger.lookup(chunk.eu)?;
        self.ledger.change(
            chunk.eu,
            Some(self.config.eu_size - end),
            Some(p.dirty + pad),
            None,
        )?;
        self.done.push(chunk);
        Ok(())
    }

    /// All chunks, and the index head the next commit continues at
    fn finish(mut self) -> Result<(Vec<IndexChunk>, Option<(u32, u32)>)> {
        self.close()?;
        let eu_size = self.config.eu_size;
        let ihead = match self.done.last() {
            Some(c) => {
                let end = c.offs + c.bytes.len() as u32;
                (end < eu_size).then_some((c.eu, end))
            }
            None => self.ihead,
        };
        Ok((self.done, ihead))
    }
}

/// Everything phase one decided
struct CommitPlan {
    cmt_no: u64,
    tail: u32,
    chunks: Vec<IndexChunk>,
    ledger_write: Option<LedgerWrite>,
    orphan_write: OrphanWrite,
    master: MasterNode,
    ihead: Option<(u32, u32)>,
    idx_size: u64,
    consumed: u64,
}

impl Store {
    /// Run a commit
    ///
    /// With `required` unset this is a hint: it returns at once if a commit
    /// is already running and does nothing when there is nothing to commit.
    /// Otherwise it waits for a running commit and then runs its own.
    pub fn run_commit(&self, required: bool) -> Result<()> {
        {
            let mut ctl = self.commit.lock();
            loop {
                match ctl.state {
                    CommitState::Broken => return Err(StorageError::ReadOnly),
                    CommitState::Running if !required => return Ok(()),
                    CommitState::Running => self.commit_cv.wait(&mut ctl),
                    CommitState::Resting => break,
                }
            }
            self.check_writable()?;
            ctl.state = CommitState::Running;
        }

        let result = self.do_commit(required);
        let mut ctl = self.commit.lock();
        match &result {
            Ok(_) => {
                ctl.state = CommitState::Resting;
                ctl.done += 1;
            }
            Err(e) => {
                error!("commit failed: {}", e);
                ctl.state = CommitState::Broken;
                self.set_failed(e);
            }
        }
        self.commit_cv.notify_all();
        result.map(|_| ())
    }

    fn do_commit(&self, required: bool) -> Result<bool> {
        let plan = {
            let _sem = self.commit_sem.write();
            let mut l = self.lock_all();
            if !required
                && l.journal.written() == 0
                && l.tnc.dirty_count() == 0
                && l.ledger.dirty_nodes() == 0
            {
                trace!("nothing to commit");
                return Ok(false);
            }
            let orphans = self.orphans.lock();
            let m = self.master.lock();
            let orphan_write = |cmt_no| {
                orphans.prepare_commit(&self.config, cmt_no, &mut || next_sqnum(&self.sqnum))
            };
            self.prepare_commit(&mut l, &m, orphan_write)?
        };
        self.write_commit(&plan)?;
        self.finish_commit(plan)?;
        Ok(true)
    }

    fn prepare_commit(
        &self,
        l: &mut Locked<'_>,
        m: &MasterState,
        orphan_write: impl FnOnce(u64) -> Result<OrphanWrite>,
    ) -> Result<CommitPlan> {
        let consumed = self.budget.uncommitted_idx();
        let (cmt_no, tail, cs_sqnum) = l.journal.start_commit(&*self.dev, &self.sqnum)?;
        let stale = l.tnc.take_stale();
        l.dirt(stale)?;

        let mut exclude: BTreeSet<u32> = l.journal.bud_eus().into_iter().collect();
        exclude.extend(l.journal.gc_eu());
        let gc_eu = l.journal.gc_eu();
        let Locked { tnc, ledger, .. } = l;

        let mut placer = IndexPlacer::new(&self.config, ledger, &self.sqnum, exclude, m.ihead);
        let summary = tnc.layout(&mut |node| placer.place(node))?;
        let (chunks, ihead) = placer.finish()?;

        let ledger_write = ledger.prepare_commit(&mut || next_sqnum(&self.sqnum))?;
        let orphan_write = orphan_write(cmt_no)?;

        let (ihead_eu, ihead_offs) = ihead.unwrap_or((0, 0));
        let mut master = MasterNode {
            cmt_no,
            flags: m.master.flags | MST_DIRTY,
            highest_inum: self.highest_inum.load(Ordering::Acquire),
            cs_sqnum,
            log_eu: tail,
            root: summary.root,
            idx_size: summary.idx_size,
            ihead_eu,
            ihead_offs,
            gc_eu: gc_eu.unwrap_or(0),
            ledger_root: ledger.root(),
            ledger_eu: ledger.live_eu(),
            ledger_offs: ledger.offs(),
            main_eus: self.config.main_eus,
            ..MasterNode::default()
        };
        fill_stats(&mut master, &ledger.stats());
        debug!(
            "commit {} laid out {} index nodes in {} units",
            cmt_no,
            summary.written,
            chunks.len()
        );

        Ok(CommitPlan {
            cmt_no,
            tail,
            chunks,
            ledger_write,
            orphan_write,
            master,
            ihead,
            idx_size: summary.idx_size,
            consumed,
        })
    }

    fn write_commit(&self, plan: &CommitPlan) -> Result<()> {
        let dev = &*self.dev;
        for c in &plan.chunks {
            if c.fresh && dev.is_mapped(c.eu)? {
                dev.unmap(c.eu)?;
            }
            dev.write(c.eu, c.offs, &c.bytes)?;
        }
        if let Some(lw) = &plan.ledger_write {
            write_ledger(dev, lw)?;
        }
        dev.change(plan.orphan_write.eu, &plan.orphan_write.bytes)?;
        dev.sync()?;

        let mut m = self.master.lock();
        m.slots.write(dev, &plan.master, next_sqnum(&self.sqnum))?;
        dev.sync()
    }

    fn finish_commit(&self, plan: CommitPlan) -> Result<()> {
        let _sem = self.commit_sem.read();
        let mut l = self.lock_all();
        l.journal.end_commit(plan.tail);
        l.tnc.commit_done();
        for c in &plan.chunks {
            l.ledger.clear_flags(c.eu, EU_TAKEN)?;
        }

        let mut m = self.master.lock();
        m.ihead = plan.ihead;
        for eu in l.ledger.frdi_idx_eus() {
            self.dev.unmap(eu)?;
            l.ledger.make_empty(eu)?;
            if m.ihead.is_some_and(|(h, _)| h == eu) {
                m.ihead = None;
            }
            trace!("index unit {} is free again", eu);
        }
        m.master = plan.master;
        self.budget.commit_done(plan.idx_size, plan.consumed);
        self.bg_bytes.store(0, Ordering::Release);
        info!(
            "commit {} done, index {} bytes",
            plan.cmt_no, plan.idx_size
        );
        Ok(())
    }
}
