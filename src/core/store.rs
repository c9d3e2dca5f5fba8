//! Mounted volume
//!
//! [`Store`] owns the device and every in-memory structure of a mounted
//! volume. Locks are always taken in the same order: the commit lock
//! (shared by mutations, exclusive for commit phase 1), then the journal,
//! the index and the ledger. Budget reservations happen before any of them.

use crate::budget::{Budget, BudgetRequest, BudgetSnapshot, Reclaim};
use crate::config::Config;
use crate::error::{RecoveryOutcome, Result, StorageError};
use crate::gc::GcOutcome;
use crate::io::{read_eu, read_node, Device};
use crate::journal::{next_sqnum, Journal};
use crate::key::Key;
use crate::ledger::{Ledger, LedgerGeometry, LedgerStats, LedgerWrite, EU_INDEX, EU_TAKEN};
use crate::log::Log;
use crate::master::{recover_master, require_master, MasterSlots};
use crate::node::{
    is_erased, CommitStartNode, EuProps, GroupFlag, Location, MasterNode, Node, MST_DIRTY,
    MST_RECOVERY,
};
use crate::orphan::{load_orphans, Orphans};
use crate::replay::{replay_journal, ReplayContext, SizeFix};
use crate::scan::{pad_to, truncate_eu};
use crate::tnc::{IndexStats, Tnc};
use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MountMode {
    #[default]
    ReadWrite,
    /// Nothing is written; repairs are remembered for [`Store::remount_rw`]
    ReadOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommitState {
    Resting,
    Running,
    /// A commit failed; the volume stays read-only until remounted
    Broken,
}

#[derive(Debug)]
pub(crate) struct CommitCtl {
    pub state: CommitState,
    /// Commits finished since mount
    pub done: u64,
}

#[derive(Debug)]
pub(crate) struct MasterState {
    pub master: MasterNode,
    pub slots: MasterSlots,
    /// Free tail of the unit index nodes are appended to
    pub ihead: Option<(u32, u32)>,
}

/// Work a read-only mount could not do
#[derive(Debug, Default)]
struct Deferred {
    size_fixes: Vec<SizeFix>,
    truncations: Vec<(u32, u32)>,
    delete_orphans: bool,
}

pub struct Store {
    pub(crate) dev: Arc<dyn Device>,
    pub(crate) config: Config,
    pub(crate) budget: Budget,
    pub(crate) commit_sem: RwLock<()>,
    pub(crate) journal: Mutex<Journal>,
    pub(crate) tnc: Mutex<Tnc>,
    pub(crate) ledger: Mutex<Ledger>,
    pub(crate) orphans: Mutex<Orphans>,
    pub(crate) commit: Mutex<CommitCtl>,
    pub(crate) commit_cv: Condvar,
    pub(crate) master: Mutex<MasterState>,
    pub(crate) sqnum: AtomicU64,
    pub(crate) highest_inum: AtomicU64,
    /// Bumped whenever garbage collection erases a unit
    pub(crate) gc_seq: AtomicU64,
    failed: AtomicBool,
    ro_mount: AtomicBool,
    /// Journal bytes since the last commit, watched by the background committer
    pub(crate) bg_bytes: CachePadded<AtomicU64>,
    pub(crate) bg_wake: Mutex<bool>,
    pub(crate) bg_cv: Condvar,
    deferred: Mutex<Deferred>,
    recovery: Vec<RecoveryOutcome>,
}

/// The journal, index and ledger, locked in order
pub(crate) struct Locked<'a> {
    pub store: &'a Store,
    pub journal: MutexGuard<'a, Journal>,
    pub tnc: MutexGuard<'a, Tnc>,
    pub ledger: MutexGuard<'a, Ledger>,
}

impl Locked<'_> {
    /// Append a node group at `head`; `None` when the log is full
    ///
    /// A failed media write leaves the head in an unknown state, so the
    /// volume stops taking mutations.
    pub fn write(&mut self, head: usize, nodes: &[Node]) -> Result<Option<Vec<Location>>> {
        let store = self.store;
        let reserve = store.budget.idx_reserve(&self.ledger.stats());
        self.journal.set_idx_reserve(reserve);
        let result = self
            .journal
            .write(&*store.dev, &mut self.ledger, &store.sqnum, head, nodes);
        if let Err(e @ StorageError::Io(_)) = &result {
            store.set_failed(e);
        }
        result
    }

    /// Account nodes that are no longer referenced
    pub fn dirt(&mut self, locs: impl IntoIterator<Item = Location>) -> Result<()> {
        for loc in locs {
            self.ledger.add_dirt(loc.eu, loc.aligned_len())?;
        }
        Ok(())
    }
}

fn check_geometry(dev: &dyn Device, config: &Config) -> Result<()> {
    let geo = dev.geometry();
    if geo.eu_size != config.eu_size || geo.min_io_size != config.min_io_size || geo.eu_count < config.total_eus() {
        return Err(StorageError::Config(format!(
            "device has {} units of {} bytes (min i/o {}), configuration needs {} of {} (min i/o {})",
            geo.eu_count,
            geo.eu_size,
            geo.min_io_size,
            config.total_eus(),
            config.eu_size,
            config.min_io_size
        )));
    }
    Ok(())
}

pub(crate) fn write_ledger(dev: &dyn Device, lw: &LedgerWrite) -> Result<()> {
    if lw.switch {
        dev.change(lw.eu, &lw.bytes)
    } else {
        dev.write(lw.eu, lw.offs, &lw.bytes)
    }
}

/// Copy the space totals into a master record
pub(crate) fn fill_stats(master: &mut MasterNode, stats: &LedgerStats) {
    master.empty_eus = stats.empty_eus;
    master.idx_eus = stats.idx_eus;
    master.total_free = stats.total_free;
    master.total_dirty = stats.total_dirty;
    master.total_used = stats.total_used;
    master.total_dead = stats.total_dead;
    master.total_dark = stats.total_dark;
}

impl Store {
    /// Write an empty volume
    pub fn format(dev: &dyn Device, config: &Config) -> Result<()> {
        config.check()?;
        check_geometry(dev, config)?;
        for eu in 0..config.total_eus() {
            if dev.is_mapped(eu)? {
                dev.unmap(eu)?;
            }
        }

        let sqnum = AtomicU64::new(0);
        let cs_sqnum = next_sqnum(&sqnum);
        let mut cs = Node::CommitStart(CommitStartNode { cmt_no: 0 }).encode(cs_sqnum, GroupFlag::None);
        pad_to(&mut cs, config.min_io_size);
        dev.write(config.log_first(), 0, &cs)?;

        let mut ledger = Ledger::format(LedgerGeometry::from_config(config));
        let gc_eu = config.main_first();
        ledger.set_flags(gc_eu, EU_TAKEN)?;
        let lw = ledger
            .prepare_commit(&mut || next_sqnum(&sqnum))?
            .ok_or_else(|| StorageError::Internal("fresh ledger has nothing to write".to_string()))?;
        write_ledger(dev, &lw)?;

        let ow = Orphans::default().prepare_commit(config, 0, &mut || next_sqnum(&sqnum))?;
        dev.change(ow.eu, &ow.bytes)?;

        let mut master = MasterNode {
            cs_sqnum,
            log_eu: config.log_first(),
            gc_eu,
            ledger_root: Some(lw.root),
            ledger_eu: ledger.live_eu(),
            ledger_offs: ledger.offs(),
            main_eus: config.main_eus,
            ..MasterNode::default()
        };
        fill_stats(&mut master, &ledger.stats());
        MasterSlots::new(config, [0, 0]).write(dev, &master, next_sqnum(&sqnum))?;
        dev.sync()?;
        info!(
            "formatted {} main units of {} bytes",
            config.main_eus, config.eu_size
        );
        Ok(())
    }

    /// Mount a formatted volume, replaying whatever the last commit missed
    pub fn mount(dev: Arc<dyn Device>, config: Config, mode: MountMode) -> Result<Store> {
        config.check()?;
        check_geometry(&*dev, &config)?;
        let read_only = mode == MountMode::ReadOnly;

        let recovered = require_master(recover_master(&*dev, &config, read_only)?)?;
        let mut recovery = Vec::new();
        if !recovered.outcome.is_clean() {
            recovery.push(recovered.outcome.clone());
        }
        let master = recovered.master.clone();
        let ledger_root = master
            .ledger_root
            .ok_or_else(|| StorageError::corrupt(0, 0, "master record without a ledger root"))?;

        let mut ledger = Ledger::load(
            &*dev,
            LedgerGeometry::from_config(&config),
            ledger_root,
            master.ledger_eu,
            master.ledger_offs,
            config.read_retries,
        )?;
        let mut tnc = Tnc::load(dev.clone(), &config, master.root, master.idx_size)?;
        let report = replay_journal(ReplayContext {
            dev: &*dev,
            config: &config,
            master: &master,
            tnc: &mut tnc,
            ledger: &mut ledger,
            read_only,
        })?;
        recovery.extend(report.outcomes.iter().cloned());

        ledger.clear_all_taken()?;
        let gc_eu = pick_gc_eu(&mut ledger, &config, &master, &report.buds)?;
        let log = Log::new(&config, master.log_eu, report.lhead.0, report.lhead.1);
        let journal = Journal::new(&config, log, master.cmt_no, report.buds.clone(), gc_eu);
        let orphans = load_orphans(&*dev, &config, master.cmt_no)?;
        // A head whose unit has since been freed or reused is dropped
        let ihead = (master.ihead_eu != 0)
            .then_some((master.ihead_eu, master.ihead_offs))
            .filter(|&(eu, offs)| {
                ledger.lookup(eu).is_ok_and(|p| {
                    p.flags & EU_INDEX != 0 && config.eu_size.checked_sub(offs) == Some(p.free)
                })
            });
        let sqnum = report.max_sqnum.max(recovered.sqnum);

        let store = Store {
            budget: Budget::new(&config, tnc.idx_size()),
            commit_sem: RwLock::new(()),
            journal: Mutex::new(journal),
            tnc: Mutex::new(tnc),
            ledger: Mutex::new(ledger),
            orphans: Mutex::new(orphans),
            commit: Mutex::new(CommitCtl {
                state: CommitState::Resting,
                done: 0,
            }),
            commit_cv: Condvar::new(),
            master: Mutex::new(MasterState {
                master,
                slots: recovered.slots,
                ihead,
            }),
            sqnum: AtomicU64::new(sqnum),
            highest_inum: AtomicU64::new(report.highest_inum),
            gc_seq: AtomicU64::new(0),
            failed: AtomicBool::new(false),
            ro_mount: AtomicBool::new(true),
            bg_bytes: CachePadded::new(AtomicU64::new(0)),
            bg_wake: Mutex::new(false),
            bg_cv: Condvar::new(),
            deferred: Mutex::new(Deferred {
                size_fixes: report.size_fixes,
                truncations: report.truncations,
                delete_orphans: true,
            }),
            recovery,
            dev,
            config,
        };

        if !read_only {
            store.go_writable()?;
        }
        info!(
            "mounted {} at commit {}, {} nodes replayed",
            if read_only { "read-only" } else { "read-write" },
            store.master.lock().master.cmt_no,
            report.replayed
        );
        Ok(store)
    }

    /// Commit and mark the volume clean
    pub fn unmount(&self) -> Result<()> {
        if self.ro_mount.load(Ordering::Acquire) {
            return Ok(());
        }
        self.run_commit(true)?;
        let _sem = self.commit_sem.write();
        let mut m = self.master.lock();
        m.master.flags &= !(MST_DIRTY | MST_RECOVERY);
        let MasterState { master, slots, .. } = &mut *m;
        slots.write(&*self.dev, master, next_sqnum(&self.sqnum))?;
        self.dev.sync()?;
        self.ro_mount.store(true, Ordering::Release);
        info!("unmounted cleanly at commit {}", master.cmt_no);
        Ok(())
    }

    /// Switch a read-only mount to read-write
    pub fn remount_rw(&self) -> Result<()> {
        if self.failed.load(Ordering::Acquire) {
            return Err(StorageError::ReadOnly);
        }
        if !self.ro_mount.load(Ordering::Acquire) {
            return Ok(());
        }
        self.go_writable()
    }

    fn go_writable(&self) -> Result<()> {
        let deferred = std::mem::take(&mut *self.deferred.lock());
        for &(eu, valid_end) in &deferred.truncations {
            truncate_eu(&*self.dev, eu, valid_end, self.config.read_retries)?;
        }
        self.normalize_tails()?;
        {
            let mut m = self.master.lock();
            m.master.flags = (m.master.flags | MST_DIRTY) & !MST_RECOVERY;
            let MasterState { master, slots, .. } = &mut *m;
            slots.write(&*self.dev, master, next_sqnum(&self.sqnum))?;
            self.dev.sync()?;
        }
        self.ro_mount.store(false, Ordering::Release);

        for fix in deferred.size_fixes {
            self.apply_size_fix(fix)?;
        }
        if deferred.delete_orphans {
            let inums: Vec<u64> = self.orphans.lock().iter().collect();
            if !inums.is_empty() {
                info!("deleting {} orphans of the last commit", inums.len());
            }
            for inum in inums {
                self.delete_inode(inum)?;
            }
        }
        Ok(())
    }

    /// Erase anything an interrupted commit left after the committed
    /// ledger and index tails, so they can be appended to again
    fn normalize_tails(&self) -> Result<()> {
        let (ledger_tail, ihead) = {
            let ledger = self.ledger.lock();
            let m = self.master.lock();
            ((ledger.live_eu(), ledger.offs()), m.ihead)
        };
        for (eu, offs) in std::iter::once(ledger_tail).chain(ihead) {
            let buf = read_eu(&*self.dev, eu, self.config.read_retries)?;
            if (offs as usize) < buf.len() && !is_erased(&buf[offs as usize..]) {
                warn!("unit {} holds data of an unfinished commit past {}", eu, offs);
                truncate_eu(&*self.dev, eu, offs, self.config.read_retries)?;
            }
        }
        Ok(())
    }

    fn apply_size_fix(&self, fix: SizeFix) -> Result<()> {
        let key = Key::inode(fix.inum);
        if let Some(Node::Inode(mut ino)) = self.read_node(&key)? {
            if ino.size < fix.size {
                debug!("inode {} size {} -> {}", fix.inum, ino.size, fix.size);
                ino.size = fix.size;
                self.write_inode(&ino)?;
            }
        }
        Ok(())
    }

    pub(crate) fn lock_all(&self) -> Locked<'_> {
        let journal = self.journal.lock();
        let tnc = self.tnc.lock();
        let ledger = self.ledger.lock();
        Locked {
            store: self,
            journal,
            tnc,
            ledger,
        }
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.failed.load(Ordering::Acquire) || self.ro_mount.load(Ordering::Acquire) {
            return Err(StorageError::ReadOnly);
        }
        Ok(())
    }

    /// Stop accepting mutations after a fatal error
    pub(crate) fn set_failed(&self, err: &StorageError) {
        if !self.failed.swap(true, Ordering::AcqRel) {
            error!("switching to read-only: {}", err);
        }
    }

    /// Pass `result` through, going read-only on a fatal error
    pub(crate) fn guard<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                self.set_failed(e);
            }
        }
        result
    }

    pub fn is_read_only(&self) -> bool {
        self.failed.load(Ordering::Acquire) || self.ro_mount.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Non-clean results of the recovery done at mount
    pub fn recovery_outcomes(&self) -> &[RecoveryOutcome] {
        &self.recovery
    }

    pub fn commit_number(&self) -> u64 {
        self.master.lock().master.cmt_no
    }

    // Index

    pub fn lookup(&self, key: &Key) -> Result<Option<Location>> {
        let result = self.tnc.lock().lookup(key);
        self.guard(result)
    }

    pub fn lookup_nm(&self, key: &Key, name: &[u8]) -> Result<Option<Location>> {
        let result = self.tnc.lock().lookup_nm(key, name);
        self.guard(result)
    }

    /// Read the node a unique key points to
    ///
    /// A read that fails because garbage collection moved the node in the
    /// meantime is retried with the new location.
    pub fn read_node(&self, key: &Key) -> Result<Option<Node>> {
        self.read_with(|tnc| tnc.lookup(key), key)
    }

    /// Read a directory or attribute entry by name
    pub fn read_entry(&self, key: &Key, name: &[u8]) -> Result<Option<Node>> {
        self.read_with(|tnc| tnc.lookup_nm(key, name), key)
    }

    fn read_with(&self, mut find: impl FnMut(&mut Tnc) -> Result<Option<Location>>, key: &Key) -> Result<Option<Node>> {
        loop {
            let seq = self.gc_seq.load(Ordering::Acquire);
            let found = find(&mut self.tnc.lock());
            let Some(loc) = self.guard(found)? else {
                return Ok(None);
            };
            match read_node(&*self.dev, loc, Some(key), self.config.read_retries) {
                Ok((_, node)) => return Ok(Some(node)),
                Err(e) if e.is_corruption() && self.gc_seq.load(Ordering::Acquire) != seq => {
                    debug!("node {} moved while reading {}, retrying", loc, key);
                }
                Err(e) => return self.guard(Err(e)),
            }
        }
    }

    /// Entry following `key`/`name` in index order
    pub fn next_entry(&self, key: &Key, name: Option<&[u8]>) -> Result<Option<(Key, Location, Arc<Node>)>> {
        let result = self.tnc.lock().next_entry(key, name);
        self.guard(result)
    }

    /// Point `key` at `loc`; the displaced location becomes dirt
    pub fn add(&self, key: &Key, loc: Location) -> Result<Option<Location>> {
        self.index_op(|l| {
            let old = l.tnc.add(key, loc)?;
            l.dirt(old)?;
            Ok(old)
        })
    }

    pub fn add_nm(&self, key: &Key, name: &[u8], loc: Location) -> Result<Option<Location>> {
        self.index_op(|l| {
            let old = l.tnc.add_nm(key, name, loc)?;
            l.dirt(old)?;
            Ok(old)
        })
    }

    /// Move `key` from `old` to `new`; false if it no longer points at `old`
    pub fn replace(&self, key: &Key, old: Location, new: Location) -> Result<bool> {
        self.index_op(|l| {
            let moved = l.tnc.replace(key, old, new)?;
            l.dirt(Some(if moved { old } else { new }))?;
            Ok(moved)
        })
    }

    pub fn remove(&self, key: &Key) -> Result<Option<Location>> {
        self.index_op(|l| {
            let old = l.tnc.remove(key)?;
            l.dirt(old)?;
            Ok(old)
        })
    }

    pub fn remove_nm(&self, key: &Key, name: &[u8]) -> Result<Option<Location>> {
        self.index_op(|l| {
            let old = l.tnc.remove_nm(key, name)?;
            l.dirt(old)?;
            Ok(old)
        })
    }

    /// Remove every key in `low..=high`; returns how many there were
    pub fn remove_range(&self, low: &Key, high: &Key) -> Result<usize> {
        self.index_op(|l| {
            let gone = l.tnc.remove_range(low, high)?;
            let count = gone.len();
            l.dirt(gone)?;
            Ok(count)
        })
    }

    fn index_op<T>(&self, op: impl FnOnce(&mut Locked<'_>) -> Result<T>) -> Result<T> {
        self.check_writable()?;
        let result = {
            let _sem = self.commit_sem.read();
            let mut l = self.lock_all();
            l.tnc
                .ensure_room(1, self.config.shrink_batch)
                .and_then(|_| op(&mut l))
        };
        self.guard(result)
    }

    // Space

    pub fn reserve_budget(&self, req: &BudgetRequest) -> Result<()> {
        self.check_writable()?;
        self.budget.reserve(req, self)
    }

    pub fn release_budget(&self, req: &BudgetRequest) {
        self.budget.release(req);
    }

    /// Free space as reported to callers
    pub fn get_free_space(&self) -> u64 {
        self.budget.free_space(&self.ledger_stats())
    }

    /// Space new data may still take after the index reserve
    pub fn available_space(&self) -> u64 {
        self.budget.available_space(&self.ledger_stats())
    }

    pub fn budget_snapshot(&self) -> BudgetSnapshot {
        self.budget.snapshot()
    }

    pub fn eu_props(&self, eu: u32) -> Result<EuProps> {
        self.ledger.lock().lookup(eu)
    }

    pub fn ledger_stats(&self) -> LedgerStats {
        self.ledger.lock().stats()
    }

    /// Verify the ledger's categories and totals
    pub fn check_ledger(&self) -> Result<()> {
        self.ledger.lock().check()
    }

    pub fn index_stats(&self) -> IndexStats {
        self.tnc.lock().stats()
    }

    /// Evict up to `nr` clean index nodes; returns how many went
    pub fn shrink(&self, nr: usize) -> usize {
        let freed = self.tnc.lock().shrink(nr);
        debug!("shrinker freed {} index nodes", freed);
        freed
    }

    pub(crate) fn note_written(&self, bytes: u64) {
        let total = self.bg_bytes.fetch_add(bytes, Ordering::AcqRel) + bytes;
        if total >= self.config.bg_commit_bytes {
            let mut wake = self.bg_wake.lock();
            *wake = true;
            self.bg_cv.notify_one();
        }
    }
}

/// Choose the unit garbage collection writes into next
fn pick_gc_eu(
    ledger: &mut Ledger,
    config: &Config,
    master: &MasterNode,
    buds: &BTreeMap<u32, u64>,
) -> Result<Option<u32>> {
    let usable = |ledger: &Ledger, eu: u32| -> Result<bool> {
        Ok(!buds.contains_key(&eu) && ledger.lookup(eu)?.free == config.eu_size)
    };
    let eu = if master.gc_eu != 0 && usable(ledger, master.gc_eu)? {
        Some(master.gc_eu)
    } else {
        ledger.find_empty(&|eu| buds.contains_key(&eu))
    };
    match eu {
        Some(eu) => ledger.set_flags(eu, EU_TAKEN)?,
        None => warn!("no empty unit left for garbage collection"),
    }
    Ok(eu)
}

impl Reclaim for Store {
    fn space(&self) -> LedgerStats {
        self.ledger_stats()
    }

    fn writeback(&self) -> Result<bool> {
        // Payload goes straight to the journal; nothing is cached
        Ok(false)
    }

    fn gc_one(&self) -> Result<bool> {
        match self.garbage_collect(false) {
            Ok(GcOutcome::Freed(_)) => Ok(true),
            Ok(GcOutcome::CommitNeeded) => {
                self.run_commit(true)?;
                Ok(true)
            }
            Err(StorageError::NoSpace) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn commit(&self) -> Result<()> {
        self.run_commit(true)
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if !self.is_read_only() {
            debug!("store dropped without unmount; the journal will be replayed");
        }
    }
}
