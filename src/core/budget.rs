//! Space budgeting
//!
//! Every mutation reserves its worst-case space before it touches the
//! journal, so a mutation that was admitted can always be written and
//! committed. Index growth is over-provisioned for consolidation. When the
//! projection does not fit, the reservation climbs a reclamation ladder:
//! write-back, then one unit of garbage collection, then a commit.

use crate::config::{Config, MIN_INDEX_EUS};
use crate::error::{Result, StorageError};
use crate::ledger::LedgerStats;
use crate::node::{IDX_BRANCH_SIZE, IDX_NODE_SIZE};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Journal heads, each keeping one unit busy
pub const JHEAD_CNT: u32 = 3;

/// Space one mutation may consume
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BudgetRequest {
    /// Index entries the mutation adds
    pub new_entries: u32,
    /// Bytes of new nodes
    pub new_data: u64,
    /// Bytes of nodes that are rewritten in place of older copies
    pub dirtied: u64,
    /// Fail instead of reclaiming
    pub fast: bool,
}

const fn align8(bytes: u64) -> u64 {
    bytes.saturating_add(7) & !7
}

impl BudgetRequest {
    pub fn new(new_entries: u32, new_data: u64, dirtied: u64) -> Self {
        BudgetRequest {
            new_entries,
            new_data: align8(new_data),
            dirtied: align8(dirtied),
            fast: false,
        }
    }

    pub fn fast(mut self) -> Self {
        self.fast = true;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.new_entries == 0 && self.new_data == 0 && self.dirtied == 0
    }
}

/// Reclamation avenues the budget falls back on
pub trait Reclaim {
    /// Current space totals of the main area
    fn space(&self) -> LedgerStats;

    /// Flush cached dirty payload; true if anything was written
    fn writeback(&self) -> Result<bool>;

    /// Garbage collect one unit; true if space was reclaimed
    fn gc_one(&self) -> Result<bool>;

    fn commit(&self) -> Result<()>;
}

/// Running totals at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BudgetSnapshot {
    pub idx_growth: u64,
    pub data_growth: u64,
    pub dd_growth: u64,
    pub uncommitted_idx: u64,
    pub old_idx_size: u64,
    pub min_idx_eus: u32,
    pub nospace: bool,
}

#[derive(Debug, Default)]
struct BudgetState {
    idx_growth: u64,
    data_growth: u64,
    dd_growth: u64,
    uncommitted_idx: u64,
    old_idx_size: u64,
    min_idx_eus: u32,
}

#[derive(Debug, Clone, Copy)]
struct BudgetParams {
    main_bytes: u64,
    eu_size: u64,
    dark_wm: u64,
    overprovision: u64,
    entry_growth: u64,
    retries: u32,
}

pub struct Budget {
    params: BudgetParams,
    state: Mutex<BudgetState>,
    nospace: AtomicBool,
}

impl Budget {
    /// Budget for a volume whose committed index takes `old_idx_size` bytes
    pub fn new(config: &Config, old_idx_size: u64) -> Self {
        let half = (config.fanout as u32 / 2).max(1);
        let params = BudgetParams {
            main_bytes: config.main_bytes(),
            eu_size: config.eu_size as u64,
            dark_wm: config.dark_wm() as u64,
            overprovision: config.idx_overprovision as u64,
            entry_growth: (IDX_BRANCH_SIZE + IDX_NODE_SIZE.div_ceil(half)) as u64,
            retries: config.budget_retries,
        };
        let mut state = BudgetState {
            old_idx_size,
            ..BudgetState::default()
        };
        state.min_idx_eus = min_idx_eus(&params, &state);
        Budget {
            params,
            state: Mutex::new(state),
            nospace: AtomicBool::new(false),
        }
    }

    /// Index growth a request implies
    pub fn idx_growth(&self, req: &BudgetRequest) -> u64 {
        req.new_entries as u64 * self.params.entry_growth
    }

    /// Reserve space for `req`, reclaiming through `reclaim` if needed
    pub fn reserve(&self, req: &BudgetRequest, reclaim: &dyn Reclaim) -> Result<()> {
        if req.is_empty() {
            return Ok(());
        }

        for attempt in 0..=self.params.retries {
            // Stats are sampled before the budget lock; the ledger lock
            // never nests inside it
            let stats = reclaim.space();
            if self.try_reserve(req, &stats) {
                return Ok(());
            }
            if req.fast || attempt == self.params.retries {
                break;
            }

            debug!("budget exhausted, reclaiming (attempt {})", attempt + 1);
            if reclaim.writeback()? {
                continue;
            }
            if reclaim.gc_one()? {
                continue;
            }
            reclaim.commit()?;
        }

        if !req.fast {
            self.nospace.store(true, Ordering::Release);
            warn!("no space left for {:?}", req);
        }
        Err(StorageError::NoSpace)
    }

    fn try_reserve(&self, req: &BudgetRequest, stats: &LedgerStats) -> bool {
        let mut state = self.state.lock();
        state.idx_growth += self.idx_growth(req);
        state.data_growth += req.new_data;
        state.dd_growth += req.dirtied;

        if self.fits(&mut state, stats) {
            return true;
        }

        state.idx_growth -= self.idx_growth(req);
        state.data_growth -= req.new_data;
        state.dd_growth -= req.dirtied;
        false
    }

    fn fits(&self, state: &mut BudgetState, stats: &LedgerStats) -> bool {
        let min_idx = min_idx_eus(&self.params, state);

        if min_idx > stats.idx_eus {
            if min_idx - stats.idx_eus > stats.spare_eus() {
                return false;
            }
        }

        let available = calc_available(&self.params, stats, min_idx);
        if available < state.data_growth + state.dd_growth {
            return false;
        }
        state.min_idx_eus = min_idx;
        true
    }

    /// Return a reservation once the mutation has been applied or abandoned
    pub fn release(&self, req: &BudgetRequest) {
        if req.is_empty() {
            return;
        }
        let growth = self.idx_growth(req);
        let mut state = self.state.lock();
        debug_assert!(state.idx_growth >= growth);
        debug_assert!(state.data_growth >= req.new_data);
        debug_assert!(state.dd_growth >= req.dirtied);
        state.idx_growth = state.idx_growth.saturating_sub(growth);
        state.data_growth = state.data_growth.saturating_sub(req.new_data);
        state.dd_growth = state.dd_growth.saturating_sub(req.dirtied);
        state.uncommitted_idx += growth;
        drop(state);
        self.nospace.store(false, Ordering::Release);
    }

    /// Uncommitted index growth to be consumed by the commit starting now
    pub fn uncommitted_idx(&self) -> u64 {
        self.state.lock().uncommitted_idx
    }

    /// Account a finished commit whose index takes `idx_size` bytes
    pub fn commit_done(&self, idx_size: u64, consumed: u64) {
        let mut state = self.state.lock();
        state.old_idx_size = idx_size;
        state.uncommitted_idx = state.uncommitted_idx.saturating_sub(consumed);
        state.min_idx_eus = min_idx_eus(&self.params, &state);
        self.nospace.store(false, Ordering::Release);
    }

    pub fn is_nospace(&self) -> bool {
        self.nospace.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        let state = self.state.lock();
        BudgetSnapshot {
            idx_growth: state.idx_growth,
            data_growth: state.data_growth,
            dd_growth: state.dd_growth,
            uncommitted_idx: state.uncommitted_idx,
            old_idx_size: state.old_idx_size,
            min_idx_eus: state.min_idx_eus,
            nospace: self.is_nospace(),
        }
    }

    /// Units the index may need beyond the ones it already has
    ///
    /// Journal heads leave this many spare units alone.
    pub fn idx_reserve(&self, stats: &LedgerStats) -> u32 {
        let min_idx = {
            let state = self.state.lock();
            min_idx_eus(&self.params, &state)
        };
        min_idx.saturating_sub(stats.idx_eus)
    }

    /// Bytes still available to new data after the index reserve
    pub fn available_space(&self, stats: &LedgerStats) -> u64 {
        let min_idx = {
            let state = self.state.lock();
            min_idx_eus(&self.params, &state)
        };
        calc_available(&self.params, stats, min_idx)
    }

    /// Free space as reported to callers
    ///
    /// Whole index units are counted as occupied; non-index units
    /// contribute their live, dead and dark bytes.
    pub fn free_space(&self, stats: &LedgerStats) -> u64 {
        let taken = stats.total_used
            + stats.total_dead
            + stats.total_dark
            + stats.idx_eus as u64 * self.params.eu_size;
        self.params.main_bytes.saturating_sub(taken)
    }
}

fn min_idx_eus(params: &BudgetParams, state: &BudgetState) -> u32 {
    let idx_size = (state.old_idx_size + state.idx_growth + state.uncommitted_idx) * params.overprovision;
    let eus = idx_size.div_ceil(params.eu_size) as u32 + 1;
    eus.max(MIN_INDEX_EUS)
}

fn calc_available(params: &BudgetParams, stats: &LedgerStats, min_idx: u32) -> u64 {
    let mut available = params.main_bytes as i64 - stats.total_used as i64;
    // Index reserve, the GC unit, one unit per journal head and one for
    // deletions, which are not budgeted
    let reserved = (min_idx + 1 + JHEAD_CNT + 1) as i64;
    available -= reserved * params.eu_size as i64;
    available -= stats.total_dead as i64;
    available -= stats.total_dark as i64;
    if stats.idx_eus > min_idx {
        available -= (stats.idx_eus - min_idx) as i64 * params.dark_wm as i64;
    }
    available.max(0) as u64
}
