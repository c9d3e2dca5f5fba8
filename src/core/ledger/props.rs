use crate::config::Config;
use crate::node::{align_up, EuProps, IDX_BRANCH_SIZE, IDX_NODE_SIZE, MIN_WRITE_SIZE};

/// Unit is held by a journal head or reserved for GC
pub const EU_TAKEN: u8 = 0x1;

/// Unit holds index nodes
pub const EU_INDEX: u8 = 0x2;

/// Geometry and thresholds the ledger needs from the configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerGeometry {
    pub eu_size: u32,
    pub main_first: u32,
    pub main_eus: u32,
    pub dead_wm: u32,
    pub dark_wm: u32,
    /// Smallest possible index node; less reclaimable space in an index
    /// unit is not worth consolidating
    pub min_idx_node: u32,
    pub heap_capacity: usize,
    pub min_io: u32,
    pub ledger_first: u32,
    pub ledger_eus: u32,
}

impl LedgerGeometry {
    pub fn from_config(config: &Config) -> Self {
        LedgerGeometry {
            eu_size: config.eu_size,
            main_first: config.main_first(),
            main_eus: config.main_eus,
            dead_wm: config.dead_wm(),
            dark_wm: config.dark_wm(),
            min_idx_node: align_up(IDX_NODE_SIZE + IDX_BRANCH_SIZE, 8),
            heap_capacity: config.heap_capacity,
            min_io: config.min_io_size,
            ledger_first: config.ledger_first(),
            ledger_eus: config.ledger_eus,
        }
    }

    /// Space in a unit that may stay unusable
    ///
    /// Small nodes can always be squeezed in, so a unit with a little more
    /// than the dark watermark is assumed to take at least one of them.
    pub fn calc_dark(&self, spc: u32) -> u32 {
        if spc < self.dark_wm {
            return spc;
        }
        if spc - self.dark_wm < MIN_WRITE_SIZE {
            return spc.saturating_sub(MIN_WRITE_SIZE);
        }
        self.dark_wm
    }
}

/// Space totals over the main area
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerStats {
    pub empty_eus: u32,
    pub taken_empty_eus: u32,
    pub idx_eus: u32,
    pub freeable_cnt: u32,
    pub frdi_idx_cnt: u32,
    pub total_free: u64,
    pub total_dirty: u64,
    /// Live bytes in non-index units
    pub total_used: u64,
    pub total_dead: u64,
    pub total_dark: u64,
}

impl LedgerStats {
    /// Add or remove the contribution of one unit
    pub(crate) fn account(&mut self, props: &EuProps, geo: &LedgerGeometry, add: bool) {
        let empty = props.free == geo.eu_size;
        let taken_empty = empty && props.flags & EU_TAKEN != 0;
        let index = props.flags & EU_INDEX != 0;

        let mut used = 0u64;
        let mut dead = 0u64;
        let mut dark = 0u64;
        if !index {
            let spc = props.free + props.dirty;
            used = (geo.eu_size - spc) as u64;
            if spc < geo.dead_wm {
                dead = spc as u64;
            } else {
                dark = geo.calc_dark(spc) as u64;
            }
        }

        if add {
            self.empty_eus += empty as u32;
            self.taken_empty_eus += taken_empty as u32;
            self.idx_eus += index as u32;
            self.total_free += props.free as u64;
            self.total_dirty += props.dirty as u64;
            self.total_used += used;
            self.total_dead += dead;
            self.total_dark += dark;
        } else {
            self.empty_eus -= empty as u32;
            self.taken_empty_eus -= taken_empty as u32;
            self.idx_eus -= index as u32;
            self.total_free -= props.free as u64;
            self.total_dirty -= props.dirty as u64;
            self.total_used -= used;
            self.total_dead -= dead;
            self.total_dark -= dark;
        }
    }

    /// Units a commit could turn into index units
    pub fn spare_eus(&self) -> u32 {
        (self.empty_eus + self.freeable_cnt + self.frdi_idx_cnt).saturating_sub(self.taken_empty_eus)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geo() -> LedgerGeometry {
        LedgerGeometry::from_config(&Config::small(4096, 16))
    }

    #[test]
    fn test_calc_dark_bands() {
        let g = geo();
        assert_eq!(g.calc_dark(100), 100);
        assert_eq!(g.calc_dark(g.dark_wm + 8), g.dark_wm + 8 - MIN_WRITE_SIZE);
        assert_eq!(g.calc_dark(g.eu_size), g.dark_wm);
    }

    #[test]
    fn test_account_is_reversible() {
        let g = geo();
        let mut stats = LedgerStats::default();
        let props = [
            EuProps { free: 4096, dirty: 0, flags: EU_TAKEN },
            EuProps { free: 1024, dirty: 512, flags: 0 },
            EuProps { free: 0, dirty: 16, flags: 0 },
            EuProps { free: 2048, dirty: 1024, flags: EU_INDEX },
        ];
        for p in &props {
            stats.account(p, &g, true);
        }
        assert_eq!(stats.empty_eus, 1);
        assert_eq!(stats.taken_empty_eus, 1);
        assert_eq!(stats.idx_eus, 1);
        assert_eq!(stats.total_used, 2560 + 4080);
        assert_eq!(stats.total_dead, 16);

        for p in &props {
            stats.account(p, &g, false);
        }
        assert_eq!(stats, LedgerStats::default());
    }
}
