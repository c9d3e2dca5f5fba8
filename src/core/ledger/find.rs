//! Allocation and reclamation searches
//!
//! Each search first looks at the heaps and lists and only falls back to a
//! scan of all unit properties when they have nothing suitable. The scan
//! refiles overflowed units it comes across.

use super::categories::Category;
use super::props::{EU_INDEX, EU_TAKEN};
use super::Ledger;
use tracing::trace;

impl Ledger {
    /// Find a unit with at least `min_space` free bytes for a journal head
    ///
    /// Partially written units are preferred over empty ones. `exclude`
    /// vetoes units the caller cannot use.
    pub fn find_free(&mut self, min_space: u32, pick_empty: bool, exclude: &dyn Fn(u32) -> bool) -> Option<u32> {
        let usable = |l: &Ledger, i: usize| {
            let p = &l.props[i];
            p.flags & (EU_TAKEN | EU_INDEX) == 0
                && p.free >= min_space
                && p.free < l.geo.eu_size
                && !exclude(l.eu_of(i))
        };

        let best = self
            .cats
            .heap(Category::Free)
            .iter()
            .copied()
            .filter(|&i| usable(self, i))
            .max_by_key(|&i| self.props[i].free);
        if let Some(i) = best {
            return Some(self.eu_of(i));
        }

        if pick_empty {
            if let Some(eu) = self.find_empty(exclude) {
                return Some(eu);
            }
        }

        // Slow path
        trace!("free heap exhausted, scanning {} units", self.props.len());
        let mut best: Option<usize> = None;
        for i in 0..self.props.len() {
            if self.cats.category(i) == Category::Uncat {
                self.cats.promote(i, &self.props, &self.geo);
            }
            if usable(self, i) && best.map_or(true, |b| self.props[i].free > self.props[b].free) {
                best = Some(i);
            }
        }
        best.map(|i| self.eu_of(i))
    }

    /// Find an empty, untaken unit
    pub fn find_empty(&self, exclude: &dyn Fn(u32) -> bool) -> Option<u32> {
        self.cats
            .list(Category::Empty)
            .iter()
            .map(|&i| self.eu_of(i))
            .find(|&eu| !exclude(eu))
    }

    /// Find a non-index unit whose space is all free or dirty
    pub fn find_freeable(&self, exclude: &dyn Fn(u32) -> bool) -> Option<u32> {
        self.cats
            .list(Category::Freeable)
            .iter()
            .map(|&i| self.eu_of(i))
            .find(|&eu| !exclude(eu))
    }

    /// Find the unit that garbage collection should process next
    ///
    /// Freeable units come first when `pick_free` is set. Otherwise the unit
    /// with the most reclaimable space of at least `min_space` bytes wins,
    /// index units included.
    pub fn find_dirty(&mut self, min_space: u32, pick_free: bool, exclude: &dyn Fn(u32) -> bool) -> Option<u32> {
        if pick_free {
            if let Some(eu) = self.find_freeable(exclude) {
                return Some(eu);
            }
        }

        let reclaimable = |l: &Ledger, i: usize| {
            let p = &l.props[i];
            p.flags & EU_TAKEN == 0
                && p.free < l.geo.eu_size
                && p.free + p.dirty >= min_space
                && p.dirty >= l.geo.dead_wm
                && (pick_free || p.free + p.dirty < l.geo.eu_size)
                && !exclude(l.eu_of(i))
        };

        let best = self
            .cats
            .heap(Category::Dirty)
            .iter()
            .chain(self.cats.heap(Category::DirtyIdx).iter())
            .copied()
            .filter(|&i| reclaimable(self, i))
            .max_by_key(|&i| self.props[i].free + self.props[i].dirty);
        if let Some(i) = best {
            return Some(self.eu_of(i));
        }

        trace!("dirty heaps exhausted, scanning {} units", self.props.len());
        let mut best: Option<usize> = None;
        for i in 0..self.props.len() {
            if self.cats.category(i) == Category::Uncat {
                self.cats.promote(i, &self.props, &self.geo);
            }
            if self.cats.category(i) == Category::FrdiIdx {
                continue;
            }
            let spc = |j: usize| self.props[j].free + self.props[j].dirty;
            if reclaimable(self, i) && best.map_or(true, |b| spc(i) > spc(b)) {
                best = Some(i);
            }
        }
        best.map(|i| self.eu_of(i))
    }

    /// Find the index unit with the most obsolete space
    pub fn find_dirty_index_eu(&mut self, exclude: &dyn Fn(u32) -> bool) -> Option<u32> {
        let candidate = |l: &Ledger, i: usize| {
            let p = &l.props[i];
            p.flags & EU_INDEX != 0
                && p.flags & EU_TAKEN == 0
                && p.free + p.dirty < l.geo.eu_size
                && p.dirty > 0
                && !exclude(l.eu_of(i))
        };
        let spc = |l: &Ledger, i: usize| l.props[i].free + l.props[i].dirty;

        let best = self
            .cats
            .heap(Category::DirtyIdx)
            .iter()
            .copied()
            .filter(|&i| candidate(self, i))
            .max_by_key(|&i| spc(self, i));
        if let Some(i) = best {
            return Some(self.eu_of(i));
        }

        let mut best: Option<usize> = None;
        for i in 0..self.props.len() {
            if self.cats.category(i) == Category::Uncat {
                self.cats.promote(i, &self.props, &self.geo);
            }
            if candidate(self, i) && best.map_or(true, |b| spc(self, i) > spc(self, b)) {
                best = Some(i);
            }
        }
        best.map(|i| self.eu_of(i))
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Ledger, LedgerGeometry, EU_INDEX, EU_TAKEN};
    use crate::config::Config;

    fn ledger(capacity: usize) -> Ledger {
        let mut geo = LedgerGeometry::from_config(&Config::small(4096, 16));
        geo.heap_capacity = capacity;
        Ledger::format(geo)
    }

    fn none(_: u32) -> bool {
        false
    }

    #[test]
    fn test_find_free_prefers_partial_units() {
        let mut l = ledger(8);
        let base = l.geometry().main_first;
        l.change(base + 4, Some(2048), Some(0), None).unwrap();
        l.change(base + 5, Some(1024), Some(0), None).unwrap();

        assert_eq!(l.find_free(512, true, &none), Some(base + 4));
        assert_eq!(l.find_free(512, true, &|eu| eu == base + 4), Some(base + 5));
        assert_eq!(l.find_free(3000, false, &none), None);
        let empty = l.find_free(3000, true, &none).unwrap();
        assert_eq!(l.lookup(empty).unwrap().free, 4096);
    }

    #[test]
    fn test_find_free_slow_path_sees_overflowed_units() {
        let mut l = ledger(1);
        let base = l.geometry().main_first;
        l.change(base, Some(512), Some(0), None).unwrap();
        l.change(base + 1, Some(2048), Some(0), None).unwrap();
        l.change(base + 1, None, None, Some(EU_TAKEN)).unwrap();

        // base + 0 overflowed to uncat while base + 1 held the only slot
        assert_eq!(l.find_free(256, false, &none), Some(base));
        l.check().unwrap();
    }

    #[test]
    fn test_find_dirty_orders_by_reclaimable_space() {
        let mut l = ledger(8);
        let base = l.geometry().main_first;
        l.change(base, Some(0), Some(1024), None).unwrap();
        l.change(base + 1, Some(0), Some(3072), None).unwrap();
        l.change(base + 2, Some(0), Some(4096), None).unwrap();

        assert_eq!(l.find_dirty(512, true, &none), Some(base + 2));
        assert_eq!(l.find_dirty(512, false, &none), Some(base + 1));
        assert_eq!(l.find_dirty(512, false, &|eu| eu == base + 1), Some(base));
        assert_eq!(l.find_dirty(2048, false, &|eu| eu == base + 1), None);
    }

    #[test]
    fn test_find_dirty_index_eu() {
        let mut l = ledger(8);
        let base = l.geometry().main_first;
        assert_eq!(l.find_dirty_index_eu(&none), None);
        l.change(base + 7, Some(1024), Some(1024), Some(EU_INDEX)).unwrap();
        l.change(base + 8, Some(0), Some(256), Some(EU_INDEX)).unwrap();
        assert_eq!(l.find_dirty_index_eu(&none), Some(base + 7));
        assert_eq!(l.find_dirty(512, false, &none), Some(base + 7));
    }
}
