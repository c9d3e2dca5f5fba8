//! Categorization heaps and lists
//!
//! Every main-area unit sits in exactly one structure. Three bounded
//! max-heaps keep the most interesting candidates for allocation and
//! reclamation; four lists hold everything else. Membership is a cache of
//! [`categorize`] and is only ever changed through [`Categories::update`].

use super::props::{LedgerGeometry, EU_INDEX, EU_TAKEN};
use crate::node::EuProps;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Uncat,
    Dirty,
    DirtyIdx,
    Free,
    Empty,
    Freeable,
    FrdiIdx,
}

impl Category {
    fn heap(self) -> Option<usize> {
        match self {
            Category::Dirty => Some(0),
            Category::DirtyIdx => Some(1),
            Category::Free => Some(2),
            _ => None,
        }
    }

    fn list(self) -> usize {
        match self {
            Category::Empty => 0,
            Category::Freeable => 1,
            Category::FrdiIdx => 2,
            _ => 3,
        }
    }

    pub fn is_heap(self) -> bool {
        self.heap().is_some()
    }
}

const HEAP_CATS: [Category; 3] = [Category::Dirty, Category::DirtyIdx, Category::Free];

/// Category a unit belongs in given its properties
pub fn categorize(props: &EuProps, geo: &LedgerGeometry) -> Category {
    if props.flags & EU_TAKEN != 0 {
        return Category::Uncat;
    }
    if props.free == geo.eu_size {
        return Category::Empty;
    }
    let index = props.flags & EU_INDEX != 0;
    if props.free + props.dirty == geo.eu_size {
        return if index {
            Category::FrdiIdx
        } else {
            Category::Freeable
        };
    }
    if index {
        if props.free + props.dirty >= geo.min_idx_node {
            return Category::DirtyIdx;
        }
    } else {
        if props.dirty >= geo.dead_wm && props.dirty > props.free {
            return Category::Dirty;
        }
        if props.free > 0 {
            return Category::Free;
        }
    }
    Category::Uncat
}

/// Ordering value within a heap
fn heap_value(cat: Category, props: &EuProps) -> u32 {
    match cat {
        Category::Dirty => props.dirty,
        Category::DirtyIdx => props.free + props.dirty,
        _ => props.free,
    }
}

/// Heap and list membership, by main-area index
#[derive(Debug, Clone)]
pub struct Categories {
    heaps: [Vec<usize>; 3],
    lists: [Vec<usize>; 4],
    cat: Vec<Category>,
    pos: Vec<usize>,
    capacity: usize,
}

impl Categories {
    /// Categorize every unit from scratch
    pub fn build(props: &[EuProps], geo: &LedgerGeometry) -> Self {
        let mut cats = Categories {
            heaps: Default::default(),
            lists: Default::default(),
            cat: vec![Category::Uncat; props.len()],
            pos: vec![0; props.len()],
            capacity: geo.heap_capacity,
        };
        for i in 0..props.len() {
            let cat = categorize(&props[i], geo);
            cats.insert(i, cat, props);
        }
        cats
    }

    /// Structure `i` currently sits in
    pub fn category(&self, i: usize) -> Category {
        self.cat[i]
    }

    pub fn heap(&self, cat: Category) -> &[usize] {
        match cat.heap() {
            Some(h) => &self.heaps[h],
            None => &[],
        }
    }

    pub fn list(&self, cat: Category) -> &[usize] {
        if cat.is_heap() {
            return &[];
        }
        &self.lists[cat.list()]
    }

    pub fn count(&self, cat: Category) -> usize {
        match cat.heap() {
            Some(h) => self.heaps[h].len(),
            None => self.lists[cat.list()].len(),
        }
    }

    /// Move `i` to where its new properties say it belongs.
    /// `props` must already hold the new values.
    pub fn update(&mut self, i: usize, props: &[EuProps], geo: &LedgerGeometry) {
        let new = categorize(&props[i], geo);
        let old = self.cat[i];
        if new == old {
            if let Some(h) = new.heap() {
                let pos = self.pos[i];
                let pos = self.sift_up(h, pos, props);
                self.sift_down(h, pos, props);
            }
            return;
        }
        self.remove(i, props);
        self.insert(i, new, props);
    }

    /// Give an overflowed unit another chance at its heap
    pub fn promote(&mut self, i: usize, props: &[EuProps], geo: &LedgerGeometry) -> bool {
        if self.cat[i] != Category::Uncat {
            return false;
        }
        let cat = categorize(&props[i], geo);
        match cat.heap() {
            Some(h) if self.heaps[h].len() < self.capacity => {
                self.remove(i, props);
                self.insert(i, cat, props);
                true
            }
            _ => false,
        }
    }

    fn insert(&mut self, i: usize, cat: Category, props: &[EuProps]) {
        match cat.heap() {
            Some(h) => self.heap_add(h, i, props),
            None => self.list_add(cat.list(), i, cat),
        }
    }

    fn remove(&mut self, i: usize, props: &[EuProps]) {
        let cat = self.cat[i];
        let pos = self.pos[i];
        match cat.heap() {
            Some(h) => {
                let last = self.heaps[h].len() - 1;
                self.heaps[h].swap(pos, last);
                self.heaps[h].pop();
                if pos < self.heaps[h].len() {
                    let moved = self.heaps[h][pos];
                    self.pos[moved] = pos;
                    let pos = self.sift_up(h, pos, props);
                    self.sift_down(h, pos, props);
                }
            }
            None => {
                let list = &mut self.lists[cat.list()];
                list.swap_remove(pos);
                if pos < list.len() {
                    let moved = list[pos];
                    self.pos[moved] = pos;
                }
            }
        }
    }

    fn list_add(&mut self, list: usize, i: usize, cat: Category) {
        self.cat[i] = cat;
        self.pos[i] = self.lists[list].len();
        self.lists[list].push(i);
    }

    fn heap_add(&mut self, h: usize, i: usize, props: &[EuProps]) {
        let cat = HEAP_CATS[h];
        if self.heaps[h].len() < self.capacity {
            let pos = self.heaps[h].len();
            self.heaps[h].push(i);
            self.cat[i] = cat;
            self.pos[i] = pos;
            self.sift_up(h, pos, props);
            return;
        }

        // Full: displace the weakest leaf if the newcomer beats it
        let len = self.heaps[h].len();
        let weakest = (len / 2..len).min_by_key(|&p| heap_value(cat, &props[self.heaps[h][p]]));
        match weakest {
            Some(p) if heap_value(cat, &props[i]) > heap_value(cat, &props[self.heaps[h][p]]) => {
                let evicted = self.heaps[h][p];
                self.list_add(Category::Uncat.list(), evicted, Category::Uncat);
                self.heaps[h][p] = i;
                self.cat[i] = cat;
                self.pos[i] = p;
                self.sift_up(h, p, props);
            }
            _ => self.list_add(Category::Uncat.list(), i, Category::Uncat),
        }
    }

    fn value_at(&self, h: usize, pos: usize, props: &[EuProps]) -> u32 {
        heap_value(HEAP_CATS[h], &props[self.heaps[h][pos]])
    }

    fn swap(&mut self, h: usize, a: usize, b: usize) {
        self.heaps[h].swap(a, b);
        let (ia, ib) = (self.heaps[h][a], self.heaps[h][b]);
        self.pos[ia] = a;
        self.pos[ib] = b;
    }

    fn sift_up(&mut self, h: usize, mut pos: usize, props: &[EuProps]) -> usize {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.value_at(h, parent, props) >= self.value_at(h, pos, props) {
                break;
            }
            self.swap(h, parent, pos);
            pos = parent;
        }
        pos
    }

    fn sift_down(&mut self, h: usize, mut pos: usize, props: &[EuProps]) {
        let len = self.heaps[h].len();
        loop {
            let left = 2 * pos + 1;
            let right = left + 1;
            let mut best = pos;
            if left < len && self.value_at(h, left, props) > self.value_at(h, best, props) {
                best = left;
            }
            if right < len && self.value_at(h, right, props) > self.value_at(h, best, props) {
                best = right;
            }
            if best == pos {
                return;
            }
            self.swap(h, pos, best);
            pos = best;
        }
    }

    /// Verify membership and heap order; returns a description of the
    /// first violation
    pub fn check(&self, props: &[EuProps], geo: &LedgerGeometry) -> Result<(), String> {
        for i in 0..props.len() {
            let want = categorize(&props[i], geo);
            let have = self.cat[i];
            if want != have && !(have == Category::Uncat && want.is_heap()) {
                return Err(format!(
                    "unit index {} is {:?} but sits in {:?}",
                    i, want, have
                ));
            }
            let pos = self.pos[i];
            let at = match have.heap() {
                Some(h) => self.heaps[h].get(pos),
                None => self.lists[have.list()].get(pos),
            };
            if at != Some(&i) {
                return Err(format!("unit index {} has a stale position {}", i, pos));
            }
        }

        for h in 0..3 {
            if self.heaps[h].len() > self.capacity {
                return Err(format!("heap {:?} over capacity", HEAP_CATS[h]));
            }
            for pos in 1..self.heaps[h].len() {
                let parent = (pos - 1) / 2;
                if self.value_at(h, parent, props) < self.value_at(h, pos, props) {
                    return Err(format!("heap {:?} out of order at {}", HEAP_CATS[h], pos));
                }
            }
        }

        let total: usize = self.heaps.iter().map(Vec::len).sum::<usize>()
            + self.lists.iter().map(Vec::len).sum::<usize>();
        if total != props.len() {
            return Err(format!("{} memberships for {} units", total, props.len()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn geo(capacity: usize) -> LedgerGeometry {
        let mut g = LedgerGeometry::from_config(&Config::small(4096, 16));
        g.heap_capacity = capacity;
        g
    }

    fn props(free: u32, dirty: u32, flags: u8) -> EuProps {
        EuProps { free, dirty, flags }
    }

    #[test]
    fn test_categorize_rules() {
        let g = geo(8);
        assert_eq!(categorize(&props(4096, 0, 0), &g), Category::Empty);
        assert_eq!(categorize(&props(4096, 0, EU_TAKEN), &g), Category::Uncat);
        assert_eq!(categorize(&props(96, 4000, 0), &g), Category::Freeable);
        assert_eq!(categorize(&props(96, 4000, EU_INDEX), &g), Category::FrdiIdx);
        assert_eq!(categorize(&props(0, 2048, 0), &g), Category::Dirty);
        assert_eq!(categorize(&props(2048, 1024, 0), &g), Category::Free);
        assert_eq!(categorize(&props(0, 8, 0), &g), Category::Uncat);
        assert_eq!(categorize(&props(0, 512, EU_INDEX), &g), Category::DirtyIdx);
        assert_eq!(categorize(&props(0, 8, EU_INDEX), &g), Category::Uncat);
    }

    #[test]
    fn test_update_moves_between_structures() {
        let g = geo(8);
        let mut p = vec![props(4096, 0, 0); 4];
        let mut cats = Categories::build(&p, &g);
        assert_eq!(cats.count(Category::Empty), 4);

        p[1] = props(3000, 0, 0);
        cats.update(1, &p, &g);
        assert_eq!(cats.category(1), Category::Free);
        assert_eq!(cats.heap(Category::Free), &[1]);

        p[1] = props(0, 3000, 0);
        cats.update(1, &p, &g);
        assert_eq!(cats.category(1), Category::Dirty);
        assert!(cats.heap(Category::Free).is_empty());
        cats.check(&p, &g).unwrap();
    }

    #[test]
    fn test_full_heap_displaces_weakest_to_uncat() {
        let g = geo(2);
        let mut p = vec![props(4096, 0, 0); 3];
        let mut cats = Categories::build(&p, &g);

        p[0] = props(0, 1000, 0);
        cats.update(0, &p, &g);
        p[1] = props(0, 2000, 0);
        cats.update(1, &p, &g);
        p[2] = props(0, 3000, 0);
        cats.update(2, &p, &g);

        assert_eq!(cats.count(Category::Dirty), 2);
        assert_eq!(cats.category(0), Category::Uncat);
        assert_eq!(cats.heap(Category::Dirty)[0], 2);
        cats.check(&p, &g).unwrap();

        // A weaker newcomer goes straight to uncat
        let mut p2 = p.clone();
        p2.push(props(4096, 0, 0));
        let mut cats = Categories::build(&p2, &g);
        p2[3] = props(0, 500, 0);
        cats.update(3, &p2, &g);
        assert_eq!(cats.category(3), Category::Uncat);
        cats.check(&p2, &g).unwrap();
    }

    #[test]
    fn test_promote_after_room_frees_up() {
        let g = geo(1);
        let mut p = vec![props(0, 1000, 0), props(0, 2000, 0)];
        let mut cats = Categories::build(&p, &g);
        assert_eq!(cats.category(0), Category::Uncat);

        p[1] = props(4096, 0, 0);
        cats.update(1, &p, &g);
        assert!(cats.promote(0, &p, &g));
        assert_eq!(cats.category(0), Category::Dirty);
        cats.check(&p, &g).unwrap();
    }
}
