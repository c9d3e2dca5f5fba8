//! Memory pressure: evicting clean znodes

use super::Tnc;
use ahash::AHashSet;
use tracing::debug;

impl Tnc {
    /// Evict up to `nr` clean znodes, least recently used first
    ///
    /// Only znodes with no resident children go, so a single call trims
    /// the tree from the bottom. The root, dirty znodes and znodes written
    /// by a commit that has not finished are kept. Cached entry leaves are
    /// dropped as well. Returns the number of znodes evicted.
    pub fn shrink(&mut self, nr: usize) -> usize {
        let victims: AHashSet<_> = self
            .lru
            .iter()
            .rev()
            .map(|(id, _)| *id)
            .filter(|id| Some(*id) != self.root)
            .filter(|id| {
                self.arena.get(*id).map_or(false, |z| {
                    !z.dirty
                        && !z.has_resident_children()
                        && (self.inflight.is_none() || z.written_in != self.inflight)
                })
            })
            .take(nr)
            .collect();

        let ids: Vec<_> = self.arena.ids().collect();
        let mut leaves = 0;
        for id in ids {
            let Some(z) = self.arena.get_mut(id) else {
                continue;
            };
            for br in &mut z.branches {
                if br.child.map_or(false, |c| victims.contains(&c)) {
                    br.child = None;
                }
                if br.leaf.take().is_some() {
                    leaves += 1;
                }
            }
        }
        for id in &victims {
            self.arena.remove(*id);
            self.lru.pop(id);
        }
        if !victims.is_empty() || leaves > 0 {
            debug!("shrinker evicted {} znodes and {} cached leaves", victims.len(), leaves);
        }
        victims.len()
    }
}
