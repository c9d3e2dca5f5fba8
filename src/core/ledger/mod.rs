//! Space ledger
//!
//! Tracks free space, dirty space and flags for every unit of the main area
//! and keeps each unit filed under the category its properties imply. The
//! per-unit properties are persisted as a small tree written at commit.
//!
//! Every property change goes through [`Ledger::change`], which updates the
//! running totals, refiles the unit and marks its tree leaf dirty.

mod categories;
mod find;
mod props;
mod tree;

pub use categories::{categorize, Categories, Category};
pub use props::{LedgerGeometry, LedgerStats, EU_INDEX, EU_TAKEN};
pub use tree::{level_counts, LedgerTree, LedgerWrite};

use crate::error::{Result, StorageError};
use crate::io::Device;
use crate::node::{EuProps, Location};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Ledger {
    geo: LedgerGeometry,
    props: Vec<EuProps>,
    cats: Categories,
    tree: LedgerTree,
    stats: LedgerStats,
}

impl Ledger {
    /// Ledger of a freshly formatted volume: every unit empty
    pub fn format(geo: LedgerGeometry) -> Self {
        let props = vec![
            EuProps {
                free: geo.eu_size,
                dirty: 0,
                flags: 0,
            };
            geo.main_eus as usize
        ];
        Self::from_parts(geo, props, LedgerTree::new(&geo))
    }

    pub fn from_parts(geo: LedgerGeometry, props: Vec<EuProps>, tree: LedgerTree) -> Self {
        let mut stats = LedgerStats::default();
        for p in &props {
            stats.account(p, &geo, true);
        }
        let cats = Categories::build(&props, &geo);
        Ledger {
            geo,
            props,
            cats,
            tree,
            stats,
        }
    }

    /// Read the committed ledger
    pub fn load(
        dev: &dyn Device,
        geo: LedgerGeometry,
        root: Location,
        live_eu: u32,
        offs: u32,
        retries: u32,
    ) -> Result<Self> {
        let (tree, props) = LedgerTree::load(dev, &geo, root, live_eu, offs, retries)?;
        Ok(Self::from_parts(geo, props, tree))
    }

    pub fn geometry(&self) -> &LedgerGeometry {
        &self.geo
    }

    fn index(&self, eu: u32) -> Result<usize> {
        if eu < self.geo.main_first || eu >= self.geo.main_first + self.geo.main_eus {
            return Err(StorageError::InvalidEu(eu));
        }
        Ok((eu - self.geo.main_first) as usize)
    }

    fn eu_of(&self, i: usize) -> u32 {
        self.geo.main_first + i as u32
    }

    pub fn lookup(&self, eu: u32) -> Result<EuProps> {
        Ok(self.props[self.index(eu)?])
    }

    /// Look up a unit whose properties are about to change; its tree leaf
    /// is marked dirty so the next commit rewrites it
    pub fn lookup_dirty(&mut self, eu: u32) -> Result<EuProps> {
        let i = self.index(eu)?;
        self.tree.mark_dirty(i);
        Ok(self.props[i])
    }

    /// Change any of a unit's properties and refile it
    pub fn change(
        &mut self,
        eu: u32,
        free: Option<u32>,
        dirty: Option<u32>,
        flags: Option<u8>,
    ) -> Result<EuProps> {
        let i = self.index(eu)?;
        let old = self.props[i];
        let new = EuProps {
            free: free.unwrap_or(old.free),
            dirty: dirty.unwrap_or(old.dirty),
            flags: flags.unwrap_or(old.flags),
        };

        if new.free % 8 != 0 || new.dirty % 8 != 0 {
            return Err(StorageError::Internal(format!(
                "unaligned properties {:?} for unit {}",
                new, eu
            )));
        }
        if new.free as u64 + new.dirty as u64 > self.geo.eu_size as u64 {
            return Err(StorageError::Internal(format!(
                "properties {:?} exceed the size of unit {}",
                new, eu
            )));
        }

        if new != old {
            self.stats.account(&old, &self.geo, false);
            self.props[i] = new;
            self.stats.account(&new, &self.geo, true);
            self.cats.update(i, &self.props, &self.geo);
            self.tree.mark_dirty(i);
        }
        Ok(new)
    }

    /// Record `bytes` more dirty space in a unit
    pub fn add_dirt(&mut self, eu: u32, bytes: u32) -> Result<()> {
        let p = self.lookup(eu)?;
        self.change(eu, None, Some(p.dirty + bytes), None)?;
        Ok(())
    }

    /// Record dirty space, clamping to what the unit can hold
    ///
    /// Used during replay where a reused unit may be charged for nodes of
    /// its previous life.
    pub fn add_dirt_saturating(&mut self, eu: u32, bytes: u32) -> Result<()> {
        let p = self.lookup(eu)?;
        let room = self.geo.eu_size - p.free;
        let dirty = (p.dirty + bytes).min(room);
        if dirty < p.dirty + bytes {
            warn!(
                "dirt of unit {} clamped from {} to {}",
                eu,
                p.dirty + bytes,
                dirty
            );
        }
        self.change(eu, None, Some(dirty), None)?;
        Ok(())
    }

    pub fn set_flags(&mut self, eu: u32, mask: u8) -> Result<()> {
        let p = self.lookup(eu)?;
        self.change(eu, None, None, Some(p.flags | mask))?;
        Ok(())
    }

    pub fn clear_flags(&mut self, eu: u32, mask: u8) -> Result<()> {
        let p = self.lookup(eu)?;
        self.change(eu, None, None, Some(p.flags & !mask))?;
        Ok(())
    }

    /// Return a unit to the empty pool
    pub fn make_empty(&mut self, eu: u32) -> Result<()> {
        self.change(eu, Some(self.geo.eu_size), Some(0), Some(0))?;
        Ok(())
    }

    /// Drop the taken flag from every unit
    pub fn clear_all_taken(&mut self) -> Result<()> {
        for i in 0..self.props.len() {
            if self.props[i].flags & EU_TAKEN != 0 {
                let eu = self.eu_of(i);
                self.clear_flags(eu, EU_TAKEN)?;
            }
        }
        Ok(())
    }

    pub fn category(&self, eu: u32) -> Result<Category> {
        Ok(self.cats.category(self.index(eu)?))
    }

    /// Units whose index nodes are all obsolete
    pub fn frdi_idx_eus(&self) -> Vec<u32> {
        self.cats
            .list(Category::FrdiIdx)
            .iter()
            .map(|&i| self.eu_of(i))
            .collect()
    }

    pub fn stats(&self) -> LedgerStats {
        LedgerStats {
            freeable_cnt: self.cats.count(Category::Freeable) as u32,
            frdi_idx_cnt: self.cats.count(Category::FrdiIdx) as u32,
            ..self.stats
        }
    }

    /// Verify that every unit sits where its properties say
    pub fn check(&self) -> Result<()> {
        self.cats
            .check(&self.props, &self.geo)
            .map_err(StorageError::Internal)?;

        let mut stats = LedgerStats::default();
        for p in &self.props {
            stats.account(p, &self.geo, true);
        }
        if stats != self.stats {
            return Err(StorageError::Internal(format!(
                "ledger totals drifted: kept {:?}, recomputed {:?}",
                self.stats, stats
            )));
        }
        Ok(())
    }

    pub fn root(&self) -> Option<Location> {
        self.tree.root()
    }

    pub fn live_eu(&self) -> u32 {
        self.tree.live_eu()
    }

    pub fn offs(&self) -> u32 {
        self.tree.offs()
    }

    pub fn dirty_nodes(&self) -> usize {
        self.tree.dirty_count()
    }

    /// Serialize the dirty part of the ledger tree for the commit
    pub fn prepare_commit(&mut self, sqnum: &mut dyn FnMut() -> u64) -> Result<Option<LedgerWrite>> {
        self.tree.prepare_commit(&self.props, &self.geo, sqnum)
    }
}
