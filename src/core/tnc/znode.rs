//! Resident index nodes and the arena that owns them

use crate::key::Key;
use crate::node::{align_up, IdxBranch, IdxNode, Location, Node, IDX_BRANCH_SIZE, IDX_NODE_SIZE};
use std::sync::Arc;

/// Handle to an arena slot; stale once the slot is freed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ZnodeId {
    slot: u32,
    gen: u32,
}

#[derive(Debug, Clone)]
pub struct Zbranch {
    pub key: Key,
    /// Media location of the child index node, or of the leaf at level 0.
    /// `None` for a child that has not been written yet.
    pub loc: Option<Location>,
    pub child: Option<ZnodeId>,
    /// Decoded leaf, kept for entries compared by name
    pub leaf: Option<Arc<Node>>,
}

impl Zbranch {
    pub fn leaf(key: Key, loc: Location) -> Self {
        Zbranch {
            key,
            loc: Some(loc),
            child: None,
            leaf: None,
        }
    }

    pub fn internal(key: Key, child: ZnodeId) -> Self {
        Zbranch {
            key,
            loc: None,
            child: Some(child),
            leaf: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Znode {
    pub level: u16,
    pub branches: Vec<Zbranch>,
    /// Where this node was last written; cleared when it is dirtied
    pub loc: Option<Location>,
    pub dirty: bool,
    /// Commit generation that wrote it
    pub written_in: Option<u64>,
}

impl Znode {
    pub fn new_dirty(level: u16, branches: Vec<Zbranch>) -> Self {
        Znode {
            level,
            branches,
            loc: None,
            dirty: true,
            written_in: None,
        }
    }

    pub fn from_media(idx: IdxNode, loc: Location) -> Self {
        Znode {
            level: idx.level,
            branches: idx
                .branches
                .into_iter()
                .map(|b| Zbranch {
                    key: b.key,
                    loc: Some(b.loc),
                    child: None,
                    leaf: None,
                })
                .collect(),
            loc: Some(loc),
            dirty: false,
            written_in: None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }

    /// Index of the last branch whose key is `<= key`, or -1
    pub fn search(&self, key: &Key) -> isize {
        self.branches.partition_point(|b| b.key <= *key) as isize - 1
    }

    /// Index of the last branch whose key is `< key`, or -1
    pub fn search_below(&self, key: &Key) -> isize {
        self.branches.partition_point(|b| b.key < *key) as isize - 1
    }

    pub fn has_resident_children(&self) -> bool {
        self.branches.iter().any(|b| b.child.is_some())
    }

    pub fn encoded_len(&self) -> u32 {
        IDX_NODE_SIZE + self.branches.len() as u32 * IDX_BRANCH_SIZE
    }

    pub fn aligned_len(&self) -> u32 {
        align_up(self.encoded_len(), 8)
    }

    /// Media form; every branch must have a location
    pub fn to_idx(&self) -> Option<IdxNode> {
        let branches = self
            .branches
            .iter()
            .map(|b| b.loc.map(|loc| IdxBranch { key: b.key, loc }))
            .collect::<Option<Vec<_>>>()?;
        Some(IdxNode {
            level: self.level,
            branches,
        })
    }
}

struct Slot {
    gen: u32,
    node: Option<Znode>,
}

/// Generation-tagged slot storage for znodes
#[derive(Default)]
pub struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl Arena {
    pub fn insert(&mut self, node: Znode) -> ZnodeId {
        self.live += 1;
        if let Some(slot) = self.free.pop() {
            let s = &mut self.slots[slot as usize];
            s.node = Some(node);
            return ZnodeId { slot, gen: s.gen };
        }
        self.slots.push(Slot {
            gen: 0,
            node: Some(node),
        });
        ZnodeId {
            slot: self.slots.len() as u32 - 1,
            gen: 0,
        }
    }

    pub fn get(&self, id: ZnodeId) -> Option<&Znode> {
        match self.slots.get(id.slot as usize) {
            Some(s) if s.gen == id.gen => s.node.as_ref(),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: ZnodeId) -> Option<&mut Znode> {
        match self.slots.get_mut(id.slot as usize) {
            Some(s) if s.gen == id.gen => s.node.as_mut(),
            _ => None,
        }
    }

    /// Free a slot; every outstanding id for it goes stale
    pub fn remove(&mut self, id: ZnodeId) -> Option<Znode> {
        let s = self.slots.get_mut(id.slot as usize)?;
        if s.gen != id.gen {
            return None;
        }
        let node = s.node.take()?;
        s.gen = s.gen.wrapping_add(1);
        self.free.push(id.slot);
        self.live -= 1;
        Some(node)
    }

    pub fn live(&self) -> usize {
        self.live
    }

    pub fn ids(&self) -> impl Iterator<Item = ZnodeId> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.node.as_ref().map(|_| ZnodeId {
                slot: i as u32,
                gen: s.gen,
            })
        })
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.live = 0;
    }
}
