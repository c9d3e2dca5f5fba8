//! On-media shape of the ledger
//!
//! The whole tree is resident. Leaves (pnodes) carry the properties of
//! [`LEDGER_FANOUT`] units each, internal nodes (nnodes) the locations of
//! their children. The root is always an nnode. A changed unit marks its
//! pnode and every ancestor dirty; commit writes only dirty nodes, appending
//! to the live ledger unit or rewriting the whole tree into the next one.

use super::props::LedgerGeometry;
use crate::error::{Result, StorageError};
use crate::io::{read_node, Device};
use crate::node::{
    align_up, EuProps, GroupFlag, Location, NnodeNode, Node, PnodeNode, LEDGER_FANOUT,
    NNODE_SIZE, PNODE_SIZE,
};
use tracing::debug;

#[derive(Debug, Clone, Copy, Default)]
struct TreeNode {
    loc: Option<Location>,
    dirty: bool,
}

/// Dirty ledger nodes serialized for one commit
#[derive(Debug, Clone)]
pub struct LedgerWrite {
    pub eu: u32,
    pub offs: u32,
    pub bytes: Vec<u8>,
    /// The target unit must be erased first
    pub switch: bool,
    pub root: Location,
}

/// Node counts per level, pnodes first, root last
pub fn level_counts(main_eus: u32) -> Vec<usize> {
    let fanout = LEDGER_FANOUT;
    let mut counts = vec![(main_eus as usize).div_ceil(fanout).max(1)];
    loop {
        let last = counts[counts.len() - 1];
        if last == 1 && counts.len() > 1 {
            break;
        }
        counts.push(last.div_ceil(fanout));
    }
    counts
}

#[derive(Debug, Clone)]
pub struct LedgerTree {
    levels: Vec<Vec<TreeNode>>,
    live_eu: u32,
    offs: u32,
    dirty_cnt: usize,
}

impl LedgerTree {
    /// Fresh tree with every node dirty, to be written at `live_eu:0`
    pub fn new(geo: &LedgerGeometry) -> Self {
        let levels: Vec<Vec<TreeNode>> = level_counts(geo.main_eus)
            .into_iter()
            .map(|n| {
                vec![
                    TreeNode {
                        loc: None,
                        dirty: true,
                    };
                    n
                ]
            })
            .collect();
        let dirty_cnt = levels.iter().map(Vec::len).sum();
        LedgerTree {
            levels,
            live_eu: geo.ledger_first,
            offs: 0,
            dirty_cnt,
        }
    }

    pub fn live_eu(&self) -> u32 {
        self.live_eu
    }

    pub fn offs(&self) -> u32 {
        self.offs
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty_cnt
    }

    pub fn root(&self) -> Option<Location> {
        self.levels.last().and_then(|l| l[0].loc)
    }

    /// Mark the pnode covering main-area index `i` and its ancestors dirty
    pub fn mark_dirty(&mut self, i: usize) {
        let mut num = i / LEDGER_FANOUT;
        for level in self.levels.iter_mut() {
            let node = &mut level[num];
            if node.dirty {
                return;
            }
            node.dirty = true;
            self.dirty_cnt += 1;
            num /= LEDGER_FANOUT;
        }
    }

    fn mark_all_dirty(&mut self) {
        self.dirty_cnt = 0;
        for level in self.levels.iter_mut() {
            for node in level.iter_mut() {
                node.dirty = true;
                self.dirty_cnt += 1;
            }
        }
    }

    fn dirty_bytes(&self) -> u32 {
        let mut total = 0;
        for (depth, level) in self.levels.iter().enumerate() {
            let size = if depth == 0 { PNODE_SIZE } else { NNODE_SIZE };
            let n = level.iter().filter(|n| n.dirty).count() as u32;
            total += n * align_up(size, 8);
        }
        total
    }

    /// Serialize every dirty node and mark it clean with its new location
    ///
    /// Nodes are appended to the live unit when they fit; otherwise the whole
    /// tree moves to the next ledger unit, so only one unit ever holds live
    /// ledger nodes.
    pub fn prepare_commit(
        &mut self,
        props: &[EuProps],
        geo: &LedgerGeometry,
        sqnum: &mut dyn FnMut() -> u64,
    ) -> Result<Option<LedgerWrite>> {
        if self.dirty_cnt == 0 {
            return Ok(None);
        }

        let mut eu = self.live_eu;
        let mut start = self.offs;
        let mut switch = false;
        if start + align_up(self.dirty_bytes(), geo.min_io) > geo.eu_size {
            let next = (self.live_eu - geo.ledger_first + 1) % geo.ledger_eus;
            eu = geo.ledger_first + next;
            start = 0;
            switch = true;
            self.mark_all_dirty();
            debug!("ledger moves to unit {}", eu);
        }
        if align_up(self.dirty_bytes(), geo.min_io) > geo.eu_size {
            return Err(StorageError::Internal(
                "ledger tree does not fit into one unit".to_string(),
            ));
        }

        let mut bytes = Vec::new();
        for depth in 0..self.levels.len() {
            for num in 0..self.levels[depth].len() {
                if !self.levels[depth][num].dirty {
                    continue;
                }
                let node = if depth == 0 {
                    let mut slot = [EuProps::default(); LEDGER_FANOUT];
                    for (k, p) in slot.iter_mut().enumerate() {
                        if let Some(src) = props.get(num * LEDGER_FANOUT + k) {
                            *p = *src;
                        }
                    }
                    Node::Pnode(PnodeNode {
                        num: num as u32,
                        props: slot,
                    })
                } else {
                    let mut children = [None; LEDGER_FANOUT];
                    for (k, c) in children.iter_mut().enumerate() {
                        if let Some(child) = self.levels[depth - 1].get(num * LEDGER_FANOUT + k) {
                            *c = child.loc;
                        }
                    }
                    Node::Nnode(NnodeNode {
                        num: num as u32,
                        children,
                    })
                };

                let encoded = node.encode(sqnum(), GroupFlag::None);
                let loc = Location::new(eu, start + bytes.len() as u32, encoded.len() as u32);
                bytes.extend_from_slice(&encoded);
                bytes.resize(align_up(bytes.len() as u32, 8) as usize, 0);

                let tn = &mut self.levels[depth][num];
                tn.loc = Some(loc);
                tn.dirty = false;
            }
        }
        crate::scan::pad_to(&mut bytes, geo.min_io);

        self.dirty_cnt = 0;
        self.live_eu = eu;
        self.offs = start + bytes.len() as u32;
        let root = self
            .root()
            .ok_or_else(|| StorageError::Internal("ledger root was not written".to_string()))?;

        Ok(Some(LedgerWrite {
            eu,
            offs: start,
            bytes,
            switch,
            root,
        }))
    }

    /// Read the committed tree and the unit properties it holds
    pub fn load(
        dev: &dyn Device,
        geo: &LedgerGeometry,
        root: Location,
        live_eu: u32,
        offs: u32,
        retries: u32,
    ) -> Result<(Self, Vec<EuProps>)> {
        let counts = level_counts(geo.main_eus);
        let mut levels: Vec<Vec<TreeNode>> =
            counts.iter().map(|&n| vec![TreeNode::default(); n]).collect();
        let mut props = vec![EuProps::default(); geo.main_eus as usize];

        let top = counts.len() - 1;
        let mut pending = vec![(top, 0usize, root)];
        while let Some((depth, num, loc)) = pending.pop() {
            let (_, node) = read_node(dev, loc, None, retries)?;
            levels[depth][num].loc = Some(loc);
            match node {
                Node::Nnode(n) if depth > 0 && n.num as usize == num => {
                    for (k, child) in n.children.iter().enumerate() {
                        let cnum = num * LEDGER_FANOUT + k;
                        match child {
                            Some(cloc) if cnum < counts[depth - 1] => {
                                pending.push((depth - 1, cnum, *cloc))
                            }
                            None if cnum >= counts[depth - 1] => {}
                            _ => {
                                return Err(StorageError::corrupt(
                                    loc.eu,
                                    loc.offs,
                                    format!("ledger nnode {} child {} does not match geometry", num, k),
                                ))
                            }
                        }
                    }
                }
                Node::Pnode(p) if depth == 0 && p.num as usize == num => {
                    for (k, value) in p.props.iter().enumerate() {
                        if let Some(slot) = props.get_mut(num * LEDGER_FANOUT + k) {
                            if value.free + value.dirty > geo.eu_size {
                                return Err(StorageError::corrupt(
                                    loc.eu,
                                    loc.offs,
                                    format!("unit properties {:?} exceed the unit size", value),
                                ));
                            }
                            *slot = *value;
                        }
                    }
                }
                other => {
                    return Err(StorageError::corrupt(
                        loc.eu,
                        loc.offs,
                        format!(
                            "unexpected {:?} at ledger level {} position {}",
                            other.node_type(),
                            depth,
                            num
                        ),
                    ))
                }
            }
        }

        Ok((
            LedgerTree {
                levels,
                live_eu,
                offs,
                dirty_cnt: 0,
            },
            props,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::io::MemDevice;

    #[test]
    fn test_level_counts() {
        assert_eq!(level_counts(4), vec![1, 1]);
        assert_eq!(level_counts(16), vec![4, 1]);
        assert_eq!(level_counts(17), vec![5, 2, 1]);
        assert_eq!(level_counts(64), vec![16, 4, 1]);
    }

    #[test]
    fn test_commit_then_load() {
        let cfg = Config::small(4096, 16);
        let geo = LedgerGeometry::from_config(&cfg);
        let dev = MemDevice::for_config(&cfg);

        let mut props = vec![
            EuProps {
                free: 4096,
                dirty: 0,
                flags: 0
            };
            16
        ];
        props[5] = EuProps {
            free: 1024,
            dirty: 64,
            flags: 0,
        };

        let mut tree = LedgerTree::new(&geo);
        let mut sq = 10;
        let write = tree
            .prepare_commit(&props, &geo, &mut || {
                sq += 1;
                sq
            })
            .unwrap()
            .unwrap();
        assert!(!write.switch);
        assert_eq!(write.eu, geo.ledger_first);
        dev.write(write.eu, write.offs, &write.bytes).unwrap();
        assert_eq!(tree.dirty_count(), 0);

        let (loaded, loaded_props) =
            LedgerTree::load(&dev, &geo, write.root, tree.live_eu(), tree.offs(), 0).unwrap();
        assert_eq!(loaded_props, props);
        assert_eq!(loaded.root(), Some(write.root));

        // One changed unit rewrites its pnode and the root only
        let before = tree.offs();
        tree.mark_dirty(5);
        assert_eq!(tree.dirty_count(), 2);
        let write = tree.prepare_commit(&props, &geo, &mut || 99).unwrap().unwrap();
        assert_eq!(write.offs, before);
        assert_eq!(write.bytes.len() as u32, align_up(PNODE_SIZE, 8) + align_up(NNODE_SIZE, 8));
    }

    #[test]
    fn test_full_unit_switches() {
        let cfg = Config::small(4096, 16);
        let geo = LedgerGeometry::from_config(&cfg);
        let props = vec![EuProps::default(); 16];
        let mut tree = LedgerTree::new(&geo);
        tree.prepare_commit(&props, &geo, &mut || 1).unwrap();

        let mut switched = None;
        for round in 0..64 {
            tree.mark_dirty(round % 16);
            let write = tree.prepare_commit(&props, &geo, &mut || 1).unwrap().unwrap();
            if write.switch {
                switched = Some(write);
                break;
            }
        }
        let write = switched.unwrap();
        assert_eq!(write.eu, geo.ledger_first + 1);
        assert_eq!(write.offs, 0);
        assert_eq!(tree.live_eu(), geo.ledger_first + 1);
    }
}
