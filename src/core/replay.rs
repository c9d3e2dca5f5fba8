//! Journal replay
//!
//! Rebuilds the state the last commit did not capture. The log window
//! starting at the master's commit-start node names every bud written
//! since; their nodes are applied to the committed index and ledger in
//! sequence number order.

use crate::config::Config;
use crate::error::{RecoveryOutcome, Result, StorageError};
use crate::io::{read_node, Device};
use crate::key::{Key, MAX_KEY_VALUE};
use crate::ledger::Ledger;
use crate::node::{align_up, Location, MasterNode, Node, RefNode};
use crate::scan::{scan_eu, truncate_eu, ScanMode, ScannedEu};
use crate::tnc::Tnc;
use ahash::{AHashMap, AHashSet};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Everything replay needs, borrowed from the mount in progress
pub struct ReplayContext<'a> {
    pub dev: &'a dyn Device,
    pub config: &'a Config,
    pub master: &'a MasterNode,
    pub tnc: &'a mut Tnc,
    pub ledger: &'a mut Ledger,
    /// Torn tails are recorded instead of truncated
    pub read_only: bool,
}

/// An inode whose size record is below the end of its replayed data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeFix {
    pub inum: u64,
    pub loc: Location,
    pub size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ReplayReport {
    /// Non-clean scan results, in the order they were found
    pub outcomes: Vec<RecoveryOutcome>,
    /// Units written in the replayed window
    pub buds: BTreeMap<u32, u64>,
    /// Where the next log reference goes
    pub lhead: (u32, u32),
    pub max_sqnum: u64,
    pub highest_inum: u64,
    pub size_fixes: Vec<SizeFix>,
    /// Torn tails left in place by a read-only mount, as `(eu, valid_end)`
    pub truncations: Vec<(u32, u32)>,
    /// Nodes applied
    pub replayed: usize,
}

#[derive(Debug, Clone, Copy)]
struct Bud {
    start: u32,
    jhead: u32,
    /// Sequence number of the newest reference to the unit
    ref_sqnum: u64,
}

struct Entry {
    sqnum: u64,
    loc: Location,
    node: Node,
}

/// Replay the journal on top of the committed index and ledger
pub fn replay_journal(mut cx: ReplayContext<'_>) -> Result<ReplayReport> {
    let mut report = ReplayReport {
        max_sqnum: cx.master.cs_sqnum,
        highest_inum: cx.master.highest_inum,
        ..ReplayReport::default()
    };

    let refs = scan_log(&cx, &mut report)?;
    let buds = collect_buds(&refs);

    let mut last_of_head: AHashMap<u32, u32> = AHashMap::new();
    for (&eu, bud) in &buds {
        let newest = last_of_head.entry(bud.jhead).or_insert(eu);
        if buds[&*newest].ref_sqnum < bud.ref_sqnum {
            *newest = eu;
        }
    }

    let mut entries = Vec::new();
    // Locations that are current in units erased and reused in this window
    let mut fresh: AHashSet<u32> = AHashSet::new();
    for (&eu, bud) in &buds {
        let tolerant = last_of_head.get(&bud.jhead) == Some(&eu);
        let scanned = scan_bud(&mut cx, eu, bud, tolerant, &mut report)?;
        if bud.start == 0 {
            fresh.insert(eu);
        }

        for n in scanned.nodes {
            report.max_sqnum = report.max_sqnum.max(n.header.sqnum);
            if n.header.sqnum <= cx.master.cs_sqnum {
                continue;
            }
            entries.push(Entry {
                sqnum: n.header.sqnum,
                loc: Location::new(eu, n.offs, n.header.len),
                node: n.node,
            });
        }
        report.buds.insert(eu, cx.master.cmt_no);
    }

    entries.sort_by_key(|e| e.sqnum);
    let written: AHashSet<Location> = entries
        .iter()
        .filter(|e| fresh.contains(&e.loc.eu))
        .map(|e| e.loc)
        .collect();
    let mut replay = Applier {
        tnc: &mut *cx.tnc,
        ledger: &mut *cx.ledger,
        block_size: cx.config.block_size as u64,
        shrink_batch: cx.config.shrink_batch,
        fresh: &fresh,
        written: &written,
        data_end: AHashMap::new(),
    };
    for entry in &entries {
        replay.apply(entry)?;
        if let Some(key) = entry.node.key() {
            report.highest_inum = report.highest_inum.max(key.inum());
        }
    }
    report.replayed = entries.len();

    let data_end = replay.data_end;
    report.size_fixes = size_fixes(&mut cx, data_end)?;

    info!(
        "replayed {} nodes from {} buds, max sqnum {}",
        report.replayed,
        report.buds.len(),
        report.max_sqnum
    );
    Ok(report)
}

/// Walk the log window and return the bud references in it
fn scan_log(cx: &ReplayContext<'_>, report: &mut ReplayReport) -> Result<Vec<(RefNode, u64)>> {
    let first = cx.config.log_first();
    let count = cx.config.log_eus;
    let next = |eu: u32| first + (eu - first + 1) % count;

    let mut refs = Vec::new();
    let mut eu = cx.master.log_eu;
    report.lhead = (eu, 0);
    loop {
        let scanned = scan_eu(cx.dev, eu, 0, ScanMode::Tolerant, cx.config.read_retries)?;
        let outcome = scanned.outcome.clone().into_result()?;

        if eu == cx.master.log_eu {
            match scanned.nodes.first() {
                Some(n) if matches!(&n.node, Node::CommitStart(cs) if cs.cmt_no == cx.master.cmt_no)
                    && n.header.sqnum == cx.master.cs_sqnum => {}
                _ => {
                    return Err(StorageError::corrupt(
                        eu,
                        0,
                        format!("log tail does not start commit {}", cx.master.cmt_no),
                    ))
                }
            }
        } else {
            // A stale unit from an earlier lap ends the window
            match scanned.nodes.first() {
                None => break,
                Some(n) if n.header.sqnum < cx.master.cs_sqnum => break,
                Some(_) => {}
            }
        }

        for n in &scanned.nodes {
            report.max_sqnum = report.max_sqnum.max(n.header.sqnum);
            match &n.node {
                Node::Ref(r) => refs.push((r.clone(), n.header.sqnum)),
                // Start of a commit whose master never made it
                Node::CommitStart(_) if n.offs == 0 => {}
                other => {
                    return Err(StorageError::corrupt(
                        eu,
                        n.offs,
                        format!("{:?} node in the log", other.node_type()),
                    ))
                }
            }
        }

        let torn = !outcome.is_clean();
        let end = settle_tail(cx, eu, &scanned, outcome, report)?;
        report.lhead = (eu, end);
        let following = next(eu);
        if torn || following == cx.master.log_eu {
            break;
        }
        eu = following;
    }
    debug!("log window holds {} bud references", refs.len());
    Ok(refs)
}

/// Merge references to the same unit, keeping the lowest start offset
fn collect_buds(refs: &[(RefNode, u64)]) -> BTreeMap<u32, Bud> {
    let mut buds: BTreeMap<u32, Bud> = BTreeMap::new();
    for (r, sqnum) in refs {
        buds.entry(r.eu)
            .and_modify(|b| {
                b.start = b.start.min(r.offs);
                if *sqnum > b.ref_sqnum {
                    b.ref_sqnum = *sqnum;
                    b.jhead = r.jhead;
                }
            })
            .or_insert(Bud {
                start: r.offs,
                jhead: r.jhead,
                ref_sqnum: *sqnum,
            });
    }
    buds
}

fn scan_bud(
    cx: &mut ReplayContext<'_>,
    eu: u32,
    bud: &Bud,
    tolerant: bool,
    report: &mut ReplayReport,
) -> Result<ScannedEu> {
    if !cx.config.is_main(eu) {
        return Err(StorageError::corrupt(eu, bud.start, "bud reference outside the main area"));
    }
    let mode = if tolerant { ScanMode::Tolerant } else { ScanMode::Strict };
    let scanned = scan_eu(cx.dev, eu, bud.start, mode, cx.config.read_retries)?;
    let outcome = scanned.outcome.clone().into_result()?;
    let end = settle_tail(cx, eu, &scanned, outcome, report)?;

    let eu_size = cx.config.eu_size;
    let old = cx.ledger.lookup(eu)?;
    let free = eu_size - end;
    // A bud written from offset 0 was erased in this window; what the
    // committed ledger says about the unit no longer applies
    let (base, flags) = if bud.start == 0 { (0, Some(0)) } else { (old.dirty, None) };
    let dirty = (base + scanned.pad_bytes).min(eu_size - free);
    cx.ledger.change(eu, Some(free), Some(dirty), flags)?;
    Ok(scanned)
}

/// Cut a torn tail off a unit, or remember it on a read-only mount
///
/// Returns the offset new writes may start at.
fn settle_tail(
    cx: &ReplayContext<'_>,
    eu: u32,
    scanned: &ScannedEu,
    outcome: RecoveryOutcome,
    report: &mut ReplayReport,
) -> Result<u32> {
    let min_io = cx.config.min_io_size;
    match outcome {
        RecoveryOutcome::TruncatedTail { valid_end, dropped, .. } => {
            warn!("unit {}: dropping {} bytes after {}", eu, dropped, valid_end);
            report.outcomes.push(scanned.outcome.clone());
            if cx.read_only {
                report.truncations.push((eu, valid_end));
                Ok(align_up(valid_end, min_io).min(cx.config.eu_size))
            } else {
                truncate_eu(cx.dev, eu, valid_end, cx.config.read_retries)
            }
        }
        _ => Ok(align_up(scanned.end, min_io).min(cx.config.eu_size)),
    }
}

struct Applier<'a> {
    tnc: &'a mut Tnc,
    ledger: &'a mut Ledger,
    block_size: u64,
    shrink_batch: usize,
    fresh: &'a AHashSet<u32>,
    written: &'a AHashSet<Location>,
    /// Highest data offset seen per inode; truncations reset it
    data_end: AHashMap<u64, u64>,
}

impl Applier<'_> {
    fn apply(&mut self, e: &Entry) -> Result<()> {
        self.tnc.ensure_room(1, self.shrink_batch)?;
        match &e.node {
            Node::Inode(ino) if ino.nlink == 0 => {
                let gone = self.tnc.remove_range(&Key::lowest(ino.inum()), &Key::highest(ino.inum()))?;
                self.displaced(gone)?;
                self.data_end.remove(&ino.inum());
                self.dead(e.loc)?;
            }
            Node::Inode(ino) => {
                let old = self.tnc.add(&ino.key, e.loc)?;
                self.displaced(old)?;
            }
            Node::Data(d) => {
                let old = self.tnc.add(&d.key, e.loc)?;
                self.displaced(old)?;
                let end = d.key.block() as u64 * self.block_size + d.data.len() as u64;
                let seen = self.data_end.entry(d.key.inum()).or_insert(0);
                *seen = (*seen).max(end);
            }
            Node::Dent(ent) | Node::Xent(ent) if ent.target != 0 => {
                let old = self.tnc.add_nm_fallible(&ent.key, &ent.name, e.loc)?;
                self.displaced(old)?;
            }
            Node::Dent(ent) | Node::Xent(ent) => {
                let old = self.tnc.remove_nm_fallible(&ent.key, &ent.name)?;
                self.displaced(old)?;
                self.dead(e.loc)?;
            }
            Node::Trun(t) => {
                let first = t.new_size.div_ceil(self.block_size);
                let first = first.min(MAX_KEY_VALUE as u64) as u32;
                let gone = self
                    .tnc
                    .remove_range(&Key::data(t.inum, first), &Key::data(t.inum, MAX_KEY_VALUE))?;
                self.displaced(gone)?;
                self.data_end.insert(t.inum, t.new_size);
                self.dead(e.loc)?;
            }
            other => {
                return Err(StorageError::corrupt(
                    e.loc.eu,
                    e.loc.offs,
                    format!("{:?} node in a bud", other.node_type()),
                ))
            }
        }
        Ok(())
    }

    fn displaced(&mut self, locs: impl IntoIterator<Item = Location>) -> Result<()> {
        for loc in locs {
            // The unit was erased in this window; the node is long gone
            if self.fresh.contains(&loc.eu) && !self.written.contains(&loc) {
                continue;
            }
            self.ledger.add_dirt_saturating(loc.eu, loc.aligned_len())?;
        }
        Ok(())
    }

    fn dead(&mut self, loc: Location) -> Result<()> {
        self.ledger.add_dirt_saturating(loc.eu, loc.aligned_len())
    }
}

/// Inodes whose size record lags behind their replayed data
fn size_fixes(cx: &mut ReplayContext<'_>, data_end: AHashMap<u64, u64>) -> Result<Vec<SizeFix>> {
    let mut fixes = Vec::new();
    let mut ends: Vec<(u64, u64)> = data_end.into_iter().collect();
    ends.sort_unstable();
    for (inum, end) in ends {
        let key = Key::inode(inum);
        let Some(loc) = cx.tnc.lookup(&key)? else {
            continue;
        };
        let (_, node) = read_node(cx.dev, loc, Some(&key), cx.config.read_retries)?;
        if let Node::Inode(ino) = node {
            if ino.size < end {
                debug!("inode {} size {} below data end {}", inum, ino.size, end);
                fixes.push(SizeFix { inum, loc, size: end });
            }
        }
    }
    Ok(fixes)
}
