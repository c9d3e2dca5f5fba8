//! Master record
//!
//! Two fixed units each hold a log of master nodes; the last valid node of
//! a unit is its current copy. Commits append the same node to both slots,
//! slot 0 first, so the copies differ only after a power cut between the
//! two writes.

use crate::config::{Config, MASTER_EUS};
use crate::error::{RecoveryOutcome, Result, StorageError};
use crate::io::Device;
use crate::node::{GroupFlag, MasterNode, Node, MST_RECOVERY};
use crate::scan::{pad_to, scan_eu, ScanMode};
use tracing::{info, warn};

/// Master copy chosen at mount
#[derive(Debug, Clone)]
pub struct RecoveredMaster {
    pub master: MasterNode,
    /// Sequence number the chosen copy was written with
    pub sqnum: u64,
    pub outcome: RecoveryOutcome,
    /// Append offsets of both slots
    pub slots: MasterSlots,
}

/// Append positions in the two master units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterSlots {
    offs: [u32; MASTER_EUS as usize],
    eu_size: u32,
    min_io: u32,
}

impl MasterSlots {
    pub fn new(config: &Config, offs: [u32; MASTER_EUS as usize]) -> Self {
        MasterSlots {
            offs,
            eu_size: config.eu_size,
            min_io: config.min_io_size,
        }
    }

    pub fn offsets(&self) -> [u32; MASTER_EUS as usize] {
        self.offs
    }

    /// Append `master` to both slots
    ///
    /// A full slot is replaced atomically with just the new copy.
    pub fn write(&mut self, dev: &dyn Device, master: &MasterNode, sqnum: u64) -> Result<()> {
        let mut bytes = Node::Master(master.clone()).encode(sqnum, GroupFlag::None);
        pad_to(&mut bytes, self.min_io);
        let len = bytes.len() as u32;
        for slot in 0..MASTER_EUS {
            let offs = &mut self.offs[slot as usize];
            if *offs + len > self.eu_size {
                dev.change(slot, &bytes)?;
                *offs = len;
            } else {
                dev.write(slot, *offs, &bytes)?;
                *offs += len;
            }
        }
        Ok(())
    }

    /// Replace both slots with a single copy of `master`
    pub fn rewrite(&mut self, dev: &dyn Device, master: &MasterNode, sqnum: u64) -> Result<()> {
        let mut bytes = Node::Master(master.clone()).encode(sqnum, GroupFlag::None);
        pad_to(&mut bytes, self.min_io);
        for slot in 0..MASTER_EUS {
            dev.change(slot, &bytes)?;
            self.offs[slot as usize] = bytes.len() as u32;
        }
        Ok(())
    }
}

struct SlotCopy {
    master: MasterNode,
    sqnum: u64,
    /// Where in the slot the copy sits
    offs: u32,
    /// Anything but a clean scan of the slot
    damaged: bool,
}

fn read_slot(dev: &dyn Device, slot: u32, retries: u32) -> Result<(Option<SlotCopy>, u32)> {
    let scanned = scan_eu(dev, slot, 0, ScanMode::Tolerant, retries)?;
    let damaged = !scanned.outcome.is_clean();
    if damaged {
        warn!("master slot {}: {:?}", slot, scanned.outcome);
    }
    let copy = scanned.nodes.iter().rev().find_map(|n| match &n.node {
        Node::Master(m) => Some(SlotCopy {
            master: m.clone(),
            sqnum: n.header.sqnum,
            offs: n.offs,
            damaged,
        }),
        _ => None,
    });
    Ok((copy, scanned.end))
}

/// Check that a master copy describes this geometry
fn validate(master: &MasterNode, config: &Config) -> std::result::Result<(), String> {
    let log = config.log_first()..config.ledger_first();
    let ledger = config.ledger_first()..config.orphan_first();
    if master.main_eus != config.main_eus {
        return Err(format!("master covers {} main units, configured {}", master.main_eus, config.main_eus));
    }
    if !log.contains(&master.log_eu) {
        return Err(format!("log tail {} outside the log area", master.log_eu));
    }
    if !ledger.contains(&master.ledger_eu) || master.ledger_root.is_none() {
        return Err(format!("ledger at {} outside the ledger area", master.ledger_eu));
    }
    if master.ledger_offs > config.eu_size || master.ihead_offs > config.eu_size {
        return Err("offset past the end of a unit".to_string());
    }
    if let Some(root) = master.root {
        if !config.is_main(root.eu) {
            return Err(format!("index root {} outside the main area", root));
        }
    }
    for (what, eu) in [("index head", master.ihead_eu), ("GC unit", master.gc_eu)] {
        if eu != 0 && !config.is_main(eu) {
            return Err(format!("{} {} outside the main area", what, eu));
        }
    }
    Ok(())
}

/// Pick the authoritative master copy
///
/// Copies that agree win outright. When they differ, an undamaged slot
/// wins over a damaged one. Between two undamaged slots, slot 0 wins if it
/// is one commit ahead, a newer write of the same commit, or a copy that
/// recovery wrote at the start of the unit. That is what a power cut between
/// the two slot writes leaves behind; anything else is corruption. A single
/// copy wins only from an undamaged slot. With `read_only` the disagreement
/// is reported but the slots are left alone; otherwise both are rewritten
/// from the winner.
pub fn recover_master(dev: &dyn Device, config: &Config, read_only: bool) -> Result<RecoveredMaster> {
    let (c0, end0) = read_slot(dev, 0, config.read_retries)?;
    let (c1, end1) = read_slot(dev, 1, config.read_retries)?;

    let (chosen, repair) = match (c0, c1) {
        (Some(a), Some(b)) if a.master == b.master => {
            let repair = (a.damaged || b.damaged).then_some(if a.damaged { 0 } else { 1 });
            (a, repair)
        }
        (Some(a), Some(b)) => match (a.damaged, b.damaged) {
            (false, true) => (a, Some(1)),
            // Slot 0 lost its newest copy; slot 1 still has it
            (true, false) => (b, Some(0)),
            (true, true) => {
                return Ok(corrupted(0, "both master slots are damaged".to_string()));
            }
            (false, false) => {
                let next_commit = a.master.cmt_no == b.master.cmt_no + 1;
                let flag_update = a.master.cmt_no == b.master.cmt_no && a.sqnum > b.sqnum;
                let recovery_write = a.master.flags & MST_RECOVERY != 0 && a.offs == 0;
                if !(next_commit || flag_update || recovery_write) {
                    return Ok(corrupted(
                        0,
                        format!(
                            "master copies disagree (commit {} vs {})",
                            a.master.cmt_no, b.master.cmt_no
                        ),
                    ));
                }
                (a, Some(1))
            }
        },
        (Some(a), None) if !a.damaged => (a, Some(1)),
        (None, Some(b)) if !b.damaged => (b, Some(0)),
        (Some(_), None) | (None, Some(_)) => {
            return Ok(corrupted(0, "only master copy is in a damaged slot".to_string()));
        }
        (None, None) => return Ok(corrupted(0, "no valid master copy".to_string())),
    };

    if let Err(reason) = validate(&chosen.master, config) {
        return Ok(corrupted(0, reason));
    }

    let mut slots = MasterSlots::new(config, [end0, end1]);
    let outcome = match repair {
        None => RecoveryOutcome::Clean,
        Some(bad) => {
            let good = 1 - bad;
            if read_only {
                warn!("master slot {} needs repair, deferred on read-only mount", bad);
            } else {
                let mut master = chosen.master.clone();
                master.flags |= MST_RECOVERY;
                slots.rewrite(dev, &master, chosen.sqnum)?;
                info!("master slot {} rewritten from slot {}", bad, good);
            }
            RecoveryOutcome::MasterRepaired { slot: good }
        }
    };

    Ok(RecoveredMaster {
        master: chosen.master,
        sqnum: chosen.sqnum,
        outcome,
        slots,
    })
}

fn corrupted(eu: u32, reason: String) -> RecoveredMaster {
    RecoveredMaster {
        master: MasterNode::default(),
        sqnum: 0,
        outcome: RecoveryOutcome::Corrupted { eu, offs: 0, reason },
        slots: MasterSlots {
            offs: [0; MASTER_EUS as usize],
            eu_size: 0,
            min_io: 8,
        },
    }
}

/// Turn a recovered master into the normal-path result
pub fn require_master(recovered: RecoveredMaster) -> Result<RecoveredMaster> {
    match recovered.outcome {
        RecoveryOutcome::Corrupted { eu, offs, reason } => Err(StorageError::Corrupt { eu, offs, reason }),
        _ => Ok(recovered),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemDevice;
    use crate::node::Location;

    fn setup() -> (Config, MemDevice) {
        let config = Config::small(4096, 16);
        let dev = MemDevice::for_config(&config);
        (config, dev)
    }

    fn master(config: &Config, cmt_no: u64) -> MasterNode {
        MasterNode {
            cmt_no,
            log_eu: config.log_first(),
            ledger_eu: config.ledger_first(),
            ledger_root: Some(Location::new(config.ledger_first(), 0, 64)),
            main_eus: config.main_eus,
            gc_eu: config.main_first(),
            ..MasterNode::default()
        }
    }

    #[test]
    fn test_matching_copies_are_clean() {
        let (config, dev) = setup();
        let mut slots = MasterSlots::new(&config, [0, 0]);
        slots.write(&dev, &master(&config, 1), 10).unwrap();
        slots.write(&dev, &master(&config, 2), 20).unwrap();

        let got = recover_master(&dev, &config, false).unwrap();
        assert_eq!(got.outcome, RecoveryOutcome::Clean);
        assert_eq!(got.master.cmt_no, 2);
        assert_eq!(got.sqnum, 20);
        assert_eq!(got.slots.offsets(), slots.offsets());
    }

    #[test]
    fn test_cut_between_slot_writes_prefers_slot_zero() {
        let (config, dev) = setup();
        let mut slots = MasterSlots::new(&config, [0, 0]);
        slots.write(&dev, &master(&config, 1), 10).unwrap();
        let mut bytes = Node::Master(master(&config, 2)).encode(20, GroupFlag::None);
        pad_to(&mut bytes, 8);
        dev.write(0, slots.offsets()[0], &bytes).unwrap();

        let got = recover_master(&dev, &config, true).unwrap();
        assert_eq!(got.master.cmt_no, 2);
        assert_eq!(got.outcome, RecoveryOutcome::MasterRepaired { slot: 0 });
        // Read-only: nothing was written
        assert_eq!(recover_master(&dev, &config, true).unwrap().outcome, got.outcome);

        let got = recover_master(&dev, &config, false).unwrap();
        assert_eq!(got.master.cmt_no, 2);
        let again = recover_master(&dev, &config, false).unwrap();
        assert_eq!(again.master.cmt_no, 2);
        assert_ne!(again.master.flags & MST_RECOVERY, 0);
        assert_eq!(again.outcome, RecoveryOutcome::Clean);
    }

    #[test]
    fn test_single_readable_copy_wins() {
        let (config, dev) = setup();
        let mut slots = MasterSlots::new(&config, [0, 0]);
        slots.write(&dev, &master(&config, 3), 30).unwrap();
        dev.corrupt(0, 30, 0x40);

        let got = recover_master(&dev, &config, false).unwrap();
        assert_eq!(got.master.cmt_no, 3);
        assert_eq!(got.outcome, RecoveryOutcome::MasterRepaired { slot: 1 });
    }

    #[test]
    fn test_damaged_newest_copy_in_slot_zero() {
        let (config, dev) = setup();
        let mut slots = MasterSlots::new(&config, [0, 0]);
        slots.write(&dev, &master(&config, 1), 10).unwrap();
        let second = slots.offsets()[0];
        slots.write(&dev, &master(&config, 2), 20).unwrap();
        dev.corrupt(0, second + 30, 0x08);

        let got = recover_master(&dev, &config, false).unwrap();
        assert_eq!(got.master.cmt_no, 2);
        assert_eq!(got.outcome, RecoveryOutcome::MasterRepaired { slot: 1 });
    }

    #[test]
    fn test_torn_tail_is_repaired() {
        let (config, dev) = setup();
        let mut slots = MasterSlots::new(&config, [0, 0]);
        slots.write(&dev, &master(&config, 1), 10).unwrap();
        let offs = slots.offsets()[1];
        dev.write(1, offs, &[0x5a; 16]).unwrap();

        let got = recover_master(&dev, &config, false).unwrap();
        assert_eq!(got.outcome, RecoveryOutcome::MasterRepaired { slot: 0 });
        assert_eq!(recover_master(&dev, &config, false).unwrap().outcome, RecoveryOutcome::Clean);
    }

    #[test]
    fn test_interrupted_flag_update_prefers_slot_zero() {
        let (config, dev) = setup();
        let mut slots = MasterSlots::new(&config, [0, 0]);
        let clean = master(&config, 3);
        slots.write(&dev, &clean, 30).unwrap();

        // Only slot 0 got the copy with the dirty flag
        let mut dirty = clean.clone();
        dirty.flags |= crate::node::MST_DIRTY;
        let mut bytes = Node::Master(dirty.clone()).encode(31, GroupFlag::None);
        pad_to(&mut bytes, 8);
        dev.write(0, slots.offsets()[0], &bytes).unwrap();

        let got = recover_master(&dev, &config, true).unwrap();
        assert_eq!(got.master, dirty);
        assert_eq!(got.outcome, RecoveryOutcome::MasterRepaired { slot: 0 });
    }

    #[test]
    fn test_disagreeing_or_missing_copies_are_corruption() {
        let (config, dev) = setup();
        assert!(matches!(
            recover_master(&dev, &config, false).unwrap().outcome,
            RecoveryOutcome::Corrupted { .. }
        ));

        let mut bytes = Node::Master(master(&config, 1)).encode(1, GroupFlag::None);
        pad_to(&mut bytes, 8);
        dev.write(0, 0, &bytes).unwrap();
        let mut bytes = Node::Master(master(&config, 5)).encode(5, GroupFlag::None);
        pad_to(&mut bytes, 8);
        dev.write(1, 0, &bytes).unwrap();
        let got = recover_master(&dev, &config, false).unwrap();
        assert!(matches!(got.outcome, RecoveryOutcome::Corrupted { .. }));
        assert!(require_master(got).is_err());
    }

    #[test]
    fn test_recovery_copy_past_offset_zero_does_not_win() {
        let (config, dev) = setup();
        let mut first = Node::Master(master(&config, 1)).encode(1, GroupFlag::None);
        pad_to(&mut first, 8);
        dev.write(0, 0, &first).unwrap();
        let mut recovered = master(&config, 1);
        recovered.flags |= MST_RECOVERY;
        let mut second = Node::Master(recovered).encode(2, GroupFlag::None);
        pad_to(&mut second, 8);
        let offs = first.len() as u32;
        dev.write(0, offs, &second).unwrap();
        dev.write(0, offs + second.len() as u32, &[0x5a; 16]).unwrap();

        let mut newer = Node::Master(master(&config, 5)).encode(9, GroupFlag::None);
        pad_to(&mut newer, 8);
        dev.write(1, 0, &newer).unwrap();

        let got = recover_master(&dev, &config, false).unwrap();
        assert_eq!(got.master.cmt_no, 5);
        assert_eq!(got.outcome, RecoveryOutcome::MasterRepaired { slot: 1 });
        let again = recover_master(&dev, &config, false).unwrap();
        assert_eq!(again.master.cmt_no, 5);
        assert_eq!(again.outcome, RecoveryOutcome::Clean);
    }

    #[test]
    fn test_recovery_copy_at_offset_zero_wins() {
        let (config, dev) = setup();
        let mut recovered = master(&config, 1);
        recovered.flags |= MST_RECOVERY;
        let mut bytes = Node::Master(recovered.clone()).encode(3, GroupFlag::None);
        pad_to(&mut bytes, 8);
        dev.write(0, 0, &bytes).unwrap();
        let mut other = Node::Master(master(&config, 5)).encode(9, GroupFlag::None);
        pad_to(&mut other, 8);
        dev.write(1, 0, &other).unwrap();

        let got = recover_master(&dev, &config, true).unwrap();
        assert_eq!(got.master, recovered);
        assert_eq!(got.outcome, RecoveryOutcome::MasterRepaired { slot: 0 });
    }

    #[test]
    fn test_lone_copy_in_damaged_slot_is_corruption() {
        let (config, dev) = setup();
        let mut bytes = Node::Master(master(&config, 2)).encode(2, GroupFlag::None);
        pad_to(&mut bytes, 8);
        dev.write(0, 0, &bytes).unwrap();
        dev.write(0, bytes.len() as u32, &[0x5a; 16]).unwrap();

        let got = recover_master(&dev, &config, false).unwrap();
        assert!(matches!(got.outcome, RecoveryOutcome::Corrupted { .. }));
        // Nothing was rewritten
        assert!(!dev.is_mapped(1).unwrap());
    }

    #[test]
    fn test_full_slot_is_replaced() {
        let (config, dev) = setup();
        let mut slots = MasterSlots::new(&config, [0, 0]);
        let mut cmt_no = 0;
        while slots.offsets()[0] < config.eu_size - 100 {
            cmt_no += 1;
            slots.write(&dev, &master(&config, cmt_no), cmt_no).unwrap();
        }
        cmt_no += 1;
        slots.write(&dev, &master(&config, cmt_no), cmt_no).unwrap();
        cmt_no += 1;
        slots.write(&dev, &master(&config, cmt_no), cmt_no).unwrap();
        let got = recover_master(&dev, &config, false).unwrap();
        assert_eq!(got.master.cmt_no, cmt_no);
        assert_eq!(got.outcome, RecoveryOutcome::Clean);
    }
}
