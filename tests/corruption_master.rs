//! Corruption tests for the master record and the committed index
//!
//! One damaged master copy is repaired from the other; two damaged copies
//! refuse the mount. Damage found in the index during normal operation
//! switches the volume to read-only instead of returning wrong data.

use flashlog::core::scan::{scan_eu, ScanMode};
use flashlog::core::ledger::EU_INDEX;
use flashlog::{recover_master, Config, Key, MemDevice, MountMode, Node, RecoveryOutcome, StorageError, Store};
use std::sync::Arc;

const INUM: u64 = 3;

fn committed_volume(config: &Config, blocks: u32) -> Arc<MemDevice> {
    let dev = Arc::new(MemDevice::for_config(config));
    Store::format(&*dev, config).unwrap();
    let store = Store::mount(dev.clone(), config.clone(), MountMode::ReadWrite).unwrap();
    for b in 0..blocks {
        store.write_data(INUM, b, &[b as u8; 100]).unwrap();
    }
    store.unmount().unwrap();
    dev
}

/// Offset of the newest master copy in a slot
fn last_master(dev: &MemDevice, slot: u32) -> u32 {
    let scanned = scan_eu(dev, slot, 0, ScanMode::Strict, 0).unwrap();
    scanned.nodes.last().unwrap().offs
}

#[test]
fn test_one_damaged_copy_is_repaired() {
    let config = Config::small(4096, 16);
    let dev = committed_volume(&config, 10);
    let offs = last_master(&dev, 1);
    dev.corrupt(1, offs + 40, 0x5A);

    let store = Store::mount(dev.clone(), config.clone(), MountMode::ReadWrite).unwrap();
    assert!(store
        .recovery_outcomes()
        .iter()
        .any(|o| matches!(o, RecoveryOutcome::MasterRepaired { slot: 0 })));
    match store.read_node(&Key::data(INUM, 9)).unwrap() {
        Some(Node::Data(d)) => assert_eq!(d.data, vec![9u8; 100]),
        other => panic!("unexpected {:?}", other),
    }
    store.unmount().unwrap();
    drop(store);

    // Both copies agree again
    let recovered = recover_master(&*dev, &config, true).unwrap();
    assert!(recovered.outcome.is_clean());
}

#[test]
fn test_repair_is_deferred_on_read_only_mount() {
    let config = Config::small(4096, 16);
    let dev = committed_volume(&config, 4);
    let offs = last_master(&dev, 0);
    dev.corrupt(0, offs + 40, 0x01);
    let slot0 = dev.unit(0);

    let store = Store::mount(dev.clone(), config.clone(), MountMode::ReadOnly).unwrap();
    assert!(store
        .recovery_outcomes()
        .iter()
        .any(|o| matches!(o, RecoveryOutcome::MasterRepaired { slot: 1 })));
    assert_eq!(dev.unit(0), slot0);
    assert!(store.read_node(&Key::data(INUM, 3)).unwrap().is_some());
}

#[test]
fn test_both_copies_damaged_refuses_mount() {
    let config = Config::small(4096, 16);
    let dev = committed_volume(&config, 4);
    for slot in 0..2 {
        // Every copy in the slot
        let scanned = scan_eu(&*dev, slot, 0, ScanMode::Strict, 0).unwrap();
        for n in &scanned.nodes {
            dev.corrupt(slot, n.offs + 30, 0xFF);
        }
    }

    match Store::mount(dev, config, MountMode::ReadOnly) {
        Err(e) => assert!(e.is_corruption(), "unexpected error {}", e),
        Ok(_) => panic!("mounted without a master record"),
    }
}

#[test]
fn test_damaged_index_node_goes_read_only() {
    let config = Config {
        fanout: 4,
        ..Config::small(4096, 16)
    };
    let dev = committed_volume(&config, 64);

    let store = Store::mount(dev.clone(), config.clone(), MountMode::ReadOnly).unwrap();
    let index_eus: Vec<u32> = (config.main_first()..config.main_first() + config.main_eus)
        .filter(|eu| store.eu_props(*eu).unwrap().flags & EU_INDEX != 0)
        .collect();
    assert!(!index_eus.is_empty());
    drop(store);

    // Damage the first index node of every index unit
    for eu in &index_eus {
        let scanned = scan_eu(&*dev, *eu, 0, ScanMode::Strict, 0).unwrap();
        if let Some(n) = scanned.nodes.first() {
            dev.corrupt(*eu, n.offs + 30, 0x40);
        }
    }

    let store = match Store::mount(dev, config, MountMode::ReadWrite) {
        // The root itself was hit
        Err(e) => {
            assert!(e.is_corruption(), "unexpected error {}", e);
            return;
        }
        Ok(store) => store,
    };
    let mut failed = None;
    for b in 0..64 {
        if let Err(e) = store.read_node(&Key::data(INUM, b)) {
            failed = Some(e);
            break;
        }
    }
    let err = failed.expect("no lookup touched the damaged node");
    assert!(err.is_corruption());
    assert!(store.is_read_only());
    assert!(matches!(store.write_data(INUM, 0, b"x"), Err(StorageError::ReadOnly)));
}

#[test]
fn test_transient_read_faults_are_retried() {
    let config = Config::small(4096, 16);
    let dev = committed_volume(&config, 8);
    let store = Store::mount(dev.clone(), config.clone(), MountMode::ReadOnly).unwrap();
    store.shrink(usize::MAX);

    dev.inject_read_faults(config.read_retries);
    match store.read_node(&Key::data(INUM, 5)).unwrap() {
        Some(Node::Data(d)) => assert_eq!(d.data, vec![5u8; 100]),
        other => panic!("unexpected {:?}", other),
    }
    assert!(!store.is_read_only() || store.recovery_outcomes().is_empty());
}
