//! File-backed volumes
//!
//! The same engine on a regular file: format, reopen after a clean unmount
//! and after a drop without one, and configuration read from TOML.

use flashlog::{
    Config, Device, FileDevice, Geometry, InodeNode, Key, MountMode, Node, StorageError, Store,
    StoreBuilder,
};
use std::sync::Arc;
use tempfile::TempDir;

fn config() -> Config {
    Config::small(4096, 16)
}

fn assert_block(store: &Store, inum: u64, block: u32, expected: &[u8]) {
    match store.read_node(&Key::data(inum, block)).unwrap() {
        Some(Node::Data(d)) => assert_eq!(d.data, expected),
        other => panic!("block {} of {} read as {:?}", block, inum, other),
    }
}

#[test]
fn test_file_volume_survives_unmount() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("volume.img");
    let config = config();
    let geometry = Geometry::for_config(&config);

    let dev = Arc::new(FileDevice::create(&path, geometry).unwrap());
    Store::format(&*dev, &config).unwrap();
    let store = Store::mount(dev, config.clone(), MountMode::ReadWrite).unwrap();
    store.write_inode(&InodeNode::new(20, 0o100644)).unwrap();
    for b in 0..12 {
        store.write_data(20, b, &[b as u8 + 1; 300]).unwrap();
    }
    store.write_inode(&InodeNode::new(1, 0o040755)).unwrap();
    store.add_entry(1, b"file", 20, 1).unwrap();
    store.unmount().unwrap();
    drop(store);

    let dev = Arc::new(FileDevice::open(&path, geometry).unwrap());
    assert_eq!(dev.path(), path.as_path());
    let store = Store::mount(dev, config, MountMode::ReadOnly).unwrap();
    assert!(store.recovery_outcomes().is_empty());
    assert!(store.read_inode(20).unwrap().is_some());
    assert_eq!(store.lookup_entry(1, b"file").unwrap(), Some(20));
    for b in 0..12 {
        assert_block(&store, 20, b, &[b as u8 + 1; 300]);
    }
}

#[test]
fn test_file_volume_replays_after_drop() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("volume.img");
    let config = config();

    let store = StoreBuilder::new()
        .path(&path)
        .config(config.clone())
        .build()
        .unwrap();
    store.write_data(4, 0, b"committed").unwrap();
    store.run_commit(true).unwrap();
    store.write_data(4, 1, b"journal only").unwrap();
    drop(store);

    let store = StoreBuilder::new()
        .path(&path)
        .config(config)
        .mode(MountMode::ReadOnly)
        .build()
        .unwrap();
    assert_block(&store, 4, 0, b"committed");
    assert_block(&store, 4, 1, b"journal only");

    store.remount_rw().unwrap();
    assert!(!store.is_read_only());
    store.write_data(4, 2, b"after remount").unwrap();
    assert_block(&store, 4, 2, b"after remount");
    store.unmount().unwrap();
}

#[test]
fn test_file_size_must_match_geometry() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("volume.img");
    let small = Config::small(4096, 16);
    FileDevice::create(&path, Geometry::for_config(&small)).unwrap();

    let larger = Config::small(4096, 32);
    match FileDevice::open(&path, Geometry::for_config(&larger)) {
        Err(StorageError::InvalidArgument(_)) => {}
        Err(e) => panic!("unexpected error {}", e),
        Ok(_) => panic!("opened a file of the wrong size"),
    }
}

#[test]
fn test_config_from_toml_file() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("flashlog.toml");
    std::fs::write(
        &config_path,
        "eu_size = 4096\nmain_eus = 16\nlog_eus = 2\nblock_size = 512\nfanout = 4\n",
    )
    .unwrap();

    let store = StoreBuilder::new()
        .path(dir.path().join("volume.img"))
        .config_file(&config_path)
        .unwrap()
        .build()
        .unwrap();
    assert_eq!(store.config().fanout, 4);
    assert_eq!(store.config().eu_size, 4096);
    for b in 0..40 {
        store.write_data(9, b, &[7; 64]).unwrap();
    }
    store.run_commit(true).unwrap();
    assert_block(&store, 9, 39, &[7; 64]);
    store.unmount().unwrap();

    std::fs::write(&config_path, "eu_size = 100\n").unwrap();
    assert!(StoreBuilder::new().config_file(&config_path).is_err());
}

#[test]
fn test_file_device_units_start_erased() {
    let dir = TempDir::new().unwrap();
    let config = config();
    let dev = FileDevice::create(dir.path().join("volume.img"), Geometry::for_config(&config)).unwrap();
    for eu in 0..config.total_eus() {
        assert!(!dev.is_mapped(eu).unwrap());
    }
    dev.write(config.main_first(), 0, &[0x11; 64]).unwrap();
    assert!(dev.is_mapped(config.main_first()).unwrap());
    dev.unmap(config.main_first()).unwrap();
    assert!(!dev.is_mapped(config.main_first()).unwrap());
}
