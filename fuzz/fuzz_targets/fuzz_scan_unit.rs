#![no_main]
use flashlog::core::scan::{scan_eu, ScanMode};
use flashlog::{Device, MemDevice};
use libfuzzer_sys::fuzz_target;

const EU_SIZE: u32 = 4096;

// A unit full of garbage must scan to a clean error or a valid prefix
fuzz_target!(|data: &[u8]| {
    let dev = MemDevice::new(EU_SIZE, 1, 8);
    let len = data.len().min(EU_SIZE as usize) & !7;
    if len == 0 || dev.write(0, 0, &data[..len]).is_err() {
        return;
    }
    for mode in [ScanMode::Strict, ScanMode::Tolerant] {
        if let Ok(scanned) = scan_eu(&dev, 0, 0, mode, 0) {
            assert!(scanned.end <= EU_SIZE);
            for n in &scanned.nodes {
                assert!(n.offs < scanned.end);
            }
        }
    }
});
