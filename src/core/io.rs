//! Erasable-unit device layer
//!
//! The engine sees the media as an array of fixed-size units that can be
//! read anywhere, written once between erasures, unmapped (logically erased)
//! and atomically replaced.

use crate::error::{Result, StorageError};
use crate::key::Key;
use crate::node::{decode_at, is_erased, Location, Node, NodeHeader, ERASED_BYTE};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub eu_size: u32,
    pub eu_count: u32,
    pub min_io_size: u32,
}

impl Geometry {
    /// Geometry a volume laid out by `config` needs
    pub fn for_config(config: &crate::config::Config) -> Self {
        Geometry {
            eu_size: config.eu_size,
            eu_count: config.total_eus(),
            min_io_size: config.min_io_size,
        }
    }

    fn check(&self, eu: u32, offs: u32, len: usize) -> Result<()> {
        if eu >= self.eu_count {
            return Err(StorageError::InvalidEu(eu));
        }
        if offs as u64 + len as u64 > self.eu_size as u64 {
            return Err(StorageError::InvalidArgument(format!(
                "access {}+{} past the end of unit {}",
                offs, len, eu
            )));
        }
        Ok(())
    }

    fn check_write(&self, eu: u32, offs: u32, len: usize) -> Result<()> {
        self.check(eu, offs, len)?;
        if offs % self.min_io_size != 0 || len as u32 % self.min_io_size != 0 {
            return Err(StorageError::InvalidArgument(format!(
                "unaligned write {}+{} to unit {} (min I/O {})",
                offs, len, eu, self.min_io_size
            )));
        }
        Ok(())
    }
}

/// Block-addressed access to erasable units
pub trait Device: Send + Sync {
    fn geometry(&self) -> Geometry;

    fn read(&self, eu: u32, offs: u32, buf: &mut [u8]) -> Result<()>;

    /// Program erased bytes; `offs` and `data.len()` are multiples of the
    /// minimum I/O size
    fn write(&self, eu: u32, offs: u32, data: &[u8]) -> Result<()>;

    /// Logically erase a unit
    fn unmap(&self, eu: u32) -> Result<()>;

    fn is_mapped(&self, eu: u32) -> Result<bool>;

    /// Atomically replace a unit's content; bytes past `data` read as erased
    fn change(&self, eu: u32, data: &[u8]) -> Result<()>;

    fn sync(&self) -> Result<()>;
}

/// Read, retrying transient I/O failures
pub fn read_retry(dev: &dyn Device, eu: u32, offs: u32, buf: &mut [u8], retries: u32) -> Result<()> {
    let mut attempt = 0;
    loop {
        match dev.read(eu, offs, buf) {
            Ok(()) => return Ok(()),
            Err(StorageError::Io(e)) if attempt < retries => {
                attempt += 1;
                warn!("read of {}:{} failed ({}), retry {}/{}", eu, offs, e, attempt, retries);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Read and validate the node at `loc`
pub fn read_node(
    dev: &dyn Device,
    loc: Location,
    expected: Option<&Key>,
    retries: u32,
) -> Result<(NodeHeader, Node)> {
    let mut buf = vec![0u8; loc.len as usize];
    read_retry(dev, loc.eu, loc.offs, &mut buf, retries)?;
    decode_at(&buf, loc, expected)
}

/// Read a whole unit
pub fn read_eu(dev: &dyn Device, eu: u32, retries: u32) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; dev.geometry().eu_size as usize];
    read_retry(dev, eu, 0, &mut buf, retries)?;
    Ok(buf)
}

#[derive(Debug, Clone)]
struct MemState {
    units: Vec<Option<Vec<u8>>>,
    /// Bytes that may still be programmed before a simulated power cut
    write_budget: Option<u64>,
    read_faults: u32,
    writes: u64,
}

/// In-memory device with flash write semantics and fault injection
#[derive(Debug)]
pub struct MemDevice {
    geometry: Geometry,
    state: Mutex<MemState>,
}

impl MemDevice {
    pub fn new(eu_size: u32, eu_count: u32, min_io_size: u32) -> Self {
        MemDevice {
            geometry: Geometry {
                eu_size,
                eu_count,
                min_io_size,
            },
            state: Mutex::new(MemState {
                units: vec![None; eu_count as usize],
                write_budget: None,
                read_faults: 0,
                writes: 0,
            }),
        }
    }

    pub fn for_config(config: &crate::config::Config) -> Self {
        let geo = Geometry::for_config(config);
        Self::new(geo.eu_size, geo.eu_count, geo.min_io_size)
    }

    /// Deep copy of the current media image, as if power was cut now
    pub fn snapshot(&self) -> MemDevice {
        let state = self.state.lock();
        MemDevice {
            geometry: self.geometry,
            state: Mutex::new(MemState {
                units: state.units.clone(),
                write_budget: None,
                read_faults: 0,
                writes: 0,
            }),
        }
    }

    /// Let `bytes` more bytes reach the media, then fail every write.
    /// The write that crosses the limit is torn.
    pub fn fail_writes_after(&self, bytes: u64) {
        self.state.lock().write_budget = Some(bytes);
    }

    pub fn clear_faults(&self) {
        let mut state = self.state.lock();
        state.write_budget = None;
        state.read_faults = 0;
    }

    /// Make the next `count` reads fail with a transient error
    pub fn inject_read_faults(&self, count: u32) {
        self.state.lock().read_faults = count;
    }

    /// Erase everything in `eu` from `offs` on
    pub fn erase_from(&self, eu: u32, offs: u32) {
        let mut state = self.state.lock();
        if let Some(Some(unit)) = state.units.get_mut(eu as usize) {
            for b in unit.iter_mut().skip(offs as usize) {
                *b = ERASED_BYTE;
            }
        }
    }

    /// Flip bits of one byte
    pub fn corrupt(&self, eu: u32, offs: u32, mask: u8) {
        let eu_size = self.geometry.eu_size as usize;
        let mut state = self.state.lock();
        if let Some(slot) = state.units.get_mut(eu as usize) {
            let unit = slot.get_or_insert_with(|| vec![ERASED_BYTE; eu_size]);
            if let Some(b) = unit.get_mut(offs as usize) {
                *b ^= mask;
            }
        }
    }

    /// Copy of a unit's content
    pub fn unit(&self, eu: u32) -> Vec<u8> {
        let state = self.state.lock();
        match state.units.get(eu as usize) {
            Some(Some(unit)) => unit.clone(),
            _ => vec![ERASED_BYTE; self.geometry.eu_size as usize],
        }
    }

    /// Number of write calls that reached the media
    pub fn write_count(&self) -> u64 {
        self.state.lock().writes
    }
}

impl Device for MemDevice {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn read(&self, eu: u32, offs: u32, buf: &mut [u8]) -> Result<()> {
        self.geometry.check(eu, offs, buf.len())?;
        let mut state = self.state.lock();
        if state.read_faults > 0 {
            state.read_faults -= 1;
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected read fault",
            )));
        }
        match &state.units[eu as usize] {
            Some(unit) => buf.copy_from_slice(&unit[offs as usize..offs as usize + buf.len()]),
            None => buf.fill(ERASED_BYTE),
        }
        Ok(())
    }

    fn write(&self, eu: u32, offs: u32, data: &[u8]) -> Result<()> {
        self.geometry.check_write(eu, offs, data.len())?;
        let eu_size = self.geometry.eu_size as usize;
        let mut state = self.state.lock();

        let mut allowed = data.len();
        if let Some(budget) = state.write_budget {
            allowed = allowed.min(budget as usize);
            state.write_budget = Some(budget - allowed as u64);
        }

        let unit = state.units[eu as usize].get_or_insert_with(|| vec![ERASED_BYTE; eu_size]);
        let start = offs as usize;
        if !is_erased(&unit[start..start + data.len()]) {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("write to programmed area {}:{}", eu, offs),
            )));
        }
        unit[start..start + allowed].copy_from_slice(&data[..allowed]);
        state.writes += 1;

        if allowed < data.len() {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "simulated power cut",
            )));
        }
        Ok(())
    }

    fn unmap(&self, eu: u32) -> Result<()> {
        self.geometry.check(eu, 0, 0)?;
        let mut state = self.state.lock();
        if state.write_budget == Some(0) {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "simulated power cut",
            )));
        }
        state.units[eu as usize] = None;
        Ok(())
    }

    fn is_mapped(&self, eu: u32) -> Result<bool> {
        self.geometry.check(eu, 0, 0)?;
        Ok(self.state.lock().units[eu as usize].is_some())
    }

    fn change(&self, eu: u32, data: &[u8]) -> Result<()> {
        self.geometry.check_write(eu, 0, data.len())?;
        let eu_size = self.geometry.eu_size as usize;
        let mut state = self.state.lock();
        if state.write_budget == Some(0) {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "simulated power cut",
            )));
        }
        let mut unit = vec![ERASED_BYTE; eu_size];
        unit[..data.len()].copy_from_slice(data);
        state.units[eu as usize] = Some(unit);
        state.writes += 1;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Device backed by a regular file, one unit after another
pub struct FileDevice {
    file: Mutex<File>,
    path: PathBuf,
    geometry: Geometry,
}

impl FileDevice {
    /// Create a file holding `geometry.eu_count` erased units
    pub fn create<P: AsRef<Path>>(path: P, geometry: Geometry) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let erased = vec![ERASED_BYTE; geometry.eu_size as usize];
        for _ in 0..geometry.eu_count {
            file.write_all(&erased)?;
        }
        file.flush()?;

        Ok(FileDevice {
            file: Mutex::new(file),
            path: path.as_ref().to_path_buf(),
            geometry,
        })
    }

    /// Open an existing device file
    pub fn open<P: AsRef<Path>>(path: P, geometry: Geometry) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let expected = geometry.eu_size as u64 * geometry.eu_count as u64;
        let actual = file.metadata()?.len();
        if actual != expected {
            return Err(StorageError::InvalidArgument(format!(
                "device file is {} bytes, geometry needs {}",
                actual, expected
            )));
        }

        Ok(FileDevice {
            file: Mutex::new(file),
            path: path.as_ref().to_path_buf(),
            geometry,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn position(&self, eu: u32, offs: u32) -> u64 {
        eu as u64 * self.geometry.eu_size as u64 + offs as u64
    }
}

impl Device for FileDevice {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn read(&self, eu: u32, offs: u32, buf: &mut [u8]) -> Result<()> {
        self.geometry.check(eu, offs, buf.len())?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.position(eu, offs)))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write(&self, eu: u32, offs: u32, data: &[u8]) -> Result<()> {
        self.geometry.check_write(eu, offs, data.len())?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.position(eu, offs)))?;
        file.write_all(data)?;
        Ok(())
    }

    fn unmap(&self, eu: u32) -> Result<()> {
        self.geometry.check(eu, 0, 0)?;
        let erased = vec![ERASED_BYTE; self.geometry.eu_size as usize];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.position(eu, 0)))?;
        file.write_all(&erased)?;
        Ok(())
    }

    fn is_mapped(&self, eu: u32) -> Result<bool> {
        let mut buf = vec![0u8; self.geometry.eu_size as usize];
        self.read(eu, 0, &mut buf)?;
        Ok(!is_erased(&buf))
    }

    fn change(&self, eu: u32, data: &[u8]) -> Result<()> {
        self.geometry.check_write(eu, 0, data.len())?;
        let mut unit = vec![ERASED_BYTE; self.geometry.eu_size as usize];
        unit[..data.len()].copy_from_slice(data);
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.position(eu, 0)))?;
        file.write_all(&unit)?;
        file.sync_data()?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{DataNode, GroupFlag};
    use tempfile::NamedTempFile;

    #[test]
    fn test_mem_device_write_once() {
        let dev = MemDevice::new(1024, 4, 8);
        dev.write(1, 0, &[1u8; 16]).unwrap();
        dev.write(1, 16, &[2u8; 8]).unwrap();
        assert!(dev.write(1, 8, &[3u8; 8]).is_err());

        let mut buf = [0u8; 24];
        dev.read(1, 0, &mut buf).unwrap();
        assert_eq!(&buf[..16], &[1u8; 16]);
        assert_eq!(&buf[16..], &[2u8; 8]);

        dev.unmap(1).unwrap();
        assert!(!dev.is_mapped(1).unwrap());
        dev.write(1, 8, &[3u8; 8]).unwrap();
    }

    #[test]
    fn test_mem_device_rejects_unaligned_and_out_of_range() {
        let dev = MemDevice::new(1024, 4, 8);
        assert!(matches!(
            dev.write(0, 4, &[0u8; 8]),
            Err(StorageError::InvalidArgument(_))
        ));
        assert!(matches!(
            dev.write(4, 0, &[0u8; 8]),
            Err(StorageError::InvalidEu(4))
        ));
        let mut buf = [0u8; 16];
        assert!(dev.read(0, 1016, &mut buf).is_err());
    }

    #[test]
    fn test_power_cut_tears_write() {
        let dev = MemDevice::new(1024, 2, 8);
        dev.fail_writes_after(12);
        assert!(dev.write(0, 0, &[7u8; 24]).is_err());
        let unit = dev.unit(0);
        assert_eq!(&unit[..12], &[7u8; 12]);
        assert!(is_erased(&unit[12..]));
        assert!(dev.write(0, 24, &[7u8; 8]).is_err());
    }

    #[test]
    fn test_read_retry_absorbs_transient_faults() {
        let dev = MemDevice::new(1024, 2, 8);
        dev.write(0, 0, &[5u8; 8]).unwrap();
        dev.inject_read_faults(2);
        let mut buf = [0u8; 8];
        read_retry(&dev, 0, 0, &mut buf, 2).unwrap();
        assert_eq!(buf, [5u8; 8]);

        dev.inject_read_faults(3);
        assert!(read_retry(&dev, 0, 0, &mut buf, 2).is_err());
    }

    #[test]
    fn test_change_replaces_unit() {
        let dev = MemDevice::new(1024, 2, 8);
        dev.write(0, 0, &[1u8; 64]).unwrap();
        dev.change(0, &[2u8; 16]).unwrap();
        let unit = dev.unit(0);
        assert_eq!(&unit[..16], &[2u8; 16]);
        assert!(is_erased(&unit[16..]));
    }

    #[test]
    fn test_read_node_validates() {
        let dev = MemDevice::new(1024, 2, 8);
        let node = Node::Data(DataNode {
            key: Key::data(3, 1),
            data: vec![9; 20],
        });
        let mut bytes = node.encode(4, GroupFlag::None);
        let loc = Location::new(1, 0, bytes.len() as u32);
        bytes.resize(crate::node::align_up(bytes.len() as u32, 8) as usize, 0);
        dev.write(1, 0, &bytes).unwrap();

        let (header, decoded) = read_node(&dev, loc, Some(&Key::data(3, 1)), 0).unwrap();
        assert_eq!(header.sqnum, 4);
        assert_eq!(decoded, node);

        dev.corrupt(1, 30, 0x40);
        assert!(read_node(&dev, loc, None, 0).is_err());
    }

    #[test]
    fn test_file_device_roundtrip() {
        let tmp = NamedTempFile::new().unwrap();
        let geometry = Geometry {
            eu_size: 2048,
            eu_count: 3,
            min_io_size: 8,
        };
        let dev = FileDevice::create(tmp.path(), geometry).unwrap();
        assert!(!dev.is_mapped(2).unwrap());
        dev.write(2, 64, &[0xabu8; 32]).unwrap();
        dev.sync().unwrap();
        drop(dev);

        let dev = FileDevice::open(tmp.path(), geometry).unwrap();
        assert!(dev.is_mapped(2).unwrap());
        let mut buf = [0u8; 32];
        dev.read(2, 64, &mut buf).unwrap();
        assert_eq!(buf, [0xabu8; 32]);

        dev.unmap(2).unwrap();
        assert!(!dev.is_mapped(2).unwrap());

        let wrong = Geometry {
            eu_count: 4,
            ..geometry
        };
        assert!(FileDevice::open(tmp.path(), wrong).is_err());
    }
}
