use crate::error::{Result, StorageError};

/// Magic number opening every node
pub const NODE_MAGIC: u32 = 0x0F1A_5E11;

/// Common header size in bytes
///
/// Layout: magic(4) crc(4) sqnum(8) len(4) type(1) group(1) reserved(2)
pub const NODE_HEADER_SIZE: u32 = 24;

/// Byte used to fill gaps too small for a padding node
pub const PADDING_BYTE: u8 = 0xCE;

/// Content of erased flash
pub const ERASED_BYTE: u8 = 0xFF;

/// CRC coverage starts right after the crc field
const CRC_START: usize = 8;

/// Node types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NodeType {
    Inode = 0,
    Data = 1,
    Dent = 2,
    Xent = 3,
    Trun = 4,
    Pad = 5,
    Idx = 6,
    CommitStart = 7,
    Ref = 8,
    Orphan = 9,
    Master = 10,
    Pnode = 11,
    Nnode = 12,
}

impl NodeType {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(NodeType::Inode),
            1 => Ok(NodeType::Data),
            2 => Ok(NodeType::Dent),
            3 => Ok(NodeType::Xent),
            4 => Ok(NodeType::Trun),
            5 => Ok(NodeType::Pad),
            6 => Ok(NodeType::Idx),
            7 => Ok(NodeType::CommitStart),
            8 => Ok(NodeType::Ref),
            9 => Ok(NodeType::Orphan),
            10 => Ok(NodeType::Master),
            11 => Ok(NodeType::Pnode),
            12 => Ok(NodeType::Nnode),
            _ => Err(StorageError::InvalidNodeType(value)),
        }
    }

    /// Types that may appear in a journal bud
    pub fn is_journal(self) -> bool {
        matches!(
            self,
            NodeType::Inode
                | NodeType::Data
                | NodeType::Dent
                | NodeType::Xent
                | NodeType::Trun
                | NodeType::Pad
        )
    }
}

/// Position of a node within a multi-node group write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GroupFlag {
    None = 0,
    InGroup = 1,
    LastOfGroup = 2,
}

impl GroupFlag {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(GroupFlag::None),
            1 => Some(GroupFlag::InGroup),
            2 => Some(GroupFlag::LastOfGroup),
            _ => None,
        }
    }
}

/// Common node header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHeader {
    pub crc: u32,
    pub sqnum: u64,
    pub len: u32,
    pub node_type: NodeType,
    pub group: GroupFlag,
}

impl NodeHeader {
    /// Serialize with a zero crc; [`seal`] fills it in once the body is appended
    pub fn to_bytes(&self) -> [u8; NODE_HEADER_SIZE as usize] {
        let mut bytes = [0u8; NODE_HEADER_SIZE as usize];
        bytes[0..4].copy_from_slice(&NODE_MAGIC.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.crc.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.sqnum.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.len.to_le_bytes());
        bytes[20] = self.node_type as u8;
        bytes[21] = self.group as u8;
        bytes
    }

    /// Parse and sanity-check a header without verifying the crc
    pub fn parse(bytes: &[u8], eu: u32, offs: u32) -> Result<Self> {
        if bytes.len() < NODE_HEADER_SIZE as usize {
            return Err(StorageError::corrupt(eu, offs, "truncated node header"));
        }

        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != NODE_MAGIC {
            return Err(StorageError::InvalidMagic { eu, offs });
        }

        let crc = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let mut sq = [0u8; 8];
        sq.copy_from_slice(&bytes[8..16]);
        let len = u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
        let node_type = NodeType::from_u8(bytes[20])?;
        let group = GroupFlag::from_u8(bytes[21])
            .ok_or_else(|| StorageError::corrupt(eu, offs, "bad group flag"))?;

        if len < NODE_HEADER_SIZE {
            return Err(StorageError::corrupt(
                eu,
                offs,
                format!("node length {} shorter than header", len),
            ));
        }

        Ok(NodeHeader {
            crc,
            sqnum: u64::from_le_bytes(sq),
            len,
            node_type,
            group,
        })
    }

    /// Verify the crc over `bytes[..len]`
    pub fn verify(&self, bytes: &[u8], eu: u32, offs: u32) -> Result<()> {
        let len = self.len as usize;
        if bytes.len() < len {
            return Err(StorageError::corrupt(
                eu,
                offs,
                format!("node of {} bytes runs past available {}", len, bytes.len()),
            ));
        }
        if crc32fast::hash(&bytes[CRC_START..len]) != self.crc {
            return Err(StorageError::ChecksumMismatch { eu, offs });
        }
        Ok(())
    }
}

/// Write the length and crc of a fully assembled node in place
pub fn seal(node: &mut [u8]) {
    let len = node.len() as u32;
    node[16..20].copy_from_slice(&len.to_le_bytes());
    let crc = crc32fast::hash(&node[CRC_START..]);
    node[4..8].copy_from_slice(&crc.to_le_bytes());
}

/// Update the sequence number of an encoded node and reseal it
pub fn restamp(node: &mut [u8], sqnum: u64, group: GroupFlag) {
    node[8..16].copy_from_slice(&sqnum.to_le_bytes());
    node[21] = group as u8;
    seal(node);
}

/// True when every byte looks erased
pub fn is_erased(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| b == ERASED_BYTE)
}
