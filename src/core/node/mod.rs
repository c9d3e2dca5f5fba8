//! Node codec
//!
//! Every record written to flash is a node: the common header followed by a
//! type-specific body. [`Node`] is a tagged enum with one variant per type,
//! and [`Node::encode`] / [`Node::decode`] are the only routines that know
//! the body layouts.

mod header;
pub mod pack;

pub use header::{
    is_erased, restamp, seal, GroupFlag, NodeHeader, NodeType, ERASED_BYTE, NODE_HEADER_SIZE,
    NODE_MAGIC, PADDING_BYTE,
};

use crate::error::{Result, StorageError};
use crate::key::{Key, KeyType, KEY_SIZE};
use pack::{BitPacker, BitUnpacker, Packer, Unpacker};

pub const INODE_NODE_SIZE: u32 = NODE_HEADER_SIZE + KEY_SIZE + 8 + 4 + 8 + 4;
pub const DATA_NODE_SIZE: u32 = NODE_HEADER_SIZE + KEY_SIZE + 4;
pub const ENTRY_NODE_SIZE: u32 = NODE_HEADER_SIZE + KEY_SIZE + 8 + 2;
pub const TRUN_NODE_SIZE: u32 = NODE_HEADER_SIZE + 24;
pub const PAD_NODE_SIZE: u32 = NODE_HEADER_SIZE + 4;
pub const IDX_NODE_SIZE: u32 = NODE_HEADER_SIZE + 4;
pub const IDX_BRANCH_SIZE: u32 = KEY_SIZE + 12;
pub const CS_NODE_SIZE: u32 = NODE_HEADER_SIZE + 8;
pub const REF_NODE_SIZE: u32 = NODE_HEADER_SIZE + 12;
pub const ORPHAN_NODE_SIZE: u32 = NODE_HEADER_SIZE + 8 + 4;
pub const MASTER_NODE_SIZE: u32 = NODE_HEADER_SIZE + 8 * 9 + 4 * 16;
pub const PNODE_SIZE: u32 = NODE_HEADER_SIZE + 4 + 8 * LEDGER_FANOUT as u32;
pub const NNODE_SIZE: u32 = NODE_HEADER_SIZE + 4 + 12 * LEDGER_FANOUT as u32;

/// Smallest write worth keeping space for
pub const MIN_WRITE_SIZE: u32 = DATA_NODE_SIZE + 8;

/// Children per ledger node
pub const LEDGER_FANOUT: usize = 4;

pub const MAX_NAME_LEN: usize = 255;
pub const MAX_INLINE_DATA: usize = 256;

/// Master flag: mounted read-write and not yet cleanly unmounted
pub const MST_DIRTY: u32 = 0x1;
/// Master flag: written by recovery
pub const MST_RECOVERY: u32 = 0x2;

/// Round `value` up to a power-of-two `align`
pub const fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}

/// Where a node lives on flash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Location {
    pub eu: u32,
    pub offs: u32,
    pub len: u32,
}

impl Location {
    pub fn new(eu: u32, offs: u32, len: u32) -> Self {
        Location { eu, offs, len }
    }

    /// Length rounded to node alignment, as accounted in the ledger
    pub fn aligned_len(&self) -> u32 {
        align_up(self.len, 8)
    }

    fn pack(p: &mut Packer, loc: Option<Location>) {
        let loc = loc.unwrap_or(Location::new(0, 0, 0));
        p.u32(loc.eu).u32(loc.offs).u32(loc.len);
    }

    fn unpack(u: &mut Unpacker<'_>) -> Result<Option<Location>> {
        let loc = Location::new(u.u32()?, u.u32()?, u.u32()?);
        Ok(if loc.len == 0 { None } else { Some(loc) })
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}+{}", self.eu, self.offs, self.len)
    }
}

/// Per-unit space properties as stored in ledger leaves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EuProps {
    pub free: u32,
    pub dirty: u32,
    pub flags: u8,
}

impl EuProps {
    fn pack(&self) -> u64 {
        BitPacker::new()
            .push((self.free / 8) as u64, 26)
            .push((self.dirty / 8) as u64, 26)
            .push(self.flags as u64, 4)
            .finish()
    }

    fn unpack(word: u64) -> Self {
        let mut un = BitUnpacker::new(word);
        let free = (un.take(26) as u32) * 8;
        let dirty = (un.take(26) as u32) * 8;
        let flags = un.take(4) as u8;
        EuProps { free, dirty, flags }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeNode {
    pub key: Key,
    pub size: u64,
    pub nlink: u32,
    pub mode: u32,
    pub flags: u16,
    pub xattr_count: u16,
    pub data: Vec<u8>,
}

impl InodeNode {
    pub fn new(inum: u64, mode: u32) -> Self {
        InodeNode {
            key: Key::inode(inum),
            size: 0,
            nlink: 1,
            mode,
            flags: 0,
            xattr_count: 0,
            data: Vec::new(),
        }
    }

    pub fn inum(&self) -> u64 {
        self.key.inum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataNode {
    pub key: Key,
    pub data: Vec<u8>,
}

/// Directory or extended-attribute entry; `target == 0` records a deletion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryNode {
    pub key: Key,
    pub target: u64,
    pub dtype: u8,
    pub name: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TruncNode {
    pub inum: u64,
    pub old_size: u64,
    pub new_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PadNode {
    /// Bytes after this node that belong to the padding
    pub pad_len: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdxBranch {
    pub key: Key,
    pub loc: Location,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdxNode {
    pub level: u16,
    pub branches: Vec<IdxBranch>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitStartNode {
    pub cmt_no: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefNode {
    pub eu: u32,
    pub offs: u32,
    pub jhead: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanNode {
    pub cmt_no: u64,
    pub last: bool,
    pub inums: Vec<u64>,
}

/// Root of trust
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MasterNode {
    pub cmt_no: u64,
    pub flags: u32,
    pub highest_inum: u64,
    /// Sequence number of the commit-start node of this commit
    pub cs_sqnum: u64,
    pub log_eu: u32,
    pub root: Option<Location>,
    pub idx_size: u64,
    pub ihead_eu: u32,
    pub ihead_offs: u32,
    pub gc_eu: u32,
    pub ledger_root: Option<Location>,
    pub ledger_eu: u32,
    pub ledger_offs: u32,
    pub main_eus: u32,
    pub empty_eus: u32,
    pub idx_eus: u32,
    pub total_free: u64,
    pub total_dirty: u64,
    pub total_used: u64,
    pub total_dead: u64,
    pub total_dark: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PnodeNode {
    pub num: u32,
    pub props: [EuProps; LEDGER_FANOUT],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NnodeNode {
    pub num: u32,
    pub children: [Option<Location>; LEDGER_FANOUT],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Inode(InodeNode),
    Data(DataNode),
    Dent(EntryNode),
    Xent(EntryNode),
    Trun(TruncNode),
    Pad(PadNode),
    Idx(IdxNode),
    CommitStart(CommitStartNode),
    Ref(RefNode),
    Orphan(OrphanNode),
    Master(MasterNode),
    Pnode(PnodeNode),
    Nnode(NnodeNode),
}

impl Node {
    pub fn node_type(&self) -> NodeType {
        match self {
            Node::Inode(_) => NodeType::Inode,
            Node::Data(_) => NodeType::Data,
            Node::Dent(_) => NodeType::Dent,
            Node::Xent(_) => NodeType::Xent,
            Node::Trun(_) => NodeType::Trun,
            Node::Pad(_) => NodeType::Pad,
            Node::Idx(_) => NodeType::Idx,
            Node::CommitStart(_) => NodeType::CommitStart,
            Node::Ref(_) => NodeType::Ref,
            Node::Orphan(_) => NodeType::Orphan,
            Node::Master(_) => NodeType::Master,
            Node::Pnode(_) => NodeType::Pnode,
            Node::Nnode(_) => NodeType::Nnode,
        }
    }

    /// Index key of a leaf node
    pub fn key(&self) -> Option<Key> {
        match self {
            Node::Inode(n) => Some(n.key),
            Node::Data(n) => Some(n.key),
            Node::Dent(n) | Node::Xent(n) => Some(n.key),
            _ => None,
        }
    }

    /// Entry name of a directory or attribute entry
    pub fn name(&self) -> Option<&[u8]> {
        match self {
            Node::Dent(n) | Node::Xent(n) => Some(&n.name),
            _ => None,
        }
    }

    /// Unaligned encoded length
    pub fn encoded_len(&self) -> u32 {
        match self {
            Node::Inode(n) => INODE_NODE_SIZE + n.data.len() as u32,
            Node::Data(n) => DATA_NODE_SIZE + n.data.len() as u32,
            Node::Dent(n) | Node::Xent(n) => ENTRY_NODE_SIZE + n.name.len() as u32,
            Node::Trun(_) => TRUN_NODE_SIZE,
            Node::Pad(_) => PAD_NODE_SIZE,
            Node::Idx(n) => IDX_NODE_SIZE + n.branches.len() as u32 * IDX_BRANCH_SIZE,
            Node::CommitStart(_) => CS_NODE_SIZE,
            Node::Ref(_) => REF_NODE_SIZE,
            Node::Orphan(n) => ORPHAN_NODE_SIZE + n.inums.len() as u32 * 8,
            Node::Master(_) => MASTER_NODE_SIZE,
            Node::Pnode(_) => PNODE_SIZE,
            Node::Nnode(_) => NNODE_SIZE,
        }
    }

    /// Serialize with header, length and crc
    pub fn encode(&self, sqnum: u64, group: GroupFlag) -> Vec<u8> {
        let header = NodeHeader {
            crc: 0,
            sqnum,
            len: 0,
            node_type: self.node_type(),
            group,
        };
        let mut p = Packer::with_capacity(self.encoded_len() as usize);
        p.bytes(&header.to_bytes());
        self.encode_body(&mut p);
        let mut bytes = p.into_inner();
        debug_assert_eq!(bytes.len() as u32, self.encoded_len());
        seal(&mut bytes);
        bytes
    }

    fn encode_body(&self, p: &mut Packer) {
        match self {
            Node::Inode(n) => {
                let packed = BitPacker::new()
                    .push(n.nlink as u64, 32)
                    .push(n.flags as u64, 16)
                    .push(n.xattr_count as u64, 16)
                    .finish();
                p.key(&n.key)
                    .u64(n.size)
                    .u32(n.mode)
                    .u64(packed)
                    .u32(n.data.len() as u32)
                    .bytes(&n.data);
            }
            Node::Data(n) => {
                p.key(&n.key).u32(n.data.len() as u32).bytes(&n.data);
            }
            Node::Dent(n) | Node::Xent(n) => {
                let packed = BitPacker::new()
                    .push(n.dtype as u64 & 0xf, 4)
                    .push(n.name.len() as u64, 12)
                    .finish() as u16;
                p.key(&n.key).u64(n.target).u16(packed).bytes(&n.name);
            }
            Node::Trun(n) => {
                p.u64(n.inum).u64(n.old_size).u64(n.new_size);
            }
            Node::Pad(n) => {
                p.u32(n.pad_len);
            }
            Node::Idx(n) => {
                p.u16(n.level).u16(n.branches.len() as u16);
                for br in &n.branches {
                    p.key(&br.key);
                    Location::pack(p, Some(br.loc));
                }
            }
            Node::CommitStart(n) => {
                p.u64(n.cmt_no);
            }
            Node::Ref(n) => {
                p.u32(n.eu).u32(n.offs).u32(n.jhead);
            }
            Node::Orphan(n) => {
                let packed = BitPacker::new()
                    .push(n.cmt_no & (u64::MAX >> 1), 63)
                    .push(n.last as u64, 1)
                    .finish();
                p.u64(packed).u32(n.inums.len() as u32);
                for inum in &n.inums {
                    p.u64(*inum);
                }
            }
            Node::Master(m) => {
                p.u64(m.cmt_no)
                    .u32(m.flags)
                    .u64(m.highest_inum)
                    .u64(m.cs_sqnum)
                    .u32(m.log_eu);
                Location::pack(p, m.root);
                p.u64(m.idx_size)
                    .u32(m.ihead_eu)
                    .u32(m.ihead_offs)
                    .u32(m.gc_eu);
                Location::pack(p, m.ledger_root);
                p.u32(m.ledger_eu)
                    .u32(m.ledger_offs)
                    .u32(m.main_eus)
                    .u32(m.empty_eus)
                    .u32(m.idx_eus)
                    .u64(m.total_free)
                    .u64(m.total_dirty)
                    .u64(m.total_used)
                    .u64(m.total_dead)
                    .u64(m.total_dark);
            }
            Node::Pnode(n) => {
                p.u32(n.num);
                for props in &n.props {
                    p.u64(props.pack());
                }
            }
            Node::Nnode(n) => {
                p.u32(n.num);
                for child in &n.children {
                    Location::pack(p, *child);
                }
            }
        }
    }

    /// Parse, check and decode one node starting at `bytes[0]`
    pub fn decode(bytes: &[u8], eu: u32, offs: u32) -> Result<(NodeHeader, Node)> {
        let header = NodeHeader::parse(bytes, eu, offs)?;
        header.verify(bytes, eu, offs)?;
        let body = &bytes[NODE_HEADER_SIZE as usize..header.len as usize];
        let mut u = Unpacker::new(body, eu, offs);
        let node = Self::decode_body(header.node_type, &mut u)?;
        if u.remaining() != 0 {
            return Err(u.corrupt(format!("{} trailing bytes in node body", u.remaining())));
        }
        Ok((header, node))
    }

    fn decode_body(node_type: NodeType, u: &mut Unpacker<'_>) -> Result<Node> {
        let node = match node_type {
            NodeType::Inode => {
                let key = u.key()?;
                if key.kind() != KeyType::Inode {
                    return Err(u.corrupt("inode node with non-inode key"));
                }
                let size = u.u64()?;
                let mode = u.u32()?;
                let mut un = BitUnpacker::new(u.u64()?);
                let nlink = un.take(32) as u32;
                let flags = un.take(16) as u16;
                let xattr_count = un.take(16) as u16;
                let len = u.u32()? as usize;
                if len > MAX_INLINE_DATA {
                    return Err(u.corrupt(format!("inline data of {} bytes", len)));
                }
                Node::Inode(InodeNode {
                    key,
                    size,
                    nlink,
                    mode,
                    flags,
                    xattr_count,
                    data: u.bytes(len)?,
                })
            }
            NodeType::Data => {
                let key = u.key()?;
                if key.kind() != KeyType::Data {
                    return Err(u.corrupt("data node with non-data key"));
                }
                let len = u.u32()? as usize;
                Node::Data(DataNode {
                    key,
                    data: u.bytes(len)?,
                })
            }
            NodeType::Dent | NodeType::Xent => {
                let key = u.key()?;
                let expected = if node_type == NodeType::Dent {
                    KeyType::Dent
                } else {
                    KeyType::Xent
                };
                if key.kind() != expected {
                    return Err(u.corrupt("entry node key type mismatch"));
                }
                let target = u.u64()?;
                let mut un = BitUnpacker::new(u.u16()? as u64);
                let dtype = un.take(4) as u8;
                let nlen = un.take(12) as usize;
                if nlen == 0 || nlen > MAX_NAME_LEN {
                    return Err(u.corrupt(format!("bad name length {}", nlen)));
                }
                let entry = EntryNode {
                    key,
                    target,
                    dtype,
                    name: u.bytes(nlen)?,
                };
                if node_type == NodeType::Dent {
                    Node::Dent(entry)
                } else {
                    Node::Xent(entry)
                }
            }
            NodeType::Trun => Node::Trun(TruncNode {
                inum: u.u64()?,
                old_size: u.u64()?,
                new_size: u.u64()?,
            }),
            NodeType::Pad => Node::Pad(PadNode { pad_len: u.u32()? }),
            NodeType::Idx => {
                let level = u.u16()?;
                let count = u.u16()? as usize;
                if count as u32 * IDX_BRANCH_SIZE != u.remaining() as u32 {
                    return Err(u.corrupt(format!("bad branch count {}", count)));
                }
                let mut branches = Vec::with_capacity(count);
                for _ in 0..count {
                    let key = u.key()?;
                    let loc = Location::unpack(u)?
                        .ok_or_else(|| u.corrupt("index branch without location"))?;
                    branches.push(IdxBranch { key, loc });
                }
                Node::Idx(IdxNode { level, branches })
            }
            NodeType::CommitStart => Node::CommitStart(CommitStartNode { cmt_no: u.u64()? }),
            NodeType::Ref => Node::Ref(RefNode {
                eu: u.u32()?,
                offs: u.u32()?,
                jhead: u.u32()?,
            }),
            NodeType::Orphan => {
                let mut un = BitUnpacker::new(u.u64()?);
                let cmt_no = un.take(63);
                let last = un.take(1) == 1;
                let count = u.u32()? as usize;
                if count * 8 != u.remaining() {
                    return Err(u.corrupt(format!("bad orphan count {}", count)));
                }
                let mut inums = Vec::with_capacity(count);
                for _ in 0..count {
                    inums.push(u.u64()?);
                }
                Node::Orphan(OrphanNode {
                    cmt_no,
                    last,
                    inums,
                })
            }
            NodeType::Master => {
                let cmt_no = u.u64()?;
                let flags = u.u32()?;
                let highest_inum = u.u64()?;
                let cs_sqnum = u.u64()?;
                let log_eu = u.u32()?;
                let root = Location::unpack(u)?;
                let idx_size = u.u64()?;
                let ihead_eu = u.u32()?;
                let ihead_offs = u.u32()?;
                let gc_eu = u.u32()?;
                let ledger_root = Location::unpack(u)?;
                Node::Master(MasterNode {
                    cmt_no,
                    flags,
                    highest_inum,
                    cs_sqnum,
                    log_eu,
                    root,
                    idx_size,
                    ihead_eu,
                    ihead_offs,
                    gc_eu,
                    ledger_root,
                    ledger_eu: u.u32()?,
                    ledger_offs: u.u32()?,
                    main_eus: u.u32()?,
                    empty_eus: u.u32()?,
                    idx_eus: u.u32()?,
                    total_free: u.u64()?,
                    total_dirty: u.u64()?,
                    total_used: u.u64()?,
                    total_dead: u.u64()?,
                    total_dark: u.u64()?,
                })
            }
            NodeType::Pnode => {
                let num = u.u32()?;
                let mut props = [EuProps::default(); LEDGER_FANOUT];
                for slot in props.iter_mut() {
                    *slot = EuProps::unpack(u.u64()?);
                }
                Node::Pnode(PnodeNode { num, props })
            }
            NodeType::Nnode => {
                let num = u.u32()?;
                let mut children = [None; LEDGER_FANOUT];
                for slot in children.iter_mut() {
                    *slot = Location::unpack(u)?;
                }
                Node::Nnode(NnodeNode { num, children })
            }
        };
        Ok(node)
    }
}

/// Decode a node and check it is the one the index expects at `loc`
pub fn decode_at(bytes: &[u8], loc: Location, expected: Option<&Key>) -> Result<(NodeHeader, Node)> {
    let (header, node) = Node::decode(bytes, loc.eu, loc.offs)?;
    if header.len != loc.len {
        return Err(StorageError::corrupt(
            loc.eu,
            loc.offs,
            format!("node length {} but index says {}", header.len, loc.len),
        ));
    }
    if let Some(expected) = expected {
        match node.key() {
            Some(found) if found == *expected => {}
            Some(found) => {
                return Err(StorageError::KeyMismatch {
                    eu: loc.eu,
                    offs: loc.offs,
                    expected: expected.to_string(),
                    found: found.to_string(),
                })
            }
            None => {
                return Err(StorageError::corrupt(
                    loc.eu,
                    loc.offs,
                    format!("expected leaf node, found {:?}", header.node_type),
                ))
            }
        }
    }
    Ok((header, node))
}
