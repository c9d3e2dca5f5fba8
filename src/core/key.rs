//! Index keys
//!
//! A key is `(inum, type, value)` where `value` is a block number for data
//! keys and a name hash for directory and attribute entries. On media the
//! type and value share one 32-bit word: the type in the top 3 bits, the
//! value in the low 29.

use crate::error::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::fmt;
use xxhash_rust::xxh3::xxh3_64;

/// Encoded key size in bytes
pub const KEY_SIZE: u32 = 12;

const VALUE_BITS: u32 = 29;
const VALUE_MASK: u32 = (1 << VALUE_BITS) - 1;

/// Largest block number or hash value a key can carry
pub const MAX_KEY_VALUE: u32 = VALUE_MASK;

/// Hash values below this are reserved so a scan can start below any name
const RESERVED_HASHES: u32 = 3;

/// Key types, in index sort order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum KeyType {
    Inode = 0,
    Data = 1,
    Dent = 2,
    Xent = 3,
}

impl KeyType {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(KeyType::Inode),
            1 => Ok(KeyType::Data),
            2 => Ok(KeyType::Dent),
            3 => Ok(KeyType::Xent),
            _ => Err(StorageError::InvalidKeyType(value)),
        }
    }
}

/// Name hash function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyHash {
    Xxh3,
    /// Byte sum; collides on anagrams, for exercising collision handling
    Simple,
}

impl KeyHash {
    pub fn hash(self, name: &[u8]) -> u32 {
        let raw = match self {
            KeyHash::Xxh3 => xxh3_64(name) as u32,
            KeyHash::Simple => name
                .iter()
                .fold(0u32, |acc, &b| acc.wrapping_add(b as u32)),
        };
        let value = raw & VALUE_MASK;
        if value < RESERVED_HASHES {
            value + RESERVED_HASHES
        } else {
            value
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key {
    inum: u64,
    kind: KeyType,
    value: u32,
}

impl Key {
    pub fn inode(inum: u64) -> Self {
        Key {
            inum,
            kind: KeyType::Inode,
            value: 0,
        }
    }

    pub fn data(inum: u64, block: u32) -> Self {
        Key {
            inum,
            kind: KeyType::Data,
            value: block & VALUE_MASK,
        }
    }

    pub fn dent(dir: u64, name: &[u8], hash: KeyHash) -> Self {
        Self::dent_hash(dir, hash.hash(name))
    }

    pub fn dent_hash(dir: u64, hash: u32) -> Self {
        Key {
            inum: dir,
            kind: KeyType::Dent,
            value: hash & VALUE_MASK,
        }
    }

    pub fn xent(inum: u64, name: &[u8], hash: KeyHash) -> Self {
        Self::xent_hash(inum, hash.hash(name))
    }

    pub fn xent_hash(inum: u64, hash: u32) -> Self {
        Key {
            inum,
            kind: KeyType::Xent,
            value: hash & VALUE_MASK,
        }
    }

    /// Smallest key belonging to `inum`
    pub fn lowest(inum: u64) -> Self {
        Self::inode(inum)
    }

    /// Largest key belonging to `inum`
    pub fn highest(inum: u64) -> Self {
        Key {
            inum,
            kind: KeyType::Xent,
            value: MAX_KEY_VALUE,
        }
    }

    /// Key that sorts below every real name hash of the same type
    pub fn first_of(&self) -> Self {
        Key {
            value: 0,
            ..*self
        }
    }

    pub fn inum(&self) -> u64 {
        self.inum
    }

    pub fn kind(&self) -> KeyType {
        self.kind
    }

    pub fn block(&self) -> u32 {
        self.value
    }

    pub fn hash(&self) -> u32 {
        self.value
    }

    /// Directory and attribute entries share keys on hash collisions
    pub fn is_hashed(&self) -> bool {
        matches!(self.kind, KeyType::Dent | KeyType::Xent)
    }

    /// Type and value packed into one word
    pub fn packed(&self) -> u32 {
        ((self.kind as u32) << VALUE_BITS) | (self.value & VALUE_MASK)
    }

    pub fn to_bytes(&self) -> [u8; KEY_SIZE as usize] {
        let mut bytes = [0u8; KEY_SIZE as usize];
        bytes[0..8].copy_from_slice(&self.inum.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.packed().to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < KEY_SIZE as usize {
            return Err(StorageError::InvalidArgument(format!(
                "key needs {} bytes, got {}",
                KEY_SIZE,
                bytes.len()
            )));
        }
        let mut inum = [0u8; 8];
        inum.copy_from_slice(&bytes[0..8]);
        let mut word = [0u8; 4];
        word.copy_from_slice(&bytes[8..12]);
        let packed = u32::from_le_bytes(word);

        Ok(Key {
            inum: u64::from_le_bytes(inum),
            kind: KeyType::from_u8((packed >> VALUE_BITS) as u8)?,
            value: packed & VALUE_MASK,
        })
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            KeyType::Inode => write!(f, "({}, inode)", self.inum),
            KeyType::Data => write!(f, "({}, data, {})", self.inum, self.value),
            KeyType::Dent => write!(f, "({}, dent, {:#x})", self.inum, self.value),
            KeyType::Xent => write!(f, "({}, xent, {:#x})", self.inum, self.value),
        }
    }
}
