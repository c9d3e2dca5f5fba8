use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Invalid magic number in node header at {eu}:{offs}")]
    InvalidMagic { eu: u32, offs: u32 },

    #[error("Node checksum verification failed at {eu}:{offs}")]
    ChecksumMismatch { eu: u32, offs: u32 },

    #[error("Invalid node type: {0}")]
    InvalidNodeType(u8),

    #[error("Invalid key type: {0}")]
    InvalidKeyType(u8),

    #[error("Corrupted node at {eu}:{offs}: {reason}")]
    Corrupt { eu: u32, offs: u32, reason: String },

    #[error("Key mismatch at {eu}:{offs}: expected {expected}, found {found}")]
    KeyMismatch {
        eu: u32,
        offs: u32,
        expected: String,
        found: String,
    },

    #[error("No space left on device")]
    NoSpace,

    #[error("Out of memory: shadow node limit of {0} reached")]
    NoMemory(usize),

    #[error("Storage is read-only")]
    ReadOnly,

    #[error("Invalid erasable unit: {0}")]
    InvalidEu(u32),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal invariant violated: {0}")]
    Internal(String),
}

impl StorageError {
    pub fn corrupt(eu: u32, offs: u32, reason: impl Into<String>) -> Self {
        StorageError::Corrupt {
            eu,
            offs,
            reason: reason.into(),
        }
    }

    /// Errors that mean the media no longer matches what the index believes.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StorageError::InvalidMagic { .. }
                | StorageError::ChecksumMismatch { .. }
                | StorageError::InvalidNodeType(_)
                | StorageError::InvalidKeyType(_)
                | StorageError::Corrupt { .. }
                | StorageError::KeyMismatch { .. }
        )
    }

    /// Errors after which the engine must stop accepting mutations.
    pub fn is_fatal(&self) -> bool {
        self.is_corruption() || matches!(self, StorageError::Internal(_))
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Result of a recovery-path scan or repair.
///
/// Corruption found while mounting is often the expected footprint of a
/// power cut, so the recovery path reports it as a value instead of an error.
/// Only [`RecoveryOutcome::Corrupted`] is fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Nothing to repair.
    Clean,
    /// A torn write was found at the end of a unit; everything from
    /// `valid_end` on was discarded.
    TruncatedTail { eu: u32, valid_end: u32, dropped: u32 },
    /// The two master copies disagreed and `slot` was used to rewrite both.
    MasterRepaired { slot: u8 },
    /// Damage that an interrupted write cannot explain.
    Corrupted { eu: u32, offs: u32, reason: String },
}

impl RecoveryOutcome {
    pub fn is_clean(&self) -> bool {
        matches!(self, RecoveryOutcome::Clean)
    }

    /// Convert into the normal-path result, failing on real corruption.
    pub fn into_result(self) -> Result<RecoveryOutcome> {
        match self {
            RecoveryOutcome::Corrupted { eu, offs, reason } => {
                Err(StorageError::Corrupt { eu, offs, reason })
            }
            other => Ok(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corruption_classification() {
        assert!(StorageError::corrupt(3, 16, "bad branch count").is_fatal());
        assert!(StorageError::ChecksumMismatch { eu: 1, offs: 0 }.is_corruption());
        assert!(!StorageError::NoSpace.is_fatal());
        assert!(!StorageError::ReadOnly.is_corruption());
    }

    #[test]
    fn test_recovery_outcome_into_result() {
        let ok = RecoveryOutcome::TruncatedTail {
            eu: 7,
            valid_end: 128,
            dropped: 40,
        };
        assert_eq!(ok.clone().into_result().unwrap(), ok);

        let bad = RecoveryOutcome::Corrupted {
            eu: 7,
            offs: 64,
            reason: "node in the middle of a bud".into(),
        };
        match bad.into_result() {
            Err(StorageError::Corrupt { eu, offs, .. }) => {
                assert_eq!((eu, offs), (7, 64));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
