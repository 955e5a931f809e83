use thiserror::Error;

/// Error type for the storage engine.
#[derive(Error, Debug)]
pub enum StorageError {
    /// IO error.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// The checksum line at the top of a shard does not match the CRC32 of
    /// its data section.
    #[error("checksum mismatch in shard {bin}")]
    ChecksumMismatch {
        /// Bin index of the offending shard.
        bin: usize,
    },
    /// A shard file exists but has no checksum line to verify against.
    #[error("shard {bin} is empty")]
    EmptyFile {
        /// Bin index of the offending shard.
        bin: usize,
    },
    /// Recovery was attempted `MAX_RECOVERY_COUNT` times and the shard is
    /// still unreadable.
    #[error("recovery exhausted for bin {bin} after {attempts} attempts")]
    RecoveryExhausted {
        /// Bin index that could not be recovered.
        bin: usize,
        /// Number of recovery attempts made.
        attempts: u32,
    },
    /// Error with a string message.
    #[error("{0}")]
    StringError(String),
}

/// Custom result type for [`StorageError`].
pub type Result<T> = std::result::Result<T, StorageError>;
