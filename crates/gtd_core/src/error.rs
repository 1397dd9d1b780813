//! Error types for the GTD core.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] gtd_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The command log is corrupted in a way recovery cannot repair.
    #[error("command log corruption: {message}")]
    LogCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch detected inside the command log.
    #[error("checksum mismatch at offset {offset}: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Offset of the damaged record.
        offset: u64,
        /// Stored checksum.
        expected: u32,
        /// Computed checksum.
        actual: u32,
    },

    /// Another process holds the data directory.
    #[error("data directory locked: another process has exclusive access")]
    StoreLocked,

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a log corruption error.
    pub fn log_corruption(message: impl Into<String>) -> Self {
        Self::LogCorruption {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }
}

/// Why a command could not be decoded into a mutation.
///
/// The applier never propagates this; it logs it and moves on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedCommand {
    /// Opcode byte is not one of `d`, `D`, `t`, `T`.
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),

    /// Payload is not valid UTF-8.
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,

    /// The space between the item number and the text is missing.
    #[error("expected `<num> <text>`, got {0:?}")]
    MissingSeparator(String),

    /// The item number field is not a fixed-width decimal.
    #[error("invalid item number {0:?}")]
    InvalidNumber(String),

    /// A tag name is empty.
    #[error("empty tag name")]
    EmptyTag,
}
