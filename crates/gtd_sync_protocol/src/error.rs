//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors from encoding, decoding or framing messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A message body could not be encoded.
    #[error("encode error: {0}")]
    Encode(String),

    /// A message body could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// The message type byte is not known.
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    /// A frame has no message type byte.
    #[error("empty frame")]
    EmptyFrame,

    /// A frame exceeds the size limit.
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge {
        /// Announced length.
        len: usize,
        /// Limit.
        max: usize,
    },

    /// Underlying I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
