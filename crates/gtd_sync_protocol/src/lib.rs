//! # GTD Sync Protocol
//!
//! Messages exchanged between a replica and the sync server, and the
//! length-prefixed frame that carries them.
//!
//! This crate provides:
//! - Protocol messages (Handshake, Upload, Download, Error)
//! - CBOR encoding/decoding of message bodies
//! - Blocking frame I/O over any `Read`/`Write`
//!
//! A session is one handshake followed by any number of uploads and
//! downloads, all on the same connection.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod frame;
mod messages;

pub use error::{ProtocolError, ProtocolResult};
pub use frame::{read_frame, write_frame, FRAME_HEADER_LEN, MAX_FRAME_LEN};
pub use messages::{
    DownloadRequest, DownloadResponse, ErrorResponse, HandshakeRequest, HandshakeResponse,
    SyncMessage, UploadRequest, UploadResponse, PROTOCOL_VERSION,
};
