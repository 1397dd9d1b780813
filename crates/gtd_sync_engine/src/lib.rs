//! # GTD Sync Engine
//!
//! Client side of GTD synchronization.
//!
//! This crate provides:
//! - Sync state machine (idle → connecting → uploading → downloading → applying)
//! - A TLS channel that trusts exactly one pinned server certificate
//! - Retry with exponential backoff
//! - Transport abstraction with a scripted mock
//! - [`GtdService`], the replica that ties document, store and engine together
//!
//! ## Round
//!
//! 1. Handshake: protocol version and credentials, yielding a session token
//! 2. Upload every pending local command
//! 3. Download remote commands page by page from the stored cursor
//! 4. Apply the downloaded batch, then advance the ack mark and the cursor
//!
//! ## Key Invariants
//!
//! - Nothing is acknowledged until the downloaded batch has been applied
//! - Acknowledgements never exceed the highest sequence id uploaded
//! - The download cursor never moves backwards
//! - Commands carrying this replica's origin are never re-applied

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod channel;
mod config;
mod error;
mod remote;
mod service;
mod state;
mod transport;

pub use channel::{client_config, CertificatePolicy, PinnedCertificate, SecureChannel};
pub use config::{ClientSettings, RetryConfig, RetrySettings, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use remote::ChannelTransport;
pub use service::GtdService;
pub use state::{
    ReplicaApplier, SyncApplier, SyncCycleResult, SyncEngine, SyncState, SyncStats,
};
pub use transport::{MockTransport, SyncTransport};
