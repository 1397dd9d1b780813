//! # GTD Storage
//!
//! Append-only byte stores underneath the GTD command log.
//!
//! Backends are **opaque**: they never interpret the bytes they hold. The
//! record framing, checksums and recovery rules all live in `gtd_core`.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For tests and throwaway replicas
//! - [`FileBackend`] - For the on-disk command log
//!
//! ## Example
//!
//! ```rust
//! use gtd_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"t00000042 Buy milk").unwrap();
//! let data = backend.read_at(offset, 18).unwrap();
//! assert_eq!(&data, b"t00000042 Buy milk");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
