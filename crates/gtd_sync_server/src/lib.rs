//! # GTD Sync Server
//!
//! Reference sync server for GTD replicas.
//!
//! This crate provides:
//! - A TLS listener speaking the framed sync protocol
//! - A server command log with per-client delivery
//! - Username/password accounts and HMAC-SHA256 session tokens
//!
//! # Architecture
//!
//! The server keeps one command log shared by all accounts. Every accepted
//! command gets a server cursor. A client downloads everything after its
//! cursor that came from other origins; its own commands are never sent
//! back.
//!
//! # Protocol
//!
//! 1. Client handshakes with origin id and credentials, receiving a token
//! 2. Client uploads its pending commands; the server acknowledges the
//!    highest sequence id it holds for that origin
//! 3. Client downloads pages after its cursor until `has_more` is false
//!
//! Re-uploads are harmless: commands are de-duplicated by
//! `(origin, sequence_id)`.

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

mod auth;
mod config;
mod error;
mod handler;
mod oplog;
mod server;

pub use auth::{CredentialStore, TokenValidator};
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::{ClientSession, HandlerContext, RequestHandler};
pub use oplog::{LoggedCommand, Page, ServerCommandLog};
pub use server::{SyncServer, TlsIdentity};
