//! # GTD Core
//!
//! The command-sourced heart of the GTD replica.
//!
//! This crate provides:
//! - [`Command`] and [`AnnotatedCommand`], the only way the document changes
//! - [`Document`], the in-memory tags and items
//! - The applier ([`apply`], [`apply_all`], [`fold`])
//! - [`DocumentModel`], lock-guarded access with change notifications
//! - [`CommandStore`], the durable log of pending and synced commands
//! - Tickler date handling ([`display_tag`])
//!
//! ## Key Invariants
//!
//! - The document equals the fold of the full ordered command history,
//!   starting from the five built-in tags and no items
//! - Re-applying a command is a no-op
//! - A malformed command is skipped, never fatal
//! - Tag counts are derived at read time, never stored
//! - The store drops a pending command only after acknowledgement

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod applier;
mod command;
mod config;
mod dir;
mod document;
mod error;
mod model;
mod notify;
mod store;
mod tickler;

pub use applier::{apply, apply_all, fold, ApplyOutcome, ApplyReport};
pub use command::{
    encode_num, generate_num, parse_num, AnnotatedCommand, Command, Mutation, Opcode, MAX_NUM,
    NUM_LEN,
};
pub use config::StoreConfig;
pub use dir::DataDir;
pub use document::{Document, Item, Tag, BUILTIN_TAGS, INBOX, REF, SOMEDAY, TICKLER, TODO};
pub use error::{CoreError, CoreResult, MalformedCommand};
pub use model::DocumentModel;
pub use notify::{Notification, NotificationFeed};
pub use store::{encode_frame, CommandStore, LogRecord, StoredCommand, LOG_MAGIC, LOG_VERSION};
pub use tickler::{deferral_date, deferred_tag, display_tag, format_date, parse_date, today};

/// Current library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
