//! Server-side command log.

use gtd_core::{AnnotatedCommand, Command};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

/// A command with the server cursor it was accepted at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedCommand {
    /// Server cursor, starting at 1.
    pub cursor: u64,
    /// The command as uploaded.
    pub command: Command,
}

/// One page of commands for a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// Commands from other origins, in cursor order.
    pub commands: Vec<Command>,
    /// Cursor to resume after.
    pub new_cursor: u64,
    /// Whether more deliverable commands follow.
    pub has_more: bool,
}

#[derive(Debug, Default)]
struct LogState {
    entries: Vec<LoggedCommand>,
    seen: HashSet<(u64, u64)>,
    highest: HashMap<u64, u64>,
}

/// Server-side command log.
///
/// The log maintains:
/// - All accepted commands in cursor order
/// - The set of `(origin, sequence)` pairs already held, so re-uploads
///   are dropped
/// - The highest sequence id held per origin, returned as the upload
///   acknowledgement
#[derive(Debug, Default)]
pub struct ServerCommandLog {
    state: RwLock<LogState>,
}

impl ServerCommandLog {
    /// Creates a new empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cursor of the newest command; 0 when empty.
    pub fn cursor(&self) -> u64 {
        self.state.read().entries.last().map_or(0, |e| e.cursor)
    }

    /// Appends commands uploaded by `origin_id`.
    ///
    /// Commands already held are skipped. Returns the highest sequence id
    /// now held for the origin.
    pub fn append(&self, origin_id: u64, commands: &[AnnotatedCommand]) -> u64 {
        let mut state = self.state.write();
        let mut next = state.entries.last().map_or(0, |e| e.cursor) + 1;
        let mut accepted = 0usize;

        for entry in commands {
            let command = &entry.command;
            if !state.seen.insert((command.origin_id, command.sequence_id)) {
                continue;
            }
            let highest = state.highest.entry(command.origin_id).or_insert(0);
            *highest = (*highest).max(command.sequence_id);
            state.entries.push(LoggedCommand {
                cursor: next,
                command: command.clone(),
            });
            next += 1;
            accepted += 1;
        }

        let acknowledged = state.highest.get(&origin_id).copied().unwrap_or(0);
        tracing::debug!(
            origin_id,
            received = commands.len(),
            accepted,
            acknowledged,
            "Upload stored"
        );
        acknowledged
    }

    /// Commands from origins other than `exclude_origin` after `cursor`.
    ///
    /// At most `limit` commands are returned. The new cursor also moves
    /// past skipped commands of the excluded origin.
    pub fn page(&self, cursor: u64, limit: u32, exclude_origin: u64) -> Page {
        let state = self.state.read();
        let limit = limit.max(1) as usize;
        let start = state.entries.partition_point(|e| e.cursor <= cursor);

        let mut page = Page {
            commands: Vec::new(),
            new_cursor: cursor,
            has_more: false,
        };
        for entry in &state.entries[start..] {
            if entry.command.origin_id == exclude_origin {
                page.new_cursor = entry.cursor;
                continue;
            }
            if page.commands.len() == limit {
                page.has_more = true;
                break;
            }
            page.commands.push(entry.command.clone());
            page.new_cursor = entry.cursor;
        }
        page
    }

    /// Highest sequence id held for `origin_id`.
    pub fn acknowledged(&self, origin_id: u64) -> u64 {
        self.state
            .read()
            .highest
            .get(&origin_id)
            .copied()
            .unwrap_or(0)
    }

    /// Every logged command, in cursor order.
    pub fn entries(&self) -> Vec<LoggedCommand> {
        self.state.read().entries.clone()
    }

    /// Returns the number of commands.
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    /// Returns true if the log is empty.
    pub fn is_empty(&self) -> bool {
        self.state.read().entries.is_empty()
    }
}
