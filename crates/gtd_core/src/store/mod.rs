//! The durable command log.
//!
//! Every command the replica has seen, local or remote, is appended here in
//! the order it was applied. Local commands stay pending until the server
//! acknowledges them; the log also remembers how far the replica has
//! downloaded from the server.
//!
//! A batch of commands is written as one framed record, so a crash leaves
//! either the whole batch or none of it.

mod record;

pub use record::{encode_frame, LogRecord, LOG_MAGIC, LOG_VERSION};

use crate::command::{AnnotatedCommand, Command};
use crate::config::StoreConfig;
use crate::error::{CoreError, CoreResult};
use gtd_storage::{FileBackend, InMemoryBackend, StorageBackend};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::Path;

/// A command as held by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCommand {
    /// Append order, starting at 1.
    pub position: u64,
    /// The command and its sync flags.
    pub entry: AnnotatedCommand,
    /// True for commands created by this replica.
    pub local: bool,
}

impl StoredCommand {
    /// Local and not yet acknowledged.
    pub fn is_pending(&self) -> bool {
        self.local && !self.entry.acknowledged
    }
}

struct StoreState {
    backend: Box<dyn StorageBackend>,
    origin_id: u64,
    next_sequence_id: u64,
    ack_mark: u64,
    download_cursor: u64,
    commands: Vec<StoredCommand>,
    seen: HashSet<(u64, u64)>,
}

impl StoreState {
    fn empty(backend: Box<dyn StorageBackend>) -> Self {
        Self {
            backend,
            origin_id: 0,
            next_sequence_id: 1,
            ack_mark: 0,
            download_cursor: 0,
            commands: Vec::new(),
            seen: HashSet::new(),
        }
    }

    fn replay(&mut self, record: LogRecord) {
        match record {
            LogRecord::Origin { origin_id } => self.origin_id = origin_id,
            LogRecord::Batch { pending, commands } => self.push(commands, pending),
            LogRecord::Acknowledge { up_to } => self.mark_acknowledged(up_to),
            LogRecord::Cursor { cursor } => self.download_cursor = cursor,
        }
    }

    fn push(&mut self, commands: Vec<AnnotatedCommand>, local: bool) {
        for entry in commands {
            let key = (entry.command.origin_id, entry.command.sequence_id);
            self.seen.insert(key);
            if local {
                self.next_sequence_id = self.next_sequence_id.max(entry.command.sequence_id + 1);
            }
            let position = self.commands.len() as u64 + 1;
            self.commands.push(StoredCommand {
                position,
                entry,
                local,
            });
        }
    }

    fn mark_acknowledged(&mut self, up_to: u64) {
        self.ack_mark = self.ack_mark.max(up_to);
        for stored in &mut self.commands {
            if stored.local && stored.entry.command.sequence_id <= up_to {
                stored.entry.acknowledged = true;
            }
        }
    }

    fn write(&mut self, record: &LogRecord, sync: bool) -> CoreResult<()> {
        self.backend.append(&encode_frame(record))?;
        if sync {
            self.backend.sync()?;
        } else {
            self.backend.flush()?;
        }
        Ok(())
    }

    fn highest_local_sequence(&self) -> u64 {
        self.next_sequence_id - 1
    }
}

/// Durable, ordered log of local and remote commands.
///
/// # Invariants
///
/// - Local sequence ids are assigned here and increase by one per command
/// - A pending command stays pending until [`acknowledge`](Self::acknowledge)
///   covers it, across any number of restarts
/// - A remote command is stored at most once per `(origin, sequence)`
/// - Memory is updated only after the record is on disk
pub struct CommandStore {
    state: Mutex<StoreState>,
    config: StoreConfig,
}

impl std::fmt::Debug for CommandStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CommandStore")
            .field("origin_id", &state.origin_id)
            .field("commands", &state.commands.len())
            .field("ack_mark", &state.ack_mark)
            .field("download_cursor", &state.download_cursor)
            .finish()
    }
}

impl CommandStore {
    /// Opens a store over `backend`, recovering from a torn tail.
    ///
    /// A fresh store gets an origin id (from the config, or random) that is
    /// persisted as its first record.
    ///
    /// # Errors
    ///
    /// Returns an error if the log is corrupted before its final record or
    /// the backend fails.
    pub fn open(backend: Box<dyn StorageBackend>, config: StoreConfig) -> CoreResult<Self> {
        let data = backend.read_all()?;
        let scan = record::scan(&data)?;

        let mut state = StoreState::empty(backend);
        if let Some(reason) = &scan.torn {
            tracing::warn!(
                valid_len = scan.valid_len,
                dropped = data.len() as u64 - scan.valid_len,
                %reason,
                "Truncating torn command log tail"
            );
            state.backend.truncate(scan.valid_len)?;
            state.backend.sync()?;
        }

        let record_count = scan.records.len();
        for (_, record) in scan.records {
            state.replay(record);
        }

        if state.origin_id == 0 {
            if !state.commands.is_empty() {
                return Err(CoreError::log_corruption("command log has no origin record"));
            }
            let origin_id = config.origin_id.unwrap_or_else(random_origin);
            state.write(&LogRecord::Origin { origin_id }, true)?;
            state.origin_id = origin_id;
            tracing::info!(origin_id, "Created command log");
        } else {
            tracing::debug!(
                origin_id = state.origin_id,
                records = record_count,
                commands = state.commands.len(),
                ack_mark = state.ack_mark,
                "Recovered command log"
            );
        }

        Ok(Self {
            state: Mutex::new(state),
            config,
        })
    }

    /// Opens a volatile store.
    ///
    /// # Errors
    ///
    /// Never fails in practice; kept fallible to match [`open`](Self::open).
    pub fn open_in_memory() -> CoreResult<Self> {
        Self::open(Box::new(InMemoryBackend::new()), StoreConfig::default())
    }

    /// Opens (or creates) a file-backed store.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or recovery fails.
    pub fn open_file(path: &Path, config: StoreConfig) -> CoreResult<Self> {
        let backend = FileBackend::open_with_create_dirs(path)?;
        Self::open(Box::new(backend), config)
    }

    /// Origin id of this replica.
    pub fn origin_id(&self) -> u64 {
        self.state.lock().origin_id
    }

    /// Appends a batch as a single record.
    ///
    /// With `mark_pending`, the commands are local: they are stamped with
    /// this replica's origin and fresh sequence ids, and wait for upload.
    /// Otherwise they are remote history: they keep their ids, are stored
    /// as acknowledged, and any already stored are dropped from the batch.
    ///
    /// Returns the commands as stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written. Nothing is
    /// recorded in that case.
    pub fn append(
        &self,
        batch: Vec<AnnotatedCommand>,
        mark_pending: bool,
    ) -> CoreResult<Vec<AnnotatedCommand>> {
        let mut state = self.state.lock();

        let commands: Vec<AnnotatedCommand> = if mark_pending {
            let origin_id = state.origin_id;
            batch
                .into_iter()
                .enumerate()
                .map(|(i, mut entry)| {
                    entry.command.origin_id = origin_id;
                    entry.command.sequence_id = state.next_sequence_id + i as u64;
                    entry.acknowledged = false;
                    entry
                })
                .collect()
        } else {
            let mut in_batch = HashSet::new();
            batch
                .into_iter()
                .filter(|entry| {
                    let key = (entry.command.origin_id, entry.command.sequence_id);
                    !state.seen.contains(&key) && in_batch.insert(key)
                })
                .map(|mut entry| {
                    entry.acknowledged = true;
                    entry
                })
                .collect()
        };

        if commands.is_empty() {
            return Ok(commands);
        }

        let record = LogRecord::Batch {
            pending: mark_pending,
            commands: commands.clone(),
        };
        state.write(&record, self.config.sync_on_write)?;
        state.push(commands.clone(), mark_pending);
        tracing::debug!(count = commands.len(), pending = mark_pending, "Appended batch");
        Ok(commands)
    }

    /// Local commands with a sequence id above `mark` that are still pending.
    pub fn pending_since(&self, mark: u64) -> Vec<AnnotatedCommand> {
        self.state
            .lock()
            .commands
            .iter()
            .filter(|c| c.is_pending() && c.entry.command.sequence_id > mark)
            .map(|c| c.entry.clone())
            .collect()
    }

    /// All pending commands, in sequence order.
    pub fn pending(&self) -> Vec<AnnotatedCommand> {
        self.pending_since(0)
    }

    /// Number of pending commands.
    pub fn pending_count(&self) -> usize {
        self.state
            .lock()
            .commands
            .iter()
            .filter(|c| c.is_pending())
            .count()
    }

    /// Marks local commands up to `up_to` as received by the server.
    ///
    /// Values at or below the current mark are ignored. Values above the
    /// highest assigned sequence id are clamped to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written; the mark is then
    /// unchanged.
    pub fn acknowledge(&self, up_to: u64) -> CoreResult<()> {
        let mut state = self.state.lock();
        let up_to = up_to.min(state.highest_local_sequence());
        if up_to <= state.ack_mark {
            return Ok(());
        }
        state.write(&LogRecord::Acknowledge { up_to }, true)?;
        state.mark_acknowledged(up_to);
        tracing::debug!(up_to, "Acknowledged local commands");
        Ok(())
    }

    /// Highest acknowledged local sequence id.
    pub fn ack_mark(&self) -> u64 {
        self.state.lock().ack_mark
    }

    /// Server cursor up to which remote commands have been applied.
    pub fn download_cursor(&self) -> u64 {
        self.state.lock().download_cursor
    }

    /// Persists a new download cursor.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    pub fn set_download_cursor(&self, cursor: u64) -> CoreResult<()> {
        let mut state = self.state.lock();
        if cursor == state.download_cursor {
            return Ok(());
        }
        state.write(&LogRecord::Cursor { cursor }, true)?;
        state.download_cursor = cursor;
        Ok(())
    }

    /// Full history in append order.
    pub fn all_commands(&self) -> Vec<Command> {
        self.state
            .lock()
            .commands
            .iter()
            .map(|c| c.entry.command.clone())
            .collect()
    }

    /// Every stored command with its bookkeeping.
    pub fn entries(&self) -> Vec<StoredCommand> {
        self.state.lock().commands.clone()
    }

    /// Number of stored commands.
    pub fn len(&self) -> usize {
        self.state.lock().commands.len()
    }

    /// Returns true if no command has been stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrites the log with the same history and a single acknowledgement
    /// and cursor record.
    ///
    /// # Errors
    ///
    /// Returns an error if the new log cannot be written; the old log is
    /// then left in place.
    pub fn compact(&self) -> CoreResult<()> {
        let mut state = self.state.lock();

        let mut image = encode_frame(&LogRecord::Origin {
            origin_id: state.origin_id,
        });
        for run in state.commands.chunk_by(|a, b| a.local == b.local) {
            image.extend(encode_frame(&LogRecord::Batch {
                pending: run[0].local,
                commands: run.iter().map(|c| c.entry.clone()).collect(),
            }));
        }
        if state.ack_mark > 0 {
            image.extend(encode_frame(&LogRecord::Acknowledge {
                up_to: state.ack_mark,
            }));
        }
        if state.download_cursor > 0 {
            image.extend(encode_frame(&LogRecord::Cursor {
                cursor: state.download_cursor,
            }));
        }

        let before = state.backend.size()?;
        state.backend.replace(&image)?;
        tracing::info!(before, after = image.len(), "Compacted command log");
        Ok(())
    }
}

fn random_origin() -> u64 {
    loop {
        let id = rand::random::<u64>();
        if id != 0 {
            return id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn local(commands: Vec<Command>) -> Vec<AnnotatedCommand> {
        commands.into_iter().map(AnnotatedCommand::new).collect()
    }

    fn remote(origin: u64, seqs: &[u64]) -> Vec<AnnotatedCommand> {
        seqs.iter()
            .map(|&s| AnnotatedCommand::remote(Command::set_title(s as u32, "r").sequenced(origin, s)))
            .collect()
    }

    fn config() -> StoreConfig {
        StoreConfig::default().with_origin_id(11)
    }

    #[test]
    fn local_commands_get_sequence_ids() {
        let store = CommandStore::open(Box::new(InMemoryBackend::new()), config()).unwrap();
        let stored = store
            .append(
                local(vec![Command::set_title(1, "a"), Command::tag_item(1, "todo")]),
                true,
            )
            .unwrap();
        assert_eq!(stored[0].command.sequence_id, 1);
        assert_eq!(stored[1].command.sequence_id, 2);
        assert!(stored.iter().all(|c| c.command.origin_id == 11));

        let next = store.append(local(vec![Command::delete_item(1)]), true).unwrap();
        assert_eq!(next[0].command.sequence_id, 3);
        assert_eq!(store.pending().len(), 3);
    }

    #[test]
    fn acknowledge_drops_from_pending_only() {
        let store = CommandStore::open_in_memory().unwrap();
        store
            .append(local(vec![Command::set_title(1, "a"), Command::set_title(2, "b")]), true)
            .unwrap();
        store.append(local(vec![Command::set_title(3, "c")]), true).unwrap();

        store.acknowledge(2).unwrap();
        assert_eq!(store.ack_mark(), 2);
        let pending = store.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].command.sequence_id, 3);
        assert_eq!(store.len(), 3);

        store.acknowledge(1).unwrap();
        assert_eq!(store.ack_mark(), 2);
    }

    #[test]
    fn acknowledge_is_clamped_to_assigned_ids() {
        let store = CommandStore::open_in_memory().unwrap();
        store.append(local(vec![Command::set_title(1, "a")]), true).unwrap();
        store.acknowledge(500).unwrap();
        assert_eq!(store.ack_mark(), 1);

        let next = store.append(local(vec![Command::set_title(2, "b")]), true).unwrap();
        assert_eq!(next[0].command.sequence_id, 2);
        assert_eq!(store.pending().len(), 1);
    }

    #[test]
    fn remote_duplicates_are_dropped() {
        let store = CommandStore::open_in_memory().unwrap();
        assert_eq!(store.append(remote(99, &[1, 2]), false).unwrap().len(), 2);
        assert_eq!(store.append(remote(99, &[2, 3]), false).unwrap().len(), 1);
        assert!(store.append(remote(99, &[1, 3]), false).unwrap().is_empty());
        assert_eq!(store.len(), 3);
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("commands.log");

        {
            let store = CommandStore::open_file(&path, config()).unwrap();
            store
                .append(local(vec![Command::set_title(42, "Buy milk")]), true)
                .unwrap();
            store.append(local(vec![Command::set_title(43, "Eggs")]), true).unwrap();
            store.append(remote(5, &[1]), false).unwrap();
            store.acknowledge(1).unwrap();
            store.set_download_cursor(17).unwrap();
        }

        let store = CommandStore::open_file(&path, StoreConfig::default()).unwrap();
        assert_eq!(store.origin_id(), 11);
        assert_eq!(store.ack_mark(), 1);
        assert_eq!(store.download_cursor(), 17);
        assert_eq!(store.len(), 3);
        let pending = store.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].command, Command::set_title(43, "Eggs").sequenced(11, 2));

        let next = store.append(local(vec![Command::delete_item(43)]), true).unwrap();
        assert_eq!(next[0].command.sequence_id, 3);
        assert!(store.append(remote(5, &[1]), false).unwrap().is_empty());
    }

    #[test]
    fn torn_batch_is_all_or_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("commands.log");

        let intact_len = {
            let store = CommandStore::open_file(&path, config()).unwrap();
            store.append(local(vec![Command::set_title(1, "kept")]), true).unwrap();
            let intact = std::fs::metadata(&path).unwrap().len();
            store
                .append(
                    local(vec![Command::set_title(2, "torn"), Command::tag_item(2, "todo")]),
                    true,
                )
                .unwrap();
            intact
        };

        let full_len = std::fs::metadata(&path).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full_len - 5).unwrap();
        drop(file);

        let store = CommandStore::open_file(&path, StoreConfig::default()).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.pending()[0].command.payload, b"00000001 kept");
        assert_eq!(std::fs::metadata(&path).unwrap().len(), intact_len);

        let next = store.append(local(vec![Command::set_title(3, "after")]), true).unwrap();
        assert_eq!(next[0].command.sequence_id, 2);
    }

    #[test]
    fn compact_keeps_history_and_marks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("commands.log");

        {
            let store = CommandStore::open_file(&path, config()).unwrap();
            for n in 1..=5u32 {
                store.append(local(vec![Command::set_title(n, "x")]), true).unwrap();
                store.acknowledge(u64::from(n)).unwrap();
                store.set_download_cursor(u64::from(n) * 10).unwrap();
            }
            store.append(local(vec![Command::set_title(6, "pending")]), true).unwrap();
            store.append(remote(8, &[1, 2]), false).unwrap();

            let before = std::fs::metadata(&path).unwrap().len();
            store.compact().unwrap();
            assert!(std::fs::metadata(&path).unwrap().len() < before);
        }

        let store = CommandStore::open_file(&path, StoreConfig::default()).unwrap();
        assert_eq!(store.origin_id(), 11);
        assert_eq!(store.len(), 8);
        assert_eq!(store.ack_mark(), 5);
        assert_eq!(store.download_cursor(), 50);
        assert_eq!(store.pending().len(), 1);
        assert_eq!(store.pending()[0].command.sequence_id, 6);
    }

    #[test]
    fn log_without_origin_is_corrupt() {
        let image = encode_frame(&LogRecord::Batch {
            pending: false,
            commands: remote(3, &[1]),
        });
        let result = CommandStore::open(
            Box::new(InMemoryBackend::with_data(image)),
            StoreConfig::default(),
        );
        assert!(matches!(result, Err(CoreError::LogCorruption { .. })));
    }
}
