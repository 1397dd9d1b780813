//! Sync engine state machine.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::transport::SyncTransport;
use gtd_core::{AnnotatedCommand, Command, CommandStore, DocumentModel};
use gtd_sync_protocol::{DownloadRequest, HandshakeRequest, UploadRequest, PROTOCOL_VERSION};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The current state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No round in flight.
    Idle,
    /// Opening the secure channel and authenticating.
    Connecting,
    /// Sending pending local commands.
    Uploading,
    /// Receiving remote commands.
    Downloading,
    /// Folding remote commands into the document.
    Applying,
    /// The last round failed.
    Failed,
}

impl SyncState {
    /// Returns true while a round is in flight.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncState::Connecting
                | SyncState::Uploading
                | SyncState::Downloading
                | SyncState::Applying
        )
    }

    /// Returns true if a new round may start.
    pub fn can_start_sync(&self) -> bool {
        matches!(self, SyncState::Idle | SyncState::Failed)
    }
}

/// Statistics about sync rounds.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Rounds that completed.
    pub cycles_completed: u64,
    /// Rounds that failed.
    pub cycles_failed: u64,
    /// Commands uploaded and acknowledged.
    pub commands_uploaded: u64,
    /// Remote commands downloaded.
    pub commands_downloaded: u64,
    /// Time the last round completed.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Result of a sync round.
#[derive(Debug, Clone)]
pub struct SyncCycleResult {
    /// Local commands uploaded.
    pub uploaded: u64,
    /// Remote commands downloaded.
    pub downloaded: u64,
    /// Remote commands that were new to this replica and got applied.
    pub applied: u64,
    /// Acknowledgement mark after the round.
    pub acknowledged_up_to: u64,
    /// Download cursor after the round.
    pub cursor: u64,
    /// Duration of the round.
    pub duration: Duration,
}

/// The replica side of a sync round.
pub trait SyncApplier: Send + Sync {
    /// Origin id stamped on local commands.
    fn origin_id(&self) -> u64;

    /// Local commands not yet acknowledged, in sequence order.
    fn pending_commands(&self) -> SyncResult<Vec<AnnotatedCommand>>;

    /// Server cursor of the last fully applied download.
    fn download_cursor(&self) -> SyncResult<u64>;

    /// Stores and applies remote commands; returns how many were new.
    fn apply_remote(&self, commands: &[Command]) -> SyncResult<u64>;

    /// Records a finished round: advances the acknowledgement mark and the
    /// download cursor.
    fn commit_round(&self, acknowledged_up_to: Option<u64>, cursor: u64) -> SyncResult<()>;
}

/// Applies rounds to a live document and its command store.
#[derive(Debug, Clone)]
pub struct ReplicaApplier {
    model: Arc<DocumentModel>,
    store: Arc<CommandStore>,
}

impl ReplicaApplier {
    /// Creates an applier over `model` and `store`.
    pub fn new(model: Arc<DocumentModel>, store: Arc<CommandStore>) -> Self {
        Self { model, store }
    }
}

impl SyncApplier for ReplicaApplier {
    fn origin_id(&self) -> u64 {
        self.store.origin_id()
    }

    fn pending_commands(&self) -> SyncResult<Vec<AnnotatedCommand>> {
        Ok(self.store.pending_since(self.store.ack_mark()))
    }

    fn download_cursor(&self) -> SyncResult<u64> {
        Ok(self.store.download_cursor())
    }

    fn apply_remote(&self, commands: &[Command]) -> SyncResult<u64> {
        let own = self.store.origin_id();
        let batch: Vec<AnnotatedCommand> = commands
            .iter()
            .filter(|c| c.origin_id != own)
            .cloned()
            .map(AnnotatedCommand::remote)
            .collect();
        if batch.is_empty() {
            return Ok(0);
        }

        let report = self.model.evaluate_persisted(true, |_| {
            let stored = self.store.append(batch, false)?;
            Ok::<_, SyncError>(stored.into_iter().map(|c| c.command).collect())
        })?;
        Ok((report.applied + report.skipped) as u64)
    }

    fn commit_round(&self, acknowledged_up_to: Option<u64>, cursor: u64) -> SyncResult<()> {
        if let Some(up_to) = acknowledged_up_to {
            self.store.acknowledge(up_to)?;
        }
        self.store.set_download_cursor(cursor)?;
        Ok(())
    }
}

/// Runs sync rounds against one server.
///
/// A round is `Idle → Connecting → Uploading → Downloading → Applying →
/// Idle`; any failure lands in `Failed`. The acknowledgement mark and the
/// download cursor only move after the downloaded batch has been applied,
/// so a round that fails midway leaves the pending set as it was.
pub struct SyncEngine<T: SyncTransport, A: SyncApplier> {
    config: SyncConfig,
    transport: Arc<T>,
    applier: Arc<A>,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
}

impl<T: SyncTransport, A: SyncApplier> SyncEngine<T, A> {
    /// Creates a new sync engine.
    pub fn new(config: SyncConfig, transport: T, applier: A) -> Self {
        Self::with_shared(config, Arc::new(transport), Arc::new(applier))
    }

    /// Creates an engine over shared transport and applier.
    pub fn with_shared(config: SyncConfig, transport: Arc<T>, applier: Arc<A>) -> Self {
        Self {
            config,
            transport,
            applier,
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
        }
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// The engine's configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The transport.
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    fn set_state(&self, state: SyncState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        tracing::debug!(from = ?previous, to = ?state, "Sync state");
    }

    /// Runs one full round.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the round; the engine is then `Failed`.
    pub fn sync(&self) -> SyncResult<SyncCycleResult> {
        {
            let mut state = self.state.write();
            if !state.can_start_sync() {
                return Err(SyncError::InvalidStateTransition {
                    from: format!("{:?}", *state),
                    to: "Connecting".into(),
                });
            }
            *state = SyncState::Connecting;
        }
        tracing::debug!(address = %self.config.address, "Sync round starting");

        let start = Instant::now();
        let outcome = self.run_round(start);
        if let Err(e) = self.transport.close() {
            tracing::debug!(error = %e, "Closing transport failed");
        }

        match outcome {
            Ok(result) => {
                self.set_state(SyncState::Idle);
                let mut stats = self.stats.write();
                stats.cycles_completed += 1;
                stats.commands_uploaded += result.uploaded;
                stats.commands_downloaded += result.downloaded;
                stats.last_sync_time = Some(Instant::now());
                stats.last_error = None;
                tracing::info!(
                    uploaded = result.uploaded,
                    downloaded = result.downloaded,
                    applied = result.applied,
                    ack = result.acknowledged_up_to,
                    duration_ms = result.duration.as_millis() as u64,
                    "Sync round complete"
                );
                Ok(result)
            }
            Err(e) => {
                self.set_state(SyncState::Failed);
                let mut stats = self.stats.write();
                stats.cycles_failed += 1;
                stats.last_error = Some(e.to_string());
                tracing::error!(error = %e, "Sync round failed");
                Err(e)
            }
        }
    }

    fn run_round(&self, start: Instant) -> SyncResult<SyncCycleResult> {
        let token = self.connect()?;

        self.set_state(SyncState::Uploading);
        let pending = self.applier.pending_commands()?;
        let uploaded = pending.len() as u64;
        let acknowledged = self.upload(&token, pending)?;

        self.set_state(SyncState::Downloading);
        let (commands, cursor) = self.download_all(&token)?;

        self.set_state(SyncState::Applying);
        let applied = self.applier.apply_remote(&commands)?;
        self.applier.commit_round(acknowledged, cursor)?;

        Ok(SyncCycleResult {
            uploaded,
            downloaded: commands.len() as u64,
            applied,
            acknowledged_up_to: acknowledged.unwrap_or(0),
            cursor,
            duration: start.elapsed(),
        })
    }

    fn connect(&self) -> SyncResult<String> {
        self.transport.connect()?;

        let request = HandshakeRequest::new(
            self.applier.origin_id(),
            &self.config.username,
            &self.config.password,
        );
        let response = self.transport.handshake(&request)?;

        if response.protocol_version != PROTOCOL_VERSION {
            return Err(SyncError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: response.protocol_version,
            });
        }
        if !response.success {
            return Err(SyncError::AuthenticationFailed(
                response
                    .error
                    .unwrap_or_else(|| "handshake refused".into()),
            ));
        }
        response
            .session_token
            .ok_or_else(|| SyncError::Protocol("handshake accepted without a session token".into()))
    }

    /// Sends `pending` in batches of at most `upload_batch_size`.
    ///
    /// Returns the server's acknowledgement, or `None` if nothing was sent.
    /// The acknowledgement is only committed after the whole round; a batch
    /// failing midway fails the round and every batch is sent again.
    fn upload(&self, token: &str, pending: Vec<AnnotatedCommand>) -> SyncResult<Option<u64>> {
        let mut acknowledged = None;
        for batch in pending.chunks(self.config.upload_batch_size.max(1)) {
            let highest_sent = batch
                .iter()
                .map(|c| c.command.sequence_id)
                .max()
                .unwrap_or(0);

            let response = self.transport.upload(&UploadRequest {
                session_token: token.to_string(),
                commands: batch.to_vec(),
            })?;
            if !response.success {
                return Err(SyncError::ServerError(
                    response.error.unwrap_or_else(|| "upload rejected".into()),
                ));
            }
            let up_to = response.acknowledged_up_to.min(highest_sent);
            acknowledged = Some(acknowledged.map_or(up_to, |prev: u64| prev.max(up_to)));
        }
        Ok(acknowledged)
    }

    fn download_all(&self, token: &str) -> SyncResult<(Vec<Command>, u64)> {
        let mut cursor = self.applier.download_cursor()?;
        let mut commands = Vec::new();

        loop {
            let page = self.transport.download(&DownloadRequest {
                session_token: token.to_string(),
                cursor,
                limit: self.config.download_page_size,
            })?;
            if page.new_cursor < cursor {
                return Err(SyncError::Protocol(format!(
                    "server cursor moved backwards: {} -> {}",
                    cursor, page.new_cursor
                )));
            }
            if page.has_more && page.new_cursor == cursor {
                return Err(SyncError::Protocol(format!(
                    "server reported more commands without advancing cursor {cursor}"
                )));
            }
            commands.extend(page.commands);
            cursor = page.new_cursor;
            if !page.has_more {
                break;
            }
        }

        Ok((commands, cursor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use gtd_core::Notification;
    use gtd_sync_protocol::{DownloadResponse, HandshakeResponse, UploadResponse};

    fn replica() -> (Arc<DocumentModel>, Arc<CommandStore>) {
        (
            Arc::new(DocumentModel::new()),
            Arc::new(CommandStore::open_in_memory().unwrap()),
        )
    }

    fn add_local(model: &DocumentModel, store: &CommandStore, command: Command) {
        model
            .evaluate_persisted(false, |_| {
                store
                    .append(vec![AnnotatedCommand::new(command)], true)
                    .map(|stored| stored.into_iter().map(|c| c.command).collect())
            })
            .unwrap();
    }

    fn engine(
        model: &Arc<DocumentModel>,
        store: &Arc<CommandStore>,
    ) -> SyncEngine<MockTransport, ReplicaApplier> {
        SyncEngine::new(
            SyncConfig::new("mock:1").with_credentials("ana", "pw"),
            MockTransport::new(),
            ReplicaApplier::new(Arc::clone(model), Arc::clone(store)),
        )
    }

    #[test]
    fn empty_round_returns_to_idle() {
        let (model, store) = replica();
        let engine = engine(&model, &store);

        let result = engine.sync().unwrap();
        assert_eq!(result.uploaded, 0);
        assert_eq!(result.downloaded, 0);
        assert_eq!(engine.state(), SyncState::Idle);
        assert!(engine.transport().uploads().is_empty());
        assert!(!engine.transport().is_connected());
        assert_eq!(engine.stats().cycles_completed, 1);
    }

    #[test]
    fn round_uploads_downloads_and_acknowledges() {
        let (model, store) = replica();
        add_local(&model, &store, Command::set_title(42, "Buy milk"));
        let engine = engine(&model, &store);
        engine.transport().push_download_page(DownloadResponse {
            commands: vec![Command::tag_item(7, "todo").sequenced(500, 1)],
            new_cursor: 1,
            has_more: true,
        });
        engine.transport().push_download_page(DownloadResponse {
            commands: vec![Command::set_title(7, "call bank").sequenced(500, 2)],
            new_cursor: 2,
            has_more: false,
        });
        let rx = model.subscribe();

        let result = engine.sync().unwrap();
        assert_eq!(result.uploaded, 1);
        assert_eq!(result.downloaded, 2);
        assert_eq!(result.applied, 2);
        assert_eq!(store.pending_count(), 0);
        assert_eq!(store.ack_mark(), 1);
        assert_eq!(store.download_cursor(), 2);
        assert_eq!(rx.try_recv().unwrap(), Notification::StateChanged);

        let doc = model.snapshot();
        assert_eq!(doc.item(7).unwrap().tag, "todo");
        assert_eq!(doc.item(7).unwrap().title, "call bank");

        let downloads = engine.transport().downloads();
        assert_eq!(downloads.len(), 2);
        assert_eq!(downloads[1].cursor, 1);
    }

    #[test]
    fn failed_download_does_not_acknowledge() {
        let (model, store) = replica();
        add_local(&model, &store, Command::set_title(42, "Buy milk"));
        let before = store.pending();
        let engine = engine(&model, &store);
        engine.transport().set_fail_download(true);

        let err = engine.sync().unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(engine.state(), SyncState::Failed);
        assert_eq!(store.pending(), before);
        assert_eq!(store.ack_mark(), 0);
        assert_eq!(engine.transport().uploads().len(), 1);

        engine.transport().set_fail_download(false);
        engine.sync().unwrap();
        assert_eq!(engine.transport().uploads().len(), 2);
        assert_eq!(engine.transport().uploads()[1].commands, before);
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn refused_handshake_is_authentication_failure() {
        let (model, store) = replica();
        let engine = engine(&model, &store);
        engine
            .transport()
            .set_handshake_response(HandshakeResponse::refused("invalid credentials"));

        assert!(matches!(
            engine.sync(),
            Err(SyncError::AuthenticationFailed(_))
        ));
        assert_eq!(engine.state(), SyncState::Failed);
        assert!(engine.stats().last_error.is_some());
    }

    #[test]
    fn newer_server_protocol_is_refused() {
        let (model, store) = replica();
        let engine = engine(&model, &store);
        let mut response = HandshakeResponse::accepted("t", 0);
        response.protocol_version = PROTOCOL_VERSION + 1;
        engine.transport().set_handshake_response(response);

        assert!(matches!(
            engine.sync(),
            Err(SyncError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn rejected_upload_keeps_pending() {
        let (model, store) = replica();
        add_local(&model, &store, Command::delete_item(3));
        let engine = engine(&model, &store);
        engine
            .transport()
            .set_upload_response(UploadResponse::rejected("quota exceeded"));

        assert!(matches!(engine.sync(), Err(SyncError::ServerError(_))));
        assert_eq!(store.pending_count(), 1);
    }

    #[test]
    fn server_cannot_acknowledge_unsent_commands() {
        let (model, store) = replica();
        add_local(&model, &store, Command::set_title(1, "a"));
        let engine = engine(&model, &store);
        engine
            .transport()
            .set_upload_response(UploadResponse::accepted(99));

        let result = engine.sync().unwrap();
        assert_eq!(result.acknowledged_up_to, 1);
        assert_eq!(store.ack_mark(), 1);
    }

    #[test]
    fn own_commands_echoed_back_are_ignored() {
        let (model, store) = replica();
        add_local(&model, &store, Command::set_title(1, "mine"));
        let own = store.origin_id();
        let engine = engine(&model, &store);
        engine.transport().push_download_page(DownloadResponse {
            commands: vec![Command::set_title(1, "mine").sequenced(own, 1)],
            new_cursor: 4,
            has_more: false,
        });

        let result = engine.sync().unwrap();
        assert_eq!(result.applied, 0);
        assert_eq!(store.len(), 1);
        assert_eq!(store.download_cursor(), 4);
    }

    #[test]
    fn large_backlog_is_uploaded_in_batches() {
        let (model, store) = replica();
        for num in 1..=5 {
            add_local(&model, &store, Command::set_title(num, "backlog"));
        }
        let engine = SyncEngine::new(
            SyncConfig::new("mock:1").with_upload_batch_size(2),
            MockTransport::new(),
            ReplicaApplier::new(Arc::clone(&model), Arc::clone(&store)),
        );

        let result = engine.sync().unwrap();
        let sizes: Vec<usize> = engine
            .transport()
            .uploads()
            .iter()
            .map(|u| u.commands.len())
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(result.uploaded, 5);
        assert_eq!(result.acknowledged_up_to, 5);
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn stalled_download_cursor_is_a_protocol_error() {
        let (model, store) = replica();
        add_local(&model, &store, Command::set_title(1, "a"));
        let engine = engine(&model, &store);
        engine.transport().push_download_page(DownloadResponse {
            commands: vec![Command::set_title(9, "again").sequenced(500, 1)],
            new_cursor: 0,
            has_more: true,
        });

        assert!(matches!(engine.sync(), Err(SyncError::Protocol(_))));
        assert_eq!(engine.transport().downloads().len(), 1);
        assert_eq!(store.pending_count(), 1);
        assert!(model.item_title(9).is_none());
    }

    #[test]
    fn unreachable_server_fails_round() {
        let (model, store) = replica();
        let engine = engine(&model, &store);
        engine.transport().set_refuse_connect(true);
        assert!(engine.sync().is_err());
        assert_eq!(engine.state(), SyncState::Failed);

        engine.transport().set_refuse_connect(false);
        assert!(engine.sync().is_ok());
        assert_eq!(engine.state(), SyncState::Idle);
    }
}
