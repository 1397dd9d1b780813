//! Request handlers for sync messages.

use crate::auth::{CredentialStore, TokenValidator};
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::oplog::ServerCommandLog;
use gtd_sync_protocol::{
    DownloadRequest, DownloadResponse, ErrorResponse, HandshakeRequest, HandshakeResponse,
    SyncMessage, UploadRequest, UploadResponse, PROTOCOL_VERSION,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Context for request handling.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// Command log (shared across all handlers).
    pub log: Arc<ServerCommandLog>,
    credentials: CredentialStore,
    tokens: TokenValidator,
    /// Client sessions (origin_id -> session info).
    sessions: RwLock<HashMap<u64, ClientSession>>,
}

/// What the server remembers about a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSession {
    /// Account the client logged in as.
    pub username: String,
    /// Cursor of the last page delivered.
    pub last_cursor: u64,
    /// When the session was opened.
    pub opened_at: Instant,
}

impl HandlerContext {
    /// Creates a new handler context.
    pub fn new(
        config: ServerConfig,
        log: Arc<ServerCommandLog>,
        credentials: CredentialStore,
    ) -> Self {
        let tokens = match &config.token_secret {
            Some(secret) => TokenValidator::new(secret.clone(), config.session_expiry),
            None => TokenValidator::random(config.session_expiry),
        };
        Self {
            config,
            log,
            credentials,
            tokens,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    fn open_session(&self, origin_id: u64, username: &str) {
        let session = ClientSession {
            username: username.to_string(),
            last_cursor: 0,
            opened_at: Instant::now(),
        };
        self.sessions.write().insert(origin_id, session);
    }

    /// Gets a client session.
    pub fn session(&self, origin_id: u64) -> Option<ClientSession> {
        self.sessions.read().get(&origin_id).cloned()
    }

    fn update_cursor(&self, origin_id: u64, cursor: u64) {
        if let Some(session) = self.sessions.write().get_mut(&origin_id) {
            session.last_cursor = session.last_cursor.max(cursor);
        }
    }

    /// Resolves a token to its origin. The session must still be open.
    fn authorize(&self, token: &str) -> ServerResult<u64> {
        let origin_id = self.tokens.validate_token(token)?;
        if !self.sessions.read().contains_key(&origin_id) {
            return Err(ServerError::NotAuthorized("no open session".into()));
        }
        Ok(origin_id)
    }
}

/// Handler for sync requests.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// The shared context.
    pub fn context(&self) -> &Arc<HandlerContext> {
        &self.context
    }

    /// Answers one message. Failures become [`ErrorResponse`]s.
    pub fn handle(&self, message: SyncMessage) -> SyncMessage {
        let name = message.name();
        let result = match message {
            SyncMessage::HandshakeRequest(req) => self
                .handle_handshake(req)
                .map(SyncMessage::HandshakeResponse),
            SyncMessage::UploadRequest(req) => {
                self.handle_upload(req).map(SyncMessage::UploadResponse)
            }
            SyncMessage::DownloadRequest(req) => {
                self.handle_download(req).map(SyncMessage::DownloadResponse)
            }
            other => Err(ServerError::InvalidRequest(format!(
                "unexpected message {}",
                other.name()
            ))),
        };
        result.unwrap_or_else(|e| {
            if e.is_server_error() {
                tracing::error!(message = name, error = %e, "Request failed");
            } else {
                tracing::debug!(message = name, error = %e, "Request refused");
            }
            SyncMessage::Error(ErrorResponse::new(e.to_string()))
        })
    }

    /// Handles a handshake request.
    ///
    /// Refusals are answered in-band so the client can tell a version
    /// mismatch from bad credentials.
    pub fn handle_handshake(&self, request: HandshakeRequest) -> ServerResult<HandshakeResponse> {
        if request.protocol_version != PROTOCOL_VERSION {
            let err = ServerError::ProtocolMismatch {
                client: request.protocol_version,
                server: PROTOCOL_VERSION,
            };
            return Ok(HandshakeResponse::refused(err.to_string()));
        }
        if request.origin_id == 0 {
            return Ok(HandshakeResponse::refused("origin id must be non-zero"));
        }
        if let Err(e) = self
            .context
            .credentials
            .verify(&request.username, &request.password)
        {
            tracing::info!(username = %request.username, "Handshake refused");
            return Ok(HandshakeResponse::refused(e.to_string()));
        }

        let token = self.context.tokens.create_token(request.origin_id)?;
        self.context
            .open_session(request.origin_id, &request.username);
        tracing::info!(
            username = %request.username,
            origin_id = request.origin_id,
            "Session opened"
        );
        Ok(HandshakeResponse::accepted(token, self.context.log.cursor()))
    }

    /// Handles an upload.
    pub fn handle_upload(&self, request: UploadRequest) -> ServerResult<UploadResponse> {
        let origin_id = self.context.authorize(&request.session_token)?;

        let max = self.context.config.max_upload_batch;
        if request.commands.len() > max {
            return Err(ServerError::InvalidRequest(format!(
                "too many commands: {} > {max}",
                request.commands.len()
            )));
        }
        if let Some(foreign) = request
            .commands
            .iter()
            .find(|c| c.command.origin_id != origin_id)
        {
            return Ok(UploadResponse::rejected(format!(
                "command from origin {} uploaded by origin {origin_id}",
                foreign.command.origin_id
            )));
        }

        let acknowledged = self.context.log.append(origin_id, &request.commands);
        Ok(UploadResponse::accepted(acknowledged))
    }

    /// Handles a download.
    pub fn handle_download(&self, request: DownloadRequest) -> ServerResult<DownloadResponse> {
        let origin_id = self.context.authorize(&request.session_token)?;
        let limit = request.limit.min(self.context.config.max_download_batch);

        let page = self.context.log.page(request.cursor, limit, origin_id);
        self.context.update_cursor(origin_id, page.new_cursor);

        Ok(DownloadResponse {
            commands: page.commands,
            new_cursor: page.new_cursor,
            has_more: page.has_more,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gtd_core::{AnnotatedCommand, Command};

    fn create_handler() -> RequestHandler {
        let credentials = CredentialStore::new().with_user("ana", "secret");
        let context = Arc::new(HandlerContext::new(
            ServerConfig::default(),
            Arc::new(ServerCommandLog::new()),
            credentials,
        ));
        RequestHandler::new(context)
    }

    fn login(handler: &RequestHandler, origin: u64) -> String {
        let response = handler
            .handle_handshake(HandshakeRequest::new(origin, "ana", "secret"))
            .unwrap();
        assert!(response.success);
        response.session_token.unwrap()
    }

    fn commands(origin: u64, seqs: std::ops::RangeInclusive<u64>) -> Vec<AnnotatedCommand> {
        seqs.map(|seq| {
            AnnotatedCommand::new(Command::set_title(seq as u32, "item").sequenced(origin, seq))
        })
        .collect()
    }

    fn download(token: &str, cursor: u64, limit: u32) -> SyncMessage {
        SyncMessage::DownloadRequest(DownloadRequest {
            session_token: token.into(),
            cursor,
            limit,
        })
    }

    #[test]
    fn handshake_success() {
        let handler = create_handler();
        let response = handler
            .handle_handshake(HandshakeRequest::new(1, "ana", "secret"))
            .unwrap();
        assert!(response.success);
        assert!(response.session_token.is_some());
        assert_eq!(response.server_cursor, 0);
        assert_eq!(handler.context().session(1).unwrap().username, "ana");
    }

    #[test]
    fn handshake_bad_password() {
        let handler = create_handler();
        let response = handler
            .handle_handshake(HandshakeRequest::new(1, "ana", "wrong"))
            .unwrap();
        assert!(!response.success);
        assert!(response.session_token.is_none());
        assert!(handler.context().session(1).is_none());
    }

    #[test]
    fn handshake_bad_version() {
        let handler = create_handler();
        let mut request = HandshakeRequest::new(1, "ana", "secret");
        request.protocol_version = 99;

        let response = handler.handle_handshake(request).unwrap();
        assert!(!response.success);
        assert_eq!(response.protocol_version, PROTOCOL_VERSION);
        assert!(response.error.unwrap().contains("99"));
    }

    #[test]
    fn requests_without_session_are_refused() {
        let handler = create_handler();
        let reply = handler.handle(download("not-a-token", 0, 10));
        assert!(matches!(reply, SyncMessage::Error(_)));
    }

    #[test]
    fn upload_then_download_from_another_origin() {
        let handler = create_handler();
        let writer = login(&handler, 1);
        let reader = login(&handler, 2);

        let reply = handler.handle(SyncMessage::UploadRequest(UploadRequest {
            session_token: writer.clone(),
            commands: commands(1, 1..=2),
        }));
        let SyncMessage::UploadResponse(upload) = reply else {
            panic!("expected upload response, got {reply:?}");
        };
        assert!(upload.success);
        assert_eq!(upload.acknowledged_up_to, 2);

        let SyncMessage::DownloadResponse(page) = handler.handle(download(&reader, 0, 10)) else {
            panic!("expected download response");
        };
        assert_eq!(page.commands.len(), 2);
        assert_eq!(page.new_cursor, 2);
        assert_eq!(handler.context().session(2).unwrap().last_cursor, 2);

        let SyncMessage::DownloadResponse(own) = handler.handle(download(&writer, 0, 10)) else {
            panic!("expected download response");
        };
        assert!(own.commands.is_empty());
        assert_eq!(own.new_cursor, 2);
    }

    #[test]
    fn upload_of_foreign_commands_is_rejected() {
        let handler = create_handler();
        let token = login(&handler, 1);
        let response = handler
            .handle_upload(UploadRequest {
                session_token: token,
                commands: commands(9, 1..=1),
            })
            .unwrap();
        assert!(!response.success);
        assert!(handler.context().log.is_empty());
    }

    #[test]
    fn download_limit_is_capped() {
        let credentials = CredentialStore::new().with_user("ana", "secret");
        let config = ServerConfig::default().with_max_download_batch(2);
        let handler = RequestHandler::new(Arc::new(HandlerContext::new(
            config,
            Arc::new(ServerCommandLog::new()),
            credentials,
        )));
        let writer = login(&handler, 1);
        let reader = login(&handler, 2);
        handler
            .handle_upload(UploadRequest {
                session_token: writer,
                commands: commands(1, 1..=5),
            })
            .unwrap();

        let page = handler
            .handle_download(DownloadRequest {
                session_token: reader,
                cursor: 0,
                limit: 100,
            })
            .unwrap();
        assert_eq!(page.commands.len(), 2);
        assert!(page.has_more);
    }

    #[test]
    fn server_messages_are_not_requests() {
        let handler = create_handler();
        let reply = handler.handle(SyncMessage::Error(ErrorResponse::new("hi")));
        assert!(matches!(reply, SyncMessage::Error(_)));
    }
}
