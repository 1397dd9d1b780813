//! TLS listener and connection loop.

use crate::auth::CredentialStore;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{HandlerContext, RequestHandler};
use crate::oplog::ServerCommandLog;
use gtd_sync_protocol::{
    ErrorResponse, ProtocolError, SyncMessage, FRAME_HEADER_LEN, MAX_FRAME_LEN,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tracing::Instrument;

/// Server certificate chain and PKCS#8 private key, both DER.
pub struct TlsIdentity {
    certificates: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("certificates", &self.certificates.len())
            .finish_non_exhaustive()
    }
}

impl TlsIdentity {
    /// Wraps a single self-signed certificate and its key.
    pub fn from_der(certificate: Vec<u8>, private_key: Vec<u8>) -> Self {
        Self {
            certificates: vec![CertificateDer::from(certificate)],
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(private_key)),
        }
    }

    /// Reads the certificate and key from DER files.
    ///
    /// # Errors
    ///
    /// Returns an error if either file cannot be read.
    pub fn from_der_files(certificate: &Path, private_key: &Path) -> ServerResult<Self> {
        Ok(Self::from_der(
            std::fs::read(certificate)?,
            std::fs::read(private_key)?,
        ))
    }

    /// Builds the TLS acceptor.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Tls`] if the key does not match the
    /// certificate or cannot be parsed.
    pub fn acceptor(self) -> ServerResult<TlsAcceptor> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| ServerError::Tls(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(self.certificates, self.key)
            .map_err(|e| ServerError::Tls(e.to_string()))?;
        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

/// The sync server.
///
/// Accepts TLS connections and answers framed sync messages, one request
/// at a time per connection, until the client hangs up.
///
/// # Example
///
/// ```no_run
/// use gtd_sync_server::{CredentialStore, ServerConfig, SyncServer, TlsIdentity};
///
/// # async fn run() -> gtd_sync_server::ServerResult<()> {
/// let credentials = CredentialStore::new().with_user("ana", "secret");
/// let server = SyncServer::new(ServerConfig::default(), credentials);
/// let identity = TlsIdentity::from_der_files("cert.der".as_ref(), "key.der".as_ref())?;
/// server.run(identity).await
/// # }
/// ```
pub struct SyncServer {
    handler: Arc<RequestHandler>,
}

impl SyncServer {
    /// Creates a new sync server with an empty log.
    pub fn new(config: ServerConfig, credentials: CredentialStore) -> Self {
        Self::with_log(config, credentials, Arc::new(ServerCommandLog::new()))
    }

    /// Creates a sync server over an existing log.
    pub fn with_log(
        config: ServerConfig,
        credentials: CredentialStore,
        log: Arc<ServerCommandLog>,
    ) -> Self {
        let context = Arc::new(HandlerContext::new(config, log, credentials));
        Self {
            handler: Arc::new(RequestHandler::new(context)),
        }
    }

    /// The request handler, for in-process use.
    pub fn handler(&self) -> &Arc<RequestHandler> {
        &self.handler
    }

    /// Answers one message without any I/O.
    pub fn handle_message(&self, message: SyncMessage) -> SyncMessage {
        self.handler.handle(message)
    }

    /// Returns the current server cursor.
    pub fn cursor(&self) -> u64 {
        self.handler.context().log.cursor()
    }

    /// Returns the number of commands in the log.
    pub fn command_count(&self) -> usize {
        self.handler.context().log.len()
    }

    fn config(&self) -> &ServerConfig {
        &self.handler.context().config
    }

    /// Binds the configured address and serves forever.
    ///
    /// # Errors
    ///
    /// Returns an error if binding or TLS setup fails.
    pub async fn run(&self, identity: TlsIdentity) -> ServerResult<()> {
        let listener = TcpListener::bind(self.config().bind_addr).await?;
        self.serve(listener, identity).await
    }

    /// Serves connections from an already bound listener.
    ///
    /// # Errors
    ///
    /// Returns an error if TLS setup fails. Accept and per-connection
    /// errors are logged and do not stop the server.
    pub async fn serve(&self, listener: TcpListener, identity: TlsIdentity) -> ServerResult<()> {
        let acceptor = identity.acceptor()?;
        let config = self.config().clone();
        let permits = Arc::new(Semaphore::new(config.max_connections));
        tracing::info!(addr = ?listener.local_addr().ok(), "Sync server listening");

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(25)).await;
                    continue;
                }
            };
            let Ok(permit) = Arc::clone(&permits).try_acquire_owned() else {
                tracing::warn!(%peer, "Connection limit reached, dropping");
                continue;
            };

            let acceptor = acceptor.clone();
            let handler = Arc::clone(&self.handler);
            let timeout = config.request_timeout;
            tokio::spawn(
                async move {
                    if let Err(e) = serve_connection(stream, acceptor, &handler, timeout).await {
                        tracing::debug!(error = %e, "Connection ended with error");
                    }
                    drop(permit);
                }
                .instrument(tracing::debug_span!("connection", %peer)),
            );
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    acceptor: TlsAcceptor,
    handler: &RequestHandler,
    timeout: Duration,
) -> ServerResult<()> {
    stream.set_nodelay(true)?;
    let mut tls = tokio::time::timeout(timeout, acceptor.accept(stream))
        .await
        .map_err(|_| ServerError::Timeout)??;
    tracing::debug!("TLS session established");

    loop {
        let body = match tokio::time::timeout(timeout, read_body(&mut tls)).await {
            Err(_) => return Err(ServerError::Timeout),
            Ok(result) => match result? {
                Some(body) => body,
                None => break,
            },
        };
        let reply = match SyncMessage::decode(&body) {
            Ok(message) => handler.handle(message),
            Err(e) => SyncMessage::Error(ErrorResponse::new(e.to_string())),
        };
        tokio::time::timeout(timeout, write_message(&mut tls, &reply))
            .await
            .map_err(|_| ServerError::Timeout)??;
    }

    if let Err(e) = tls.shutdown().await {
        tracing::trace!(error = %e, "Shutdown after EOF");
    }
    tracing::debug!("Connection closed");
    Ok(())
}

/// Reads one frame body; `None` on a clean hang-up between frames.
async fn read_body<S: AsyncRead + Unpin>(stream: &mut S) -> ServerResult<Option<Vec<u8>>> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    match stream.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        }
        .into());
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(Some(body))
}

async fn write_message<S: AsyncWrite + Unpin>(
    stream: &mut S,
    message: &SyncMessage,
) -> ServerResult<()> {
    let body = message.encode()?;
    stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gtd_sync_protocol::{write_frame, HandshakeRequest};

    #[tokio::test]
    async fn frame_reader_matches_blocking_writer() {
        let message = SyncMessage::HandshakeRequest(HandshakeRequest::new(3, "ana", "pw"));
        let mut wire = Vec::new();
        write_frame(&mut wire, &message).unwrap();

        let mut reader = wire.as_slice();
        let body = read_body(&mut reader).await.unwrap().unwrap();
        assert_eq!(SyncMessage::decode(&body).unwrap(), message);
        assert!(read_body(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn frame_writer_matches_blocking_reader() {
        let message = SyncMessage::Error(ErrorResponse::new("nope"));
        let mut wire = Vec::new();
        write_message(&mut wire, &message).await.unwrap();
        let decoded = gtd_sync_protocol::read_frame(&mut wire.as_slice()).unwrap();
        assert_eq!(decoded, message);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let wire = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes();
        let result = read_body(&mut wire.as_slice()).await;
        assert!(matches!(result, Err(ServerError::Protocol(_))));
    }

    #[test]
    fn garbage_key_fails_tls_setup() {
        let identity = TlsIdentity::from_der(vec![0x30, 0x00], vec![1, 2, 3]);
        assert!(matches!(identity.acceptor(), Err(ServerError::Tls(_))));
    }

    #[test]
    fn in_process_dispatch() {
        let server = SyncServer::new(
            ServerConfig::default(),
            CredentialStore::new().with_user("ana", "pw"),
        );
        let reply = server.handle_message(SyncMessage::HandshakeRequest(HandshakeRequest::new(
            3, "ana", "pw",
        )));
        assert!(matches!(reply, SyncMessage::HandshakeResponse(r) if r.success));
        assert_eq!(server.cursor(), 0);
        assert_eq!(server.command_count(), 0);
    }
}
