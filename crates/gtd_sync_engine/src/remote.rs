//! Transport over the pinned TLS channel.

use crate::channel::{CertificatePolicy, SecureChannel};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::transport::SyncTransport;
use gtd_sync_protocol::{
    DownloadRequest, DownloadResponse, HandshakeRequest, HandshakeResponse, SyncMessage,
    UploadRequest, UploadResponse,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Talks to the sync server over a [`SecureChannel`].
///
/// Each `connect` opens a fresh channel; `close` tears it down.
#[derive(Debug)]
pub struct ChannelTransport {
    address: String,
    server_name: String,
    timeout: Duration,
    policy: Arc<dyn CertificatePolicy>,
    channel: Mutex<Option<SecureChannel>>,
}

impl ChannelTransport {
    /// Creates a transport for the server in `config`.
    pub fn new(config: &SyncConfig, policy: Arc<dyn CertificatePolicy>) -> Self {
        Self {
            address: config.address.clone(),
            server_name: config.server_name.clone(),
            timeout: config.timeout,
            policy,
            channel: Mutex::new(None),
        }
    }

    fn exchange(&self, message: SyncMessage) -> SyncResult<SyncMessage> {
        let mut guard = self.channel.lock();
        let channel = guard.as_mut().ok_or(SyncError::NotConnected)?;
        tracing::trace!(message = message.name(), "Sending");
        match channel.request(&message) {
            Ok(SyncMessage::Error(error)) => Err(SyncError::ServerError(error.message)),
            Ok(reply) => Ok(reply),
            Err(e) => {
                // A failed exchange leaves the stream mid-frame.
                guard.take();
                Err(e)
            }
        }
    }
}

fn unexpected(expected: &str, got: &SyncMessage) -> SyncError {
    SyncError::Protocol(format!("expected {expected}, got {}", got.name()))
}

impl SyncTransport for ChannelTransport {
    fn connect(&self) -> SyncResult<()> {
        let channel = SecureChannel::connect(
            &self.address,
            &self.server_name,
            Arc::clone(&self.policy),
            self.timeout,
        )?;
        if let Some(previous) = self.channel.lock().replace(channel) {
            previous.close();
        }
        Ok(())
    }

    fn handshake(&self, request: &HandshakeRequest) -> SyncResult<HandshakeResponse> {
        match self.exchange(SyncMessage::HandshakeRequest(request.clone()))? {
            SyncMessage::HandshakeResponse(response) => Ok(response),
            other => Err(unexpected("HandshakeResponse", &other)),
        }
    }

    fn upload(&self, request: &UploadRequest) -> SyncResult<UploadResponse> {
        match self.exchange(SyncMessage::UploadRequest(request.clone()))? {
            SyncMessage::UploadResponse(response) => Ok(response),
            other => Err(unexpected("UploadResponse", &other)),
        }
    }

    fn download(&self, request: &DownloadRequest) -> SyncResult<DownloadResponse> {
        match self.exchange(SyncMessage::DownloadRequest(request.clone()))? {
            SyncMessage::DownloadResponse(response) => Ok(response),
            other => Err(unexpected("DownloadResponse", &other)),
        }
    }

    fn is_connected(&self) -> bool {
        self.channel.lock().is_some()
    }

    fn close(&self) -> SyncResult<()> {
        if let Some(channel) = self.channel.lock().take() {
            channel.close();
        }
        Ok(())
    }
}
