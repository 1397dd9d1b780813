//! Transport layer abstraction for sync rounds.

use crate::error::{SyncError, SyncResult};
use gtd_sync_protocol::{
    DownloadRequest, DownloadResponse, HandshakeRequest, HandshakeResponse, UploadRequest,
    UploadResponse,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

/// A sync transport handles network communication with the sync server.
///
/// One sync round is `connect`, `handshake`, zero or more `upload`s, one or
/// more `download`s, then `close`.
pub trait SyncTransport: Send + Sync {
    /// Opens the connection.
    fn connect(&self) -> SyncResult<()>;

    /// Performs a handshake with the server.
    fn handshake(&self, request: &HandshakeRequest) -> SyncResult<HandshakeResponse>;

    /// Sends local commands.
    fn upload(&self, request: &UploadRequest) -> SyncResult<UploadResponse>;

    /// Fetches one page of remote commands.
    fn download(&self, request: &DownloadRequest) -> SyncResult<DownloadResponse>;

    /// Checks if the transport is connected.
    fn is_connected(&self) -> bool;

    /// Closes the transport connection.
    fn close(&self) -> SyncResult<()>;
}

/// A scripted transport for testing.
///
/// Download responses are served from a queue; once it is empty an empty
/// final page is returned. Every upload request is recorded.
#[derive(Debug, Default)]
pub struct MockTransport {
    connected: AtomicBool,
    refuse_connect: AtomicBool,
    fail_download: AtomicBool,
    handshake_response: Mutex<Option<HandshakeResponse>>,
    upload_response: Mutex<Option<UploadResponse>>,
    download_pages: Mutex<VecDeque<DownloadResponse>>,
    uploads: Mutex<Vec<UploadRequest>>,
    downloads: Mutex<Vec<DownloadRequest>>,
}

impl MockTransport {
    /// Creates a mock that accepts the handshake with token `"mock"`.
    pub fn new() -> Self {
        let mock = Self::default();
        mock.set_handshake_response(HandshakeResponse::accepted("mock", 0));
        mock
    }

    /// Sets the handshake response.
    pub fn set_handshake_response(&self, response: HandshakeResponse) {
        *self.handshake_response.lock() = Some(response);
    }

    /// Sets the upload response.
    pub fn set_upload_response(&self, response: UploadResponse) {
        *self.upload_response.lock() = Some(response);
    }

    /// Queues a download page.
    pub fn push_download_page(&self, response: DownloadResponse) {
        self.download_pages.lock().push_back(response);
    }

    /// Makes `connect` fail as if the server were unreachable.
    pub fn set_refuse_connect(&self, refuse: bool) {
        self.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    /// Makes `download` fail.
    pub fn set_fail_download(&self, fail: bool) {
        self.fail_download.store(fail, Ordering::SeqCst);
    }

    /// Upload requests received so far.
    pub fn uploads(&self) -> Vec<UploadRequest> {
        self.uploads.lock().clone()
    }

    /// Download requests received so far.
    pub fn downloads(&self) -> Vec<DownloadRequest> {
        self.downloads.lock().clone()
    }

    fn ensure_connected(&self) -> SyncResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(SyncError::NotConnected)
        }
    }
}

impl SyncTransport for MockTransport {
    fn connect(&self) -> SyncResult<()> {
        if self.refuse_connect.load(Ordering::SeqCst) {
            return Err(SyncError::transport_retryable("connection refused"));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn handshake(&self, _request: &HandshakeRequest) -> SyncResult<HandshakeResponse> {
        self.ensure_connected()?;
        self.handshake_response
            .lock()
            .clone()
            .ok_or_else(|| SyncError::Protocol("No mock handshake response set".into()))
    }

    fn upload(&self, request: &UploadRequest) -> SyncResult<UploadResponse> {
        self.ensure_connected()?;
        self.uploads.lock().push(request.clone());
        if let Some(response) = self.upload_response.lock().clone() {
            return Ok(response);
        }
        let up_to = request
            .commands
            .iter()
            .map(|c| c.command.sequence_id)
            .max()
            .unwrap_or(0);
        Ok(UploadResponse::accepted(up_to))
    }

    fn download(&self, request: &DownloadRequest) -> SyncResult<DownloadResponse> {
        self.ensure_connected()?;
        self.downloads.lock().push(request.clone());
        if self.fail_download.load(Ordering::SeqCst) {
            return Err(SyncError::transport_retryable("connection reset during download"));
        }
        Ok(self
            .download_pages
            .lock()
            .pop_front()
            .unwrap_or(DownloadResponse {
                commands: Vec::new(),
                new_cursor: request.cursor,
                has_more: false,
            }))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) -> SyncResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}
