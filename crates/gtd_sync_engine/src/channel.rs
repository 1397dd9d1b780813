//! Certificate-pinned TLS channel.
//!
//! The channel trusts exactly one certificate, compared byte for byte, and
//! exactly one hostname. No certificate authority is consulted and no
//! client certificate is presented; credentials travel in the handshake
//! message instead.

use crate::config::host_of;
use crate::error::{SyncError, SyncResult};
use gtd_sync_protocol::{read_frame, write_frame, SyncMessage};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    CertificateError, ClientConfig, ClientConnection, DigitallySignedStruct, SignatureScheme,
    StreamOwned,
};
use std::fmt;
use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Decides whether a server may be trusted.
///
/// Given the peer's raw DER certificate and the hostname the client is
/// connecting to, return whether to trust it.
pub trait CertificatePolicy: Send + Sync + fmt::Debug {
    /// Returns true if the connection may proceed.
    fn is_trusted(&self, certificate: &[u8], hostname: &str) -> bool;
}

/// Trusts one certificate for one hostname.
#[derive(Clone, PartialEq, Eq)]
pub struct PinnedCertificate {
    certificate: Vec<u8>,
    hostname: String,
}

impl PinnedCertificate {
    /// Pins `certificate` (DER) for `hostname`.
    pub fn new(certificate: impl Into<Vec<u8>>, hostname: impl Into<String>) -> Self {
        Self {
            certificate: certificate.into(),
            hostname: hostname.into(),
        }
    }

    /// Reads the pinned DER certificate from a file.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] if the file cannot be read or is empty.
    pub fn from_der_file(path: &Path, hostname: impl Into<String>) -> SyncResult<Self> {
        let certificate = std::fs::read(path)
            .map_err(|e| SyncError::Config(format!("{}: {e}", path.display())))?;
        if certificate.is_empty() {
            return Err(SyncError::Config(format!(
                "{}: empty certificate",
                path.display()
            )));
        }
        Ok(Self::new(certificate, hostname))
    }

    /// The pinned hostname.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }
}

impl fmt::Debug for PinnedCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedCertificate")
            .field("hostname", &self.hostname)
            .field("certificate_len", &self.certificate.len())
            .finish()
    }
}

impl CertificatePolicy for PinnedCertificate {
    fn is_trusted(&self, certificate: &[u8], hostname: &str) -> bool {
        certificate == self.certificate.as_slice() && hostname == self.hostname
    }
}

#[derive(Debug)]
struct PinnedVerifier {
    policy: Arc<dyn CertificatePolicy>,
    target_host: String,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for PinnedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if !intermediates.is_empty() {
            tracing::warn!(
                chain_len = intermediates.len() + 1,
                "Server presented a certificate chain"
            );
            return Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ));
        }

        let hostname = self.target_host.as_str();
        if self.policy.is_trusted(end_entity.as_ref(), hostname) {
            Ok(ServerCertVerified::assertion())
        } else {
            tracing::warn!(%hostname, "Server certificate or hostname is not pinned");
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Builds a client TLS configuration that defers all trust to `policy`.
///
/// `target_host` is the host being dialled; it is what the policy sees,
/// whatever name is sent for SNI.
///
/// # Errors
///
/// Returns an error if the crypto provider rejects the protocol versions.
pub fn client_config(
    policy: Arc<dyn CertificatePolicy>,
    target_host: &str,
) -> SyncResult<ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let algorithms = provider.signature_verification_algorithms;
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| SyncError::transport_fatal(format!("TLS configuration: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedVerifier {
            policy,
            target_host: target_host.to_string(),
            algorithms,
        }))
        .with_no_client_auth();
    Ok(config)
}

/// An established, verified connection to the sync server.
pub struct SecureChannel {
    stream: StreamOwned<ClientConnection, TcpStream>,
}

impl fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureChannel")
            .field("peer", &self.stream.sock.peer_addr().ok())
            .finish()
    }
}

impl SecureChannel {
    /// Connects to `address` and completes the TLS handshake.
    ///
    /// `server_name` is sent for SNI. The policy judges the host part of
    /// `address`, so a pin on one hostname never trusts another target.
    /// Every socket operation is bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::CertificateRejected`] if the policy refuses the
    /// server, [`SyncError::Timeout`] on timeout, or a transport error.
    pub fn connect(
        address: &str,
        server_name: &str,
        policy: Arc<dyn CertificatePolicy>,
        timeout: Duration,
    ) -> SyncResult<Self> {
        let config = Arc::new(client_config(policy, host_of(address))?);
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| SyncError::Config(format!("invalid server name {server_name:?}: {e}")))?;

        let mut tcp = connect_tcp(address, timeout)?;
        tcp.set_read_timeout(Some(timeout))?;
        tcp.set_write_timeout(Some(timeout))?;
        tcp.set_nodelay(true)?;

        let mut conn = ClientConnection::new(config, name)
            .map_err(|e| SyncError::transport_fatal(format!("TLS setup: {e}")))?;
        while conn.is_handshaking() {
            conn.complete_io(&mut tcp)?;
        }
        tracing::debug!(%address, %server_name, "Secure channel established");

        Ok(Self {
            stream: StreamOwned::new(conn, tcp),
        })
    }

    /// Sends one message and waits for the reply.
    ///
    /// # Errors
    ///
    /// Returns an error if the write or read fails or times out.
    pub fn request(&mut self, message: &SyncMessage) -> SyncResult<SyncMessage> {
        write_frame(&mut self.stream, message)?;
        Ok(read_frame(&mut self.stream)?)
    }

    /// Sends close-notify and drops the connection.
    pub fn close(mut self) {
        self.stream.conn.send_close_notify();
        if let Err(e) = self.stream.flush() {
            tracing::debug!(error = %e, "Close-notify not delivered");
        }
    }
}

fn connect_tcp(address: &str, timeout: Duration) -> SyncResult<TcpStream> {
    let mut last_error = None;
    for addr in address.to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }
    Err(match last_error {
        Some(e) => e.into(),
        None => SyncError::Config(format!("{address} resolves to no address")),
    })
}
