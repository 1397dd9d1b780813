//! Server configuration.

use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for the sync server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Time allowed for the TLS handshake and for each request frame.
    pub request_timeout: Duration,
    /// Maximum commands per download page.
    pub max_download_batch: u32,
    /// Maximum commands per upload.
    pub max_upload_batch: usize,
    /// How long a session token stays valid.
    pub session_expiry: Duration,
    /// Secret key for session tokens. Random per process if unset.
    pub token_secret: Option<Vec<u8>>,
}

impl ServerConfig {
    /// Creates a new server configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: 256,
            request_timeout: Duration::from_secs(30),
            max_download_batch: 500,
            max_upload_batch: 10_000,
            session_expiry: Duration::from_secs(60 * 60),
            token_secret: None,
        }
    }

    /// Sets the maximum concurrent connections.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max.max(1);
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the maximum download page size.
    pub fn with_max_download_batch(mut self, size: u32) -> Self {
        self.max_download_batch = size.max(1);
        self
    }

    /// Sets the maximum upload size.
    pub fn with_max_upload_batch(mut self, size: usize) -> Self {
        self.max_upload_batch = size;
        self
    }

    /// Sets how long session tokens stay valid.
    pub fn with_session_expiry(mut self, expiry: Duration) -> Self {
        self.session_expiry = expiry;
        self
    }

    /// Signs session tokens with a fixed secret.
    pub fn with_token_secret(mut self, secret: Vec<u8>) -> Self {
        self.token_secret = Some(secret);
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], 7443)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.max_connections, 256);
        assert_eq!(config.bind_addr.port(), 7443);
        assert!(config.token_secret.is_none());
    }

    #[test]
    fn config_builder() {
        let config = ServerConfig::new("0.0.0.0:9000".parse().unwrap())
            .with_max_connections(0)
            .with_max_download_batch(50)
            .with_token_secret(vec![1, 2, 3, 4]);

        assert_eq!(config.max_connections, 1);
        assert_eq!(config.max_download_batch, 50);
        assert_eq!(config.token_secret, Some(vec![1, 2, 3, 4]));
    }
}
