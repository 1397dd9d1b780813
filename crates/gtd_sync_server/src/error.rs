//! Error types for the sync server.

use gtd_sync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request format.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Bad username or password.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Missing, forged or expired session token.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// Protocol version mismatch.
    #[error("protocol version mismatch: client {client}, server {server}")]
    ProtocolMismatch {
        /// Version the client spoke.
        client: u16,
        /// Version this server speaks.
        server: u16,
    },

    /// Frame or message encoding error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// TLS setup failed.
    #[error("tls error: {0}")]
    Tls(String),

    /// Request took too long.
    #[error("request timed out")]
    Timeout,

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Returns true if the client is at fault.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::InvalidRequest(_)
                | ServerError::AuthenticationFailed(_)
                | ServerError::NotAuthorized(_)
                | ServerError::ProtocolMismatch { .. }
                | ServerError::Protocol(_)
                | ServerError::Timeout
        )
    }

    /// Returns true if the server is at fault.
    pub fn is_server_error(&self) -> bool {
        matches!(
            self,
            ServerError::Tls(_) | ServerError::Internal(_) | ServerError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(ServerError::InvalidRequest("bad".into()).is_client_error());
        assert!(ServerError::NotAuthorized("expired".into()).is_client_error());
        assert!(ServerError::Internal("oops".into()).is_server_error());
        assert!(!ServerError::InvalidRequest("bad".into()).is_server_error());
        assert!(!ServerError::Tls("no key".into()).is_client_error());
    }

    #[test]
    fn error_display() {
        let err = ServerError::ProtocolMismatch {
            client: 2,
            server: 1,
        };
        let msg = err.to_string();
        assert!(msg.contains("client 2"));
        assert!(msg.contains("server 1"));
    }
}
