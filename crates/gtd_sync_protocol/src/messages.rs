//! Protocol messages.

use crate::error::{ProtocolError, ProtocolResult};
use gtd_core::{AnnotatedCommand, Command};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Version spoken by this build. Peers must match exactly.
pub const PROTOCOL_VERSION: u16 = 1;

/// A sync protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// Handshake request.
    HandshakeRequest(HandshakeRequest),
    /// Handshake response.
    HandshakeResponse(HandshakeResponse),
    /// Upload request.
    UploadRequest(UploadRequest),
    /// Upload response.
    UploadResponse(UploadResponse),
    /// Download request.
    DownloadRequest(DownloadRequest),
    /// Download response.
    DownloadResponse(DownloadResponse),
    /// Request-level failure reported by the server.
    Error(ErrorResponse),
}

impl SyncMessage {
    /// Returns the message type code.
    pub fn type_code(&self) -> u8 {
        match self {
            SyncMessage::HandshakeRequest(_) => 1,
            SyncMessage::HandshakeResponse(_) => 2,
            SyncMessage::UploadRequest(_) => 3,
            SyncMessage::UploadResponse(_) => 4,
            SyncMessage::DownloadRequest(_) => 5,
            SyncMessage::DownloadResponse(_) => 6,
            SyncMessage::Error(_) => 15,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            SyncMessage::HandshakeRequest(_) => "HandshakeRequest",
            SyncMessage::HandshakeResponse(_) => "HandshakeResponse",
            SyncMessage::UploadRequest(_) => "UploadRequest",
            SyncMessage::UploadResponse(_) => "UploadResponse",
            SyncMessage::DownloadRequest(_) => "DownloadRequest",
            SyncMessage::DownloadResponse(_) => "DownloadResponse",
            SyncMessage::Error(_) => "Error",
        }
    }

    /// Encodes as type byte followed by the CBOR body.
    ///
    /// # Errors
    ///
    /// Returns an error if the body cannot be serialized.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let mut buf = vec![self.type_code()];
        match self {
            SyncMessage::HandshakeRequest(m) => write_body(m, &mut buf)?,
            SyncMessage::HandshakeResponse(m) => write_body(m, &mut buf)?,
            SyncMessage::UploadRequest(m) => write_body(m, &mut buf)?,
            SyncMessage::UploadResponse(m) => write_body(m, &mut buf)?,
            SyncMessage::DownloadRequest(m) => write_body(m, &mut buf)?,
            SyncMessage::DownloadResponse(m) => write_body(m, &mut buf)?,
            SyncMessage::Error(m) => write_body(m, &mut buf)?,
        }
        Ok(buf)
    }

    /// Decodes a type byte plus CBOR body.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty input, an unknown type byte, or a body
    /// that does not match its type.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let (&code, body) = bytes.split_first().ok_or(ProtocolError::EmptyFrame)?;
        Ok(match code {
            1 => SyncMessage::HandshakeRequest(read_body(body)?),
            2 => SyncMessage::HandshakeResponse(read_body(body)?),
            3 => SyncMessage::UploadRequest(read_body(body)?),
            4 => SyncMessage::UploadResponse(read_body(body)?),
            5 => SyncMessage::DownloadRequest(read_body(body)?),
            6 => SyncMessage::DownloadResponse(read_body(body)?),
            15 => SyncMessage::Error(read_body(body)?),
            other => return Err(ProtocolError::UnknownMessageType(other)),
        })
    }
}

fn write_body<T: Serialize>(body: &T, buf: &mut Vec<u8>) -> ProtocolResult<()> {
    ciborium::into_writer(body, buf).map_err(|e| ProtocolError::Encode(e.to_string()))
}

fn read_body<T: DeserializeOwned>(body: &[u8]) -> ProtocolResult<T> {
    ciborium::from_reader(body).map_err(|e| ProtocolError::Decode(e.to_string()))
}

/// Opens a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Replica origin id.
    pub origin_id: u64,
    /// Account name.
    pub username: String,
    /// Account password.
    pub password: String,
    /// Protocol version.
    pub protocol_version: u16,
}

impl HandshakeRequest {
    /// Creates a handshake for the current protocol version.
    pub fn new(origin_id: u64, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            origin_id,
            username: username.into(),
            password: password.into(),
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

/// Result of a handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Whether the session was opened.
    pub success: bool,
    /// Reason for refusal.
    pub error: Option<String>,
    /// Token to present on every later request.
    pub session_token: Option<String>,
    /// Newest server cursor at handshake time.
    pub server_cursor: u64,
    /// Protocol version spoken by the server.
    pub protocol_version: u16,
}

impl HandshakeResponse {
    /// Accepts the session.
    pub fn accepted(session_token: impl Into<String>, server_cursor: u64) -> Self {
        Self {
            success: true,
            error: None,
            session_token: Some(session_token.into()),
            server_cursor,
            protocol_version: PROTOCOL_VERSION,
        }
    }

    /// Refuses the session.
    pub fn refused(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            session_token: None,
            server_cursor: 0,
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

/// Local commands for the server, in sequence order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRequest {
    /// Session token from the handshake.
    pub session_token: String,
    /// Pending commands since the last acknowledgement.
    pub commands: Vec<AnnotatedCommand>,
}

/// Server confirmation of an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    /// Whether the upload was stored.
    pub success: bool,
    /// Highest local sequence id the server now holds for this origin.
    pub acknowledged_up_to: u64,
    /// Reason for failure.
    pub error: Option<String>,
}

impl UploadResponse {
    /// A successful upload.
    pub fn accepted(acknowledged_up_to: u64) -> Self {
        Self {
            success: true,
            acknowledged_up_to,
            error: None,
        }
    }

    /// A rejected upload.
    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            acknowledged_up_to: 0,
            error: Some(error.into()),
        }
    }
}

/// Asks for commands from other origins after `cursor`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    /// Session token from the handshake.
    pub session_token: String,
    /// Last server cursor the client has applied.
    pub cursor: u64,
    /// Maximum commands per page.
    pub limit: u32,
}

/// One page of remote commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadResponse {
    /// Commands in server order.
    pub commands: Vec<Command>,
    /// Cursor to request the next page with.
    pub new_cursor: u64,
    /// Whether another page is waiting.
    pub has_more: bool,
}

/// Request-level error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human-readable message.
    pub message: String,
}

impl ErrorResponse {
    /// Creates an error response.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn download_preserves_command_order() {
        let commands = vec![
            Command::tag_item(7, "todo").sequenced(3, 1),
            Command::set_title(7, "call bank").sequenced(3, 2),
            Command::delete_tag("errands").sequenced(4, 1),
        ];
        let msg = SyncMessage::DownloadResponse(DownloadResponse {
            commands: commands.clone(),
            new_cursor: 12,
            has_more: false,
        });

        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        let SyncMessage::DownloadResponse(response) = decoded else {
            panic!("wrong message type");
        };
        assert_eq!(response.commands, commands);
        assert_eq!(response.new_cursor, 12);
    }

    #[test]
    fn type_byte_leads_the_encoding() {
        let msg = SyncMessage::Error(ErrorResponse::new("session expired"));
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes[0], 15);
        assert_eq!(SyncMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn unknown_type_and_bad_body_fail() {
        assert!(matches!(
            SyncMessage::decode(&[99, 0xa0]),
            Err(ProtocolError::UnknownMessageType(99))
        ));
        assert!(matches!(SyncMessage::decode(&[]), Err(ProtocolError::EmptyFrame)));
        assert!(matches!(
            SyncMessage::decode(&[1, 0xff, 0x00]),
            Err(ProtocolError::Decode(_))
        ));
    }

    #[test]
    fn body_of_another_type_is_rejected() {
        let bytes = SyncMessage::UploadResponse(UploadResponse::accepted(3))
            .encode()
            .unwrap();
        let mut retyped = bytes.clone();
        retyped[0] = 1;
        assert!(SyncMessage::decode(&retyped).is_err());
    }

    proptest! {
        #[test]
        fn upload_survives_the_wire(
            titles in prop::collection::vec("[ -~]{0,24}", 0..16),
            token in "[a-f0-9]{16}",
        ) {
            let commands: Vec<AnnotatedCommand> = titles
                .iter()
                .enumerate()
                .map(|(i, t)| AnnotatedCommand::new(
                    Command::set_title(i as u32 + 1, t).sequenced(9, i as u64 + 1),
                ))
                .collect();
            let msg = SyncMessage::UploadRequest(UploadRequest {
                session_token: token,
                commands,
            });
            prop_assert_eq!(SyncMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
        }
    }
}
