//! Length-prefixed frames.
//!
//! ```text
//! | length u32 BE (4) | type u8 (1) | CBOR body |
//! ```
//!
//! `length` counts the type byte and the body.

use crate::error::{ProtocolError, ProtocolResult};
use crate::messages::SyncMessage;
use std::io::{Read, Write};

/// Size of the length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest accepted frame (16 MiB).
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Writes one message as a frame and flushes.
///
/// # Errors
///
/// Returns an error if encoding or the write fails, or the message is
/// larger than [`MAX_FRAME_LEN`].
pub fn write_frame<W: Write>(writer: &mut W, message: &SyncMessage) -> ProtocolResult<()> {
    let body = message.encode()?;
    if body.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len: body.len(),
            max: MAX_FRAME_LEN,
        });
    }
    writer.write_all(&(body.len() as u32).to_be_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame and decodes its message.
///
/// # Errors
///
/// Returns an error on EOF, an oversized length prefix, or a bad body.
pub fn read_frame<R: Read>(reader: &mut R) -> ProtocolResult<SyncMessage> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header)?;
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    SyncMessage::decode(&body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{DownloadRequest, HandshakeRequest};
    use std::io::Cursor;

    #[test]
    fn frames_stream_back_to_back() {
        let first = SyncMessage::HandshakeRequest(HandshakeRequest::new(5, "ana", "secret"));
        let second = SyncMessage::DownloadRequest(DownloadRequest {
            session_token: "t".into(),
            cursor: 3,
            limit: 100,
        });

        let mut wire = Vec::new();
        write_frame(&mut wire, &first).unwrap();
        write_frame(&mut wire, &second).unwrap();

        let len = u32::from_be_bytes([wire[0], wire[1], wire[2], wire[3]]) as usize;
        assert_eq!(wire[FRAME_HEADER_LEN], 1);

        let mut reader = Cursor::new(wire.clone());
        assert_eq!(read_frame(&mut reader).unwrap(), first);
        assert_eq!(reader.position() as usize, FRAME_HEADER_LEN + len);
        assert_eq!(read_frame(&mut reader).unwrap(), second);
        assert!(matches!(read_frame(&mut reader), Err(ProtocolError::Io(_))));
    }

    #[test]
    fn oversized_prefix_is_refused_before_allocating() {
        let mut reader = Cursor::new(u32::MAX.to_be_bytes().to_vec());
        assert!(matches!(
            read_frame(&mut reader),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn truncated_body_is_an_io_error() {
        let mut wire = Vec::new();
        write_frame(
            &mut wire,
            &SyncMessage::HandshakeRequest(HandshakeRequest::new(1, "u", "p")),
        )
        .unwrap();
        wire.truncate(wire.len() - 2);
        assert!(matches!(
            read_frame(&mut Cursor::new(wire)),
            Err(ProtocolError::Io(_))
        ));
    }
}
