//! Commands: the only way the document changes.

use crate::error::MalformedCommand;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Width of an encoded item number.
pub const NUM_LEN: usize = 8;

/// Largest item number that fits in [`NUM_LEN`] digits.
pub const MAX_NUM: u32 = 99_999_999;

/// Kind of mutation a command performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Remove an item.
    DeleteItem,
    /// Remove a user tag.
    DeleteTag,
    /// Set an item's title, creating the item if needed.
    SetTitle,
    /// Set an item's tag, creating the tag (and item) if needed.
    TagItem,
}

impl Opcode {
    /// Returns the wire byte for this opcode.
    pub fn as_byte(self) -> u8 {
        match self {
            Opcode::DeleteItem => b'd',
            Opcode::DeleteTag => b'D',
            Opcode::SetTitle => b't',
            Opcode::TagItem => b'T',
        }
    }

    /// Parses a wire byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'd' => Some(Opcode::DeleteItem),
            b'D' => Some(Opcode::DeleteTag),
            b't' => Some(Opcode::SetTitle),
            b'T' => Some(Opcode::TagItem),
            _ => None,
        }
    }
}

/// An immutable mutation record.
///
/// `opcode` is kept as the raw byte so that commands with an opcode this
/// build does not know still round-trip through the store and the wire.
/// The applier skips them.
///
/// `sequence_id` and `origin_id` are assigned by the [`CommandStore`] when a
/// locally created command is appended; constructors leave them at zero.
///
/// [`CommandStore`]: crate::CommandStore
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Command {
    /// Per-origin monotonically increasing sequence id.
    pub sequence_id: u64,
    /// Replica that created the command.
    pub origin_id: u64,
    /// Opcode byte (`d`, `D`, `t`, `T`).
    pub opcode: u8,
    /// Encoded payload.
    pub payload: Vec<u8>,
}

impl Command {
    /// Creates an unsequenced command.
    pub fn new(opcode: Opcode, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            sequence_id: 0,
            origin_id: 0,
            opcode: opcode.as_byte(),
            payload: payload.into(),
        }
    }

    /// delete-item(num).
    pub fn delete_item(num: u32) -> Self {
        Self::new(Opcode::DeleteItem, encode_num(num))
    }

    /// delete-tag(name).
    pub fn delete_tag(name: &str) -> Self {
        Self::new(Opcode::DeleteTag, name)
    }

    /// set-title(num, title).
    pub fn set_title(num: u32, title: &str) -> Self {
        Self::new(Opcode::SetTitle, format!("{} {}", encode_num(num), title))
    }

    /// tag-item(num, tag).
    pub fn tag_item(num: u32, tag: &str) -> Self {
        Self::new(Opcode::TagItem, format!("{} {}", encode_num(num), tag))
    }

    /// Returns this command stamped with an origin and sequence id.
    #[must_use]
    pub fn sequenced(mut self, origin_id: u64, sequence_id: u64) -> Self {
        self.origin_id = origin_id;
        self.sequence_id = sequence_id;
        self
    }

    /// Returns the opcode, if known.
    pub fn kind(&self) -> Option<Opcode> {
        Opcode::from_byte(self.opcode)
    }

    /// Decodes the payload into a typed mutation.
    ///
    /// # Errors
    ///
    /// Returns a [`MalformedCommand`] describing the first problem found.
    pub fn decode(&self) -> Result<Mutation, MalformedCommand> {
        let opcode = self
            .kind()
            .ok_or(MalformedCommand::UnknownOpcode(self.opcode))?;
        let text = std::str::from_utf8(&self.payload).map_err(|_| MalformedCommand::InvalidUtf8)?;

        match opcode {
            Opcode::DeleteItem => Ok(Mutation::DeleteItem {
                num: parse_num(text)?,
            }),
            Opcode::DeleteTag => {
                if text.is_empty() {
                    return Err(MalformedCommand::EmptyTag);
                }
                Ok(Mutation::DeleteTag {
                    tag: text.to_string(),
                })
            }
            Opcode::SetTitle => {
                let (num, title) = split_num(text)?;
                Ok(Mutation::SetTitle {
                    num,
                    title: title.to_string(),
                })
            }
            Opcode::TagItem => {
                let (num, tag) = split_num(text)?;
                if tag.is_empty() {
                    return Err(MalformedCommand::EmptyTag);
                }
                Ok(Mutation::TagItem {
                    num,
                    tag: tag.to_string(),
                })
            }
        }
    }
}

/// A decoded command payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Remove item `num` if present.
    DeleteItem {
        /// Item number.
        num: u32,
    },
    /// Remove a user tag by name.
    DeleteTag {
        /// Tag name.
        tag: String,
    },
    /// Set (or create) item `num` with a title.
    SetTitle {
        /// Item number.
        num: u32,
        /// New title; may be empty.
        title: String,
    },
    /// Set (or create) item `num`'s tag.
    TagItem {
        /// Item number.
        num: u32,
        /// Stored tag, possibly date-deferred.
        tag: String,
    },
}

/// A command plus sync bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotatedCommand {
    /// The command itself.
    pub command: Command,
    /// Creation time, milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Whether the server has confirmed receipt.
    ///
    /// Remote commands are history and are always acknowledged.
    pub acknowledged: bool,
}

impl AnnotatedCommand {
    /// Wraps a freshly created, not yet synced command.
    pub fn new(command: Command) -> Self {
        Self {
            command,
            timestamp: now_millis(),
            acknowledged: false,
        }
    }

    /// Wraps a command received from the server.
    pub fn remote(command: Command) -> Self {
        Self {
            command,
            timestamp: now_millis(),
            acknowledged: true,
        }
    }
}

/// Encodes an item number as [`NUM_LEN`] zero-padded digits.
pub fn encode_num(num: u32) -> String {
    format!("{num:0width$}", width = NUM_LEN)
}

/// Parses a fixed-width item number.
///
/// # Errors
///
/// Fails unless `text` is exactly [`NUM_LEN`] ASCII digits.
pub fn parse_num(text: &str) -> Result<u32, MalformedCommand> {
    if text.len() != NUM_LEN || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(MalformedCommand::InvalidNumber(text.to_string()));
    }
    text.parse()
        .map_err(|_| MalformedCommand::InvalidNumber(text.to_string()))
}

/// Draws a random item number in `1..=MAX_NUM` for which `taken` is false.
pub fn generate_num(mut taken: impl FnMut(u32) -> bool) -> u32 {
    loop {
        let num = rand::random::<u32>() % MAX_NUM + 1;
        if !taken(num) {
            return num;
        }
    }
}

fn split_num(text: &str) -> Result<(u32, &str), MalformedCommand> {
    let (num, rest) = text
        .split_once(' ')
        .ok_or_else(|| MalformedCommand::MissingSeparator(text.to_string()))?;
    Ok((parse_num(num)?, rest))
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_bytes_roundtrip() {
        for op in [
            Opcode::DeleteItem,
            Opcode::DeleteTag,
            Opcode::SetTitle,
            Opcode::TagItem,
        ] {
            assert_eq!(Opcode::from_byte(op.as_byte()), Some(op));
        }
        assert_eq!(Opcode::from_byte(b'x'), None);
    }

    #[test]
    fn constructors_encode_fixed_width() {
        assert_eq!(Command::set_title(42, "Buy milk").payload, b"00000042 Buy milk");
        assert_eq!(Command::tag_item(7, "todo").payload, b"00000007 todo");
        assert_eq!(Command::delete_item(1).payload, b"00000001");
        assert_eq!(Command::delete_tag("errands").payload, b"errands");
    }

    #[test]
    fn decode_set_title_keeps_spaces_in_title() {
        let cmd = Command::set_title(3, "call  mom later");
        assert_eq!(
            cmd.decode().unwrap(),
            Mutation::SetTitle {
                num: 3,
                title: "call  mom later".into()
            }
        );
    }

    #[test]
    fn empty_title_is_allowed() {
        let cmd = Command::new(Opcode::SetTitle, "00000001 ");
        assert_eq!(
            cmd.decode().unwrap(),
            Mutation::SetTitle {
                num: 1,
                title: String::new()
            }
        );
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        let cases: [(Opcode, &[u8]); 6] = [
            (Opcode::DeleteItem, b"42"),
            (Opcode::DeleteItem, b"0000004x"),
            (Opcode::SetTitle, b"00000042"),
            (Opcode::TagItem, b"00000042 "),
            (Opcode::DeleteTag, b""),
            (Opcode::SetTitle, &[0xff, 0xfe]),
        ];
        for (op, payload) in cases {
            assert!(Command::new(op, payload).decode().is_err(), "{op:?} {payload:?}");
        }
    }

    #[test]
    fn unknown_opcode_is_malformed() {
        let cmd = Command {
            sequence_id: 1,
            origin_id: 1,
            opcode: b'z',
            payload: b"00000001".to_vec(),
        };
        assert_eq!(cmd.decode(), Err(MalformedCommand::UnknownOpcode(b'z')));
    }

    #[test]
    fn generate_num_avoids_taken() {
        let num = generate_num(|n| n % 2 == 0);
        assert_eq!(num % 2, 1);
        assert!((1..=MAX_NUM).contains(&num));
    }
}
