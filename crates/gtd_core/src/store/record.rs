//! Command log record framing.
//!
//! ```text
//! | magic "GCMD" (4) | version u16 (2) | type u8 (1) | length u32 (4) | payload | crc32 (4) |
//! ```
//!
//! All integers are little-endian. The CRC covers everything before it.

use crate::command::{AnnotatedCommand, Command};
use crate::error::{CoreError, CoreResult};

/// Magic bytes at the start of every record.
pub const LOG_MAGIC: [u8; 4] = *b"GCMD";

/// Current record format version.
pub const LOG_VERSION: u16 = 1;

const HEADER_SIZE: usize = 11;
const CRC_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum RecordType {
    Origin = 1,
    Batch = 2,
    Acknowledge = 3,
    Cursor = 4,
}

impl RecordType {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Origin),
            2 => Some(Self::Batch),
            3 => Some(Self::Acknowledge),
            4 => Some(Self::Cursor),
            _ => None,
        }
    }
}

/// A record in the command log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// Identity of the local replica. First record of every log.
    Origin {
        /// Origin id stamped on local commands.
        origin_id: u64,
    },
    /// Commands appended together; the unit of atomicity.
    Batch {
        /// True for local commands awaiting upload.
        pending: bool,
        /// Commands in append order.
        commands: Vec<AnnotatedCommand>,
    },
    /// Local commands up to this sequence id reached the server.
    Acknowledge {
        /// Highest acknowledged sequence id.
        up_to: u64,
    },
    /// Server download position.
    Cursor {
        /// Last server cursor fully applied.
        cursor: u64,
    },
}

impl LogRecord {
    fn record_type(&self) -> RecordType {
        match self {
            LogRecord::Origin { .. } => RecordType::Origin,
            LogRecord::Batch { .. } => RecordType::Batch,
            LogRecord::Acknowledge { .. } => RecordType::Acknowledge,
            LogRecord::Cursor { .. } => RecordType::Cursor,
        }
    }

    fn encode_payload(&self) -> Vec<u8> {
        match self {
            LogRecord::Origin { origin_id } => origin_id.to_le_bytes().to_vec(),
            LogRecord::Acknowledge { up_to } => up_to.to_le_bytes().to_vec(),
            LogRecord::Cursor { cursor } => cursor.to_le_bytes().to_vec(),
            LogRecord::Batch { pending, commands } => {
                let mut buf = Vec::new();
                buf.push(u8::from(*pending));
                buf.extend_from_slice(&(commands.len() as u32).to_le_bytes());
                for entry in commands {
                    let cmd = &entry.command;
                    buf.extend_from_slice(&cmd.sequence_id.to_le_bytes());
                    buf.extend_from_slice(&cmd.origin_id.to_le_bytes());
                    buf.push(cmd.opcode);
                    buf.extend_from_slice(&entry.timestamp.to_le_bytes());
                    buf.extend_from_slice(&(cmd.payload.len() as u32).to_le_bytes());
                    buf.extend_from_slice(&cmd.payload);
                }
                buf
            }
        }
    }

    fn decode_payload(record_type: RecordType, payload: &[u8]) -> CoreResult<Self> {
        let mut reader = Reader::new(payload);
        let record = match record_type {
            RecordType::Origin => LogRecord::Origin {
                origin_id: reader.u64()?,
            },
            RecordType::Acknowledge => LogRecord::Acknowledge {
                up_to: reader.u64()?,
            },
            RecordType::Cursor => LogRecord::Cursor {
                cursor: reader.u64()?,
            },
            RecordType::Batch => {
                let pending = reader.u8()? != 0;
                let count = reader.u32()? as usize;
                let mut commands = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    let sequence_id = reader.u64()?;
                    let origin_id = reader.u64()?;
                    let opcode = reader.u8()?;
                    let timestamp = reader.u64()? as i64;
                    let len = reader.u32()? as usize;
                    let payload = reader.bytes(len)?.to_vec();
                    commands.push(AnnotatedCommand {
                        command: Command {
                            sequence_id,
                            origin_id,
                            opcode,
                            payload,
                        },
                        timestamp,
                        acknowledged: !pending,
                    });
                }
                LogRecord::Batch { pending, commands }
            }
        };
        if !reader.is_empty() {
            return Err(CoreError::log_corruption("trailing bytes in record payload"));
        }
        Ok(record)
    }
}

/// Encodes a record into its on-disk frame.
pub fn encode_frame(record: &LogRecord) -> Vec<u8> {
    let payload = record.encode_payload();
    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    frame.extend_from_slice(&LOG_MAGIC);
    frame.extend_from_slice(&LOG_VERSION.to_le_bytes());
    frame.push(record.record_type() as u8);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    let crc = compute_crc32(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Result of scanning a log image.
#[derive(Debug)]
pub(crate) struct Scan {
    /// Decoded records with their offsets.
    pub records: Vec<(u64, LogRecord)>,
    /// Length of the valid prefix.
    pub valid_len: u64,
    /// Why the scan stopped early, if it did.
    pub torn: Option<String>,
}

/// Decodes every complete record in `data`.
///
/// An incomplete final record, or a final record whose checksum fails, is a
/// torn write: it is reported in [`Scan::torn`] and excluded from
/// `valid_len`. Damage anywhere before the final record is corruption.
pub(crate) fn scan(data: &[u8]) -> CoreResult<Scan> {
    let mut records = Vec::new();
    let mut offset = 0usize;

    while offset < data.len() {
        let rest = &data[offset..];
        if rest.len() < HEADER_SIZE {
            return Ok(torn(records, offset, "incomplete record header"));
        }
        if rest[0..4] != LOG_MAGIC {
            return Err(CoreError::log_corruption(format!(
                "invalid magic at offset {offset}"
            )));
        }
        let version = u16::from_le_bytes([rest[4], rest[5]]);
        if version != LOG_VERSION {
            return Err(CoreError::log_corruption(format!(
                "unsupported record version {version} at offset {offset}"
            )));
        }
        let record_type = RecordType::from_byte(rest[6]).ok_or_else(|| {
            CoreError::log_corruption(format!("unknown record type {} at offset {offset}", rest[6]))
        })?;
        let len = u32::from_le_bytes([rest[7], rest[8], rest[9], rest[10]]) as usize;
        let total = HEADER_SIZE + len + CRC_SIZE;
        if rest.len() < total {
            return Ok(torn(records, offset, "incomplete record body"));
        }

        let body_end = HEADER_SIZE + len;
        let expected = u32::from_le_bytes([
            rest[body_end],
            rest[body_end + 1],
            rest[body_end + 2],
            rest[body_end + 3],
        ]);
        let actual = compute_crc32(&rest[..body_end]);
        if expected != actual {
            if rest.len() == total {
                return Ok(torn(records, offset, "checksum mismatch in final record"));
            }
            return Err(CoreError::ChecksumMismatch {
                offset: offset as u64,
                expected,
                actual,
            });
        }

        let record = LogRecord::decode_payload(record_type, &rest[HEADER_SIZE..body_end])?;
        records.push((offset as u64, record));
        offset += total;
    }

    Ok(Scan {
        records,
        valid_len: offset as u64,
        torn: None,
    })
}

fn torn(records: Vec<(u64, LogRecord)>, offset: usize, reason: &str) -> Scan {
    Scan {
        records,
        valid_len: offset as u64,
        torn: Some(reason.to_string()),
    }
}

/// Computes the IEEE CRC-32 of `data`.
pub(crate) fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn bytes(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        if self.data.len() < len {
            return Err(CoreError::log_corruption("record payload too short"));
        }
        let (head, tail) = self.data.split_at(len);
        self.data = tail;
        Ok(head)
    }

    fn u8(&mut self) -> CoreResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> CoreResult<u32> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.bytes(4)?);
        Ok(u32::from_le_bytes(buf))
    }

    fn u64(&mut self) -> CoreResult<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.bytes(8)?);
        Ok(u64::from_le_bytes(buf))
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
