//! `data.log` record codec.
//!
//! One record per line:
//!
//! ```text
//! <seq> <crc32 as 8 hex digits> <event json>\n
//! ```
//!
//! The checksum covers `"<seq> <event json>"`, so a record whose sequence
//! number was damaged is rejected as well.

use instalog_core::error::EventError;
use instalog_core::event::Event;

/// Why a line is not a valid record.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    /// Line does not have the three fields
    #[error("malformed record: {0}")]
    Format(&'static str),

    /// Stored and computed checksums differ
    #[error("checksum mismatch: stored {stored:08x}, computed {computed:08x}")]
    Checksum { stored: u32, computed: u32 },

    /// Checksum is fine but the event JSON is not
    #[error(transparent)]
    Event(#[from] EventError),
}

fn checksum(seq: u64, json: &str) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(seq.to_string().as_bytes());
    hasher.update(b" ");
    hasher.update(json.as_bytes());
    hasher.finalize()
}

/// Encodes one record, including the trailing newline.
pub fn encode(seq: u64, json: &str) -> String {
    format!("{seq} {:08x} {json}\n", checksum(seq, json))
}

/// Parses one record. A trailing newline is optional.
pub fn decode(line: &str) -> Result<(u64, Event), RecordError> {
    let line = line.strip_suffix('\n').unwrap_or(line);
    let mut fields = line.splitn(3, ' ');
    let seq = fields
        .next()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or(RecordError::Format("bad sequence number"))?;
    let stored = fields
        .next()
        .filter(|s| s.len() == 8)
        .and_then(|s| u32::from_str_radix(s, 16).ok())
        .ok_or(RecordError::Format("bad checksum field"))?;
    let json = fields.next().ok_or(RecordError::Format("missing event"))?;

    let computed = checksum(seq, json);
    if stored != computed {
        return Err(RecordError::Checksum { stored, computed });
    }
    Ok((seq, Event::deserialize(json)?))
}
