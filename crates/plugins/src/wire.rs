//! Node-to-node transfer format shared by `output_socket` and `input_socket`.
//!
//! A batch is a sequence of lines, one per event, terminated by an empty
//! line:
//!
//! ```text
//! {"event": {...}, "attachments": {"<id>": "<hex bytes>"}}\n
//! ...
//! \n
//! ```
//!
//! The receiver answers `OK <count>\n` once the batch is in its buffer, or
//! `ERR <reason>\n`. Event history travels with the event.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use instalog_core::error::PluginError;
use instalog_core::event::Event;
use serde::{Deserialize, Serialize};

/// Largest accepted line. Attachments are inlined, so this is generous.
pub const MAX_LINE_BYTES: u64 = 256 * 1024 * 1024;

const ACK_OK: &str = "OK";
const ACK_ERR: &str = "ERR";

#[derive(Debug, Serialize, Deserialize)]
struct WireEvent {
    event: Event,
    #[serde(default)]
    attachments: BTreeMap<String, String>,
}

/// Encodes an event and its attachment bytes as one line, newline included.
pub async fn encode_event(event: &Event) -> Result<String, PluginError> {
    let mut attachments = BTreeMap::new();
    for (id, path) in event.attachments() {
        let bytes = tokio::fs::read(path).await?;
        attachments.insert(id.clone(), hex::encode(bytes));
    }
    let wire = WireEvent {
        event: event.clone(),
        attachments,
    };
    let mut line = serde_json::to_string(&wire).map_err(|e| PluginError::Other(e.to_string()))?;
    line.push('\n');
    Ok(line)
}

/// Decodes one line, writing attachment bytes into `staging`.
///
/// Returns the event with attachment paths pointing at the staged files,
/// plus the staged paths so the caller can clean up.
pub async fn decode_event(line: &str, staging: &Path) -> Result<(Event, Vec<PathBuf>), PluginError> {
    let wire: WireEvent =
        serde_json::from_str(line).map_err(|e| PluginError::Other(format!("bad event line: {e}")))?;
    let mut event = wire.event;

    let mut staged = Vec::with_capacity(wire.attachments.len());
    let mut contents = BTreeMap::new();
    for (id, encoded) in &wire.attachments {
        let bytes = hex::decode(encoded)
            .map_err(|e| PluginError::Other(format!("attachment '{id}' is not hex: {e}")))?;
        let path = staging.join(uuid::Uuid::new_v4().to_string());
        tokio::fs::write(&path, bytes).await?;
        staged.push(path.clone());
        contents.insert(id.clone(), path);
    }

    event.relocate_attachments(|id, _| {
        contents
            .get(id)
            .cloned()
            .ok_or_else(|| PluginError::Other(format!("attachment '{id}' has no content")))
    })?;
    Ok((event, staged))
}

pub fn ack(count: usize) -> String {
    format!("{ACK_OK} {count}\n")
}

pub fn nack(reason: &str) -> String {
    format!("{ACK_ERR} {}\n", reason.replace('\n', " "))
}

/// Parses a receiver reply into the acknowledged count.
pub fn parse_ack(reply: &str) -> Result<usize, PluginError> {
    let reply = reply.trim_end();
    if let Some(reason) = reply.strip_prefix(ACK_ERR) {
        return Err(PluginError::Delivery(format!("receiver rejected batch:{reason}")));
    }
    reply
        .strip_prefix(ACK_OK)
        .and_then(|rest| rest.trim().parse::<usize>().ok())
        .ok_or_else(|| PluginError::Delivery(format!("unexpected reply {reply:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn attachment_bytes_travel_with_the_event() {
        // Given: an event whose attachment lives on the sender
        let sender = tempfile::tempdir().unwrap();
        let receiver = tempfile::tempdir().unwrap();
        let file = sender.path().join("log.txt");
        std::fs::write(&file, b"raw log bytes").unwrap();
        let event = Event::from_value(json!({"serial": "SN1"}))
            .unwrap()
            .with_attachment("log", &file);

        // When
        let line = encode_event(&event).await.unwrap();
        let (decoded, staged) = decode_event(line.trim_end(), receiver.path()).await.unwrap();

        // Then
        assert_eq!(decoded.payload(), event.payload());
        assert_eq!(staged.len(), 1);
        let path = &decoded.attachments()["log"];
        assert!(path.starts_with(receiver.path()));
        assert_eq!(std::fs::read(path).unwrap(), b"raw log bytes");
    }

    #[tokio::test]
    async fn missing_attachment_content_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let line = r#"{"event": {"payload": {}, "attachments": {"log": "/x"}}, "attachments": {}}"#;
        assert!(decode_event(line, dir.path()).await.is_err());
    }

    #[test]
    fn ack_round_trip() {
        assert_eq!(parse_ack(&ack(12)).unwrap(), 12);
        assert!(matches!(parse_ack(&nack("disk full")), Err(PluginError::Delivery(_))));
        assert!(parse_ack("HELLO").is_err());
    }
}
