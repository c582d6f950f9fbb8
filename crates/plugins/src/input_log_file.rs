//! Log-file input.
//!
//! Tails a file of JSON-object lines, like `tail -f`. The byte offset of the
//! last emitted line is kept in the plugin store, so a restart resumes where
//! the previous run stopped. Lines are emitted only once complete.
//!
//! # Truncation
//! A file shorter than the stored offset was truncated or replaced; reading
//! restarts from the beginning.

use std::path::PathBuf;
use std::time::Duration;

use instalog_core::args::{ArgDefault, ArgSpec, ArgType, PluginArgs};
use instalog_core::error::PluginError;
use instalog_core::event::Event;
use instalog_core::metrics as m;
use instalog_core::plugin::{Constructor, DynPlugin, Plugin, PluginContext, PluginFactory};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

pub const MODULE: &str = "input_log_file";

/// Store key holding the byte offset of the next unread line.
pub const OFFSET_KEY: &str = "offset";
/// Store key counting emitted events.
pub const EVENTS_KEY: &str = "events";
/// Store key counting dropped lines.
pub const DROPPED_KEY: &str = "dropped_lines";

pub const ARGS: [ArgSpec; 4] = [
    ArgSpec::required("path", ArgType::Str, "File of JSON-object lines to follow"),
    ArgSpec::optional(
        "poll_interval",
        ArgType::Float,
        "Seconds to wait when the file has nothing new",
        ArgDefault::Float(1.0),
    ),
    ArgSpec::optional(
        "batch_max_count",
        ArgType::Int,
        "Maximum lines emitted per batch",
        ArgDefault::Int(1000),
    ),
    ArgSpec::optional(
        "batch_max_bytes",
        ArgType::Int,
        "Maximum bytes read per batch",
        ArgDefault::Int(1024 * 1024),
    ),
];

pub const FACTORY: PluginFactory = PluginFactory {
    name: "InputLogFile",
    args: &ARGS,
    constructor: Constructor::Input(build),
};

fn build(args: &PluginArgs) -> Result<Box<dyn DynPlugin>, PluginError> {
    Ok(Box::new(InputLogFile::from_args(args)?))
}

/// Follows one log file.
#[derive(Debug)]
pub struct InputLogFile {
    path: PathBuf,
    poll_interval: Duration,
    max_count: usize,
    max_bytes: usize,
}

impl InputLogFile {
    pub fn from_args(args: &PluginArgs) -> Result<Self, PluginError> {
        let path = args
            .str("path")
            .filter(|p| !p.is_empty())
            .ok_or_else(|| PluginError::Config("'path' must not be empty".to_owned()))?;
        let max_count = args.usize("batch_max_count").unwrap_or(1000);
        let max_bytes = args.usize("batch_max_bytes").unwrap_or(1024 * 1024);
        if max_count == 0 || max_bytes == 0 {
            return Err(PluginError::Config(
                "batch_max_count and batch_max_bytes must be positive".to_owned(),
            ));
        }
        Ok(Self {
            path: PathBuf::from(path),
            poll_interval: args.secs("poll_interval").unwrap_or(Duration::from_secs(1)),
            max_count,
            max_bytes,
        })
    }

    /// Reads up to `max_bytes` starting at `offset`.
    ///
    /// Returns `None` when the file does not exist yet.
    async fn read_from(&self, offset: u64) -> Result<Option<(u64, Vec<u8>)>, PluginError> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata().await?.len();
        let offset = if len < offset {
            warn!(path = %self.path.display(), offset, len, "file shrank, reading from the start");
            0
        } else {
            offset
        };

        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut buf = Vec::new();
        file.take(self.max_bytes as u64).read_to_end(&mut buf).await?;
        Ok(Some((offset, buf)))
    }
}

impl Plugin for InputLogFile {
    async fn set_up(&mut self, ctx: &PluginContext) -> Result<(), PluginError> {
        info!(
            plugin_id = %ctx.plugin_id(),
            path = %self.path.display(),
            offset = stored_offset(ctx),
            "following log file"
        );
        Ok(())
    }

    async fn main(&mut self, ctx: &PluginContext) -> Result<(), PluginError> {
        let Some((start, buf)) = self.read_from(stored_offset(ctx)).await? else {
            ctx.sleep(self.poll_interval).await;
            return Ok(());
        };

        let (lines, mut consumed) = split_lines(&buf, self.max_count);
        if lines.is_empty() && buf.len() >= self.max_bytes {
            // a single line longer than the read window can never complete
            warn!(plugin_id = %ctx.plugin_id(), offset = start, bytes = buf.len(), "dropping over-long line");
            consumed = buf.len();
            metrics::counter!(m::INPUT_LINES_DROPPED_TOTAL, "plugin" => ctx.plugin_id().to_owned())
                .increment(1);
            ctx.store().incr(DROPPED_KEY, 1);
        }
        if consumed == 0 {
            ctx.sleep(self.poll_interval).await;
            return Ok(());
        }

        let (events, dropped) = parse_lines(&lines, ctx.plugin_id());
        let count = events.len();
        if !events.is_empty() {
            ctx.emit(events).await?;
        }

        let store = ctx.store();
        store.set(OFFSET_KEY, start + consumed as u64);
        store.incr(EVENTS_KEY, count as u64);
        if dropped > 0 {
            store.incr(DROPPED_KEY, dropped as u64);
        }
        store.save()?;
        debug!(plugin_id = %ctx.plugin_id(), count, dropped, offset = start + consumed as u64, "lines ingested");

        if lines.len() < self.max_count {
            ctx.sleep(self.poll_interval).await;
        }
        Ok(())
    }
}

fn stored_offset(ctx: &PluginContext) -> u64 {
    ctx.store()
        .get(OFFSET_KEY)
        .and_then(|v| v.as_u64())
        .unwrap_or(0)
}

/// One line read from the file, or the reason it could not be decoded.
pub type Line = Result<String, std::str::Utf8Error>;

/// Splits complete lines off the front of `buf`.
///
/// Returns at most `max_count` lines and the number of bytes they span,
/// newlines included. A trailing line without a newline is left unread.
/// Lines that are not valid UTF-8 come back as errors so the caller can
/// drop them.
pub fn split_lines(buf: &[u8], max_count: usize) -> (Vec<Line>, usize) {
    let mut lines = Vec::new();
    let mut consumed = 0;
    for segment in buf.split_inclusive(|b| *b == b'\n') {
        if lines.len() >= max_count || segment.last() != Some(&b'\n') {
            break;
        }
        consumed += segment.len();
        lines.push(std::str::from_utf8(segment).map(|line| line.trim_end().to_owned()));
    }
    (lines, consumed)
}

/// Parses JSON-object lines into events.
///
/// Blank lines are ignored. Malformed lines, invalid UTF-8 included, are
/// dropped with a warning and counted; the returned events have empty
/// histories.
pub fn parse_lines(lines: &[Line], plugin_id: &str) -> (Vec<Event>, usize) {
    let mut events = Vec::with_capacity(lines.len());
    let mut dropped = 0;
    for (n, line) in lines.iter().enumerate() {
        if line.as_ref().is_ok_and(|text| text.trim().is_empty()) {
            continue;
        }
        let parsed = line
            .as_ref()
            .map_err(|e| format!("invalid utf-8: {e}"))
            .and_then(|text| serde_json::from_str::<Value>(text).map_err(|e| e.to_string()))
            .and_then(|value| Event::from_value(value).map_err(|e| e.to_string()));
        match parsed {
            Ok(event) => events.push(event),
            Err(reason) => {
                dropped += 1;
                metrics::counter!(m::INPUT_LINES_DROPPED_TOTAL, "plugin" => plugin_id.to_owned())
                    .increment(1);
                warn!(plugin_id, line = n, %reason, "dropping malformed line");
            }
        }
    }
    (events, dropped)
}

/// Splits and parses a chunk of text in one step.
pub fn parse_chunk(chunk: &str, plugin_id: &str) -> Vec<Event> {
    let (lines, _) = split_lines(chunk.as_bytes(), usize::MAX);
    parse_lines(&lines, plugin_id).0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn malformed_then_valid_chunk_yields_one_event() {
        // Given: a two-line chunk, the first line broken
        let chunk = "{\"serial\": \"SN1\", \"status\"\n{\"serial\": \"SN2\", \"status\": \"PASSED\"}\n";

        // When
        let events = parse_chunk(chunk, "station_log");

        // Then
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].get("serial"), Some(&json!("SN2")));
        assert!(events[0].history().is_empty(), "no stage before emission");
    }

    #[test]
    fn non_object_lines_are_dropped() {
        let lines = vec![Ok("[1, 2]".to_owned()), Ok("\"text\"".to_owned()), Ok("{}".to_owned())];
        let (events, dropped) = parse_lines(&lines, "p");
        assert_eq!(events.len(), 1);
        assert_eq!(dropped, 2);
    }

    #[test]
    fn split_leaves_incomplete_tail() {
        let (lines, consumed) = split_lines(b"{\"a\":1}\n{\"b\":2}\n{\"c\":", 10);
        assert_eq!(lines, vec![Ok("{\"a\":1}".to_owned()), Ok("{\"b\":2}".to_owned())]);
        assert_eq!(consumed, 16);
    }

    #[test]
    fn split_respects_max_count() {
        let (lines, consumed) = split_lines(b"1\n2\n3\n", 2);
        assert_eq!(lines.len(), 2);
        assert_eq!(consumed, 4);
    }

    #[test]
    fn crlf_line_endings_are_trimmed() {
        let (lines, _) = split_lines(b"{\"a\":1}\r\n", 10);
        assert_eq!(lines, vec![Ok("{\"a\":1}".to_owned())]);
    }

    #[test]
    fn invalid_utf8_line_is_dropped_not_mangled() {
        // Given: a valid line, a line with a stray 0xFF byte, another valid line
        let buf = b"{\"n\":1}\n{\"n\":\"\xFF\"}\n{\"n\":3}\n";

        // When
        let (lines, consumed) = split_lines(buf, 10);
        let (events, dropped) = parse_lines(&lines, "p");

        // Then
        assert_eq!(consumed, buf.len(), "the broken line is still consumed");
        assert_eq!(dropped, 1, "invalid UTF-8 counts as a malformed line");
        let ns: Vec<_> = events.iter().filter_map(|e| e.get("n")).cloned().collect();
        assert_eq!(ns, vec![json!(1), json!(3)], "no replacement characters reach an event");
    }

    #[test]
    fn empty_path_is_rejected() {
        let args = instalog_core::args::validate_args(&ARGS, &json!({"path": ""})).unwrap();
        assert!(matches!(InputLogFile::from_args(&args), Err(PluginError::Config(_))));
    }
}
