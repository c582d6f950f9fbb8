//! Event model: the unit of data that flows through the pipeline.
//!
//! An [`Event`] carries an ordered payload, a set of attachments stored out of
//! band as files, and a `history` of [`ProcessStage`] hops. The payload is
//! fixed at construction; only history grows and attachment paths move.
//!
//! The serialized form is one compact JSON object per line:
//!
//! ```text
//! {"payload":{...},"attachments":{"id":"path"},"history":[{...}]}
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::EventError;
use crate::plugin::PluginKind;

/// Payload key holding the event priority.
pub const PRIORITY_KEY: &str = "priority";
/// Number of priority levels (0 is the highest).
pub const PRIORITY_LEVELS: usize = 4;
/// Level assigned to events without a usable priority.
pub const LOWEST_PRIORITY: usize = PRIORITY_LEVELS - 1;

/// Stage target recorded when an input emits into the buffer.
pub const TARGET_BUFFER: &str = "buffer";
/// Stage target recorded when an output delivers outside the node.
pub const TARGET_EXTERNAL: &str = "external";

// ─── ProcessStage ────────────────────────────────────────────────────

/// One hop of an event through a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStage {
    /// Node the hop happened on
    pub node_id: String,
    /// When the hop happened
    pub time: DateTime<Utc>,
    /// Configured id of the plugin
    pub plugin_id: String,
    /// Kind of the plugin
    pub plugin_type: PluginKind,
    /// Downstream the hop commits toward
    pub target: String,
}

impl ProcessStage {
    /// Creates a stage stamped with the current time.
    pub fn now(
        node_id: impl Into<String>,
        plugin_id: impl Into<String>,
        plugin_type: PluginKind,
        target: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            time: Utc::now(),
            plugin_id: plugin_id.into(),
            plugin_type,
            target: target.into(),
        }
    }

    /// Returns the string value of a matchable field.
    ///
    /// Used by history rules; `time` is not matchable.
    pub fn field(&self, key: &str) -> Option<&str> {
        match key {
            "node_id" => Some(&self.node_id),
            "plugin_id" => Some(&self.plugin_id),
            "plugin_type" => Some(self.plugin_type.as_str()),
            "target" => Some(&self.target),
            _ => None,
        }
    }
}

impl fmt::Display for ProcessStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}({}) -> {} @ {}",
            self.node_id,
            self.plugin_id,
            self.plugin_type,
            self.target,
            self.time.to_rfc3339(),
        )
    }
}

// ─── Event ───────────────────────────────────────────────────────────

/// Structured log record with attachments and hop history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    payload: Map<String, Value>,
    #[serde(default)]
    attachments: BTreeMap<String, PathBuf>,
    #[serde(default)]
    history: Vec<ProcessStage>,
}

impl Event {
    /// Creates an event with an empty history and no attachments.
    pub fn new(payload: Map<String, Value>) -> Self {
        Self {
            payload,
            attachments: BTreeMap::new(),
            history: Vec::new(),
        }
    }

    /// Creates an event from a JSON value, which must be an object.
    pub fn from_value(value: Value) -> Result<Self, EventError> {
        match value {
            Value::Object(map) => Ok(Self::new(map)),
            other => Err(EventError::PayloadNotObject(json_type_name(&other))),
        }
    }

    /// Adds an attachment referencing a local file.
    pub fn with_attachment(mut self, id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.attachments.insert(id.into(), path.into());
        self
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    /// Looks up a payload field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    pub fn attachments(&self) -> &BTreeMap<String, PathBuf> {
        &self.attachments
    }

    pub fn history(&self) -> &[ProcessStage] {
        &self.history
    }

    /// Appends a hop to the history.
    pub fn append_stage(&mut self, stage: ProcessStage) {
        self.history.push(stage);
    }

    /// Rewrites every attachment path through `relocate`.
    ///
    /// Stops at the first error; paths already rewritten keep their new value.
    pub fn relocate_attachments<F, E>(&mut self, mut relocate: F) -> Result<(), E>
    where
        F: FnMut(&str, &Path) -> Result<PathBuf, E>,
    {
        for (id, path) in self.attachments.iter_mut() {
            *path = relocate(id, path)?;
        }
        Ok(())
    }

    /// Priority level from the payload `priority` field.
    ///
    /// Missing, non-integer or out-of-range values map to [`LOWEST_PRIORITY`].
    pub fn priority(&self) -> usize {
        self.payload
            .get(PRIORITY_KEY)
            .and_then(Value::as_u64)
            .and_then(|p| usize::try_from(p).ok())
            .filter(|p| *p < PRIORITY_LEVELS)
            .unwrap_or(LOWEST_PRIORITY)
    }

    /// Approximate size in bytes: serialized payload plus attachment files.
    ///
    /// Attachments that cannot be stat'ed count as zero.
    pub fn approx_size(&self) -> u64 {
        let payload = serde_json::to_vec(&self.payload)
            .map(|v| v.len() as u64)
            .unwrap_or(0);
        let attachments: u64 = self
            .attachments
            .values()
            .filter_map(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .sum();
        payload + attachments
    }

    /// Serializes to a single line of JSON (no trailing newline).
    pub fn serialize(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses an event from its serialized form.
    pub fn deserialize(line: &str) -> Result<Self, EventError> {
        Ok(serde_json::from_str(line.trim_end_matches(['\r', '\n']))?)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Event(fields={}, attachments={}, hops={})",
            self.payload.len(),
            self.attachments.len(),
            self.history.len(),
        )
    }
}

/// JSON type name for error messages.
pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "mapping",
    }
}
