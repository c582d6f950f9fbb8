//! Error types, one enum per domain.
//!
//! Every domain error converts into [`InstalogError`] so callers that do not
//! care about the distinction can use `?` throughout.

/// Top-level Instalog error.
#[derive(Debug, thiserror::Error)]
pub enum InstalogError {
    /// Configuration error (fatal at core start)
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Event encoding / decoding error
    #[error("event error: {0}")]
    Event(#[from] EventError),

    /// Buffer storage error
    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),

    /// Event stream protocol error
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    /// Plugin loading error
    #[error("load plugin error: {0}")]
    LoadPlugin(#[from] LoadPluginError),

    /// Plugin runtime error
    #[error("plugin error: {0}")]
    Plugin(#[from] PluginError),

    /// Flow policy rule construction error
    #[error("rule error: {0}")]
    Rule(#[from] RuleError),

    /// Control RPC error
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file does not exist
    #[error("config file not found: {path}")]
    FileNotFound { path: String },

    /// YAML could not be parsed
    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    /// A field holds an unacceptable value
    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    /// A plugin entry is invalid
    #[error("plugin '{plugin_id}': {reason}")]
    Plugin { plugin_id: String, reason: String },
}

/// Event serialization errors.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// Record is not valid JSON or lacks a required field
    #[error("malformed event: {0}")]
    Malformed(String),

    /// Payload was not a JSON object
    #[error("payload must be an object, got {0}")]
    PayloadNotObject(&'static str),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

/// Buffer storage errors.
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    /// Underlying file I/O failed
    #[error("buffer io error: {0}")]
    Io(#[from] std::io::Error),

    /// The consumer is not registered with the buffer
    #[error("unknown consumer: {0}")]
    UnknownConsumer(String),

    /// The consumer already has an open stream
    #[error("consumer '{0}' already has an open stream")]
    StreamBusy(String),

    /// Attachment could not be relocated into the buffer
    #[error("attachment '{id}' at {path}: {reason}")]
    Attachment {
        id: String,
        path: String,
        reason: String,
    },

    /// Event could not be encoded into a record
    #[error("cannot encode event: {0}")]
    Encode(#[from] EventError),

    /// Buffer state file is unreadable
    #[error("corrupt buffer state in {file}: {reason}")]
    State { file: String, reason: String },

    /// Buffer has been closed
    #[error("buffer closed")]
    Closed,
}

/// Event stream protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// `next` was called while a previous checkout is still open
    #[error("previous checkout of {pending} events must be committed or aborted first")]
    CheckoutPending { pending: usize },

    /// The stream's consumer is gone or the buffer was closed
    #[error("stream closed")]
    Closed,

    /// Error propagated from the buffer
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

/// Plugin argument validation errors.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ArgError {
    /// Required argument was not supplied
    #[error("missing required argument '{name}'")]
    Missing { name: String },

    /// Argument has the wrong type
    #[error("argument '{name}' must be {expected}, got {actual}")]
    WrongType {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// Argument is not declared by the plugin
    #[error("unknown argument '{name}'")]
    Unknown { name: String },

    /// Arguments were not given as a mapping
    #[error("arguments must be a mapping, got {actual}")]
    NotAMapping { actual: &'static str },
}

/// Plugin loading errors.
#[derive(Debug, thiserror::Error)]
pub enum LoadPluginError {
    /// No module is registered under the name
    #[error("plugin module '{module}' not found")]
    ModuleNotFound { module: String },

    /// Zero or several factories of the required kind
    #[error("plugin module '{module}' exports {count} {kind} plugin(s), expected exactly 1")]
    CandidateCount {
        module: String,
        kind: String,
        count: usize,
    },

    /// Arguments failed validation
    #[error("plugin module '{module}': {source}")]
    InvalidArgs {
        module: String,
        #[source]
        source: ArgError,
    },

    /// The plugin's own constructor failed
    #[error("plugin module '{module}' constructor raised {error_type}: {message}")]
    Constructor {
        module: String,
        error_type: String,
        message: String,
    },
}

/// Errors raised by running plugins.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// I/O failure inside the plugin
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Buffer failure while emitting or streaming
    #[error(transparent)]
    Buffer(#[from] BufferError),

    /// Stream protocol failure
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// Invalid plugin configuration detected at construction
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Delivery to the downstream target failed
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// The plugin called an API its kind does not have
    #[error("{kind} plugins cannot call {api}")]
    UnexpectedAccess { kind: String, api: &'static str },

    /// Plugin-specific failure
    #[error("{0}")]
    Other(String),
}

impl PluginError {
    /// Short name of the error variant, used when wrapping constructor errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Io(_) => "IoError",
            Self::Buffer(_) => "BufferError",
            Self::Stream(_) => "StreamError",
            Self::Config(_) => "ConfigError",
            Self::Delivery(_) => "DeliveryError",
            Self::UnexpectedAccess { .. } => "UnexpectedAccess",
            Self::Other(_) => "PluginError",
        }
    }
}

/// Flow policy rule construction errors.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RuleError {
    /// Rule definition lacks the `rule` key
    #[error("rule definition must contain a 'rule' key")]
    MissingName,

    /// No rule registered under the name
    #[error("unknown rule '{0}'")]
    UnknownRule(String),

    /// Rule received a keyword it does not accept
    #[error("rule '{rule}' does not accept '{key}'")]
    UnknownKey { rule: String, key: String },

    /// Keyword value has the wrong type
    #[error("rule '{rule}': '{key}' {reason}")]
    InvalidValue {
        rule: String,
        key: String,
        reason: String,
    },

    /// Rule definition is not a mapping
    #[error("rule definition must be a mapping")]
    NotAMapping,
}

/// Inspect query errors.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum InspectError {
    /// Path does not resolve to a value
    #[error("nothing at '{path}' (stopped at '{segment}')")]
    NotFound { path: String, segment: String },

    /// Plugin id is not configured
    #[error("unknown plugin '{0}'")]
    UnknownPlugin(String),
}

/// Control RPC errors.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// Transport failure
    #[error("rpc io error: {0}")]
    Io(#[from] std::io::Error),

    /// Message could not be encoded or decoded
    #[error("rpc codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Peer closed the connection before replying
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// No reply within the deadline
    #[error("rpc timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Server reported a failure
    #[error("remote error: {0}")]
    Remote(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_count_message_names_the_count() {
        let err = LoadPluginError::CandidateCount {
            module: "output_file".to_owned(),
            kind: "output".to_owned(),
            count: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("exports 2"), "message should name the count: {msg}");
    }

    #[test]
    fn missing_arg_names_the_argument() {
        let err = LoadPluginError::InvalidArgs {
            module: "input_log_file".to_owned(),
            source: ArgError::Missing {
                name: "path".to_owned(),
            },
        };
        assert!(err.to_string().contains("'path'"));
    }

    #[test]
    fn domain_errors_convert_to_top_level() {
        let err: InstalogError = BufferError::Closed.into();
        assert!(matches!(err, InstalogError::Buffer(BufferError::Closed)));

        let err: InstalogError = StreamError::CheckoutPending { pending: 3 }.into();
        assert!(err.to_string().contains("3 events"));
    }

    #[test]
    fn plugin_error_type_names() {
        assert_eq!(PluginError::Delivery("x".into()).type_name(), "DeliveryError");
        assert_eq!(PluginError::Config("x".into()).type_name(), "ConfigError");
    }
}
