//! CLI error types and exit code mapping.

use instalog_core::error::{InstalogError, RpcError};

/// CLI error type.
///
/// `exit_code()` maps each variant to the process exit status.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// No configuration file, or one that does not load.
    #[error("configuration error: {0}")]
    Config(String),

    /// A subcommand-specific operation failed.
    #[error("{0}")]
    Command(String),

    /// The daemon is not running or does not answer.
    #[error("daemon not reachable: {0}")]
    DaemonUnavailable(String),

    /// A bounded wait ran out.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Control RPC failure.
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),

    /// JSON serialisation failed during output rendering.
    #[error("json output error: {0}")]
    JsonSerialize(#[from] serde_json::Error),

    /// IO error (process spawn, stdout write, etc.).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Wrapped domain error from instalog-core.
    #[error("{0}")]
    Core(#[from] InstalogError),
}

impl CliError {
    /// Map the error to a process exit code.
    ///
    /// | Code | Meaning |
    /// |------|---------|
    /// | 0 | Success |
    /// | 1 | Daemon unreachable, timeout, or command failure |
    /// | 2 | Configuration error |
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Core(InstalogError::Config(_)) => 2,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use instalog_core::error::ConfigError;

    #[test]
    fn config_errors_exit_with_two() {
        assert_eq!(CliError::Config("missing".to_owned()).exit_code(), 2);
        let core = CliError::from(InstalogError::Config(ConfigError::FileNotFound {
            path: "instalog.yaml".to_owned(),
        }));
        assert_eq!(core.exit_code(), 2, "config errors from core should also exit with 2");
    }

    #[test]
    fn connection_failures_exit_with_one() {
        assert_eq!(CliError::DaemonUnavailable("refused".to_owned()).exit_code(), 1);
        assert_eq!(CliError::Timeout("stop".to_owned()).exit_code(), 1);
        assert_eq!(CliError::Rpc(RpcError::ConnectionClosed).exit_code(), 1);
    }

    #[test]
    fn display_includes_context() {
        let err = CliError::DaemonUnavailable("connection refused".to_owned());
        assert_eq!(err.to_string(), "daemon not reachable: connection refused");
    }
}
