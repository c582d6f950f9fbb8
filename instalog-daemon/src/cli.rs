//! Command-line arguments for instalogd.

use std::path::PathBuf;

use clap::Parser;

/// Instalog event transport daemon.
///
/// Loads the configured buffer, inputs and outputs, supervises them, and
/// serves control requests from the `instalog` CLI.
#[derive(Parser, Debug)]
#[command(name = "instalogd")]
#[command(version, about, long_about = None)]
pub struct DaemonCli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/instalog/instalog.yaml")]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override log format (json, pretty).
    #[arg(long)]
    pub log_format: Option<String>,

    /// Validate the configuration, print the resolved pipeline and exit.
    #[arg(long)]
    pub validate: bool,

    /// Override PID file path; an empty value disables the PID file.
    #[arg(long)]
    pub pid_file: Option<String>,
}

impl DaemonCli {
    /// Applies the command-line overrides to a loaded configuration.
    pub fn apply_overrides(&self, config: &mut instalog_core::InstalogConfig) {
        if let Some(level) = &self.log_level {
            config.instalog.log_level = level.clone();
        }
        if let Some(format) = &self.log_format {
            config.instalog.log_format = format.clone();
        }
        if let Some(pid_file) = &self.pid_file {
            config.instalog.pid_file = pid_file.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_system_config() {
        let cli = DaemonCli::parse_from(["instalogd"]);
        assert_eq!(cli.config, PathBuf::from("/etc/instalog/instalog.yaml"));
        assert!(!cli.validate);
    }

    #[test]
    fn overrides_replace_config_values() {
        // Given
        let cli = DaemonCli::parse_from([
            "instalogd",
            "--log-level",
            "debug",
            "--log-format",
            "json",
            "--pid-file",
            "",
        ]);
        let mut config = instalog_core::InstalogConfig::parse("instalog: {node_id: n1}").unwrap();

        // When
        cli.apply_overrides(&mut config);

        // Then
        assert_eq!(config.instalog.log_level, "debug");
        assert_eq!(config.instalog.log_format, "json");
        assert!(config.instalog.pid_file.is_empty());
    }
}
