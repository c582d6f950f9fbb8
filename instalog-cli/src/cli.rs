//! CLI argument parsing using clap derive API.
//!
//! Purely declarative: no side effects or I/O.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Instalog -- event and log transport.
///
/// Use `instalog <COMMAND> --help` for subcommand details.
#[derive(Parser, Debug)]
#[command(name = "instalog", version, about, long_about = None)]
pub struct Cli {
    /// Configuration file. Searched for in the usual places when omitted.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// More log output (repeatable).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Less log output (repeatable).
    #[arg(short, long, global = true, action = clap::ArgAction::Count, conflicts_with = "verbose")]
    pub quiet: u8,

    /// Output format.
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Log filter implied by `-v`/`-q`.
    pub fn log_level(&self) -> &'static str {
        match (self.verbose, self.quiet) {
            (0, 0) => "warn",
            (1, _) => "info",
            (2, _) => "debug",
            (v, _) if v >= 3 => "trace",
            (_, 1) => "error",
            _ => "off",
        }
    }
}

/// Supported output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text.
    Text,
    /// Machine-readable JSON.
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the daemon.
    Start(StartArgs),

    /// Stop the daemon.
    Stop(StopArgs),

    /// Stop the daemon if running, then start it.
    Restart(RestartArgs),

    /// Report whether the daemon is up.
    Status,

    /// Wait until outputs have delivered everything buffered so far.
    Flush(FlushArgs),

    /// Read a plugin's internal state.
    Inspect(InspectArgs),

    /// Stop calling an input or output until it is unpaused.
    Pause(PauseArgs),

    /// Resume a paused input or output.
    Unpause(PauseArgs),

    /// Pause a running plugin or resume a paused one.
    TogglePause(PauseArgs),
}

// ---- start ----

#[derive(Args, Debug)]
pub struct StartArgs {
    /// Run in the foreground instead of detaching.
    #[arg(short = 'n', long)]
    pub no_daemon: bool,
}

// ---- stop ----

#[derive(Args, Debug)]
pub struct StopArgs {
    /// Seconds to wait for the daemon to exit.
    #[arg(short = 'w', long = "timeout", default_value_t = 30.0)]
    pub timeout: f64,
}

// ---- restart ----

#[derive(Args, Debug)]
pub struct RestartArgs {
    #[command(flatten)]
    pub start: StartArgs,

    #[command(flatten)]
    pub stop: StopArgs,
}

// ---- flush ----

#[derive(Args, Debug)]
pub struct FlushArgs {
    /// Output to flush; every output when omitted.
    pub plugin_id: Option<String>,

    /// Seconds to wait for delivery.
    #[arg(short = 'w', long, default_value_t = 30.0)]
    pub timeout: f64,
}

// ---- inspect ----

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Plugin id (`buffer` for the buffer).
    pub plugin_id: String,

    /// Dotted path into the plugin's state, e.g. `.store.offset`.
    #[arg(default_value = ".")]
    pub path: String,
}

// ---- pause / unpause / toggle-pause ----

#[derive(Args, Debug)]
pub struct PauseArgs {
    /// Input or output plugin id.
    pub plugin_id: String,
}
