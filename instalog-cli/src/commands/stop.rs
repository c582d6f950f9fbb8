//! `instalog stop` command handler

use std::io::Write;
use std::time::Duration;

use colored::Colorize;
use serde::Serialize;

use crate::cli::StopArgs;
use crate::daemon::DaemonControl;
use crate::error::CliError;
use crate::output::{OutputWriter, Render};

/// Execute the `stop` command.
pub async fn execute(
    args: &StopArgs,
    daemon: &DaemonControl,
    writer: &OutputWriter,
) -> Result<(), CliError> {
    let stopped = daemon.stop(timeout(args.timeout)?).await?;
    writer.render(&StopReport { stopped })
}

pub(crate) fn timeout(secs: f64) -> Result<Duration, CliError> {
    Duration::try_from_secs_f64(secs)
        .map_err(|_| CliError::Command(format!("invalid timeout: {secs}")))
}

#[derive(Debug, Serialize)]
pub struct StopReport {
    /// False when the daemon was not running
    pub stopped: bool,
}

impl Render for StopReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        if self.stopped {
            writeln!(w, "{} instalogd stopped", "✓".green())
        } else {
            writeln!(w, "instalogd is not running")
        }
    }
}
