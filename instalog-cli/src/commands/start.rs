//! `instalog start` command handler

use std::io::Write;

use colored::Colorize;
use serde::Serialize;

use crate::cli::StartArgs;
use crate::daemon::DaemonControl;
use crate::error::CliError;
use crate::output::{OutputWriter, Render};

/// Execute the `start` command.
///
/// With `--no-daemon` the CLI is replaced by `instalogd` and this only
/// returns on failure.
pub async fn execute(
    args: &StartArgs,
    daemon: &DaemonControl,
    writer: &OutputWriter,
) -> Result<(), CliError> {
    let pid = daemon.start(args.no_daemon).await?;
    writer.render(&StartReport {
        pid,
        rpc_addr: daemon.rpc_addr().to_owned(),
    })
}

#[derive(Debug, Serialize)]
pub struct StartReport {
    pub pid: u32,
    pub rpc_addr: String,
}

impl Render for StartReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        writeln!(
            w,
            "{} instalogd started (pid {}, control {})",
            "✓".green(),
            self.pid,
            self.rpc_addr
        )
    }
}
