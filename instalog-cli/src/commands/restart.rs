//! `instalog restart` command handler

use tracing::info;

use crate::cli::RestartArgs;
use crate::commands::{start, stop};
use crate::daemon::DaemonControl;
use crate::error::CliError;
use crate::output::OutputWriter;

/// Execute the `restart` command: stop if running, then start.
pub async fn execute(
    args: &RestartArgs,
    daemon: &DaemonControl,
    writer: &OutputWriter,
) -> Result<(), CliError> {
    let was_running = daemon.stop(stop::timeout(args.stop.timeout)?).await?;
    info!(was_running, "restarting instalogd");
    start::execute(&args.start, daemon, writer).await
}
