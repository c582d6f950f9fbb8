//! `instalog flush` command handler

use std::io::Write;

use colored::Colorize;
use instalog_core::rpc::{FlushResult, RpcRequest};
use serde::Serialize;

use crate::cli::FlushArgs;
use crate::commands::stop::timeout;
use crate::daemon::DaemonControl;
use crate::error::CliError;
use crate::output::{OutputWriter, Render};

/// Slack on top of the flush timeout for the RPC round trip.
const RPC_SLACK: std::time::Duration = std::time::Duration::from_secs(5);

/// Execute the `flush` command. Fails with exit code 1 when the flush did
/// not complete in time.
pub async fn execute(
    args: &FlushArgs,
    daemon: &DaemonControl,
    writer: &OutputWriter,
) -> Result<(), CliError> {
    let wait = timeout(args.timeout)?;
    let request = RpcRequest::Flush {
        plugin_id: args.plugin_id.clone(),
        timeout_secs: args.timeout,
    };
    let result: FlushResult = daemon.request(&request, wait + RPC_SLACK).await?.into_result()?;
    let success = result.success;
    writer.render(&FlushReport(result))?;
    if success {
        Ok(())
    } else {
        Err(CliError::Command("flush did not complete".to_owned()))
    }
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct FlushReport(pub FlushResult);

impl Render for FlushReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        let mark = if self.0.success { "✓".green() } else { "✗".red() };
        writeln!(
            w,
            "{mark} {} ({} of {} committed)",
            self.0.message, self.0.completed, self.0.watermark
        )
    }
}
