//! `instalog inspect` command handler

use std::io::Write;

use instalog_core::rpc::RpcRequest;
use serde::Serialize;
use serde_json::Value;

use crate::cli::InspectArgs;
use crate::daemon::DaemonControl;
use crate::error::CliError;
use crate::output::{OutputWriter, Render};

const INSPECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Execute the `inspect` command.
pub async fn execute(
    args: &InspectArgs,
    daemon: &DaemonControl,
    writer: &OutputWriter,
) -> Result<(), CliError> {
    let request = RpcRequest::Inspect {
        plugin_id: args.plugin_id.clone(),
        path: args.path.clone(),
    };
    let value: Value = daemon.request(&request, INSPECT_TIMEOUT).await?.into_result()?;
    writer.render(&InspectReport(value))
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct InspectReport(pub Value);

impl Render for InspectReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        match &self.0 {
            // scalars print bare so they can be used in shell scripts
            Value::String(s) => writeln!(w, "{s}"),
            Value::Number(n) => writeln!(w, "{n}"),
            Value::Bool(b) => writeln!(w, "{b}"),
            other => {
                let pretty = serde_json::to_string_pretty(other).map_err(std::io::Error::other)?;
                writeln!(w, "{pretty}")
            }
        }
    }
}
