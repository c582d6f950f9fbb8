//! `instalog status` command handler

use std::io::Write;

use colored::Colorize;
use instalog_core::rpc::{ProgressReport, RpcRequest};
use serde::Serialize;
use tracing::debug;

use crate::daemon::{DaemonControl, DaemonStatus};
use crate::error::CliError;
use crate::output::{OutputWriter, Render};

const PROGRESS_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Execute the `status` command.
///
/// Prints the daemon state and, when it is up, per-output delivery progress.
pub async fn execute(daemon: &DaemonControl, writer: &OutputWriter) -> Result<(), CliError> {
    let report = build_status_report(daemon).await;
    writer.render(&report)
}

pub async fn build_status_report(daemon: &DaemonControl) -> StatusReport {
    let status = daemon.status().await;
    let progress = if status == DaemonStatus::Up {
        match daemon.request(&RpcRequest::Progress, PROGRESS_TIMEOUT).await {
            Ok(response) => response.into_result::<ProgressReport>().ok(),
            Err(e) => {
                debug!(error = %e, "progress request failed");
                None
            }
        }
    } else {
        None
    };
    StatusReport {
        status,
        pid: daemon.read_pid(),
        rpc_addr: daemon.rpc_addr().to_owned(),
        progress,
    }
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub status: DaemonStatus,
    pub pid: Option<u32>,
    pub rpc_addr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressReport>,
}

impl Render for StatusReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        let label = match self.status {
            DaemonStatus::Up => "UP".green().bold(),
            DaemonStatus::Starting => "STARTING".yellow().bold(),
            DaemonStatus::Down => "DOWN".red().bold(),
        };
        writeln!(w, "{label}")?;
        if let Some(progress) = &self.progress {
            if !progress.is_empty() {
                writeln!(w, "{:<24} {:>12} {:>12} {:>10}", "OUTPUT", "COMPLETED", "TOTAL", "PENDING")?;
                for (output, p) in progress {
                    writeln!(w, "{:<24} {:>12} {:>12} {:>10}", output, p.completed, p.total, p.pending())?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use instalog_core::ConsumerProgress;

    #[test]
    fn text_lists_pending_per_output() {
        colored::control::set_override(false);
        let mut progress = ProgressReport::new();
        progress.insert(
            "archive".to_owned(),
            ConsumerProgress {
                completed: 7,
                total: 10,
            },
        );
        let report = StatusReport {
            status: DaemonStatus::Up,
            pid: Some(42),
            rpc_addr: "127.0.0.1:7000".to_owned(),
            progress: Some(progress),
        };

        let mut out = Vec::new();
        report.render_text(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("UP\n"), "got: {text}");
        let row = text.lines().find(|l| l.starts_with("archive")).expect("archive row");
        assert!(row.trim_end().ends_with('3'), "pending column should be 3: {row}");
    }

    #[test]
    fn json_omits_progress_when_down() {
        let report = StatusReport {
            status: DaemonStatus::Down,
            pid: None,
            rpc_addr: "127.0.0.1:7000".to_owned(),
            progress: None,
        };
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["status"], "DOWN");
        assert!(value.get("progress").is_none());
    }
}
