//! `instalog pause`, `unpause` and `toggle-pause` command handlers

use std::io::Write;

use colored::Colorize;
use instalog_core::plugin::PluginState;
use instalog_core::rpc::RpcRequest;
use serde::{Deserialize, Serialize};

use crate::cli::PauseArgs;
use crate::daemon::DaemonControl;
use crate::error::CliError;
use crate::output::{OutputWriter, Render};

const PAUSE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Pause,
    Unpause,
    Toggle,
}

impl Action {
    fn request(self, plugin_id: String) -> RpcRequest {
        match self {
            Self::Pause => RpcRequest::Pause { plugin_id },
            Self::Unpause => RpcRequest::Unpause { plugin_id },
            Self::Toggle => RpcRequest::TogglePause { plugin_id },
        }
    }
}

/// Execute one of the pause commands.
pub async fn execute(
    action: Action,
    args: &PauseArgs,
    daemon: &DaemonControl,
    writer: &OutputWriter,
) -> Result<(), CliError> {
    let request = action.request(args.plugin_id.clone());
    let report: PauseReport = daemon.request(&request, PAUSE_TIMEOUT).await?.into_result()?;
    writer.render(&report)
}

/// Plugin state right after a pause request.
#[derive(Debug, Serialize, Deserialize)]
pub struct PauseReport {
    pub plugin_id: String,
    pub state: PluginState,
}

impl Render for PauseReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        let state = match self.state {
            PluginState::Up => self.state.to_string().green(),
            PluginState::Pausing | PluginState::Paused => self.state.to_string().yellow(),
            _ => self.state.to_string().red(),
        };
        writeln!(w, "{}: {state}", self.plugin_id)
    }
}
