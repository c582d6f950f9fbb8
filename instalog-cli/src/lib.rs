//! Instalog operator CLI.
//!
//! Exposed as a library for integration tests; the `instalog` binary is
//! a thin wrapper in main.rs.

pub mod cli;
pub mod commands;
pub mod config;
pub mod daemon;
pub mod error;
pub mod output;

use cli::{Cli, Commands};
use commands::pause::Action;
use daemon::DaemonControl;
use error::CliError;
use output::OutputWriter;

/// Runs one parsed command line.
pub async fn run(cli: Cli) -> Result<(), CliError> {
    let (config_path, config) = config::load(cli.config.as_deref()).await?;
    let daemon = DaemonControl::new(&config_path, &config);
    let writer = OutputWriter::new(cli.output);

    match &cli.command {
        Commands::Start(args) => commands::start::execute(args, &daemon, &writer).await,
        Commands::Stop(args) => commands::stop::execute(args, &daemon, &writer).await,
        Commands::Restart(args) => commands::restart::execute(args, &daemon, &writer).await,
        Commands::Status => commands::status::execute(&daemon, &writer).await,
        Commands::Flush(args) => commands::flush::execute(args, &daemon, &writer).await,
        Commands::Inspect(args) => commands::inspect::execute(args, &daemon, &writer).await,
        Commands::Pause(args) => commands::pause::execute(Action::Pause, args, &daemon, &writer).await,
        Commands::Unpause(args) => commands::pause::execute(Action::Unpause, args, &daemon, &writer).await,
        Commands::TogglePause(args) => commands::pause::execute(Action::Toggle, args, &daemon, &writer).await,
    }
}
