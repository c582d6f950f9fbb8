use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use instalog_core::InstalogConfig;
use instalog_core::policy::RuleRegistry;
use instalog_daemon::cli::DaemonCli;
use instalog_daemon::orchestrator::Orchestrator;
use instalog_daemon::{logging, metrics_server, pidfile};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = DaemonCli::parse();

    let mut config = InstalogConfig::load(&cli.config)
        .await
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    cli.apply_overrides(&mut config);
    config.validate()?;

    if cli.validate {
        let resolved = config.resolve()?;
        println!("configuration OK: node '{}'", resolved.node_id);
        println!("  buffer  {} ({})", resolved.buffer.id, resolved.buffer.module);
        for plan in resolved.inputs.iter().chain(resolved.outputs.iter()) {
            println!("  {:<7} {} ({})", plan.kind.as_str(), plan.id, plan.module);
        }
        return Ok(());
    }

    logging::init_tracing(&config.instalog)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "instalogd starting"
    );

    if config.metrics.enabled {
        metrics_server::install_metrics_recorder(&config.metrics)?;
    }

    let pid_file = config.instalog.pid_file.clone();
    if !pid_file.is_empty() {
        pidfile::write_pid_file(Path::new(&pid_file))?;
    }

    let core = Arc::new(Orchestrator::new(
        config,
        instalog_plugins::builtin_registry(),
        RuleRegistry::with_builtins(),
    ));

    let outcome = run(&core).await;

    if !pid_file.is_empty() {
        pidfile::remove_pid_file(Path::new(&pid_file));
    }
    outcome
}

async fn run(core: &Arc<Orchestrator>) -> Result<()> {
    core.start().await?;

    tokio::select! {
        signal = wait_for_shutdown_signal() => {
            tracing::info!(signal = signal?, "shutdown signal received");
        }
        _ = core.shutdown_requested() => {
            tracing::info!("shutdown requested over RPC");
        }
    }

    let unclean = core.stop().await;
    if !unclean.is_empty() {
        tracing::warn!(plugins = ?unclean, "forced shutdown of some plugins");
    }
    tracing::info!("instalogd shut down");
    Ok(())
}

/// Wait for SIGTERM or SIGINT; returns the signal's name.
async fn wait_for_shutdown_signal() -> Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("failed to install SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("failed to install SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}
