//! Instalog daemon library.
//!
//! Exposes the daemon's parts for integration testing; production runs
//! the `instalogd` binary (main.rs).

pub mod cli;
pub mod logging;
pub mod metrics_server;
pub mod orchestrator;
pub mod pidfile;
pub mod rpc_server;
pub mod sandbox;

pub use orchestrator::{CoreState, Orchestrator, PauseAction};
