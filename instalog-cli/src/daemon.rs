//! Process-level control of `instalogd`, independent of what the core does.
//!
//! Start detaches the daemon and waits for its control RPC to answer. Stop
//! asks over RPC and falls back to SIGTERM on the pidfile's PID. Status
//! combines both views.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use instalog_core::InstalogConfig;
use instalog_core::rpc::{self, RpcRequest, RpcResponse};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::CliError;

/// How long a background start waits for the daemon to answer.
pub const READY_TIMEOUT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const CONTROL_TIMEOUT: Duration = Duration::from_secs(2);

/// Name of the daemon executable.
pub const DAEMON_BINARY: &str = "instalogd";

/// Daemon state as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DaemonStatus {
    /// Control RPC answers and the core is running
    Up,
    /// The process exists but the core is not up yet
    Starting,
    Down,
}

impl std::fmt::Display for DaemonStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Up => "UP",
            Self::Starting => "STARTING",
            Self::Down => "DOWN",
        })
    }
}

pub struct DaemonControl {
    config_path: PathBuf,
    rpc_addr: String,
    pid_file: Option<PathBuf>,
}

impl DaemonControl {
    pub fn new(config_path: &Path, config: &InstalogConfig) -> Self {
        let node = &config.instalog;
        let host = match node.cli_hostname.as_str() {
            "0.0.0.0" | "" => "127.0.0.1",
            "::" => "::1",
            other => other,
        };
        let rpc_addr = if host.contains(':') {
            format!("[{host}]:{}", node.cli_port)
        } else {
            format!("{host}:{}", node.cli_port)
        };
        Self {
            config_path: config_path.to_path_buf(),
            rpc_addr,
            pid_file: (!node.pid_file.is_empty()).then(|| PathBuf::from(&node.pid_file)),
        }
    }

    pub fn rpc_addr(&self) -> &str {
        &self.rpc_addr
    }

    /// PID recorded in the pidfile, if any.
    pub fn read_pid(&self) -> Option<u32> {
        let path = self.pid_file.as_ref()?;
        let content = std::fs::read_to_string(path).ok()?;
        content.trim().parse().ok()
    }

    fn live_pid(&self) -> Option<u32> {
        self.read_pid().filter(|pid| process_alive(*pid))
    }

    /// Sends one control request.
    pub async fn request(&self, request: &RpcRequest, timeout: Duration) -> Result<RpcResponse, CliError> {
        rpc::call(&self.rpc_addr, request, timeout).await.map_err(|e| match e {
            instalog_core::RpcError::Io(io) => {
                CliError::DaemonUnavailable(format!("{}: {io}", self.rpc_addr))
            }
            other => CliError::Rpc(other),
        })
    }

    /// Whether the core answers `is_up` with true.
    pub async fn is_up(&self) -> bool {
        match self.request(&RpcRequest::IsUp, CONTROL_TIMEOUT).await {
            Ok(response) => response.into_result::<bool>().unwrap_or(false),
            Err(e) => {
                debug!(error = %e, "is_up check failed");
                false
            }
        }
    }

    pub async fn status(&self) -> DaemonStatus {
        if self.is_up().await {
            DaemonStatus::Up
        } else if self.live_pid().is_some() {
            DaemonStatus::Starting
        } else {
            DaemonStatus::Down
        }
    }

    /// Starts the daemon.
    ///
    /// In the foreground the current process is replaced by `instalogd` and
    /// this only returns on failure. In the background the daemon is
    /// detached and the returned PID belongs to a core that answers `is_up`.
    pub async fn start(&self, foreground: bool) -> Result<u32, CliError> {
        if self.status().await != DaemonStatus::Down {
            return Err(CliError::Command("daemon is already running".to_owned()));
        }
        let mut cmd = Command::new(daemon_binary());
        cmd.arg("--config").arg(&self.config_path);

        if foreground {
            info!("executing instalogd in the foreground");
            let err = exec(&mut cmd);
            return Err(CliError::Command(format!("failed to execute {DAEMON_BINARY}: {err}")));
        }

        cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        detach(&mut cmd);
        let mut child = cmd
            .spawn()
            .map_err(|e| CliError::Command(format!("failed to spawn {DAEMON_BINARY}: {e}")))?;
        let pid = child.id();
        info!(pid, "daemon spawned, waiting for it to come up");

        let deadline = Instant::now() + READY_TIMEOUT;
        loop {
            if let Some(status) = child.try_wait()? {
                return Err(CliError::Command(format!(
                    "daemon exited during startup with {status}"
                )));
            }
            if self.is_up().await {
                info!(pid, "daemon is up");
                return Ok(pid);
            }
            if Instant::now() >= deadline {
                return Err(CliError::Timeout(format!(
                    "daemon did not come up within {}s",
                    READY_TIMEOUT.as_secs()
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Stops the daemon and waits for it to go away.
    ///
    /// Returns `false` when nothing was running.
    pub async fn stop(&self, timeout: Duration) -> Result<bool, CliError> {
        let pid = self.live_pid();
        let up = self.is_up().await;
        if pid.is_none() && !up {
            return Ok(false);
        }

        let asked = up
            && match self.request(&RpcRequest::Stop, CONTROL_TIMEOUT).await {
                Ok(_) => true,
                Err(e) => {
                    warn!(error = %e, "stop request failed, falling back to SIGTERM");
                    false
                }
            };
        if !asked {
            match pid {
                Some(pid) => terminate(pid)?,
                None => {
                    return Err(CliError::DaemonUnavailable(
                        "daemon did not accept the stop request and has no pidfile".to_owned(),
                    ));
                }
            }
        }

        let deadline = Instant::now() + timeout;
        loop {
            let gone = match pid {
                Some(pid) => !process_alive(pid),
                None => !self.is_up().await,
            };
            if gone {
                info!("daemon stopped");
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Err(CliError::Timeout(format!(
                    "daemon still running after {}s",
                    timeout.as_secs_f64()
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// `$INSTALOGD`, else `instalogd` next to this executable, else `$PATH`.
fn daemon_binary() -> PathBuf {
    if let Some(path) = std::env::var_os("INSTALOGD") {
        return PathBuf::from(path);
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(DAEMON_BINARY)))
        .filter(|candidate| candidate.is_file())
        .unwrap_or_else(|| PathBuf::from(DAEMON_BINARY))
}

#[cfg(unix)]
fn exec(cmd: &mut Command) -> std::io::Error {
    use std::os::unix::process::CommandExt;
    cmd.exec()
}

#[cfg(not(unix))]
fn exec(_cmd: &mut Command) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Unsupported, "exec not supported on this platform")
}

/// Puts the child in its own session so it outlives the terminal.
#[cfg(unix)]
fn detach(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    // SAFETY: setsid is async-signal-safe and touches only the child.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn detach(_cmd: &mut Command) {}

/// Whether a process with `pid` exists.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: kill(2) with signal 0 only checks existence and permission.
    let result = unsafe { libc::kill(pid, 0) };
    result == 0 || std::io::Error::last_os_error().kind() == std::io::ErrorKind::PermissionDenied
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    warn!("process liveness check not supported on this platform");
    false
}

#[cfg(unix)]
fn terminate(pid: u32) -> Result<(), CliError> {
    let target = libc::pid_t::try_from(pid)
        .map_err(|_| CliError::Command(format!("invalid pid {pid}")))?;
    info!(pid, "sending SIGTERM");
    // SAFETY: plain signal delivery to a PID read from the pidfile.
    if unsafe { libc::kill(target, libc::SIGTERM) } == -1 {
        return Err(CliError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(unix))]
fn terminate(pid: u32) -> Result<(), CliError> {
    Err(CliError::Command(format!("cannot signal pid {pid} on this platform")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control(yaml: &str) -> DaemonControl {
        let config = InstalogConfig::parse(yaml).unwrap();
        DaemonControl::new(Path::new("/etc/instalog.yaml"), &config)
    }

    #[test]
    fn wildcard_bind_is_reached_over_loopback() {
        let c = control("instalog: {node_id: n, cli_hostname: 0.0.0.0, cli_port: 7100}");
        assert_eq!(c.rpc_addr(), "127.0.0.1:7100");
    }

    #[test]
    fn ipv6_hosts_are_bracketed() {
        let c = control("instalog: {node_id: n, cli_hostname: '::', cli_port: 7100}");
        assert_eq!(c.rpc_addr(), "[::1]:7100");
    }

    #[test]
    fn empty_pid_file_disables_pid_lookup() {
        let c = control("instalog: {node_id: n, pid_file: ''}");
        assert_eq!(c.read_pid(), None);
    }

    #[test]
    fn own_process_is_alive() {
        assert!(process_alive(std::process::id()));
    }

    #[test]
    #[serial_test::serial]
    fn daemon_binary_honours_env_override() {
        // SAFETY: serialized test, no other thread reads the environment.
        unsafe { std::env::set_var("INSTALOGD", "/opt/instalog/bin/instalogd") };
        let chosen = daemon_binary();
        unsafe { std::env::remove_var("INSTALOGD") };

        assert_eq!(chosen, PathBuf::from("/opt/instalog/bin/instalogd"));
    }

    #[test]
    #[serial_test::serial]
    fn daemon_binary_falls_back_to_path_lookup() {
        // SAFETY: serialized test, no other thread reads the environment.
        unsafe { std::env::remove_var("INSTALOGD") };

        let chosen = daemon_binary();

        assert!(
            chosen == PathBuf::from(DAEMON_BINARY) || chosen.ends_with(DAEMON_BINARY),
            "unexpected daemon binary: {}",
            chosen.display()
        );
    }

    #[test]
    fn status_display_is_uppercase() {
        assert_eq!(DaemonStatus::Starting.to_string(), "STARTING");
        assert_eq!(serde_json::to_value(DaemonStatus::Up).unwrap(), "UP");
    }
}
