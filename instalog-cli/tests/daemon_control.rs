//! `DaemonControl` against a stand-in control endpoint.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use instalog_cli::commands::status::build_status_report;
use instalog_cli::daemon::{DaemonControl, DaemonStatus};
use instalog_core::InstalogConfig;
use instalog_core::rpc::{RpcRequest, RpcResponse, read_message, write_message};
use serde_json::json;
use tokio::io::BufReader;
use tokio::net::TcpListener;

/// Answers control requests like a running core and records them.
async fn fake_core() -> (u16, Arc<Mutex<Vec<RpcRequest>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            let log = Arc::clone(&log);
            tokio::spawn(async move {
                let (read_half, mut write_half) = socket.into_split();
                let mut reader = BufReader::new(read_half);
                while let Ok(Some(request)) = read_message::<_, RpcRequest>(&mut reader).await {
                    let response = match &request {
                        RpcRequest::IsUp => RpcResponse::ok(true),
                        RpcRequest::Progress => {
                            RpcResponse::ok(json!({"archive": {"completed": 4, "total": 6}}))
                        }
                        _ => RpcResponse::ok(json!({})),
                    };
                    log.lock().unwrap().push(request);
                    if write_message(&mut write_half, &response).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    (port, seen)
}

fn control(port: u16, pid_file: &Path) -> DaemonControl {
    let yaml = format!(
        "instalog: {{node_id: n1, cli_port: {port}, pid_file: '{}'}}",
        pid_file.display()
    );
    let config = InstalogConfig::parse(&yaml).unwrap();
    DaemonControl::new(Path::new("instalog.yaml"), &config)
}

fn unused_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

// =============================================================================
// status
// =============================================================================

#[tokio::test]
async fn nothing_running_is_down() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = control(unused_port(), &dir.path().join("instalogd.pid"));

    assert_eq!(daemon.status().await, DaemonStatus::Down);
    assert!(!daemon.stop(Duration::from_secs(1)).await.unwrap(), "stop should report nothing running");
}

#[tokio::test]
async fn live_pid_without_rpc_is_starting() {
    // Given: a pidfile naming this test process, and no control endpoint
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("instalogd.pid");
    std::fs::write(&pid_file, std::process::id().to_string()).unwrap();
    let daemon = control(unused_port(), &pid_file);

    // Then
    assert_eq!(daemon.status().await, DaemonStatus::Starting);
    assert_eq!(daemon.read_pid(), Some(std::process::id()));
}

#[tokio::test]
async fn answering_core_is_up_with_progress() {
    let dir = tempfile::tempdir().unwrap();
    let (port, _) = fake_core().await;
    let daemon = control(port, &dir.path().join("instalogd.pid"));

    let report = build_status_report(&daemon).await;

    assert_eq!(report.status, DaemonStatus::Up);
    let progress = report.progress.expect("progress should be fetched when up");
    assert_eq!(progress["archive"].pending(), 2);
}

// =============================================================================
// stop
// =============================================================================

#[tokio::test]
async fn stop_goes_through_rpc_first() {
    // Given: a core that keeps answering even after being asked to stop
    let dir = tempfile::tempdir().unwrap();
    let (port, seen) = fake_core().await;
    let daemon = control(port, &dir.path().join("instalogd.pid"));

    // When
    let result = daemon.stop(Duration::from_millis(500)).await;

    // Then: the stop request was sent, and the wait timed out
    assert!(seen.lock().unwrap().contains(&RpcRequest::Stop), "stop should be sent over RPC");
    let err = result.unwrap_err();
    assert_eq!(err.exit_code(), 1);
    assert!(err.to_string().contains("still running"), "got: {err}");
}
