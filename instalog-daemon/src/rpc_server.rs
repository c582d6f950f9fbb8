//! Control RPC server.
//!
//! Accepts connections on the node's `cli_hostname:cli_port` and answers
//! newline-delimited JSON requests until the client disconnects. A request
//! that cannot be decoded gets an error reply and ends the connection.

use std::sync::Arc;
use std::time::Duration;

use instalog_core::rpc::{RpcRequest, RpcResponse, read_message, write_message};
use serde_json::json;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::orchestrator::{Orchestrator, PauseAction};

/// Serves control requests until `stop` is cancelled.
///
/// Open connections are dropped with the server.
pub async fn serve(core: Arc<Orchestrator>, listener: TcpListener, stop: CancellationToken) {
    let mut connections = JoinSet::new();
    loop {
        while connections.try_join_next().is_some() {}

        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = stop.cancelled() => break,
        };
        match accepted {
            Ok((socket, peer)) => {
                debug!(%peer, "control connection accepted");
                connections.spawn(handle_connection(Arc::clone(&core), socket));
            }
            Err(e) => {
                warn!(error = %e, "control accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    connections.shutdown().await;
    debug!("control RPC server stopped");
}

async fn handle_connection(core: Arc<Orchestrator>, socket: TcpStream) {
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);
    loop {
        let (response, keep_open) = match read_message::<_, RpcRequest>(&mut reader).await {
            Ok(Some(request)) => (dispatch(&core, request).await, true),
            Ok(None) => return,
            Err(e) => (RpcResponse::error(format!("bad request: {e}")), false),
        };
        if let Err(e) = write_message(&mut write_half, &response).await {
            debug!(error = %e, "control client went away");
            return;
        }
        if !keep_open {
            return;
        }
    }
}

/// Runs one request against the core.
pub async fn dispatch(core: &Orchestrator, request: RpcRequest) -> RpcResponse {
    debug!(?request, "control request");
    match request {
        RpcRequest::IsUp => RpcResponse::ok(core.is_up()),
        RpcRequest::Stop => {
            core.request_shutdown();
            RpcResponse::ok(json!({"stopping": true}))
        }
        RpcRequest::Flush {
            plugin_id,
            timeout_secs,
        } => {
            let Ok(timeout) = Duration::try_from_secs_f64(timeout_secs) else {
                return RpcResponse::error(format!("invalid timeout {timeout_secs}"));
            };
            match core.flush(plugin_id.as_deref(), timeout).await {
                Ok(result) => RpcResponse::ok(result),
                Err(message) => RpcResponse::error(message),
            }
        }
        RpcRequest::Inspect { plugin_id, path } => match core.inspect(&plugin_id, &path).await {
            Ok(value) => RpcResponse::ok(value),
            Err(e) => RpcResponse::error(e.to_string()),
        },
        RpcRequest::Progress => match core.progress().await {
            Ok(report) => RpcResponse::ok(report),
            Err(message) => RpcResponse::error(message),
        },
        RpcRequest::Pause { plugin_id } => pause(core, &plugin_id, PauseAction::Pause).await,
        RpcRequest::Unpause { plugin_id } => pause(core, &plugin_id, PauseAction::Unpause).await,
        RpcRequest::TogglePause { plugin_id } => pause(core, &plugin_id, PauseAction::Toggle).await,
    }
}

async fn pause(core: &Orchestrator, plugin_id: &str, action: PauseAction) -> RpcResponse {
    match core.pause(plugin_id, action).await {
        Ok(state) => RpcResponse::ok(json!({"plugin_id": plugin_id, "state": state})),
        Err(message) => RpcResponse::error(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use instalog_core::config::InstalogConfig;
    use instalog_core::plugin::PluginRegistry;
    use instalog_core::policy::RuleRegistry;

    fn idle_core() -> Orchestrator {
        let config = InstalogConfig::parse("instalog: {node_id: n1}").unwrap();
        Orchestrator::new(config, PluginRegistry::new(), RuleRegistry::with_builtins())
    }

    #[tokio::test]
    async fn stopped_core_answers_is_up_false() {
        let response = dispatch(&idle_core(), RpcRequest::IsUp).await;
        assert_eq!(response, RpcResponse::ok(false));
    }

    #[tokio::test]
    async fn stop_request_signals_shutdown() {
        let core = idle_core();
        dispatch(&core, RpcRequest::Stop).await;
        tokio::time::timeout(Duration::from_secs(1), core.shutdown_requested())
            .await
            .expect("shutdown should be requested");
    }

    #[tokio::test]
    async fn negative_flush_timeout_is_rejected() {
        let response = dispatch(
            &idle_core(),
            RpcRequest::Flush {
                plugin_id: None,
                timeout_secs: -1.0,
            },
        )
        .await;
        assert!(matches!(response, RpcResponse::Error { message } if message.contains("invalid timeout")));
    }

    #[tokio::test]
    async fn requests_fail_while_stopped() {
        let core = idle_core();
        assert!(matches!(dispatch(&core, RpcRequest::Progress).await, RpcResponse::Error { .. }));
        assert!(matches!(
            dispatch(&core, RpcRequest::Pause { plugin_id: "in1".to_owned() }).await,
            RpcResponse::Error { message } if message.contains("not running")
        ));
        assert!(matches!(
            dispatch(
                &core,
                RpcRequest::Inspect {
                    plugin_id: "buffer".to_owned(),
                    path: ".".to_owned()
                }
            )
            .await,
            RpcResponse::Error { .. }
        ));
    }
}
