//! Control RPC messages and the newline-delimited JSON codec.
//!
//! One request per line, one response per line, over TCP. The daemon serves
//! these; the CLI is the usual client.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::buffer::ConsumerProgress;
use crate::error::RpcError;

/// Largest accepted message line.
pub const MAX_MESSAGE_BYTES: u64 = 1024 * 1024;

fn root_path() -> String {
    ".".to_owned()
}

/// Control request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum RpcRequest {
    /// Readiness check
    IsUp,
    /// Begin an orderly shutdown; replies immediately
    Stop,
    /// Wait until outputs commit everything produced so far
    Flush {
        /// Flush every output when absent
        #[serde(default)]
        plugin_id: Option<String>,
        timeout_secs: f64,
    },
    /// Read plugin state at a dotted path
    Inspect {
        plugin_id: String,
        #[serde(default = "root_path")]
        path: String,
    },
    /// Delivery progress of every output
    Progress,
    /// Stop calling a plugin's `main` once the current call returns
    Pause { plugin_id: String },
    Unpause { plugin_id: String },
    TogglePause { plugin_id: String },
}

/// Control response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RpcResponse {
    Ok { result: Value },
    Error { message: String },
}

impl RpcResponse {
    pub fn ok(result: impl Serialize) -> Self {
        match serde_json::to_value(result) {
            Ok(result) => Self::Ok { result },
            Err(e) => Self::error(format!("cannot encode result: {e}")),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Decodes the result, turning remote errors into [`RpcError::Remote`].
    pub fn into_result<T: DeserializeOwned>(self) -> Result<T, RpcError> {
        match self {
            Self::Ok { result } => Ok(serde_json::from_value(result)?),
            Self::Error { message } => Err(RpcError::Remote(message)),
        }
    }
}

/// Outcome of a flush.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlushResult {
    pub success: bool,
    pub message: String,
    /// Highest committed sequence reached
    pub completed: u64,
    /// Sequence that had to be reached
    pub watermark: u64,
}

/// Progress of all outputs by plugin id.
pub type ProgressReport = BTreeMap<String, ConsumerProgress>;

/// Writes one message line.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one message line; `None` on a clean EOF.
pub async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>, RpcError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    let read = (&mut *reader)
        .take(MAX_MESSAGE_BYTES)
        .read_line(&mut line)
        .await?;
    if read == 0 {
        return Ok(None);
    }
    if !line.ends_with('\n') && read as u64 >= MAX_MESSAGE_BYTES {
        return Err(RpcError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("message exceeds {MAX_MESSAGE_BYTES} bytes"),
        )));
    }
    Ok(Some(serde_json::from_str(line.trim_end())?))
}

/// Sends one request and waits for its response.
pub async fn call(addr: &str, request: &RpcRequest, timeout: Duration) -> Result<RpcResponse, RpcError> {
    let exchange = async {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, mut write_half) = stream.into_split();
        write_message(&mut write_half, request).await?;
        let mut reader = BufReader::new(read_half);
        read_message::<_, RpcResponse>(&mut reader)
            .await?
            .ok_or(RpcError::ConnectionClosed)
    };
    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| RpcError::Timeout(timeout))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_wire_shape() {
        let req = RpcRequest::Flush {
            plugin_id: Some("archive".into()),
            timeout_secs: 5.0,
        };
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"method": "flush", "plugin_id": "archive", "timeout_secs": 5.0})
        );
        assert_eq!(
            serde_json::from_value::<RpcRequest>(json!({"method": "is_up"})).unwrap(),
            RpcRequest::IsUp
        );
    }

    #[test]
    fn pause_requests_carry_the_plugin_id() {
        assert_eq!(
            serde_json::to_value(RpcRequest::TogglePause {
                plugin_id: "station_log".into()
            })
            .unwrap(),
            json!({"method": "toggle_pause", "plugin_id": "station_log"})
        );
        assert_eq!(
            serde_json::from_value::<RpcRequest>(json!({"method": "unpause", "plugin_id": "a"})).unwrap(),
            RpcRequest::Unpause {
                plugin_id: "a".into()
            }
        );
    }

    #[test]
    fn inspect_path_defaults_to_root() {
        let req: RpcRequest =
            serde_json::from_value(json!({"method": "inspect", "plugin_id": "x"})).unwrap();
        assert_eq!(
            req,
            RpcRequest::Inspect {
                plugin_id: "x".into(),
                path: ".".into()
            }
        );
    }

    #[test]
    fn response_into_result() {
        let ok = RpcResponse::ok(true);
        assert!(ok.into_result::<bool>().unwrap());

        let err = RpcResponse::error("unknown plugin 'x'");
        match err.into_result::<bool>() {
            Err(RpcError::Remote(msg)) => assert!(msg.contains("unknown plugin")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn codec_reads_what_it_writes() {
        let (client, server) = tokio::io::duplex(4096);
        let (_, mut client_write) = tokio::io::split(client);
        let (server_read, _) = tokio::io::split(server);
        let mut reader = BufReader::new(server_read);

        write_message(&mut client_write, &RpcRequest::Progress).await.unwrap();
        write_message(&mut client_write, &RpcRequest::Stop).await.unwrap();
        drop(client_write);

        let first: Option<RpcRequest> = read_message(&mut reader).await.unwrap();
        let second: Option<RpcRequest> = read_message(&mut reader).await.unwrap();
        assert_eq!(first, Some(RpcRequest::Progress));
        assert_eq!(second, Some(RpcRequest::Stop));
    }

    #[tokio::test]
    async fn call_to_closed_port_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = call(&addr, &RpcRequest::IsUp, Duration::from_secs(2)).await;
        assert!(result.is_err());
    }
}
