//! Socket output: forwards batches to `input_socket` on another node.
//!
//! A batch is committed only after the receiver acknowledges every event
//! with `OK <count>`. Anything else aborts the batch for redelivery, so a
//! receiver that stored the batch but lost the connection before replying
//! sees it again (at-least-once).

use std::time::Duration;

use instalog_core::args::{ArgDefault, ArgSpec, ArgType, PluginArgs};
use instalog_core::batch::{BATCH_ARGS, BatchOutcome, BatchPolicy, OutputBatcher};
use instalog_core::error::PluginError;
use instalog_core::event::Event;
use instalog_core::plugin::{Constructor, DynPlugin, Plugin, PluginContext, PluginFactory};
use instalog_core::stream::EventStream;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::wire;

pub const MODULE: &str = "output_socket";

/// Store key counting acknowledged events.
pub const EVENTS_KEY: &str = "events";

pub const ARGS: [ArgSpec; 7] = [
    ArgSpec::required("hostname", ArgType::Str, "Receiving node's address"),
    ArgSpec::optional("port", ArgType::Int, "Receiving node's port", ArgDefault::Int(8893)),
    ArgSpec::optional(
        "connect_timeout",
        ArgType::Float,
        "Seconds to wait for a connection and for each acknowledgement",
        ArgDefault::Float(30.0),
    ),
    BATCH_ARGS[0],
    BATCH_ARGS[1],
    BATCH_ARGS[2],
    BATCH_ARGS[3],
];

pub const FACTORY: PluginFactory = PluginFactory {
    name: "OutputSocket",
    args: &ARGS,
    constructor: Constructor::Output(build),
};

fn build(args: &PluginArgs) -> Result<Box<dyn DynPlugin>, PluginError> {
    Ok(Box::new(OutputSocket::from_args(args)?))
}

pub struct OutputSocket {
    target: String,
    io_timeout: Duration,
    batcher: OutputBatcher,
    stream: Option<EventStream>,
}

impl OutputSocket {
    pub fn from_args(args: &PluginArgs) -> Result<Self, PluginError> {
        let hostname = args
            .str("hostname")
            .filter(|h| !h.is_empty())
            .ok_or_else(|| PluginError::Config("'hostname' must not be empty".to_owned()))?;
        let port = args
            .int("port")
            .and_then(|p| u16::try_from(p).ok())
            .filter(|p| *p != 0)
            .ok_or_else(|| PluginError::Config("'port' must be between 1 and 65535".to_owned()))?;
        Ok(Self {
            target: format!("{hostname}:{port}"),
            io_timeout: args
                .secs("connect_timeout")
                .unwrap_or(Duration::from_secs(30)),
            batcher: OutputBatcher::new(BatchPolicy::from_args(args)),
            stream: None,
        })
    }

    /// Sends one batch and waits for the acknowledgement.
    async fn transmit(&self, events: &[Event]) -> Result<(), PluginError> {
        let mut payload = String::new();
        for event in events {
            payload.push_str(&wire::encode_event(event).await?);
        }
        payload.push('\n');

        let connection = tokio::time::timeout(self.io_timeout, TcpStream::connect(&self.target))
            .await
            .map_err(|_| PluginError::Delivery(format!("connect to {} timed out", self.target)))?
            .map_err(|e| PluginError::Delivery(format!("connect to {}: {e}", self.target)))?;
        let (read_half, mut write_half) = connection.into_split();
        write_half.write_all(payload.as_bytes()).await?;
        write_half.flush().await?;

        let mut reply = String::new();
        let mut reader = BufReader::new(read_half);
        let read = tokio::time::timeout(self.io_timeout, reader.read_line(&mut reply))
            .await
            .map_err(|_| PluginError::Delivery("no acknowledgement from receiver".to_owned()))??;
        if read == 0 {
            return Err(PluginError::Delivery(
                "receiver closed the connection without replying".to_owned(),
            ));
        }

        let acked = wire::parse_ack(&reply)?;
        if acked != events.len() {
            return Err(PluginError::Delivery(format!(
                "receiver acknowledged {acked} of {} events",
                events.len()
            )));
        }
        Ok(())
    }

    async fn deliver_once(
        &mut self,
        ctx: &PluginContext,
        stream: &mut EventStream,
    ) -> Result<(), PluginError> {
        let events = match self.batcher.collect(stream, ctx.is_flushing()).await? {
            BatchOutcome::Oversize { backoff, .. } => {
                ctx.sleep(backoff).await;
                return Ok(());
            }
            outcome => match outcome.into_events() {
                Some(events) => events,
                None => return Ok(()),
            },
        };

        let count = events.len();
        if let Err(e) = self.transmit(&events).await {
            warn!(plugin_id = %ctx.plugin_id(), target = %self.target, count, error = %e, "transfer failed, aborting batch");
            stream.abort()?;
            return Err(match e {
                PluginError::Delivery(_) => e,
                other => PluginError::Delivery(other.to_string()),
            });
        }
        stream.commit()?;
        ctx.store().incr(EVENTS_KEY, count as u64);
        ctx.store().save()?;
        debug!(plugin_id = %ctx.plugin_id(), target = %self.target, count, "batch acknowledged");
        Ok(())
    }
}

impl Plugin for OutputSocket {
    async fn set_up(&mut self, ctx: &PluginContext) -> Result<(), PluginError> {
        self.stream = Some(ctx.new_stream()?);
        info!(plugin_id = %ctx.plugin_id(), target = %self.target, "socket output ready");
        Ok(())
    }

    async fn main(&mut self, ctx: &PluginContext) -> Result<(), PluginError> {
        let Some(mut stream) = self.stream.take() else {
            return Err(PluginError::Other("stream is not open".to_owned()));
        };
        let result = self.deliver_once(ctx, &mut stream).await;
        self.stream = Some(stream);
        result
    }

    async fn tear_down(&mut self, ctx: &PluginContext) -> Result<(), PluginError> {
        if let Some(mut stream) = self.stream.take() {
            if stream.pending() > 0 {
                stream.abort()?;
            }
        }
        ctx.store().save()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    fn plugin_for(port: u16) -> OutputSocket {
        let args = instalog_core::args::validate_args(
            &ARGS,
            &json!({"hostname": "127.0.0.1", "port": port, "connect_timeout": 2.0}),
        )
        .unwrap();
        OutputSocket::from_args(&args).unwrap()
    }

    fn events(n: u64) -> Vec<Event> {
        (0..n)
            .map(|i| Event::from_value(json!({"n": i})).unwrap())
            .collect()
    }

    #[test]
    fn port_zero_is_rejected() {
        let args = instalog_core::args::validate_args(
            &ARGS,
            &json!({"hostname": "localhost", "port": 0}),
        )
        .unwrap();
        assert!(matches!(OutputSocket::from_args(&args), Err(PluginError::Config(_))));
    }

    #[tokio::test]
    async fn partial_acknowledgement_is_a_delivery_error() {
        // Given: a receiver that acknowledges only one event
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.into_split();
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            loop {
                line.clear();
                reader.read_line(&mut line).await.unwrap();
                if line.trim().is_empty() {
                    break;
                }
            }
            write_half.write_all(wire::ack(1).as_bytes()).await.unwrap();
        });

        // When
        let err = plugin_for(port).transmit(&events(3)).await.unwrap_err();

        // Then
        assert!(err.to_string().contains("acknowledged 1 of 3"), "got: {err}");
    }

    #[tokio::test]
    async fn refused_connection_is_a_delivery_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = plugin_for(port).transmit(&events(1)).await.unwrap_err();
        assert!(matches!(err, PluginError::Delivery(_)));
    }
}
