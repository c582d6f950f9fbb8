//! Socket input: receives batches from `output_socket` on another node.
//!
//! Each connection is served by its own task. A batch is acknowledged only
//! after it has been emitted into the local buffer, so the sender commits
//! nothing that could still be lost here.

use std::path::{Path, PathBuf};

use instalog_core::args::{ArgDefault, ArgSpec, ArgType, PluginArgs};
use instalog_core::error::PluginError;
use instalog_core::event::Event;
use instalog_core::plugin::{Constructor, DynPlugin, Plugin, PluginContext, PluginFactory};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::wire;

pub const MODULE: &str = "input_socket";

/// Store key holding the bound address.
pub const LISTEN_ADDR_KEY: &str = "listen_addr";
/// Store key counting received events.
pub const EVENTS_KEY: &str = "events";

const STAGING_DIR: &str = "incoming";

pub const ARGS: [ArgSpec; 2] = [
    ArgSpec::optional(
        "hostname",
        ArgType::Str,
        "Address to listen on",
        ArgDefault::Str("0.0.0.0"),
    ),
    ArgSpec::optional("port", ArgType::Int, "Port to listen on", ArgDefault::Int(8893)),
];

pub const FACTORY: PluginFactory = PluginFactory {
    name: "InputSocket",
    args: &ARGS,
    constructor: Constructor::Input(build),
};

fn build(args: &PluginArgs) -> Result<Box<dyn DynPlugin>, PluginError> {
    Ok(Box::new(InputSocket::from_args(args)?))
}

pub struct InputSocket {
    bind_addr: String,
    listener: Option<TcpListener>,
    connections: JoinSet<()>,
}

impl InputSocket {
    pub fn from_args(args: &PluginArgs) -> Result<Self, PluginError> {
        let hostname = args.str("hostname").unwrap_or("0.0.0.0");
        let port = args
            .int("port")
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| PluginError::Config("'port' must be between 0 and 65535".to_owned()))?;
        Ok(Self {
            bind_addr: format!("{hostname}:{port}"),
            listener: None,
            connections: JoinSet::new(),
        })
    }
}

impl Plugin for InputSocket {
    async fn set_up(&mut self, ctx: &PluginContext) -> Result<(), PluginError> {
        tokio::fs::create_dir_all(ctx.data_dir().join(STAGING_DIR)).await?;
        let listener = TcpListener::bind(&self.bind_addr).await.map_err(|e| {
            PluginError::Config(format!("failed to bind to {}: {e}", self.bind_addr))
        })?;
        let local = listener.local_addr()?;
        ctx.store().set(LISTEN_ADDR_KEY, local.to_string());
        info!(plugin_id = %ctx.plugin_id(), addr = %local, "socket input listening");
        self.listener = Some(listener);
        Ok(())
    }

    async fn main(&mut self, ctx: &PluginContext) -> Result<(), PluginError> {
        let Some(listener) = &self.listener else {
            return Err(PluginError::Other("listener is not bound".to_owned()));
        };

        // reap finished connection tasks
        while self.connections.try_join_next().is_some() {}

        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                debug!(plugin_id = %ctx.plugin_id(), %peer, "connection accepted");
                let ctx = ctx.clone();
                self.connections.spawn(async move {
                    let peer = peer.to_string();
                    if let Err(e) = serve(stream, &ctx, &peer).await {
                        warn!(plugin_id = %ctx.plugin_id(), %peer, error = %e, "connection failed");
                    }
                });
            }
            _ = ctx.stop_token().cancelled() => {}
        }
        Ok(())
    }

    async fn tear_down(&mut self, ctx: &PluginContext) -> Result<(), PluginError> {
        self.listener = None;
        self.connections.shutdown().await;
        ctx.store().save()?;
        Ok(())
    }
}

/// Serves batches on one connection until EOF or stop.
async fn serve(stream: TcpStream, ctx: &PluginContext, peer: &str) -> Result<(), PluginError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let staging = ctx.data_dir().join(STAGING_DIR);

    loop {
        let batch = tokio::select! {
            batch = read_batch(&mut reader, &staging) => batch,
            _ = ctx.stop_token().cancelled() => return Ok(()),
        };
        let (events, staged) = match batch {
            Ok(Some(batch)) => batch,
            Ok(None) => {
                debug!(plugin_id = %ctx.plugin_id(), peer, "connection closed by peer");
                return Ok(());
            }
            Err(e) => {
                write_half.write_all(wire::nack(&e.to_string()).as_bytes()).await?;
                return Err(e);
            }
        };

        let count = events.len();
        let emitted = if events.is_empty() {
            Ok(0)
        } else {
            ctx.emit(events).await
        };
        remove_staged(&staged).await;

        match emitted {
            Ok(_) => {
                ctx.store().incr(EVENTS_KEY, count as u64);
                write_half.write_all(wire::ack(count).as_bytes()).await?;
                debug!(plugin_id = %ctx.plugin_id(), peer, count, "batch received");
            }
            Err(e) => {
                write_half.write_all(wire::nack(&e.to_string()).as_bytes()).await?;
                return Err(e);
            }
        }
    }
}

/// Reads lines up to the terminating empty line. `None` on EOF before any line.
async fn read_batch<R>(
    reader: &mut R,
    staging: &Path,
) -> Result<Option<(Vec<Event>, Vec<PathBuf>)>, PluginError>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut events = Vec::new();
    let mut staged = Vec::new();
    let mut line = String::new();
    loop {
        line.clear();
        let read = (&mut *reader)
            .take(wire::MAX_LINE_BYTES)
            .read_line(&mut line)
            .await?;
        if read == 0 {
            remove_staged(&staged).await;
            if events.is_empty() {
                return Ok(None);
            }
            return Err(PluginError::Other("connection closed mid-batch".to_owned()));
        }
        if !line.ends_with('\n') {
            remove_staged(&staged).await;
            return Err(PluginError::Other("event line too long".to_owned()));
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            return Ok(Some((events, staged)));
        }
        match wire::decode_event(trimmed, staging).await {
            Ok((event, files)) => {
                events.push(event);
                staged.extend(files);
            }
            Err(e) => {
                remove_staged(&staged).await;
                return Err(e);
            }
        }
    }
}

/// Deletes staged attachment files the buffer did not move away.
async fn remove_staged(paths: &[PathBuf]) {
    for path in paths {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "cannot remove staged attachment"),
        }
    }
}
