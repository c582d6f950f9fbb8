//! File output: appends delivered events to `events.jsonl` in a directory.
//!
//! Attachments are copied into `attachments/` next to it and the event's
//! paths rewritten to the copies. A batch is committed only after the file
//! has been synced.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use instalog_core::args::{ArgSpec, ArgType, PluginArgs};
use instalog_core::batch::{BATCH_ARGS, BatchOutcome, BatchPolicy, OutputBatcher};
use instalog_core::error::PluginError;
use instalog_core::event::Event;
use instalog_core::plugin::{Constructor, DynPlugin, Plugin, PluginContext, PluginFactory};
use instalog_core::stream::EventStream;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

pub const MODULE: &str = "output_file";

/// File receiving one JSON line per event.
pub const EVENTS_FILE: &str = "events.jsonl";
/// Directory receiving attachment copies.
pub const ATTACHMENTS_DIR: &str = "attachments";
/// Store key counting written events.
pub const EVENTS_KEY: &str = "events";

pub const ARGS: [ArgSpec; 5] = [
    ArgSpec::required("target_dir", ArgType::Str, "Directory to write events into"),
    BATCH_ARGS[0],
    BATCH_ARGS[1],
    BATCH_ARGS[2],
    BATCH_ARGS[3],
];

pub const FACTORY: PluginFactory = PluginFactory {
    name: "OutputFile",
    args: &ARGS,
    constructor: Constructor::Output(build),
};

fn build(args: &PluginArgs) -> Result<Box<dyn DynPlugin>, PluginError> {
    Ok(Box::new(OutputFile::from_args(args)?))
}

pub struct OutputFile {
    target_dir: PathBuf,
    batcher: OutputBatcher,
    stream: Option<EventStream>,
}

impl OutputFile {
    pub fn from_args(args: &PluginArgs) -> Result<Self, PluginError> {
        let target_dir = args
            .str("target_dir")
            .filter(|p| !p.is_empty())
            .ok_or_else(|| PluginError::Config("'target_dir' must not be empty".to_owned()))?;
        Ok(Self {
            target_dir: PathBuf::from(target_dir),
            batcher: OutputBatcher::new(BatchPolicy::from_args(args)),
            stream: None,
        })
    }

    /// Writes a batch and syncs it. Nothing is committed here.
    async fn write_batch(&self, events: Vec<Event>) -> Result<(), PluginError> {
        let attachments_dir = self.target_dir.join(ATTACHMENTS_DIR);
        let mut lines = String::new();
        for mut event in events {
            let mut copies = BTreeMap::new();
            for (id, path) in event.attachments() {
                copies.insert(id.clone(), copy_attachment(path, &attachments_dir).await?);
            }
            event.relocate_attachments(|id, path| {
                copies.remove(id).ok_or_else(|| {
                    PluginError::Other(format!("no copy of attachment {}", path.display()))
                })
            })?;
            lines.push_str(
                &event
                    .serialize()
                    .map_err(|e| PluginError::Other(e.to_string()))?,
            );
            lines.push('\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.target_dir.join(EVENTS_FILE))
            .await?;
        file.write_all(lines.as_bytes()).await?;
        file.sync_all().await?;
        Ok(())
    }
}

/// Copies one attachment unless a copy of the same name already exists.
///
/// Buffered attachments are named by content hash, so an existing file of
/// the same name holds the same bytes.
async fn copy_attachment(source: &Path, dir: &Path) -> Result<PathBuf, PluginError> {
    let name = source.file_name().ok_or_else(|| {
        PluginError::Other(format!("attachment {} has no file name", source.display()))
    })?;
    let dest = dir.join(name);
    if tokio::fs::try_exists(&dest).await? {
        return Ok(dest);
    }
    let partial = dir.join(format!(".{}.partial", name.to_string_lossy()));
    tokio::fs::copy(source, &partial).await?;
    tokio::fs::rename(&partial, &dest).await?;
    Ok(dest)
}

impl Plugin for OutputFile {
    async fn set_up(&mut self, ctx: &PluginContext) -> Result<(), PluginError> {
        tokio::fs::create_dir_all(self.target_dir.join(ATTACHMENTS_DIR)).await?;
        self.stream = Some(ctx.new_stream()?);
        info!(plugin_id = %ctx.plugin_id(), target_dir = %self.target_dir.display(), "file output ready");
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

impl OutputFile {
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
        if let Err(e) = self.write_batch(events).await {
            warn!(plugin_id = %ctx.plugin_id(), count, error = %e, "write failed, aborting batch");
            stream.abort()?;
            return Err(PluginError::Delivery(e.to_string()));
        }
        stream.commit()?;
        ctx.store().incr(EVENTS_KEY, count as u64);
        ctx.store().save()?;
        debug!(plugin_id = %ctx.plugin_id(), count, "batch written");
        Ok(())
    }
}
