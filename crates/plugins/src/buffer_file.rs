//! Buffer module factories.

use std::path::Path;
use std::sync::Arc;

use instalog_buffer::{BufferOptions, PriorityFileBuffer, SimpleFileBuffer};
use instalog_core::args::{ArgDefault, ArgSpec, ArgType, PluginArgs};
use instalog_core::buffer::BufferPlugin;
use instalog_core::error::PluginError;
use instalog_core::plugin::{Constructor, PluginFactory};

pub const SIMPLE_MODULE: &str = "buffer_simple_file";
pub const PRIORITY_MODULE: &str = "buffer_priority_file";

const fn buffer_args(default_interval: f64) -> [ArgSpec; 3] {
    [
        ArgSpec::optional(
            "truncate_interval",
            ArgType::Float,
            "Seconds between truncation passes; 0 disables",
            ArgDefault::Float(default_interval),
        ),
        ArgSpec::optional(
            "copy_attachments",
            ArgType::Bool,
            "Copy attachments into the buffer instead of moving them",
            ArgDefault::Bool(false),
        ),
        ArgSpec::optional(
            "enable_fsync",
            ArgType::Bool,
            "fsync the data file after every produce",
            ArgDefault::Bool(false),
        ),
    ]
}

pub const SIMPLE_ARGS: [ArgSpec; 3] = buffer_args(0.0);
pub const PRIORITY_ARGS: [ArgSpec; 3] = buffer_args(5.0);

pub const SIMPLE_FACTORY: PluginFactory = PluginFactory {
    name: "SimpleFileBuffer",
    args: &SIMPLE_ARGS,
    constructor: Constructor::Buffer(build_simple),
};

pub const PRIORITY_FACTORY: PluginFactory = PluginFactory {
    name: "PriorityFileBuffer",
    args: &PRIORITY_ARGS,
    constructor: Constructor::Buffer(build_priority),
};

/// Reads buffer arguments. A zero interval disables truncation.
pub fn options_from_args(args: &PluginArgs) -> BufferOptions {
    BufferOptions {
        truncate_interval: args.secs("truncate_interval").filter(|d| !d.is_zero()),
        copy_attachments: args.bool("copy_attachments").unwrap_or(false),
        enable_fsync: args.bool("enable_fsync").unwrap_or(false),
    }
}

fn build_simple(args: &PluginArgs, dir: &Path) -> Result<Arc<dyn BufferPlugin>, PluginError> {
    Ok(Arc::new(SimpleFileBuffer::open(dir, options_from_args(args))?))
}

fn build_priority(args: &PluginArgs, dir: &Path) -> Result<Arc<dyn BufferPlugin>, PluginError> {
    Ok(Arc::new(PriorityFileBuffer::open(dir, options_from_args(args))?))
}
