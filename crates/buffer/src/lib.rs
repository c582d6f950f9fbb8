//! Durable event buffers for Instalog.
//!
//! - [`SimpleFileBuffer`]: one append-only `data.log` with per-consumer
//!   committed sequence numbers
//! - [`PriorityFileBuffer`]: four simple buffers, one per priority level,
//!   served with weighted rounds
//!
//! Both implement [`BufferPlugin`](instalog_core::buffer::BufferPlugin).

mod attachment;
pub mod priority;
pub mod record;
pub mod simple;
mod state;

use std::time::Duration;

pub use priority::{PriorityEventStream, PriorityFileBuffer};
pub use record::RecordError;
pub use simple::{SimpleEventStream, SimpleFileBuffer};

/// Options shared by both buffer implementations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BufferOptions {
    /// Period of automatic truncation; `None` disables it
    pub truncate_interval: Option<Duration>,
    /// Copy attachments into the buffer instead of moving them
    pub copy_attachments: bool,
    /// fsync `data.log` after every produce
    pub enable_fsync: bool,
}
