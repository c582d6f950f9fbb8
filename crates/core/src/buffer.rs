//! Buffer contract.
//!
//! A buffer durably stores events and hands them out through per-consumer
//! [`BufferEventStream`]s. Implementations live in `instalog-buffer`; the
//! runtime only talks to them through these traits.
//!
//! All methods are synchronous and may touch the disk. Async callers should
//! move `produce` onto a blocking thread.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::BufferError;
use crate::event::Event;

/// Delivery progress of one consumer, in buffer sequence numbers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerProgress {
    /// Highest sequence committed by the consumer
    pub completed: u64,
    /// Highest sequence produced into the buffer
    pub total: u64,
}

impl ConsumerProgress {
    /// Events produced but not yet committed by this consumer.
    pub fn pending(&self) -> u64 {
        self.total.saturating_sub(self.completed)
    }
}

/// Outcome of a truncation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncateReport {
    pub removed_records: u64,
    pub removed_attachments: u64,
}

impl std::ops::AddAssign for TruncateReport {
    fn add_assign(&mut self, rhs: Self) {
        self.removed_records += rhs.removed_records;
        self.removed_attachments += rhs.removed_attachments;
    }
}

/// Durable event store with independent consumers.
pub trait BufferPlugin: Send + Sync {
    /// Appends events and returns the last assigned sequence number.
    ///
    /// Attachments are moved (or copied) into the buffer first. On error
    /// nothing is appended, so the call can be retried.
    fn produce(&self, events: Vec<Event>) -> Result<u64, BufferError>;

    /// Opens the consumer's stream. Only one may be open per consumer.
    fn consume(&self, consumer: &str) -> Result<Box<dyn BufferEventStream>, BufferError>;

    /// Registers a consumer starting at the current end of the buffer.
    ///
    /// Adding an existing consumer is a no-op.
    fn add_consumer(&self, consumer: &str) -> Result<(), BufferError>;

    fn remove_consumer(&self, consumer: &str) -> Result<(), BufferError>;

    fn list_consumers(&self) -> Result<BTreeMap<String, ConsumerProgress>, BufferError>;

    fn progress(&self, consumer: &str) -> Result<ConsumerProgress, BufferError>;

    /// Drops records every consumer has committed.
    fn truncate(&self) -> Result<TruncateReport, BufferError>;

    /// Period of automatic truncation; `None` disables it.
    fn truncate_interval(&self) -> Option<Duration>;

    /// Watch channel carrying the last produced sequence number.
    fn subscribe(&self) -> watch::Receiver<u64>;

    /// Flushes state and rejects further use.
    fn close(&self) -> Result<(), BufferError>;
}

/// One consumer's transactional read cursor.
///
/// Events returned by `next` since the last `commit`/`abort` form the
/// current checkout. Dropping a stream with an open checkout aborts it.
pub trait BufferEventStream: Send + Sync {
    /// Next unread event, or `None` when the consumer is caught up.
    fn next(&mut self) -> Result<Option<Event>, BufferError>;

    /// Number of events in the open checkout.
    fn pending(&self) -> usize;

    /// Marks the checkout delivered.
    fn commit(&mut self) -> Result<(), BufferError>;

    /// Returns the checkout for redelivery.
    fn abort(&mut self) -> Result<(), BufferError>;
}
