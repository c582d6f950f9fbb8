//! Output batching by count, time and size.
//!
//! [`OutputBatcher`] pulls one batch from an [`EventStream`] and classifies
//! it. A batch reaching `threshold_bytes` is flushed early. A batch larger
//! than `max_bytes` is aborted on the spot; the batcher then halves its count
//! limit and doubles its backoff until batches fit again. A single event
//! larger than `max_bytes` can never fit, so it is committed undelivered
//! and logged instead of blocking the events behind it.

use std::time::Duration;

use tracing::{error, warn};

use crate::args::{ArgDefault, ArgSpec, ArgType, PluginArgs};
use crate::error::StreamError;
use crate::event::Event;
use crate::metrics as m;
use crate::stream::{BatchLimits, EventStream};

/// Batching arguments shared by every output plugin.
pub const BATCH_ARGS: [ArgSpec; 4] = [
    ArgSpec::optional(
        "batch_size",
        ArgType::Int,
        "Maximum events per batch",
        ArgDefault::Int(1000),
    ),
    ArgSpec::optional(
        "timeout",
        ArgType::Float,
        "Seconds to wait for a batch to fill",
        ArgDefault::Float(10.0),
    ),
    ArgSpec::optional(
        "threshold_bytes",
        ArgType::Int,
        "Flush early once a batch reaches this size",
        ArgDefault::Int(4 * 1024 * 1024),
    ),
    ArgSpec::optional(
        "max_bytes",
        ArgType::Int,
        "Abort and retry smaller when a batch exceeds this size",
        ArgDefault::Int(64 * 1024 * 1024),
    ),
];

/// Batch limits and retry pacing.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchPolicy {
    pub max_count: usize,
    pub timeout: Duration,
    pub threshold_bytes: u64,
    pub max_bytes: u64,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            max_count: 1000,
            timeout: Duration::from_secs(10),
            threshold_bytes: 4 * 1024 * 1024,
            max_bytes: 64 * 1024 * 1024,
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl BatchPolicy {
    /// Reads [`BATCH_ARGS`] from validated plugin arguments.
    pub fn from_args(args: &PluginArgs) -> Self {
        let defaults = Self::default();
        Self {
            max_count: args.usize("batch_size").unwrap_or(defaults.max_count).max(1),
            timeout: args.secs("timeout").unwrap_or(defaults.timeout),
            threshold_bytes: args
                .int("threshold_bytes")
                .and_then(|v| u64::try_from(v).ok())
                .unwrap_or(defaults.threshold_bytes),
            max_bytes: args
                .int("max_bytes")
                .and_then(|v| u64::try_from(v).ok())
                .unwrap_or(defaults.max_bytes),
            ..defaults
        }
    }
}

/// Classified result of one pull.
#[derive(Debug)]
pub enum BatchOutcome {
    /// `max_count` events collected
    Full(Vec<Event>),
    /// `threshold_bytes` reached before the count or timeout
    EarlyFlush(Vec<Event>),
    /// Timeout elapsed with a partial batch
    TimedOut(Vec<Event>),
    /// Nothing arrived
    Empty,
    /// Batch exceeded `max_bytes` and was aborted; wait `backoff` first
    Oversize { bytes: u64, backoff: Duration },
    /// One event alone exceeded `max_bytes`; it was committed without delivery
    Dropped { bytes: u64 },
}

impl BatchOutcome {
    /// Events to transmit, if any. The checkout stays open.
    pub fn into_events(self) -> Option<Vec<Event>> {
        match self {
            Self::Full(events) | Self::EarlyFlush(events) | Self::TimedOut(events) => Some(events),
            Self::Empty | Self::Oversize { .. } | Self::Dropped { .. } => None,
        }
    }
}

/// Stateful batcher for one output.
#[derive(Debug)]
pub struct OutputBatcher {
    policy: BatchPolicy,
    count_limit: usize,
    backoff: Duration,
}

impl OutputBatcher {
    pub fn new(policy: BatchPolicy) -> Self {
        let count_limit = policy.max_count;
        let backoff = policy.min_backoff;
        Self {
            policy,
            count_limit,
            backoff,
        }
    }

    pub fn policy(&self) -> &BatchPolicy {
        &self.policy
    }

    /// Current count limit; shrinks after oversize batches.
    pub fn count_limit(&self) -> usize {
        self.count_limit
    }

    /// Pulls one batch. `flushing` skips the wait for a full batch.
    pub async fn collect(
        &mut self,
        stream: &mut EventStream,
        flushing: bool,
    ) -> Result<BatchOutcome, StreamError> {
        let timeout = if flushing {
            Duration::ZERO
        } else {
            self.policy.timeout
        };
        let batch = stream
            .next_batch(BatchLimits {
                max_count: self.count_limit,
                timeout,
                threshold_bytes: Some(self.policy.threshold_bytes),
            })
            .await?;

        if batch.events.is_empty() {
            return Ok(BatchOutcome::Empty);
        }

        if batch.bytes > self.policy.max_bytes && batch.events.len() == 1 {
            stream.commit()?;
            self.backoff = self.policy.min_backoff;
            metrics::counter!(m::EVENTS_DROPPED_OVERSIZE_TOTAL).increment(1);
            let event = &batch.events[0];
            error!(
                bytes = batch.bytes,
                max_bytes = self.policy.max_bytes,
                history = event.history().len(),
                attachments = event.attachments().len(),
                "event alone exceeds max_bytes, dropped"
            );
            return Ok(BatchOutcome::Dropped { bytes: batch.bytes });
        }

        if batch.bytes > self.policy.max_bytes {
            let count = stream.abort()?;
            let backoff = self.backoff;
            self.count_limit = (self.count_limit / 2).max(1);
            self.backoff = (self.backoff * 2).min(self.policy.max_backoff);
            metrics::counter!(m::BATCHES_OVERSIZE_TOTAL).increment(1);
            warn!(
                count,
                bytes = batch.bytes,
                max_bytes = self.policy.max_bytes,
                next_count_limit = self.count_limit,
                "batch exceeds max_bytes, aborted"
            );
            return Ok(BatchOutcome::Oversize {
                bytes: batch.bytes,
                backoff,
            });
        }

        self.backoff = self.policy.min_backoff;
        if batch.threshold_hit {
            // recover toward the configured size once batches fit again
            self.count_limit = (self.count_limit * 2).min(self.policy.max_count);
            return Ok(BatchOutcome::EarlyFlush(batch.events));
        }
        if batch.events.len() >= self.count_limit {
            self.count_limit = (self.count_limit * 2).min(self.policy.max_count);
            return Ok(BatchOutcome::Full(batch.events));
        }
        Ok(BatchOutcome::TimedOut(batch.events))
    }
}
