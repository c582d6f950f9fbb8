//! Output-side event stream: checkout protocol plus flow-policy filtering.
//!
//! [`EventStream`] wraps a buffer's [`BufferEventStream`]. Each `next` opens a
//! checkout that must be committed or aborted before the next call. Events
//! the output's policy rejects are skipped and ride along with the checkout,
//! so committing moves the consumer past them too.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::buffer::BufferEventStream;
use crate::error::{BufferError, StreamError};
use crate::event::{Event, ProcessStage, TARGET_EXTERNAL};
use crate::metrics as m;
use crate::plugin::PluginKind;
use crate::policy::FlowPolicy;

/// Identity stamped onto delivered events.
#[derive(Debug, Clone)]
pub struct StageTemplate {
    pub node_id: String,
    pub plugin_id: String,
}

/// Limits for one pull.
#[derive(Debug, Clone, Copy)]
pub struct BatchLimits {
    pub max_count: usize,
    pub timeout: Duration,
    /// Stop pulling once the batch reaches this many bytes
    pub threshold_bytes: Option<u64>,
}

/// Events returned by [`EventStream::next_batch`].
#[derive(Debug, Default)]
pub struct Batch {
    pub events: Vec<Event>,
    /// Sum of [`Event::approx_size`]
    pub bytes: u64,
    /// Pull stopped because `threshold_bytes` was reached
    pub threshold_hit: bool,
}

/// Transactional, policy-filtered view of one output's buffer stream.
pub struct EventStream {
    inner: Box<dyn BufferEventStream>,
    policy: Arc<FlowPolicy>,
    stage: StageTemplate,
    produced: watch::Receiver<u64>,
    stop: CancellationToken,
    delivered: usize,
}

impl EventStream {
    pub fn new(
        inner: Box<dyn BufferEventStream>,
        policy: Arc<FlowPolicy>,
        stage: StageTemplate,
        produced: watch::Receiver<u64>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            inner,
            policy,
            stage,
            produced,
            stop,
            delivered: 0,
        }
    }

    /// Events delivered in the open checkout.
    pub fn pending(&self) -> usize {
        self.delivered
    }

    /// Pulls up to `max_count` events, waiting at most `timeout`.
    ///
    /// Returns early when `max_count` is reached or a stop is requested.
    /// An empty result leaves no checkout open.
    pub async fn next(
        &mut self,
        timeout: Duration,
        max_count: usize,
    ) -> Result<Vec<Event>, StreamError> {
        let batch = self
            .next_batch(BatchLimits {
                max_count,
                timeout,
                threshold_bytes: None,
            })
            .await?;
        Ok(batch.events)
    }

    /// Like [`next`](Self::next) but also tracks bytes and stops at the threshold.
    pub async fn next_batch(&mut self, limits: BatchLimits) -> Result<Batch, StreamError> {
        if self.delivered > 0 {
            return Err(StreamError::CheckoutPending {
                pending: self.delivered,
            });
        }

        let deadline = Instant::now() + limits.timeout;
        let mut batch = Batch::default();

        while batch.events.len() < limits.max_count {
            self.produced.borrow_and_update();
            if let Some(mut event) = self.inner.next().map_err(closed_or)? {
                if !self.policy.match_event(&event) {
                    trace!(plugin_id = %self.stage.plugin_id, "event filtered by flow policy");
                    metrics::counter!(m::EVENTS_FILTERED_TOTAL, "plugin" => self.stage.plugin_id.clone())
                        .increment(1);
                    continue;
                }
                event.append_stage(ProcessStage::now(
                    &self.stage.node_id,
                    &self.stage.plugin_id,
                    PluginKind::Output,
                    TARGET_EXTERNAL,
                ));
                batch.bytes += event.approx_size();
                batch.events.push(event);
                if limits.threshold_bytes.is_some_and(|t| batch.bytes >= t) {
                    batch.threshold_hit = true;
                    break;
                }
                continue;
            }

            if Instant::now() >= deadline || self.stop.is_cancelled() {
                break;
            }
            tokio::select! {
                changed = self.produced.changed() => {
                    if changed.is_err() {
                        // sender dropped: buffer is gone
                        break;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => break,
                _ = self.stop.cancelled() => break,
            }
        }

        self.delivered = batch.events.len();
        if self.delivered == 0 && self.inner.pending() > 0 {
            // only filtered events were read; move past them now
            self.inner.commit().map_err(closed_or)?;
        }
        Ok(batch)
    }

    /// Marks the checkout delivered. Returns the number of delivered events.
    pub fn commit(&mut self) -> Result<usize, StreamError> {
        if self.delivered == 0 && self.inner.pending() == 0 {
            return Ok(0);
        }
        self.inner.commit().map_err(closed_or)?;
        let count = std::mem::take(&mut self.delivered);
        metrics::counter!(m::EVENTS_COMMITTED_TOTAL, "plugin" => self.stage.plugin_id.clone())
            .increment(count as u64);
        debug!(plugin_id = %self.stage.plugin_id, count, "checkout committed");
        Ok(count)
    }

    /// Returns the checkout for redelivery. Returns the number of events.
    ///
    /// A checkout that delivered nothing is committed instead, so filtered
    /// events are not read again.
    pub fn abort(&mut self) -> Result<usize, StreamError> {
        if self.delivered == 0 {
            return self.commit();
        }
        self.inner.abort().map_err(closed_or)?;
        let count = std::mem::take(&mut self.delivered);
        metrics::counter!(m::EVENTS_ABORTED_TOTAL, "plugin" => self.stage.plugin_id.clone())
            .increment(count as u64);
        debug!(plugin_id = %self.stage.plugin_id, count, "checkout aborted");
        Ok(count)
    }
}

fn closed_or(err: BufferError) -> StreamError {
    match err {
        BufferError::Closed | BufferError::UnknownConsumer(_) => StreamError::Closed,
        other => StreamError::Buffer(other),
    }
}
