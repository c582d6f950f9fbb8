//! Four-level priority buffer.
//!
//! Each level is a [`SimpleFileBuffer`] under `level_<n>/`; events go to the
//! level named by [`Event::priority`]. A stream serves the levels in rounds
//! with per-level quotas, so level 0 dominates while level 3 is still served
//! every round. Order within a level is FIFO.
//!
//! Progress is reported as sums over the levels: `total` counts every record
//! ever produced and `completed` every record the consumer committed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use instalog_core::buffer::{BufferEventStream, BufferPlugin, ConsumerProgress, TruncateReport};
use instalog_core::error::BufferError;
use instalog_core::event::{Event, PRIORITY_LEVELS};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::BufferOptions;
use crate::simple::{SimpleEventStream, SimpleFileBuffer};

/// Events served from each level per round, highest priority first.
pub const LEVEL_QUOTAS: [usize; PRIORITY_LEVELS] = [8, 4, 2, 1];

/// Buffer with one [`SimpleFileBuffer`] per priority level.
pub struct PriorityFileBuffer {
    dir: PathBuf,
    levels: Vec<SimpleFileBuffer>,
    truncate_interval: Option<Duration>,
    produced: watch::Sender<u64>,
}

impl PriorityFileBuffer {
    pub fn open(dir: impl Into<PathBuf>, options: BufferOptions) -> Result<Self, BufferError> {
        let dir = dir.into();
        let level_options = BufferOptions {
            truncate_interval: None,
            ..options.clone()
        };
        let levels = (0..PRIORITY_LEVELS)
            .map(|level| SimpleFileBuffer::open(level_dir(&dir, level), level_options.clone()))
            .collect::<Result<Vec<_>, _>>()?;

        let total = levels.iter().map(SimpleFileBuffer::last_seq).sum();
        let (produced, _) = watch::channel(total);
        info!(dir = %dir.display(), total, "priority buffer opened");
        Ok(Self {
            dir,
            levels,
            truncate_interval: options.truncate_interval,
            produced,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The buffer backing one level.
    pub fn level(&self, level: usize) -> Option<&SimpleFileBuffer> {
        self.levels.get(level)
    }

    fn total(&self) -> u64 {
        self.levels.iter().map(SimpleFileBuffer::last_seq).sum()
    }
}

fn level_dir(dir: &Path, level: usize) -> PathBuf {
    dir.join(format!("level_{level}"))
}

impl BufferPlugin for PriorityFileBuffer {
    /// Appends to every level first, then finishes them together. A failure
    /// on any level rolls back the levels already written and keeps every
    /// moved attachment source, so the same batch can be retried.
    fn produce(&self, events: Vec<Event>) -> Result<u64, BufferError> {
        let mut grouped: Vec<Vec<Event>> = (0..PRIORITY_LEVELS).map(|_| Vec::new()).collect();
        for event in events {
            grouped[event.priority()].push(event);
        }

        let mut appended = Vec::with_capacity(PRIORITY_LEVELS);
        for (level, batch) in grouped.into_iter().enumerate() {
            if batch.is_empty() {
                continue;
            }
            match self.levels[level].append(batch) {
                Ok(done) => appended.push((level, done)),
                Err(e) => {
                    for (written, done) in appended.into_iter().rev() {
                        if let Err(rollback) = self.levels[written].rollback(done.mark) {
                            warn!(level = written, error = %rollback, "cannot roll back priority level");
                        }
                    }
                    return Err(e);
                }
            }
        }
        for (level, done) in appended {
            self.levels[level].finish(done);
        }

        let total = self.total();
        self.produced.send_replace(total);
        Ok(total)
    }

    fn consume(&self, consumer: &str) -> Result<Box<dyn BufferEventStream>, BufferError> {
        let mut streams = Vec::with_capacity(PRIORITY_LEVELS);
        for level in &self.levels {
            // earlier streams are released on drop if a later level fails
            streams.push(level.open_stream(consumer)?);
        }
        Ok(Box::new(PriorityEventStream::new(streams)))
    }

    fn add_consumer(&self, consumer: &str) -> Result<(), BufferError> {
        self.levels.iter().try_for_each(|l| l.add_consumer(consumer))
    }

    fn remove_consumer(&self, consumer: &str) -> Result<(), BufferError> {
        self.levels.iter().try_for_each(|l| l.remove_consumer(consumer))
    }

    fn list_consumers(&self) -> Result<BTreeMap<String, ConsumerProgress>, BufferError> {
        let mut merged: BTreeMap<String, ConsumerProgress> = BTreeMap::new();
        for level in &self.levels {
            for (name, progress) in level.list_consumers()? {
                let entry = merged.entry(name).or_default();
                entry.completed += progress.completed;
                entry.total += progress.total;
            }
        }
        Ok(merged)
    }

    fn progress(&self, consumer: &str) -> Result<ConsumerProgress, BufferError> {
        let mut sum = ConsumerProgress::default();
        for level in &self.levels {
            let p = level.progress(consumer)?;
            sum.completed += p.completed;
            sum.total += p.total;
        }
        Ok(sum)
    }

    fn truncate(&self) -> Result<TruncateReport, BufferError> {
        let mut report = TruncateReport::default();
        for level in &self.levels {
            report += level.truncate()?;
        }
        Ok(report)
    }

    fn truncate_interval(&self) -> Option<Duration> {
        self.truncate_interval
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.produced.subscribe()
    }

    fn close(&self) -> Result<(), BufferError> {
        self.levels.iter().try_for_each(SimpleFileBuffer::close)
    }
}

// ─── PriorityEventStream ─────────────────────────────────────────────

/// Weighted round-robin stream over the level streams.
pub struct PriorityEventStream {
    levels: Vec<SimpleEventStream>,
    current: usize,
    served: usize,
}

impl PriorityEventStream {
    fn new(levels: Vec<SimpleEventStream>) -> Self {
        Self {
            levels,
            current: 0,
            served: 0,
        }
    }

    fn advance(&mut self) {
        self.current = (self.current + 1) % self.levels.len();
        self.served = 0;
    }
}

impl BufferEventStream for PriorityEventStream {
    fn next(&mut self) -> Result<Option<Event>, BufferError> {
        // one extra step so the starting level is retried with a fresh quota
        for _ in 0..=self.levels.len() {
            if self.served < LEVEL_QUOTAS[self.current] {
                if let Some(event) = self.levels[self.current].next()? {
                    self.served += 1;
                    return Ok(Some(event));
                }
            }
            self.advance();
        }
        Ok(None)
    }

    fn pending(&self) -> usize {
        self.levels.iter().map(BufferEventStream::pending).sum()
    }

    /// Commits every level with a checkout. If a level fails, the levels
    /// committed before it are reverted and the checkout stays open.
    fn commit(&mut self) -> Result<(), BufferError> {
        let mut committed: Vec<(usize, (u64, usize))> = Vec::with_capacity(self.levels.len());
        for level in 0..self.levels.len() {
            let stream = &mut self.levels[level];
            if stream.pending() == 0 {
                continue;
            }
            let before = (stream.committed()?, stream.pending());
            if let Err(e) = stream.commit() {
                for (done, (seq, pending)) in committed.into_iter().rev() {
                    if let Err(revert) = self.levels[done].revert_commit(seq, pending) {
                        warn!(level = done, error = %revert, "cannot revert priority level commit");
                    }
                }
                return Err(e);
            }
            committed.push((level, before));
        }
        Ok(())
    }

    fn abort(&mut self) -> Result<(), BufferError> {
        for level in &mut self.levels {
            level.abort()?;
        }
        debug!("priority checkout aborted");
        Ok(())
    }
}
