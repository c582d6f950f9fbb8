//! Single-file append-only buffer.
//!
//! # On-disk layout
//!
//! ```text
//! <dir>/data.log          records, see [`record`](crate::record)
//! <dir>/metadata.json     {first_seq, last_seq}
//! <dir>/consumers.json    consumer → committed seq
//! <dir>/attachments/      content-addressed attachment files
//! ```
//!
//! Sequence numbers start at 1 and never repeat, even across truncation.
//! A consumer has delivered everything up to its committed sequence; its
//! stream cursor runs ahead of that while a checkout is open.

use std::collections::{BTreeMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use instalog_core::buffer::{BufferEventStream, BufferPlugin, ConsumerProgress, TruncateReport};
use instalog_core::error::BufferError;
use instalog_core::event::Event;
use instalog_core::metrics as m;
use tempfile::NamedTempFile;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::BufferOptions;
use crate::attachment::{AttachmentStore, stored_file_name};
use crate::record;
use crate::state::{self, CONSUMERS_FILE, CommittedMap, DATA_FILE, METADATA_FILE, Metadata};

// ─── internal state ──────────────────────────────────────────────────

/// Location of one valid record in `data.log`.
#[derive(Debug, Clone)]
struct RecordRef {
    seq: u64,
    offset: u64,
    len: u64,
    /// Stored attachment file names, for garbage collection
    attachments: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
struct Consumer {
    committed: u64,
    cursor: u64,
    stream_open: bool,
}

struct State {
    file: File,
    index: Vec<RecordRef>,
    first_seq: u64,
    last_seq: u64,
    end_pos: u64,
    consumers: BTreeMap<String, Consumer>,
    attachments: AttachmentStore,
    closed: bool,
}

struct Shared {
    dir: PathBuf,
    options: BufferOptions,
    state: Mutex<State>,
    produced: watch::Sender<u64>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_open(&self) -> Result<MutexGuard<'_, State>, BufferError> {
        let state = self.lock();
        if state.closed {
            return Err(BufferError::Closed);
        }
        Ok(state)
    }

    fn save_consumers(&self, state: &State) -> Result<(), BufferError> {
        let map: CommittedMap = state
            .consumers
            .iter()
            .map(|(name, c)| (name.clone(), c.committed))
            .collect();
        state::save(&self.dir.join(CONSUMERS_FILE), &map)
    }

    fn save_metadata(&self, state: &State) -> Result<(), BufferError> {
        let meta = Metadata {
            first_seq: state.first_seq,
            last_seq: state.last_seq,
        };
        state::save(&self.dir.join(METADATA_FILE), &meta)
    }
}

// ─── SimpleFileBuffer ────────────────────────────────────────────────

/// Append-only event buffer in a single directory.
#[derive(Clone)]
pub struct SimpleFileBuffer {
    shared: Arc<Shared>,
}

impl SimpleFileBuffer {
    /// Opens or creates a buffer in `dir`, recovering from a previous crash.
    ///
    /// Records with a bad checksum or unparsable event are skipped. A
    /// trailing partial record is cut off.
    pub fn open(dir: impl Into<PathBuf>, options: BufferOptions) -> Result<Self, BufferError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let meta: Metadata = state::load(&dir.join(METADATA_FILE))?;
        let committed: CommittedMap = state::load(&dir.join(CONSUMERS_FILE))?;
        let attachments = AttachmentStore::open(&dir)?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(DATA_FILE))?;
        let scanned = scan(&mut file)?;
        if scanned.end_pos < file.metadata()?.len() {
            warn!(
                dir = %dir.display(),
                keep = scanned.end_pos,
                "cutting partial record off the end of data.log"
            );
            file.set_len(scanned.end_pos)?;
        }

        let last_seq = scanned.index.last().map_or(0, |r| r.seq).max(meta.last_seq);
        let consumers = committed
            .into_iter()
            .map(|(name, seq)| {
                let seq = seq.min(last_seq);
                (
                    name,
                    Consumer {
                        committed: seq,
                        cursor: seq,
                        stream_open: false,
                    },
                )
            })
            .collect();

        info!(
            dir = %dir.display(),
            records = scanned.index.len(),
            skipped = scanned.corrupt,
            last_seq,
            "buffer opened"
        );

        let state = State {
            file,
            first_seq: scanned.index.first().map_or(last_seq + 1, |r| r.seq),
            index: scanned.index,
            last_seq,
            end_pos: scanned.end_pos,
            consumers,
            attachments,
            closed: false,
        };
        let (produced, _) = watch::channel(last_seq);
        Ok(Self {
            shared: Arc::new(Shared {
                dir,
                options,
                state: Mutex::new(state),
                produced,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.shared.dir
    }

    pub fn options(&self) -> &BufferOptions {
        &self.shared.options
    }

    /// Highest sequence produced so far.
    pub fn last_seq(&self) -> u64 {
        self.shared.lock().last_seq
    }

    /// Number of records currently held in `data.log`.
    pub fn record_count(&self) -> usize {
        self.shared.lock().index.len()
    }

    /// Opens a concrete stream; [`BufferPlugin::consume`] boxes this.
    pub fn open_stream(&self, consumer: &str) -> Result<SimpleEventStream, BufferError> {
        let mut state = self.shared.lock_open()?;
        let entry = state
            .consumers
            .get_mut(consumer)
            .ok_or_else(|| BufferError::UnknownConsumer(consumer.to_owned()))?;
        if entry.stream_open {
            return Err(BufferError::StreamBusy(consumer.to_owned()));
        }
        entry.stream_open = true;
        entry.cursor = entry.committed;
        debug!(consumer, from_seq = entry.committed, "stream opened");
        Ok(SimpleEventStream {
            shared: Arc::clone(&self.shared),
            consumer: consumer.to_owned(),
            pending: 0,
        })
    }
}

/// Position of the log before an append, for [`SimpleFileBuffer::rollback`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct AppendMark {
    end_pos: u64,
    last_seq: u64,
    index_len: usize,
}

/// Records appended but not yet announced to readers.
#[derive(Debug)]
pub(crate) struct Appended {
    pub(crate) mark: AppendMark,
    pub(crate) last_seq: u64,
    count: u64,
    /// Moved attachment sources, removed once the whole produce succeeds
    sources: Vec<PathBuf>,
}

impl SimpleFileBuffer {
    /// Writes `events` to `data.log` without removing attachment sources or
    /// waking readers. A failed append leaves the log as it was.
    pub(crate) fn append(&self, events: Vec<Event>) -> Result<Appended, BufferError> {
        let mut guard = self.shared.lock_open()?;
        let state = &mut *guard;
        let mark = AppendMark {
            end_pos: state.end_pos,
            last_seq: state.last_seq,
            index_len: state.index.len(),
        };

        let mut chunk = String::new();
        let mut refs = Vec::with_capacity(events.len());
        let mut sources = Vec::new();
        let mut seq = state.last_seq;
        let mut offset = state.end_pos;

        for mut event in events {
            event.relocate_attachments(|id, path| {
                let already_stored = state.attachments.contains(path);
                let stored = state.attachments.import(id, path)?;
                if !already_stored {
                    sources.push(path.to_path_buf());
                }
                Ok::<_, BufferError>(stored)
            })?;
            seq += 1;
            let line = record::encode(seq, &event.serialize()?);
            refs.push(RecordRef {
                seq,
                offset,
                len: line.len() as u64,
                attachments: event
                    .attachments()
                    .values()
                    .filter_map(|p| stored_file_name(p))
                    .collect(),
            });
            offset += line.len() as u64;
            chunk.push_str(&line);
        }

        if let Err(e) = append(&mut state.file, state.end_pos, chunk.as_bytes(), self.shared.options.enable_fsync) {
            if let Err(rollback) = state.file.set_len(state.end_pos) {
                warn!(error = %rollback, "cannot roll back data.log after failed append");
            }
            return Err(BufferError::Io(e));
        }

        let count = refs.len() as u64;
        state.index.extend(refs);
        state.end_pos = offset;
        state.last_seq = seq;
        Ok(Appended {
            mark,
            last_seq: seq,
            count,
            sources,
        })
    }

    /// Undoes an [`append`](Self::append) whose batch failed elsewhere.
    ///
    /// Consumers that already read past the mark are pulled back to it; the
    /// retried batch reuses the same sequence numbers.
    pub(crate) fn rollback(&self, mark: AppendMark) -> Result<(), BufferError> {
        let mut guard = self.shared.lock();
        let state = &mut *guard;
        state.file.set_len(mark.end_pos)?;
        if self.shared.options.enable_fsync {
            state.file.sync_data()?;
        }
        state.index.truncate(mark.index_len);
        state.end_pos = mark.end_pos;
        state.last_seq = mark.last_seq;

        let mut committed_past = false;
        for c in state.consumers.values_mut() {
            c.cursor = c.cursor.min(mark.last_seq);
            if c.committed > mark.last_seq {
                c.committed = mark.last_seq;
                committed_past = true;
            }
        }
        if committed_past {
            self.shared.save_consumers(state)?;
        }
        warn!(dir = %self.shared.dir.display(), last_seq = mark.last_seq, "append rolled back");
        Ok(())
    }

    /// Completes an append: removes moved sources and wakes readers.
    pub(crate) fn finish(&self, appended: Appended) {
        let Appended {
            last_seq,
            count,
            mut sources,
            ..
        } = appended;
        if !self.shared.options.copy_attachments {
            sources.sort();
            sources.dedup();
            for source in sources {
                if let Err(e) = std::fs::remove_file(&source) {
                    warn!(path = %source.display(), error = %e, "cannot remove moved attachment source");
                }
            }
        }
        if count == 0 {
            return;
        }
        self.shared.produced.send_replace(last_seq);
        metrics::counter!(m::BUFFER_RECORDS_PRODUCED_TOTAL).increment(count);
        debug!(count, last_seq, "records produced");
    }
}

impl BufferPlugin for SimpleFileBuffer {
    fn produce(&self, events: Vec<Event>) -> Result<u64, BufferError> {
        if events.is_empty() {
            return Ok(self.shared.lock_open()?.last_seq);
        }
        let appended = self.append(events)?;
        let seq = appended.last_seq;
        self.finish(appended);
        Ok(seq)
    }

    fn consume(&self, consumer: &str) -> Result<Box<dyn BufferEventStream>, BufferError> {
        Ok(Box::new(self.open_stream(consumer)?))
    }

    fn add_consumer(&self, consumer: &str) -> Result<(), BufferError> {
        let mut state = self.shared.lock_open()?;
        if state.consumers.contains_key(consumer) {
            return Ok(());
        }
        let start = state.last_seq;
        state.consumers.insert(
            consumer.to_owned(),
            Consumer {
                committed: start,
                cursor: start,
                stream_open: false,
            },
        );
        if let Err(e) = self.shared.save_consumers(&state) {
            state.consumers.remove(consumer);
            return Err(e);
        }
        info!(consumer, start_seq = start, "consumer added");
        Ok(())
    }

    fn remove_consumer(&self, consumer: &str) -> Result<(), BufferError> {
        let mut state = self.shared.lock_open()?;
        let Some(removed) = state.consumers.remove(consumer) else {
            return Err(BufferError::UnknownConsumer(consumer.to_owned()));
        };
        if let Err(e) = self.shared.save_consumers(&state) {
            state.consumers.insert(consumer.to_owned(), removed);
            return Err(e);
        }
        info!(consumer, "consumer removed");
        Ok(())
    }

    fn list_consumers(&self) -> Result<BTreeMap<String, ConsumerProgress>, BufferError> {
        let state = self.shared.lock_open()?;
        Ok(state
            .consumers
            .iter()
            .map(|(name, c)| {
                (
                    name.clone(),
                    ConsumerProgress {
                        completed: c.committed,
                        total: state.last_seq,
                    },
                )
            })
            .collect())
    }

    fn progress(&self, consumer: &str) -> Result<ConsumerProgress, BufferError> {
        let state = self.shared.lock_open()?;
        let c = state
            .consumers
            .get(consumer)
            .ok_or_else(|| BufferError::UnknownConsumer(consumer.to_owned()))?;
        Ok(ConsumerProgress {
            completed: c.committed,
            total: state.last_seq,
        })
    }

    fn truncate(&self) -> Result<TruncateReport, BufferError> {
        let mut guard = self.shared.lock_open()?;
        let state = &mut *guard;

        // with no consumers every record counts as delivered
        let safe = state
            .consumers
            .values()
            .map(|c| c.committed)
            .min()
            .unwrap_or(state.last_seq);
        let keep_from = state.index.partition_point(|r| r.seq <= safe);
        if keep_from == 0 {
            return Ok(TruncateReport::default());
        }

        let kept = rewrite(&self.shared.dir, &mut state.file, &state.index[keep_from..])?;
        let removed_records = keep_from as u64;
        state.file = kept.file;
        state.end_pos = kept.end_pos;
        state.index = kept.index;
        state.first_seq = safe + 1;
        self.shared.save_metadata(state)?;

        let referenced: HashSet<String> = state
            .index
            .iter()
            .flat_map(|r| r.attachments.iter().cloned())
            .collect();
        let removed_attachments = state.attachments.collect_garbage(&referenced)?;

        metrics::counter!(m::BUFFER_TRUNCATED_RECORDS_TOTAL).increment(removed_records);
        info!(
            dir = %self.shared.dir.display(),
            removed_records,
            removed_attachments,
            first_seq = state.first_seq,
            "buffer truncated"
        );
        Ok(TruncateReport {
            removed_records,
            removed_attachments,
        })
    }

    fn truncate_interval(&self) -> Option<Duration> {
        self.shared.options.truncate_interval
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.shared.produced.subscribe()
    }

    fn close(&self) -> Result<(), BufferError> {
        let mut state = self.shared.lock();
        if state.closed {
            return Ok(());
        }
        state.file.sync_all()?;
        self.shared.save_metadata(&state)?;
        self.shared.save_consumers(&state)?;
        state.closed = true;
        info!(dir = %self.shared.dir.display(), last_seq = state.last_seq, "buffer closed");
        Ok(())
    }
}

// ─── SimpleEventStream ───────────────────────────────────────────────

/// Read cursor of one consumer over a [`SimpleFileBuffer`].
pub struct SimpleEventStream {
    shared: Arc<Shared>,
    consumer: String,
    pending: usize,
}

impl SimpleEventStream {
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Sequence this consumer has committed through.
    pub(crate) fn committed(&self) -> Result<u64, BufferError> {
        let state = self.shared.lock_open()?;
        state
            .consumers
            .get(&self.consumer)
            .map(|c| c.committed)
            .ok_or_else(|| BufferError::UnknownConsumer(self.consumer.clone()))
    }

    /// Undoes a commit that a sibling stream could not match. The checkout
    /// is open again afterwards, so it can be committed or aborted.
    pub(crate) fn revert_commit(&mut self, committed: u64, pending: usize) -> Result<(), BufferError> {
        let mut state = self.shared.lock_open()?;
        let c = state
            .consumers
            .get_mut(&self.consumer)
            .ok_or_else(|| BufferError::UnknownConsumer(self.consumer.clone()))?;
        c.committed = committed;
        self.shared.save_consumers(&state)?;
        self.pending = pending;
        Ok(())
    }
}

impl BufferEventStream for SimpleEventStream {
    fn next(&mut self) -> Result<Option<Event>, BufferError> {
        let mut guard = self.shared.lock_open()?;
        let state = &mut *guard;
        let mut cursor = state
            .consumers
            .get(&self.consumer)
            .ok_or_else(|| BufferError::UnknownConsumer(self.consumer.clone()))?
            .cursor;

        let mut found = None;
        let mut pos = state.index.partition_point(|r| r.seq <= cursor);
        while let Some(entry) = state.index.get(pos) {
            cursor = entry.seq;
            match read_record(&mut state.file, entry) {
                Ok(mut event) => {
                    let store = &state.attachments;
                    event.relocate_attachments(|_, path| Ok::<_, BufferError>(store.resolve(path)))?;
                    found = Some(event);
                    break;
                }
                Err(reason) => {
                    metrics::counter!(m::BUFFER_CORRUPT_RECORDS_TOTAL).increment(1);
                    warn!(seq = entry.seq, consumer = %self.consumer, %reason, "skipping corrupt record");
                    pos += 1;
                }
            }
        }

        if let Some(c) = state.consumers.get_mut(&self.consumer) {
            c.cursor = cursor;
        }
        if found.is_some() {
            self.pending += 1;
        }
        Ok(found)
    }

    fn pending(&self) -> usize {
        self.pending
    }

    fn commit(&mut self) -> Result<(), BufferError> {
        let mut state = self.shared.lock_open()?;
        let c = state
            .consumers
            .get_mut(&self.consumer)
            .ok_or_else(|| BufferError::UnknownConsumer(self.consumer.clone()))?;
        let previous = c.committed;
        c.committed = c.cursor;
        if let Err(e) = self.shared.save_consumers(&state) {
            if let Some(c) = state.consumers.get_mut(&self.consumer) {
                c.committed = previous;
            }
            return Err(e);
        }
        self.pending = 0;
        Ok(())
    }

    fn abort(&mut self) -> Result<(), BufferError> {
        let mut state = self.shared.lock_open()?;
        let c = state
            .consumers
            .get_mut(&self.consumer)
            .ok_or_else(|| BufferError::UnknownConsumer(self.consumer.clone()))?;
        c.cursor = c.committed;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for SimpleEventStream {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if let Some(c) = state.consumers.get_mut(&self.consumer) {
            c.cursor = c.committed;
            c.stream_open = false;
        }
        if self.pending > 0 {
            debug!(consumer = %self.consumer, pending = self.pending, "stream dropped, checkout aborted");
        }
    }
}

// ─── file helpers ────────────────────────────────────────────────────

struct Scan {
    index: Vec<RecordRef>,
    end_pos: u64,
    corrupt: u64,
}

/// Indexes every valid record. `end_pos` stops before a trailing partial line.
fn scan(file: &mut File) -> io::Result<Scan> {
    file.seek(SeekFrom::Start(0))?;
    let mut reader = BufReader::new(&*file);
    let mut index: Vec<RecordRef> = Vec::new();
    let mut offset = 0u64;
    let mut corrupt = 0u64;
    let mut line = Vec::new();

    loop {
        line.clear();
        let read = reader.read_until(b'\n', &mut line)?;
        if read == 0 || line.last() != Some(&b'\n') {
            break;
        }
        let len = read as u64;
        let parsed = std::str::from_utf8(&line)
            .map_err(|e| e.to_string())
            .and_then(|text| record::decode(text).map_err(|e| e.to_string()));
        match parsed {
            Ok((seq, event)) if index.last().is_none_or(|last| seq > last.seq) => {
                index.push(RecordRef {
                    seq,
                    offset,
                    len,
                    attachments: event
                        .attachments()
                        .values()
                        .filter_map(|p| stored_file_name(p))
                        .collect(),
                });
            }
            Ok((seq, _)) => {
                corrupt += 1;
                metrics::counter!(m::BUFFER_CORRUPT_RECORDS_TOTAL).increment(1);
                warn!(offset, seq, "skipping out-of-order record");
            }
            Err(reason) => {
                corrupt += 1;
                metrics::counter!(m::BUFFER_CORRUPT_RECORDS_TOTAL).increment(1);
                warn!(offset, %reason, "skipping corrupt record");
            }
        }
        offset += len;
    }

    Ok(Scan {
        index,
        end_pos: offset,
        corrupt,
    })
}

fn append(file: &mut File, at: u64, bytes: &[u8], fsync: bool) -> io::Result<()> {
    file.seek(SeekFrom::Start(at))?;
    file.write_all(bytes)?;
    if fsync {
        file.sync_data()?;
    }
    Ok(())
}

fn read_record(file: &mut File, entry: &RecordRef) -> Result<Event, String> {
    let mut bytes = vec![0u8; usize::try_from(entry.len).map_err(|e| e.to_string())?];
    file.seek(SeekFrom::Start(entry.offset))
        .and_then(|_| file.read_exact(&mut bytes))
        .map_err(|e| e.to_string())?;
    let text = String::from_utf8(bytes).map_err(|e| e.to_string())?;
    let (seq, event) = record::decode(&text).map_err(|e| e.to_string())?;
    if seq != entry.seq {
        return Err(format!("expected seq {}, found {seq}", entry.seq));
    }
    Ok(event)
}

struct Rewritten {
    file: File,
    index: Vec<RecordRef>,
    end_pos: u64,
}

/// Replaces `data.log` with only the `keep` records.
fn rewrite(dir: &Path, file: &mut File, keep: &[RecordRef]) -> Result<Rewritten, BufferError> {
    let mut staged = NamedTempFile::new_in(dir)?;
    let mut index = Vec::with_capacity(keep.len());
    let mut offset = 0u64;
    let mut bytes = Vec::new();
    for entry in keep {
        bytes.resize(entry.len as usize, 0);
        file.seek(SeekFrom::Start(entry.offset))?;
        file.read_exact(&mut bytes)?;
        staged.write_all(&bytes)?;
        index.push(RecordRef {
            offset,
            ..entry.clone()
        });
        offset += entry.len;
    }
    staged.as_file().sync_all()?;
    let file = staged
        .persist(dir.join(DATA_FILE))
        .map_err(|e| BufferError::Io(e.error))?;
    Ok(Rewritten {
        file,
        index,
        end_pos: offset,
    })
}
