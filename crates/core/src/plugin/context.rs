//! Per-plugin runtime context handed to every lifecycle hook.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::args::PluginArgs;
use crate::buffer::{BufferPlugin, ConsumerProgress};
use crate::error::PluginError;
use crate::event::{Event, ProcessStage, TARGET_BUFFER};
use crate::fsutil::atomic_write;
use crate::metrics as m;
use crate::plugin::PluginKind;
use crate::policy::FlowPolicy;
use crate::stream::{EventStream, StageTemplate};

/// Everything needed to build a [`PluginContext`].
pub struct ContextConfig {
    pub plugin_id: String,
    pub module: String,
    pub kind: PluginKind,
    pub node_id: String,
    pub data_dir: PathBuf,
    pub args: PluginArgs,
    pub store: PluginStore,
    /// Absent for the buffer itself
    pub buffer: Option<Arc<dyn BufferPlugin>>,
    /// Only meaningful for outputs
    pub policy: Arc<FlowPolicy>,
    pub stop: CancellationToken,
}

/// Runtime API of one plugin instance.
///
/// Cheap to clone; all clones share the stop token, the pause and flush
/// flags, and the store.
#[derive(Clone)]
pub struct PluginContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    plugin_id: String,
    module: String,
    kind: PluginKind,
    node_id: String,
    data_dir: PathBuf,
    args: PluginArgs,
    store: PluginStore,
    buffer: Option<Arc<dyn BufferPlugin>>,
    policy: Arc<FlowPolicy>,
    stop: CancellationToken,
    paused: watch::Sender<bool>,
    flushing: AtomicBool,
}

impl PluginContext {
    pub fn new(config: ContextConfig) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                plugin_id: config.plugin_id,
                module: config.module,
                kind: config.kind,
                node_id: config.node_id,
                data_dir: config.data_dir,
                args: config.args,
                store: config.store,
                buffer: config.buffer,
                policy: config.policy,
                stop: config.stop,
                paused: watch::Sender::new(false),
                flushing: AtomicBool::new(false),
            }),
        }
    }

    /// Context with no buffer and an in-memory store.
    #[doc(hidden)]
    pub fn for_test(plugin_id: &str, kind: PluginKind) -> Self {
        Self::new(ContextConfig {
            plugin_id: plugin_id.to_owned(),
            module: format!("test_{kind}"),
            kind,
            node_id: "test-node".to_owned(),
            data_dir: std::env::temp_dir().join(plugin_id),
            args: PluginArgs::default(),
            store: PluginStore::in_memory(),
            buffer: None,
            policy: Arc::new(FlowPolicy::allow_all()),
            stop: CancellationToken::new(),
        })
    }

    pub fn plugin_id(&self) -> &str {
        &self.inner.plugin_id
    }

    pub fn module(&self) -> &str {
        &self.inner.module
    }

    pub fn kind(&self) -> PluginKind {
        self.inner.kind
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    /// Private directory for plugin files. Created by the sandbox.
    pub fn data_dir(&self) -> &Path {
        &self.inner.data_dir
    }

    pub fn args(&self) -> &PluginArgs {
        &self.inner.args
    }

    pub fn store(&self) -> &PluginStore {
        &self.inner.store
    }

    // ─── stop / flush ────────────────────────────────────────────────

    pub fn is_stopping(&self) -> bool {
        self.inner.stop.is_cancelled()
    }

    pub fn stop_token(&self) -> &CancellationToken {
        &self.inner.stop
    }

    /// Sleeps for `duration` unless a stop is requested first.
    ///
    /// Returns `false` when woken by a stop.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.inner.stop.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.inner.paused.borrow()
    }

    /// Sets the pause flag. Returns `true` when the value changed.
    pub fn set_paused(&self, paused: bool) -> bool {
        self.inner.paused.send_if_modified(|current| {
            let changed = *current != paused;
            *current = paused;
            changed
        })
    }

    /// Waits until the pause flag is cleared or a stop is requested.
    ///
    /// Returns `false` when woken by a stop.
    pub async fn wait_unpaused(&self) -> bool {
        let mut paused = self.inner.paused.subscribe();
        tokio::select! {
            _ = self.inner.stop.cancelled() => false,
            result = paused.wait_for(|p| !*p) => result.is_ok(),
        }
    }

    /// True while a flush is in progress; outputs should skip batch waits.
    pub fn is_flushing(&self) -> bool {
        self.inner.flushing.load(Ordering::Acquire)
    }

    pub fn set_flushing(&self, flushing: bool) {
        self.inner.flushing.store(flushing, Ordering::Release);
    }

    // ─── data plane ──────────────────────────────────────────────────

    fn buffer_for(
        &self,
        expected: PluginKind,
        api: &'static str,
    ) -> Result<&Arc<dyn BufferPlugin>, PluginError> {
        match &self.inner.buffer {
            Some(buffer) if self.inner.kind == expected => Ok(buffer),
            _ => Err(PluginError::UnexpectedAccess {
                kind: self.inner.kind.to_string(),
                api,
            }),
        }
    }

    /// Stamps events with an input stage and produces them into the buffer.
    ///
    /// Returns the last sequence number assigned. Only inputs may emit.
    pub async fn emit(&self, mut events: Vec<Event>) -> Result<u64, PluginError> {
        let buffer = Arc::clone(self.buffer_for(PluginKind::Input, "emit")?);
        if events.is_empty() {
            let last_seq = *buffer.subscribe().borrow();
            return Ok(last_seq);
        }

        for event in &mut events {
            event.append_stage(ProcessStage::now(
                self.node_id(),
                self.plugin_id(),
                PluginKind::Input,
                TARGET_BUFFER,
            ));
        }

        let count = events.len() as u64;
        let seq = tokio::task::spawn_blocking(move || buffer.produce(events))
            .await
            .map_err(|e| PluginError::Other(format!("produce task failed: {e}")))??;

        metrics::counter!(m::EVENTS_EMITTED_TOTAL, "plugin" => self.plugin_id().to_owned())
            .increment(count);
        debug!(plugin_id = %self.plugin_id(), count, seq, "emitted events");
        Ok(seq)
    }

    /// Opens this output's stream over the buffer.
    pub fn new_stream(&self) -> Result<EventStream, PluginError> {
        let buffer = self.buffer_for(PluginKind::Output, "new_stream")?;
        let inner = buffer.consume(self.plugin_id())?;
        Ok(EventStream::new(
            inner,
            Arc::clone(&self.inner.policy),
            StageTemplate {
                node_id: self.node_id().to_owned(),
                plugin_id: self.plugin_id().to_owned(),
            },
            buffer.subscribe(),
            self.inner.stop.clone(),
        ))
    }

    /// Delivery progress of this output.
    pub fn progress(&self) -> Result<ConsumerProgress, PluginError> {
        let buffer = self.buffer_for(PluginKind::Output, "progress")?;
        Ok(buffer.progress(self.plugin_id())?)
    }
}

// ─── PluginStore ─────────────────────────────────────────────────────

/// Small persistent JSON map owned by one plugin.
///
/// Plugins keep offsets and counters here; `inspect` reads it.
pub struct PluginStore {
    path: Option<PathBuf>,
    data: Mutex<Map<String, Value>>,
}

impl PluginStore {
    /// Loads the store from `path`, starting empty if it is missing.
    ///
    /// An unreadable file is logged and replaced on the next save.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Map<String, Value>>(&bytes) {
                Ok(map) => map,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "plugin store is corrupt, starting empty");
                    Map::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read plugin store, starting empty");
                Map::new()
            }
        };
        Self {
            path: Some(path),
            data: Mutex::new(data),
        }
    }

    /// Store that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: Mutex::new(Map::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Map<String, Value>> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.lock().insert(key.into(), value.into());
    }

    /// Adds `delta` to an integer counter, creating it at zero.
    pub fn incr(&self, key: &str, delta: u64) -> u64 {
        let mut data = self.lock();
        let next = data.get(key).and_then(Value::as_u64).unwrap_or(0) + delta;
        data.insert(key.to_owned(), Value::from(next));
        next
    }

    /// Copy of the whole map as a JSON object.
    pub fn snapshot(&self) -> Value {
        Value::Object(self.lock().clone())
    }

    /// Atomically writes the store to disk. No-op for in-memory stores.
    pub fn save(&self) -> std::io::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(&*self.lock())?;
        atomic_write(path, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn sleep_returns_early_on_stop() {
        let ctx = PluginContext::for_test("p", PluginKind::Input);
        let token = ctx.stop_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let started = std::time::Instant::now();
        let completed = ctx.sleep(Duration::from_secs(30)).await;

        assert!(!completed, "sleep should report the stop");
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(ctx.is_stopping());
    }

    #[tokio::test]
    async fn emit_without_buffer_is_unexpected_access() {
        let ctx = PluginContext::for_test("p", PluginKind::Input);
        let err = ctx.emit(vec![Event::new(Map::new())]).await.unwrap_err();
        assert!(matches!(err, PluginError::UnexpectedAccess { api: "emit", .. }));
    }

    #[test]
    fn input_cannot_open_stream() {
        let ctx = PluginContext::for_test("p", PluginKind::Input);
        let err = ctx.new_stream().err().unwrap();
        assert!(err.to_string().contains("input plugins cannot call new_stream"));
    }

    #[tokio::test]
    async fn wait_unpaused_wakes_on_unpause() {
        // Given: a paused context
        let ctx = PluginContext::for_test("p", PluginKind::Input);
        assert!(ctx.set_paused(true), "first pause changes the flag");
        assert!(!ctx.set_paused(true), "second pause is a no-op");
        let clone = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            clone.set_paused(false);
        });

        // When
        let resumed = tokio::time::timeout(Duration::from_secs(5), ctx.wait_unpaused())
            .await
            .expect("unpause should wake the waiter");

        // Then
        assert!(resumed, "woken by unpause, not by stop");
        assert!(!ctx.is_paused());
    }

    #[tokio::test]
    async fn wait_unpaused_returns_false_on_stop() {
        let ctx = PluginContext::for_test("p", PluginKind::Input);
        ctx.set_paused(true);
        ctx.stop_token().cancel();

        assert!(!ctx.wait_unpaused().await, "a stop ends the pause wait");
        assert!(ctx.is_paused(), "stopping leaves the flag alone");
    }

    #[test]
    fn flushing_flag_is_shared_between_clones() {
        let ctx = PluginContext::for_test("p", PluginKind::Output);
        let clone = ctx.clone();
        ctx.set_flushing(true);
        assert!(clone.is_flushing());
    }

    #[test]
    fn store_persists_across_reopen() {
        // Given: a store with an offset and a counter
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in1.json");
        let store = PluginStore::open(&path);
        store.set("offset", 42);
        store.incr("lines", 3);
        store.incr("lines", 2);

        // When: saved and reopened
        store.save().unwrap();
        let reopened = PluginStore::open(&path);

        // Then
        assert_eq!(reopened.get("offset"), Some(json!(42)));
        assert_eq!(reopened.snapshot(), json!({"offset": 42, "lines": 5}));
    }

    #[test]
    fn corrupt_store_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert_eq!(PluginStore::open(&path).snapshot(), json!({}));
    }
}
