//! Plugin supervision.
//!
//! Every input and output runs inside a [`PluginSandbox`]: a supervisor task
//! that owns a worker task driving `set_up → main… → tear_down`.
//!
//! - errors returned from `main` are logged and retried after a backoff
//! - a panic ends the worker; the supervisor rebuilds the plugin from its
//!   factory, up to `restart_limit` times, then marks it `Failed`
//! - `stop` cancels the plugin's token, waits the grace period, then aborts
//! - [`stop_all`] signals many plugins first and waits on one deadline
//! - `pause` lets the running `main` finish, then parks the worker until
//!   `unpause`; the plugin stays set up the whole time
//!
//! The buffer gets a [`BufferSandbox`] that runs its periodic truncation
//! under the same rules.

use std::any::Any;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use instalog_core::args::PluginArgs;
use instalog_core::buffer::{BufferPlugin, TruncateReport};
use instalog_core::config::NodeConfig;
use instalog_core::error::PluginError;
use instalog_core::metrics as m;
use instalog_core::plugin::{DynPlugin, PluginContext, PluginFactory, PluginInstance, PluginState};
use instalog_core::rpc::FlushResult;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Interval between progress checks while flushing.
const FLUSH_POLL_INTERVAL: Duration = Duration::from_millis(100);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ─── Settings ────────────────────────────────────────────────────────

/// Supervision limits shared by every sandbox.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorSettings {
    /// How long a stop may take before tasks are aborted
    pub grace: Duration,
    /// Crashes tolerated before the plugin is marked failed
    pub restart_limit: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(10),
            restart_limit: 5,
            min_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl SupervisorSettings {
    pub fn from_node(node: &NodeConfig) -> Self {
        Self {
            grace: Duration::from_secs(node.stop_grace_secs),
            restart_limit: node.restart_limit,
            ..Self::default()
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.min_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

// ─── RuntimeStatus ───────────────────────────────────────────────────

/// Runtime counters exposed under `runtime` by `inspect`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeSnapshot {
    pub state: PluginState,
    pub restarts: u32,
    pub main_errors: u64,
    pub last_error: Option<String>,
}

/// Shared, lock-protected [`RuntimeSnapshot`].
#[derive(Debug, Clone)]
struct RuntimeStatus {
    plugin_id: Arc<str>,
    inner: Arc<Mutex<RuntimeSnapshot>>,
}

impl RuntimeStatus {
    fn new(plugin_id: &str) -> Self {
        Self {
            plugin_id: Arc::from(plugin_id),
            inner: Arc::new(Mutex::new(RuntimeSnapshot {
                state: PluginState::Down,
                restarts: 0,
                main_errors: 0,
                last_error: None,
            })),
        }
    }

    fn snapshot(&self) -> RuntimeSnapshot {
        lock(&self.inner).clone()
    }

    fn state(&self) -> PluginState {
        lock(&self.inner).state
    }

    fn set_state(&self, state: PluginState) {
        let previous = std::mem::replace(&mut lock(&self.inner).state, state);
        if previous == state {
            return;
        }
        if state == PluginState::Up {
            metrics::gauge!(m::CORE_PLUGINS_UP).increment(1.0);
        } else if previous == PluginState::Up {
            metrics::gauge!(m::CORE_PLUGINS_UP).decrement(1.0);
        }
        debug!(plugin_id = %self.plugin_id, %previous, %state, "plugin state changed");
    }

    /// Moves to `to` only when the current state is `from`.
    fn transition(&self, from: PluginState, to: PluginState) -> bool {
        if lock(&self.inner).state != from {
            return false;
        }
        self.set_state(to);
        true
    }

    fn record_error(&self, message: String) -> u64 {
        let mut inner = lock(&self.inner);
        inner.main_errors += 1;
        inner.last_error = Some(message);
        inner.main_errors
    }

    fn record_restart(&self, reason: String) -> u32 {
        let mut inner = lock(&self.inner);
        inner.restarts += 1;
        inner.last_error = Some(reason);
        inner.restarts
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_owned()
    }
}

// ─── PluginSandbox ───────────────────────────────────────────────────

/// What the supervisor needs to rebuild a crashed plugin.
#[derive(Clone)]
pub struct PluginRecipe {
    pub module: String,
    pub factory: PluginFactory,
    pub args: PluginArgs,
    pub data_dir: PathBuf,
}

impl PluginRecipe {
    fn build(&self) -> Result<Box<dyn DynPlugin>, String> {
        match self.factory.construct(&self.module, &self.args, &self.data_dir) {
            Ok(PluginInstance::Runnable(plugin)) => Ok(plugin),
            Ok(PluginInstance::Buffer(_)) => Err(format!("module '{}' built a buffer", self.module)),
            Err(e) => Err(e.to_string()),
        }
    }
}

/// Supervised input or output plugin.
pub struct PluginSandbox {
    ctx: PluginContext,
    recipe: PluginRecipe,
    settings: SupervisorSettings,
    status: RuntimeStatus,
    instance: Mutex<Option<Box<dyn DynPlugin>>>,
    worker: Arc<Mutex<Option<AbortHandle>>>,
    supervisor: Option<JoinHandle<()>>,
}

enum WorkerExit {
    Stopped,
    SetUpFailed(String),
}

impl PluginSandbox {
    /// Wraps a freshly loaded plugin. Nothing runs until [`start`](Self::start).
    pub fn new(
        ctx: PluginContext,
        recipe: PluginRecipe,
        instance: Box<dyn DynPlugin>,
        settings: SupervisorSettings,
    ) -> Self {
        let status = RuntimeStatus::new(ctx.plugin_id());
        Self {
            ctx,
            recipe,
            settings,
            status,
            instance: Mutex::new(Some(instance)),
            worker: Arc::new(Mutex::new(None)),
            supervisor: None,
        }
    }

    pub fn plugin_id(&self) -> &str {
        self.ctx.plugin_id()
    }

    pub fn context(&self) -> &PluginContext {
        &self.ctx
    }

    pub fn state(&self) -> PluginState {
        self.status.state()
    }

    pub fn snapshot(&self) -> RuntimeSnapshot {
        self.status.snapshot()
    }

    /// Spawns the supervisor. Calling it twice is a no-op.
    pub fn start(&mut self) {
        let Some(instance) = lock(&self.instance).take() else {
            return;
        };
        info!(plugin_id = %self.plugin_id(), kind = %self.ctx.kind(), module = %self.recipe.module, "starting plugin");
        self.status.set_state(PluginState::Starting);
        self.supervisor = Some(tokio::spawn(supervise(
            instance,
            self.recipe.clone(),
            self.ctx.clone(),
            self.status.clone(),
            self.settings.clone(),
            Arc::clone(&self.worker),
        )));
    }

    /// Cancels the plugin's stop token without waiting.
    pub fn request_stop(&self) {
        self.ctx.stop_token().cancel();
    }

    /// Requests a stop and waits up to the grace period.
    ///
    /// Returns `false` when the plugin had to be aborted.
    pub async fn stop(&mut self) -> bool {
        let deadline = Instant::now() + self.settings.grace;
        self.stop_by(deadline).await
    }

    /// Requests a stop and waits until `deadline`, then aborts.
    async fn stop_by(&mut self, deadline: Instant) -> bool {
        self.request_stop();
        let clean = match self.supervisor.take() {
            None => true,
            Some(mut supervisor) => {
                match tokio::time::timeout_at(deadline, &mut supervisor).await {
                    Ok(_) => true,
                    Err(_) => {
                        warn!(
                            plugin_id = %self.plugin_id(),
                            grace = ?self.settings.grace,
                            "plugin ignored stop request, aborting"
                        );
                        if let Some(worker) = lock(&self.worker).take() {
                            worker.abort();
                        }
                        supervisor.abort();
                        self.status.set_state(PluginState::Down);
                        false
                    }
                }
            }
        };
        if let Err(e) = self.ctx.store().save() {
            warn!(plugin_id = %self.plugin_id(), error = %e, "cannot save plugin store");
        }
        info!(plugin_id = %self.plugin_id(), clean, "plugin stopped");
        clean
    }

    /// Parks the worker after the running `main` call returns.
    ///
    /// Only a running plugin can be paused; pausing a paused one is a no-op.
    pub fn pause(&self) -> Result<PluginState, String> {
        match self.state() {
            PluginState::Pausing | PluginState::Paused => {}
            PluginState::Up => {
                self.status.transition(PluginState::Up, PluginState::Pausing);
                self.ctx.set_paused(true);
                info!(plugin_id = %self.plugin_id(), "pausing plugin");
            }
            state => return Err(format!("cannot pause {} while {state}", self.plugin_id())),
        }
        Ok(self.state())
    }

    /// Lets a paused worker call `main` again.
    ///
    /// Unpausing a running plugin is a no-op.
    pub fn unpause(&self) -> Result<PluginState, String> {
        match self.state() {
            PluginState::Up => {}
            PluginState::Pausing | PluginState::Paused => {
                self.ctx.set_paused(false);
                self.status.transition(PluginState::Pausing, PluginState::Up);
                info!(plugin_id = %self.plugin_id(), "unpausing plugin");
            }
            state => return Err(format!("cannot unpause {} while {state}", self.plugin_id())),
        }
        Ok(self.state())
    }

    /// Pauses a running plugin or unpauses a paused one.
    pub fn toggle_pause(&self) -> Result<PluginState, String> {
        if self.ctx.is_paused() {
            self.unpause()
        } else {
            self.pause()
        }
    }

    /// Waits until this output has committed everything produced so far.
    pub async fn flush(&self, timeout: Duration) -> FlushResult {
        let failed = |message: String, completed: u64, watermark: u64| FlushResult {
            success: false,
            message,
            completed,
            watermark,
        };
        let watermark = match self.ctx.progress() {
            Ok(progress) => progress.total,
            Err(e) => return failed(e.to_string(), 0, 0),
        };

        self.ctx.set_flushing(true);
        let deadline = Instant::now() + timeout;
        let result = loop {
            let completed = match self.ctx.progress() {
                Ok(progress) => progress.completed,
                Err(e) => break failed(e.to_string(), 0, watermark),
            };
            if completed >= watermark {
                break FlushResult {
                    success: true,
                    message: format!("{} flushed through {watermark}", self.plugin_id()),
                    completed,
                    watermark,
                };
            }
            if self.state() == PluginState::Failed {
                break failed(format!("{} has failed", self.plugin_id()), completed, watermark);
            }
            if Instant::now() >= deadline {
                break failed(
                    format!("{} timed out at {completed}/{watermark}", self.plugin_id()),
                    completed,
                    watermark,
                );
            }
            tokio::time::sleep(FLUSH_POLL_INTERVAL).await;
        };
        self.ctx.set_flushing(false);
        result
    }

    /// Document queried by `inspect`.
    pub fn inspect_root(&self) -> Value {
        json!({
            "store": self.ctx.store().snapshot(),
            "runtime": self.status.snapshot(),
        })
    }
}

/// Stops several sandboxes against one shared deadline.
///
/// Every stop token is cancelled before the first wait, so the whole call
/// is bounded by the longest grace period rather than their sum. Returns
/// the ids of plugins that had to be aborted.
pub async fn stop_all<'a>(sandboxes: impl IntoIterator<Item = &'a mut PluginSandbox>) -> Vec<String> {
    let mut sandboxes: Vec<&'a mut PluginSandbox> = sandboxes.into_iter().collect();
    for sandbox in &sandboxes {
        sandbox.request_stop();
    }
    let grace = sandboxes
        .iter()
        .map(|s| s.settings.grace)
        .max()
        .unwrap_or_default();
    let deadline = Instant::now() + grace;

    let mut unclean = Vec::new();
    for sandbox in &mut sandboxes {
        if !sandbox.stop_by(deadline).await {
            unclean.push(sandbox.plugin_id().to_owned());
        }
    }
    unclean
}

async fn supervise(
    first: Box<dyn DynPlugin>,
    recipe: PluginRecipe,
    ctx: PluginContext,
    status: RuntimeStatus,
    settings: SupervisorSettings,
    worker_slot: Arc<Mutex<Option<AbortHandle>>>,
) {
    let mut plugin = first;
    loop {
        let worker = tokio::spawn(run_worker(plugin, ctx.clone(), status.clone(), settings.clone()));
        *lock(&worker_slot) = Some(worker.abort_handle());

        let failure = match worker.await {
            Ok(WorkerExit::Stopped) => {
                status.set_state(PluginState::Down);
                return;
            }
            Ok(WorkerExit::SetUpFailed(reason)) => reason,
            Err(e) if e.is_panic() => panic_message(e.into_panic()),
            Err(_) => {
                status.set_state(PluginState::Down);
                return;
            }
        };

        if ctx.is_stopping() {
            status.set_state(PluginState::Down);
            return;
        }

        let restarts = status.record_restart(failure.clone());
        metrics::counter!(m::PLUGIN_RESTARTS_TOTAL, m::LABEL_PLUGIN => ctx.plugin_id().to_owned())
            .increment(1);
        if restarts > settings.restart_limit {
            error!(plugin_id = %ctx.plugin_id(), restarts, reason = %failure, "restart limit reached, plugin failed");
            status.set_state(PluginState::Failed);
            return;
        }

        let backoff = settings.backoff(restarts);
        warn!(plugin_id = %ctx.plugin_id(), restarts, ?backoff, reason = %failure, "plugin crashed, restarting");
        status.set_state(PluginState::Starting);
        if !ctx.sleep(backoff).await {
            status.set_state(PluginState::Down);
            return;
        }

        plugin = match recipe.build() {
            Ok(plugin) => plugin,
            Err(reason) => {
                error!(plugin_id = %ctx.plugin_id(), %reason, "cannot rebuild plugin");
                status.record_restart(reason);
                status.set_state(PluginState::Failed);
                return;
            }
        };
    }
}

async fn run_worker(
    mut plugin: Box<dyn DynPlugin>,
    ctx: PluginContext,
    status: RuntimeStatus,
    settings: SupervisorSettings,
) -> WorkerExit {
    status.set_state(PluginState::Starting);
    if let Err(e) = plugin.set_up(&ctx).await {
        error!(plugin_id = %ctx.plugin_id(), error = %e, "set_up failed");
        return WorkerExit::SetUpFailed(format!("set_up failed: {e}"));
    }
    status.set_state(PluginState::Up);

    let mut backoff = settings.min_backoff;
    while !ctx.is_stopping() {
        if ctx.is_paused() {
            status.set_state(PluginState::Paused);
            debug!(plugin_id = %ctx.plugin_id(), "plugin paused");
            if !ctx.wait_unpaused().await {
                break;
            }
            status.set_state(PluginState::Up);
            continue;
        }
        match plugin.main(&ctx).await {
            Ok(()) => backoff = settings.min_backoff,
            Err(e) => {
                report_main_error(&ctx, &status, &e);
                ctx.sleep(backoff).await;
                backoff = (backoff * 2).min(settings.max_backoff);
            }
        }
    }

    status.set_state(PluginState::Stopping);
    if let Err(e) = plugin.tear_down(&ctx).await {
        warn!(plugin_id = %ctx.plugin_id(), error = %e, "tear_down failed");
    }
    WorkerExit::Stopped
}

fn report_main_error(ctx: &PluginContext, status: &RuntimeStatus, err: &PluginError) {
    let count = status.record_error(err.to_string());
    metrics::counter!(m::PLUGIN_MAIN_ERRORS_TOTAL, m::LABEL_PLUGIN => ctx.plugin_id().to_owned())
        .increment(1);
    warn!(plugin_id = %ctx.plugin_id(), error = %err, error_type = err.type_name(), count, "main returned an error");
}

// ─── BufferSandbox ───────────────────────────────────────────────────

/// Supervised buffer: periodic truncation plus orderly close.
pub struct BufferSandbox {
    buffer: Arc<dyn BufferPlugin>,
    settings: SupervisorSettings,
    status: RuntimeStatus,
    truncated: Arc<Mutex<TruncateReport>>,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl BufferSandbox {
    pub fn new(plugin_id: &str, buffer: Arc<dyn BufferPlugin>, settings: SupervisorSettings) -> Self {
        Self {
            buffer,
            settings,
            status: RuntimeStatus::new(plugin_id),
            truncated: Arc::new(Mutex::new(TruncateReport::default())),
            stop: CancellationToken::new(),
            task: None,
        }
    }

    pub fn buffer(&self) -> &Arc<dyn BufferPlugin> {
        &self.buffer
    }

    pub fn state(&self) -> PluginState {
        self.status.state()
    }

    pub fn start(&mut self) {
        if self.task.is_some() {
            return;
        }
        self.status.set_state(PluginState::Up);
        let Some(interval) = self.buffer.truncate_interval() else {
            debug!("periodic truncation disabled");
            return;
        };
        info!(?interval, "starting buffer truncation loop");
        self.task = Some(tokio::spawn(truncation_loop(
            Arc::clone(&self.buffer),
            interval,
            self.status.clone(),
            self.settings.clone(),
            Arc::clone(&self.truncated),
            self.stop.clone(),
        )));
    }

    /// Stops the truncation loop and closes the buffer.
    pub async fn stop(&mut self) -> bool {
        self.status.set_state(PluginState::Stopping);
        self.stop.cancel();
        let mut clean = true;
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(self.settings.grace, &mut task).await.is_err() {
                warn!("truncation did not stop in time, aborting");
                task.abort();
                clean = false;
            }
        }
        if let Err(e) = self.buffer.close() {
            error!(error = %e, "buffer close failed");
            clean = false;
        }
        self.status.set_state(PluginState::Down);
        clean
    }

    /// Document queried by `inspect`.
    pub fn inspect_root(&self) -> Value {
        let consumers = match self.buffer.list_consumers() {
            Ok(consumers) => json!(consumers),
            Err(e) => json!({ "error": e.to_string() }),
        };
        json!({
            "store": {
                "consumers": consumers,
                "truncated": *lock(&self.truncated),
            },
            "runtime": self.status.snapshot(),
        })
    }
}

async fn truncation_loop(
    buffer: Arc<dyn BufferPlugin>,
    interval: Duration,
    status: RuntimeStatus,
    settings: SupervisorSettings,
    totals: Arc<Mutex<TruncateReport>>,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        let target = Arc::clone(&buffer);
        match tokio::task::spawn_blocking(move || target.truncate()).await {
            Ok(Ok(report)) => {
                if report.removed_records > 0 {
                    debug!(removed = report.removed_records, attachments = report.removed_attachments, "buffer truncated");
                }
                *lock(&totals) += report;
            }
            Ok(Err(e)) => {
                status.record_error(e.to_string());
                warn!(error = %e, "buffer truncation failed");
            }
            Err(e) => {
                let reason = if e.is_panic() {
                    panic_message(e.into_panic())
                } else {
                    "truncation task cancelled".to_owned()
                };
                let restarts = status.record_restart(reason.clone());
                metrics::counter!(m::PLUGIN_RESTARTS_TOTAL, m::LABEL_PLUGIN => "buffer").increment(1);
                if restarts > settings.restart_limit {
                    error!(restarts, %reason, "truncation keeps crashing, giving up");
                    status.set_state(PluginState::Failed);
                    return;
                }
                warn!(restarts, %reason, "truncation crashed");
            }
        }
    }
}
