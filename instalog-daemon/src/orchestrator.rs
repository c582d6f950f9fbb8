//! Core orchestration: loads the configured pipeline, runs it, and answers
//! control requests.
//!
//! # States
//!
//! `Stopped → Starting → Running → Stopping → Stopped`
//!
//! # Start order
//!
//! 1. buffer (consumers synced with the configured outputs)
//! 2. outputs
//! 3. inputs
//! 4. control RPC listener
//!
//! Every plugin is loaded before any of them runs, so a configuration or
//! load error leaves nothing running. Stop signals every input and output at
//! once, waits for all of them against one grace deadline, and closes the
//! buffer last.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use instalog_core::buffer::BufferPlugin;
use instalog_core::config::{InstalogConfig, PluginPlan, ResolvedConfig};
use instalog_core::error::{ConfigError, InspectError, InstalogError, LoadPluginError};
use instalog_core::inspect;
use instalog_core::metrics as m;
use instalog_core::plugin::{
    ContextConfig, PluginContext, PluginInstance, PluginKind, PluginRegistry, PluginState,
    PluginStore,
};
use instalog_core::policy::{FlowPolicy, RuleRegistry};
use instalog_core::rpc::{FlushResult, ProgressReport};
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::rpc_server;
use crate::sandbox::{self, BufferSandbox, PluginRecipe, PluginSandbox, SupervisorSettings};

/// Lifecycle state of the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CoreState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// What a pause request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseAction {
    Pause,
    Unpause,
    Toggle,
}

/// Everything that exists only while running.
struct Pipeline {
    buffer: BufferSandbox,
    inputs: Vec<PluginSandbox>,
    outputs: Vec<PluginSandbox>,
    rpc_addr: SocketAddr,
    rpc_task: JoinHandle<()>,
    rpc_stop: CancellationToken,
    uptime_task: JoinHandle<()>,
}

/// The core orchestrator. Shared as `Arc<Orchestrator>` with the RPC server.
pub struct Orchestrator {
    config: InstalogConfig,
    registry: PluginRegistry,
    rules: RuleRegistry,
    state: Mutex<CoreState>,
    pipeline: RwLock<Option<Pipeline>>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(config: InstalogConfig, registry: PluginRegistry, rules: RuleRegistry) -> Self {
        Self {
            config,
            registry,
            rules,
            state: Mutex::new(CoreState::Stopped),
            pipeline: RwLock::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &InstalogConfig {
        &self.config
    }

    fn state_guard(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> CoreState {
        *self.state_guard()
    }

    fn set_state(&self, state: CoreState) {
        let previous = std::mem::replace(&mut *self.state_guard(), state);
        debug!(?previous, ?state, "core state changed");
    }

    pub fn is_up(&self) -> bool {
        self.state() == CoreState::Running
    }

    /// Asks the owner of the core to stop it. Returns immediately.
    pub fn request_shutdown(&self) {
        info!("shutdown requested");
        self.shutdown.cancel();
    }

    /// Resolves once [`request_shutdown`](Self::request_shutdown) was called.
    pub async fn shutdown_requested(&self) {
        self.shutdown.cancelled().await;
    }

    /// Address the control RPC listener is bound to, while running.
    pub async fn rpc_addr(&self) -> Option<SocketAddr> {
        self.pipeline.read().await.as_ref().map(|p| p.rpc_addr)
    }

    // ─── start ───────────────────────────────────────────────────────

    /// Loads and starts the whole pipeline.
    ///
    /// Fails without leaving anything running when any plugin cannot be
    /// loaded or the control port cannot be bound.
    pub async fn start(self: &Arc<Self>) -> Result<(), InstalogError> {
        {
            let mut state = self.state_guard();
            if *state != CoreState::Stopped {
                return Err(InstalogError::Config(ConfigError::InvalidValue {
                    field: "core".to_owned(),
                    reason: format!("cannot start while {state:?}"),
                }));
            }
            *state = CoreState::Starting;
        }

        match self.assemble().await {
            Ok(pipeline) => {
                *self.pipeline.write().await = Some(pipeline);
                self.set_state(CoreState::Running);
                info!(node_id = %self.config.instalog.node_id, "core running");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "core failed to start");
                self.set_state(CoreState::Stopped);
                Err(e)
            }
        }
    }

    async fn assemble(self: &Arc<Self>) -> Result<Pipeline, InstalogError> {
        let resolved = self.config.resolve()?;
        let settings = SupervisorSettings::from_node(&self.config.instalog);
        tokio::fs::create_dir_all(&resolved.data_dir).await?;

        let buffer = self.load_buffer(&resolved)?;
        let loaded = self.load_runnables(&resolved, &buffer, &settings).await;
        let (mut inputs, mut outputs) = match loaded {
            Ok(loaded) => loaded,
            Err(e) => {
                close_quietly(buffer.as_ref());
                return Err(e);
            }
        };

        let listener = match TcpListener::bind(self.config.instalog.rpc_addr()).await {
            Ok(listener) => listener,
            Err(e) => {
                close_quietly(buffer.as_ref());
                return Err(e.into());
            }
        };
        let rpc_addr = listener.local_addr()?;

        if let Err(e) = sync_consumers(buffer.as_ref(), &resolved.outputs) {
            close_quietly(buffer.as_ref());
            return Err(e.into());
        }

        let mut buffer = BufferSandbox::new(&resolved.buffer.id, buffer, settings);
        buffer.start();
        for output in &mut outputs {
            output.start();
        }
        for input in &mut inputs {
            input.start();
        }

        let rpc_stop = CancellationToken::new();
        let rpc_task = tokio::spawn(rpc_server::serve(
            Arc::clone(self),
            listener,
            rpc_stop.clone(),
        ));
        info!(%rpc_addr, "control RPC listening");

        metrics::gauge!(m::CORE_BUILD_INFO, "version" => env!("CARGO_PKG_VERSION")).set(1.0);
        let uptime_task = spawn_uptime_updater(Instant::now(), rpc_stop.clone());

        Ok(Pipeline {
            buffer,
            inputs,
            outputs,
            rpc_addr,
            rpc_task,
            rpc_stop,
            uptime_task,
        })
    }

    fn load_buffer(&self, resolved: &ResolvedConfig) -> Result<Arc<dyn BufferPlugin>, InstalogError> {
        let plan = &resolved.buffer;
        let loaded = self.registry.load(
            &plan.module,
            PluginKind::Buffer,
            &plan.args,
            &resolved.plugin_dir(&plan.id),
        )?;
        match loaded.instance {
            PluginInstance::Buffer(buffer) => {
                info!(module = %plan.module, dir = %resolved.plugin_dir(&plan.id).display(), "buffer loaded");
                Ok(buffer)
            }
            PluginInstance::Runnable(_) => Err(unexpected_instance(&plan.module, PluginKind::Buffer)),
        }
    }

    async fn load_runnables(
        &self,
        resolved: &ResolvedConfig,
        buffer: &Arc<dyn BufferPlugin>,
        settings: &SupervisorSettings,
    ) -> Result<(Vec<PluginSandbox>, Vec<PluginSandbox>), InstalogError> {
        let mut inputs = Vec::with_capacity(resolved.inputs.len());
        for plan in &resolved.inputs {
            let policy = Arc::new(FlowPolicy::allow_all());
            inputs.push(self.load_runnable(resolved, plan, buffer, policy, settings).await?);
        }

        let mut outputs = Vec::with_capacity(resolved.outputs.len());
        for plan in &resolved.outputs {
            let policy = FlowPolicy::from_definitions(&self.rules, &plan.allow, &plan.deny)
                .map_err(|e| ConfigError::Plugin {
                    plugin_id: plan.id.clone(),
                    reason: e.to_string(),
                })?;
            debug!(plugin_id = %plan.id, allow = policy.allow_rules(), deny = policy.deny_rules(), "flow policy built");
            outputs.push(
                self.load_runnable(resolved, plan, buffer, Arc::new(policy), settings)
                    .await?,
            );
        }
        Ok((inputs, outputs))
    }

    async fn load_runnable(
        &self,
        resolved: &ResolvedConfig,
        plan: &PluginPlan,
        buffer: &Arc<dyn BufferPlugin>,
        policy: Arc<FlowPolicy>,
        settings: &SupervisorSettings,
    ) -> Result<PluginSandbox, InstalogError> {
        let data_dir = resolved.plugin_dir(&plan.id);
        tokio::fs::create_dir_all(&data_dir).await?;

        let loaded = self
            .registry
            .load(&plan.module, plan.kind, &plan.args, &data_dir)?;
        let PluginInstance::Runnable(instance) = loaded.instance else {
            return Err(unexpected_instance(&plan.module, plan.kind));
        };

        let ctx = PluginContext::new(ContextConfig {
            plugin_id: plan.id.clone(),
            module: plan.module.clone(),
            kind: plan.kind,
            node_id: resolved.node_id.clone(),
            data_dir: data_dir.clone(),
            args: loaded.args.clone(),
            store: PluginStore::open(resolved.store_path(&plan.id)),
            buffer: Some(Arc::clone(buffer)),
            policy,
            stop: CancellationToken::new(),
        });
        let recipe = PluginRecipe {
            module: loaded.module,
            factory: loaded.factory,
            args: loaded.args,
            data_dir,
        };
        info!(plugin_id = %plan.id, module = %plan.module, kind = %plan.kind, "plugin loaded");
        Ok(PluginSandbox::new(ctx, recipe, instance, settings.clone()))
    }

    // ─── stop ────────────────────────────────────────────────────────

    /// Stops every plugin and closes the buffer.
    ///
    /// Always ends in `Stopped`. Returns the ids of plugins that had to be
    /// aborted or failed to close.
    pub async fn stop(&self) -> Vec<String> {
        // Close the control listener first; its open requests hold read locks.
        if let Some(pipeline) = self.pipeline.read().await.as_ref() {
            pipeline.rpc_stop.cancel();
        }
        let Some(mut pipeline) = self.pipeline.write().await.take() else {
            return Vec::new();
        };
        self.set_state(CoreState::Stopping);
        info!("stopping core");

        let mut unclean =
            sandbox::stop_all(pipeline.inputs.iter_mut().chain(pipeline.outputs.iter_mut())).await;
        if !pipeline.buffer.stop().await {
            unclean.push(instalog_core::config::BUFFER_PLUGIN_ID.to_owned());
        }

        if tokio::time::timeout(Duration::from_secs(1), &mut pipeline.rpc_task)
            .await
            .is_err()
        {
            pipeline.rpc_task.abort();
        }
        pipeline.uptime_task.abort();

        if unclean.is_empty() {
            info!("core stopped");
        } else {
            warn!(plugins = ?unclean, "core stopped, some plugins did not stop cleanly");
        }
        self.set_state(CoreState::Stopped);
        unclean
    }

    // ─── control operations ──────────────────────────────────────────

    /// Waits until one output, or every output in turn, has committed
    /// everything produced before the call.
    ///
    /// With several outputs, `completed` and `watermark` are sums and the
    /// timeout covers the whole call.
    pub async fn flush(&self, plugin_id: Option<&str>, timeout: Duration) -> Result<FlushResult, String> {
        let guard = self.pipeline.read().await;
        let pipeline = guard.as_ref().ok_or_else(|| "core is not running".to_owned())?;

        let targets: Vec<&PluginSandbox> = match plugin_id {
            Some(id) => vec![
                pipeline
                    .outputs
                    .iter()
                    .find(|o| o.plugin_id() == id)
                    .ok_or_else(|| format!("'{id}' is not a configured output"))?,
            ],
            None => pipeline.outputs.iter().collect(),
        };

        let started = Instant::now();
        let deadline = started + timeout;
        let mut combined = FlushResult {
            success: true,
            message: String::new(),
            completed: 0,
            watermark: 0,
        };
        let mut messages = Vec::with_capacity(targets.len());
        for output in targets {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let result = output.flush(remaining).await;
            combined.success &= result.success;
            combined.completed += result.completed;
            combined.watermark += result.watermark;
            messages.push(result.message);
        }
        combined.message = if messages.is_empty() {
            "no outputs configured".to_owned()
        } else {
            messages.join("; ")
        };

        metrics::histogram!(m::CORE_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        info!(success = combined.success, completed = combined.completed, watermark = combined.watermark, "flush finished");
        Ok(combined)
    }

    /// Evaluates `path` against a plugin's inspect document.
    pub async fn inspect(&self, plugin_id: &str, path: &str) -> Result<Value, InspectError> {
        let guard = self.pipeline.read().await;
        let pipeline = guard
            .as_ref()
            .ok_or_else(|| InspectError::UnknownPlugin(plugin_id.to_owned()))?;

        let root = if plugin_id == instalog_core::config::BUFFER_PLUGIN_ID {
            pipeline.buffer.inspect_root()
        } else {
            pipeline
                .inputs
                .iter()
                .chain(pipeline.outputs.iter())
                .find(|s| s.plugin_id() == plugin_id)
                .map(PluginSandbox::inspect_root)
                .ok_or_else(|| InspectError::UnknownPlugin(plugin_id.to_owned()))?
        };
        inspect::lookup(&root, path).cloned()
    }

    /// Pauses, unpauses or toggles one input or output.
    ///
    /// Returns the plugin's state right after the request. The buffer has
    /// no `main` loop and cannot be paused.
    pub async fn pause(&self, plugin_id: &str, action: PauseAction) -> Result<PluginState, String> {
        let guard = self.pipeline.read().await;
        let pipeline = guard.as_ref().ok_or_else(|| "core is not running".to_owned())?;
        if plugin_id == instalog_core::config::BUFFER_PLUGIN_ID {
            return Err("the buffer cannot be paused".to_owned());
        }
        let sandbox = pipeline
            .inputs
            .iter()
            .chain(pipeline.outputs.iter())
            .find(|s| s.plugin_id() == plugin_id)
            .ok_or_else(|| format!("unknown plugin '{plugin_id}'"))?;
        match action {
            PauseAction::Pause => sandbox.pause(),
            PauseAction::Unpause => sandbox.unpause(),
            PauseAction::Toggle => sandbox.toggle_pause(),
        }
    }

    /// Delivery progress of every configured output.
    pub async fn progress(&self) -> Result<ProgressReport, String> {
        let guard = self.pipeline.read().await;
        let pipeline = guard.as_ref().ok_or_else(|| "core is not running".to_owned())?;
        pipeline
            .buffer
            .buffer()
            .list_consumers()
            .map_err(|e| e.to_string())
    }
}

fn unexpected_instance(module: &str, kind: PluginKind) -> InstalogError {
    InstalogError::LoadPlugin(LoadPluginError::CandidateCount {
        module: module.to_owned(),
        kind: kind.to_string(),
        count: 0,
    })
}

fn close_quietly(buffer: &dyn BufferPlugin) {
    if let Err(e) = buffer.close() {
        warn!(error = %e, "buffer close failed during start rollback");
    }
}

/// Adds a consumer per configured output and removes stale ones.
fn sync_consumers(buffer: &dyn BufferPlugin, outputs: &[PluginPlan]) -> Result<(), instalog_core::error::BufferError> {
    let wanted: BTreeSet<&str> = outputs.iter().map(|o| o.id.as_str()).collect();
    let existing = buffer.list_consumers()?;
    for stale in existing.keys().filter(|c| !wanted.contains(c.as_str())) {
        info!(consumer = %stale, "removing consumer of a deconfigured output");
        buffer.remove_consumer(stale)?;
    }
    for id in wanted {
        if !existing.contains_key(id) {
            info!(consumer = %id, "adding consumer");
        }
        buffer.add_consumer(id)?;
    }
    Ok(())
}

fn spawn_uptime_updater(start: Instant, stop: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    metrics::gauge!(m::CORE_UPTIME_SECONDS).set(start.elapsed().as_secs_f64());
                }
                _ = stop.cancelled() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use instalog_core::buffer::ConsumerProgress;
    use instalog_core::error::BufferError;
    use instalog_core::plugin::PluginKind;
    use serde_json::json;
    use std::collections::BTreeMap;

    struct Consumers(Mutex<BTreeMap<String, ConsumerProgress>>);

    impl BufferPlugin for Consumers {
        fn produce(&self, _events: Vec<instalog_core::event::Event>) -> Result<u64, BufferError> {
            Ok(0)
        }
        fn consume(&self, _c: &str) -> Result<Box<dyn instalog_core::buffer::BufferEventStream>, BufferError> {
            Err(BufferError::Closed)
        }
        fn add_consumer(&self, c: &str) -> Result<(), BufferError> {
            self.0.lock().unwrap().entry(c.to_owned()).or_default();
            Ok(())
        }
        fn remove_consumer(&self, c: &str) -> Result<(), BufferError> {
            self.0.lock().unwrap().remove(c);
            Ok(())
        }
        fn list_consumers(&self) -> Result<BTreeMap<String, ConsumerProgress>, BufferError> {
            Ok(self.0.lock().unwrap().clone())
        }
        fn progress(&self, _c: &str) -> Result<ConsumerProgress, BufferError> {
            Ok(ConsumerProgress::default())
        }
        fn truncate(&self) -> Result<instalog_core::buffer::TruncateReport, BufferError> {
            Ok(Default::default())
        }
        fn truncate_interval(&self) -> Option<Duration> {
            None
        }
        fn subscribe(&self) -> tokio::sync::watch::Receiver<u64> {
            tokio::sync::watch::channel(0).1
        }
        fn close(&self) -> Result<(), BufferError> {
            Ok(())
        }
    }

    fn plan(id: &str) -> PluginPlan {
        PluginPlan {
            id: id.to_owned(),
            module: "output_file".to_owned(),
            kind: PluginKind::Output,
            args: json!({}),
            allow: Vec::new(),
            deny: Vec::new(),
        }
    }

    #[test]
    fn consumers_follow_configured_outputs() {
        // Given: a buffer that still knows a removed output
        let buffer = Consumers(Mutex::new(BTreeMap::new()));
        buffer.add_consumer("old").unwrap();
        buffer.add_consumer("archive").unwrap();

        // When
        sync_consumers(&buffer, &[plan("archive"), plan("uplink")]).unwrap();

        // Then
        let names: Vec<String> = buffer.list_consumers().unwrap().into_keys().collect();
        assert_eq!(names, vec!["archive", "uplink"]);
    }

    #[test]
    fn new_core_is_stopped() {
        let config = InstalogConfig::parse("instalog: {node_id: n1}").unwrap();
        let core = Orchestrator::new(config, PluginRegistry::new(), RuleRegistry::with_builtins());
        assert_eq!(core.state(), CoreState::Stopped);
        assert!(!core.is_up());
    }
}
