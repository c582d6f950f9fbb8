//! Instalog core: event model, configuration, plugin contracts and the flow
//! policy engine shared by the buffer, the built-in plugins and the daemon.

pub mod args;
pub mod batch;
pub mod buffer;
pub mod config;
pub mod error;
pub mod event;
pub mod fsutil;
pub mod inspect;
pub mod metrics;
pub mod plugin;
pub mod policy;
pub mod rpc;
pub mod stream;

// --- re-exports ---

// errors
pub use error::{
    ArgError, BufferError, ConfigError, EventError, InspectError, InstalogError, LoadPluginError,
    PluginError, RpcError, RuleError, StreamError,
};

// config
pub use config::{InstalogConfig, ResolvedConfig};

// events
pub use event::{Event, ProcessStage};

// plugins
pub use args::{ArgDefault, ArgSpec, ArgType, PluginArgs};
pub use buffer::{BufferEventStream, BufferPlugin, ConsumerProgress};
pub use plugin::{
    DynPlugin, Plugin, PluginContext, PluginFactory, PluginKind, PluginRegistry, PluginState,
};

// data plane
pub use batch::{BatchOutcome, BatchPolicy, OutputBatcher};
pub use policy::{FlowPolicy, Rule, RuleRegistry};
pub use stream::EventStream;
