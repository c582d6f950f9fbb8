//! Plugin contracts: kinds, lifecycle hooks and the dyn-compatible wrapper.
//!
//! Input and output plugins implement [`Plugin`]. The sandbox drives them as
//! `Box<dyn DynPlugin>`:
//!
//! ```text
//! set_up() → main() → main() → … (until stop requested) → tear_down()
//! ```
//!
//! Buffer plugins implement [`BufferPlugin`](crate::buffer::BufferPlugin)
//! instead; the sandbox runs their truncation loop for them.
//!
//! # Example
//! ```ignore
//! struct Counter;
//!
//! impl Plugin for Counter {
//!     async fn main(&mut self, ctx: &PluginContext) -> Result<(), PluginError> {
//!         let event = Event::from_value(serde_json::json!({"tick": 1}))?;
//!         ctx.emit(vec![event]).await?;
//!         ctx.sleep(Duration::from_secs(1)).await;
//!         Ok(())
//!     }
//! }
//! ```

mod context;
mod registry;

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::error::PluginError;

pub use context::{ContextConfig, PluginContext, PluginStore};
pub use registry::{
    BufferCtor, Constructor, LoadedPlugin, PluginFactory, PluginInstance, PluginRegistry,
    RunnableCtor,
};

/// Boxed future used by the dyn-compatible traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ─── PluginKind ──────────────────────────────────────────────────────

/// Capability set a plugin implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    Input,
    Output,
    Buffer,
}

impl PluginKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
            Self::Buffer => "buffer",
        }
    }
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── PluginState ─────────────────────────────────────────────────────

/// Lifecycle state of a supervised plugin.
///
/// - `Down` → start → `Starting` → set_up ok → `Up`
/// - `Up` → pause → `Pausing` → current `main` returns → `Paused`
/// - `Paused` or `Pausing` → unpause → `Up`
/// - `Up` → stop → `Stopping` → `Down`
/// - too many crashes → `Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PluginState {
    Down,
    Starting,
    Up,
    Pausing,
    Paused,
    Stopping,
    Failed,
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Down => "DOWN",
            Self::Starting => "STARTING",
            Self::Up => "UP",
            Self::Pausing => "PAUSING",
            Self::Paused => "PAUSED",
            Self::Stopping => "STOPPING",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

// ─── Plugin Trait ────────────────────────────────────────────────────

/// Lifecycle hooks of an input or output plugin.
///
/// `main` is called repeatedly until a stop is requested, so one call should
/// do one bounded unit of work. Long waits must go through
/// [`PluginContext::sleep`] or check [`PluginContext::is_stopping`]; the
/// sandbox aborts plugins that ignore a stop past the grace period.
pub trait Plugin: Send {
    /// One-time resource acquisition.
    fn set_up(
        &mut self,
        _ctx: &PluginContext,
    ) -> impl Future<Output = Result<(), PluginError>> + Send {
        async { Ok(()) }
    }

    /// One unit of work. Errors are logged and retried after a backoff.
    fn main(&mut self, ctx: &PluginContext)
    -> impl Future<Output = Result<(), PluginError>> + Send;

    /// Releases resources after the last `main`.
    fn tear_down(
        &mut self,
        _ctx: &PluginContext,
    ) -> impl Future<Output = Result<(), PluginError>> + Send {
        async { Ok(()) }
    }
}

// ─── DynPlugin Trait ─────────────────────────────────────────────────

/// dyn-compatible form of [`Plugin`].
///
/// `Plugin` uses RPITIT and cannot be a trait object; this returns
/// [`BoxFuture`]s instead. Every `Plugin` gets it through the blanket impl.
pub trait DynPlugin: Send {
    fn set_up<'a>(&'a mut self, ctx: &'a PluginContext) -> BoxFuture<'a, Result<(), PluginError>>;

    fn main<'a>(&'a mut self, ctx: &'a PluginContext) -> BoxFuture<'a, Result<(), PluginError>>;

    fn tear_down<'a>(
        &'a mut self,
        ctx: &'a PluginContext,
    ) -> BoxFuture<'a, Result<(), PluginError>>;
}

impl<T: Plugin> DynPlugin for T {
    fn set_up<'a>(&'a mut self, ctx: &'a PluginContext) -> BoxFuture<'a, Result<(), PluginError>> {
        Box::pin(Plugin::set_up(self, ctx))
    }

    fn main<'a>(&'a mut self, ctx: &'a PluginContext) -> BoxFuture<'a, Result<(), PluginError>> {
        Box::pin(Plugin::main(self, ctx))
    }

    fn tear_down<'a>(
        &'a mut self,
        ctx: &'a PluginContext,
    ) -> BoxFuture<'a, Result<(), PluginError>> {
        Box::pin(Plugin::tear_down(self, ctx))
    }
}
