//! Name → factory table used to load configured plugins.
//!
//! Modules are registered explicitly at process start; nothing is discovered
//! from the filesystem. A module may register several factories, and loading
//! picks the single one matching the required kind.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::args::{ArgSpec, PluginArgs, validate_args};
use crate::buffer::BufferPlugin;
use crate::error::{LoadPluginError, PluginError};
use crate::plugin::{DynPlugin, PluginKind};

/// Builds an input or output plugin from validated arguments.
pub type RunnableCtor = fn(&PluginArgs) -> Result<Box<dyn DynPlugin>, PluginError>;

/// Builds a buffer rooted at the given directory.
pub type BufferCtor = fn(&PluginArgs, &Path) -> Result<Arc<dyn BufferPlugin>, PluginError>;

/// Constructor tagged with the capability set it produces.
#[derive(Clone, Copy)]
pub enum Constructor {
    Input(RunnableCtor),
    Output(RunnableCtor),
    Buffer(BufferCtor),
}

/// One exported plugin implementation.
#[derive(Clone, Copy)]
pub struct PluginFactory {
    /// Implementation name, for diagnostics
    pub name: &'static str,
    pub args: &'static [ArgSpec],
    pub constructor: Constructor,
}

impl PluginFactory {
    pub fn kind(&self) -> PluginKind {
        match self.constructor {
            Constructor::Input(_) => PluginKind::Input,
            Constructor::Output(_) => PluginKind::Output,
            Constructor::Buffer(_) => PluginKind::Buffer,
        }
    }

    /// Runs the constructor, wrapping its error with type name and message.
    pub fn construct(
        &self,
        module: &str,
        args: &PluginArgs,
        data_dir: &Path,
    ) -> Result<PluginInstance, LoadPluginError> {
        let wrap = |e: PluginError| LoadPluginError::Constructor {
            module: module.to_owned(),
            error_type: e.type_name().to_owned(),
            message: e.to_string(),
        };
        match self.constructor {
            Constructor::Input(ctor) | Constructor::Output(ctor) => {
                ctor(args).map(PluginInstance::Runnable).map_err(wrap)
            }
            Constructor::Buffer(ctor) => ctor(args, data_dir).map(PluginInstance::Buffer).map_err(wrap),
        }
    }
}

/// A freshly constructed plugin.
pub enum PluginInstance {
    Runnable(Box<dyn DynPlugin>),
    Buffer(Arc<dyn BufferPlugin>),
}

/// Result of [`PluginRegistry::load`]: the instance plus what is needed to
/// rebuild it after a crash.
pub struct LoadedPlugin {
    pub module: String,
    pub factory: PluginFactory,
    pub args: PluginArgs,
    pub instance: PluginInstance,
}

/// Registry of plugin modules.
///
/// # Example
/// ```ignore
/// let mut registry = PluginRegistry::new();
/// registry.register("output_file", OUTPUT_FILE_FACTORY);
///
/// let loaded = registry.load("output_file", PluginKind::Output, &args, &dir)?;
/// ```
#[derive(Default)]
pub struct PluginRegistry {
    modules: BTreeMap<String, Vec<PluginFactory>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a factory under `module`.
    pub fn register(&mut self, module: impl Into<String>, factory: PluginFactory) {
        self.modules.entry(module.into()).or_default().push(factory);
    }

    pub fn contains(&self, module: &str) -> bool {
        self.modules.contains_key(module)
    }

    /// Registered module names with the kinds they export.
    pub fn modules(&self) -> impl Iterator<Item = (&str, Vec<PluginKind>)> {
        self.modules
            .iter()
            .map(|(name, factories)| (name.as_str(), factories.iter().map(PluginFactory::kind).collect()))
    }

    /// Loads `module` as a plugin of `kind`.
    ///
    /// Fails when the module is unknown, when it does not export exactly one
    /// factory of that kind, when `raw_args` fail validation, or when the
    /// constructor itself fails.
    pub fn load(
        &self,
        module: &str,
        kind: PluginKind,
        raw_args: &Value,
        data_dir: &Path,
    ) -> Result<LoadedPlugin, LoadPluginError> {
        let factories = self
            .modules
            .get(module)
            .ok_or_else(|| LoadPluginError::ModuleNotFound {
                module: module.to_owned(),
            })?;

        let candidates: Vec<&PluginFactory> =
            factories.iter().filter(|f| f.kind() == kind).collect();
        let [factory] = candidates.as_slice() else {
            return Err(LoadPluginError::CandidateCount {
                module: module.to_owned(),
                kind: kind.to_string(),
                count: candidates.len(),
            });
        };
        let factory = **factory;

        let args = validate_args(factory.args, raw_args).map_err(|source| {
            LoadPluginError::InvalidArgs {
                module: module.to_owned(),
                source,
            }
        })?;

        let instance = factory.construct(module, &args, data_dir)?;
        debug!(module, implementation = factory.name, %kind, "plugin loaded");

        Ok(LoadedPlugin {
            module: module.to_owned(),
            factory,
            args,
            instance,
        })
    }
}
