//! Configuration: `instalog.yaml` parsing, overrides and validation.
//!
//! [`InstalogConfig`] is the top-level document. The node section is read by
//! the daemon and CLI; plugin entries are resolved into [`ResolvedConfig`]
//! before the orchestrator loads anything.
//!
//! # Load order
//! 1. YAML file
//! 2. Environment overrides (`INSTALOG_NODE_ID=station-3` style)
//! 3. Validation
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), instalog_core::error::InstalogError> {
//! use instalog_core::config::InstalogConfig;
//!
//! let config = InstalogConfig::load("instalog.yaml").await?;
//! let resolved = config.resolve()?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::warn;

use crate::error::{ConfigError, InstalogError};
use crate::plugin::PluginKind;

/// Plugin id reserved for the buffer.
pub const BUFFER_PLUGIN_ID: &str = "buffer";

/// Default buffer module.
pub const DEFAULT_BUFFER_MODULE: &str = "buffer_simple_file";

/// Top-level Instalog configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstalogConfig {
    /// Node-wide settings
    #[serde(default)]
    pub instalog: NodeConfig,
    /// Buffer plugin
    #[serde(default)]
    pub buffer: BufferEntry,
    /// Input plugins by id
    #[serde(default)]
    pub input: BTreeMap<String, PluginEntry>,
    /// Output plugins by id
    #[serde(default)]
    pub output: BTreeMap<String, PluginEntry>,
    /// Prometheus exporter
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl InstalogConfig {
    /// Loads a YAML file, applies environment overrides and validates.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, InstalogError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                InstalogError::Config(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })
            } else {
                InstalogError::Io(e)
            }
        })?;
        let mut config = Self::parse(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parses a YAML document without overrides or validation.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseFailed {
            reason: e.to_string(),
        })
    }

    /// Applies `INSTALOG_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        override_string(&mut self.instalog.node_id, "INSTALOG_NODE_ID");
        override_string(&mut self.instalog.data_dir, "INSTALOG_DATA_DIR");
        override_string(&mut self.instalog.log_level, "INSTALOG_LOG_LEVEL");
        override_string(&mut self.instalog.log_format, "INSTALOG_LOG_FORMAT");
        override_string(&mut self.instalog.cli_hostname, "INSTALOG_CLI_HOSTNAME");
        override_u16(&mut self.instalog.cli_port, "INSTALOG_CLI_PORT");
    }

    /// Validates node settings and plugin ids.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let node = &self.instalog;
        if node.node_id.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "instalog.node_id".to_owned(),
                reason: "must not be empty".to_owned(),
            });
        }

        if node.data_dir.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "instalog.data_dir".to_owned(),
                reason: "must not be empty".to_owned(),
            });
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&node.log_level.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "instalog.log_level".to_owned(),
                reason: format!("must be one of: {}", valid_levels.join(", ")),
            });
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&node.log_format.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "instalog.log_format".to_owned(),
                reason: format!("must be one of: {}", valid_formats.join(", ")),
            });
        }

        if node.cli_port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "instalog.cli_port".to_owned(),
                reason: "must be a non-zero port".to_owned(),
            });
        }

        if self.metrics.enabled && self.metrics.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "metrics.port".to_owned(),
                reason: "must be a non-zero port when metrics are enabled".to_owned(),
            });
        }

        for id in self.input.keys().chain(self.output.keys()) {
            validate_plugin_id(id)?;
        }

        Ok(())
    }

    /// Resolves plugin entries into load plans with their flow policies.
    ///
    /// - input and output ids must not overlap
    /// - each input `targets` entry adds an allow rule on the named output
    /// - an output without allow rules has no sources and is rejected
    /// - outputs get a recursion deny rule unless `enable_recursion` is set
    pub fn resolve(&self) -> Result<ResolvedConfig, ConfigError> {
        for id in self.input.keys() {
            if self.output.contains_key(id) {
                return Err(ConfigError::Plugin {
                    plugin_id: id.clone(),
                    reason: "id is used by both an input and an output".to_owned(),
                });
            }
        }

        let mut outputs: BTreeMap<&str, PluginPlan> = BTreeMap::new();
        for (id, entry) in &self.output {
            if !entry.targets.is_empty() {
                return Err(ConfigError::Plugin {
                    plugin_id: id.clone(),
                    reason: "outputs do not take 'targets'".to_owned(),
                });
            }
            let mut plan = PluginPlan::new(id, PluginKind::Output, entry);
            if !entry.enable_recursion {
                plan.deny.push(json!({
                    "rule": "history",
                    "node_id": self.instalog.node_id,
                    "plugin_id": id,
                }));
            }
            outputs.insert(id.as_str(), plan);
        }

        let mut inputs = Vec::with_capacity(self.input.len());
        for (id, entry) in &self.input {
            if !entry.allow.is_empty() || !entry.deny.is_empty() {
                return Err(ConfigError::Plugin {
                    plugin_id: id.clone(),
                    reason: "inputs do not take 'allow' or 'deny'".to_owned(),
                });
            }
            for target in entry.targets.iter() {
                let output = outputs.get_mut(target).ok_or_else(|| ConfigError::Plugin {
                    plugin_id: id.clone(),
                    reason: format!("target '{target}' is not a configured output"),
                })?;
                output.allow.push(json!({
                    "rule": "history",
                    "plugin_id": id,
                    "position": -1,
                }));
            }
            inputs.push(PluginPlan::new(id, PluginKind::Input, entry));
        }

        for (id, plan) in &outputs {
            if plan.allow.is_empty() {
                return Err(ConfigError::Plugin {
                    plugin_id: (*id).to_owned(),
                    reason: "output has no sources: add it to an input's targets or give it allow rules"
                        .to_owned(),
                });
            }
        }

        Ok(ResolvedConfig {
            node_id: self.instalog.node_id.clone(),
            data_dir: PathBuf::from(&self.instalog.data_dir),
            buffer: PluginPlan {
                id: BUFFER_PLUGIN_ID.to_owned(),
                module: self.buffer.plugin.clone(),
                kind: PluginKind::Buffer,
                args: self.buffer.args.clone(),
                allow: Vec::new(),
                deny: Vec::new(),
            },
            inputs,
            outputs: outputs.into_values().collect(),
        })
    }
}

fn validate_plugin_id(id: &str) -> Result<(), ConfigError> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        return Err(ConfigError::Plugin {
            plugin_id: id.to_owned(),
            reason: "ids may only contain ASCII letters, digits, '_' and '-'".to_owned(),
        });
    }
    if id == BUFFER_PLUGIN_ID {
        return Err(ConfigError::Plugin {
            plugin_id: id.to_owned(),
            reason: "id is reserved for the buffer".to_owned(),
        });
    }
    Ok(())
}

/// Node-wide settings (`instalog:` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    /// Name of this node, recorded in every ProcessStage
    pub node_id: String,
    /// Root for buffer files and plugin state
    pub data_dir: String,
    /// PID file path
    pub pid_file: String,
    /// Log file; stderr when unset
    pub log_file: Option<String>,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log format (json, pretty)
    pub log_format: String,
    /// Control RPC bind address
    pub cli_hostname: String,
    /// Control RPC port
    pub cli_port: u16,
    /// Seconds a plugin gets to stop before it is aborted
    pub stop_grace_secs: u64,
    /// Panics tolerated before a plugin is marked failed
    pub restart_limit: u32,
}

impl NodeConfig {
    /// `host:port` of the control RPC endpoint.
    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.cli_hostname, self.cli_port)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            data_dir: "/var/lib/instalog".to_owned(),
            pid_file: "/run/instalog.pid".to_owned(),
            log_file: None,
            log_level: "info".to_owned(),
            log_format: "pretty".to_owned(),
            cli_hostname: "127.0.0.1".to_owned(),
            cli_port: 7000,
            stop_grace_secs: 10,
            restart_limit: 5,
        }
    }
}

/// `buffer:` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BufferEntry {
    /// Buffer module name
    pub plugin: String,
    /// Module arguments
    pub args: Value,
}

impl Default for BufferEntry {
    fn default() -> Self {
        Self {
            plugin: DEFAULT_BUFFER_MODULE.to_owned(),
            args: Value::Object(Map::new()),
        }
    }
}

/// One `input:` or `output:` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginEntry {
    /// Module name in the plugin registry
    pub plugin: String,
    /// Module arguments
    #[serde(default)]
    pub args: Value,
    /// Outputs an input feeds
    #[serde(default)]
    pub targets: Targets,
    /// Extra allow rules (outputs)
    #[serde(default)]
    pub allow: Vec<Value>,
    /// Extra deny rules (outputs)
    #[serde(default)]
    pub deny: Vec<Value>,
    /// Let an output see events it already delivered on this node
    #[serde(default)]
    pub enable_recursion: bool,
}

/// `targets` accepts a single id or a list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Targets {
    #[default]
    None,
    One(String),
    Many(Vec<String>),
}

impl Targets {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let slice: &[String] = match self {
            Self::None => &[],
            Self::One(one) => std::slice::from_ref(one),
            Self::Many(many) => many,
        };
        slice.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

/// Prometheus exporter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen_addr: String,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "127.0.0.1".to_owned(),
            port: 9100,
        }
    }
}

/// A plugin ready to be loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginPlan {
    pub id: String,
    pub module: String,
    pub kind: PluginKind,
    pub args: Value,
    pub allow: Vec<Value>,
    pub deny: Vec<Value>,
}

impl PluginPlan {
    fn new(id: &str, kind: PluginKind, entry: &PluginEntry) -> Self {
        Self {
            id: id.to_owned(),
            module: entry.plugin.clone(),
            kind,
            args: entry.args.clone(),
            allow: entry.allow.clone(),
            deny: entry.deny.clone(),
        }
    }
}

/// Configuration after target and policy resolution.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub node_id: String,
    pub data_dir: PathBuf,
    pub buffer: PluginPlan,
    pub inputs: Vec<PluginPlan>,
    pub outputs: Vec<PluginPlan>,
}

impl ResolvedConfig {
    /// Path of a plugin's persistent store.
    pub fn store_path(&self, plugin_id: &str) -> PathBuf {
        self.data_dir.join(format!("{plugin_id}.json"))
    }

    /// Private data directory of a plugin.
    pub fn plugin_dir(&self, plugin_id: &str) -> PathBuf {
        self.data_dir.join(plugin_id)
    }
}

// --- environment override helpers ---

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_u16(target: &mut u16, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u16>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u16 from env var, ignoring"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const BASIC: &str = r#"
instalog:
  node_id: station-1
  data_dir: /tmp/instalog
buffer:
  plugin: buffer_priority_file
  args:
    truncate_interval: 30
input:
  logs:
    plugin: input_log_file
    targets: [archive, uplink]
    args:
      path: /var/log/events.json
output:
  archive:
    plugin: output_file
    args:
      target_dir: /srv/archive
  uplink:
    plugin: output_socket
    args:
      hostname: 10.0.0.2
      port: 8893
"#;

    #[test]
    fn parses_full_document() {
        let config = InstalogConfig::parse(BASIC).unwrap();
        assert_eq!(config.instalog.node_id, "station-1");
        assert_eq!(config.instalog.cli_port, 7000, "defaults fill missing fields");
        assert_eq!(config.buffer.plugin, "buffer_priority_file");
        assert_eq!(config.buffer.args["truncate_interval"], 30);
        assert_eq!(
            config.input["logs"].targets,
            Targets::Many(vec!["archive".into(), "uplink".into()])
        );
        config.validate().unwrap();
    }

    #[test]
    fn missing_buffer_section_uses_simple_file() {
        let config = InstalogConfig::parse("instalog: {node_id: a}").unwrap();
        assert_eq!(config.buffer.plugin, DEFAULT_BUFFER_MODULE);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = InstalogConfig::parse("instalog: {node_id: a, colour: blue}").unwrap_err();
        assert!(err.to_string().contains("colour"), "{err}");

        let err = InstalogConfig::parse(
            "instalog: {node_id: a}\ninput:\n  x: {plugin: p, bogus: 1}",
        )
        .unwrap_err();
        assert!(err.to_string().contains("bogus"), "{err}");
    }

    #[test]
    fn invalid_yaml_is_parse_error() {
        let err = InstalogConfig::parse("instalog: [unclosed").unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed { .. }));
    }

    #[test]
    fn validate_requires_node_id() {
        let config = InstalogConfig::parse("instalog: {data_dir: /x}").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("instalog.node_id"));
    }

    #[test]
    fn validate_rejects_bad_log_level() {
        let config = InstalogConfig::parse("instalog: {node_id: a, log_level: loud}").unwrap();
        assert!(config.validate().unwrap_err().to_string().contains("log_level"));
    }

    #[test]
    fn validate_rejects_reserved_and_odd_ids() {
        let config =
            InstalogConfig::parse("instalog: {node_id: a}\ninput:\n  buffer: {plugin: p}").unwrap();
        assert!(config.validate().unwrap_err().to_string().contains("reserved"));

        let config =
            InstalogConfig::parse("instalog: {node_id: a}\ninput:\n  'a/b': {plugin: p}").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn resolve_turns_targets_into_allow_rules() {
        // Given: one input targeting two outputs
        let config = InstalogConfig::parse(BASIC).unwrap();

        // When
        let resolved = config.resolve().unwrap();

        // Then: each output allows events whose latest hop is the input
        assert_eq!(resolved.outputs.len(), 2);
        for output in &resolved.outputs {
            assert_eq!(
                output.allow,
                vec![json!({"rule": "history", "plugin_id": "logs", "position": -1})],
                "allow rules of {}",
                output.id
            );
        }
        assert_eq!(resolved.inputs[0].kind, PluginKind::Input);
        assert_eq!(resolved.buffer.id, BUFFER_PLUGIN_ID);
    }

    #[test]
    fn resolve_adds_recursion_deny_unless_enabled() {
        let yaml = r#"
instalog: {node_id: n1}
input:
  i: {plugin: p, targets: o1}
output:
  o1: {plugin: q}
  o2: {plugin: q, enable_recursion: true, allow: [{rule: all}]}
"#;
        let resolved = InstalogConfig::parse(yaml).unwrap().resolve().unwrap();
        let o1 = resolved.outputs.iter().find(|p| p.id == "o1").unwrap();
        let o2 = resolved.outputs.iter().find(|p| p.id == "o2").unwrap();

        assert_eq!(
            o1.deny,
            vec![json!({"rule": "history", "node_id": "n1", "plugin_id": "o1"})]
        );
        assert!(o2.deny.is_empty());
    }

    #[test]
    fn resolve_rejects_output_without_sources() {
        let yaml = "instalog: {node_id: n}\noutput:\n  lonely: {plugin: q}";
        let err = InstalogConfig::parse(yaml).unwrap().resolve().unwrap_err();
        assert!(err.to_string().contains("no sources"), "{err}");
    }

    #[test]
    fn resolve_rejects_unknown_target_and_overlapping_ids() {
        let yaml = "instalog: {node_id: n}\ninput:\n  i: {plugin: p, targets: nowhere}";
        let err = InstalogConfig::parse(yaml).unwrap().resolve().unwrap_err();
        assert!(err.to_string().contains("nowhere"));

        let yaml = "instalog: {node_id: n}\ninput:\n  x: {plugin: p}\noutput:\n  x: {plugin: q}";
        let err = InstalogConfig::parse(yaml).unwrap().resolve().unwrap_err();
        assert!(err.to_string().contains("both"));
    }

    #[test]
    fn plugin_paths_live_under_data_dir() {
        let resolved = InstalogConfig::parse(BASIC).unwrap().resolve().unwrap();
        assert_eq!(
            resolved.store_path("logs"),
            PathBuf::from("/tmp/instalog/logs.json")
        );
        assert_eq!(resolved.plugin_dir("logs"), PathBuf::from("/tmp/instalog/logs"));
    }

    #[test]
    #[serial]
    fn env_overrides_apply() {
        let mut config = InstalogConfig::parse(BASIC).unwrap();
        // SAFETY: serialized test, no other thread reads the environment.
        unsafe {
            std::env::set_var("INSTALOG_NODE_ID", "override-node");
            std::env::set_var("INSTALOG_CLI_PORT", "7100");
        }
        config.apply_env_overrides();
        unsafe {
            std::env::remove_var("INSTALOG_NODE_ID");
            std::env::remove_var("INSTALOG_CLI_PORT");
        }
        assert_eq!(config.instalog.node_id, "override-node");
        assert_eq!(config.instalog.rpc_addr(), "127.0.0.1:7100");
    }

    #[test]
    #[serial]
    fn env_override_bad_port_keeps_original() {
        let mut port = 7000;
        // SAFETY: serialized test, no other thread reads the environment.
        unsafe { std::env::set_var("TEST_INSTALOG_PORT", "seventy") };
        override_u16(&mut port, "TEST_INSTALOG_PORT");
        unsafe { std::env::remove_var("TEST_INSTALOG_PORT") };
        assert_eq!(port, 7000);
    }

    #[tokio::test]
    async fn load_missing_file_is_not_found() {
        let err = InstalogConfig::load("/nonexistent/instalog.yaml")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InstalogError::Config(ConfigError::FileNotFound { .. })
        ));
    }
}
