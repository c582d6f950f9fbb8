//! Declared plugin arguments and their validation.
//!
//! Each plugin factory publishes a static table of [`ArgSpec`]s. The loader
//! validates the configured `args` mapping against it and hands the plugin a
//! [`PluginArgs`] with defaults filled in.

use std::time::Duration;

use serde_json::{Map, Value};

use crate::error::ArgError;
use crate::event::json_type_name;

/// Expected type of an argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    Str,
    Int,
    /// Accepts ints as well
    Float,
    Bool,
    List,
    Map,
    Any,
}

impl ArgType {
    fn name(self) -> &'static str {
        match self {
            Self::Str => "string",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::List => "list",
            Self::Map => "mapping",
            Self::Any => "any",
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::Str => value.is_string(),
            Self::Int => value.is_i64() || value.is_u64(),
            Self::Float => value.is_number(),
            Self::Bool => value.is_boolean(),
            Self::List => value.is_array(),
            Self::Map => value.is_object(),
            Self::Any => true,
        }
    }
}

/// Const-friendly default value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArgDefault {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(&'static str),
}

impl ArgDefault {
    fn to_value(self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(b),
            Self::Int(i) => Value::from(i),
            Self::Float(f) => Value::from(f),
            Self::Str(s) => Value::from(s),
        }
    }
}

/// One declared argument. Arguments without a default are required.
#[derive(Debug, Clone, Copy)]
pub struct ArgSpec {
    pub name: &'static str,
    pub ty: ArgType,
    pub help: &'static str,
    pub default: Option<ArgDefault>,
}

impl ArgSpec {
    pub const fn required(name: &'static str, ty: ArgType, help: &'static str) -> Self {
        Self {
            name,
            ty,
            help,
            default: None,
        }
    }

    pub const fn optional(
        name: &'static str,
        ty: ArgType,
        help: &'static str,
        default: ArgDefault,
    ) -> Self {
        Self {
            name,
            ty,
            help,
            default: Some(default),
        }
    }
}

/// Validates `raw` against `specs`.
///
/// `null` is treated as an empty mapping. An explicit `null` value for an
/// optional argument selects its default.
pub fn validate_args(specs: &[ArgSpec], raw: &Value) -> Result<PluginArgs, ArgError> {
    let given = match raw {
        Value::Null => Map::new(),
        Value::Object(map) => map.clone(),
        other => {
            return Err(ArgError::NotAMapping {
                actual: json_type_name(other),
            });
        }
    };

    if let Some(unknown) = given.keys().find(|k| !specs.iter().any(|s| s.name == *k)) {
        return Err(ArgError::Unknown {
            name: unknown.clone(),
        });
    }

    let mut values = Map::new();
    for spec in specs {
        let value = match (given.get(spec.name), spec.default) {
            (Some(Value::Null) | None, Some(default)) => default.to_value(),
            (Some(Value::Null) | None, None) => {
                return Err(ArgError::Missing {
                    name: spec.name.to_owned(),
                });
            }
            (Some(value), _) => {
                if !spec.ty.accepts(value) {
                    return Err(ArgError::WrongType {
                        name: spec.name.to_owned(),
                        expected: spec.ty.name(),
                        actual: json_type_name(value),
                    });
                }
                value.clone()
            }
        };
        values.insert(spec.name.to_owned(), value);
    }
    Ok(PluginArgs { values })
}

/// Validated arguments with defaults applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PluginArgs {
    values: Map<String, Value>,
}

impl PluginArgs {
    /// Builds arguments directly, bypassing validation.
    pub fn from_map(values: Map<String, Value>) -> Self {
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name).filter(|v| !v.is_null())
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_i64)
    }

    pub fn float(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Value::as_f64)
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Value::as_bool)
    }

    /// Non-negative integer, e.g. a count or byte size.
    pub fn usize(&self, name: &str) -> Option<usize> {
        self.get(name)
            .and_then(Value::as_u64)
            .and_then(|v| usize::try_from(v).ok())
    }

    /// Seconds (int or float) as a duration. Negative values read as zero.
    pub fn secs(&self, name: &str) -> Option<Duration> {
        self.float(name)
            .and_then(|s| Duration::try_from_secs_f64(s.max(0.0)).ok())
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }
}
