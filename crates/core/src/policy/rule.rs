//! Flow policy rules and the rule registry.
//!
//! A rule is built from a declarative mapping such as
//! `{rule: history, plugin_id: logs, position: -1}`. The `rule` key selects
//! the constructor; every other key is a keyword argument the constructor
//! must recognize. Unknown rules and stray keys fail at construction.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::{Map, Value};

use crate::error::RuleError;
use crate::event::{Event, ProcessStage};

/// Builds a rule from its keyword arguments (the `rule` key removed).
pub type RuleCtor = fn(&Map<String, Value>) -> Result<Box<dyn Rule>, RuleError>;

/// A predicate over events.
pub trait Rule: Send + Sync + fmt::Debug {
    /// Registered name of the rule.
    fn name(&self) -> &'static str;

    fn match_event(&self, event: &Event) -> bool;
}

/// Rejects keyword arguments outside `accepted`.
pub fn check_keys(
    rule: &str,
    args: &Map<String, Value>,
    accepted: &[&str],
) -> Result<(), RuleError> {
    match args.keys().find(|k| !accepted.contains(&k.as_str())) {
        Some(key) => Err(RuleError::UnknownKey {
            rule: rule.to_owned(),
            key: key.clone(),
        }),
        None => Ok(()),
    }
}

// ─── AllRule ─────────────────────────────────────────────────────────

/// Matches every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllRule;

impl AllRule {
    pub const NAME: &'static str = "all";

    pub fn build(args: &Map<String, Value>) -> Result<Box<dyn Rule>, RuleError> {
        check_keys(Self::NAME, args, &[])?;
        Ok(Box::new(Self))
    }
}

impl Rule for AllRule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn match_event(&self, _event: &Event) -> bool {
        true
    }
}

// ─── HistoryRule ─────────────────────────────────────────────────────

/// Comparison applied to a stage field.
///
/// Only equality exists today.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operator {
    Eq(String),
}

impl Operator {
    fn test(&self, actual: &str) -> bool {
        match self {
            Self::Eq(expected) => actual == expected,
        }
    }
}

/// Matches on the event's hop history.
///
/// Without `position`, matches if any stage satisfies every constraint.
/// With `position`, only that stage is checked; negative positions count
/// from the end (`-1` is the latest hop).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRule {
    position: Option<i64>,
    constraints: Vec<(&'static str, Operator)>,
}

impl HistoryRule {
    pub const NAME: &'static str = "history";

    const FIELDS: [&'static str; 4] = ["node_id", "plugin_id", "plugin_type", "target"];

    pub fn build(args: &Map<String, Value>) -> Result<Box<dyn Rule>, RuleError> {
        let mut accepted = vec!["position"];
        accepted.extend(Self::FIELDS);
        check_keys(Self::NAME, args, &accepted)?;

        let position = match args.get("position") {
            None | Some(Value::Null) => None,
            Some(value) => Some(value.as_i64().ok_or_else(|| RuleError::InvalidValue {
                rule: Self::NAME.to_owned(),
                key: "position".to_owned(),
                reason: "must be an integer".to_owned(),
            })?),
        };

        let mut constraints = Vec::new();
        for field in Self::FIELDS {
            let Some(value) = args.get(field) else {
                continue;
            };
            let expected = value.as_str().ok_or_else(|| RuleError::InvalidValue {
                rule: Self::NAME.to_owned(),
                key: field.to_owned(),
                reason: "must be a string".to_owned(),
            })?;
            constraints.push((field, Operator::Eq(expected.to_owned())));
        }

        Ok(Box::new(Self {
            position,
            constraints,
        }))
    }

    fn stage_matches(&self, stage: &ProcessStage) -> bool {
        self.constraints
            .iter()
            .all(|(field, op)| stage.field(field).is_some_and(|actual| op.test(actual)))
    }
}

impl Rule for HistoryRule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn match_event(&self, event: &Event) -> bool {
        let history = event.history();
        match self.position {
            None => history.iter().any(|stage| self.stage_matches(stage)),
            Some(pos) => {
                let len = history.len() as i64;
                let index = if pos < 0 { len + pos } else { pos };
                usize::try_from(index)
                    .ok()
                    .and_then(|i| history.get(i))
                    .is_some_and(|stage| self.stage_matches(stage))
            }
        }
    }
}

// ─── RuleRegistry ────────────────────────────────────────────────────

/// Name → constructor table for rules.
///
/// Constructed explicitly; there is no process-wide registry.
#[derive(Clone)]
pub struct RuleRegistry {
    ctors: BTreeMap<String, RuleCtor>,
}

impl RuleRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            ctors: BTreeMap::new(),
        }
    }

    /// Registry with `all` and `history`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(AllRule::NAME, AllRule::build);
        registry.register(HistoryRule::NAME, HistoryRule::build);
        registry
    }

    /// Adds or replaces a rule constructor.
    pub fn register(&mut self, name: impl Into<String>, ctor: RuleCtor) {
        self.ctors.insert(name.into(), ctor);
    }

    /// Builds a rule from `{rule: <name>, ...}`.
    pub fn build(&self, definition: &Value) -> Result<Box<dyn Rule>, RuleError> {
        let Value::Object(map) = definition else {
            return Err(RuleError::NotAMapping);
        };
        let name = map
            .get("rule")
            .and_then(Value::as_str)
            .ok_or(RuleError::MissingName)?;
        let ctor = self
            .ctors
            .get(name)
            .ok_or_else(|| RuleError::UnknownRule(name.to_owned()))?;

        let mut args = map.clone();
        args.remove("rule");
        ctor(&args)
    }
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
