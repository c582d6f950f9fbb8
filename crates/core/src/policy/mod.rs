//! Flow policy: allow/deny rule sets gating which events reach an output.
//!
//! An event passes iff at least one allow rule matches and no deny rule
//! matches. Policies are immutable; a config reload builds new ones.

mod rule;

use std::fmt;

use serde_json::Value;

use crate::error::RuleError;
use crate::event::Event;

pub use rule::{AllRule, HistoryRule, Operator, Rule, RuleCtor, RuleRegistry, check_keys};

/// Allow/deny rule lists for one output.
pub struct FlowPolicy {
    allow: Vec<Box<dyn Rule>>,
    deny: Vec<Box<dyn Rule>>,
}

impl FlowPolicy {
    pub fn new(allow: Vec<Box<dyn Rule>>, deny: Vec<Box<dyn Rule>>) -> Self {
        Self { allow, deny }
    }

    /// Builds both lists from declarative definitions.
    pub fn from_definitions(
        registry: &RuleRegistry,
        allow: &[Value],
        deny: &[Value],
    ) -> Result<Self, RuleError> {
        let build = |defs: &[Value]| -> Result<Vec<Box<dyn Rule>>, RuleError> {
            defs.iter().map(|d| registry.build(d)).collect()
        };
        Ok(Self::new(build(allow)?, build(deny)?))
    }

    /// Policy that lets everything through.
    pub fn allow_all() -> Self {
        Self::new(vec![Box::new(AllRule)], Vec::new())
    }

    pub fn match_event(&self, event: &Event) -> bool {
        self.allow.iter().any(|r| r.match_event(event))
            && !self.deny.iter().any(|r| r.match_event(event))
    }

    pub fn allow_rules(&self) -> usize {
        self.allow.len()
    }

    pub fn deny_rules(&self) -> usize {
        self.deny.len()
    }
}

impl fmt::Debug for FlowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowPolicy")
            .field("allow", &self.allow)
            .field("deny", &self.deny)
            .finish()
    }
}
