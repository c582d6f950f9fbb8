#![no_main]

use arbitrary::Arbitrary;
use instalog_core::event::ProcessStage;
use instalog_core::plugin::PluginKind;
use instalog_core::{Event, FlowPolicy, RuleRegistry};
use libfuzzer_sys::fuzz_target;
use serde_json::{Value, json};

#[derive(Arbitrary, Debug)]
struct FuzzInput {
    /// Raw rule definitions, tried as JSON
    allow: Vec<String>,
    deny: Vec<String>,
    /// History stages as (node_id, plugin_id, target)
    stages: Vec<(String, String, String)>,
}

fuzz_target!(|input: FuzzInput| {
    if input.allow.len() > 8 || input.deny.len() > 8 || input.stages.len() > 16 {
        return;
    }
    let parse = |defs: &[String]| -> Vec<Value> {
        defs.iter()
            .filter_map(|d| serde_json::from_str(d).ok())
            .collect()
    };

    let registry = RuleRegistry::with_builtins();
    let Ok(policy) = FlowPolicy::from_definitions(&registry, &parse(&input.allow), &parse(&input.deny))
    else {
        return;
    };

    let mut event = Event::from_value(json!({"fuzz": true})).expect("object payload");
    for (node_id, plugin_id, target) in input.stages {
        event.append_stage(ProcessStage::now(node_id, plugin_id, PluginKind::Input, target));
    }
    let _ = policy.match_event(&event);
});
