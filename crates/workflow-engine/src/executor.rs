//! Step executor contract and built-in node handlers
//!
//! Only Shell and Agent nodes leave the engine: they are handed to a
//! host-provided [`StepExecutor`]. Every other kind is evaluated in-process
//! by the pure handlers below.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{EngineError, Result};
use crate::events::{EventSink, WorkflowEvent};
use crate::ordering::render_template;
use crate::types::{AccumulatorConfig, NodeId, NodeKind};

/// Everything an external executor needs to run one node
#[derive(Debug, Clone, PartialEq)]
pub struct StepRequest {
    pub run_id: String,
    pub node_id: NodeId,
    /// Kind and configuration of the node
    pub kind: NodeKind,
    /// The node's template with ordinal and variable placeholders filled in
    pub text: String,
    /// Upstream results ordered by edge ordinal
    pub inputs: Vec<String>,
    /// Snapshot of the variable scope at dispatch time
    pub variables: HashMap<String, String>,
}

/// Handle an executor uses to stream intermediate status
#[derive(Clone)]
pub struct StepContext {
    run_id: String,
    node_id: NodeId,
    events: Arc<dyn EventSink>,
}

impl StepContext {
    pub fn new(run_id: impl Into<String>, node_id: impl Into<String>, events: Arc<dyn EventSink>) -> Self {
        Self {
            run_id: run_id.into(),
            node_id: node_id.into(),
            events,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Report intermediate progress for this node
    pub fn progress(&self, message: impl Into<String>) {
        let event = WorkflowEvent::NodeProgress {
            run_id: self.run_id.clone(),
            node_id: self.node_id.clone(),
            message: message.into(),
        };
        if let Err(e) = self.events.send(event) {
            log::debug!("Dropping progress for '{}': {}", self.node_id, e);
        }
    }
}

/// Runs Shell and Agent nodes on behalf of the engine
///
/// Implementations return the node's text result, or an error that is
/// recorded on the node. Cancellation happens by dropping the future, so
/// implementations must not rely on running to completion.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, request: StepRequest, context: StepContext) -> Result<String>;
}

/// Output of a built-in handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltinOutput {
    pub value: String,
    /// Set by IfElse nodes
    pub condition: Option<bool>,
}

impl BuiltinOutput {
    fn value(value: String) -> Self {
        Self {
            value,
            condition: None,
        }
    }
}

/// Inputs joined the way pass-through nodes present them
pub fn join_inputs(inputs: &[String]) -> String {
    inputs.join("\n")
}

/// Render a template, or pass the inputs through when it is empty
fn render_or_join(template: &str, inputs: &[String], variables: &HashMap<String, String>) -> String {
    if template.trim().is_empty() {
        join_inputs(inputs)
    } else {
        render_template(template, inputs, variables)
    }
}

/// Append the joined inputs to an accumulator's value
///
/// `previous` is the value from the prior iteration; on the first
/// iteration the configured initial value is the seed.
pub fn accumulate(config: &AccumulatorConfig, previous: Option<&str>, inputs: &[String]) -> String {
    let seed = previous.unwrap_or(&config.initial_value);
    let addition = join_inputs(inputs);
    match (seed.is_empty(), addition.is_empty()) {
        (true, _) => addition,
        (false, true) => seed.to_string(),
        (false, false) => format!("{}{}{}", seed, config.separator, addition),
    }
}

/// Evaluate a rendered IfElse condition
///
/// `a == b` and `a != b` compare trimmed operands; anything else is truthy
/// unless it is empty, `false`, `0` or `no`.
pub fn evaluate_condition(rendered: &str) -> bool {
    if let Some((lhs, rhs)) = rendered.split_once("!=") {
        return lhs.trim() != rhs.trim();
    }
    if let Some((lhs, rhs)) = rendered.split_once("==") {
        return lhs.trim() == rhs.trim();
    }
    let value = rendered.trim().to_ascii_lowercase();
    !matches!(value.as_str(), "" | "false" | "0" | "no")
}

/// Evaluate a node that does not leave the engine
///
/// `accumulated` carries an Accumulator's value from the previous loop
/// iteration.
pub fn evaluate_builtin(
    kind: &NodeKind,
    inputs: &[String],
    variables: &HashMap<String, String>,
    accumulated: Option<&str>,
) -> Result<BuiltinOutput> {
    let output = match kind {
        NodeKind::Text(config) => BuiltinOutput::value(render_template(&config.content, inputs, variables)),
        NodeKind::Preview(config) => BuiltinOutput::value(render_or_join(&config.content, inputs, variables)),
        NodeKind::Variable(config) => BuiltinOutput::value(render_or_join(&config.content, inputs, variables)),
        NodeKind::Accumulator(config) => BuiltinOutput::value(accumulate(config, accumulated, inputs)),
        NodeKind::IfElse(config) => {
            let rendered = render_template(&config.condition, inputs, variables);
            BuiltinOutput {
                value: join_inputs(inputs),
                condition: Some(evaluate_condition(&rendered)),
            }
        }
        NodeKind::LoopStart(_) | NodeKind::LoopEnd | NodeKind::SubflowInput(_) | NodeKind::SubflowOutput(_) => {
            BuiltinOutput::value(join_inputs(inputs))
        }
        NodeKind::Shell(_) | NodeKind::Agent(_) | NodeKind::Subflow(_) => {
            return Err(EngineError::failed(format!(
                "{} nodes are not evaluated in-process",
                kind.name()
            )));
        }
    };
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::VecEventSink;
    use crate::types::{IfElseConfig, PreviewConfig, TextConfig, VariableConfig};

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_text_renders_placeholders() {
        let kind = NodeKind::Text(TextConfig {
            content: "Hello ${1}, on ${branch}".to_string(),
        });
        let mut vars = HashMap::new();
        vars.insert("branch".to_string(), "main".to_string());

        let out = evaluate_builtin(&kind, &strings(&["Ada"]), &vars, None).unwrap();
        assert_eq!(out.value, "Hello Ada, on main");
        assert_eq!(out.condition, None);
    }

    #[test]
    fn test_preview_and_variable_pass_inputs_through() {
        let preview = NodeKind::Preview(PreviewConfig::default());
        let out = evaluate_builtin(&preview, &strings(&["a", "b"]), &HashMap::new(), None).unwrap();
        assert_eq!(out.value, "a\nb");

        let variable = NodeKind::Variable(VariableConfig {
            name: "x".to_string(),
            content: String::new(),
        });
        let out = evaluate_builtin(&variable, &strings(&["v"]), &HashMap::new(), None).unwrap();
        assert_eq!(out.value, "v");
    }

    #[test]
    fn test_accumulator_seeds_then_appends() {
        let config = AccumulatorConfig {
            name: "log".to_string(),
            initial_value: "start".to_string(),
            separator: ", ".to_string(),
        };
        let first = accumulate(&config, None, &strings(&["one"]));
        assert_eq!(first, "start, one");
        let second = accumulate(&config, Some(&first), &strings(&["two"]));
        assert_eq!(second, "start, one, two");

        let empty_seed = AccumulatorConfig {
            initial_value: String::new(),
            ..config
        };
        assert_eq!(accumulate(&empty_seed, None, &strings(&["x"])), "x");
    }

    #[test]
    fn test_conditions() {
        assert!(evaluate_condition("yes == yes"));
        assert!(!evaluate_condition("yes == no"));
        assert!(evaluate_condition(" a != b "));
        assert!(evaluate_condition("anything"));
        assert!(!evaluate_condition("False"));
        assert!(!evaluate_condition("0"));
        assert!(!evaluate_condition("  "));

        let kind = NodeKind::IfElse(IfElseConfig {
            condition: "${1} == ok".to_string(),
        });
        let out = evaluate_builtin(&kind, &strings(&["ok"]), &HashMap::new(), None).unwrap();
        assert_eq!(out.condition, Some(true));
        assert_eq!(out.value, "ok");
    }

    #[test]
    fn test_external_kinds_rejected() {
        let kind = NodeKind::Shell(crate::types::ShellConfig {
            command: "ls".to_string(),
            needs_user_approval: false,
        });
        assert!(evaluate_builtin(&kind, &[], &HashMap::new(), None).is_err());
    }

    #[test]
    fn test_context_streams_progress() {
        let sink = Arc::new(VecEventSink::new());
        let context = StepContext::new("run", "n1", sink.clone());
        context.progress("halfway");

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            WorkflowEvent::NodeProgress { node_id, message, .. } if node_id == "n1" && message == "halfway"
        ));
    }
}
