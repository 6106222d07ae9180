//! Turning a workflow template plus a parameter set into a graph the engine
//! can execute.
//!
//! Two template encodings are supported:
//!
//! * **structured**: an already-parsed graph. Values are written into fields
//!   of nodes located by their type tag, using a [`BindingTable`]. Both the
//!   engine's API format (`{"<id>": {"class_type", "inputs": {..}}}`) and the
//!   editor's UI format (`{"nodes": [{"type", "widgets_values": [..]}]}`) are
//!   understood.
//! * **textual**: raw JSON text carrying `{{TOKEN}}` sentinels. Every token is
//!   replaced by its bound value and the result is parsed into a graph.
//!
//! Structured updates are lenient: a node type listed in the binding table
//! that the template does not contain is skipped with a debug log, and an
//! absent parameter leaves the template's own value in place. Only the node
//! types the table marks as required make the template unusable when missing.

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("missing parameter {0}")]
    MissingParameter(String),
    #[error("workflow is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("workflow is not a node graph")]
    NotAGraph,
    #[error("required node {0} not found in workflow")]
    MissingNode(String),
    #[error("could not load workflow {name}: {reason}")]
    Load { name: String, reason: String },
}

/// A value the request can bind into a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Param {
    Prompt,
    NegativePrompt,
    Width,
    Height,
    TargetWidth,
    TargetHeight,
    NumFrames,
    Fps,
    Steps,
    GuidanceScale,
    FlowShift,
    Seed,
}

impl Param {
    pub const ALL: [Param; 12] = [
        Param::Prompt,
        Param::NegativePrompt,
        Param::Width,
        Param::Height,
        Param::TargetWidth,
        Param::TargetHeight,
        Param::NumFrames,
        Param::Fps,
        Param::Steps,
        Param::GuidanceScale,
        Param::FlowShift,
        Param::Seed,
    ];

    /// Name used between `{{` `}}` in textual templates.
    pub fn token(self) -> &'static str {
        match self {
            Param::Prompt => "PROMPT",
            Param::NegativePrompt => "NEGATIVE_PROMPT",
            Param::Width => "WIDTH",
            Param::Height => "HEIGHT",
            Param::TargetWidth => "TARGET_WIDTH",
            Param::TargetHeight => "TARGET_HEIGHT",
            Param::NumFrames => "NUM_FRAMES",
            Param::Fps => "FPS",
            Param::Steps => "STEPS",
            Param::GuidanceScale => "GUIDANCE_SCALE",
            Param::FlowShift => "FLOW_SHIFT",
            Param::Seed => "SEED",
        }
    }

    pub fn from_token(token: &str) -> Option<Param> {
        Param::ALL.into_iter().find(|p| p.token() == token)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkflowParams {
    values: BTreeMap<Param, Value>,
}

impl WorkflowParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, param: Param, value: impl Into<Value>) -> Self {
        self.set(param, value);
        self
    }

    pub fn set(&mut self, param: Param, value: impl Into<Value>) {
        self.values.insert(param, value.into());
    }

    pub fn get(&self, param: Param) -> Option<&Value> {
        self.values.get(&param)
    }
}

/// Writes one parameter into one field of the first node with `node_type`.
/// `slot` addresses `widgets_values` in UI-format graphs, `key` addresses
/// `inputs` in API-format graphs.
#[derive(Debug, Clone)]
pub struct Binding {
    pub node_type: &'static str,
    pub slot: usize,
    pub key: &'static str,
    pub param: Param,
}

#[derive(Debug, Clone)]
pub struct BindingTable {
    pub bindings: Vec<Binding>,
    pub required_nodes: Vec<&'static str>,
}

pub const TEXT_ENCODE_NODE: &str = "HyVideoTextEncode";
pub const SAMPLER_NODE: &str = "HyVideoSampler";
pub const VIDEO_COMBINE_NODE: &str = "VHS_VideoCombine";

impl BindingTable {
    /// Bindings for the HunyuanVideo text-to-video graphs.
    pub fn hunyuan() -> Self {
        let b = |node_type, slot, key, param| Binding { node_type, slot, key, param };
        Self {
            bindings: vec![
                b(TEXT_ENCODE_NODE, 0, "prompt", Param::Prompt),
                b(TEXT_ENCODE_NODE, 1, "negative_prompt", Param::NegativePrompt),
                b(SAMPLER_NODE, 0, "width", Param::Width),
                b(SAMPLER_NODE, 1, "height", Param::Height),
                b(SAMPLER_NODE, 2, "num_frames", Param::NumFrames),
                b(SAMPLER_NODE, 3, "steps", Param::Steps),
                b(SAMPLER_NODE, 4, "embedded_guidance_scale", Param::GuidanceScale),
                b(SAMPLER_NODE, 5, "flow_shift", Param::FlowShift),
                b(SAMPLER_NODE, 6, "seed", Param::Seed),
                b(VIDEO_COMBINE_NODE, 0, "frame_rate", Param::Fps),
            ],
            required_nodes: vec![SAMPLER_NODE],
        }
    }
}

/// A fully bound graph, ready to be submitted.
#[derive(Debug, Clone, PartialEq)]
pub struct Workflow(Value);

impl Workflow {
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn to_json_string(&self) -> String {
        self.0.to_string()
    }
}

#[derive(Debug, Clone)]
pub enum TemplateSource {
    Structured(Value),
    Textual(String),
}

#[derive(Debug, Clone)]
pub struct WorkflowTemplate {
    name: String,
    source: TemplateSource,
    bindings: BindingTable,
}

impl WorkflowTemplate {
    pub fn structured(name: impl Into<String>, graph: Value) -> Result<Self, TemplateError> {
        if !graph.is_object() {
            return Err(TemplateError::NotAGraph);
        }
        Ok(Self {
            name: name.into(),
            source: TemplateSource::Structured(graph),
            bindings: BindingTable::hunyuan(),
        })
    }

    pub fn textual(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: TemplateSource::Textual(text.into()),
            bindings: BindingTable::hunyuan(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &TemplateSource {
        &self.source
    }

    /// Produce a private, fully bound copy of this template. Pure: the same
    /// template and parameters always give the same graph.
    pub fn materialize(&self, params: &WorkflowParams) -> Result<Workflow, TemplateError> {
        match &self.source {
            TemplateSource::Structured(graph) => {
                let mut graph = graph.clone();
                apply_bindings(&mut graph, &self.bindings, params)?;
                Ok(Workflow(graph))
            }
            TemplateSource::Textual(text) => {
                let bound = substitute_tokens(text, params)?;
                let graph: Value = serde_json::from_str(&bound)?;
                match &graph {
                    Value::Object(nodes) if !nodes.is_empty() => Ok(Workflow(graph)),
                    _ => Err(TemplateError::NotAGraph),
                }
            }
        }
    }
}

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\{([A-Z][A-Z0-9_]*)\}\}").expect("token pattern is valid"))
}

/// Names of every `{{TOKEN}}` in `text`, in first-seen order.
pub fn declared_tokens(text: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for caps in token_pattern().captures_iter(text) {
        let token = caps[1].to_string();
        if !seen.contains(&token) {
            seen.push(token);
        }
    }
    seen
}

/// Replace every declared token with its bound value. Fails before anything
/// is replaced if a token has no value. Strings are inserted JSON-escaped
/// without quotes, so the sentinel is expected to sit inside a string literal.
pub fn substitute_tokens(text: &str, params: &WorkflowParams) -> Result<String, TemplateError> {
    let mut rendered: HashMap<String, String> = HashMap::new();
    for token in declared_tokens(text) {
        let value = Param::from_token(&token)
            .and_then(|param| params.get(param))
            .ok_or_else(|| TemplateError::MissingParameter(token.clone()))?;
        rendered.insert(token, render_value(value));
    }

    // single pass, so a value containing a sentinel is never expanded again
    let bound = token_pattern().replace_all(text, |caps: &Captures| {
        rendered.get(&caps[1]).cloned().unwrap_or_else(|| caps[0].to_string())
    });
    Ok(bound.into_owned())
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => {
            let quoted = Value::String(s.clone()).to_string();
            quoted[1..quoted.len() - 1].to_string()
        }
        other => other.to_string(),
    }
}

enum NodeFields<'a> {
    Slots(&'a mut Vec<Value>),
    Keys(&'a mut Map<String, Value>),
}

fn is_ui_format(graph: &Value) -> bool {
    graph.get("nodes").map_or(false, Value::is_array)
}

/// Fields of the first node tagged `node_type`, if any.
fn find_node<'a>(graph: &'a mut Value, node_type: &str) -> Option<NodeFields<'a>> {
    if is_ui_format(graph) {
        graph
            .get_mut("nodes")?
            .as_array_mut()?
            .iter_mut()
            .find(|node| node.get("type").and_then(Value::as_str) == Some(node_type))?
            .get_mut("widgets_values")?
            .as_array_mut()
            .map(NodeFields::Slots)
    } else {
        graph
            .as_object_mut()?
            .values_mut()
            .find(|node| node.get("class_type").and_then(Value::as_str) == Some(node_type))?
            .get_mut("inputs")?
            .as_object_mut()
            .map(NodeFields::Keys)
    }
}

fn has_node(graph: &Value, node_type: &str) -> bool {
    if is_ui_format(graph) {
        graph["nodes"]
            .as_array()
            .map_or(false, |nodes| nodes.iter().any(|n| n.get("type").and_then(Value::as_str) == Some(node_type)))
    } else {
        graph
            .as_object()
            .map_or(false, |nodes| nodes.values().any(|n| n.get("class_type").and_then(Value::as_str) == Some(node_type)))
    }
}

/// Write every bound parameter into its node field, in place.
pub fn apply_bindings(graph: &mut Value, table: &BindingTable, params: &WorkflowParams) -> Result<(), TemplateError> {
    for required in &table.required_nodes {
        if !has_node(graph, required) {
            return Err(TemplateError::MissingNode(required.to_string()));
        }
    }

    for binding in &table.bindings {
        let Some(value) = params.get(binding.param) else {
            continue;
        };
        match find_node(graph, binding.node_type) {
            None => {
                debug!(node_type = binding.node_type, param = ?binding.param, "node not in template, update skipped");
            }
            Some(NodeFields::Slots(slots)) => match slots.get_mut(binding.slot) {
                Some(slot) => *slot = value.clone(),
                None => debug!(node_type = binding.node_type, slot = binding.slot, "widget slot absent, update skipped"),
            },
            Some(NodeFields::Keys(inputs)) => match inputs.get_mut(binding.key) {
                Some(field) => *field = value.clone(),
                None => debug!(node_type = binding.node_type, key = binding.key, "input absent, update skipped"),
            },
        }
    }
    Ok(())
}
