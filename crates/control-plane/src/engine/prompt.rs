//! Prompt compilation: templates plus projected inputs into a [`ChatRequest`].

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

use super::provider::{ChatMessage, ChatRequest, ResponseFormat};
use super::state::StateSnapshot;
use crate::execir::{InputBinding, LlmWriteNode, Projection, PromptTemplate, StateRef};

static TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([^{}\s]+)\s*\}\}").expect("token regex should compile"));

const DEFAULT_SYSTEM: &str =
    "You produce structured output for an automated workflow. Respond with JSON only, no prose.";

const REPAIR_SYSTEM: &str = "You repair invalid structured outputs. Return only the corrected JSON value, with no explanation.";

const REPAIR_TEMPLATE: &str = "The previous output failed validation.\n\n\
Error:\n{{error}}\n\n\
Previous output:\n{{previous_output}}\n\n\
Expected schema:\n{{expected_schema}}\n\n\
Return a corrected JSON value that satisfies the schema.";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PromptError {
    #[error("prompt template not found: {0}")]
    MissingTemplate(String),
}

/// Inputs to the fixed repair prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairPacket {
    pub error: String,
    pub previous_output: String,
    pub expected_schema: Value,
}

/// Compiles `LLM_WRITE` nodes against the program's templates.
pub struct PromptCompiler<'p> {
    templates: &'p BTreeMap<String, PromptTemplate>,
}

impl<'p> PromptCompiler<'p> {
    pub fn new(templates: &'p BTreeMap<String, PromptTemplate>) -> Self {
        Self { templates }
    }

    /// Build the model request for `node`.
    ///
    /// Declared inputs are resolved against `snapshot` and override any
    /// entry of the same name in `resolved_inputs`.
    pub fn compile(
        &self,
        node: &LlmWriteNode,
        resolved_inputs: &Map<String, Value>,
        snapshot: &StateSnapshot,
    ) -> Result<ChatRequest, PromptError> {
        let template = self
            .templates
            .get(&node.prompt_template_id)
            .ok_or_else(|| PromptError::MissingTemplate(node.prompt_template_id.clone()))?;

        let mut inputs = resolved_inputs.clone();
        for (name, binding) in &node.inputs {
            let value = match binding {
                InputBinding::Projection(projection) => apply_projection(projection, snapshot),
                InputBinding::Literal(value) => value.clone(),
            };
            inputs.insert(name.clone(), value);
        }

        let mut system = match &template.system {
            Some(system) => render(system, &inputs, snapshot),
            None => DEFAULT_SYSTEM.to_string(),
        };
        if let Some(ref schema) = node.output_schema {
            system.push_str("\n\nThe JSON must satisfy this schema:\n");
            system.push_str(&pretty(schema));
        }

        let response_format = match (&node.output_schema, node.validators.is_empty()) {
            (Some(schema), _) => Some(ResponseFormat::JsonSchema {
                schema: schema.clone(),
            }),
            (None, false) => Some(ResponseFormat::JsonObject),
            (None, true) => None,
        };

        Ok(ChatRequest {
            model_class: node.model_class.clone(),
            messages: vec![
                ChatMessage::system(system),
                ChatMessage::user(render(&template.user, &inputs, snapshot)),
            ],
            response_format,
        })
    }

    /// Build the fixed repair request.
    pub fn compile_repair(model_class: &str, packet: &RepairPacket) -> ChatRequest {
        let mut fields = Map::new();
        fields.insert("error".to_string(), Value::String(packet.error.clone()));
        fields.insert(
            "previous_output".to_string(),
            Value::String(packet.previous_output.clone()),
        );
        fields.insert("expected_schema".to_string(), packet.expected_schema.clone());

        let response_format = match &packet.expected_schema {
            Value::Null => Some(ResponseFormat::JsonObject),
            schema => Some(ResponseFormat::JsonSchema {
                schema: schema.clone(),
            }),
        };

        ChatRequest {
            model_class: model_class.to_string(),
            messages: vec![
                ChatMessage::system(REPAIR_SYSTEM),
                ChatMessage::user(render(REPAIR_TEMPLATE, &fields, &StateSnapshot::default())),
            ],
            response_format,
        }
    }
}

/// Resolve a projection: `pick`, then `truncate_items`, then `truncate_chars`.
pub fn apply_projection(projection: &Projection, snapshot: &StateSnapshot) -> Value {
    let mut value = snapshot
        .get(&projection.reference)
        .cloned()
        .unwrap_or(Value::Null);

    if let (Some(keys), Value::Object(map)) = (&projection.pick, &mut value) {
        map.retain(|k, _| keys.contains(k));
    }
    if let (Some(n), Value::Array(items)) = (projection.truncate_items, &mut value) {
        items.truncate(n);
    }
    if let (Some(n), Value::String(s)) = (projection.truncate_chars, &mut value) {
        if s.chars().count() > n {
            *s = s.chars().take(n).collect();
        }
    }
    value
}

/// Substitute `{{token}}` occurrences. Strings are inserted verbatim,
/// other values as pretty JSON, missing tokens as `null`.
pub fn render(template: &str, inputs: &Map<String, Value>, snapshot: &StateSnapshot) -> String {
    TOKEN
        .replace_all(template, |caps: &Captures<'_>| {
            let token = &caps[1];
            match lookup(token, inputs, snapshot) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => pretty(other),
                None => "null".to_string(),
            }
        })
        .into_owned()
}

fn lookup<'a>(token: &str, inputs: &'a Map<String, Value>, snapshot: &'a StateSnapshot) -> Option<&'a Value> {
    if token.starts_with('$') {
        let reference = StateRef::parse(token).ok()?;
        return snapshot.get(&reference);
    }

    let mut segments = token.split('.');
    let mut current = inputs.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
