//! ExecIR: the compiled, immutable program consumed by the runner.
//!
//! A program is produced once by the lowering pipeline and never mutated.
//! Its JSON form is the primary storage and wire format, so every map is
//! ordered and optional fields are skipped when empty to keep lowering
//! byte-for-byte deterministic.

mod state_ref;

pub use state_ref::{Namespace, StateRef, StateRefError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Current ExecIR format version.
pub const EXEC_IR_VERSION: &str = "execir/v1";

/// Hard ceiling on repair attempts regardless of configured retry policy.
pub const MAX_REPAIR_ATTEMPTS: u32 = 3;

/// A compiled workflow program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecProgram {
    pub version: String,
    pub entry_node: String,
    pub nodes: Vec<ExecNode>,
    pub edges: Vec<ExecEdge>,
    /// Prompt templates required by `LLM_WRITE` nodes, keyed by template id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub templates: BTreeMap<String, PromptTemplate>,
}

impl ExecProgram {
    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&ExecNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Outgoing edges of a node in program order.
    pub fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a ExecEdge> + 'a {
        self.edges.iter().filter(move |e| e.from == id)
    }
}

/// One executable node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecNode {
    pub id: String,
    #[serde(flatten)]
    pub op: ExecOp,
}

/// Operation carried by a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecOp {
    Start,
    End,
    LlmWrite(LlmWriteNode),
    Switch(SwitchNode),
    ToolCall(ToolCallNode),
    VarSet(VarSetNode),
    VarGet(VarGetNode),
    Transform(TransformNode),
}

impl ExecOp {
    /// Wire name of the operation.
    pub fn name(&self) -> &'static str {
        match self {
            ExecOp::Start => "START",
            ExecOp::End => "END",
            ExecOp::LlmWrite(_) => "LLM_WRITE",
            ExecOp::Switch(_) => "SWITCH",
            ExecOp::ToolCall(_) => "TOOL_CALL",
            ExecOp::VarSet(_) => "VAR_SET",
            ExecOp::VarGet(_) => "VAR_GET",
            ExecOp::Transform(_) => "TRANSFORM",
        }
    }
}

/// Model-backed structured write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmWriteNode {
    pub model_class: String,
    pub prompt_template_id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, InputBinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validators: Vec<ValidatorSpec>,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_policy: Option<EscalationPolicy>,
    #[serde(default)]
    pub outputs: NodeOutputs,
}

/// How a prompt input is obtained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputBinding {
    Projection(Projection),
    Literal(Value),
}

/// A state reference narrowed before it reaches the prompt.
///
/// Applied in fixed order: `pick`, then `truncate_items`, then `truncate_chars`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Projection {
    #[serde(rename = "ref")]
    pub reference: StateRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pick: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncate_items: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncate_chars: Option<usize>,
}

/// Output check attached to an `LLM_WRITE` node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValidatorSpec {
    JsonSchema { schema: Value },
    Invariant { expression: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Attempts the repair engine will actually make.
    pub fn effective_attempts(&self) -> u32 {
        self.max_attempts.min(MAX_REPAIR_ATTEMPTS)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 2 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationPolicy {
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_model_class: Option<String>,
}

/// Where a node's result is written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeOutputs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<StateRef>,
}

/// Branch point. Carries question metadata when lowered from an
/// ask-user-question node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwitchNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<QuestionSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionSpec {
    pub question: String,
    pub options: Vec<QuestionOption>,
    /// State path the caller must populate before the run can continue.
    pub target: StateRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub label: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallNode {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub outputs: NodeOutputs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarSetNode {
    pub target: StateRef,
    pub value: Operand,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarGetNode {
    pub source: StateRef,
    pub target: StateRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformNode {
    pub expression: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<StateRef>,
    pub target: StateRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecEdge {
    pub from: String,
    pub to: String,
    pub condition: EdgeCondition,
}

impl ExecEdge {
    pub fn always(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::Always,
        }
    }
}

/// Edge guard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EdgeCondition {
    Always,
    Eq { left: Operand, right: Operand },
    Neq { left: Operand, right: Operand },
    Contains { left: Operand, right: Operand },
    Regex { left: Operand, right: Operand },
}

impl EdgeCondition {
    pub fn is_always(&self) -> bool {
        matches!(self, EdgeCondition::Always)
    }
}

/// Literal value or state reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Operand {
    Ref {
        #[serde(rename = "ref")]
        reference: StateRef,
    },
    Literal {
        literal: Value,
    },
}

impl Operand {
    pub fn literal(value: impl Into<Value>) -> Self {
        Operand::Literal {
            literal: value.into(),
        }
    }

    pub fn reference(reference: StateRef) -> Self {
        Operand::Ref { reference }
    }
}

/// Prompt template referenced by `LlmWriteNode::prompt_template_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub user: String,
}
