//! Per-node-type lowering.
//!
//! Each [`NodeKind`] has exactly one lowerer, selected by an exhaustive
//! match. Branching kinds emit their own conditioned edges; the pipeline
//! appends `always` edges for everything else.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

use super::document::{NodeKind, WorkflowEdge, WorkflowNode};
use super::error::GraphValidationError;
use crate::execir::{
    EdgeCondition, EscalationPolicy, ExecEdge, ExecNode, ExecOp, InputBinding, LlmWriteNode,
    Namespace, NodeOutputs, Operand, Projection, PromptTemplate, QuestionOption, QuestionSpec,
    RetryPolicy, StateRef, SwitchNode, ToolCallNode, TransformNode, ValidatorSpec, VarGetNode,
    VarSetNode,
};
use crate::template::ExpressionEvaluator;

type LowerResult<T> = Result<T, GraphValidationError>;

/// What a lowerer sees: the node and its outgoing graph edges in document order.
pub struct LoweringContext<'a> {
    pub node: &'a WorkflowNode,
    pub outgoing: &'a [&'a WorkflowEdge],
}

/// Output of one lowerer.
#[derive(Debug, Default)]
pub struct LoweredNode {
    pub exec_nodes: Vec<ExecNode>,
    pub exec_edges: Vec<ExecEdge>,
    pub required_template_ids: Vec<String>,
    pub templates: BTreeMap<String, PromptTemplate>,
}

impl LoweredNode {
    fn single(id: &str, op: ExecOp) -> Self {
        Self {
            exec_nodes: vec![ExecNode {
                id: id.to_string(),
                op,
            }],
            ..Default::default()
        }
    }
}

/// Lower one node.
pub fn lower_node(kind: NodeKind, ctx: &LoweringContext<'_>) -> LowerResult<LoweredNode> {
    match kind {
        NodeKind::Start => Ok(LoweredNode::single(&ctx.node.id, ExecOp::Start)),
        NodeKind::End => Ok(LoweredNode::single(&ctx.node.id, ExecOp::End)),
        NodeKind::Llm => lower_llm(ctx),
        NodeKind::IfElse => lower_if_else(ctx),
        NodeKind::Switch => lower_switch(ctx),
        NodeKind::AskUserQuestion => lower_ask_user_question(ctx),
        NodeKind::Tool => lower_tool(ctx),
        NodeKind::SetVariable => lower_set_variable(ctx),
        NodeKind::GetVariable => lower_get_variable(ctx),
        NodeKind::Transform => lower_transform(ctx),
    }
}

fn parse_data<T: DeserializeOwned>(node: &WorkflowNode) -> LowerResult<T> {
    let data = match &node.data {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };
    serde_json::from_value(data).map_err(|e| GraphValidationError::invalid_node(&node.id, e.to_string()))
}

/// Resolve a target path. Bare names land in `default`.
fn state_path(node_id: &str, raw: &str, default: Namespace) -> LowerResult<StateRef> {
    let parsed = if raw.starts_with('$') {
        StateRef::parse(raw)
    } else {
        StateRef::parse(&format!("{}.{}", default.prefix(), raw))
    };
    parsed.map_err(|e| GraphValidationError::invalid_node(node_id, e.to_string()))
}

fn writable_path(node_id: &str, raw: &str) -> LowerResult<StateRef> {
    let target = state_path(node_id, raw, Namespace::Vars)?;
    if !target.is_writable() {
        return Err(GraphValidationError::invalid_node(
            node_id,
            format!("cannot write to read-only namespace {}", target.namespace()),
        ));
    }
    Ok(target)
}

/// Authoring operand: namespace-prefixed strings are refs, explicit
/// `{ref}`/`{literal}` objects are taken as-is, anything else is a literal.
fn authoring_operand(node_id: &str, value: &Value) -> LowerResult<Operand> {
    match value {
        Value::String(s) if StateRef::looks_like_ref(s) => StateRef::parse(s)
            .map(Operand::reference)
            .map_err(|e| GraphValidationError::invalid_node(node_id, e.to_string())),
        Value::Object(map)
            if map.len() == 1 && (map.contains_key("ref") || map.contains_key("literal")) =>
        {
            serde_json::from_value(value.clone())
                .map_err(|e| GraphValidationError::invalid_node(node_id, e.to_string()))
        }
        other => Ok(Operand::literal(other.clone())),
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ConditionOp {
    #[default]
    Eq,
    Neq,
    Contains,
    Regex,
}

#[derive(Debug, Clone, Deserialize)]
struct ConditionData {
    #[serde(default, alias = "operator")]
    op: ConditionOp,
    left: Value,
    #[serde(default)]
    right: Value,
}

fn build_condition(node_id: &str, data: &ConditionData) -> LowerResult<EdgeCondition> {
    let left = authoring_operand(node_id, &data.left)?;
    let right = authoring_operand(node_id, &data.right)?;

    if let (ConditionOp::Regex, Operand::Literal { literal: Value::String(pattern) }) = (data.op, &right) {
        regex::Regex::new(pattern).map_err(|e| GraphValidationError::invalid_node(node_id, e.to_string()))?;
    }

    Ok(match data.op {
        ConditionOp::Eq => EdgeCondition::Eq { left, right },
        ConditionOp::Neq => EdgeCondition::Neq { left, right },
        ConditionOp::Contains => EdgeCondition::Contains { left, right },
        ConditionOp::Regex => EdgeCondition::Regex { left, right },
    })
}

/// Emit one edge per outgoing graph edge; `pick` returns the condition for
/// a handle, `None` meaning the default branch.
fn branch_edges<F>(ctx: &LoweringContext<'_>, mut pick: F) -> Vec<ExecEdge>
where
    F: FnMut(Option<&str>) -> Option<EdgeCondition>,
{
    ctx.outgoing
        .iter()
        .map(|edge| ExecEdge {
            from: edge.source.clone(),
            to: edge.target.clone(),
            condition: pick(edge.source_handle.as_deref()).unwrap_or(EdgeCondition::Always),
        })
        .collect()
}

fn default_model_class() -> String {
    "default".to_string()
}

#[derive(Debug, Deserialize)]
struct LlmData {
    #[serde(default = "default_model_class", alias = "modelClass")]
    model_class: String,
    #[serde(default)]
    system: Option<String>,
    #[serde(alias = "prompt")]
    instruction: String,
    #[serde(default)]
    inputs: BTreeMap<String, Value>,
    #[serde(default, alias = "outputSchema")]
    output_schema: Option<Value>,
    #[serde(default)]
    validators: Vec<ValidatorSpec>,
    #[serde(default, alias = "retryPolicy")]
    retry_policy: Option<RetryPolicy>,
    #[serde(default, alias = "escalationPolicy")]
    escalation_policy: Option<EscalationPolicy>,
    #[serde(default)]
    output: Option<String>,
}

fn lower_llm(ctx: &LoweringContext<'_>) -> LowerResult<LoweredNode> {
    let node_id = ctx.node.id.as_str();
    let data: LlmData = parse_data(ctx.node)?;

    let mut inputs = BTreeMap::new();
    for (name, raw) in data.inputs {
        let binding = match &raw {
            Value::String(s) if StateRef::looks_like_ref(s) => InputBinding::Projection(Projection {
                reference: state_path(node_id, s, Namespace::Vars)?,
                pick: None,
                truncate_items: None,
                truncate_chars: None,
            }),
            _ => serde_json::from_value(raw)
                .map_err(|e| GraphValidationError::invalid_node(node_id, e.to_string()))?,
        };
        inputs.insert(name, binding);
    }

    let mut validators = data.validators;
    if let Some(ref schema) = data.output_schema {
        jsonschema::JSONSchema::compile(schema).map_err(|e| {
            GraphValidationError::invalid_node(node_id, format!("invalid output schema: {}", e))
        })?;
        let declared = validators
            .iter()
            .any(|v| matches!(v, ValidatorSpec::JsonSchema { .. }));
        if !declared {
            validators.insert(
                0,
                ValidatorSpec::JsonSchema {
                    schema: schema.clone(),
                },
            );
        }
    }

    let result = data
        .output
        .as_deref()
        .map(|raw| writable_path(node_id, raw))
        .transpose()?;

    let template_id = format!("{}:prompt", node_id);
    let op = ExecOp::LlmWrite(LlmWriteNode {
        model_class: data.model_class,
        prompt_template_id: template_id.clone(),
        inputs,
        output_schema: data.output_schema,
        validators,
        retry_policy: data.retry_policy.unwrap_or_default(),
        escalation_policy: data.escalation_policy,
        outputs: NodeOutputs { result },
    });

    let mut lowered = LoweredNode::single(node_id, op);
    lowered.required_template_ids.push(template_id.clone());
    lowered.templates.insert(
        template_id,
        PromptTemplate {
            system: data.system,
            user: data.instruction,
        },
    );
    Ok(lowered)
}

#[derive(Debug, Deserialize)]
struct IfElseData {
    condition: ConditionData,
}

fn lower_if_else(ctx: &LoweringContext<'_>) -> LowerResult<LoweredNode> {
    let node_id = ctx.node.id.as_str();
    let data: IfElseData = parse_data(ctx.node)?;
    let condition = build_condition(node_id, &data.condition)?;

    let mut lowered = LoweredNode::single(node_id, ExecOp::Switch(SwitchNode::default()));
    lowered.exec_edges = branch_edges(ctx, |handle| {
        (handle == Some("true")).then(|| condition.clone())
    });
    Ok(lowered)
}

#[derive(Debug, Deserialize)]
struct SwitchCase {
    id: String,
    #[serde(flatten)]
    condition: ConditionData,
}

#[derive(Debug, Deserialize)]
struct SwitchData {
    #[serde(default)]
    cases: Vec<SwitchCase>,
}

fn lower_switch(ctx: &LoweringContext<'_>) -> LowerResult<LoweredNode> {
    let node_id = ctx.node.id.as_str();
    let data: SwitchData = parse_data(ctx.node)?;

    let mut seen = HashSet::new();
    let mut cases = BTreeMap::new();
    for case in &data.cases {
        if !seen.insert(case.id.as_str()) {
            return Err(GraphValidationError::invalid_node(
                node_id,
                format!("duplicate case id '{}'", case.id),
            ));
        }
        cases.insert(case.id.clone(), build_condition(node_id, &case.condition)?);
    }

    let mut lowered = LoweredNode::single(node_id, ExecOp::Switch(SwitchNode::default()));
    lowered.exec_edges = branch_edges(ctx, |handle| handle.and_then(|h| cases.get(h).cloned()));
    Ok(lowered)
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OptionData {
    Plain(String),
    Labeled {
        label: String,
        #[serde(default)]
        value: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct AskData {
    question: String,
    #[serde(default)]
    options: Vec<OptionData>,
    #[serde(default, alias = "variable")]
    target: Option<String>,
}

fn lower_ask_user_question(ctx: &LoweringContext<'_>) -> LowerResult<LoweredNode> {
    let node_id = ctx.node.id.as_str();
    let data: AskData = parse_data(ctx.node)?;

    let target = state_path(node_id, data.target.as_deref().unwrap_or(node_id), Namespace::In)?;
    // Answers only ever arrive through resume input or context.
    if !matches!(target.namespace(), Namespace::In | Namespace::Ctx) {
        return Err(GraphValidationError::invalid_node(
            node_id,
            format!("question target must be under $in or $ctx, got {}", target),
        ));
    }

    let options: Vec<QuestionOption> = data
        .options
        .into_iter()
        .map(|option| match option {
            OptionData::Plain(label) => QuestionOption {
                value: label.clone(),
                label,
            },
            OptionData::Labeled { label, value } => QuestionOption {
                value: value.unwrap_or_else(|| label.clone()),
                label,
            },
        })
        .collect();

    let edges = branch_edges(ctx, |handle| {
        let handle = handle?;
        let option = options
            .iter()
            .find(|o| o.value == handle || o.label == handle)?;
        Some(EdgeCondition::Eq {
            left: Operand::reference(target.clone()),
            right: Operand::literal(option.value.clone()),
        })
    });

    let mut lowered = LoweredNode::single(
        node_id,
        ExecOp::Switch(SwitchNode {
            question: Some(QuestionSpec {
                question: data.question,
                options,
                target,
            }),
        }),
    );
    lowered.exec_edges = edges;
    Ok(lowered)
}

#[derive(Debug, Deserialize)]
struct ToolData {
    #[serde(alias = "name")]
    tool: String,
    #[serde(default)]
    args: Value,
    #[serde(default)]
    output: Option<String>,
}

fn lower_tool(ctx: &LoweringContext<'_>) -> LowerResult<LoweredNode> {
    let node_id = ctx.node.id.as_str();
    let data: ToolData = parse_data(ctx.node)?;
    if data.tool.trim().is_empty() {
        return Err(GraphValidationError::invalid_node(node_id, "tool name is empty"));
    }

    let args = match data.args {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    let result = data
        .output
        .as_deref()
        .map(|raw| writable_path(node_id, raw))
        .transpose()?;

    Ok(LoweredNode::single(
        node_id,
        ExecOp::ToolCall(ToolCallNode {
            tool: data.tool,
            args,
            outputs: NodeOutputs { result },
        }),
    ))
}

#[derive(Debug, Deserialize)]
struct SetVariableData {
    #[serde(alias = "name", alias = "variable")]
    target: String,
    #[serde(default)]
    value: Value,
}

fn lower_set_variable(ctx: &LoweringContext<'_>) -> LowerResult<LoweredNode> {
    let node_id = ctx.node.id.as_str();
    let data: SetVariableData = parse_data(ctx.node)?;

    Ok(LoweredNode::single(
        node_id,
        ExecOp::VarSet(VarSetNode {
            target: writable_path(node_id, &data.target)?,
            value: authoring_operand(node_id, &data.value)?,
        }),
    ))
}

#[derive(Debug, Deserialize)]
struct GetVariableData {
    #[serde(alias = "name", alias = "variable")]
    source: String,
    #[serde(default)]
    target: Option<String>,
}

fn lower_get_variable(ctx: &LoweringContext<'_>) -> LowerResult<LoweredNode> {
    let node_id = ctx.node.id.as_str();
    let data: GetVariableData = parse_data(ctx.node)?;

    let target = match data.target.as_deref() {
        Some(raw) => writable_path(node_id, raw)?,
        None => state_path(node_id, node_id, Namespace::Tmp)?,
    };

    Ok(LoweredNode::single(
        node_id,
        ExecOp::VarGet(VarGetNode {
            source: state_path(node_id, &data.source, Namespace::Vars)?,
            target,
        }),
    ))
}

#[derive(Debug, Deserialize)]
struct TransformData {
    expression: String,
    #[serde(default)]
    source: Option<String>,
    #[serde(alias = "output")]
    target: String,
}

fn lower_transform(ctx: &LoweringContext<'_>) -> LowerResult<LoweredNode> {
    let node_id = ctx.node.id.as_str();
    let data: TransformData = parse_data(ctx.node)?;

    ExpressionEvaluator::check(&data.expression)
        .map_err(|e| GraphValidationError::invalid_node(node_id, e.to_string()))?;

    let source = data
        .source
        .as_deref()
        .map(|raw| state_path(node_id, raw, Namespace::Vars))
        .transpose()?;

    Ok(LoweredNode::single(
        node_id,
        ExecOp::Transform(TransformNode {
            expression: data.expression,
            source,
            target: writable_path(node_id, &data.target)?,
        }),
    ))
}
