//! The execution state machine.
//!
//! A run drains a work queue seeded with the entry node. Nodes execute one
//! at a time; after a node completes, each outgoing edge is settled as live
//! (selected) or dead (not selected). A node is enqueued once every incoming
//! edge has settled and at least one of them is live. A node whose incoming
//! edges all settle dead is skipped, and its own outgoing edges settle dead
//! in turn.
//!
//! States: running, then one of completed, failed, cancelled or waiting.
//! Waiting returns a [`Checkpoint`] that [`Runner::resume`] continues from.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use execflow_tools::ToolInvoker;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::error::EngineError;
use super::escalation::{EscalationEngine, SubstringEscalation};
use super::evaluator::{evaluate_condition, resolve_operand, resolve_refs};
use super::failure::FailureCode;
use super::prompt::PromptCompiler;
use super::provider::LlmProvider;
use super::repair::attempt_repair;
use super::state::{StateChange, StateSnapshot, StateStore};
use super::validator::{validate, ValidationOutcome};
use crate::events::{EventPayload, EventStream, EventType};
use crate::execir::{
    ExecNode, ExecOp, ExecProgram, LlmWriteNode, QuestionSpec, SwitchNode, ToolCallNode,
    TransformNode,
};
use crate::template::ExpressionEvaluator;

/// Incoming-edge tally for one node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinProgress {
    pub settled: u32,
    pub live: u32,
}

/// Resumable state captured when a run suspends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub queue: Vec<String>,
    pub completed: BTreeSet<String>,
    pub skipped: BTreeSet<String>,
    pub snapshot: StateSnapshot,
    #[serde(default)]
    pub join_progress: BTreeMap<String, JoinProgress>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Waiting { checkpoint: Checkpoint },
    Failed { error: String, code: FailureCode },
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct RunResult {
    pub outcome: RunOutcome,
    pub snapshot: StateSnapshot,
    pub last_seq: u64,
}

enum Flow {
    Continue,
    Completed,
    Waiting,
}

/// Per-invocation bookkeeping.
struct Execution<'p> {
    program: &'p ExecProgram,
    store: StateStore,
    queue: VecDeque<String>,
    completed: BTreeSet<String>,
    skipped: BTreeSet<String>,
    required: HashMap<&'p str, u32>,
    join: BTreeMap<String, JoinProgress>,
}

impl<'p> Execution<'p> {
    fn new(program: &'p ExecProgram, store: StateStore) -> Self {
        let mut required = HashMap::new();
        for edge in &program.edges {
            *required.entry(edge.to.as_str()).or_insert(0) += 1;
        }

        Self {
            program,
            store,
            queue: VecDeque::from([program.entry_node.clone()]),
            completed: BTreeSet::new(),
            skipped: BTreeSet::new(),
            required,
            join: BTreeMap::new(),
        }
    }

    fn restore(program: &'p ExecProgram, store: StateStore, checkpoint: Checkpoint) -> Self {
        let mut exec = Self::new(program, store);
        exec.queue = checkpoint.queue.into();
        exec.completed = checkpoint.completed;
        exec.skipped = checkpoint.skipped;
        exec.join = checkpoint.join_progress;
        exec
    }

    fn is_done(&self, node_id: &str) -> bool {
        self.completed.contains(node_id) || self.skipped.contains(node_id)
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            queue: self.queue.iter().cloned().collect(),
            completed: self.completed.clone(),
            skipped: self.skipped.clone(),
            snapshot: self.store.snapshot(),
            join_progress: self.join.clone(),
        }
    }

    /// Settle every outgoing edge of `node_id`; `live[i]` says whether the
    /// i-th outgoing edge was selected.
    fn advance(&mut self, stream: &mut EventStream, node_id: &str, live: &[bool]) {
        let program = self.program;
        for (edge, live) in program.outgoing(node_id).zip(live) {
            self.settle(stream, &edge.to, *live);
        }
    }

    fn settle(&mut self, stream: &mut EventStream, target: &str, live: bool) {
        let required = self.required.get(target).copied().unwrap_or(0);
        let progress = self.join.entry(target.to_string()).or_default();
        progress.settled += 1;
        if live {
            progress.live += 1;
        }
        let progress = *progress;

        if progress.settled != required {
            return;
        }
        if progress.live > 0 {
            self.queue.push_back(target.to_string());
        } else {
            self.skip(stream, target);
        }
    }

    fn skip(&mut self, stream: &mut EventStream, node_id: &str) {
        if self.completed.contains(node_id) || !self.skipped.insert(node_id.to_string()) {
            return;
        }
        debug!(run_id = %stream.run_id(), node_id, "node skipped");
        stream.emit(
            EventType::StageSkipped,
            EventPayload::new().field("nodeId", node_id),
        );

        let program = self.program;
        let targets: Vec<&str> = program.outgoing(node_id).map(|e| e.to.as_str()).collect();
        for target in targets {
            self.settle(stream, target, false);
        }
    }
}

/// Executes ExecIR programs.
pub struct Runner {
    provider: Arc<dyn LlmProvider>,
    tools: Arc<dyn ToolInvoker>,
    escalation: Arc<dyn EscalationEngine>,
    expressions: ExpressionEvaluator,
}

impl Runner {
    pub fn new(provider: Arc<dyn LlmProvider>, tools: Arc<dyn ToolInvoker>) -> Self {
        Self {
            provider,
            tools,
            escalation: Arc::new(SubstringEscalation),
            expressions: ExpressionEvaluator::new(),
        }
    }

    pub fn with_escalation(mut self, escalation: Arc<dyn EscalationEngine>) -> Self {
        self.escalation = escalation;
        self
    }

    /// Start a fresh run.
    pub async fn run(
        &self,
        program: &ExecProgram,
        stream: &mut EventStream,
        ctx: Value,
        input: Value,
        cancel: &CancellationToken,
    ) -> RunResult {
        info!(run_id = %stream.run_id(), entry = %program.entry_node, "run started");
        stream.emit(
            EventType::RunStarted,
            EventPayload::new()
                .field("entryNode", program.entry_node.as_str())
                .field("version", program.version.as_str())
                .field("nodeCount", program.nodes.len()),
        );

        let mut exec = Execution::new(program, StateStore::new(ctx, input));
        self.drive(&mut exec, stream, cancel).await
    }

    /// Continue a suspended run with fresh context and input.
    pub async fn resume(
        &self,
        program: &ExecProgram,
        stream: &mut EventStream,
        checkpoint: Checkpoint,
        ctx: Value,
        input: Value,
        cancel: &CancellationToken,
    ) -> RunResult {
        info!(run_id = %stream.run_id(), queue = ?checkpoint.queue, "run resumed");
        stream.emit(
            EventType::RunResumed,
            EventPayload::new().field("queue", json!(checkpoint.queue)),
        );

        let store = StateStore::from_checkpoint(checkpoint.snapshot.clone(), ctx, input);
        let mut exec = Execution::restore(program, store, checkpoint);
        self.drive(&mut exec, stream, cancel).await
    }

    async fn drive(
        &self,
        exec: &mut Execution<'_>,
        stream: &mut EventStream,
        cancel: &CancellationToken,
    ) -> RunResult {
        let run_id = stream.run_id().to_string();
        let listener = exec.store.subscribe(Box::new(move |change: &StateChange| {
            trace!(run_id = %run_id, reference = %change.reference, "state updated");
        }));

        let outcome = loop {
            if cancel.is_cancelled() {
                info!(run_id = %stream.run_id(), "run cancelled");
                stream.emit(EventType::RunCancelled, EventPayload::new());
                break RunOutcome::Cancelled;
            }

            let Some(node_id) = exec.queue.pop_front() else {
                info!(run_id = %stream.run_id(), "queue drained, run completed");
                stream.emit(
                    EventType::RunCompleted,
                    EventPayload::new().field("reason", "queue_drained"),
                );
                break RunOutcome::Completed;
            };
            if exec.is_done(&node_id) {
                continue;
            }

            match self.step(exec, stream, &node_id).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Completed) => {
                    info!(run_id = %stream.run_id(), node_id = %node_id, "run completed");
                    stream.emit(
                        EventType::RunCompleted,
                        EventPayload::new().field("nodeId", node_id.as_str()),
                    );
                    break RunOutcome::Completed;
                }
                Ok(Flow::Waiting) => {
                    info!(run_id = %stream.run_id(), node_id = %node_id, "run waiting for input");
                    break RunOutcome::Waiting {
                        checkpoint: exec.checkpoint(),
                    };
                }
                Err(error) => break fail(stream, &node_id, error),
            }
        };

        exec.store.unsubscribe(listener);
        RunResult {
            outcome,
            snapshot: exec.store.snapshot(),
            last_seq: stream.last_seq(),
        }
    }

    async fn step(
        &self,
        exec: &mut Execution<'_>,
        stream: &mut EventStream,
        node_id: &str,
    ) -> Result<Flow, EngineError> {
        let program = exec.program;
        let node = program
            .node(node_id)
            .ok_or_else(|| EngineError::NodeNotFound(node_id.to_string()))?;
        let op = node.op.name();

        debug!(run_id = %stream.run_id(), node_id, op, "stage started");
        stream.emit(
            EventType::StageStarted,
            EventPayload::new().field("nodeId", node_id).field("op", op),
        );

        match &node.op {
            ExecOp::Start => {}
            ExecOp::End => {
                exec.completed.insert(node_id.to_string());
                stream.emit(
                    EventType::StageCompleted,
                    EventPayload::new().field("nodeId", node_id).field("op", op),
                );
                return Ok(Flow::Completed);
            }
            ExecOp::LlmWrite(llm) => self.llm_write(exec, stream, node_id, llm).await?,
            ExecOp::ToolCall(tool) => self.tool_call(exec, stream, node_id, tool).await?,
            ExecOp::VarSet(set) => {
                let value = resolve_operand(&set.value, exec.store.view());
                exec.store.set(&set.target, value)?;
            }
            ExecOp::VarGet(get) => {
                let value = exec.store.get(&get.source).cloned().unwrap_or(Value::Null);
                exec.store.set(&get.target, value)?;
            }
            ExecOp::Transform(transform) => self.transform(exec, transform)?,
            ExecOp::Switch(SwitchNode {
                question: Some(question),
            }) if awaiting_answer(exec.store.get(&question.target)) => {
                emit_waiting(stream, node_id, question);
                exec.queue.push_front(node_id.to_string());
                return Ok(Flow::Waiting);
            }
            ExecOp::Switch(_) => {}
        }

        exec.completed.insert(node_id.to_string());
        stream.emit(
            EventType::StageCompleted,
            EventPayload::new().field("nodeId", node_id).field("op", op),
        );

        let live = select_edges(program, node, exec.store.view());
        exec.advance(stream, node_id, &live);
        Ok(Flow::Continue)
    }

    async fn llm_write(
        &self,
        exec: &mut Execution<'_>,
        stream: &mut EventStream,
        node_id: &str,
        node: &LlmWriteNode,
    ) -> Result<(), EngineError> {
        let request =
            PromptCompiler::new(&exec.program.templates).compile(node, &Map::new(), exec.store.view())?;
        stream.emit(
            EventType::LlmRequest,
            EventPayload::new()
                .field("nodeId", node_id)
                .field("modelClass", node.model_class.as_str())
                .opaque("messages", "prompt content"),
        );

        let response = self
            .provider
            .chat(request)
            .await
            .map_err(|error| EngineError::Provider {
                provider: self.provider.name().to_string(),
                error,
            })?;

        let output = parse_output(&response.content);
        stream.emit(
            EventType::LlmResponse,
            EventPayload::new()
                .field("nodeId", node_id)
                .field("model", response.model.clone())
                .field("usage", json!(response.usage))
                .sensitive("output", &output),
        );

        let outcome = validate(&output, node, Some(&exec.store.view().input));
        let output = if outcome.valid {
            output
        } else {
            self.repair(exec, stream, node_id, node, &response.content, outcome)
                .await?
        };

        if let Some(target) = &node.outputs.result {
            exec.store.set(target, output)?;
        }
        Ok(())
    }

    async fn repair(
        &self,
        exec: &Execution<'_>,
        stream: &mut EventStream,
        node_id: &str,
        node: &LlmWriteNode,
        raw_output: &str,
        outcome: ValidationOutcome,
    ) -> Result<Value, EngineError> {
        let message = outcome.joined_messages();
        stream.emit(
            EventType::ValidationFailed,
            EventPayload::new()
                .field("nodeId", node_id)
                .field("phase", "initial")
                .field("errors", json!(outcome.errors)),
        );

        // Advice is recorded but the model class is left unchanged.
        let advice = self.escalation.should_escalate(node, &message);
        if advice.escalate {
            info!(
                run_id = %stream.run_id(),
                node_id,
                to_model_class = ?advice.to_model_class,
                "escalation advised"
            );
            stream.emit(
                EventType::Trace,
                EventPayload::new()
                    .field("nodeId", node_id)
                    .field("message", "escalation advised")
                    .field("escalation", json!(advice)),
            );
        }

        let repair = attempt_repair(node, raw_output, &message, self.provider.as_ref())
            .await
            .map_err(|error| EngineError::Provider {
                provider: self.provider.name().to_string(),
                error,
            })?;
        stream.emit(
            EventType::RepairAttempted,
            EventPayload::new()
                .field("nodeId", node_id)
                .field("attempts", repair.attempts)
                .field("repaired", repair.repaired),
        );

        let invalid = |outcome: ValidationOutcome| EngineError::Validation {
            node_id: node_id.to_string(),
            message: outcome.joined_messages(),
            errors: outcome.errors,
        };

        let Some(output) = repair.output else {
            return Err(invalid(outcome));
        };
        let recheck = validate(&output, node, Some(&exec.store.view().input));
        if recheck.valid {
            return Ok(output);
        }

        stream.emit(
            EventType::ValidationFailed,
            EventPayload::new()
                .field("nodeId", node_id)
                .field("phase", "repair")
                .field("errors", json!(recheck.errors)),
        );
        Err(invalid(recheck))
    }

    async fn tool_call(
        &self,
        exec: &mut Execution<'_>,
        stream: &mut EventStream,
        node_id: &str,
        node: &ToolCallNode,
    ) -> Result<(), EngineError> {
        let args = resolve_refs(&node.args, exec.store.view());
        stream.emit(
            EventType::ToolCall,
            EventPayload::new()
                .field("nodeId", node_id)
                .field("tool", node.tool.as_str())
                .opaque("args", "tool arguments"),
        );

        let result = self
            .tools
            .invoke(&node.tool, &args)
            .await
            .map_err(|source| EngineError::Tool {
                tool: node.tool.clone(),
                source,
            })?;
        stream.emit(
            EventType::ToolResult,
            EventPayload::new()
                .field("nodeId", node_id)
                .field("tool", node.tool.as_str())
                .sensitive("result", &result),
        );

        if let Some(target) = &node.outputs.result {
            exec.store.set(target, result)?;
        }
        Ok(())
    }

    fn transform(&self, exec: &mut Execution<'_>, node: &TransformNode) -> Result<(), EngineError> {
        let snapshot = exec.store.view();
        let value = match &node.source {
            Some(source) => snapshot.get(source).cloned().unwrap_or(Value::Null),
            None => serde_json::to_value(snapshot).unwrap_or(Value::Null),
        };
        let context = json!({
            "value": value,
            "vars": snapshot.vars,
            "tmp": snapshot.tmp,
            "ctx": snapshot.ctx,
            "input": snapshot.input,
        });

        let result = self.expressions.evaluate(&node.expression, &context)?;
        exec.store.set(&node.target, result)?;
        Ok(())
    }
}

fn fail(stream: &mut EventStream, node_id: &str, error: EngineError) -> RunOutcome {
    let failure = error.failure();
    let message = error.to_string();
    warn!(
        run_id = %stream.run_id(),
        node_id,
        code = %failure.code,
        error = %message,
        "node failed"
    );

    stream.emit(
        EventType::StageFailed,
        EventPayload::new()
            .field("nodeId", node_id)
            .field("error", message.as_str())
            .field("failure", json!(failure)),
    );
    stream.emit(
        EventType::Trace,
        EventPayload::new()
            .field("nodeId", node_id)
            .field("message", "run aborted after node failure")
            .field("code", failure.code.as_str()),
    );
    stream.emit(
        EventType::RunFailed,
        EventPayload::new()
            .field("nodeId", node_id)
            .field("error", message.as_str())
            .field("code", failure.code.as_str()),
    );

    RunOutcome::Failed {
        error: message,
        code: failure.code,
    }
}

fn emit_waiting(stream: &mut EventStream, node_id: &str, question: &QuestionSpec) {
    stream.emit(
        EventType::RunWaiting,
        EventPayload::new()
            .field("nodeId", node_id)
            .field("question", question.question.as_str())
            .field("options", json!(question.options))
            .field("inputPath", question.target.to_string()),
    );
}

/// Model output as JSON, or the raw text when it does not parse.
fn parse_output(content: &str) -> Value {
    serde_json::from_str(content.trim()).unwrap_or_else(|_| Value::String(content.to_string()))
}

fn awaiting_answer(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::Object(map)) => map.is_empty(),
        Some(_) => false,
    }
}

/// Liveness of each outgoing edge, in program order.
///
/// SWITCH selects the first conditioned edge that holds, else the first
/// `always` edge, else nothing. Every other op selects all edges.
fn select_edges(program: &ExecProgram, node: &ExecNode, state: &StateSnapshot) -> Vec<bool> {
    let edges: Vec<_> = program.outgoing(&node.id).collect();
    if !matches!(node.op, ExecOp::Switch(_)) {
        return vec![true; edges.len()];
    }

    let chosen = edges
        .iter()
        .position(|e| !e.condition.is_always() && evaluate_condition(&e.condition, state))
        .or_else(|| edges.iter().position(|e| e.condition.is_always()));

    (0..edges.len()).map(|i| Some(i) == chosen).collect()
}
