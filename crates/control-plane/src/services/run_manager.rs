//! Run lifecycle and durable event fan-out.
//!
//! Every resident run owns a writer task. The runner pushes envelopes into
//! an unbounded channel; the writer persists each one and only then hands
//! it to attached listeners, all under the per-run lock. Subscribers replay
//! from the store under that same lock before attaching, so a listener sees
//! every seq exactly once and in order no matter when it joined.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, Stream, StreamExt};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::{EventStore, ResumeState, RunStatus, StoreError, StoredRun};
use crate::engine::{Checkpoint, FailureCode, RunOutcome, RunResult, Runner};
use crate::events::{EventPayload, EventStream, EventType, WorkflowStreamEventEnvelope};
use crate::execir::ExecProgram;
use crate::result_ext::ResultExt;

const INTERRUPTED: &str = "interrupted by restart";

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("run not found: {0}")]
    NotFound(String),

    #[error("run {run_id} is {status}, not waiting")]
    NotWaiting { run_id: String, status: RunStatus },

    #[error("run {0} has no checkpoint to resume from")]
    NoCheckpoint(String),

    #[error("run {run_id} already finished with status {status}")]
    AlreadyFinished { run_id: String, status: RunStatus },

    #[error("run corruption in {run_id}: expected seq {expected}, got {actual}")]
    RunCorruption {
        run_id: String,
        expected: u64,
        actual: u64,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Events for one subscriber: the persisted backlog followed by live delivery.
pub struct Subscription {
    pub replay: Vec<WorkflowStreamEventEnvelope>,
    pub live: mpsc::UnboundedReceiver<WorkflowStreamEventEnvelope>,
}

impl Subscription {
    /// Flatten into a single stream that ends when the run is terminal.
    pub fn into_stream(self) -> impl Stream<Item = WorkflowStreamEventEnvelope> + Send {
        stream::iter(self.replay).chain(UnboundedReceiverStream::new(self.live))
    }
}

struct Listener {
    tx: mpsc::UnboundedSender<WorkflowStreamEventEnvelope>,
    last_seen: u64,
}

struct RunState {
    status: RunStatus,
    last_seq: u64,
    listeners: Vec<Listener>,
    corrupted: bool,
}

impl RunState {
    fn broadcast(&mut self, event: &WorkflowStreamEventEnvelope) {
        self.listeners.retain_mut(|listener| {
            if event.seq != listener.last_seen + 1 {
                return !listener.tx.is_closed();
            }
            if listener.tx.send(event.clone()).is_err() {
                return false;
            }
            listener.last_seen = event.seq;
            true
        });
    }

    fn observe(&mut self, event_type: EventType) {
        let status = match event_type {
            EventType::RunStarted | EventType::RunResumed => RunStatus::Running,
            EventType::RunWaiting => RunStatus::Waiting,
            EventType::RunCompleted => RunStatus::Completed,
            EventType::RunFailed => RunStatus::Failed,
            EventType::RunCancelled => RunStatus::Cancelled,
            _ => return,
        };
        self.status = status;
        if status.is_terminal() {
            // Dropping the senders ends every live subscription.
            self.listeners.clear();
        }
    }
}

struct RunHandle {
    run_id: String,
    cancel: CancellationToken,
    state: Mutex<RunState>,
}

impl RunHandle {
    fn new(run_id: impl Into<String>, status: RunStatus, last_seq: u64) -> Arc<Self> {
        Arc::new(Self {
            run_id: run_id.into(),
            cancel: CancellationToken::new(),
            state: Mutex::new(RunState {
                status,
                last_seq,
                listeners: Vec::new(),
                corrupted: false,
            }),
        })
    }
}

enum Launch {
    Start {
        ctx: Value,
        input: Value,
    },
    Resume {
        checkpoint: Checkpoint,
        ctx: Value,
        input: Value,
    },
}

/// Persist `event` and fan it out. Returns `false` for a duplicate.
async fn deliver(
    store: &dyn EventStore,
    state: &mut RunState,
    event: WorkflowStreamEventEnvelope,
) -> Result<bool, ManagerError> {
    if event.seq <= state.last_seq {
        debug!(run_id = %event.run_id, seq = event.seq, "duplicate event ignored");
        return Ok(false);
    }
    if event.seq != state.last_seq + 1 {
        return Err(ManagerError::RunCorruption {
            run_id: event.run_id.clone(),
            expected: state.last_seq + 1,
            actual: event.seq,
        });
    }

    store.append_event(&event).await?;
    state.last_seq = event.seq;
    state.broadcast(&event);
    state.observe(event.event_type);
    Ok(true)
}

async fn write_events(
    store: Arc<dyn EventStore>,
    handle: Arc<RunHandle>,
    mut rx: mpsc::UnboundedReceiver<WorkflowStreamEventEnvelope>,
) {
    while let Some(event) = rx.recv().await {
        let mut state = handle.state.lock().await;
        if state.corrupted {
            continue;
        }
        if let Err(e) = deliver(store.as_ref(), &mut state, event).await {
            error!(run_id = %handle.run_id, error = %e, "event stream broken, failing run");
            state.corrupted = true;
            state.status = RunStatus::Failed;
            state.listeners.clear();
            handle.cancel.cancel();
            let _ = store
                .update_run_status(&handle.run_id, RunStatus::Failed, Some(&e.to_string()))
                .await
                .log("marking corrupted run failed");
        }
    }
}

/// Append an event on behalf of the manager itself, outside any runner.
async fn emit_direct(
    store: &dyn EventStore,
    state: &mut RunState,
    run_id: &str,
    event_type: EventType,
    payload: EventPayload,
) -> Result<(), ManagerError> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut stream = EventStream::new(run_id, state.last_seq, tx);
    stream.emit(event_type, payload);
    drop(stream);
    while let Some(event) = rx.recv().await {
        deliver(store, state, event).await?;
    }
    Ok(())
}

/// Owns every run started or touched by this process.
pub struct RunManager {
    store: Arc<dyn EventStore>,
    runner: Arc<Runner>,
    runs: Mutex<HashMap<String, Arc<RunHandle>>>,
}

impl RunManager {
    pub fn new(store: Arc<dyn EventStore>, runner: Arc<Runner>) -> Self {
        Self {
            store,
            runner,
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Create a run record and start executing `program` in the background.
    pub async fn start_run(
        &self,
        program: ExecProgram,
        ctx: Value,
        input: Value,
    ) -> Result<StoredRun, ManagerError> {
        let run = StoredRun::started(Uuid::new_v4().to_string());
        self.store.create_run(&run).await?;

        let handle = RunHandle::new(run.run_id.as_str(), RunStatus::Running, 0);
        self.runs
            .lock()
            .await
            .insert(run.run_id.clone(), handle.clone());

        info!(run_id = %run.run_id, entry = %program.entry_node, "starting run");
        self.spawn(handle, program, Launch::Start { ctx, input }, 0);
        Ok(run)
    }

    /// Continue a waiting run from its stored checkpoint.
    pub async fn resume_run(
        &self,
        run_id: &str,
        ctx: Value,
        input: Value,
    ) -> Result<StoredRun, ManagerError> {
        let handle = self.resident(run_id).await?;
        let (resume, initial_seq) = {
            let mut state = handle.state.lock().await;
            let stored = self
                .store
                .get_run(run_id)
                .await?
                .ok_or_else(|| ManagerError::NotFound(run_id.to_string()))?;
            if stored.status != RunStatus::Waiting {
                return Err(ManagerError::NotWaiting {
                    run_id: run_id.to_string(),
                    status: stored.status,
                });
            }
            let resume = self
                .store
                .load_resume(run_id)
                .await?
                .ok_or_else(|| ManagerError::NoCheckpoint(run_id.to_string()))?;

            self.store
                .update_run_status(run_id, RunStatus::Running, None)
                .await?;
            state.status = RunStatus::Running;
            (resume, state.last_seq)
        };

        info!(run_id, from_seq = initial_seq, "resuming run");
        let ResumeState {
            program,
            checkpoint,
        } = resume;
        self.spawn(
            handle,
            program,
            Launch::Resume {
                checkpoint,
                ctx,
                input,
            },
            initial_seq,
        );
        self.get_run(run_id).await
    }

    /// Request cancellation. Waiting runs are cancelled immediately.
    pub async fn cancel_run(&self, run_id: &str) -> Result<StoredRun, ManagerError> {
        let handle = self.resident(run_id).await?;
        {
            let mut state = handle.state.lock().await;
            let status = state.status;
            match status {
                RunStatus::Running => {
                    info!(run_id, "cancellation requested");
                    handle.cancel.cancel();
                }
                RunStatus::Waiting => {
                    info!(run_id, "cancelling waiting run");
                    handle.cancel.cancel();
                    emit_direct(
                        self.store.as_ref(),
                        &mut state,
                        run_id,
                        EventType::RunCancelled,
                        EventPayload::new(),
                    )
                    .await?;
                    self.store
                        .update_run_status(run_id, RunStatus::Cancelled, None)
                        .await?;
                }
                status => {
                    return Err(ManagerError::AlreadyFinished {
                        run_id: run_id.to_string(),
                        status,
                    })
                }
            }
        }
        self.get_run(run_id).await
    }

    pub async fn get_run(&self, run_id: &str) -> Result<StoredRun, ManagerError> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| ManagerError::NotFound(run_id.to_string()))
    }

    /// Replay everything after `last_seq`, then follow the run while it is live.
    pub async fn subscribe(
        &self,
        run_id: &str,
        last_seq: u64,
    ) -> Result<Subscription, ManagerError> {
        let handle = self.resident(run_id).await?;
        let mut state = handle.state.lock().await;

        let replay = self.store.list_events(run_id, last_seq).await?;
        let last_seen = replay.last().map(|e| e.seq).unwrap_or(last_seq);
        let (tx, live) = mpsc::unbounded_channel();
        if state.status.is_live() {
            state.listeners.push(Listener { tx, last_seen });
        }

        debug!(
            run_id,
            last_seq,
            replayed = replay.len(),
            live = state.status.is_live(),
            "subscriber attached"
        );
        Ok(Subscription { replay, live })
    }

    /// Fail every run left `running` by a previous process.
    pub async fn recover_interrupted_runs(&self) -> Result<usize, ManagerError> {
        let stale = self.store.list_runs_with_status(RunStatus::Running).await?;
        let mut recovered = 0;
        for run in stale {
            if self.runs.lock().await.contains_key(&run.run_id) {
                continue;
            }
            let handle = RunHandle::new(run.run_id.as_str(), run.status, run.last_seq);
            self.mark_interrupted(&handle).await?;
            self.runs.lock().await.insert(run.run_id.clone(), handle);
            recovered += 1;
        }
        if recovered > 0 {
            warn!(count = recovered, "failed runs interrupted by restart");
        }
        Ok(recovered)
    }

    /// Delete terminal runs older than `retention` and forget their handles.
    pub async fn prune(&self, retention: Duration) -> Result<u64, ManagerError> {
        let retention = chrono::Duration::from_std(retention)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = Utc::now() - retention;
        let removed = self.store.prune_stale_runs(cutoff).await?;

        if removed > 0 {
            let ids: Vec<String> = self.runs.lock().await.keys().cloned().collect();
            for id in ids {
                if self.store.get_run(&id).await?.is_none() {
                    self.runs.lock().await.remove(&id);
                }
            }
            info!(removed, "pruned stale runs");
        }
        Ok(removed)
    }

    /// Periodically prune until `shutdown` fires.
    pub fn spawn_prune_loop(
        self: Arc<Self>,
        retention: Duration,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let _ = self.prune(retention).await.log("pruning stale runs");
                    }
                }
            }
            debug!("prune loop stopped");
        })
    }

    /// Handle for `run_id`, loading it from the store when not resident.
    async fn resident(&self, run_id: &str) -> Result<Arc<RunHandle>, ManagerError> {
        if let Some(handle) = self.runs.lock().await.get(run_id) {
            return Ok(handle.clone());
        }

        let stored = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| ManagerError::NotFound(run_id.to_string()))?;
        let handle = RunHandle::new(run_id, stored.status, stored.last_seq);
        if stored.status == RunStatus::Running {
            // Nothing in this process is executing it.
            self.mark_interrupted(&handle).await?;
        }

        let mut runs = self.runs.lock().await;
        Ok(runs.entry(run_id.to_string()).or_insert(handle).clone())
    }

    async fn mark_interrupted(&self, handle: &RunHandle) -> Result<(), ManagerError> {
        let mut state = handle.state.lock().await;
        emit_direct(
            self.store.as_ref(),
            &mut state,
            &handle.run_id,
            EventType::RunFailed,
            EventPayload::new()
                .field("error", INTERRUPTED)
                .field("code", json!(FailureCode::Unknown)),
        )
        .await?;
        self.store
            .update_run_status(&handle.run_id, RunStatus::Failed, Some(INTERRUPTED))
            .await?;
        Ok(())
    }

    fn spawn(&self, handle: Arc<RunHandle>, program: ExecProgram, launch: Launch, initial_seq: u64) {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_events(self.store.clone(), handle.clone(), rx));
        let runner = self.runner.clone();
        let store = self.store.clone();

        tokio::spawn(async move {
            let mut stream = EventStream::new(handle.run_id.as_str(), initial_seq, tx);
            let result = match launch {
                Launch::Start { ctx, input } => {
                    runner
                        .run(&program, &mut stream, ctx, input, &handle.cancel)
                        .await
                }
                Launch::Resume {
                    checkpoint,
                    ctx,
                    input,
                } => {
                    runner
                        .resume(&program, &mut stream, checkpoint, ctx, input, &handle.cancel)
                        .await
                }
            };
            drop(stream);
            if let Err(e) = writer.await {
                error!(run_id = %handle.run_id, error = %e, "event writer panicked");
            }
            finish(store.as_ref(), &handle, program, result).await;
        });
    }
}

/// Record the final status once every event has been persisted.
async fn finish(store: &dyn EventStore, handle: &RunHandle, program: ExecProgram, result: RunResult) {
    let mut state = handle.state.lock().await;
    if state.corrupted {
        return;
    }

    let (status, error) = match result.outcome {
        RunOutcome::Completed => (RunStatus::Completed, None),
        RunOutcome::Cancelled => (RunStatus::Cancelled, None),
        RunOutcome::Failed { error, .. } => (RunStatus::Failed, Some(error)),
        RunOutcome::Waiting { checkpoint } => {
            if state.status != RunStatus::Waiting {
                // Cancelled while the checkpoint was in flight.
                return;
            }
            if handle.cancel.is_cancelled() {
                // Cancel landed while the run was still reporting the question.
                info!(run_id = %handle.run_id, "cancelling run that suspended after cancel request");
                if let Err(e) = emit_direct(
                    store,
                    &mut state,
                    &handle.run_id,
                    EventType::RunCancelled,
                    EventPayload::new(),
                )
                .await
                {
                    error!(run_id = %handle.run_id, error = %e, "failed to record cancellation");
                }
                (RunStatus::Cancelled, None)
            } else {
                let resume = ResumeState {
                    program,
                    checkpoint,
                };
                if store
                    .save_checkpoint(&handle.run_id, &resume)
                    .await
                    .log("saving checkpoint")
                    .is_err()
                {
                    state.status = RunStatus::Failed;
                    state.listeners.clear();
                    let _ = store
                        .update_run_status(
                            &handle.run_id,
                            RunStatus::Failed,
                            Some("checkpoint could not be saved"),
                        )
                        .await
                        .log("marking run failed");
                    return;
                }
                (RunStatus::Waiting, None)
            }
        }
    };

    if let Err(e) = store
        .update_run_status(&handle.run_id, status, error.as_deref())
        .await
    {
        error!(run_id = %handle.run_id, error = %e, "failed to record run status");
    }
    state.status = status;
    if status.is_terminal() {
        state.listeners.clear();
    }
    info!(run_id = %handle.run_id, %status, last_seq = result.last_seq, "run segment finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryEventStore;
    use crate::engine::provider::{ChatRequest, ChatResponse, LlmProvider, ProviderError};
    use crate::events::EVENT_VERSION;
    use crate::execir::{
        EdgeCondition, ExecEdge, ExecNode, ExecOp, Operand, QuestionOption, QuestionSpec,
        StateRef, SwitchNode, ToolCallNode, VarSetNode, EXEC_IR_VERSION,
    };
    use async_trait::async_trait;
    use execflow_tools::{ToolError, ToolInvoker};
    use std::collections::BTreeMap;
    use tokio::sync::Notify;

    struct SilentProvider;

    #[async_trait]
    impl LlmProvider for SilentProvider {
        fn name(&self) -> &str {
            "silent"
        }

        async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse, ProviderError> {
            Ok(ChatResponse::text("{}"))
        }
    }

    /// Blocks every call until released.
    #[derive(Default)]
    struct GatedTools {
        release: Notify,
    }

    #[async_trait]
    impl ToolInvoker for GatedTools {
        async fn invoke(&self, _tool: &str, args: &Value) -> Result<Value, ToolError> {
            self.release.notified().await;
            Ok(json!({"echo": args}))
        }
    }

    fn node(id: &str, op: ExecOp) -> ExecNode {
        ExecNode {
            id: id.to_string(),
            op,
        }
    }

    fn program(nodes: Vec<ExecNode>, edges: Vec<ExecEdge>) -> ExecProgram {
        ExecProgram {
            version: EXEC_IR_VERSION.to_string(),
            entry_node: "start".to_string(),
            nodes,
            edges,
            templates: BTreeMap::new(),
        }
    }

    fn gated_program() -> ExecProgram {
        program(
            vec![
                node("start", ExecOp::Start),
                node(
                    "fetch",
                    ExecOp::ToolCall(ToolCallNode {
                        tool: "http:get".to_string(),
                        args: json!({"url": "https://example.test"}),
                        outputs: Default::default(),
                    }),
                ),
                node("end", ExecOp::End),
            ],
            vec![
                ExecEdge::always("start", "fetch"),
                ExecEdge::always("fetch", "end"),
            ],
        )
    }

    fn question_program() -> ExecProgram {
        let target = StateRef::parse("$in.answer").unwrap();
        program(
            vec![
                node("start", ExecOp::Start),
                node(
                    "ask",
                    ExecOp::Switch(SwitchNode {
                        question: Some(QuestionSpec {
                            question: "Ship it?".to_string(),
                            options: vec![QuestionOption {
                                label: "Yes".to_string(),
                                value: "yes".to_string(),
                            }],
                            target: target.clone(),
                        }),
                    }),
                ),
                node(
                    "record",
                    ExecOp::VarSet(VarSetNode {
                        target: StateRef::parse("$vars.shipped").unwrap(),
                        value: Operand::literal("yes"),
                    }),
                ),
                node("end", ExecOp::End),
            ],
            vec![
                ExecEdge::always("start", "ask"),
                ExecEdge {
                    from: "ask".to_string(),
                    to: "record".to_string(),
                    condition: EdgeCondition::Eq {
                        left: Operand::reference(target),
                        right: Operand::literal("yes"),
                    },
                },
                ExecEdge::always("record", "end"),
            ],
        )
    }

    fn manager_with(tools: Arc<dyn ToolInvoker>) -> (Arc<RunManager>, Arc<MemoryEventStore>) {
        let store = Arc::new(MemoryEventStore::new());
        let runner = Arc::new(Runner::new(Arc::new(SilentProvider), tools));
        (Arc::new(RunManager::new(store.clone(), runner)), store)
    }

    async fn wait_until<F>(manager: &RunManager, run_id: &str, done: F) -> StoredRun
    where
        F: Fn(&StoredRun) -> bool,
    {
        for _ in 0..500 {
            let run = manager.get_run(run_id).await.unwrap();
            if done(&run) {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run {run_id} never reached the expected state");
    }

    async fn collect(subscription: Subscription) -> Vec<WorkflowStreamEventEnvelope> {
        tokio::time::timeout(Duration::from_secs(5), subscription.into_stream().collect())
            .await
            .expect("subscription should end with the run")
    }

    fn seqs(events: &[WorkflowStreamEventEnvelope]) -> Vec<u64> {
        events.iter().map(|e| e.seq).collect()
    }

    fn envelope(run_id: &str, seq: u64) -> WorkflowStreamEventEnvelope {
        WorkflowStreamEventEnvelope {
            event_version: EVENT_VERSION,
            run_id: run_id.to_string(),
            seq,
            timestamp: Utc::now(),
            event_type: EventType::Trace,
            payload: json!({}),
        }
    }

    #[tokio::test]
    async fn test_early_and_late_subscribers_see_identical_tail() {
        let tools = Arc::new(GatedTools::default());
        let (manager, _) = manager_with(tools.clone());

        let run = manager
            .start_run(gated_program(), json!({}), json!({}))
            .await
            .unwrap();
        let early = manager.subscribe(&run.run_id, 0).await.unwrap();

        // Blocked inside the tool call once tool.call (seq 5) is durable.
        wait_until(&manager, &run.run_id, |r| r.last_seq >= 5).await;
        let late = manager.subscribe(&run.run_id, 3).await.unwrap();
        assert_eq!(seqs(&late.replay), vec![4, 5]);

        tools.release.notify_one();
        let early = collect(early).await;
        let late = collect(late).await;

        let last = early.last().unwrap().seq;
        assert_eq!(seqs(&early), (1..=last).collect::<Vec<_>>());
        assert_eq!(seqs(&late), (4..=last).collect::<Vec<_>>());
        assert_eq!(early.last().unwrap().event_type, EventType::RunCompleted);
        assert_eq!(late.last(), early.last());

        let stored = wait_until(&manager, &run.run_id, |r| r.status.is_terminal()).await;
        assert_eq!(stored.status, RunStatus::Completed);
        assert_eq!(stored.last_seq, last);
    }

    #[tokio::test]
    async fn test_subscribe_to_finished_run_replays_and_ends() {
        let tools = Arc::new(GatedTools::default());
        tools.release.notify_one();
        let (manager, _) = manager_with(tools);

        let run = manager
            .start_run(gated_program(), json!({}), json!({}))
            .await
            .unwrap();
        let done = wait_until(&manager, &run.run_id, |r| r.status.is_terminal()).await;

        let events = collect(manager.subscribe(&run.run_id, 0).await.unwrap()).await;
        assert_eq!(events.len() as u64, done.last_seq);

        let tail = collect(manager.subscribe(&run.run_id, done.last_seq).await.unwrap()).await;
        assert!(tail.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_run_is_not_found() {
        let (manager, _) = manager_with(Arc::new(GatedTools::default()));
        assert!(matches!(
            manager.subscribe("missing", 0).await,
            Err(ManagerError::NotFound(_))
        ));
        assert!(matches!(
            manager.cancel_run("missing").await,
            Err(ManagerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_resume_continues_sequence() {
        let (manager, store) = manager_with(Arc::new(GatedTools::default()));
        let run = manager
            .start_run(question_program(), json!({}), json!({}))
            .await
            .unwrap();
        let waiting = wait_until(&manager, &run.run_id, |r| r.status == RunStatus::Waiting).await;
        assert!(store.load_resume(&run.run_id).await.unwrap().is_some());

        manager
            .resume_run(&run.run_id, json!({}), json!({"answer": "yes"}))
            .await
            .unwrap();
        let done = wait_until(&manager, &run.run_id, |r| r.status.is_terminal()).await;
        assert_eq!(done.status, RunStatus::Completed);

        let events = store.list_events(&run.run_id, 0).await.unwrap();
        assert_eq!(seqs(&events), (1..=done.last_seq).collect::<Vec<_>>());
        let resumed = events
            .iter()
            .find(|e| e.event_type == EventType::RunResumed)
            .unwrap();
        assert_eq!(resumed.seq, waiting.last_seq + 1);
        assert!(store.load_resume(&run.run_id).await.unwrap().is_none());

        // A completed run cannot be resumed again.
        assert!(matches!(
            manager.resume_run(&run.run_id, json!({}), json!({})).await,
            Err(ManagerError::NotWaiting { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_waiting_run_emits_terminal_event() {
        let (manager, store) = manager_with(Arc::new(GatedTools::default()));
        let run = manager
            .start_run(question_program(), json!({}), json!({}))
            .await
            .unwrap();
        let waiting = wait_until(&manager, &run.run_id, |r| r.status == RunStatus::Waiting).await;
        let subscription = manager.subscribe(&run.run_id, waiting.last_seq).await.unwrap();

        let cancelled = manager.cancel_run(&run.run_id).await.unwrap();
        assert_eq!(cancelled.status, RunStatus::Cancelled);
        assert_eq!(cancelled.last_seq, waiting.last_seq + 1);

        let tail = collect(subscription).await;
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].event_type, EventType::RunCancelled);
        assert!(store.load_resume(&run.run_id).await.unwrap().is_none());

        assert!(matches!(
            manager.cancel_run(&run.run_id).await,
            Err(ManagerError::AlreadyFinished { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_running_run() {
        let tools = Arc::new(GatedTools::default());
        let (manager, _) = manager_with(tools.clone());
        let run = manager
            .start_run(gated_program(), json!({}), json!({}))
            .await
            .unwrap();
        wait_until(&manager, &run.run_id, |r| r.last_seq >= 5).await;

        manager.cancel_run(&run.run_id).await.unwrap();
        tools.release.notify_one();

        let done = wait_until(&manager, &run.run_id, |r| r.status.is_terminal()).await;
        assert_eq!(done.status, RunStatus::Cancelled);
        let events = manager.store().list_events(&run.run_id, 0).await.unwrap();
        assert_eq!(events.last().unwrap().event_type, EventType::RunCancelled);
    }

    #[tokio::test]
    async fn test_deliver_drops_duplicates_and_rejects_gaps() {
        let store = MemoryEventStore::new();
        store.create_run(&StoredRun::started("r1")).await.unwrap();
        let mut state = RunState {
            status: RunStatus::Running,
            last_seq: 0,
            listeners: Vec::new(),
            corrupted: false,
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.listeners.push(Listener { tx, last_seen: 0 });

        assert!(deliver(&store, &mut state, envelope("r1", 1)).await.unwrap());
        assert!(!deliver(&store, &mut state, envelope("r1", 1)).await.unwrap());
        assert!(deliver(&store, &mut state, envelope("r1", 2)).await.unwrap());

        let err = deliver(&store, &mut state, envelope("r1", 4)).await.unwrap_err();
        assert!(matches!(
            err,
            ManagerError::RunCorruption {
                expected: 3,
                actual: 4,
                ..
            }
        ));

        assert_eq!(rx.recv().await.unwrap().seq, 1);
        assert_eq!(rx.recv().await.unwrap().seq, 2);
        assert!(rx.try_recv().is_err());
        assert_eq!(store.list_events("r1", 0).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_during_suspend_settles_cancelled() {
        let store = MemoryEventStore::new();
        store.create_run(&StoredRun::started("r1")).await.unwrap();
        let handle = RunHandle::new("r1", RunStatus::Running, 0);
        handle.cancel.cancel();

        let mut waiting = envelope("r1", 1);
        waiting.event_type = EventType::RunWaiting;
        {
            let mut state = handle.state.lock().await;
            deliver(&store, &mut state, waiting).await.unwrap();
            assert_eq!(state.status, RunStatus::Waiting);
        }

        let result = RunResult {
            outcome: RunOutcome::Waiting {
                checkpoint: Checkpoint {
                    queue: vec!["ask".to_string()],
                    completed: Default::default(),
                    skipped: Default::default(),
                    snapshot: Default::default(),
                    join_progress: Default::default(),
                },
            },
            snapshot: Default::default(),
            last_seq: 1,
        };
        finish(&store, &handle, question_program(), result).await;

        assert_eq!(handle.state.lock().await.status, RunStatus::Cancelled);
        let stored = store.get_run("r1").await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Cancelled);
        assert!(store.load_resume("r1").await.unwrap().is_none());
        let events = store.list_events("r1", 0).await.unwrap();
        assert_eq!(events.last().unwrap().event_type, EventType::RunCancelled);
        assert_eq!(events.last().unwrap().seq, 2);
    }

    #[tokio::test]
    async fn test_writer_fails_run_on_skip_ahead() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        store.create_run(&StoredRun::started("r1")).await.unwrap();
        let handle = RunHandle::new("r1", RunStatus::Running, 0);
        let (listener_tx, listener_rx) = mpsc::unbounded_channel();
        handle.state.lock().await.listeners.push(Listener {
            tx: listener_tx,
            last_seen: 0,
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_events(store.clone(), handle.clone(), rx));
        tx.send(envelope("r1", 1)).unwrap();
        tx.send(envelope("r1", 3)).unwrap();
        tx.send(envelope("r1", 2)).unwrap();
        drop(tx);
        writer.await.unwrap();

        assert!(handle.cancel.is_cancelled());
        let run = store.get_run("r1").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.unwrap().contains("expected seq 2, got 3"));
        assert_eq!(run.last_seq, 1);

        let delivered = collect(Subscription {
            replay: Vec::new(),
            live: listener_rx,
        })
        .await;
        assert_eq!(seqs(&delivered), vec![1]);
    }

    #[tokio::test]
    async fn test_recover_interrupted_runs() {
        let (manager, store) = manager_with(Arc::new(GatedTools::default()));
        store.create_run(&StoredRun::started("stale")).await.unwrap();
        store.append_event(&envelope("stale", 1)).await.unwrap();

        assert_eq!(manager.recover_interrupted_runs().await.unwrap(), 1);

        let run = manager.get_run("stale").await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some(INTERRUPTED));
        assert_eq!(run.last_seq, 2);

        let events = store.list_events("stale", 0).await.unwrap();
        assert_eq!(events[1].event_type, EventType::RunFailed);
        assert_eq!(events[1].payload["error"], INTERRUPTED);
        assert_eq!(manager.recover_interrupted_runs().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_prune_forgets_old_terminal_runs() {
        let tools = Arc::new(GatedTools::default());
        tools.release.notify_one();
        let (manager, _) = manager_with(tools);
        let run = manager
            .start_run(gated_program(), json!({}), json!({}))
            .await
            .unwrap();
        wait_until(&manager, &run.run_id, |r| r.status.is_terminal()).await;

        assert_eq!(manager.prune(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(manager.prune(Duration::ZERO).await.unwrap(), 1);
        assert!(matches!(
            manager.get_run(&run.run_id).await,
            Err(ManagerError::NotFound(_))
        ));
        assert!(manager.runs.lock().await.is_empty());
    }
}
