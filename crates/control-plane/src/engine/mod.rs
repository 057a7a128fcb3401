//! Workflow execution engine.
//!
//! - **Runner**: the execution state machine over an ExecIR program
//! - **State**: the four-namespace per-run state store
//! - **Prompt / Validator / Repair**: the `LLM_WRITE` pipeline
//! - **Escalation**: advisory model-escalation seam
//! - **Provider / Failure**: the model contract and failure normalization

pub mod error;
pub mod escalation;
pub mod evaluator;
pub mod failure;
pub mod prompt;
pub mod provider;
pub mod repair;
pub mod runner;
pub mod state;
pub mod validator;

pub use error::EngineError;
pub use escalation::{EscalationDecision, EscalationEngine, SubstringEscalation};
pub use failure::{FailureCode, ProviderFailure};
pub use prompt::{PromptCompiler, PromptError, RepairPacket};
pub use provider::{
    ChatMessage, ChatRequest, ChatResponse, HttpChatProvider, LlmProvider, ProviderError,
    ResponseFormat, Role, UnconfiguredProvider,
};
pub use repair::{attempt_repair, RepairOutcome};
pub use runner::{Checkpoint, JoinProgress, RunOutcome, RunResult, Runner};
pub use state::{StateError, StateSnapshot, StateStore};
pub use validator::{validate, IssueKind, ValidationIssue, ValidationOutcome};
