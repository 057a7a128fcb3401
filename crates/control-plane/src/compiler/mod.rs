//! Workflow compiler: graph analysis and lowering to ExecIR.

pub mod analyzer;
pub mod document;
pub mod error;
pub mod lowerers;
pub mod lowering;

pub use analyzer::{analyze, analyze_document, GraphAnalysis};
pub use document::{NodeKind, WorkflowDocument, WorkflowEdge, WorkflowNode};
pub use error::{CompileError, GraphValidationError, UnsupportedNodeError};
pub use lowering::lower;
