//! Workflow compilation endpoints. Both are pure: nothing is stored.

use axum::Json;

use crate::compiler::{analyze_document, lower, GraphAnalysis, WorkflowDocument};
use crate::error::AppResult;
use crate::execir::ExecProgram;

/// `POST /api/workflows/compile`
///
/// Lowers a workflow document to ExecIR. Invalid graphs and unsupported
/// node types are rejected with `422`.
pub async fn compile(Json(document): Json<WorkflowDocument>) -> AppResult<Json<ExecProgram>> {
    let program = lower(&document)?;
    tracing::debug!(
        nodes = program.nodes.len(),
        edges = program.edges.len(),
        "workflow compiled"
    );
    Ok(Json(program))
}

/// `POST /api/workflows/analyze`
///
/// Reports execution order, cycles and unreachable nodes without lowering.
pub async fn analyze(Json(document): Json<WorkflowDocument>) -> Json<GraphAnalysis> {
    Json(analyze_document(&document))
}
