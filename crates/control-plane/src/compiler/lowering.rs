//! The lowering pipeline: validation gates followed by per-node lowering.

use std::collections::{BTreeMap, HashSet};

use super::analyzer::analyze_document;
use super::document::{NodeKind, WorkflowDocument, WorkflowEdge};
use super::error::{CompileError, GraphValidationError, UnsupportedNodeError};
use super::lowerers::{lower_node, LoweringContext};
use crate::execir::{ExecEdge, ExecProgram, EXEC_IR_VERSION};

/// Lower a workflow document into an ExecIR program.
///
/// Fails unless the document has exactly one start node, no cycles and no
/// unreachable nodes. Identical documents always produce identical programs.
pub fn lower(document: &WorkflowDocument) -> Result<ExecProgram, CompileError> {
    check_structure(document)?;
    let entry_node = find_start(document)?;

    let analysis = analyze_document(document);
    if !analysis.cycles.is_empty() {
        return Err(GraphValidationError::Cycles(analysis.cycles).into());
    }
    if !analysis.unreachable.is_empty() {
        return Err(GraphValidationError::Unreachable(analysis.unreachable).into());
    }

    let mut nodes = Vec::with_capacity(document.nodes.len());
    let mut edges = Vec::with_capacity(document.edges.len());
    let mut templates = BTreeMap::new();

    for node in &document.nodes {
        let kind = NodeKind::parse(&node.node_type).ok_or_else(|| UnsupportedNodeError {
            node_id: node.id.clone(),
            node_type: node.node_type.clone(),
        })?;

        let outgoing: Vec<&WorkflowEdge> = document
            .edges
            .iter()
            .filter(|e| e.source == node.id)
            .collect();
        let ctx = LoweringContext {
            node,
            outgoing: &outgoing,
        };

        let lowered = lower_node(kind, &ctx)?;
        for template_id in &lowered.required_template_ids {
            if !lowered.templates.contains_key(template_id) {
                return Err(GraphValidationError::invalid_node(
                    &node.id,
                    format!("missing prompt template {}", template_id),
                )
                .into());
            }
        }

        nodes.extend(lowered.exec_nodes);
        edges.extend(lowered.exec_edges);
        if !kind.is_branching() {
            edges.extend(
                outgoing
                    .iter()
                    .map(|e| ExecEdge::always(e.source.clone(), e.target.clone())),
            );
        }
        templates.extend(lowered.templates);
    }

    tracing::debug!(
        entry = %entry_node,
        nodes = nodes.len(),
        edges = edges.len(),
        "Lowered workflow document"
    );

    Ok(ExecProgram {
        version: EXEC_IR_VERSION.to_string(),
        entry_node,
        nodes,
        edges,
        templates,
    })
}

fn check_structure(document: &WorkflowDocument) -> Result<(), GraphValidationError> {
    let mut ids = HashSet::new();
    for node in &document.nodes {
        if !ids.insert(node.id.as_str()) {
            return Err(GraphValidationError::DuplicateNode(node.id.clone()));
        }
    }

    for edge in &document.edges {
        for endpoint in [&edge.source, &edge.target] {
            if !ids.contains(endpoint.as_str()) {
                return Err(GraphValidationError::DanglingEdge {
                    edge: edge.label(),
                    node: endpoint.clone(),
                });
            }
        }
    }
    Ok(())
}

fn find_start(document: &WorkflowDocument) -> Result<String, GraphValidationError> {
    let starts: Vec<String> = document
        .nodes
        .iter()
        .filter(|n| NodeKind::parse(&n.node_type) == Some(NodeKind::Start))
        .map(|n| n.id.clone())
        .collect();

    match starts.len() {
        0 => Err(GraphValidationError::NoStartNode),
        1 => Ok(starts.into_iter().next().unwrap_or_default()),
        _ => Err(GraphValidationError::MultipleStartNodes(starts)),
    }
}
