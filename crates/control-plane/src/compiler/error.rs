//! Compile-time errors. No partial program is ever produced when one of
//! these is returned.

use thiserror::Error;

/// The workflow graph is structurally invalid.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphValidationError {
    #[error("workflow has no start node")]
    NoStartNode,

    #[error("workflow has multiple start nodes: {}", .0.join(", "))]
    MultipleStartNodes(Vec<String>),

    #[error("duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("edge {edge} references unknown node {node}")]
    DanglingEdge { edge: String, node: String },

    #[error("workflow contains cycles: {0:?}")]
    Cycles(Vec<Vec<String>>),

    #[error("unreachable nodes: {}", .0.join(", "))]
    Unreachable(Vec<String>),

    #[error("invalid node {node_id}: {message}")]
    InvalidNode { node_id: String, message: String },
}

impl GraphValidationError {
    pub fn invalid_node(node_id: &str, message: impl Into<String>) -> Self {
        GraphValidationError::InvalidNode {
            node_id: node_id.to_string(),
            message: message.into(),
        }
    }
}

/// A node type with no lowerer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unsupported node type '{node_type}' on node {node_id}")]
pub struct UnsupportedNodeError {
    pub node_id: String,
    pub node_type: String,
}

/// Any failure of the lowering pipeline.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompileError {
    #[error(transparent)]
    Graph(#[from] GraphValidationError),

    #[error(transparent)]
    UnsupportedNode(#[from] UnsupportedNodeError),
}
