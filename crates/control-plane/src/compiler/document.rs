//! Workflow document model, as produced by the editor.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A workflow graph as authored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default)]
    pub nodes: Vec<WorkflowNode>,

    #[serde(default)]
    pub edges: Vec<WorkflowEdge>,
}

/// A node in the authored graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: String,

    /// Node type name; see [`NodeKind`].
    #[serde(rename = "type")]
    pub node_type: String,

    /// Type-specific configuration.
    #[serde(default)]
    pub data: Value,
}

/// A directed edge in the authored graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowEdge {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub source: String,

    pub target: String,

    /// Output port on the source node (branch name for branching nodes).
    #[serde(default, alias = "source_handle", skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
}

impl WorkflowEdge {
    /// Stable label for diagnostics.
    pub fn label(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| format!("{}->{}", self.source, self.target))
    }
}

/// The closed set of authorable node types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Start,
    End,
    Llm,
    IfElse,
    Switch,
    AskUserQuestion,
    Tool,
    SetVariable,
    GetVariable,
    Transform,
}

impl NodeKind {
    /// Resolve a node type name. Case, `-` and `_` are ignored, so
    /// `if_else`, `ifElse` and `if-else` are the same type.
    pub fn parse(node_type: &str) -> Option<Self> {
        let key: String = node_type
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .flat_map(char::to_lowercase)
            .collect();

        let kind = match key.as_str() {
            "start" => NodeKind::Start,
            "end" => NodeKind::End,
            "llm" | "llmwrite" => NodeKind::Llm,
            "ifelse" => NodeKind::IfElse,
            "switch" => NodeKind::Switch,
            "askuserquestion" => NodeKind::AskUserQuestion,
            "tool" | "toolcall" => NodeKind::Tool,
            "setvariable" | "varset" => NodeKind::SetVariable,
            "getvariable" | "varget" => NodeKind::GetVariable,
            "transform" => NodeKind::Transform,
            _ => return None,
        };
        Some(kind)
    }

    /// Branching kinds emit their own conditioned edges.
    pub fn is_branching(&self) -> bool {
        matches!(
            self,
            NodeKind::IfElse | NodeKind::Switch | NodeKind::AskUserQuestion
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_kind_aliases() {
        assert_eq!(NodeKind::parse("if_else"), Some(NodeKind::IfElse));
        assert_eq!(NodeKind::parse("ifElse"), Some(NodeKind::IfElse));
        assert_eq!(NodeKind::parse("ask-user-question"), Some(NodeKind::AskUserQuestion));
        assert_eq!(NodeKind::parse("LLM"), Some(NodeKind::Llm));
        assert_eq!(NodeKind::parse("webhook"), None);
    }

    #[test]
    fn test_edge_handle_aliases() {
        let a: WorkflowEdge =
            serde_json::from_value(json!({"source": "a", "target": "b", "sourceHandle": "true"}))
                .unwrap();
        let b: WorkflowEdge =
            serde_json::from_value(json!({"source": "a", "target": "b", "source_handle": "true"}))
                .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.label(), "a->b");
    }
}
