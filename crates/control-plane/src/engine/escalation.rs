//! Model escalation advice.
//!
//! The runner asks for advice after a node fails validation and records it
//! in a trace event. The model class actually sent is never changed.

use serde::Serialize;

use crate::execir::LlmWriteNode;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationDecision {
    pub escalate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_model_class: Option<String>,
}

pub trait EscalationEngine: Send + Sync {
    fn should_escalate(&self, node: &LlmWriteNode, error: &str) -> EscalationDecision;
}

/// Escalates when the error message contains any configured trigger.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubstringEscalation;

impl EscalationEngine for SubstringEscalation {
    fn should_escalate(&self, node: &LlmWriteNode, error: &str) -> EscalationDecision {
        let Some(policy) = &node.escalation_policy else {
            return EscalationDecision::default();
        };
        if policy
            .triggers
            .iter()
            .any(|t| !t.is_empty() && error.contains(t.as_str()))
        {
            EscalationDecision {
                escalate: true,
                to_model_class: policy.to_model_class.clone(),
            }
        } else {
            EscalationDecision::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execir::{EscalationPolicy, NodeOutputs, RetryPolicy};

    fn node(policy: Option<EscalationPolicy>) -> LlmWriteNode {
        LlmWriteNode {
            model_class: "fast".to_string(),
            prompt_template_id: "t".to_string(),
            inputs: Default::default(),
            output_schema: None,
            validators: vec![],
            retry_policy: RetryPolicy::default(),
            escalation_policy: policy,
            outputs: NodeOutputs::default(),
        }
    }

    #[test]
    fn test_trigger_match() {
        let n = node(Some(EscalationPolicy {
            triggers: vec!["schema".to_string(), "timeout".to_string()],
            to_model_class: Some("strong".to_string()),
        }));
        let decision = SubstringEscalation.should_escalate(&n, "output failed schema check");
        assert!(decision.escalate);
        assert_eq!(decision.to_model_class.as_deref(), Some("strong"));

        assert!(!SubstringEscalation.should_escalate(&n, "rate limited").escalate);
    }

    #[test]
    fn test_no_policy() {
        let decision = SubstringEscalation.should_escalate(&node(None), "anything");
        assert_eq!(decision, EscalationDecision::default());
    }
}
