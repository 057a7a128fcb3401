//! Bounded re-prompt loop for outputs that failed validation.

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::prompt::{PromptCompiler, RepairPacket};
use super::provider::{LlmProvider, ProviderError};
use crate::execir::{LlmWriteNode, ValidatorSpec};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepairOutcome {
    pub repaired: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    pub attempts: u32,
}

/// Schema the repaired output must satisfy: the declared output schema,
/// else the first `json_schema` validator, else `null`.
pub fn expected_schema(node: &LlmWriteNode) -> Value {
    node.output_schema
        .clone()
        .or_else(|| {
            node.validators.iter().find_map(|v| match v {
                ValidatorSpec::JsonSchema { schema } => Some(schema.clone()),
                ValidatorSpec::Invariant { .. } => None,
            })
        })
        .unwrap_or(Value::Null)
}

/// Re-prompt until the model returns parseable JSON or attempts run out.
///
/// Provider errors are returned as-is; the caller treats them as fatal.
pub async fn attempt_repair(
    node: &LlmWriteNode,
    previous_output: &str,
    errors: &str,
    provider: &dyn LlmProvider,
) -> Result<RepairOutcome, ProviderError> {
    let max_attempts = node.retry_policy.effective_attempts();
    let expected = expected_schema(node);
    let mut previous = previous_output.to_string();

    for attempt in 1..=max_attempts {
        let packet = RepairPacket {
            error: errors.to_string(),
            previous_output: previous.clone(),
            expected_schema: expected.clone(),
        };
        let response = provider
            .chat(PromptCompiler::compile_repair(&node.model_class, &packet))
            .await?;

        match serde_json::from_str::<Value>(response.content.trim()) {
            Ok(output) => {
                debug!(attempt, "repair produced parseable output");
                return Ok(RepairOutcome {
                    repaired: true,
                    output: Some(output),
                    attempts: attempt,
                });
            }
            Err(e) => {
                debug!(attempt, error = %e, "repair response was not JSON");
                previous = response.content;
            }
        }
    }

    Ok(RepairOutcome {
        repaired: false,
        output: None,
        attempts: max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::provider::{ChatRequest, ChatResponse};
    use crate::execir::{NodeOutputs, RetryPolicy};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct Scripted {
        replies: Mutex<Vec<Result<String, ProviderError>>>,
        seen: Mutex<Vec<ChatRequest>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<&str, ProviderError>>) -> Self {
            Self {
                replies: Mutex::new(
                    replies
                        .into_iter()
                        .rev()
                        .map(|r| r.map(str::to_string))
                        .collect(),
                ),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
            self.seen.lock().unwrap().push(request);
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok("not json".to_string()))?;
            Ok(ChatResponse::text(reply))
        }
    }

    fn node(max_attempts: u32) -> LlmWriteNode {
        LlmWriteNode {
            model_class: "fast".to_string(),
            prompt_template_id: "t".to_string(),
            inputs: Default::default(),
            output_schema: Some(json!({"type": "object"})),
            validators: vec![],
            retry_policy: RetryPolicy { max_attempts },
            escalation_policy: None,
            outputs: NodeOutputs::default(),
        }
    }

    #[tokio::test]
    async fn test_first_parse_wins() {
        let provider = Scripted::new(vec![Ok("nope"), Ok("{\"ok\": true}"), Ok("{}")]);
        let outcome = attempt_repair(&node(3), "bad", "missing ok", &provider)
            .await
            .unwrap();
        assert!(outcome.repaired);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.output, Some(json!({"ok": true})));

        let seen = provider.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        // The unparsable reply is carried into the next attempt.
        assert!(seen[1].messages[1].content.contains("Previous output:\nnope"));
    }

    #[tokio::test]
    async fn test_attempt_ceiling() {
        let provider = Scripted::new(vec![]);
        let outcome = attempt_repair(&node(10), "bad", "e", &provider).await.unwrap();
        assert!(!outcome.repaired);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(provider.seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_provider_error_propagates() {
        let provider = Scripted::new(vec![Err(ProviderError::new("down").with_status(503))]);
        let err = attempt_repair(&node(2), "bad", "e", &provider)
            .await
            .unwrap_err();
        assert_eq!(err.status_code, Some(503));
    }

    #[test]
    fn test_expected_schema_fallback() {
        let mut n = node(1);
        n.output_schema = None;
        assert_eq!(expected_schema(&n), Value::Null);
        n.validators.push(ValidatorSpec::JsonSchema {
            schema: json!({"type": "array"}),
        });
        assert_eq!(expected_schema(&n), json!({"type": "array"}));
    }
}
