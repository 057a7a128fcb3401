//! Output validation for `LLM_WRITE` nodes.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::execir::{LlmWriteNode, ValidatorSpec};

/// The one supported invariant shape: `$out.<key> in $in.<key>`.
static MEMBERSHIP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*\$out\.(\w+)\s+in\s+\$in\.(\w+)\s*$").expect("invariant regex should compile")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Schema,
    Invariant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub kind: IssueKind,
    pub message: String,
    /// JSON pointer into the output; empty for the root.
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
}

impl ValidationOutcome {
    fn from_issues(errors: Vec<ValidationIssue>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }

    /// Messages joined with `"; "`, as fed to the repair prompt.
    pub fn joined_messages(&self) -> String {
        self.errors
            .iter()
            .map(|e| match e.path.as_str() {
                "" => e.message.clone(),
                path => format!("{}: {}", path, e.message),
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Run every validator declared on `node` against `output`.
///
/// Schema validators report all violations rather than stopping at the
/// first one. `input` is the run's `$in` namespace.
pub fn validate(output: &Value, node: &LlmWriteNode, input: Option<&Value>) -> ValidationOutcome {
    let mut issues = Vec::new();
    for spec in &node.validators {
        match spec {
            ValidatorSpec::JsonSchema { schema } => check_schema(schema, output, &mut issues),
            ValidatorSpec::Invariant { expression } => {
                check_invariant(expression, output, input, &mut issues)
            }
        }
    }
    ValidationOutcome::from_issues(issues)
}

fn check_schema(schema: &Value, output: &Value, issues: &mut Vec<ValidationIssue>) {
    let compiled = match jsonschema::JSONSchema::compile(schema) {
        Ok(compiled) => compiled,
        Err(e) => {
            issues.push(ValidationIssue {
                kind: IssueKind::Schema,
                message: format!("invalid output schema: {}", e),
                path: String::new(),
            });
            return;
        }
    };

    let result = compiled.validate(output);
    if let Err(errors) = result {
        issues.extend(errors.map(|err| ValidationIssue {
            kind: IssueKind::Schema,
            message: err.to_string(),
            path: err.instance_path.to_string(),
        }));
    };
}

fn check_invariant(
    expression: &str,
    output: &Value,
    input: Option<&Value>,
    issues: &mut Vec<ValidationIssue>,
) {
    let Some(caps) = MEMBERSHIP.captures(expression) else {
        warn!(expression, "unsupported invariant expression, treating as satisfied");
        return;
    };
    let (out_key, in_key) = (&caps[1], &caps[2]);

    let candidate = output.get(out_key).unwrap_or(&Value::Null);
    let message = match input.and_then(|i| i.get(in_key)) {
        Some(Value::Array(allowed)) if allowed.contains(candidate) => return,
        Some(Value::Array(_)) => format!("{} is not a member of $in.{}", candidate, in_key),
        _ => format!("$in.{} is not an array", in_key),
    };

    issues.push(ValidationIssue {
        kind: IssueKind::Invariant,
        message: format!("invariant '{}' failed: {}", expression.trim(), message),
        path: format!("/{}", out_key),
    });
}
