//! Edge condition evaluation for SWITCH nodes, plus state-ref resolution
//! inside tool arguments.

use regex::Regex;
use serde_json::Value;

use super::state::StateSnapshot;
use crate::execir::{EdgeCondition, Operand, StateRef};

/// Resolve an operand against state. Absent refs resolve to `null`.
pub fn resolve_operand(operand: &Operand, state: &StateSnapshot) -> Value {
    match operand {
        Operand::Ref { reference } => state.get(reference).cloned().unwrap_or(Value::Null),
        Operand::Literal { literal } => literal.clone(),
    }
}

/// Replace string leaves that are state refs (`"$vars.url"`) with their
/// current value. Other values are copied unchanged.
pub fn resolve_refs(value: &Value, state: &StateSnapshot) -> Value {
    match value {
        Value::String(s) if StateRef::looks_like_ref(s) => match StateRef::parse(s) {
            Ok(reference) => state.get(&reference).cloned().unwrap_or(Value::Null),
            Err(_) => value.clone(),
        },
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_refs(v, state)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_refs(v, state)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Evaluate an edge condition. `always` is true.
pub fn evaluate_condition(condition: &EdgeCondition, state: &StateSnapshot) -> bool {
    match condition {
        EdgeCondition::Always => true,
        EdgeCondition::Eq { left, right } => {
            values_equal(&resolve_operand(left, state), &resolve_operand(right, state))
        }
        EdgeCondition::Neq { left, right } => {
            !values_equal(&resolve_operand(left, state), &resolve_operand(right, state))
        }
        EdgeCondition::Contains { left, right } => {
            contains(&resolve_operand(left, state), &resolve_operand(right, state))
        }
        EdgeCondition::Regex { left, right } => {
            let subject = as_text(&resolve_operand(left, state));
            let pattern = as_text(&resolve_operand(right, state));
            match Regex::new(&pattern) {
                Ok(re) => re.is_match(&subject),
                Err(e) => {
                    tracing::warn!(pattern = %pattern, error = %e, "Invalid regex in edge condition");
                    false
                }
            }
        }
    }
}

/// Equality with light coercion: numbers compare numerically and a string
/// equals a scalar with the same text.
pub fn values_equal(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::String(s), other @ (Value::Number(_) | Value::Bool(_)))
        | (other @ (Value::Number(_) | Value::Bool(_)), Value::String(s)) => {
            *s == other.to_string()
        }
        _ => false,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => s.contains(as_text(needle).as_str()),
        Value::Array(items) => items.iter().any(|item| values_equal(item, needle)),
        Value::Object(map) => needle.as_str().is_some_and(|key| map.contains_key(key)),
        _ => false,
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state::StateStore;
    use serde_json::json;

    fn state() -> StateStore {
        let mut store = StateStore::new(json!({}), json!({"tags": ["a", "b"], "n": 2}));
        store
            .set(&StateRef::parse("$vars.flag").unwrap(), json!("yes"))
            .unwrap();
        store
    }

    fn op_ref(raw: &str) -> Operand {
        Operand::reference(StateRef::parse(raw).unwrap())
    }

    #[test]
    fn test_resolve_refs_in_args() {
        let store = state();
        let args = json!({
            "url": "https://example.test",
            "body": {"flag": "$vars.flag", "tags": ["$in.tags", "$vars.missing"]},
            "note": "$varsity"
        });
        assert_eq!(
            resolve_refs(&args, store.view()),
            json!({
                "url": "https://example.test",
                "body": {"flag": "yes", "tags": [["a", "b"], null]},
                "note": "$varsity"
            })
        );
    }

    #[test]
    fn test_eq_and_neq() {
        let store = state();
        let eq = EdgeCondition::Eq {
            left: op_ref("$vars.flag"),
            right: Operand::literal("yes"),
        };
        assert!(evaluate_condition(&eq, store.view()));

        let neq = EdgeCondition::Neq {
            left: op_ref("$vars.flag"),
            right: Operand::literal("yes"),
        };
        assert!(!evaluate_condition(&neq, store.view()));

        let coerced = EdgeCondition::Eq {
            left: op_ref("$in.n"),
            right: Operand::literal("2"),
        };
        assert!(evaluate_condition(&coerced, store.view()));
    }

    #[test]
    fn test_absent_ref_is_null() {
        let store = state();
        let eq = EdgeCondition::Eq {
            left: op_ref("$vars.missing"),
            right: Operand::literal(Value::Null),
        };
        assert!(evaluate_condition(&eq, store.view()));
    }

    #[test]
    fn test_contains() {
        let store = state();
        let in_array = EdgeCondition::Contains {
            left: op_ref("$in.tags"),
            right: Operand::literal("b"),
        };
        assert!(evaluate_condition(&in_array, store.view()));

        let in_string = EdgeCondition::Contains {
            left: op_ref("$vars.flag"),
            right: Operand::literal("es"),
        };
        assert!(evaluate_condition(&in_string, store.view()));
    }

    #[test]
    fn test_regex() {
        let store = state();
        let matches = EdgeCondition::Regex {
            left: op_ref("$vars.flag"),
            right: Operand::literal("^y.s$"),
        };
        assert!(evaluate_condition(&matches, store.view()));

        let invalid = EdgeCondition::Regex {
            left: op_ref("$vars.flag"),
            right: Operand::literal("("),
        };
        assert!(!evaluate_condition(&invalid, store.view()));
    }
}
