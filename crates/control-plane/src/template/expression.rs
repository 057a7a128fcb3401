//! Jinja2-style expression evaluation for `TRANSFORM` nodes, using minijinja.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use minijinja::{value::ValueKind, Environment, Error, ErrorKind, Value};
use thiserror::Error;

/// Expression failed to parse or evaluate.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("expression error: {0}")]
pub struct ExpressionError(pub String);

impl From<Error> for ExpressionError {
    fn from(e: Error) -> Self {
        ExpressionError(e.to_string())
    }
}

/// Expression evaluator with custom filters.
pub struct ExpressionEvaluator {
    env: Environment<'static>,
}

impl Default for ExpressionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpressionEvaluator {
    /// Create a new evaluator with custom filters.
    pub fn new() -> Self {
        let mut env = Environment::new();

        env.add_filter("b64encode", filter_b64encode);
        env.add_filter("b64decode", filter_b64decode);
        env.add_filter("tojson", filter_tojson);
        env.add_filter("fromjson", filter_fromjson);
        env.add_filter("keys", filter_keys);
        env.add_filter("values", filter_values);
        env.add_filter("pick", filter_pick);

        Self { env }
    }

    /// Syntax-check an expression without evaluating it.
    pub fn check(expression: &str) -> Result<(), ExpressionError> {
        let env = Environment::new();
        env.compile_expression(expression)?;
        Ok(())
    }

    /// Evaluate `expression` against a JSON context object.
    ///
    /// Undefined results come back as `null`.
    pub fn evaluate(
        &self,
        expression: &str,
        context: &serde_json::Value,
    ) -> Result<serde_json::Value, ExpressionError> {
        let compiled = self.env.compile_expression(expression)?;
        let value = compiled.eval(context)?;
        Ok(minijinja_to_json(&value))
    }
}

fn minijinja_to_json(value: &Value) -> serde_json::Value {
    if value.is_undefined() || value.is_none() {
        return serde_json::Value::Null;
    }
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

fn filter_b64encode(value: &Value) -> String {
    BASE64.encode(value.to_string().as_bytes())
}

fn filter_b64decode(value: &Value) -> Result<String, Error> {
    let decoded = BASE64.decode(value.to_string().as_bytes()).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("b64decode error: {}", e),
        )
    })?;
    String::from_utf8(decoded)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("utf8 error: {}", e)))
}

fn filter_tojson(value: &Value) -> Result<String, Error> {
    serde_json::to_string(&minijinja_to_json(value))
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("tojson error: {}", e)))
}

fn filter_fromjson(value: &Value) -> Result<Value, Error> {
    let parsed: serde_json::Value = serde_json::from_str(&value.to_string()).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("fromjson error: {}", e),
        )
    })?;
    Ok(Value::from_serialize(&parsed))
}

fn filter_keys(value: &Value) -> Result<Vec<String>, Error> {
    if value.kind() != ValueKind::Map {
        return Err(Error::new(
            ErrorKind::InvalidOperation,
            "keys requires a mapping",
        ));
    }
    let iter = value
        .try_iter()
        .map_err(|_| Error::new(ErrorKind::InvalidOperation, "cannot iterate keys"))?;
    Ok(iter.map(|v| v.to_string()).collect())
}

fn filter_values(value: &Value) -> Result<Vec<Value>, Error> {
    if value.kind() != ValueKind::Map {
        return Err(Error::new(
            ErrorKind::InvalidOperation,
            "values requires a mapping",
        ));
    }
    let iter = value
        .try_iter()
        .map_err(|_| Error::new(ErrorKind::InvalidOperation, "cannot iterate values"))?;
    Ok(iter.filter_map(|key| value.get_item(&key).ok()).collect())
}

/// Keep only the named keys of a mapping.
fn filter_pick(value: &Value, keys: Vec<String>) -> Result<Value, Error> {
    let json = minijinja_to_json(value);
    let serde_json::Value::Object(map) = json else {
        return Err(Error::new(
            ErrorKind::InvalidOperation,
            "pick requires a mapping",
        ));
    };
    let picked: serde_json::Map<String, serde_json::Value> = map
        .into_iter()
        .filter(|(k, _)| keys.contains(k))
        .collect();
    Ok(Value::from_serialize(&picked))
}
