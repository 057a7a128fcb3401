//! `http.request` tool.

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::ToolError;
use crate::parse_body;

pub(crate) const TOOL_NAME: &str = "http.request";

/// HTTP method.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
#[allow(clippy::upper_case_acronyms)] // HTTP methods are conventionally uppercase
pub enum HttpMethod {
    #[default]
    GET,
    POST,
    PUT,
    PATCH,
    DELETE,
    HEAD,
    OPTIONS,
}

impl From<HttpMethod> for Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::GET => Method::GET,
            HttpMethod::POST => Method::POST,
            HttpMethod::PUT => Method::PUT,
            HttpMethod::PATCH => Method::PATCH,
            HttpMethod::DELETE => Method::DELETE,
            HttpMethod::HEAD => Method::HEAD,
            HttpMethod::OPTIONS => Method::OPTIONS,
        }
    }
}

/// Arguments accepted by `http.request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequestArgs {
    /// URL to request.
    pub url: String,

    /// HTTP method (default: GET). Accepts any casing.
    #[serde(default, deserialize_with = "deserialize_method")]
    pub method: HttpMethod,

    /// Request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Request body. Strings are sent verbatim, everything else as JSON.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

fn deserialize_method<'de, D>(deserializer: D) -> Result<HttpMethod, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    let upper = Value::String(raw.to_uppercase());
    serde_json::from_value(upper).map_err(serde::de::Error::custom)
}

impl HttpRequestArgs {
    /// Interpret node arguments as an HTTP request.
    pub fn from_value(args: &Value) -> Result<Self, ToolError> {
        serde_json::from_value(args.clone()).map_err(|e| ToolError::invalid(TOOL_NAME, e.to_string()))
    }
}

/// Issue the request and parse the body as JSON with a raw-text fallback.
pub(crate) async fn send(client: &reqwest::Client, args: &HttpRequestArgs) -> Result<Value, ToolError> {
    let mut request = client.request(args.method.into(), &args.url);

    for (key, value) in &args.headers {
        request = request.header(key.as_str(), value.as_str());
    }

    if let Some(ref body) = args.body {
        request = match body {
            Value::String(s) => request.body(s.clone()),
            Value::Null => request,
            _ => request.json(body),
        };
    }

    tracing::debug!(method = ?args.method, url = %args.url, "Sending tool HTTP request");

    let response = request.send().await?;
    let status = response.status();
    let text = response.text().await?;

    if !status.is_success() {
        return Err(ToolError::HttpStatus {
            status: status.as_u16(),
            body: text,
        });
    }

    Ok(parse_body(&text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_args_defaults_to_get() {
        let args = HttpRequestArgs::from_value(&json!({"url": "http://localhost/x"})).unwrap();
        assert_eq!(args.method, HttpMethod::GET);
        assert!(args.headers.is_empty());
        assert!(args.body.is_none());
    }

    #[test]
    fn test_args_method_case_insensitive() {
        let args =
            HttpRequestArgs::from_value(&json!({"url": "http://localhost", "method": "post"}))
                .unwrap();
        assert_eq!(args.method, HttpMethod::POST);
    }

    #[test]
    fn test_args_require_url() {
        let err = HttpRequestArgs::from_value(&json!({"method": "GET"})).unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
    }
}
