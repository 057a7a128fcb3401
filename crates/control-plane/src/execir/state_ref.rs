//! References into the four state namespaces.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// One of the four state namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Namespace {
    /// Workflow variables, writable.
    #[serde(rename = "$vars")]
    Vars,
    /// Scratch values, writable.
    #[serde(rename = "$tmp")]
    Tmp,
    /// Caller context, read-only.
    #[serde(rename = "$ctx")]
    Ctx,
    /// Run input, read-only.
    #[serde(rename = "$in")]
    In,
}

impl Namespace {
    pub const ALL: [Namespace; 4] = [Namespace::Vars, Namespace::Tmp, Namespace::Ctx, Namespace::In];

    pub fn prefix(&self) -> &'static str {
        match self {
            Namespace::Vars => "$vars",
            Namespace::Tmp => "$tmp",
            Namespace::Ctx => "$ctx",
            Namespace::In => "$in",
        }
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, Namespace::Vars | Namespace::Tmp)
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|ns| ns.prefix() == prefix)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// A string path that could not be parsed as a state reference.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid state reference '{reference}': {reason}")]
pub struct StateRefError {
    pub reference: String,
    pub reason: &'static str,
}

/// Dotted path into a namespace, e.g. `$vars.user.name`.
///
/// Serialized as its string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StateRef {
    namespace: Namespace,
    segments: Vec<String>,
}

impl StateRef {
    /// Parse `$ns` or `$ns.a.b`.
    pub fn parse(raw: &str) -> Result<Self, StateRefError> {
        let err = |reason| StateRefError {
            reference: raw.to_string(),
            reason,
        };

        let mut parts = raw.trim().split('.');
        let head = parts.next().unwrap_or_default();
        let namespace = Namespace::from_prefix(head).ok_or_else(|| err("unknown namespace"))?;

        let segments = parts.map(str::to_string).collect::<Vec<_>>();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(err("empty path segment"));
        }

        Ok(Self { namespace, segments })
    }

    /// Whether `raw` starts with one of the namespace prefixes.
    pub fn looks_like_ref(raw: &str) -> bool {
        Namespace::ALL.iter().any(|ns| {
            raw == ns.prefix()
                || raw
                    .strip_prefix(ns.prefix())
                    .is_some_and(|rest| rest.starts_with('.'))
        })
    }

    /// Reference to the root of a namespace.
    pub fn root(namespace: Namespace) -> Self {
        Self {
            namespace,
            segments: Vec::new(),
        }
    }

    /// Append a path segment.
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self {
            namespace: self.namespace,
            segments,
        }
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_writable(&self) -> bool {
        self.namespace.is_writable()
    }
}

impl fmt::Display for StateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.namespace.prefix())?;
        for segment in &self.segments {
            write!(f, ".{}", segment)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for StateRef {
    type Err = StateRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for StateRef {
    type Error = StateRefError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<StateRef> for String {
    fn from(value: StateRef) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let r = StateRef::parse("$vars.user.name").unwrap();
        assert_eq!(r.namespace(), Namespace::Vars);
        assert_eq!(r.segments(), ["user", "name"]);
        assert_eq!(r.to_string(), "$vars.user.name");

        let root = StateRef::parse("$in").unwrap();
        assert!(root.segments().is_empty());
        assert!(!root.is_writable());
    }

    #[test]
    fn test_parse_rejects_bad_refs() {
        assert!(StateRef::parse("vars.x").is_err());
        assert!(StateRef::parse("$input.x").is_err());
        assert!(StateRef::parse("$vars..x").is_err());
        assert!(StateRef::parse("$vars.").is_err());
    }

    #[test]
    fn test_looks_like_ref() {
        assert!(StateRef::looks_like_ref("$vars.flag"));
        assert!(StateRef::looks_like_ref("$ctx"));
        assert!(!StateRef::looks_like_ref("$variable"));
        assert!(!StateRef::looks_like_ref("yes"));
    }

    #[test]
    fn test_serde_as_string() {
        let r: StateRef = serde_json::from_str("\"$tmp.a\"").unwrap();
        assert_eq!(serde_json::to_string(&r).unwrap(), "\"$tmp.a\"");
        assert!(serde_json::from_str::<StateRef>("\"$nope\"").is_err());
    }
}
