//! Per-run state store.
//!
//! Four namespaces, each a JSON object:
//!
//! - `$vars`: workflow variables (writable)
//! - `$tmp`: scratch values (writable)
//! - `$ctx`: caller context (read-only)
//! - `$in`: run input (read-only)
//!
//! Values are `serde_json::Value`, so everything in state is serializable
//! and a snapshot is always a full structural copy.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::execir::{Namespace, StateRef};

/// Errors raised by [`StateStore::set`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StateError {
    /// Attempted write to `$ctx` or `$in`.
    #[error("cannot write {reference}: namespace {namespace} is read-only")]
    ReadOnlyNamespace {
        namespace: Namespace,
        reference: String,
    },

    /// A namespace root must stay an object.
    #[error("cannot replace namespace root {0} with a non-object value")]
    NonObjectRoot(Namespace),
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Coerce a caller-supplied namespace root into an object.
fn object_root(value: Value) -> Value {
    match value {
        Value::Object(_) => value,
        Value::Null => empty_object(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            Value::Object(map)
        }
    }
}

/// Independent copy of all four namespaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    #[serde(rename = "$vars", default = "empty_object")]
    pub vars: Value,
    #[serde(rename = "$tmp", default = "empty_object")]
    pub tmp: Value,
    #[serde(rename = "$ctx", default = "empty_object")]
    pub ctx: Value,
    #[serde(rename = "$in", default = "empty_object")]
    pub input: Value,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self {
            vars: empty_object(),
            tmp: empty_object(),
            ctx: empty_object(),
            input: empty_object(),
        }
    }
}

impl StateSnapshot {
    pub fn namespace(&self, namespace: Namespace) -> &Value {
        match namespace {
            Namespace::Vars => &self.vars,
            Namespace::Tmp => &self.tmp,
            Namespace::Ctx => &self.ctx,
            Namespace::In => &self.input,
        }
    }

    fn namespace_mut(&mut self, namespace: Namespace) -> &mut Value {
        match namespace {
            Namespace::Vars => &mut self.vars,
            Namespace::Tmp => &mut self.tmp,
            Namespace::Ctx => &mut self.ctx,
            Namespace::In => &mut self.input,
        }
    }

    /// Dotted-path lookup; `None` if any segment is missing.
    pub fn get(&self, reference: &StateRef) -> Option<&Value> {
        let mut current = self.namespace(reference.namespace());
        for segment in reference.segments() {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

/// A successful write, as seen by listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub reference: StateRef,
    pub value: Value,
}

pub type StateListener = Box<dyn Fn(&StateChange) + Send + Sync>;

/// Handle returned by [`StateStore::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

/// Live state for one run invocation.
#[derive(Default)]
pub struct StateStore {
    state: StateSnapshot,
    listeners: Vec<(ListenerId, StateListener)>,
    next_listener: u64,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("state", &self.state)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl StateStore {
    /// Fresh store with the given context and input.
    pub fn new(ctx: Value, input: Value) -> Self {
        Self {
            state: StateSnapshot {
                ctx: object_root(ctx),
                input: object_root(input),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Rebuild from a checkpoint, merging fresh `$ctx`/`$in` keys over the
    /// checkpointed ones.
    pub fn from_checkpoint(snapshot: StateSnapshot, ctx: Value, input: Value) -> Self {
        let mut state = snapshot;
        merge_top_level(&mut state.ctx, object_root(ctx));
        merge_top_level(&mut state.input, object_root(input));
        Self {
            state,
            ..Default::default()
        }
    }

    pub fn get(&self, reference: &StateRef) -> Option<&Value> {
        self.state.get(reference)
    }

    /// Write `value` at `reference`, creating intermediate objects.
    pub fn set(&mut self, reference: &StateRef, value: Value) -> Result<(), StateError> {
        let namespace = reference.namespace();
        if !namespace.is_writable() {
            return Err(StateError::ReadOnlyNamespace {
                namespace,
                reference: reference.to_string(),
            });
        }
        if reference.segments().is_empty() && !value.is_object() {
            return Err(StateError::NonObjectRoot(namespace));
        }

        let root = self.state.namespace_mut(namespace);
        assign(root, reference.segments(), value.clone());

        let change = StateChange {
            reference: reference.clone(),
            value,
        };
        for (_, listener) in &self.listeners {
            listener(&change);
        }
        Ok(())
    }

    /// Borrow the live state without copying.
    pub fn view(&self) -> &StateSnapshot {
        &self.state
    }

    /// Deep copy of all namespaces. Mutating it never affects the store.
    pub fn snapshot(&self) -> StateSnapshot {
        self.state.clone()
    }

    pub fn subscribe(&mut self, listener: StateListener) -> ListenerId {
        self.next_listener += 1;
        let id = ListenerId(self.next_listener);
        self.listeners.push((id, listener));
        id
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(existing, _)| *existing != id);
        self.listeners.len() != before
    }
}

fn merge_top_level(target: &mut Value, fresh: Value) {
    if !target.is_object() {
        *target = empty_object();
    }
    if let (Value::Object(target), Value::Object(fresh)) = (target, fresh) {
        for (key, value) in fresh {
            target.insert(key, value);
        }
    }
}

fn assign(slot: &mut Value, segments: &[String], value: Value) {
    let Some((segment, rest)) = segments.split_first() else {
        *slot = value;
        return;
    };

    if let Value::Array(items) = slot {
        if let Ok(index) = segment.parse::<usize>() {
            if items.len() <= index {
                items.resize(index + 1, Value::Null);
            }
            assign(&mut items[index], rest, value);
            return;
        }
    }

    if !slot.is_object() {
        *slot = empty_object();
    }
    if let Value::Object(map) = slot {
        let child = map.entry(segment.clone()).or_insert(Value::Null);
        assign(child, rest, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn r(raw: &str) -> StateRef {
        StateRef::parse(raw).unwrap()
    }

    #[test]
    fn test_get_after_set() {
        let mut store = StateStore::default();
        for (path, value) in [
            ("$vars.flag", json!("yes")),
            ("$tmp.deep.nested.value", json!({"a": [1, 2]})),
            ("$vars.count", json!(3)),
        ] {
            store.set(&r(path), value.clone()).unwrap();
            assert_eq!(store.get(&r(path)), Some(&value));
        }
        assert_eq!(store.get(&r("$tmp.deep.nested.value.a.1")), Some(&json!(2)));
    }

    #[test]
    fn test_missing_paths_are_absent() {
        let store = StateStore::new(json!({"user": "u1"}), json!({"items": [1]}));
        assert_eq!(store.get(&r("$ctx.user")), Some(&json!("u1")));
        assert_eq!(store.get(&r("$ctx.user.name")), None);
        assert_eq!(store.get(&r("$in.items.5")), None);
        assert_eq!(store.get(&r("$vars.nothing.here")), None);
    }

    #[test]
    fn test_read_only_namespaces() {
        let mut store = StateStore::default();
        for path in ["$ctx.user", "$in.answer", "$in"] {
            let err = store.set(&r(path), json!(1)).unwrap_err();
            assert!(matches!(err, StateError::ReadOnlyNamespace { .. }), "{path}");
        }
    }

    #[test]
    fn test_set_pads_arrays_and_replaces_scalars() {
        let mut store = StateStore::default();
        store.set(&r("$vars.list"), json!([])).unwrap();
        store.set(&r("$vars.list.2"), json!("c")).unwrap();
        assert_eq!(store.get(&r("$vars.list")), Some(&json!([null, null, "c"])));

        store.set(&r("$vars.scalar"), json!(1)).unwrap();
        store.set(&r("$vars.scalar.inner"), json!(2)).unwrap();
        assert_eq!(store.get(&r("$vars.scalar")), Some(&json!({"inner": 2})));
    }

    #[test]
    fn test_root_must_stay_object() {
        let mut store = StateStore::default();
        assert!(store.set(&r("$vars"), json!({"a": 1})).is_ok());
        assert_eq!(
            store.set(&r("$vars"), json!(5)).unwrap_err(),
            StateError::NonObjectRoot(Namespace::Vars)
        );
    }

    #[test]
    fn test_snapshot_is_isolated() {
        let mut store = StateStore::default();
        store.set(&r("$vars.user"), json!({"name": "ada"})).unwrap();

        let mut snapshot = store.snapshot();
        snapshot.vars["user"]["name"] = json!("mutated");
        snapshot.tmp = json!({"x": 1});

        assert_eq!(store.get(&r("$vars.user.name")), Some(&json!("ada")));
        assert_eq!(store.get(&r("$tmp.x")), None);
    }

    #[test]
    fn test_from_checkpoint_merges_fresh_input() {
        let mut store = StateStore::new(json!({"tenant": "a"}), json!({"topic": "rust"}));
        store.set(&r("$vars.progress"), json!(1)).unwrap();

        let resumed = StateStore::from_checkpoint(
            store.snapshot(),
            Value::Null,
            json!({"decision": "approve"}),
        );
        assert_eq!(resumed.get(&r("$vars.progress")), Some(&json!(1)));
        assert_eq!(resumed.get(&r("$in.topic")), Some(&json!("rust")));
        assert_eq!(resumed.get(&r("$in.decision")), Some(&json!("approve")));
        assert_eq!(resumed.get(&r("$ctx.tenant")), Some(&json!("a")));
    }

    #[test]
    fn test_listeners() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let mut store = StateStore::default();
        let id = store.subscribe(Box::new(move |change| {
            sink.lock().unwrap().push(change.reference.to_string());
        }));
        store.set(&r("$vars.a"), json!(1)).unwrap();
        let _ = store.set(&r("$ctx.b"), json!(1));
        assert!(store.unsubscribe(id));
        store.set(&r("$vars.c"), json!(1)).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["$vars.a".to_string()]);
    }

    #[test]
    fn test_snapshot_wire_keys() {
        let store = StateStore::new(json!({}), json!({"q": 1}));
        let value = serde_json::to_value(store.snapshot()).unwrap();
        assert_eq!(value["$in"], json!({"q": 1}));
        assert!(value.get("$vars").is_some());
    }
}
