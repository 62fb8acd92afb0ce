//! Hierarchical state values and matching
//!
//! Pure functions over the state tree a machine instance reports: dotted
//! path expansion and ancestor-or-equal matching. No I/O, no shared state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The state value of a machine instance: either a leaf state name or a
/// map of region name to child state value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateValue {
    Leaf(String),
    Compound(BTreeMap<String, StateValue>),
}

impl StateValue {
    pub fn leaf(name: impl Into<String>) -> Self {
        StateValue::Leaf(name.into())
    }

    pub fn compound<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, StateValue)>,
        K: Into<String>,
    {
        StateValue::Compound(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl From<&str> for StateValue {
    fn from(name: &str) -> Self {
        StateValue::Leaf(name.to_string())
    }
}

/// A state descriptor used in `matches` queries: a dotted path string, a
/// list of path segments, or a nested map mirroring the state tree shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateDescriptor {
    Path(String),
    Segments(Vec<String>),
    Nested(BTreeMap<String, StateDescriptor>),
}

impl StateDescriptor {
    /// Normalize to a `StateValue` tree so matching only deals with one shape.
    fn to_state_value(&self) -> StateValue {
        match self {
            StateDescriptor::Path(path) => {
                segments_to_value(&path.split('.').collect::<Vec<_>>())
            }
            StateDescriptor::Segments(segments) => {
                segments_to_value(&segments.iter().map(String::as_str).collect::<Vec<_>>())
            }
            StateDescriptor::Nested(map) => StateValue::Compound(
                map.iter()
                    .map(|(key, child)| (key.clone(), child.to_state_value()))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for StateDescriptor {
    fn from(path: &str) -> Self {
        StateDescriptor::Path(path.to_string())
    }
}

fn segments_to_value(segments: &[&str]) -> StateValue {
    match segments {
        [] => StateValue::Leaf(String::new()),
        [last] => StateValue::Leaf((*last).to_string()),
        [first, rest @ ..] => {
            let mut map = BTreeMap::new();
            map.insert((*first).to_string(), segments_to_value(rest));
            StateValue::Compound(map)
        }
    }
}

/// Expand a state value into every dotted path it occupies, least to most
/// specific: `{a:{b:"c"}}` becomes `["a", "a.b", "a.b.c"]`.
pub fn state_paths(value: &StateValue) -> Vec<String> {
    let mut out = Vec::new();
    collect_paths(None, value, &mut out);
    out
}

fn collect_paths(prefix: Option<&str>, value: &StateValue, out: &mut Vec<String>) {
    match value {
        StateValue::Leaf(name) => out.push(join(prefix, name)),
        StateValue::Compound(map) => {
            for (key, child) in map {
                let path = join(prefix, key);
                out.push(path.clone());
                collect_paths(Some(&path), child, out);
            }
        }
    }
}

fn join(prefix: Option<&str>, segment: &str) -> String {
    match prefix {
        Some(prefix) => format!("{}.{}", prefix, segment),
        None => segment.to_string(),
    }
}

/// Whether `descriptor` denotes an ancestor-or-equal of `value`.
///
/// A missing descriptor matches everything; a missing value matches nothing.
/// A string descriptor against a leaf requires equality; against a compound
/// value it requires the key to be present at that level. A nested
/// descriptor requires every one of its keys to be present and recursively
/// matching.
pub fn matches(descriptor: Option<&StateDescriptor>, value: Option<&StateValue>) -> bool {
    let Some(descriptor) = descriptor else {
        return true;
    };
    let Some(value) = value else {
        return false;
    };
    value_matches(&descriptor.to_state_value(), value)
}

fn value_matches(descriptor: &StateValue, value: &StateValue) -> bool {
    match (descriptor, value) {
        (StateValue::Leaf(d), StateValue::Leaf(v)) => d == v,
        (StateValue::Leaf(d), StateValue::Compound(map)) => map.contains_key(d),
        (StateValue::Compound(_), StateValue::Leaf(_)) => false,
        (StateValue::Compound(d), StateValue::Compound(v)) => d
            .iter()
            .all(|(key, child)| v.get(key).is_some_and(|vc| value_matches(child, vc))),
    }
}
