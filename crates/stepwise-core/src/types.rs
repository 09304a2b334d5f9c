use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// The flow-scoped key/value state shared and accumulated across steps
///
/// Keys are kept ordered so that snapshots serialize deterministically.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct FlowContext {
    entries: BTreeMap<String, Value>,
}

impl FlowContext {
    /// Create an empty context
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Render the context as a JSON object
    pub fn to_value(&self) -> Value {
        Value::Object(
            self.entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Get a value by key
    #[inline]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Insert a single value, replacing any previous one
    #[inline]
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.entries.insert(key.into(), value);
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.insert(key, value);
        self
    }

    /// Whether `key` is present
    #[inline]
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Keys in order
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    /// Number of entries
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the context holds no entries
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merge `other` into this context; later writes win on key collision
    pub fn merge(&mut self, other: &FlowContext) {
        for (key, value) in &other.entries {
            self.entries.insert(key.clone(), value.clone());
        }
    }

    /// Merge a JSON object payload; non-object payloads are stored under `key`
    pub fn merge_payload(&mut self, payload: &Value, key: &str) {
        match payload {
            Value::Object(map) => {
                for (k, v) in map {
                    self.entries.insert(k.clone(), v.clone());
                }
            }
            Value::Null => {}
            other => {
                self.entries.insert(key.to_string(), other.clone());
            }
        }
    }
}

impl From<BTreeMap<String, Value>> for FlowContext {
    fn from(entries: BTreeMap<String, Value>) -> Self {
        Self { entries }
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for FlowContext {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}
