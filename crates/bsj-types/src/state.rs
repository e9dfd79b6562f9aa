// ---------------------------------------------------------------------------
// SessionState — key-value store threaded through every stage of a run
// ---------------------------------------------------------------------------

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{BsjError, Result};

/// How a stage's output fragment is folded into existing values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// The new value replaces the old one wholesale.
    #[default]
    Replace,
    /// JSON objects are merged key by key, recursively; anything else is replaced.
    DeepMerge,
}

/// The live state of one pipeline run.
///
/// Keys become *frozen* once a downstream stage has read them through
/// [`view`](SessionState::view). A frozen key can no longer be written until
/// it is explicitly [`thaw`](SessionState::thaw)ed, which only happens when a
/// reviewer sends the producing stage back for another pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    values: BTreeMap<String, Value>,
    #[serde(default)]
    frozen: BTreeSet<String>,
    #[serde(default)]
    written_by: BTreeMap<String, String>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a seed value (e.g. `topic`) before the first stage runs.
    pub fn seed(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.written_by.insert(key.clone(), "seed".to_string());
        self.values.insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub fn is_frozen(&self, key: &str) -> bool {
        self.frozen.contains(key)
    }

    /// Name of the stage that last wrote `key`.
    pub fn writer(&self, key: &str) -> Option<&str> {
        self.written_by.get(key).map(String::as_str)
    }

    /// Read the declared `keys` for a stage. Every key that is present gets
    /// frozen, absent keys are simply missing from the view.
    pub fn view(&mut self, keys: &[String]) -> StateView {
        let mut values = BTreeMap::new();
        for key in keys {
            if let Some(value) = self.values.get(key) {
                values.insert(key.clone(), value.clone());
                self.frozen.insert(key.clone());
            }
        }
        StateView { values }
    }

    /// Fold `updates` produced by `stage` into the state.
    ///
    /// The merge is all-or-nothing: if any key is frozen nothing is written
    /// and an [`BsjError::InvariantViolation`] is returned.
    pub fn merge(
        &mut self,
        stage: &str,
        updates: BTreeMap<String, Value>,
        policy: MergePolicy,
    ) -> Result<Vec<String>> {
        if let Some(key) = updates.keys().find(|k| self.frozen.contains(*k)) {
            return Err(BsjError::InvariantViolation(format!(
                "stage '{stage}' tried to overwrite frozen key '{key}'"
            )));
        }

        let mut written = Vec::with_capacity(updates.len());
        for (key, value) in updates {
            match (policy, self.values.get_mut(&key)) {
                (MergePolicy::DeepMerge, Some(existing)) => deep_merge(existing, value),
                _ => {
                    self.values.insert(key.clone(), value);
                }
            }
            self.written_by.insert(key.clone(), stage.to_string());
            written.push(key);
        }
        tracing::debug!(stage = %stage, keys = ?written, "State merged");
        Ok(written)
    }

    /// Remove a bookkeeping key (such as a pending-review marker).
    pub fn remove(&mut self, key: &str) -> Result<Option<Value>> {
        if self.frozen.contains(key) {
            return Err(BsjError::InvariantViolation(format!(
                "cannot remove frozen key '{key}'"
            )));
        }
        self.written_by.remove(key);
        Ok(self.values.remove(key))
    }

    /// Re-open keys so their producing stage can run again.
    pub fn thaw<S: AsRef<str>>(&mut self, keys: &[S]) {
        for key in keys {
            self.frozen.remove(key.as_ref());
        }
    }

    /// The state as a single JSON object.
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

fn deep_merge(target: &mut Value, incoming: Value) {
    match (target, incoming) {
        (Value::Object(existing), Value::Object(incoming)) => {
            for (key, value) in incoming {
                match existing.get_mut(&key) {
                    Some(slot) => deep_merge(slot, value),
                    None => {
                        existing.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

// ---------------------------------------------------------------------------
// StateView — read-only slice handed to a stage
// ---------------------------------------------------------------------------

/// The declared input keys of one stage, cloned out of the session state.
///
/// Parallel stages each receive their own view, so no locking is needed while
/// they run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateView {
    values: BTreeMap<String, Value>,
}

impl StateView {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl From<BTreeMap<String, Value>> for StateView {
    fn from(values: BTreeMap<String, Value>) -> Self {
        Self { values }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
