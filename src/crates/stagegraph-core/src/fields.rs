//! Business data carried by a workflow snapshot
//!
//! A workflow chooses its field representation by implementing [`FieldSet`]. The
//! trait pairs the record type with a *patch* type describing a partial update,
//! and with an explicit merge ([`FieldSet::apply`]) so that a stage can only touch
//! fields the patch type can name.
//!
//! [`DynamicFields`] is the open, string-keyed implementation used by tests and
//! small ad-hoc graphs. Real workflows define a struct whose patch is the same
//! struct with every field wrapped in `Option`.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Debug;

/// Typed field record with an explicit, versioned merge
pub trait FieldSet:
    Clone + Debug + Default + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Partial update a stage returns
    type Patch: Clone + Debug + Default + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Bumped whenever the serialized shape changes incompatibly. Checkpoints
    /// written under another version are refused on load.
    const SCHEMA_VERSION: u32;

    /// Overlay `patch` on `self`, producing a new record.
    ///
    /// Fields the patch does not mention must be preserved unchanged.
    fn apply(&self, patch: &Self::Patch) -> Self;
}

/// Open string-keyed field map
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DynamicFields(BTreeMap<String, Value>);

impl DynamicFields {
    /// Empty field map
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Raw value of a key
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Boolean value of a key, `None` if absent or not a bool
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    /// Integer value of a key
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(Value::as_i64)
    }

    /// String value of a key
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Whether the key is present
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Number of keys
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no key is set
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate keys and values in key order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl From<BTreeMap<String, Value>> for DynamicFields {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }
}

/// Partial update for [`DynamicFields`]: every key listed overrides the record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DynamicPatch(BTreeMap<String, Value>);

impl DynamicPatch {
    /// Empty patch
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style set
    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Whether the patch changes nothing
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<BTreeMap<String, Value>> for DynamicPatch {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }
}

impl FieldSet for DynamicFields {
    type Patch = DynamicPatch;

    const SCHEMA_VERSION: u32 = 1;

    fn apply(&self, patch: &DynamicPatch) -> Self {
        let mut merged = self.0.clone();
        for (key, value) in &patch.0 {
            merged.insert(key.clone(), value.clone());
        }
        Self(merged)
    }
}
