//! Versioned, typed state records.
//!
//! A line's state is a closed record: a map of known field names to typed
//! [`StateValue`]s plus an `extra` bucket for fields a newer producer wrote
//! that this deployment's [`StateSchema`] does not know yet. Three-way
//! comparison runs over the union of both buckets, addressed by [`FieldKey`],
//! so merge and conflict detection are total over the key set.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TypeError;

/// A typed state value.
///
/// Equality is structural. Floats compare by bit pattern, which keeps
/// equality total (`NaN == NaN`, `0.0 != -0.0`). JSON has no encoding for
/// non-finite floats, so they serialize as `null` and read back as
/// [`StateValue::Null`]; the engine rejects them before anything is stored.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<StateValue>),
    Map(BTreeMap<String, StateValue>),
}

impl StateValue {
    /// Short name of the value's type, used in log fields and conflict reports.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// `false` if this value is, or contains, a NaN or infinite float.
    pub fn is_finite(&self) -> bool {
        match self {
            Self::Float(f) => f.is_finite(),
            Self::List(items) => items.iter().all(Self::is_finite),
            Self::Map(map) => map.values().all(Self::is_finite),
            _ => true,
        }
    }

    /// Convert to a JSON value. Non-finite floats become `null`.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::Text(s) => Value::String(s.clone()),
            Self::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

impl PartialEq for StateValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for StateValue {}

impl From<bool> for StateValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for StateValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for StateValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for StateValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for StateValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for StateValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<StateValue>> for StateValue {
    fn from(v: Vec<StateValue>) -> Self {
        Self::List(v)
    }
}

impl From<Value> for StateValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => Self::Text(s),
            Value::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            Value::Object(map) => {
                Self::Map(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

/// Which bucket of a [`State`] a field lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldScope {
    /// A field known to the active schema.
    Field,
    /// A forward-compatibility field the schema does not know.
    Extra,
}

/// Address of one entry in a [`State`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldKey {
    pub scope: FieldScope,
    pub name: String,
}

impl FieldKey {
    pub fn field(name: impl Into<String>) -> Self {
        Self {
            scope: FieldScope::Field,
            name: name.into(),
        }
    }

    pub fn extra(name: impl Into<String>) -> Self {
        Self {
            scope: FieldScope::Extra,
            name: name.into(),
        }
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope {
            FieldScope::Field => f.write_str(&self.name),
            FieldScope::Extra => write!(f, "extra:{}", self.name),
        }
    }
}

impl FromStr for FieldKey {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = match s.strip_prefix("extra:") {
            Some(name) => Self::extra(name),
            None => Self::field(s),
        };
        if key.name.is_empty() {
            return Err(TypeError::InvalidFieldKey(s.to_string()));
        }
        Ok(key)
    }
}

/// The materialized state of a line at one point in time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    /// Schema version the state was produced under.
    #[serde(default)]
    pub version: u32,
    /// Fields known to the schema.
    #[serde(default)]
    pub fields: BTreeMap<String, StateValue>,
    /// Fields the schema does not know.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, StateValue>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a state from `(name, value)` pairs in the known-field bucket.
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<StateValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self {
            version: 0,
            fields: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            extra: BTreeMap::new(),
        }
    }

    /// Build a state from a JSON object; every key becomes a known field.
    pub fn from_json(value: Value) -> Result<Self, TypeError> {
        match value {
            Value::Object(map) => Ok(Self {
                version: 0,
                fields: map
                    .into_iter()
                    .map(|(k, v)| (k, StateValue::from(v)))
                    .collect(),
                extra: BTreeMap::new(),
            }),
            other => Err(TypeError::InvalidState(format!(
                "expected a JSON object, got {other}"
            ))),
        }
    }

    /// Builder-style setter for a known field.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<StateValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Look up a known field by name.
    pub fn field(&self, name: &str) -> Option<&StateValue> {
        self.fields.get(name)
    }

    pub fn get(&self, key: &FieldKey) -> Option<&StateValue> {
        self.bucket(key.scope).get(&key.name)
    }

    pub fn set(&mut self, key: FieldKey, value: StateValue) {
        self.bucket_mut(key.scope).insert(key.name, value);
    }

    pub fn remove(&mut self, key: &FieldKey) -> Option<StateValue> {
        self.bucket_mut(key.scope).remove(&key.name)
    }

    /// Every key present in either bucket, in a stable order.
    pub fn keys(&self) -> BTreeSet<FieldKey> {
        self.fields
            .keys()
            .map(FieldKey::field)
            .chain(self.extra.keys().map(FieldKey::extra))
            .collect()
    }

    /// Keys whose values hold a non-finite float anywhere inside them.
    pub fn non_finite_fields(&self) -> Vec<FieldKey> {
        self.keys()
            .into_iter()
            .filter(|key| self.get(key).is_some_and(|v| !v.is_finite()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.fields.len() + self.extra.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.extra.is_empty()
    }

    /// Render as a JSON object; `extra` entries are nested under `"extra"`.
    pub fn to_json(&self) -> Value {
        let mut map: serde_json::Map<String, Value> = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        if !self.extra.is_empty() {
            map.insert(
                "extra".into(),
                StateValue::Map(self.extra.clone()).to_json(),
            );
        }
        Value::Object(map)
    }

    fn bucket(&self, scope: FieldScope) -> &BTreeMap<String, StateValue> {
        match scope {
            FieldScope::Field => &self.fields,
            FieldScope::Extra => &self.extra,
        }
    }

    fn bucket_mut(&mut self, scope: FieldScope) -> &mut BTreeMap<String, StateValue> {
        match scope {
            FieldScope::Field => &mut self.fields,
            FieldScope::Extra => &mut self.extra,
        }
    }
}

/// Declares the known field set of a deployment's state records.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSchema {
    pub version: u32,
    pub known: BTreeSet<String>,
}

impl StateSchema {
    pub fn new<I, S>(version: u32, known: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            version,
            known: known.into_iter().map(Into::into).collect(),
        }
    }

    /// Sort a state's entries into the right buckets for this schema.
    ///
    /// Unknown fields move to `extra`; `extra` entries that became known move
    /// back to `fields` unless a known field of the same name already exists.
    pub fn normalize(&self, state: State) -> State {
        let State {
            version,
            fields,
            extra,
        } = state;
        let mut out = State {
            version: version.max(self.version),
            fields: BTreeMap::new(),
            extra: BTreeMap::new(),
        };
        for (name, value) in fields {
            if self.known.contains(&name) {
                out.fields.insert(name, value);
            } else {
                out.extra.insert(name, value);
            }
        }
        for (name, value) in extra {
            if self.known.contains(&name) && !out.fields.contains_key(&name) {
                out.fields.insert(name, value);
            } else {
                out.extra.entry(name).or_insert(value);
            }
        }
        out
    }
}
