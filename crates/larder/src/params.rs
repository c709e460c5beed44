//! Request parameters and the per-response `vary` mapping.
//!
//! A [`Params`] map carries the inputs of a producing call. Values are
//! restricted to JSON scalars (strings, numbers, booleans), which keeps
//! equality well-defined and lets stores use containment queries without
//! worrying about structural comparison.
//!
//! A [`Vary`] map is a producer's declaration of which params its response
//! depended on, and with which values. It forms the secondary part of the
//! store key. A key mapped to [`VaryValue::Absent`] asserts that the
//! producing call saw the param as *missing*, which is different from the
//! key not appearing in the mapping at all (the response did not depend on
//! that param).

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Parameters of a request, keyed by name.
///
/// `BTreeMap` keeps the key order canonical, which the request collapser
/// and store keys rely on.
pub type Params = BTreeMap<String, Value>;

/// A producer's declaration of the params that shaped a response.
pub type Vary = BTreeMap<String, VaryValue>;

/// A single value in a [`Vary`] mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VaryValue {
    /// The producing call saw this param as missing.
    ///
    /// Serializes to JSON `null`.
    Absent,
    /// The producing call saw this param with this (scalar) value.
    Value(Value),
}

impl VaryValue {
    /// The param value this vary entry matches, or `None` for [`Absent`](Self::Absent).
    pub fn value(&self) -> Option<&Value> {
        match self {
            VaryValue::Absent => None,
            VaryValue::Value(value) => Some(value),
        }
    }
}

impl From<Value> for VaryValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => VaryValue::Absent,
            value => VaryValue::Value(value),
        }
    }
}

/// Returns whether `value` is a JSON scalar (string, number or boolean).
pub fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

/// Caller-provided normalizers for param names and values.
///
/// Both default to the identity. A value normalizer may, for instance,
/// lowercase strings or round numbers so that equivalent requests share
/// cache entries.
#[derive(Clone)]
pub struct ParamNormalizers {
    name: Arc<dyn Fn(&str) -> String + Send + Sync>,
    value: Arc<dyn Fn(Value) -> Value + Send + Sync>,
}

impl ParamNormalizers {
    pub fn new(
        name: impl Fn(&str) -> String + Send + Sync + 'static,
        value: impl Fn(Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: Arc::new(name),
            value: Arc::new(value),
        }
    }

    /// Replaces the name normalizer.
    pub fn with_name(mut self, name: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        self.name = Arc::new(name);
        self
    }

    /// Replaces the value normalizer.
    pub fn with_value(mut self, value: impl Fn(Value) -> Value + Send + Sync + 'static) -> Self {
        self.value = Arc::new(value);
        self
    }

    pub(crate) fn name(&self, name: &str) -> String {
        (self.name)(name)
    }

    pub(crate) fn value(&self, value: Value) -> Value {
        (self.value)(value)
    }
}

impl Default for ParamNormalizers {
    fn default() -> Self {
        Self::new(str::to_owned, |value| value)
    }
}

impl std::fmt::Debug for ParamNormalizers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParamNormalizers").finish_non_exhaustive()
    }
}

/// Normalizes request params.
///
/// Applies the name and value normalizers and drops every key whose value
/// is not a scalar. Dropping nulls here is what makes "param missing" and
/// "param null" indistinguishable to the cache, which is intentional.
pub fn normalize_params(params: &Params, normalizers: &ParamNormalizers) -> Params {
    params
        .iter()
        .filter_map(|(name, value)| {
            let value = normalizers.value(value.clone());
            is_scalar(&value).then(|| (normalizers.name(name), value))
        })
        .collect()
}

/// Normalizes a vary mapping.
///
/// [`VaryValue::Absent`] entries are preserved as-is; concrete values go
/// through the value normalizer and are dropped if they come out
/// non-scalar.
pub fn normalize_vary(vary: &Vary, normalizers: &ParamNormalizers) -> Vary {
    vary.iter()
        .filter_map(|(name, value)| {
            let name = normalizers.name(name);
            match value {
                VaryValue::Absent => Some((name, VaryValue::Absent)),
                VaryValue::Value(value) => {
                    let value = normalizers.value(value.clone());
                    is_scalar(&value).then(|| (name, VaryValue::Value(value)))
                }
            }
        })
        .collect()
}

/// Returns whether an entry stored under `vary` may serve a request with
/// the given (normalized) `params`.
///
/// Every key in the vary mapping must be satisfied: an
/// [`Absent`](VaryValue::Absent) key requires the param to be missing, a
/// concrete value requires scalar equality.
pub fn vary_matches(vary: &Vary, params: &Params) -> bool {
    vary.iter().all(|(name, expected)| match expected {
        VaryValue::Absent => !params.contains_key(name),
        VaryValue::Value(expected) => params.get(name) == Some(expected),
    })
}
