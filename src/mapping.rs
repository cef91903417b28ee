//! Attribute map helpers.
//!
//! Resource attributes travel as a JSON object. [`AttributeMap`] adds typed
//! getters on top of it, the numeric-as-string convention used where VCD
//! tells "unset" apart from `0`, version gating for attributes that need a
//! newer API, and the comparison used to detect drift between the desired
//! and the observed state.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::client::ApiVersion;
use crate::error::{ProviderError, Result};
use crate::schema::{Attribute, AttributeType, Schema};
use crate::types::AttributeChange;

static DYNAMIC: AttributeType = AttributeType::Dynamic;

/// Minimum API version required to set an attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionGate {
    /// Lowest negotiated API version that supports the attribute.
    pub min_api: ApiVersion,
    /// Product version shown to users, e.g. `10.3.1`.
    pub vcd_label: String,
}

impl VersionGate {
    /// Create a gate.
    pub fn new(min_api: ApiVersion, vcd_label: impl Into<String>) -> Self {
        Self {
            min_api,
            vcd_label: vcd_label.into(),
        }
    }

    /// Fail with a version error when `negotiated` is older than the gate.
    pub fn check(&self, attribute: &str, negotiated: ApiVersion) -> Result<()> {
        if negotiated < self.min_api {
            return Err(ProviderError::Version(format!(
                "{} is supported from VCD {}+ (negotiated API version {})",
                attribute, self.vcd_label, negotiated
            )));
        }
        Ok(())
    }
}

/// Check every version-gated attribute that is set in `attrs`.
pub fn check_version_gates(
    schema: &Schema,
    attrs: &AttributeMap,
    negotiated: ApiVersion,
) -> Result<()> {
    let mut gated: Vec<_> = schema
        .block
        .attributes
        .iter()
        .filter_map(|(name, attr)| attr.since.as_ref().map(|gate| (name, gate)))
        .collect();
    gated.sort_by(|a, b| a.0.cmp(b.0));
    for (name, gate) in gated {
        if attrs.is_set(name) {
            gate.check(name, negotiated)?;
        }
    }
    Ok(())
}

/// A resource's attributes as a JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeMap(Map<String, Value>);

impl AttributeMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a JSON value; `null` yields an empty map.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Ok(Self::default()),
            other => Err(ProviderError::Validation(format!(
                "expected an object of attributes, got {}",
                other
            ))),
        }
    }

    /// Convert into a JSON value.
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Borrow the underlying JSON object.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Raw value of an attribute; `null` reads as absent.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name).filter(|v| !v.is_null())
    }

    /// Whether the attribute carries a value.
    ///
    /// Empty strings, lists and maps count as unset. `false` and `0` count as set.
    pub fn is_set(&self, name: &str) -> bool {
        match self.get(name) {
            None => false,
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Array(a)) => !a.is_empty(),
            Some(Value::Object(o)) => !o.is_empty(),
            Some(_) => true,
        }
    }

    /// Set an attribute.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    /// Set an attribute only when `value` is present.
    pub fn set_opt<V: Into<Value>>(&mut self, name: impl Into<String>, value: Option<V>) {
        if let Some(value) = value {
            self.set(name, value);
        }
    }

    /// Remove an attribute.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.0.remove(name)
    }

    /// Attribute names in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// A required string attribute.
    pub fn string(&self, name: &str) -> Result<String> {
        self.opt_string(name)
            .ok_or_else(|| ProviderError::Validation(format!("\"{}\": required field is not set", name)))
    }

    /// An optional string attribute; empty strings read as `None`.
    pub fn opt_string(&self, name: &str) -> Option<String> {
        match self.get(name) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }

    /// An attribute ending in `_id`, forwarded verbatim.
    pub fn id_ref(&self, name: &str) -> Result<String> {
        self.string(name)
    }

    /// A boolean attribute, falling back to the schema default.
    pub fn bool_or_default(&self, name: &str, schema: &Schema) -> Result<bool> {
        if let Some(value) = self.opt_bool(name) {
            return Ok(value);
        }
        schema
            .attribute(name)
            .and_then(|attr| attr.default.as_ref())
            .and_then(Value::as_bool)
            .ok_or_else(|| {
                ProviderError::Validation(format!("\"{}\": not set and has no default", name))
            })
    }

    /// An optional boolean attribute.
    pub fn opt_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Value::as_bool)
    }

    /// A required integer attribute.
    pub fn int(&self, name: &str) -> Result<i64> {
        self.opt_int(name)
            .ok_or_else(|| ProviderError::Validation(format!("\"{}\": required integer is not set", name)))
    }

    /// An optional integer attribute.
    pub fn opt_int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_i64)
    }

    /// An integer written as a string; `""` and absent read as `None`.
    pub fn int_from_string(&self, name: &str) -> Result<Option<i64>> {
        match self.get(name) {
            None => Ok(None),
            Some(Value::String(s)) => int_from_string_attr(name, s),
            Some(Value::Number(n)) => Ok(n.as_i64()),
            Some(other) => Err(ProviderError::Validation(format!(
                "\"{}\": expected a numeric string, got {}",
                name, other
            ))),
        }
    }

    /// A set of strings, deduplicated and sorted.
    pub fn string_set(&self, name: &str) -> BTreeSet<String> {
        self.string_list(name).into_iter().collect()
    }

    /// A list of strings in declared order.
    pub fn string_list(&self, name: &str) -> Vec<String> {
        self.get(name)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// A list of nested objects, e.g. blocks.
    pub fn objects(&self, name: &str) -> Vec<AttributeMap> {
        self.get(name)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_object().cloned().map(AttributeMap))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// A single nested block, given either as an object or a one-element list.
    pub fn object(&self, name: &str) -> Option<AttributeMap> {
        match self.get(name)? {
            Value::Object(map) => Some(AttributeMap(map.clone())),
            Value::Array(items) => items
                .first()
                .and_then(Value::as_object)
                .cloned()
                .map(AttributeMap),
            _ => None,
        }
    }

    /// A map of strings, e.g. `metadata` or `input`.
    pub fn string_map(&self, name: &str) -> Map<String, Value> {
        self.get(name)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    }
}

impl From<Map<String, Value>> for AttributeMap {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Value at a dotted path such as `ownerRef.id`; numeric segments index arrays.
pub fn pointer<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |v, segment| match v {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// String at a dotted path; empty strings read as `None`.
pub fn pointer_str<'a>(value: &'a Value, path: &str) -> Option<&'a str> {
    pointer(value, path)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// Parse an integer written as a string; `""` reads as `None`.
pub fn int_from_string_attr(name: &str, raw: &str) -> Result<Option<i64>> {
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<i64>().map(Some).map_err(|_| {
        ProviderError::Validation(format!("\"{}\": '{}' is not an integer", name, raw))
    })
}

/// Write an optional integer as a string: `None` becomes `""`, `Some(0)` becomes `"0"`.
pub fn int_to_string_attr(value: Option<i64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Whether `observed` satisfies `desired` for an attribute of type `attr_type`.
///
/// Objects compare only the keys `desired` sets, so server-filled defaults
/// do not count as drift. Sets compare modulo order.
pub fn value_covers(attr_type: &AttributeType, desired: &Value, observed: &Value) -> bool {
    match (desired, observed) {
        (Value::Object(d), Value::Object(o)) => d.iter().all(|(k, dv)| {
            if dv.is_null() {
                return true;
            }
            let inner = match attr_type {
                AttributeType::Object(fields) => fields.get(k).unwrap_or(&DYNAMIC),
                AttributeType::Map(inner) => inner.as_ref(),
                _ => &DYNAMIC,
            };
            o.get(k).is_some_and(|ov| value_covers(inner, dv, ov))
        }),
        (Value::Array(d), Value::Array(o)) => match attr_type {
            AttributeType::List(inner) => {
                d.len() == o.len()
                    && d.iter().zip(o).all(|(dv, ov)| value_covers(inner, dv, ov))
            },
            // Sets and nested blocks: every desired element matches a distinct observed one.
            other => {
                let inner = match other {
                    AttributeType::Set(inner) => inner.as_ref(),
                    _ => &DYNAMIC,
                };
                if d.len() != o.len() {
                    return false;
                }
                let mut used = vec![false; o.len()];
                d.iter().all(|dv| {
                    let hit = o
                        .iter()
                        .enumerate()
                        .find(|(i, ov)| !used[*i] && value_covers(inner, dv, ov));
                    match hit {
                        Some((i, _)) => {
                            used[i] = true;
                            true
                        },
                        None => false,
                    }
                })
            },
        },
        (Value::Number(d), Value::Number(o)) => d.as_f64() == o.as_f64(),
        (d, o) => d == o,
    }
}

fn declared_type<'a>(schema: &'a Schema, name: &str) -> Option<(&'a AttributeType, Option<&'a Attribute>)> {
    if let Some(attr) = schema.attribute(name) {
        return Some((&attr.attr_type, Some(attr)));
    }
    schema
        .block
        .blocks
        .get(name)
        .map(|_| (&DYNAMIC, None))
}

/// Attributes the user configures that differ between `prior` and `desired`.
///
/// Computed-only attributes are never reported. An optional+computed
/// attribute absent from `desired` keeps its observed value and is not a change.
pub fn changed_keys(schema: &Schema, prior: &AttributeMap, desired: &AttributeMap) -> BTreeSet<String> {
    let mut names: BTreeSet<&str> = schema.block.attributes.keys().map(String::as_str).collect();
    names.extend(schema.block.blocks.keys().map(String::as_str));

    let mut changed = BTreeSet::new();
    for name in names {
        let Some((attr_type, attr)) = declared_type(schema, name) else {
            continue;
        };
        if attr.is_some_and(|a| a.flags.is_computed_only()) || name == "id" {
            continue;
        }
        let optional_computed = attr.is_some_and(|a| a.flags.optional && a.flags.computed);
        match (desired.get(name), prior.get(name)) {
            (None, None) => {},
            (None, Some(_)) => {
                if !optional_computed && prior.is_set(name) {
                    changed.insert(name.to_string());
                }
            },
            (Some(d), None) => {
                if desired.is_set(name) || d.is_boolean() {
                    changed.insert(name.to_string());
                }
            },
            (Some(d), Some(p)) => {
                if !value_covers(attr_type, d, p) {
                    changed.insert(name.to_string());
                }
            },
        }
    }
    changed
}

/// Differences between the desired and the observed state, ignoring computed-only attributes.
pub fn drift(schema: &Schema, desired: &AttributeMap, observed: &AttributeMap) -> Vec<AttributeChange> {
    changed_keys(schema, observed, desired)
        .into_iter()
        .filter(|name| desired.get(name).is_some())
        .map(|name| {
            let before = observed.get(&name).cloned();
            let after = desired.get(&name).cloned();
            AttributeChange::new(name, before, after)
        })
        .collect()
}
