//! Schema validation.
//!
//! Checks a configuration object against a [`Schema`] before any lock is
//! taken or any SDK call is made: required attributes, value types, nested
//! block cardinality, value validators, `conflicts_with`, `exactly_one_of`,
//! and deprecation warnings.
//!
//! # Example
//!
//! ```
//! use vcd_provider::schema::{Attribute, Schema};
//! use vcd_provider::validation::validate;
//! use serde_json::json;
//!
//! let schema = Schema::v0()
//!     .with_attribute("name", Attribute::optional_string().conflicts_with(["filter"]))
//!     .with_attribute("filter", Attribute::optional_string().conflicts_with(["name"]));
//!
//! let diagnostics = validate(&schema, &json!({"name": "net1"}));
//! assert!(!diagnostics.has_errors());
//!
//! let diagnostics = validate(&schema, &json!({"name": "net1", "filter": "x"}));
//! assert!(diagnostics.has_errors());
//! ```

use std::collections::{BTreeSet, HashMap};

use regex::Regex;
use serde_json::{Map, Value};

use crate::schema::{
    Attribute, AttributeType, Block, BlockNestingMode, Diagnostic, Diagnostics, NestedBlock,
    Schema, Validator,
};

/// Validate a configuration object against a schema.
///
/// Errors and warnings are returned together; the input is valid when
/// [`Diagnostics::has_errors`] is false.
pub fn validate(schema: &Schema, value: &Value) -> Diagnostics {
    let mut diagnostics = Diagnostics::new();
    validate_block(&schema.block, value, "", &mut diagnostics);
    diagnostics
}

/// Validate, returning `Err` with the error diagnostics only.
pub fn validate_result(schema: &Schema, value: &Value) -> Result<(), Vec<Diagnostic>> {
    let diagnostics = validate(schema, value);
    if diagnostics.has_errors() {
        Err(diagnostics.errors().cloned().collect())
    } else {
        Ok(())
    }
}

/// Whether the value passes validation. Warnings do not count.
pub fn is_valid(schema: &Schema, value: &Value) -> bool {
    !validate(schema, value).has_errors()
}

fn validate_block(block: &Block, value: &Value, path: &str, diagnostics: &mut Diagnostics) {
    let obj = match value {
        Value::Object(map) => map,
        Value::Null => return,
        _ => {
            diagnostics.push(
                Diagnostic::error("Expected object")
                    .with_detail(format!("Got {}", value_type_name(value)))
                    .with_attribute_if_not_empty(path),
            );
            return;
        },
    };

    for (name, attr) in sorted(&block.attributes) {
        let attr_path = join_path(path, name);
        validate_attribute(attr, obj.get(name), &attr_path, diagnostics);
    }

    for (name, nested) in sorted(&block.blocks) {
        let block_path = join_path(path, name);
        validate_nested_block(nested, obj.get(name), &block_path, diagnostics);
    }

    validate_relations(block, obj, path, diagnostics);
}

fn sorted<T>(map: &HashMap<String, T>) -> Vec<(&String, &T)> {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
}

fn validate_attribute(
    attr: &Attribute,
    value: Option<&Value>,
    path: &str,
    diagnostics: &mut Diagnostics,
) {
    if attr.flags.is_computed_only() {
        return;
    }

    match value {
        None | Some(Value::Null) => {
            if attr.flags.required {
                diagnostics.push(
                    Diagnostic::error(format!("Missing required attribute '{}'", path))
                        .with_detail("This attribute is required and must be provided")
                        .with_attribute(path),
                );
            }
        },
        Some(v) => {
            let before = diagnostics.len();
            validate_attribute_type(&attr.attr_type, v, path, diagnostics);
            if diagnostics.len() == before {
                for validator in &attr.validators {
                    validate_value(validator, v, path, diagnostics);
                }
            }
            if let Some(message) = &attr.deprecated {
                if is_present(v) {
                    diagnostics.push(
                        Diagnostic::warning(format!("Argument '{}' is deprecated", path))
                            .with_detail(message.clone())
                            .with_attribute(path),
                    );
                }
            }
        },
    }
}

fn validate_value(validator: &Validator, value: &Value, path: &str, diagnostics: &mut Diagnostics) {
    let Some(s) = value.as_str() else {
        return;
    };
    // Empty strings mean "unset" for optional string attributes.
    if s.is_empty() {
        return;
    }
    match validator {
        Validator::Regex { pattern, message } => match Regex::new(pattern) {
            Ok(re) => {
                if !re.is_match(s) {
                    diagnostics.push(
                        Diagnostic::error(format!("Invalid value for attribute '{}'", path))
                            .with_detail(format!("'{}' {}", s, message))
                            .with_attribute(path),
                    );
                }
            },
            Err(err) => {
                diagnostics.push(
                    Diagnostic::error(format!("Invalid validator for attribute '{}'", path))
                        .with_detail(err.to_string())
                        .with_attribute(path),
                );
            },
        },
        Validator::IntInStringAtLeast { min } => match s.parse::<i64>() {
            Ok(n) if n >= *min => {},
            Ok(n) => {
                diagnostics.push(
                    Diagnostic::error(format!("Invalid value for attribute '{}'", path))
                        .with_detail(format!("expected at least {}, got {}", min, n))
                        .with_attribute(path),
                );
            },
            Err(_) => {
                diagnostics.push(
                    Diagnostic::error(format!("Invalid value for attribute '{}'", path))
                        .with_detail(format!("'{}' is not an integer", s))
                        .with_attribute(path),
                );
            },
        },
        Validator::StringInSet { values } => {
            if !values.iter().any(|v| v == s) {
                diagnostics.push(
                    Diagnostic::error(format!("Invalid value for attribute '{}'", path))
                        .with_detail(format!("expected one of [{}], got '{}'", values.join(", "), s))
                        .with_attribute(path),
                );
            }
        },
    }
}

fn validate_attribute_type(
    attr_type: &AttributeType,
    value: &Value,
    path: &str,
    diagnostics: &mut Diagnostics,
) {
    match attr_type {
        AttributeType::String => {
            if !value.is_string() {
                diagnostics.push(type_error(path, "string", value));
            }
        },
        AttributeType::Int64 => {
            if !is_int64(value) {
                diagnostics.push(type_error(path, "int64", value));
            }
        },
        AttributeType::Float64 => {
            if !value.is_number() {
                diagnostics.push(type_error(path, "float64", value));
            }
        },
        AttributeType::Bool => {
            if !value.is_boolean() {
                diagnostics.push(type_error(path, "bool", value));
            }
        },
        AttributeType::List(element_type) | AttributeType::Set(element_type) => {
            let expected = if matches!(attr_type, AttributeType::List(_)) {
                "list"
            } else {
                "set"
            };
            if let Some(arr) = value.as_array() {
                for (i, elem) in arr.iter().enumerate() {
                    let elem_path = format!("{}.{}", path, i);
                    validate_attribute_type(element_type, elem, &elem_path, diagnostics);
                }
            } else {
                diagnostics.push(type_error(path, expected, value));
            }
        },
        AttributeType::Map(value_type) => {
            if let Some(obj) = value.as_object() {
                for (key, val) in obj {
                    let key_path = format!("{}.{}", path, key);
                    validate_attribute_type(value_type, val, &key_path, diagnostics);
                }
            } else {
                diagnostics.push(type_error(path, "map", value));
            }
        },
        AttributeType::Object(attrs) => {
            if let Some(obj) = value.as_object() {
                for (name, attr_type) in sorted(attrs) {
                    if let Some(value) = obj.get(name) {
                        validate_attribute_type(attr_type, value, &join_path(path, name), diagnostics);
                    }
                }
            } else {
                diagnostics.push(type_error(path, "object", value));
            }
        },
        AttributeType::Dynamic => {},
    }
}

fn validate_nested_block(
    nested: &NestedBlock,
    value: Option<&Value>,
    path: &str,
    diagnostics: &mut Diagnostics,
) {
    if let (Some(message), Some(v)) = (&nested.deprecated, value) {
        if is_present(v) {
            diagnostics.push(
                Diagnostic::warning(format!("Block '{}' is deprecated", path))
                    .with_detail(message.clone())
                    .with_attribute(path),
            );
        }
    }

    match (nested.nesting_mode, value) {
        (_, None | Some(Value::Null)) => {
            if nested.min_items > 0 {
                diagnostics.push(
                    Diagnostic::error(format!(
                        "Block '{}' requires at least {} item(s)",
                        path, nested.min_items
                    ))
                    .with_attribute(path),
                );
            }
        },
        (BlockNestingMode::Single, Some(v @ Value::Object(_))) => {
            validate_block(&nested.block, v, path, diagnostics);
        },
        (_, Some(Value::Array(arr))) => {
            let len = arr.len() as u32;
            if len < nested.min_items {
                diagnostics.push(
                    Diagnostic::error(format!(
                        "Block '{}' requires at least {} item(s), got {}",
                        path, nested.min_items, len
                    ))
                    .with_attribute(path),
                );
            }
            if nested.max_items > 0 && len > nested.max_items {
                diagnostics.push(
                    Diagnostic::error(format!(
                        "Block '{}' allows at most {} item(s), got {}",
                        path, nested.max_items, len
                    ))
                    .with_attribute(path),
                );
            }
            for (i, item) in arr.iter().enumerate() {
                let item_path = format!("{}.{}", path, i);
                validate_block(&nested.block, item, &item_path, diagnostics);
            }
        },
        (_, Some(v)) => {
            diagnostics.push(
                Diagnostic::error(format!("Expected list for block '{}'", path))
                    .with_detail(format!("Got {}", value_type_name(v)))
                    .with_attribute(path),
            );
        },
    }
}

/// `conflicts_with` and `exactly_one_of` across the members of one block.
fn validate_relations(
    block: &Block,
    obj: &Map<String, Value>,
    path: &str,
    diagnostics: &mut Diagnostics,
) {
    let set = |name: &str| obj.get(name).is_some_and(is_present);

    let mut conflicts: Vec<(&str, &[String])> = block
        .attributes
        .iter()
        .map(|(name, attr)| (name.as_str(), attr.conflicts_with.as_slice()))
        .chain(
            block
                .blocks
                .iter()
                .map(|(name, nested)| (name.as_str(), nested.conflicts_with.as_slice())),
        )
        .filter(|(_, with)| !with.is_empty())
        .collect();
    conflicts.sort_by(|a, b| a.0.cmp(b.0));

    let mut reported = BTreeSet::new();
    for (name, with) in conflicts {
        if !set(name) {
            continue;
        }
        for other in with {
            if !set(other.as_str()) {
                continue;
            }
            let pair = if name < other.as_str() {
                (name.to_string(), other.clone())
            } else {
                (other.clone(), name.to_string())
            };
            if reported.insert(pair) {
                let attr_path = join_path(path, name);
                diagnostics.push(
                    Diagnostic::error(format!("Conflicting configuration arguments '{}'", attr_path))
                        .with_detail(format!(
                            "\"{}\": conflicts with {}",
                            attr_path,
                            join_path(path, other)
                        ))
                        .with_attribute(attr_path),
                );
            }
        }
    }

    let mut groups: BTreeSet<Vec<String>> = BTreeSet::new();
    for attr in block.attributes.values() {
        if !attr.exactly_one_of.is_empty() {
            let mut group = attr.exactly_one_of.clone();
            group.sort();
            groups.insert(group);
        }
    }
    for group in groups {
        let count = group.iter().filter(|name| set(name.as_str())).count();
        let listed = group.join(",");
        if count == 0 {
            diagnostics.push(
                Diagnostic::error("Invalid combination of arguments")
                    .with_detail(format!("one of `{}` must be specified", listed))
                    .with_attribute_if_not_empty(path),
            );
        } else if count > 1 {
            diagnostics.push(
                Diagnostic::error("Invalid combination of arguments")
                    .with_detail(format!("only one of `{}` can be specified", listed))
                    .with_attribute_if_not_empty(path),
            );
        }
    }
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        _ => true,
    }
}

fn join_path(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", base, name)
    }
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn is_int64(value: &Value) -> bool {
    match value {
        Value::Number(n) => {
            if n.as_i64().is_some() {
                true
            } else if let Some(f) = n.as_f64() {
                f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64
            } else {
                false
            }
        },
        _ => false,
    }
}

fn type_error(path: &str, expected: &str, got: &Value) -> Diagnostic {
    Diagnostic::error(format!("Invalid type for attribute '{}'", path))
        .with_detail(format!("Expected {}, got {}", expected, value_type_name(got)))
        .with_attribute(path)
}

trait DiagnosticExt {
    fn with_attribute_if_not_empty(self, path: &str) -> Self;
}

impl DiagnosticExt for Diagnostic {
    fn with_attribute_if_not_empty(self, path: &str) -> Self {
        if path.is_empty() {
            self
        } else {
            self.with_attribute(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AttributeFlags, Block, NestedBlock, Schema};
    use serde_json::json;

    fn errors(d: &Diagnostics) -> Vec<&Diagnostic> {
        d.errors().collect()
    }

    #[test]
    fn test_validate_required_string() {
        let schema = Schema::v0().with_attribute("name", Attribute::required_string());

        assert!(validate(&schema, &json!({"name": "net1"})).is_empty());

        let diagnostics = validate(&schema, &json!({}));
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics.as_slice()[0].attribute, Some("name".to_string()));

        assert_eq!(validate(&schema, &json!({"name": null})).len(), 1);

        let diagnostics = validate(&schema, &json!({"name": 123}));
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics.as_slice()[0].summary.contains("Invalid type"));
    }

    #[test]
    fn test_computed_attribute_skipped() {
        let schema = Schema::v0().with_attribute("owner_id", Attribute::computed_string());
        assert!(validate(&schema, &json!({})).is_empty());
        assert!(validate(&schema, &json!({"owner_id": 123})).is_empty());
    }

    #[test]
    fn test_validate_int64() {
        let schema = Schema::v0().with_attribute("lease_time", Attribute::required_int64());
        assert!(validate(&schema, &json!({"lease_time": 86400})).is_empty());
        assert!(validate(&schema, &json!({"lease_time": 60.0})).is_empty());
        assert_eq!(validate(&schema, &json!({"lease_time": 60.5})).len(), 1);
        assert_eq!(validate(&schema, &json!({"lease_time": "60"})).len(), 1);
    }

    #[test]
    fn test_validate_set_elements() {
        let schema = Schema::v0().with_attribute(
            "access_level_ids",
            Attribute::new(
                AttributeType::set(AttributeType::String),
                AttributeFlags::required(),
            ),
        );
        assert!(validate(&schema, &json!({"access_level_ids": ["a", "b"]})).is_empty());

        let diagnostics = validate(&schema, &json!({"access_level_ids": ["a", 1]}));
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(
            diagnostics.as_slice()[0].attribute,
            Some("access_level_ids.1".to_string())
        );
    }

    #[test]
    fn test_digit_validator_on_numeric_strings() {
        let schema = Schema::v0()
            .with_attribute("max_virtual_services", Attribute::optional_int_string());

        assert!(validate(&schema, &json!({"max_virtual_services": "10"})).is_empty());
        assert!(validate(&schema, &json!({"max_virtual_services": ""})).is_empty());

        let diagnostics = validate(&schema, &json!({"max_virtual_services": "ten"}));
        assert_eq!(errors(&diagnostics).len(), 1);
        assert!(diagnostics.as_slice()[0]
            .detail
            .as_deref()
            .unwrap()
            .contains("non-negative integer"));
    }

    #[test]
    fn test_string_in_set_and_minimum() {
        let schema = Schema::v0()
            .with_attribute(
                "mode",
                Attribute::optional_string().with_validator(Validator::one_of(["EDGE", "NETWORK"])),
            )
            .with_attribute(
                "lease",
                Attribute::optional_string()
                    .with_validator(Validator::IntInStringAtLeast { min: 60 }),
            );

        assert!(validate(&schema, &json!({"mode": "EDGE", "lease": "60"})).is_empty());
        assert_eq!(validate(&schema, &json!({"mode": "RELAY"})).len(), 1);
        assert_eq!(validate(&schema, &json!({"lease": "59"})).len(), 1);
        assert_eq!(validate(&schema, &json!({"lease": "x"})).len(), 1);
    }

    #[test]
    fn test_conflicts_with_reported_once() {
        let schema = Schema::v0()
            .with_attribute("name", Attribute::optional_string().conflicts_with(["filter"]))
            .with_block(
                "filter",
                NestedBlock::single(
                    Block::new().with_attribute("name_regex", Attribute::optional_string()),
                )
                .conflicts_with(["name"]),
            );

        assert!(validate(&schema, &json!({"name": "n"})).is_empty());
        assert!(validate(&schema, &json!({"filter": {"name_regex": "^n"}})).is_empty());

        let diagnostics = validate(&schema, &json!({"name": "n", "filter": {"name_regex": "^n"}}));
        assert_eq!(errors(&diagnostics).len(), 1);
        assert!(diagnostics.as_slice()[0]
            .detail
            .as_deref()
            .unwrap()
            .contains("conflicts with"));
    }

    #[test]
    fn test_exactly_one_of() {
        let schema = Schema::v0()
            .with_attribute(
                "org_vdc_id",
                Attribute::optional_string().exactly_one_of(["org_vdc_id", "vdc_group_id"]),
            )
            .with_attribute(
                "vdc_group_id",
                Attribute::optional_string().exactly_one_of(["org_vdc_id", "vdc_group_id"]),
            );

        assert!(validate(&schema, &json!({"org_vdc_id": "urn:a"})).is_empty());

        let none = validate(&schema, &json!({}));
        assert_eq!(errors(&none).len(), 1);
        assert!(none.as_slice()[0].detail.as_deref().unwrap().contains("must be specified"));

        let both = validate(&schema, &json!({"org_vdc_id": "a", "vdc_group_id": "b"}));
        assert_eq!(errors(&both).len(), 1);
        assert!(both.as_slice()[0].detail.as_deref().unwrap().contains("only one of"));
    }

    #[test]
    fn test_deprecated_attribute_warns() {
        let schema = Schema::v0().with_attribute(
            "metadata",
            Attribute::new(
                AttributeType::map(AttributeType::String),
                AttributeFlags::optional_computed(),
            )
            .deprecated("Use metadata_entry instead"),
        );

        assert!(validate(&schema, &json!({})).is_empty());

        let diagnostics = validate(&schema, &json!({"metadata": {"k": "v"}}));
        assert!(!diagnostics.has_errors());
        assert_eq!(diagnostics.warnings().count(), 1);
        assert!(is_valid(&schema, &json!({"metadata": {"k": "v"}})));
    }

    #[test]
    fn test_nested_block_cardinality() {
        let schema = Schema::v0().with_block(
            "static_ip_pool",
            NestedBlock::set(
                Block::new()
                    .with_attribute("start_address", Attribute::required_string())
                    .with_attribute("end_address", Attribute::required_string()),
            )
            .with_min_items(1)
            .with_max_items(2),
        );

        let pool = json!({"start_address": "10.0.0.2", "end_address": "10.0.0.9"});
        assert!(validate(&schema, &json!({"static_ip_pool": [pool.clone()]})).is_empty());

        let diagnostics = validate(&schema, &json!({"static_ip_pool": []}));
        assert!(diagnostics.as_slice()[0].summary.contains("at least 1"));

        let diagnostics = validate(
            &schema,
            &json!({"static_ip_pool": [pool.clone(), pool.clone(), pool]}),
        );
        assert!(diagnostics.as_slice()[0].summary.contains("at most 2"));

        let diagnostics = validate(&schema, &json!({"static_ip_pool": [{"start_address": 1, "end_address": "x"}]}));
        assert_eq!(
            diagnostics.as_slice()[0].attribute,
            Some("static_ip_pool.0.start_address".to_string())
        );
    }

    #[test]
    fn test_validate_result_helper() {
        let schema = Schema::v0().with_attribute("name", Attribute::required_string());
        assert!(validate_result(&schema, &json!({"name": "test"})).is_ok());
        assert_eq!(validate_result(&schema, &json!({})).unwrap_err().len(), 1);
    }

    #[test]
    fn test_validate_root_not_object() {
        let schema = Schema::v0().with_attribute("name", Attribute::required_string());
        let diagnostics = validate(&schema, &json!("not an object"));
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics.as_slice()[0].summary.contains("Expected object"));
    }
}
