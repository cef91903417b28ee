//! Metadata reconciliation.
//!
//! Users describe metadata in one of two shapes: the deprecated `metadata`
//! map (string values, empty namespace) or the structured `metadata_entry`
//! set. Reads populate both shapes. Writes compute a plan against what VCD
//! currently holds and apply it as creates, then updates, then deletes, so
//! applying the same desired set twice issues no calls the second time.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::client::{ObjectRef, VcdClient};
use crate::error::{ApiError, ProviderError, Result};
use crate::mapping::AttributeMap;
use crate::schema::{Attribute, AttributeFlags, AttributeType, Block, NestedBlock, Schema, Validator};

/// Name of the deprecated map attribute.
pub const METADATA: &str = "metadata";
/// Name of the structured entry block.
pub const METADATA_ENTRY: &str = "metadata_entry";

/// Type of a metadata value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MetadataValueType {
    /// A string.
    #[default]
    #[serde(rename = "MetadataStringValue")]
    String,
    /// A number.
    #[serde(rename = "MetadataNumberValue")]
    Number,
    /// A boolean.
    #[serde(rename = "MetadataBooleanValue")]
    Bool,
    /// A date-time.
    #[serde(rename = "MetadataDateTimeValue")]
    DateTime,
}

impl MetadataValueType {
    /// Wire name, e.g. `MetadataStringValue`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "MetadataStringValue",
            Self::Number => "MetadataNumberValue",
            Self::Bool => "MetadataBooleanValue",
            Self::DateTime => "MetadataDateTimeValue",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        serde_json::from_value(Value::String(raw.to_string()))
            .map_err(|_| ProviderError::Validation(format!("unknown metadata type '{}'", raw)))
    }
}

/// Who may see and change an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UserAccess {
    /// Readable and writable by tenants.
    #[default]
    ReadWrite,
    /// Readable by tenants.
    ReadOnly,
    /// Hidden from tenants.
    Private,
}

impl UserAccess {
    /// Wire name, e.g. `READWRITE`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadWrite => "READWRITE",
            Self::ReadOnly => "READONLY",
            Self::Private => "PRIVATE",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        serde_json::from_value(Value::String(raw.to_string()))
            .map_err(|_| ProviderError::Validation(format!("unknown user_access '{}'", raw)))
    }
}

/// One metadata entry of an object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetadataEntry {
    /// Entry key.
    pub key: String,
    /// Value, always carried as a string.
    pub value: String,
    /// Declared value type.
    #[serde(rename = "type", default)]
    pub value_type: MetadataValueType,
    /// Visibility to tenants.
    #[serde(default)]
    pub user_access: UserAccess,
    /// Whether the entry lives in the SYSTEM domain.
    #[serde(default)]
    pub is_system: bool,
    /// Namespace; empty for legacy entries.
    #[serde(default)]
    pub namespace: String,
}

impl MetadataEntry {
    /// A plain string entry in the empty namespace.
    pub fn string(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            value_type: MetadataValueType::String,
            user_access: UserAccess::ReadWrite,
            is_system: false,
            namespace: String::new(),
        }
    }

    /// Identity of the entry: `(namespace, key)`.
    pub fn identity(&self) -> (&str, &str) {
        (&self.namespace, &self.key)
    }

    /// Whether the legacy `metadata` map can express this entry.
    pub fn is_legacy(&self) -> bool {
        self.namespace.is_empty() && self.value_type == MetadataValueType::String && !self.is_system
    }

    fn from_block(block: &AttributeMap) -> Result<Self> {
        let value_type = match block.opt_string("type") {
            Some(raw) => MetadataValueType::parse(&raw)?,
            None => MetadataValueType::default(),
        };
        let user_access = match block.opt_string("user_access") {
            Some(raw) => UserAccess::parse(&raw)?,
            None => UserAccess::default(),
        };
        Ok(Self {
            key: block.string("key")?,
            value: block.opt_string("value").unwrap_or_default(),
            value_type,
            user_access,
            is_system: block.opt_bool("is_system").unwrap_or(false),
            namespace: block.opt_string("namespace").unwrap_or_default(),
        })
    }

    fn to_block(&self) -> Value {
        json!({
            "key": self.key,
            "value": self.value,
            "type": self.value_type.as_str(),
            "user_access": self.user_access.as_str(),
            "is_system": self.is_system,
            "namespace": self.namespace,
        })
    }
}

/// Where a resource's metadata lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataTarget {
    /// The resource has no metadata.
    None,
    /// Metadata is attached to this object.
    Object(ObjectRef),
    /// Metadata cannot be managed; the reason becomes a warning.
    Unsupported(String),
}

/// Add the `metadata` and `metadata_entry` members to a resource schema.
pub fn with_metadata_schema(schema: Schema) -> Schema {
    let entry = Block::new()
        .with_attribute("key", Attribute::required_string())
        .with_attribute("value", Attribute::required_string())
        .with_attribute(
            "type",
            Attribute::optional_string()
                .with_default(json!(MetadataValueType::String.as_str()))
                .with_validator(Validator::one_of([
                    "MetadataStringValue",
                    "MetadataNumberValue",
                    "MetadataBooleanValue",
                    "MetadataDateTimeValue",
                ])),
        )
        .with_attribute(
            "user_access",
            Attribute::optional_string()
                .with_default(json!(UserAccess::ReadWrite.as_str()))
                .with_validator(Validator::one_of(["READWRITE", "READONLY", "PRIVATE"])),
        )
        .with_attribute(
            "is_system",
            Attribute::optional_bool().with_default(json!(false)),
        )
        .with_attribute("namespace", Attribute::optional_computed_string());

    schema
        .with_attribute(
            METADATA,
            Attribute::new(
                AttributeType::map(AttributeType::String),
                AttributeFlags::optional_computed(),
            )
            .with_description("Key and value pairs for the metadata of this object")
            .deprecated("Use metadata_entry instead")
            .conflicts_with([METADATA_ENTRY]),
        )
        .with_block(
            METADATA_ENTRY,
            NestedBlock::set(entry).conflicts_with([METADATA]),
        )
}

/// Add read-only `metadata` and `metadata_entry` members to a data source schema.
pub fn with_computed_metadata_schema(schema: Schema) -> Schema {
    let entry = AttributeType::object(HashMap::from([
        ("key".to_string(), AttributeType::String),
        ("value".to_string(), AttributeType::String),
        ("type".to_string(), AttributeType::String),
        ("user_access".to_string(), AttributeType::String),
        ("is_system".to_string(), AttributeType::Bool),
        ("namespace".to_string(), AttributeType::String),
    ]));
    schema
        .with_attribute(
            METADATA,
            Attribute::new(
                AttributeType::map(AttributeType::String),
                AttributeFlags::computed(),
            ),
        )
        .with_attribute(
            METADATA_ENTRY,
            Attribute::new(AttributeType::set(entry), AttributeFlags::computed()),
        )
}

/// Project entries onto the legacy map: empty namespace, string type, not system.
pub fn legacy_projection(entries: &[MetadataEntry]) -> BTreeMap<String, String> {
    entries
        .iter()
        .filter(|e| e.is_legacy())
        .map(|e| (e.key.clone(), e.value.clone()))
        .collect()
}

/// Write observed entries into both attribute shapes.
pub fn populate(attrs: &mut AttributeMap, entries: &[MetadataEntry]) {
    let legacy: serde_json::Map<String, Value> = legacy_projection(entries)
        .into_iter()
        .map(|(k, v)| (k, Value::String(v)))
        .collect();
    attrs.set(METADATA, Value::Object(legacy));

    let mut sorted: Vec<_> = entries.iter().collect();
    sorted.sort_by(|a, b| a.identity().cmp(&b.identity()));
    attrs.set(
        METADATA_ENTRY,
        Value::Array(sorted.into_iter().map(MetadataEntry::to_block).collect()),
    );
}

/// Entries the configuration asks for.
///
/// Setting both shapes is a validation error. Setting neither yields an
/// empty list.
pub fn desired_entries(attrs: &AttributeMap) -> Result<Vec<MetadataEntry>> {
    let has_map = attrs.is_set(METADATA);
    let has_entries = attrs.is_set(METADATA_ENTRY);
    if has_map && has_entries {
        return Err(ProviderError::Validation(format!(
            "\"{}\": conflicts with {}",
            METADATA, METADATA_ENTRY
        )));
    }

    if has_entries {
        return attrs
            .objects(METADATA_ENTRY)
            .iter()
            .map(MetadataEntry::from_block)
            .collect();
    }

    let map = attrs.string_map(METADATA);
    let mut entries = Vec::with_capacity(map.len());
    for (key, value) in map {
        let value = match value {
            Value::String(s) => s,
            other => other.to_string(),
        };
        entries.push(MetadataEntry::string(key, value));
    }
    Ok(entries)
}

/// Observed entries the configuration manages.
///
/// When the legacy map drives the write it only owns its own projection;
/// namespaced, typed and system entries are left as they are.
pub fn managed_entries(attrs: &AttributeMap, observed: Vec<MetadataEntry>) -> Vec<MetadataEntry> {
    if attrs.is_set(METADATA) {
        observed.into_iter().filter(MetadataEntry::is_legacy).collect()
    } else {
        observed
    }
}

/// Calls needed to turn the observed entries into the desired ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataPlan {
    /// Entries to add.
    pub create: Vec<MetadataEntry>,
    /// Entries whose value, type or access changed.
    pub update: Vec<MetadataEntry>,
    /// Entries to remove.
    pub delete: Vec<MetadataEntry>,
}

impl MetadataPlan {
    /// Diff desired against observed, keyed by `(namespace, key)`.
    pub fn diff(desired: &[MetadataEntry], observed: &[MetadataEntry]) -> Self {
        let observed_by_id: BTreeMap<_, _> = observed.iter().map(|e| (e.identity(), e)).collect();
        let desired_by_id: BTreeMap<_, _> = desired.iter().map(|e| (e.identity(), e)).collect();

        let mut plan = Self::default();
        for (id, entry) in &desired_by_id {
            match observed_by_id.get(id) {
                None => plan.create.push((*entry).clone()),
                Some(current) if *current != *entry => plan.update.push((*entry).clone()),
                Some(_) => {},
            }
        }
        for (id, entry) in &observed_by_id {
            if !desired_by_id.contains_key(id) {
                plan.delete.push((*entry).clone());
            }
        }
        plan
    }

    /// Whether nothing needs to change.
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }

    /// Number of SDK calls the plan issues.
    pub fn len(&self) -> usize {
        self.create.len() + self.update.len() + self.delete.len()
    }

    /// Apply in create, update, delete order.
    pub async fn apply(&self, client: &dyn VcdClient, object: &ObjectRef) -> Result<(), ApiError> {
        for entry in &self.create {
            debug!(object = %object.id, key = %entry.key, "adding metadata entry");
            client.add_metadata(object, entry).await?;
        }
        for entry in &self.update {
            debug!(object = %object.id, key = %entry.key, "updating metadata entry");
            client.update_metadata(object, entry).await?;
        }
        for entry in &self.delete {
            debug!(object = %object.id, key = %entry.key, "deleting metadata entry");
            client
                .delete_metadata(object, &entry.namespace, &entry.key)
                .await?;
        }
        Ok(())
    }

    /// Entries after applying the plan to `observed`.
    pub fn applied_to(&self, observed: &[MetadataEntry]) -> Vec<MetadataEntry> {
        let mut result: BTreeMap<(String, String), MetadataEntry> = observed
            .iter()
            .map(|e| ((e.namespace.clone(), e.key.clone()), e.clone()))
            .collect();
        for entry in self.create.iter().chain(&self.update) {
            result.insert((entry.namespace.clone(), entry.key.clone()), entry.clone());
        }
        for entry in &self.delete {
            result.remove(&(entry.namespace.clone(), entry.key.clone()));
        }
        result.into_values().collect()
    }
}
