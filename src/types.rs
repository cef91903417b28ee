//! Value types exchanged between the host and the engine.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{ProviderError, Result};
use crate::mapping::AttributeMap;

/// A change to a single attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeChange {
    /// The attribute that changed.
    pub path: String,
    /// The value before the change (None if newly set).
    pub before: Option<serde_json::Value>,
    /// The value after the change (None if removed).
    pub after: Option<serde_json::Value>,
}

impl AttributeChange {
    /// Create a new attribute change.
    pub fn new(
        path: impl Into<String>,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
    ) -> Self {
        Self {
            path: path.into(),
            before,
            after,
        }
    }

    /// Create a change for a newly set attribute.
    pub fn added(path: impl Into<String>, value: serde_json::Value) -> Self {
        Self::new(path, None, Some(value))
    }

    /// Create a change for a removed attribute.
    pub fn removed(path: impl Into<String>, value: serde_json::Value) -> Self {
        Self::new(path, Some(value), None)
    }

    /// Create a change for a modified attribute.
    pub fn modified(
        path: impl Into<String>,
        before: serde_json::Value,
        after: serde_json::Value,
    ) -> Self {
        Self::new(path, Some(before), Some(after))
    }
}

/// Engine-side view of one managed object.
///
/// The ID is the VCD URN of the object, or a composite key for resources
/// that do not map to a single object. Once non-empty it never changes for
/// the lifetime of the instance; clearing it marks the instance as gone.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceInstance {
    id: String,
    /// Attribute values, keyed by attribute name.
    pub attributes: AttributeMap,
    /// Attributes the most recent update changed.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub changed: BTreeSet<String>,
}

impl ResourceInstance {
    /// An instance that does not exist yet.
    pub fn planned(attributes: AttributeMap) -> Self {
        Self {
            id: String::new(),
            attributes,
            changed: BTreeSet::new(),
        }
    }

    /// An instance already known to exist.
    pub fn present(id: impl Into<String>, mut attributes: AttributeMap) -> Self {
        let id = id.into();
        attributes.set("id", id.clone());
        Self {
            id,
            attributes,
            changed: BTreeSet::new(),
        }
    }

    /// The object ID; empty when the object does not exist.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the instance refers to an existing object.
    pub fn is_present(&self) -> bool {
        !self.id.is_empty()
    }

    /// Record the ID assigned at creation.
    ///
    /// Setting a different non-empty ID on an instance that already has one
    /// is refused.
    pub fn set_id(&mut self, id: impl Into<String>) -> Result<()> {
        let id = id.into();
        if id.is_empty() {
            return Err(ProviderError::Validation(
                "resource ID must not be empty".to_string(),
            ));
        }
        if !self.id.is_empty() && self.id != id {
            return Err(ProviderError::Validation(format!(
                "resource ID is immutable: '{}' cannot become '{}'",
                self.id, id
            )));
        }
        self.attributes.set("id", id.clone());
        self.id = id;
        Ok(())
    }

    /// Forget the object: it no longer exists.
    pub fn tombstone(&mut self) {
        self.id.clear();
        self.attributes.remove("id");
    }
}

/// An object located by an import path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportedResource {
    /// ID of the located object.
    pub id: String,
    /// Attributes needed to read it back (parent IDs, org name).
    pub attributes: AttributeMap,
}

impl ImportedResource {
    /// Create an imported resource.
    pub fn new(id: impl Into<String>, attributes: AttributeMap) -> Self {
        Self {
            id: id.into(),
            attributes,
        }
    }
}

/// Registered resource and data source names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProviderMetadata {
    /// Resource type names, sorted.
    pub resources: Vec<String>,
    /// Data source type names, sorted.
    pub data_sources: Vec<String>,
}
