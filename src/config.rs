//! Provider-level configuration.
//!
//! The host hands the provider block over as JSON. Only the settings that
//! shape engine behaviour live here; connection settings belong to the SDK
//! client.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProviderError, Result};
use crate::import::DEFAULT_IMPORT_SEPARATOR;
use crate::schema::{Attribute, AttributeFlags, AttributeType, Schema};

/// Environment variable overriding the import separator.
pub const IMPORT_SEPARATOR_ENV: &str = "VCD_IMPORT_SEPARATOR";

/// Engine settings taken from the provider block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    /// Separator between import path parts.
    #[serde(default)]
    pub import_separator: Option<String>,
    /// Deadline applied to every lifecycle operation, in seconds.
    #[serde(default)]
    pub operation_timeout_secs: Option<u64>,
    /// Per-resource-type deadlines, in seconds, overriding the default.
    #[serde(default)]
    pub timeouts: HashMap<String, u64>,
    /// Default log filter when `RUST_LOG` is not set.
    #[serde(default)]
    pub log_level: Option<String>,
    /// Skip metadata reconciliation on update.
    #[serde(default)]
    pub ignore_metadata_changes: bool,
}

impl ProviderConfig {
    /// Parse the provider block; `null` yields the defaults.
    ///
    /// An import separator missing from the block is taken from
    /// `VCD_IMPORT_SEPARATOR` when that is set.
    pub fn from_value(value: Value) -> Result<Self> {
        Self::from_value_with_env(value, std::env::var(IMPORT_SEPARATOR_ENV).ok())
    }

    /// Parse the provider block against an explicit environment snapshot.
    pub fn from_value_with_env(value: Value, import_separator: Option<String>) -> Result<Self> {
        let config: Self = if value.is_null() {
            Self::default()
        } else {
            serde_json::from_value(value)?
        };
        let config = config.with_env(import_separator);
        config.check()?;
        Ok(config)
    }

    /// Defaults, with the import separator taken from the environment if set.
    pub fn from_env() -> Result<Self> {
        Self::from_value(Value::Null)
    }

    /// Fill unset values from the environment snapshot.
    pub fn with_env(mut self, import_separator: Option<String>) -> Self {
        if self.import_separator.is_none() {
            self.import_separator = import_separator;
        }
        self
    }

    fn check(&self) -> Result<()> {
        if matches!(self.import_separator.as_deref(), Some("")) {
            return Err(ProviderError::Validation(
                "import_separator must not be empty".to_string(),
            ));
        }
        if self.operation_timeout_secs == Some(0) || self.timeouts.values().any(|t| *t == 0) {
            return Err(ProviderError::Validation(
                "timeouts must be at least one second".to_string(),
            ));
        }
        Ok(())
    }

    /// Separator between import path parts.
    pub fn import_separator(&self) -> &str {
        self.import_separator
            .as_deref()
            .unwrap_or(DEFAULT_IMPORT_SEPARATOR)
    }

    /// Deadline for operations on `resource_type`, if any.
    pub fn timeout_for(&self, resource_type: &str) -> Option<Duration> {
        self.timeouts
            .get(resource_type)
            .copied()
            .or(self.operation_timeout_secs)
            .map(Duration::from_secs)
    }

    /// Default log filter.
    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    /// Set the import separator.
    pub fn with_import_separator(mut self, separator: impl Into<String>) -> Self {
        self.import_separator = Some(separator.into());
        self
    }

    /// Set the default operation deadline.
    pub fn with_operation_timeout(mut self, secs: u64) -> Self {
        self.operation_timeout_secs = Some(secs);
        self
    }

    /// Set a deadline for one resource type.
    pub fn with_timeout(mut self, resource_type: impl Into<String>, secs: u64) -> Self {
        self.timeouts.insert(resource_type.into(), secs);
        self
    }

    /// Schema of the provider block.
    pub fn schema() -> Schema {
        Schema::new(0)
            .with_attribute(
                "import_separator",
                Attribute::optional_string()
                    .with_description("Separator between import path parts (default '.')"),
            )
            .with_attribute(
                "operation_timeout_secs",
                Attribute::optional_int64().with_description("Deadline for every operation"),
            )
            .with_attribute(
                "timeouts",
                Attribute::new(
                    AttributeType::map(AttributeType::Int64),
                    AttributeFlags::optional(),
                )
                .with_description("Per-resource-type deadlines in seconds"),
            )
            .with_attribute("log_level", Attribute::optional_string())
            .with_attribute(
                "ignore_metadata_changes",
                Attribute::optional_bool().with_default(Value::Bool(false)),
            )
    }
}
