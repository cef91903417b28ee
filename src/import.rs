//! Import path parsing.
//!
//! An import path is a single string such as `my-org.my-vdc.my-network`.
//! Each resource declares its [`ImportShape`] in its schema; the shape fixes
//! the arity and names each position so that arity errors can spell out the
//! expected form literally.

use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// Default separator between import path parts.
pub const DEFAULT_IMPORT_SEPARATOR: &str = ".";

/// One named position in an import path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSegment {
    /// Label used in error messages, e.g. `vdc-name`.
    pub name: String,
    /// Number of dot-separated parts this segment spans when the
    /// separator is `.` (a version such as `1.0.0` spans three).
    #[serde(default = "one")]
    pub dotted_width: usize,
}

fn one() -> usize {
    1
}

impl ImportSegment {
    /// A segment holding one part.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dotted_width: 1,
        }
    }

    /// A segment whose value itself contains `width - 1` dots.
    pub fn dotted(name: impl Into<String>, width: usize) -> Self {
        Self {
            name: name.into(),
            dotted_width: width.max(1),
        }
    }
}

/// The declared shape of a resource's import path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportShape {
    segments: Vec<ImportSegment>,
}

impl ImportShape {
    /// Build a shape from segment labels.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: names.into_iter().map(ImportSegment::new).collect(),
        }
    }

    /// Build a shape from explicit segments.
    pub fn from_segments(segments: Vec<ImportSegment>) -> Self {
        Self { segments }
    }

    /// Number of parts expected after splitting on `separator`.
    pub fn arity(&self, separator: &str) -> usize {
        self.segments
            .iter()
            .map(|s| {
                if separator == "." {
                    s.dotted_width
                } else {
                    1
                }
            })
            .sum()
    }

    /// The expected form, e.g. `org-name.vdc-name.network-name`.
    pub fn describe(&self, separator: &str) -> String {
        self.segments
            .iter()
            .map(|s| s.name.as_str())
            .collect::<Vec<_>>()
            .join(separator)
    }

    /// Split `raw` on `separator` and bind each part to its segment.
    pub fn parse(&self, raw: &str, separator: &str) -> Result<ImportPath, ProviderError> {
        if separator.is_empty() {
            return Err(ProviderError::Validation(
                "import separator must not be empty".to_string(),
            ));
        }

        let parts: Vec<&str> = raw.split(separator).collect();
        if parts.len() != self.arity(separator) || parts.iter().any(|p| p.is_empty()) {
            return Err(ProviderError::Validation(format!(
                "resource name must be specified as {}",
                self.describe(separator)
            )));
        }

        let mut values = Vec::with_capacity(self.segments.len());
        let mut cursor = 0;
        for segment in &self.segments {
            let width = if separator == "." {
                segment.dotted_width
            } else {
                1
            };
            let value = parts[cursor..cursor + width].join(".");
            values.push((segment.name.clone(), value));
            cursor += width;
        }

        Ok(ImportPath {
            raw: raw.to_string(),
            values,
        })
    }
}

/// A parsed import path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportPath {
    raw: String,
    values: Vec<(String, String)>,
}

impl ImportPath {
    /// The string the user supplied.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Value bound to the segment label.
    pub fn get(&self, name: &str) -> Result<&str, ProviderError> {
        self.values
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
            .ok_or_else(|| {
                ProviderError::Validation(format!("import path has no '{}' segment", name))
            })
    }

    /// Value at the given position.
    pub fn at(&self, index: usize) -> Option<&str> {
        self.values.get(index).map(|(_, v)| v.as_str())
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the path has no segments.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
