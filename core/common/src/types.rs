//! Common types used throughout gapsync.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Identifier assigned to a record by the remote catalog.
///
/// Catalogs hand these out as either JSON numbers or strings; both are
/// normalized to their decimal/string form so that `17` and `"17"` key the
/// same document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    /// Create a SourceId from a string.
    ///
    /// # Errors
    /// - Returns error if id is empty or whitespace
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(crate::Error::InvalidInput(
                "SourceId cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Extract an identifier from a JSON value.
    ///
    /// Accepts non-empty strings and integers; anything else yields `None`.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Self::new(s.clone()).ok(),
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(Self(n.to_string())),
            _ => None,
        }
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single document pulled from the remote catalog.
///
/// The document body is opaque; only the identifier is interpreted, for
/// keying and deduplication in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Identifier extracted from the document, if present and well formed.
    pub id: Option<SourceId>,
    /// The raw document as returned by the source.
    pub document: Value,
}

impl Record {
    /// Build a record, reading its identifier from `id_field`.
    pub fn from_document(document: Value, id_field: &str) -> Self {
        let id = document.get(id_field).and_then(SourceId::from_value);
        Self { id, document }
    }

    /// Build a record with a known identifier.
    pub fn with_id(id: SourceId, document: Value) -> Self {
        Self {
            id: Some(id),
            document,
        }
    }
}

/// An inclusive identifier range requested in one remote fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdWindow {
    from: u64,
    to: u64,
}

impl IdWindow {
    /// Create a window covering `[from, to]`.
    ///
    /// # Errors
    /// - `from` is zero (catalog identifiers are 1-based)
    /// - `to` is below `from`
    pub fn new(from: u64, to: u64) -> crate::Result<Self> {
        if from == 0 {
            return Err(crate::Error::InvalidInput(
                "Window must start at identifier 1 or above".to_string(),
            ));
        }
        if to < from {
            return Err(crate::Error::InvalidInput(format!(
                "Window end {} is below its start {}",
                to, from
            )));
        }
        Ok(Self { from, to })
    }

    /// First identifier in the window.
    pub fn from(&self) -> u64 {
        self.from
    }

    /// Last identifier in the window.
    pub fn to(&self) -> u64 {
        self.to
    }

    /// Number of identifier positions covered.
    pub fn len(&self) -> u64 {
        self.to - self.from + 1
    }

    /// Windows are never empty; provided for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Whether `id` falls inside the window.
    pub fn contains(&self, id: u64) -> bool {
        id >= self.from && id <= self.to
    }

    /// First identifier after the window.
    pub fn next_start(&self) -> u64 {
        self.to.saturating_add(1)
    }
}

impl fmt::Display for IdWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.from, self.to)
    }
}
