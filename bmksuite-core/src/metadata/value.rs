//! Typed metadata values and the parse-or-default combinators.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::command::NOT_AVAILABLE;

/// A single metadata field.
///
/// Serialized without a tag so the report carries plain JSON scalars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

/// One metadata section, e.g. `CPU` or `MEMORY`.
pub type MetaRecord = BTreeMap<String, MetaValue>;

impl MetaValue {
    /// The sentinel used when a field cannot be determined.
    pub fn not_available() -> Self {
        MetaValue::Text(NOT_AVAILABLE.to_string())
    }

    pub fn is_available(&self) -> bool {
        !matches!(self, MetaValue::Text(s) if s == NOT_AVAILABLE)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetaValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl std::fmt::Display for MetaValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetaValue::Int(i) => write!(f, "{i}"),
            MetaValue::Float(x) => write!(f, "{x}"),
            MetaValue::Bool(b) => write!(f, "{b}"),
            MetaValue::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<&str> for MetaValue {
    fn from(s: &str) -> Self {
        MetaValue::Text(s.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(s: String) -> Self {
        MetaValue::Text(s)
    }
}

impl From<i64> for MetaValue {
    fn from(i: i64) -> Self {
        MetaValue::Int(i)
    }
}

impl From<f64> for MetaValue {
    fn from(x: f64) -> Self {
        MetaValue::Float(x)
    }
}

impl From<bool> for MetaValue {
    fn from(b: bool) -> Self {
        MetaValue::Bool(b)
    }
}

/// Target type of a parsed field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Int,
    Float,
}

fn log_fallback(field: &str, raw: &str, reason: &dyn std::fmt::Display) {
    if raw == NOT_AVAILABLE {
        debug!(field, "Field not available, keeping sentinel");
    } else {
        warn!(field, raw, reason = %reason, "Could not coerce field, keeping raw text");
    }
}

/// Parse an integer, keeping the raw text when it is not one.
pub fn int_or_text(field: &str, raw: &str) -> MetaValue {
    match raw.trim().parse::<i64>() {
        Ok(value) => MetaValue::Int(value),
        Err(e) => {
            log_fallback(field, raw, &e);
            MetaValue::Text(raw.to_string())
        }
    }
}

/// Parse a float, keeping the raw text when it is not one.
pub fn float_or_text(field: &str, raw: &str) -> MetaValue {
    match raw.trim().parse::<f64>() {
        Ok(value) => MetaValue::Float(value),
        Err(e) => {
            log_fallback(field, raw, &e);
            MetaValue::Text(raw.to_string())
        }
    }
}

/// Coerce a raw field to the requested kind.
pub fn coerce(field: &str, raw: &str, kind: FieldKind) -> MetaValue {
    match kind {
        FieldKind::Text => MetaValue::Text(raw.to_string()),
        FieldKind::Int => int_or_text(field, raw),
        FieldKind::Float => float_or_text(field, raw),
    }
}
