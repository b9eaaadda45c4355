use std::fmt;

use serde::{Deserialize, Serialize};

/// The logical type of a record field.
///
/// The logical type decides which mapping rule applies to the field's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalType {
    /// A boolean value. Mapped to rows `0`/`1`, or folded into the packed boolean fields.
    Bool,
    /// A signed 64-bit integer. Mapped to a row id, or to a BSI value when a range is declared.
    Int,
    /// A 64-bit floating point number. Must be scaled to an integer before it can be mapped.
    Float,
    /// A UTF-8 string. Mapped to a row key, or parsed as a row id.
    String,
    /// A list of strings. Each element produces one mutation.
    StringArray,
    /// A point in time, attached to every mutation of the record.
    Timestamp,
}

/// How string values are turned into rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StringMode {
    /// The string itself is the row key.
    #[default]
    Keyed,
    /// The string is a decimal row id.
    Id,
}

/// Linear transformation applied to floats before they are stored as integers.
///
/// The stored value is `round((v - offset) * multiplier)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scale {
    pub multiplier: f64,
    #[serde(default)]
    pub offset: f64,
}

/// Inclusive bounds of an integer field stored as a bit-sliced index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IntRange {
    pub min: i64,
    pub max: i64,
}

impl LogicalType {
    /// Returns `true` if values of this type can be turned into integers.
    pub fn is_numeric(&self) -> bool {
        matches!(self, LogicalType::Int | LogicalType::Float)
    }
}

impl Scale {
    pub fn new(multiplier: f64, offset: f64) -> Self {
        Self { multiplier, offset }
    }

    /// Scales `value`, returning `None` if the result does not fit an `i64`.
    pub fn apply(&self, value: f64) -> Option<i64> {
        let scaled = ((value - self.offset) * self.multiplier).round();
        if !scaled.is_finite() || scaled < i64::MIN as f64 || scaled > i64::MAX as f64 {
            return None;
        }

        Some(scaled as i64)
    }
}

impl Default for Scale {
    fn default() -> Self {
        Self {
            multiplier: 1.0,
            offset: 0.0,
        }
    }
}

impl IntRange {
    pub fn new(min: i64, max: i64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: i64) -> bool {
        self.min <= value && value <= self.max
    }
}

impl fmt::Display for LogicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogicalType::Bool => "bool",
            LogicalType::Int => "int",
            LogicalType::Float => "float",
            LogicalType::String => "string",
            LogicalType::StringArray => "string_array",
            LogicalType::Timestamp => "timestamp",
        };
        f.write_str(name)
    }
}
