//! Index mutations and batches.
use std::fmt;

use bytes::Bytes;
use serde::{Serialize, Serializer, ser::SerializeStruct};

/// A row or column reference: either a numeric id or a key.
///
/// Keys are bytes since composite column keys are not always valid UTF-8.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Ref {
    Id(u64),
    Key(Bytes),
}

/// What a mutation sets on its column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Bit {
    /// Sets the bit of a row.
    Row(Ref),
    /// Stores an integer value (BSI).
    Value(i64),
}

/// The kind of index field a mutation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FieldKind {
    Set { keys: bool },
    /// A set field whose bits also carry a timestamp.
    Time { keys: bool },
    Int { min: i64, max: i64 },
}

/// The index field a mutation is applied to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldTarget {
    pub name: String,
    pub kind: FieldKind,
}

/// A single change to the index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Mutation {
    pub field: FieldTarget,
    pub bit: Bit,
    pub column: Ref,
    /// Milliseconds since the Unix epoch.
    pub timestamp: Option<i64>,
}

/// Mutations of a single field, applied to the sink as a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub field: FieldTarget,
    pub mutations: Vec<Mutation>,
}

impl Ref {
    pub fn key(key: impl Into<Bytes>) -> Self {
        Ref::Key(key.into())
    }

    pub fn is_key(&self) -> bool {
        matches!(self, Ref::Key(_))
    }

    pub fn as_id(&self) -> Option<u64> {
        match self {
            Ref::Id(id) => Some(*id),
            Ref::Key(_) => None,
        }
    }

    pub fn as_key(&self) -> Option<&[u8]> {
        match self {
            Ref::Key(key) => Some(key),
            Ref::Id(_) => None,
        }
    }
}

impl From<u64> for Ref {
    fn from(id: u64) -> Self {
        Ref::Id(id)
    }
}

impl From<&str> for Ref {
    fn from(key: &str) -> Self {
        Ref::Key(Bytes::copy_from_slice(key.as_bytes()))
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ref::Id(id) => write!(f, "{id}"),
            Ref::Key(key) => match std::str::from_utf8(key) {
                Ok(key) => write!(f, "{key:?}"),
                Err(_) => {
                    f.write_str("0x")?;
                    key.iter().try_for_each(|b| write!(f, "{b:02x}"))
                }
            },
        }
    }
}

impl Serialize for Ref {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Ref::Id(id) => serializer.serialize_u64(*id),
            Ref::Key(key) => serializer.serialize_str(&String::from_utf8_lossy(key)),
        }
    }
}

impl FieldKind {
    /// Returns `true` if rows of this field are referenced by key.
    pub fn row_keys(&self) -> bool {
        match self {
            FieldKind::Set { keys } | FieldKind::Time { keys } => *keys,
            FieldKind::Int { .. } => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FieldKind::Set { .. } => "set",
            FieldKind::Time { .. } => "time",
            FieldKind::Int { .. } => "int",
        }
    }
}

impl FieldTarget {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

impl fmt::Display for FieldTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.kind.name())
    }
}

impl Serialize for Mutation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Mutation", 4)?;
        state.serialize_field("field", &self.field.name)?;
        match &self.bit {
            Bit::Row(row) => state.serialize_field("row", row)?,
            Bit::Value(value) => state.serialize_field("value", value)?,
        }
        state.serialize_field("column", &self.column)?;
        state.serialize_field("timestamp", &self.timestamp)?;
        state.end()
    }
}

impl Batch {
    pub fn new(field: FieldTarget) -> Self {
        Self {
            field,
            mutations: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref_display() {
        assert_eq!(Ref::Id(159).to_string(), "159");
        assert_eq!(Ref::from("abc").to_string(), "\"abc\"");
        assert_eq!(
            Ref::key(vec![0x32, 0x31, 0x00, 0xff]).to_string(),
            "0x323100ff"
        );
    }

    #[test]
    fn test_mutation_serialize() {
        let mutation = Mutation {
            field: FieldTarget::new("fare", FieldKind::Int { min: 0, max: 100 }),
            bit: Bit::Value(42),
            column: Ref::Id(7),
            timestamp: None,
        };
        let json = serde_json::to_string(&mutation).unwrap();
        assert_eq!(
            json,
            r#"{"field":"fare","value":42,"column":7,"timestamp":null}"#
        );
    }
}
