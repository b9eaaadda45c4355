//! Column assignment.
//!
//! Every mutation of a record targets the same column, derived from the record
//! either as a composite key or as a numeric id.
use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    error::{ConfigError, MalformedRecord},
    mutation::Ref,
    record::{Record, Value},
};

/// How a record produces its column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdAssignment {
    /// The column key is the concatenation of the encoded values of these fields.
    PrimaryKey(Vec<String>),
    /// The column id is the value of this field.
    IdField(String),
}

impl IdAssignment {
    /// Builds the assignment from the command line options.
    ///
    /// Exactly one of `primary_key_fields` and `id_field` must be set.
    pub fn from_options(
        primary_key_fields: &[String],
        id_field: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let id_field = id_field.filter(|f| !f.is_empty());
        match (primary_key_fields.is_empty(), id_field) {
            (false, Some(_)) => Err(ConfigError::ConflictingOptions {
                message: "primary-key-fields and id-field are mutually exclusive".to_string(),
            }),
            (true, None) => Err(ConfigError::ConflictingOptions {
                message: "one of primary-key-fields or id-field is required".to_string(),
            }),
            (true, Some(field)) => Ok(IdAssignment::IdField(field.to_string())),
            (false, None) => {
                if let Some(field) = primary_key_fields.iter().find(|f| f.is_empty()) {
                    return Err(ConfigError::InvalidOption {
                        name: "primary-key-fields",
                        message: format!("empty field name in {field:?}"),
                    });
                }
                Ok(IdAssignment::PrimaryKey(primary_key_fields.to_vec()))
            }
        }
    }

    /// Returns `true` if columns are referenced by key.
    pub fn column_keys(&self) -> bool {
        matches!(self, IdAssignment::PrimaryKey(_))
    }

    /// Returns the field that holds the column id, if any.
    pub fn id_field(&self) -> Option<&str> {
        match self {
            IdAssignment::IdField(field) => Some(field),
            IdAssignment::PrimaryKey(_) => None,
        }
    }

    /// Derives the column of `record`.
    pub fn column(&self, record: &Record) -> Result<Ref, MalformedRecord> {
        match self {
            IdAssignment::PrimaryKey(fields) => {
                let mut key = BytesMut::new();
                for field in fields {
                    encode_key_component(field, record.value(field), &mut key)?;
                }
                Ok(Ref::Key(key.freeze()))
            }
            IdAssignment::IdField(field) => column_id(field, record.value(field)).map(Ref::Id),
        }
    }
}

/// Appends the canonical byte form of a key component.
///
/// Strings are written as UTF-8. Integers that fit in a `u32` are written as
/// four big-endian bytes, other integers as eight big-endian bytes. Booleans
/// take one byte and floats their eight-byte big-endian IEEE-754 bits.
pub fn encode_key_component(
    field: &str,
    value: &Value,
    out: &mut BytesMut,
) -> Result<(), MalformedRecord> {
    match value {
        Value::Null => {
            return Err(MalformedRecord::MissingKeyField {
                field: field.to_string(),
            });
        }
        Value::String(s) => out.put_slice(s.as_bytes()),
        Value::Int(v) => match u32::try_from(*v) {
            Ok(v) => out.put_u32(v),
            Err(_) => out.put_i64(*v),
        },
        Value::Bool(b) => out.put_u8(u8::from(*b)),
        Value::Float(f) => out.put_u64(f.to_bits()),
        Value::StringArray(items) => items.iter().for_each(|s| out.put_slice(s.as_bytes())),
        Value::Union(inner) => encode_key_component(field, inner, out)?,
        Value::RecordArray(_) => {
            return Err(MalformedRecord::UnencodableKey {
                field: field.to_string(),
                kind: value.kind(),
            });
        }
    }

    Ok(())
}

/// Returns the key `encode_key_component` builds for the given values.
pub fn encode_key<'a>(
    components: impl IntoIterator<Item = (&'a str, &'a Value)>,
) -> Result<Bytes, MalformedRecord> {
    let mut key = BytesMut::new();
    for (field, value) in components {
        encode_key_component(field, value, &mut key)?;
    }
    Ok(key.freeze())
}

fn column_id(field: &str, value: &Value) -> Result<u64, MalformedRecord> {
    let invalid = |value: String| MalformedRecord::InvalidColumnId {
        field: field.to_string(),
        value,
    };

    match value {
        Value::Null => Err(MalformedRecord::MissingKeyField {
            field: field.to_string(),
        }),
        Value::Int(v) => u64::try_from(*v).map_err(|_| invalid(v.to_string())),
        Value::String(s) => s.trim().parse::<u64>().map_err(|_| invalid(s.clone())),
        Value::Float(f) if f.fract() == 0.0 && *f >= 0.0 && *f < u64::MAX as f64 => Ok(*f as u64),
        other => Err(invalid(format!("{other:?}"))),
    }
}
