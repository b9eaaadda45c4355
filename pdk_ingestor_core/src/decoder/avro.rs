//! Decoding of schema-registry framed Avro messages.
//!
//! A frame is a magic byte `0x00`, the big-endian `u32` id of the writer
//! schema, then the Avro binary encoding of a single record.
use apache_avro::{Schema, from_avro_datum, to_avro_datum, types::Value as AvroValue};
use bytes::{BufMut, BytesMut};
use pdk_registry::{ResolvedSchema, ResolvedSchemaRef, SchemaCache};
use pdk_schema::flattened_name;
use snafu::ResultExt;
use tracing::debug;

use crate::{
    error::{DecodeError, SchemaSnafu},
    record::{Record, Value},
};

pub const MAGIC_BYTE: u8 = 0;
pub const HEADER_LEN: usize = 5;

#[derive(Clone)]
pub struct AvroDecoder {
    cache: SchemaCache,
}

impl AvroDecoder {
    pub fn new(cache: SchemaCache) -> Self {
        Self { cache }
    }

    /// Decodes a frame, resolving its schema through the cache.
    pub async fn decode(&self, frame: &[u8]) -> Result<(Record, ResolvedSchemaRef), DecodeError> {
        let id = schema_id(frame)?;
        let schema = self.cache.get(id).await.context(SchemaSnafu { id })?;
        let record = decode_with(&schema, frame)?;
        Ok((record, schema))
    }

    /// Encodes a record with the given schema, framing included.
    pub fn encode(schema: &ResolvedSchema, record: &Record) -> Result<Vec<u8>, DecodeError> {
        let value = record_value(&schema.schema, "", record)?;
        let body = to_avro_datum(&schema.schema, value).map_err(|err| DecodeError::Encode {
            message: err.to_string(),
        })?;

        let mut frame = BytesMut::with_capacity(HEADER_LEN + body.len());
        frame.put_u8(MAGIC_BYTE);
        frame.put_u32(schema.id);
        frame.put_slice(&body);
        Ok(frame.to_vec())
    }
}

/// Reads the schema id from the frame header.
pub fn schema_id(frame: &[u8]) -> Result<u32, DecodeError> {
    match frame {
        [MAGIC_BYTE, a, b, c, d, ..] => Ok(u32::from_be_bytes([*a, *b, *c, *d])),
        [] => Err(DecodeError::Malformed {
            message: "empty frame".to_string(),
        }),
        [MAGIC_BYTE, ..] => Err(DecodeError::Malformed {
            message: format!("frame of {} bytes has no schema id", frame.len()),
        }),
        [magic, ..] => Err(DecodeError::Malformed {
            message: format!("unknown magic byte {magic:#04x}"),
        }),
    }
}

/// Decodes the body of a frame whose schema is already known.
pub fn decode_with(schema: &ResolvedSchema, frame: &[u8]) -> Result<Record, DecodeError> {
    let mut body = frame.get(HEADER_LEN..).unwrap_or_default();
    let value = from_avro_datum(&schema.schema, &mut body, None).map_err(|err| {
        DecodeError::Malformed {
            message: err.to_string(),
        }
    })?;

    match value {
        AvroValue::Record(fields) => {
            let mut record = Record::new();
            flatten("", fields, &mut record);
            Ok(record)
        }
        other => Err(DecodeError::Malformed {
            message: format!("expected a record, found {other:?}"),
        }),
    }
}

/// Adds the fields of an Avro record, flattening nested records.
fn flatten(prefix: &str, fields: Vec<(String, AvroValue)>, out: &mut Record) {
    for (name, value) in fields {
        let name = flattened_name(prefix, &name);
        match unwrap_union(value) {
            AvroValue::Record(nested) => flatten(&name, nested, out),
            value => match convert(value) {
                Some(value) => {
                    out.insert(name, value);
                }
                None => debug!(field = %name, "skipping Avro value without a mapping"),
            },
        }
    }
}

fn unwrap_union(value: AvroValue) -> AvroValue {
    let mut value = value;
    while let AvroValue::Union(_, inner) = value {
        value = *inner;
    }
    value
}

fn convert(value: AvroValue) -> Option<Value> {
    let value = match unwrap_union(value) {
        AvroValue::Null => Value::Null,
        AvroValue::Boolean(b) => Value::Bool(b),
        AvroValue::Int(v) => Value::Int(v.into()),
        AvroValue::Long(v) => Value::Int(v),
        AvroValue::Float(v) => Value::Float(v.into()),
        AvroValue::Double(v) => Value::Float(v),
        AvroValue::String(s) | AvroValue::Enum(_, s) => Value::String(s),
        AvroValue::Uuid(uuid) => Value::String(uuid.to_string()),
        AvroValue::TimestampMillis(ms) | AvroValue::LocalTimestampMillis(ms) => Value::Int(ms),
        AvroValue::TimestampMicros(us) | AvroValue::LocalTimestampMicros(us) => {
            Value::Int(us / 1_000)
        }
        AvroValue::Array(items) => convert_array(items)?,
        _ => return None,
    };

    Some(value)
}

fn convert_array(items: Vec<AvroValue>) -> Option<Value> {
    let items = items.into_iter().map(unwrap_union).collect::<Vec<_>>();

    if items.iter().all(|v| matches!(v, AvroValue::Record(_))) && !items.is_empty() {
        let records = items
            .into_iter()
            .filter_map(|item| match item {
                AvroValue::Record(fields) => {
                    let mut record = Record::new();
                    flatten("", fields, &mut record);
                    Some(record)
                }
                _ => None,
            })
            .collect();
        return Some(Value::RecordArray(records));
    }

    items
        .into_iter()
        .map(|item| match item {
            AvroValue::String(s) | AvroValue::Enum(_, s) => Some(s),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()
        .map(Value::StringArray)
}

/// Builds the Avro value of a record schema from a flat record.
fn record_value(schema: &Schema, prefix: &str, record: &Record) -> Result<AvroValue, DecodeError> {
    let Schema::Record(record_schema) = schema else {
        return Err(DecodeError::Encode {
            message: "top-level schema must be a record".to_string(),
        });
    };

    let fields = record_schema
        .fields
        .iter()
        .map(|field| {
            let name = flattened_name(prefix, &field.name);
            field_value(&field.schema, &name, record).map(|value| (field.name.clone(), value))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(AvroValue::Record(fields))
}

fn field_value(schema: &Schema, name: &str, record: &Record) -> Result<AvroValue, DecodeError> {
    let mismatch = |value: &Value| DecodeError::Encode {
        message: format!("field {name} cannot encode a {} value as {schema:?}", value.kind()),
    };

    if let Schema::Record(_) = schema {
        return record_value(schema, name, record);
    }

    let value = record.value(name);
    let encoded = match (schema, value) {
        (Schema::Union(union), _) => return union_value(union.variants(), name, record),
        (Schema::Null, Value::Null) => AvroValue::Null,
        (Schema::Boolean, Value::Bool(b)) => AvroValue::Boolean(*b),
        (Schema::Int, Value::Int(v)) => {
            AvroValue::Int(i32::try_from(*v).map_err(|_| mismatch(value))?)
        }
        (Schema::Long, Value::Int(v)) => AvroValue::Long(*v),
        (Schema::Float, Value::Float(v)) => AvroValue::Float(*v as f32),
        (Schema::Float, Value::Int(v)) => AvroValue::Float(*v as f32),
        (Schema::Double, Value::Float(v)) => AvroValue::Double(*v),
        (Schema::Double, Value::Int(v)) => AvroValue::Double(*v as f64),
        (Schema::String, Value::String(s)) => AvroValue::String(s.clone()),
        (Schema::Enum(e), Value::String(s)) => {
            let index = e
                .symbols
                .iter()
                .position(|symbol| symbol == s)
                .ok_or_else(|| mismatch(value))?;
            AvroValue::Enum(index as u32, s.clone())
        }
        (Schema::TimestampMillis, Value::Int(ms)) => AvroValue::TimestampMillis(*ms),
        (Schema::TimestampMicros, Value::Int(ms)) => AvroValue::TimestampMicros(ms * 1_000),
        (Schema::Array(array), Value::StringArray(items)) => AvroValue::Array(
            items
                .iter()
                .map(|item| match array.items.as_ref() {
                    Schema::Enum(e) => e
                        .symbols
                        .iter()
                        .position(|symbol| symbol == item)
                        .map(|index| AvroValue::Enum(index as u32, item.clone()))
                        .ok_or_else(|| mismatch(value)),
                    _ => Ok(AvroValue::String(item.clone())),
                })
                .collect::<Result<Vec<_>, _>>()?,
        ),
        (Schema::Array(array), Value::RecordArray(records)) => AvroValue::Array(
            records
                .iter()
                .map(|nested| record_value(&array.items, "", nested))
                .collect::<Result<Vec<_>, _>>()?,
        ),
        _ => return Err(mismatch(value)),
    };

    Ok(encoded)
}

/// Selects the first union branch able to hold the field's value.
fn union_value(variants: &[Schema], name: &str, record: &Record) -> Result<AvroValue, DecodeError> {
    let is_null = record.value(name).is_null();

    for (index, variant) in variants.iter().enumerate() {
        if is_null != matches!(variant, Schema::Null) {
            continue;
        }
        if let Ok(value) = field_value(variant, name, record) {
            return Ok(AvroValue::Union(index as u32, Box::new(value)));
        }
    }

    Err(DecodeError::Encode {
        message: format!("no branch of field {name} accepts its value"),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pdk_registry::{InMemorySchemaRegistry, SchemaRegistry};

    use super::*;

    const SCHEMA: &str = r#"{
        "type": "record", "name": "user",
        "fields": [
            {"name": "abc", "type": "string"},
            {"name": "user_id", "type": "long"},
            {"name": "ratio", "type": ["null", "double"]},
            {"name": "survey", "type": ["null", {"type": "enum", "name": "answer", "symbols": ["yes", "no"]}]},
            {"name": "tags", "type": {"type": "array", "items": "string"}},
            {"name": "seen", "type": {"type": "long", "logicalType": "timestamp-millis"}},
            {"name": "geo", "type": {"type": "record", "name": "geo", "fields": [{"name": "city", "type": "string"}]}}
        ]
    }"#;

    async fn decoder() -> (AvroDecoder, ResolvedSchemaRef) {
        let registry = Arc::new(InMemorySchemaRegistry::new());
        registry.register("user-value", SCHEMA).await.unwrap();
        let cache = SchemaCache::new(registry);
        let schema = cache.get(1).await.unwrap();
        (AvroDecoder::new(cache), schema)
    }

    fn record() -> Record {
        Record::new()
            .with("abc", "2")
            .with("user_id", 159)
            .with("ratio", 5.4)
            .with("survey", "yes")
            .with("tags", vec!["a", "b"])
            .with("seen", 1_000_i64)
            .with("geo_city", "lyon")
    }

    #[tokio::test]
    async fn test_decode_round_trip() {
        let (decoder, schema) = decoder().await;
        let frame = AvroDecoder::encode(&schema, &record()).unwrap();
        assert_eq!(&frame[..HEADER_LEN], &[0, 0, 0, 0, 1]);

        let (decoded, resolved) = decoder.decode(&frame).await.unwrap();
        assert_eq!(decoded, record());
        assert_eq!(resolved.id, 1);
        assert!(resolved.descriptor.contains("geo_city"));
    }

    #[tokio::test]
    async fn test_null_branch() {
        let (decoder, schema) = decoder().await;
        let mut record = record();
        record.insert("ratio", Value::Null);
        record.insert("survey", Value::Null);

        let frame = AvroDecoder::encode(&schema, &record).unwrap();
        let (decoded, _) = decoder.decode(&frame).await.unwrap();
        assert_eq!(decoded.value("ratio"), &Value::Null);
        assert_eq!(decoded.value("survey"), &Value::Null);
    }

    #[tokio::test]
    async fn test_malformed_frames() {
        let (decoder, _) = decoder().await;

        for frame in [&b""[..], &[1, 0, 0, 0, 1][..], &[0, 0, 0][..], &[0, 0, 0, 0, 1, 0xff][..]] {
            let err = decoder.decode(frame).await.unwrap_err();
            assert!(matches!(err, DecodeError::Malformed { .. }), "{frame:?}: {err:?}");
        }
    }

    #[tokio::test]
    async fn test_unknown_schema() {
        let (decoder, _) = decoder().await;
        let err = decoder.decode(&[0, 0, 0, 0, 42, 0]).await.unwrap_err();
        assert!(matches!(err, DecodeError::Schema { id: 42, .. }));
    }
}
