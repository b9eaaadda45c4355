use std::collections::BTreeMap;

use apache_avro::{Schema, schema::RecordField};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{
    FieldSpec, IntRange, LogicalType, Scale, SchemaDescriptor, StringMode,
    error::{Result, SchemaError},
};

const ATTR_MULTIPLIER: &str = "multiplier";
const ATTR_OFFSET: &str = "offset";
const ATTR_MIN: &str = "min";
const ATTR_MAX: &str = "max";
const ATTR_ID: &str = "id";

/// Builds a descriptor from an Avro record schema.
///
/// Nested records are flattened, their fields are named `parent_child`.
/// Fields whose type has no mapping are skipped.
pub fn descriptor_from_avro(schema: &Schema) -> Result<SchemaDescriptor> {
    let Schema::Record(record) = schema else {
        return Err(SchemaError::Conversion {
            message: "top-level Avro schema must be a record".to_string(),
        });
    };

    let mut fields = Vec::with_capacity(record.fields.len());
    collect_fields("", &record.fields, &mut fields)?;
    SchemaDescriptor::new(fields)
}

/// Returns the flattened field name used for a nested record field.
pub fn flattened_name(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}_{name}")
    }
}

fn collect_fields(prefix: &str, fields: &[RecordField], out: &mut Vec<FieldSpec>) -> Result<()> {
    for field in fields {
        let name = flattened_name(prefix, &field.name);
        let (schema, nullable) = strip_null(&field.schema);

        if let Some(Schema::Record(nested)) = schema {
            collect_fields(&name, &nested.fields, out)?;
            continue;
        }

        let Some(logical_type) = schema.and_then(logical_type) else {
            debug!(field = %name, "skipping Avro field without a mapping");
            continue;
        };

        let spec = FieldSpec::new(name, logical_type).with_nullable(nullable);
        out.push(apply_attributes(spec, &field.custom_attributes)?);
    }

    Ok(())
}

/// Removes the `null` branch of a union.
///
/// Returns the effective schema, if any, and whether the field is nullable.
/// Unions with several non-null branches resolve to their first branch when
/// every branch shares the same logical type.
fn strip_null(schema: &Schema) -> (Option<&Schema>, bool) {
    let Schema::Union(union) = schema else {
        return (Some(schema), matches!(schema, Schema::Null));
    };

    let variants = union.variants();
    let nullable = variants.iter().any(|v| matches!(v, Schema::Null));
    let mut non_null = variants.iter().filter(|v| !matches!(v, Schema::Null));

    let Some(first) = non_null.next() else {
        return (None, true);
    };

    let first_type = logical_type(first);
    for other in non_null {
        if first_type.is_none() || logical_type(other) != first_type {
            return (None, nullable);
        }
    }

    (Some(first), nullable)
}

fn logical_type(schema: &Schema) -> Option<LogicalType> {
    match schema {
        Schema::Boolean => Some(LogicalType::Bool),
        Schema::Int | Schema::Long => Some(LogicalType::Int),
        Schema::Float | Schema::Double => Some(LogicalType::Float),
        Schema::String | Schema::Enum(_) | Schema::Uuid => Some(LogicalType::String),
        Schema::TimestampMillis
        | Schema::TimestampMicros
        | Schema::LocalTimestampMillis
        | Schema::LocalTimestampMicros => Some(LogicalType::Timestamp),
        Schema::Array(array) => match strip_null(&array.items).0 {
            Some(Schema::String | Schema::Enum(_)) => Some(LogicalType::StringArray),
            _ => None,
        },
        _ => None,
    }
}

fn apply_attributes(
    mut spec: FieldSpec,
    attributes: &BTreeMap<String, JsonValue>,
) -> Result<FieldSpec> {
    let number = |key: &str| -> Result<Option<f64>> {
        match attributes.get(key) {
            None => Ok(None),
            Some(value) => value.as_f64().map(Some).ok_or_else(|| SchemaError::Conversion {
                message: format!("attribute {key} of field {} must be a number", spec.name),
            }),
        }
    };

    let multiplier = number(ATTR_MULTIPLIER)?;
    let offset = number(ATTR_OFFSET)?;
    let min = number(ATTR_MIN)?;
    let max = number(ATTR_MAX)?;

    if spec.logical_type == LogicalType::Float {
        let default = Scale::default();
        spec.scale = Some(Scale::new(
            multiplier.unwrap_or(default.multiplier),
            offset.unwrap_or(default.offset),
        ));
    } else if multiplier.is_some() || offset.is_some() {
        return Err(SchemaError::Conversion {
            message: format!("field {} is not a float and cannot be scaled", spec.name),
        });
    }

    match (min, max) {
        (None, None) => {}
        (Some(min), Some(max)) => spec.range = Some(IntRange::new(min as i64, max as i64)),
        _ => {
            return Err(SchemaError::Conversion {
                message: format!("field {} must declare both min and max", spec.name),
            });
        }
    }

    if attributes.get(ATTR_ID).and_then(JsonValue::as_bool) == Some(true) {
        spec.string_mode = StringMode::Id;
    }

    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(schema: &str) -> Schema {
        Schema::parse_str(schema).expect("valid avro schema")
    }

    #[test]
    fn test_avro_primitive_fields() {
        let schema = parse(
            r#"{
                "type": "record", "name": "rec",
                "fields": [
                    {"name": "flag", "type": "boolean"},
                    {"name": "count", "type": "long"},
                    {"name": "ratio", "type": ["null", "double"]},
                    {"name": "label", "type": "string"},
                    {"name": "tags", "type": {"type": "array", "items": "string"}},
                    {"name": "seen", "type": {"type": "long", "logicalType": "timestamp-millis"}},
                    {"name": "blob", "type": "bytes"}
                ]
            }"#,
        );

        let descriptor = descriptor_from_avro(&schema).unwrap();
        assert_eq!(
            descriptor.field_names().collect::<Vec<_>>(),
            vec!["flag", "count", "ratio", "label", "tags", "seen"]
        );

        let ratio = descriptor.field("ratio").unwrap();
        assert_eq!(ratio.logical_type, LogicalType::Float);
        assert!(ratio.nullable);
        assert_eq!(ratio.scale, Some(Scale::default()));

        assert!(!descriptor.field("flag").unwrap().nullable);
        assert_eq!(
            descriptor.field("tags").unwrap().logical_type,
            LogicalType::StringArray
        );
        assert_eq!(
            descriptor.field("seen").unwrap().logical_type,
            LogicalType::Timestamp
        );
    }

    #[test]
    fn test_avro_custom_attributes() {
        let schema = parse(
            r#"{
                "type": "record", "name": "rec",
                "fields": [
                    {"name": "price", "type": "float", "multiplier": 100, "offset": 1.5, "min": 0, "max": 1000000},
                    {"name": "zone", "type": "string", "id": true},
                    {"name": "age", "type": "int", "min": 0, "max": 150}
                ]
            }"#,
        );

        let descriptor = descriptor_from_avro(&schema).unwrap();
        let price = descriptor.field("price").unwrap();
        assert_eq!(price.scale, Some(Scale::new(100.0, 1.5)));
        assert_eq!(price.range, Some(IntRange::new(0, 1_000_000)));
        assert_eq!(
            descriptor.field("zone").unwrap().string_mode,
            StringMode::Id
        );
        assert_eq!(
            descriptor.field("age").unwrap().range,
            Some(IntRange::new(0, 150))
        );
    }

    #[test]
    fn test_avro_nested_records_are_flattened() {
        let schema = parse(
            r#"{
                "type": "record", "name": "rec",
                "fields": [
                    {"name": "geo", "type": ["null", {
                        "type": "record", "name": "geo_rec",
                        "fields": [{"name": "city", "type": "string"}, {"name": "zip", "type": "int"}]
                    }]}
                ]
            }"#,
        );

        let descriptor = descriptor_from_avro(&schema).unwrap();
        assert_eq!(
            descriptor.field_names().collect::<Vec<_>>(),
            vec!["geo_city", "geo_zip"]
        );
    }

    #[test]
    fn test_avro_enum_is_string() {
        let schema = parse(
            r#"{
                "type": "record", "name": "rec",
                "fields": [
                    {"name": "survey", "type": ["null", {"type": "enum", "name": "answer", "symbols": ["yes", "no"]}]}
                ]
            }"#,
        );

        let descriptor = descriptor_from_avro(&schema).unwrap();
        assert_eq!(
            descriptor.field("survey").unwrap().logical_type,
            LogicalType::String
        );
    }

    #[test]
    fn test_avro_rejects_non_record() {
        let err = descriptor_from_avro(&Schema::String).unwrap_err();
        assert!(matches!(err, SchemaError::Conversion { .. }));
    }

    #[test]
    fn test_avro_rejects_partial_range() {
        let schema = parse(
            r#"{"type": "record", "name": "rec", "fields": [{"name": "n", "type": "int", "min": 0}]}"#,
        );
        assert!(descriptor_from_avro(&schema).is_err());
    }
}
