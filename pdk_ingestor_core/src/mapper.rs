//! Record to mutation mapping.
use bytes::Bytes;
use pdk_schema::{FieldSpec, LogicalType, SchemaDescriptor, StringMode};
use time::{
    OffsetDateTime, PrimitiveDateTime, format_description::well_known::Rfc3339,
    macros::format_description,
};

use crate::{
    error::{MalformedRecord, MappingError},
    id::IdAssignment,
    mutation::{Bit, FieldKind, FieldTarget, Mutation, Ref},
    record::{Record, Value},
};

const PACKED_EXISTS_SUFFIX: &str = "-exists";

/// Boolean fields folded into two shared fields.
///
/// True values set the row named after the field in `field`; every non-null
/// value sets the same row in `exists_field`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedBools {
    pub field: String,
    pub exists_field: String,
}

/// Turns records into mutations according to a field descriptor.
#[derive(Debug, Clone)]
pub struct Mapper {
    id: IdAssignment,
    packed_bools: Option<PackedBools>,
}

/// The mutations of a single record.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedRecord {
    pub column: Ref,
    pub mutations: Vec<Mutation>,
    /// Fields that were dropped.
    pub errors: Vec<MappingError>,
}

impl PackedBools {
    pub fn new(field: impl Into<String>) -> Self {
        let field = field.into();
        let exists_field = format!("{field}{PACKED_EXISTS_SUFFIX}");
        Self {
            field,
            exists_field,
        }
    }
}

impl Mapper {
    pub fn new(id: IdAssignment) -> Self {
        Self {
            id,
            packed_bools: None,
        }
    }

    /// Packs boolean fields into `field`. An empty name disables packing.
    pub fn with_packed_bools(mut self, field: impl Into<String>) -> Self {
        let field = field.into();
        self.packed_bools = (!field.is_empty()).then(|| PackedBools::new(field));
        self
    }

    pub fn id_assignment(&self) -> &IdAssignment {
        &self.id
    }

    pub fn packed_bools(&self) -> Option<&PackedBools> {
        self.packed_bools.as_ref()
    }

    /// Maps a record.
    ///
    /// Fails only if the record has no column. Fields that cannot be mapped are
    /// reported in [`MappedRecord::errors`].
    pub fn map(
        &self,
        descriptor: &SchemaDescriptor,
        record: &Record,
    ) -> Result<MappedRecord, MalformedRecord> {
        let column = self.id.column(record)?;
        let mut errors = Vec::new();

        let has_time = descriptor
            .fields()
            .iter()
            .any(|f| f.logical_type == LogicalType::Timestamp);
        let timestamp = match record_timestamp(descriptor, record) {
            Ok(ts) => ts,
            Err(err) => {
                errors.push(err);
                None
            }
        };

        let mut context = RecordContext {
            column,
            timestamp,
            has_time,
            mutations: Vec::new(),
        };

        for field in descriptor.fields() {
            if self.id.id_field() == Some(field.name()) {
                continue;
            }

            let value = record.value(field.name());
            if value.is_null() {
                continue;
            }

            if let Err(err) = self.map_field(&mut context, field, value) {
                errors.push(err);
            }
        }

        Ok(MappedRecord {
            column: context.column,
            mutations: context.mutations,
            errors,
        })
    }

    fn map_field(
        &self,
        ctx: &mut RecordContext,
        field: &FieldSpec,
        value: &Value,
    ) -> Result<(), MappingError> {
        match (field.logical_type, value) {
            (LogicalType::Timestamp, _) => Ok(()),
            (LogicalType::Bool, Value::Bool(b)) => {
                self.map_bool(ctx, field, *b);
                Ok(())
            }
            (LogicalType::Int, Value::Int(v)) => map_int(ctx, field, *v),
            (LogicalType::Float, Value::Float(v)) => map_float(ctx, field, *v),
            (LogicalType::Float, Value::Int(v)) => map_float(ctx, field, *v as f64),
            (LogicalType::String | LogicalType::StringArray, Value::String(s)) => {
                map_string(ctx, field, s)
            }
            (LogicalType::StringArray, Value::StringArray(items)) => {
                // Map every element even if one of them fails.
                let mut result = Ok(());
                for item in items {
                    if let Err(err) = map_string(ctx, field, item) {
                        result = Err(err);
                    }
                }
                result
            }
            (expected, value) => Err(MappingError::TypeMismatch {
                field: field.name.clone(),
                expected,
                found: value.kind(),
            }),
        }
    }

    fn map_bool(&self, ctx: &mut RecordContext, field: &FieldSpec, value: bool) {
        match &self.packed_bools {
            None => {
                let kind = ctx.set_kind(false);
                ctx.push(&field.name, kind, Bit::Row(Ref::Id(u64::from(value))));
            }
            Some(packed) => {
                let kind = ctx.set_kind(true);
                let row = || Bit::Row(Ref::key(Bytes::copy_from_slice(field.name.as_bytes())));
                if value {
                    ctx.push(&packed.field, kind, row());
                }
                ctx.push(&packed.exists_field, kind, row());
            }
        }
    }
}

struct RecordContext {
    column: Ref,
    timestamp: Option<i64>,
    has_time: bool,
    mutations: Vec<Mutation>,
}

impl RecordContext {
    fn set_kind(&self, keys: bool) -> FieldKind {
        if self.has_time {
            FieldKind::Time { keys }
        } else {
            FieldKind::Set { keys }
        }
    }

    fn push(&mut self, field: &str, kind: FieldKind, bit: Bit) {
        self.mutations.push(Mutation {
            field: FieldTarget::new(field, kind),
            bit,
            column: self.column.clone(),
            timestamp: self.timestamp,
        });
    }
}

fn map_int(ctx: &mut RecordContext, field: &FieldSpec, value: i64) -> Result<(), MappingError> {
    match field.range {
        Some(range) => {
            if !range.contains(value) {
                return Err(MappingError::OutOfRange {
                    field: field.name.clone(),
                    value,
                    min: range.min,
                    max: range.max,
                });
            }
            let kind = FieldKind::Int {
                min: range.min,
                max: range.max,
            };
            ctx.push(&field.name, kind, Bit::Value(value));
        }
        None => {
            let row = u64::try_from(value).map_err(|_| MappingError::NegativeRowId {
                field: field.name.clone(),
                value,
            })?;
            let kind = ctx.set_kind(false);
            ctx.push(&field.name, kind, Bit::Row(Ref::Id(row)));
        }
    }

    Ok(())
}

fn map_float(ctx: &mut RecordContext, field: &FieldSpec, value: f64) -> Result<(), MappingError> {
    let Some(scale) = field.scale else {
        return Err(MappingError::Unscaled {
            field: field.name.clone(),
        });
    };

    let scaled = scale.apply(value).ok_or_else(|| MappingError::ScaleOverflow {
        field: field.name.clone(),
        value,
    })?;

    map_int(ctx, field, scaled)
}

fn map_string(ctx: &mut RecordContext, field: &FieldSpec, value: &str) -> Result<(), MappingError> {
    match field.string_mode {
        StringMode::Keyed => {
            let kind = ctx.set_kind(true);
            let row = Ref::key(Bytes::copy_from_slice(value.as_bytes()));
            ctx.push(&field.name, kind, Bit::Row(row));
        }
        StringMode::Id => {
            let row = value
                .trim()
                .parse::<u64>()
                .map_err(|_| MappingError::InvalidRowId {
                    field: field.name.clone(),
                    value: value.to_string(),
                })?;
            let kind = ctx.set_kind(false);
            ctx.push(&field.name, kind, Bit::Row(Ref::Id(row)));
        }
    }

    Ok(())
}

/// Returns the first non-null timestamp of the record, in epoch milliseconds.
fn record_timestamp(
    descriptor: &SchemaDescriptor,
    record: &Record,
) -> Result<Option<i64>, MappingError> {
    let field = descriptor
        .fields()
        .iter()
        .filter(|f| f.logical_type == LogicalType::Timestamp)
        .find(|f| !record.value(f.name()).is_null());

    let Some(field) = field else {
        return Ok(None);
    };

    let invalid = |value: String| MappingError::InvalidTimestamp {
        field: field.name.clone(),
        value,
    };

    match record.value(field.name()) {
        Value::Int(ms) => Ok(Some(*ms)),
        Value::String(s) => parse_timestamp(s).map(Some).ok_or_else(|| invalid(s.clone())),
        other => Err(invalid(format!("{other:?}"))),
    }
}

/// Parses epoch milliseconds, RFC 3339, or `YYYY-MM-DD HH:MM:SS` in UTC.
pub fn parse_timestamp(value: &str) -> Option<i64> {
    let value = value.trim();
    if let Ok(ms) = value.parse::<i64>() {
        return Some(ms);
    }

    let datetime = OffsetDateTime::parse(value, &Rfc3339).ok().or_else(|| {
        PrimitiveDateTime::parse(
            value,
            format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
        )
        .ok()
        .map(PrimitiveDateTime::assume_utc)
    })?;

    i64::try_from(datetime.unix_timestamp_nanos() / 1_000_000).ok()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use pdk_schema::FieldSpec;

    use super::*;

    fn descriptor() -> SchemaDescriptor {
        SchemaDescriptor::new(vec![
            FieldSpec::string("name"),
            FieldSpec::int("age"),
            FieldSpec::int("score").with_range(0, 100),
            FieldSpec::float("ratio").with_scale(10.0, 0.0),
            FieldSpec::float("raw"),
            FieldSpec::bool("active"),
            FieldSpec::string_array("tags"),
            FieldSpec::string("zone").with_string_mode(StringMode::Id),
            FieldSpec::int("id"),
        ])
        .unwrap()
    }

    fn rows(mapped: &MappedRecord) -> BTreeSet<(String, Bit)> {
        mapped
            .mutations
            .iter()
            .map(|m| (m.field.name.clone(), m.bit.clone()))
            .collect()
    }

    fn key(s: &str) -> Bit {
        Bit::Row(Ref::from(s))
    }

    #[test]
    fn test_map_all_rules() {
        let record = Record::new()
            .with("id", 10)
            .with("name", "bob")
            .with("age", 42)
            .with("score", 77)
            .with("ratio", 0.26)
            .with("active", true)
            .with("tags", vec!["a", "b"])
            .with("zone", "12")
            .with("unknown", "ignored");

        let mapper = Mapper::new(IdAssignment::IdField("id".into()));
        let mapped = mapper.map(&descriptor(), &record).unwrap();

        assert_eq!(mapped.column, Ref::Id(10));
        assert!(mapped.errors.is_empty());
        assert!(mapped.mutations.iter().all(|m| m.column == Ref::Id(10)));
        assert_eq!(
            rows(&mapped),
            BTreeSet::from([
                ("name".to_string(), key("bob")),
                ("age".to_string(), Bit::Row(Ref::Id(42))),
                ("score".to_string(), Bit::Value(77)),
                ("ratio".to_string(), Bit::Row(Ref::Id(3))),
                ("active".to_string(), Bit::Row(Ref::Id(1))),
                ("tags".to_string(), key("a")),
                ("tags".to_string(), key("b")),
                ("zone".to_string(), Bit::Row(Ref::Id(12))),
            ])
        );
    }

    #[test]
    fn test_field_errors_do_not_drop_record() {
        let record = Record::new()
            .with("id", 1)
            .with("name", "ok")
            .with("age", -3)
            .with("score", 101)
            .with("raw", 1.5)
            .with("zone", "north")
            .with("active", "yes");

        let mapper = Mapper::new(IdAssignment::IdField("id".into()));
        let mapped = mapper.map(&descriptor(), &record).unwrap();

        assert_eq!(rows(&mapped), BTreeSet::from([("name".to_string(), key("ok"))]));
        assert_eq!(mapped.errors.len(), 5);
        assert!(mapped.errors.contains(&MappingError::NegativeRowId {
            field: "age".to_string(),
            value: -3
        }));
        assert!(mapped.errors.contains(&MappingError::Unscaled {
            field: "raw".to_string()
        }));
        assert!(mapped.errors.iter().any(|e| matches!(
            e,
            MappingError::OutOfRange { field, .. } if field == "score"
        )));
        assert!(mapped.errors.iter().any(|e| matches!(
            e,
            MappingError::InvalidRowId { field, .. } if field == "zone"
        )));
        assert!(mapped.errors.iter().any(|e| matches!(
            e,
            MappingError::TypeMismatch { field, .. } if field == "active"
        )));
    }

    #[test]
    fn test_packed_bools() {
        let descriptor = SchemaDescriptor::new(vec![
            FieldSpec::bool("yes"),
            FieldSpec::bool("no"),
            FieldSpec::bool("unset"),
        ])
        .unwrap();
        let record = Record::new().with("id", 5).with("yes", true).with("no", false);

        let mapper = Mapper::new(IdAssignment::IdField("id".into())).with_packed_bools("bools");
        let mapped = mapper.map(&descriptor, &record).unwrap();

        assert_eq!(
            rows(&mapped),
            BTreeSet::from([
                ("bools".to_string(), key("yes")),
                ("bools-exists".to_string(), key("yes")),
                ("bools-exists".to_string(), key("no")),
            ])
        );
        assert!(
            mapped
                .mutations
                .iter()
                .all(|m| m.field.kind == FieldKind::Set { keys: true })
        );
    }

    #[test]
    fn test_timestamp_is_attached() {
        let descriptor = SchemaDescriptor::new(vec![
            FieldSpec::timestamp("at"),
            FieldSpec::string("name"),
        ])
        .unwrap();
        let record = Record::new()
            .with("id", 1)
            .with("at", "2013-01-01 15:11:48")
            .with("name", "x");

        let mapper = Mapper::new(IdAssignment::IdField("id".into()));
        let mapped = mapper.map(&descriptor, &record).unwrap();

        assert_eq!(mapped.mutations.len(), 1);
        let mutation = &mapped.mutations[0];
        assert_eq!(mutation.timestamp, Some(1_357_053_108_000));
        assert_eq!(mutation.field.kind, FieldKind::Time { keys: true });
    }

    #[test]
    fn test_primary_key_fields_are_mapped() {
        let descriptor = SchemaDescriptor::new(vec![FieldSpec::string("a")]).unwrap();
        let record = Record::new().with("a", "k");

        let mapper = Mapper::new(IdAssignment::PrimaryKey(vec!["a".into()]));
        let mapped = mapper.map(&descriptor, &record).unwrap();
        assert_eq!(mapped.column, Ref::from("k"));
        assert_eq!(rows(&mapped), BTreeSet::from([("a".to_string(), key("k"))]));
    }

    #[test]
    fn test_parse_timestamp() {
        assert_eq!(parse_timestamp("1000"), Some(1000));
        assert_eq!(parse_timestamp("1970-01-01T00:00:01Z"), Some(1000));
        assert_eq!(parse_timestamp("1970-01-01 00:00:02"), Some(2000));
        assert_eq!(parse_timestamp("yesterday"), None);
    }
}
