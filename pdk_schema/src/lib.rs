//! Field descriptors for the ingestion pipeline.
//!
//! A [`SchemaDescriptor`] lists the fields the mapper knows about, together with
//! the rule used to turn each field's values into index mutations. Descriptors
//! are immutable once built and are shared behind an [`Arc`] by every mapper.
use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};

mod avro;
mod data_type;
pub mod error;
mod file;
pub mod taxi;

pub use self::{
    avro::{descriptor_from_avro, flattened_name},
    data_type::{IntRange, LogicalType, Scale, StringMode},
    error::{Result, SchemaError},
};

/// Mapping metadata for a single record field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub logical_type: LogicalType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<Scale>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<IntRange>,
    #[serde(default)]
    pub string_mode: StringMode,
}

pub type FieldSpecRef = Arc<FieldSpec>;

/// The set of fields a mapper may produce mutations for.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaDescriptor {
    fields: Vec<FieldSpecRef>,
    by_name: HashMap<String, usize>,
}

pub type SchemaDescriptorRef = Arc<SchemaDescriptor>;

fn default_nullable() -> bool {
    true
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, logical_type: LogicalType) -> Self {
        Self {
            name: name.into(),
            logical_type,
            nullable: true,
            scale: None,
            range: None,
            string_mode: StringMode::default(),
        }
    }

    pub fn bool(name: impl Into<String>) -> Self {
        Self::new(name, LogicalType::Bool)
    }

    pub fn int(name: impl Into<String>) -> Self {
        Self::new(name, LogicalType::Int)
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, LogicalType::Float)
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, LogicalType::String)
    }

    pub fn string_array(name: impl Into<String>) -> Self {
        Self::new(name, LogicalType::StringArray)
    }

    pub fn timestamp(name: impl Into<String>) -> Self {
        Self::new(name, LogicalType::Timestamp)
    }

    pub fn with_nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    pub fn with_scale(mut self, multiplier: f64, offset: f64) -> Self {
        self.scale = Some(Scale::new(multiplier, offset));
        self
    }

    pub fn with_range(mut self, min: i64, max: i64) -> Self {
        self.range = Some(IntRange::new(min, max));
        self
    }

    pub fn with_string_mode(mut self, string_mode: StringMode) -> Self {
        self.string_mode = string_mode;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` if integer values of this field are stored as BSI values.
    pub fn is_bsi(&self) -> bool {
        self.range.is_some()
    }

    /// Validates the field metadata.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| SchemaError::InvalidField {
            name: self.name.clone(),
            message: message.to_string(),
        };

        if self.name.is_empty() {
            return Err(invalid("field name is empty"));
        }

        if let Some(scale) = &self.scale {
            if self.logical_type != LogicalType::Float {
                return Err(invalid("scale is only valid for float fields"));
            }
            if !scale.multiplier.is_finite() || scale.multiplier == 0.0 {
                return Err(invalid("multiplier must be finite and non-zero"));
            }
            if !scale.offset.is_finite() {
                return Err(invalid("offset must be finite"));
            }
        }

        if let Some(range) = &self.range {
            if !self.logical_type.is_numeric() {
                return Err(invalid("range is only valid for int and float fields"));
            }
            if range.min > range.max {
                return Err(invalid("range min is greater than max"));
            }
        }

        Ok(())
    }
}

impl SchemaDescriptor {
    /// Creates a new descriptor, validating every field.
    pub fn new(fields: Vec<FieldSpec>) -> Result<Self> {
        let mut by_name = HashMap::with_capacity(fields.len());
        let mut specs = Vec::with_capacity(fields.len());

        for (index, field) in fields.into_iter().enumerate() {
            field.validate()?;
            if by_name.insert(field.name.clone(), index).is_some() {
                return Err(SchemaError::DuplicateField { name: field.name });
            }
            specs.push(Arc::new(field));
        }

        Ok(Self {
            fields: specs,
            by_name,
        })
    }

    pub fn empty() -> Self {
        Self {
            fields: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    /// Fields in declaration order.
    pub fn fields(&self) -> &[FieldSpecRef] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpecRef> {
        self.by_name.get(name).map(|index| &self.fields[*index])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name())
    }
}
