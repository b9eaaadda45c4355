use std::path::Path;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::{
    FieldSpec, SchemaDescriptor,
    error::{IoSnafu, JsonSnafu, Result},
};

/// On-disk representation of a descriptor.
#[derive(Debug, Serialize, Deserialize)]
struct DescriptorFile {
    fields: Vec<FieldSpec>,
}

impl SchemaDescriptor {
    /// Parses a JSON descriptor of the form `{"fields": [...]}`.
    pub fn from_json_str(content: &str) -> Result<Self> {
        let file: DescriptorFile = serde_json::from_str(content).context(JsonSnafu {})?;
        SchemaDescriptor::new(file.fields)
    }

    /// Reads a JSON descriptor from disk.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).context(IoSnafu {
            path: path.display().to_string(),
        })?;
        Self::from_json_str(&content)
    }

    pub fn to_json_string(&self) -> Result<String> {
        let file = DescriptorFile {
            fields: self.fields().iter().map(|f| f.as_ref().clone()).collect(),
        };
        serde_json::to_string_pretty(&file).context(JsonSnafu {})
    }
}

#[cfg(test)]
mod tests {
    use crate::{IntRange, LogicalType, Scale, SchemaDescriptor, SchemaError, StringMode};

    #[test]
    fn test_parse_descriptor_file() {
        let descriptor = SchemaDescriptor::from_json_str(
            r#"{
                "fields": [
                    {"name": "fare", "type": "float", "scale": {"multiplier": 100}, "range": {"min": 0, "max": 100000}},
                    {"name": "vendor", "type": "string"},
                    {"name": "zone", "type": "string", "string_mode": "id", "nullable": false},
                    {"name": "tags", "type": "string_array"}
                ]
            }"#,
        )
        .unwrap();

        let fare = descriptor.field("fare").unwrap();
        assert_eq!(fare.logical_type, LogicalType::Float);
        assert_eq!(fare.scale, Some(Scale::new(100.0, 0.0)));
        assert_eq!(fare.range, Some(IntRange::new(0, 100_000)));
        assert!(fare.nullable);

        let zone = descriptor.field("zone").unwrap();
        assert_eq!(zone.string_mode, StringMode::Id);
        assert!(!zone.nullable);

        assert_eq!(
            descriptor.field("tags").unwrap().logical_type,
            LogicalType::StringArray
        );
    }

    #[test]
    fn test_descriptor_json_round_trip() {
        let descriptor = crate::taxi::descriptor();
        let json = descriptor.to_json_string().unwrap();
        let parsed = SchemaDescriptor::from_json_str(&json).unwrap();
        assert_eq!(descriptor, parsed);
    }

    #[test]
    fn test_invalid_descriptor_file() {
        let err = SchemaDescriptor::from_json_str(r#"{"fields": [{"name": "x"}]}"#).unwrap_err();
        assert!(matches!(err, SchemaError::Json { .. }));

        let err = SchemaDescriptor::from_json_str(
            r#"{"fields": [{"name": "x", "type": "int", "range": {"min": 5, "max": 1}}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, SchemaError::InvalidField { .. }));
    }
}
