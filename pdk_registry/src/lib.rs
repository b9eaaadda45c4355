//! Schema registry clients.
//!
//! Schema-encoded frames carry the id of the schema they were written with.
//! The [`SchemaRegistry`] trait resolves ids to schema documents and registers
//! new ones. It is implemented by:
//! - [`HttpSchemaRegistry`]: talks to a Confluent-compatible registry over HTTP
//! - [`InMemorySchemaRegistry`]: keeps schemas in memory for tests and dry runs
//!
//! [`SchemaCache`] sits in front of a registry and keeps the parsed schema and
//! its field descriptor for every id seen so far.
use std::sync::Arc;

use apache_avro::Schema;
use async_trait::async_trait;
use pdk_schema::{SchemaDescriptor, SchemaDescriptorRef, descriptor_from_avro};
use snafu::ResultExt;

mod cache;
pub mod error;
mod http;
mod memory;

pub use self::{
    cache::{CacheOptions, SchemaCache},
    error::{RegistryError, Result},
    http::HttpSchemaRegistry,
    memory::InMemorySchemaRegistry,
};

use self::error::{DescriptorSnafu, InvalidSchemaSnafu};

/// Resolves schema ids to schema documents.
#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    /// Returns the schema document registered under `id`.
    async fn schema_by_id(&self, id: u32) -> Result<String>;

    /// Registers `schema` under `subject` and returns its id.
    ///
    /// Registering a document that is already registered returns the existing id.
    async fn register(&self, subject: &str, schema: &str) -> Result<u32>;
}

/// A schema resolved from the registry, ready for decoding.
#[derive(Debug)]
pub struct ResolvedSchema {
    pub id: u32,
    pub schema: Schema,
    pub descriptor: SchemaDescriptorRef,
}

pub type ResolvedSchemaRef = Arc<ResolvedSchema>;

impl ResolvedSchema {
    /// Parses a schema document and derives its field descriptor.
    pub fn parse(id: u32, document: &str) -> Result<Self> {
        let schema = Schema::parse_str(document).context(InvalidSchemaSnafu { id })?;
        let descriptor: SchemaDescriptor =
            descriptor_from_avro(&schema).context(DescriptorSnafu { id })?;

        Ok(Self {
            id,
            schema,
            descriptor: Arc::new(descriptor),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolved_schema_parse() {
        let resolved = ResolvedSchema::parse(
            7,
            r#"{"type": "record", "name": "rec", "fields": [{"name": "a", "type": "string"}]}"#,
        )
        .unwrap();
        assert_eq!(resolved.id, 7);
        assert!(resolved.descriptor.contains("a"));
    }

    #[test]
    fn test_resolved_schema_invalid_document() {
        let err = ResolvedSchema::parse(3, "{not json").unwrap_err();
        assert!(matches!(err, RegistryError::InvalidSchema { id: 3, .. }));

        let err = ResolvedSchema::parse(4, r#""string""#).unwrap_err();
        assert!(matches!(err, RegistryError::Descriptor { id: 4, .. }));
    }
}
