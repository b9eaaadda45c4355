#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use pdk_ingestor_core::{
    AvroDecoder, BatcherOptions, BusSource, IdAssignment, Mapper, MemoryConsumer, MemorySink,
    Pipeline, PipelineOptions, PipelineReport, Record, Ref, Result,
};
use pdk_registry::{InMemorySchemaRegistry, ResolvedSchemaRef, SchemaCache, SchemaRegistry};
use tokio_util::sync::CancellationToken;

pub const TOPIC: &str = "users";

pub const USER_SCHEMA: &str = r#"{
    "type": "record",
    "name": "user",
    "fields": [
        {"name": "abc", "type": "string"},
        {"name": "db", "type": "string"},
        {"name": "user_id", "type": "int"},
        {"name": "all_users", "type": "boolean"},
        {"name": "has_deleted_date", "type": "boolean"},
        {"name": "central_group", "type": "string"},
        {"name": "custom_audiences", "type": ["null", {"type": "array", "items": "string"}]},
        {"name": "desktop_frequency", "type": "int"},
        {"name": "ddd_cc_checking", "type": "float", "multiplier": 1, "offset": 0},
        {"name": "survey1234", "type": ["null", {"type": "enum", "name": "answer", "symbols": ["yes", "no"]}]},
        {"name": "days_since_last_logon", "type": "double"}
    ]
}"#;

/// Column key of [`user`] for the primary key `abc, db, user_id`.
pub const USER_KEY: [u8; 6] = [0x32, 0x31, 0x00, 0x00, 0x00, 0x9f];

pub struct AvroFixture {
    pub registry: Arc<InMemorySchemaRegistry>,
    pub schema: ResolvedSchemaRef,
    pub decoder: AvroDecoder,
}

pub async fn avro_fixture() -> AvroFixture {
    let registry = Arc::new(InMemorySchemaRegistry::new());
    let id = registry
        .register("users-value", USER_SCHEMA)
        .await
        .expect("register schema");
    let cache = SchemaCache::new(registry.clone());
    let schema = cache.get(id).await.expect("resolve schema");

    AvroFixture {
        registry,
        schema,
        decoder: AvroDecoder::new(cache),
    }
}

pub fn user(user_id: i64) -> Record {
    Record::new()
        .with("abc", "2")
        .with("db", "1")
        .with("user_id", user_id)
        .with("all_users", true)
        .with("has_deleted_date", false)
        .with("central_group", "cgr")
        .with("custom_audiences", vec!["a", "b"])
        .with("desktop_frequency", 7)
        .with("ddd_cc_checking", 5.4)
        .with("survey1234", "yes")
        .with("days_since_last_logon", 8.0)
}

pub fn primary_key() -> IdAssignment {
    IdAssignment::PrimaryKey(vec![
        "abc".to_string(),
        "db".to_string(),
        "user_id".to_string(),
    ])
}

pub fn user_key() -> Ref {
    Ref::key(USER_KEY.to_vec())
}

pub fn options(batch_size: usize) -> PipelineOptions {
    PipelineOptions {
        concurrency: 2,
        buffer_size: 16,
        batcher: BatcherOptions {
            batch_size,
            flush_interval: Duration::from_millis(10),
            ..Default::default()
        },
        commit_interval: Duration::from_millis(10),
        ..Default::default()
    }
}

impl AvroFixture {
    pub fn frame(&self, record: &Record) -> Vec<u8> {
        AvroDecoder::encode(&self.schema, record).expect("encode record")
    }

    /// Runs a pipeline over every message of `consumer`.
    pub async fn run(
        &self,
        consumer: Arc<MemoryConsumer>,
        mapper: Mapper,
        sink: Arc<MemorySink>,
        options: PipelineOptions,
    ) -> Result<PipelineReport> {
        let pipeline = Pipeline::new(
            BusSource::new(consumer),
            self.decoder.clone(),
            mapper,
            sink,
            options,
        );
        pipeline.run(CancellationToken::new()).await
    }
}
