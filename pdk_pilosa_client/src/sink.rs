use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashSet;
use pdk_ingestor_core::{
    Batch, Bit, FieldKind, Ref, error::SinkError, mutation::FieldTarget, sink::Sink,
};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::{
    client::{FieldOptions, IndexOptions, PilosaClient},
    error::{PilosaError, Result},
    proto::{ImportRequest, ImportValueRequest},
};

/// Columns per shard.
const SHARD_WIDTH_EXPONENT: u32 = 20;
const TIME_QUANTUM: &str = "YMDH";
const NANOS_PER_MILLI: i64 = 1_000_000;

/// Applies batches to a Pilosa index.
///
/// The index and its fields are created on first use.
pub struct PilosaSink {
    client: PilosaClient,
    index: String,
    column_keys: bool,
    index_created: OnceCell<()>,
    fields: DashSet<String>,
}

/// A request of the import endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum Import {
    Bits(ImportRequest),
    Values(ImportValueRequest),
}

impl PilosaSink {
    pub fn new(client: PilosaClient, index: impl Into<String>, column_keys: bool) -> Self {
        Self {
            client,
            index: index.into(),
            column_keys,
            index_created: OnceCell::new(),
            fields: DashSet::new(),
        }
    }

    /// Creates the index if it does not exist yet.
    pub async fn ensure_index(&self) -> Result<()> {
        self.index_created
            .get_or_try_init(|| async {
                let options = IndexOptions {
                    keys: self.column_keys,
                };
                self.client.create_index(&self.index, &options).await?;
                info!(index = %self.index, keys = self.column_keys, "index ready");
                Ok::<_, PilosaError>(())
            })
            .await?;
        Ok(())
    }

    async fn ensure_field(&self, field: &FieldTarget) -> Result<()> {
        if self.fields.contains(&field.name) {
            return Ok(());
        }

        self.ensure_index().await?;
        self.client
            .create_field(&self.index, &field.name, &field_options(field.kind))
            .await?;
        debug!(index = %self.index, %field, "field ready");
        self.fields.insert(field.name.clone());
        Ok(())
    }

    async fn apply_batch(&self, batch: &Batch) -> Result<()> {
        self.ensure_field(&batch.field).await?;
        for import in translate_batch(&self.index, batch) {
            match import {
                Import::Bits(request) => self.client.import(&request).await?,
                Import::Values(request) => self.client.import_values(&request).await?,
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Sink for PilosaSink {
    async fn apply(&self, batch: &Batch) -> Result<(), SinkError> {
        self.apply_batch(batch)
            .await
            .map_err(|err| SinkError::Backend {
                retryable: err.is_retryable(),
                source: Box::new(err),
            })
    }
}

/// Field options of a target field.
pub fn field_options(kind: FieldKind) -> FieldOptions {
    match kind {
        FieldKind::Set { keys } => FieldOptions::Set { keys },
        FieldKind::Time { keys } => FieldOptions::Time {
            keys,
            time_quantum: TIME_QUANTUM.to_string(),
        },
        FieldKind::Int { min, max } => FieldOptions::Int { min, max },
    }
}

/// Splits a batch into import requests, one per shard and kind.
///
/// Keyed columns are sent to shard 0 and placed by the server.
pub fn translate_batch(index: &str, batch: &Batch) -> Vec<Import> {
    let field = &batch.field.name;
    let timestamps = matches!(batch.field.kind, FieldKind::Time { .. });
    let mut bits: BTreeMap<u64, ImportRequest> = BTreeMap::new();
    let mut values: BTreeMap<u64, ImportValueRequest> = BTreeMap::new();

    for mutation in &batch.mutations {
        let shard = shard(&mutation.column);
        match &mutation.bit {
            Bit::Row(row) => {
                let request = bits.entry(shard).or_insert_with(|| ImportRequest {
                    index: index.to_string(),
                    field: field.clone(),
                    shard,
                    ..Default::default()
                });
                match row {
                    Ref::Id(id) => request.row_ids.push(*id),
                    Ref::Key(key) => request.row_keys.push(key.to_vec()),
                }
                match &mutation.column {
                    Ref::Id(id) => request.column_ids.push(*id),
                    Ref::Key(key) => request.column_keys.push(key.to_vec()),
                }
                if timestamps {
                    request
                        .timestamps
                        .push(mutation.timestamp.unwrap_or_default().saturating_mul(NANOS_PER_MILLI));
                }
            }
            Bit::Value(value) => {
                let request = values.entry(shard).or_insert_with(|| ImportValueRequest {
                    index: index.to_string(),
                    field: field.clone(),
                    shard,
                    ..Default::default()
                });
                match &mutation.column {
                    Ref::Id(id) => request.column_ids.push(*id),
                    Ref::Key(key) => request.column_keys.push(key.to_vec()),
                }
                request.values.push(*value);
            }
        }
    }

    bits.into_values()
        .map(Import::Bits)
        .chain(values.into_values().map(Import::Values))
        .collect()
}

fn shard(column: &Ref) -> u64 {
    match column {
        Ref::Id(id) => id >> SHARD_WIDTH_EXPONENT,
        Ref::Key(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use pdk_ingestor_core::Mutation;

    use super::*;

    fn mutation(field: &FieldTarget, bit: Bit, column: Ref, timestamp: Option<i64>) -> Mutation {
        Mutation {
            field: field.clone(),
            bit,
            column,
            timestamp,
        }
    }

    #[test]
    fn test_translate_bits_by_shard() {
        let field = FieldTarget::new("central_group", FieldKind::Set { keys: true });
        let mut batch = Batch::new(field.clone());
        batch.mutations = vec![
            mutation(&field, Bit::Row(Ref::from("cgr")), Ref::Id(1), None),
            mutation(&field, Bit::Row(Ref::from("cgr")), Ref::Id(3 << 20), None),
            mutation(&field, Bit::Row(Ref::from("other")), Ref::Id(2), None),
        ];

        let imports = translate_batch("users", &batch);
        assert_eq!(
            imports,
            vec![
                Import::Bits(ImportRequest {
                    index: "users".to_string(),
                    field: "central_group".to_string(),
                    shard: 0,
                    column_ids: vec![1, 2],
                    row_keys: vec![b"cgr".to_vec(), b"other".to_vec()],
                    ..Default::default()
                }),
                Import::Bits(ImportRequest {
                    index: "users".to_string(),
                    field: "central_group".to_string(),
                    shard: 3,
                    column_ids: vec![3 << 20],
                    row_keys: vec![b"cgr".to_vec()],
                    ..Default::default()
                }),
            ]
        );
    }

    #[test]
    fn test_translate_keyed_columns_and_timestamps() {
        let field = FieldTarget::new("desktop_frequency", FieldKind::Time { keys: false });
        let column = Ref::Key(Bytes::from_static(&[0x32, 0x31, 0, 0, 0, 0x9f]));
        let mut batch = Batch::new(field.clone());
        batch.mutations = vec![mutation(
            &field,
            Bit::Row(Ref::Id(7)),
            column,
            Some(1_500),
        )];

        let imports = translate_batch("users", &batch);
        let [Import::Bits(request)] = imports.as_slice() else {
            panic!("expected a single bits import, got {imports:?}");
        };
        assert_eq!(request.shard, 0);
        assert_eq!(request.row_ids, vec![7]);
        assert_eq!(request.column_keys, vec![vec![0x32, 0x31, 0, 0, 0, 0x9f]]);
        assert_eq!(request.timestamps, vec![1_500_000_000]);
    }

    #[test]
    fn test_translate_values() {
        let field = FieldTarget::new("age", FieldKind::Int { min: 0, max: 150 });
        let mut batch = Batch::new(field.clone());
        batch.mutations = vec![
            mutation(&field, Bit::Value(30), Ref::Id(1), None),
            mutation(&field, Bit::Value(41), Ref::Id(2), None),
        ];

        let imports = translate_batch("users", &batch);
        assert_eq!(
            imports,
            vec![Import::Values(ImportValueRequest {
                index: "users".to_string(),
                field: "age".to_string(),
                shard: 0,
                column_ids: vec![1, 2],
                values: vec![30, 41],
                column_keys: vec![],
            })]
        );
    }

    #[test]
    fn test_field_options() {
        assert_eq!(
            field_options(FieldKind::Time { keys: true }),
            FieldOptions::Time {
                keys: true,
                time_quantum: "YMDH".to_string(),
            }
        );
        assert_eq!(
            field_options(FieldKind::Int { min: 0, max: 9 }),
            FieldOptions::Int { min: 0, max: 9 }
        );
    }

    #[tokio::test]
    async fn test_unreachable_host_is_retryable() {
        let sink = PilosaSink::new(PilosaClient::new("127.0.0.1:1"), "users", false);
        let field = FieldTarget::new("f", FieldKind::Set { keys: false });
        let mut batch = Batch::new(field.clone());
        batch.mutations = vec![mutation(&field, Bit::Row(Ref::Id(1)), Ref::Id(1), None)];

        let err = sink.apply(&batch).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
