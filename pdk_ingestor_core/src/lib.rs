//! Ingestion pipeline.
//!
//! Frames are read from a [`Source`], decoded into [`Record`]s, mapped into
//! [`Mutation`]s and batched per field before being applied to a [`Sink`].
pub mod batcher;
pub mod decoder;
pub mod error;
pub mod id;
pub mod mapper;
pub mod metrics;
pub mod mutation;
pub mod pipeline;
pub mod record;
pub mod retry;
pub mod sink;
pub mod source;

pub use self::{
    batcher::BatcherOptions,
    decoder::{AvroDecoder, Decoder, DelimitedDecoder, DelimitedOptions, Header},
    error::{PipelineError, Result},
    id::IdAssignment,
    mapper::Mapper,
    metrics::{PipelineMetrics, PipelineReport},
    mutation::{Batch, Bit, FieldKind, FieldTarget, Mutation, Ref},
    pipeline::{Pipeline, PipelineOptions},
    record::{Record, Value},
    retry::RetryPolicy,
    sink::{MemorySink, Sink},
    source::{BusSource, FetchOptions, MemoryConsumer, MessageConsumer, Source, UrlSource},
};
