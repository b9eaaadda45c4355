//! Options shared by the ingestion commands.
use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Args;
use pdk_ingestor_core::{
    BatcherOptions, IdAssignment, Mapper, MemorySink, PipelineOptions, PipelineReport,
    RetryPolicy, Sink,
};
use pdk_pilosa_client::{PilosaClient, PilosaSink};
use snafu::ResultExt;
use tracing::{info, warn};

use crate::error::{
    ConfigSnafu, DeadLetteredBatchesSnafu, PilosaSnafu, Result, SchemaResolutionSnafu,
};

/// Pipeline tuning.
#[derive(Debug, Args)]
pub struct PipelineArgs {
    /// Decode and map workers
    #[arg(long, default_value_t = 8)]
    pub concurrency: usize,
    /// Frames buffered ahead of the workers
    #[arg(long, default_value_t = 1_000_000)]
    pub buffer_size: usize,
    /// Mutations per field batch
    #[arg(long, default_value_t = 1000)]
    pub batch_size: usize,
    /// Stop after this many records, 0 is unlimited
    #[arg(long, default_value_t = 0)]
    pub max_msgs: u64,
    /// Flush partial batches after this many milliseconds
    #[arg(long, default_value_t = 1000)]
    pub flush_interval_ms: u64,
    /// Retries of a failed batch before it is dead-lettered
    #[arg(long, default_value_t = 5)]
    pub max_retries: u32,
    /// Batches applied to the index in parallel
    #[arg(long, default_value_t = 4)]
    pub sink_concurrency: usize,
    /// Time given to the pipeline to drain once interrupted
    #[arg(long, default_value_t = 30_000)]
    pub shutdown_timeout_ms: u64,
    /// Time given to a pending batch once interrupted
    #[arg(long, default_value_t = 5000)]
    pub shutdown_flush_timeout_ms: u64,
    /// Interval between offset commits
    #[arg(long, default_value_t = 1000)]
    pub commit_interval_ms: u64,
    /// Append batches that cannot be applied to this file
    #[arg(long)]
    pub dead_letter_file: Option<PathBuf>,
}

/// Target index and record mapping.
#[derive(Debug, Args)]
pub struct IndexArgs {
    /// Pilosa host
    #[arg(long, default_value = "localhost:10101")]
    pub pilosa_host: String,
    /// Index to import into
    #[arg(long, default_value = "pdk")]
    pub index: String,
    /// Fields whose values form the column key
    #[arg(long, value_delimiter = ',')]
    pub primary_key_fields: Vec<String>,
    /// Field holding the column id
    #[arg(long)]
    pub id_field: Option<String>,
    /// Pack boolean fields into a single field with this name
    #[arg(long)]
    pub pack_bools: Option<String>,
    /// Keep mutations in memory instead of importing them
    #[arg(long)]
    pub dry_run: bool,
}

impl PipelineArgs {
    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries)
    }

    pub fn options(&self) -> PipelineOptions {
        PipelineOptions {
            concurrency: self.concurrency,
            buffer_size: self.buffer_size,
            max_msgs: self.max_msgs,
            batcher: BatcherOptions {
                batch_size: self.batch_size,
                flush_interval: Duration::from_millis(self.flush_interval_ms),
                retry: self.retry(),
                sink_concurrency: self.sink_concurrency,
                shutdown_flush_timeout: Duration::from_millis(self.shutdown_flush_timeout_ms),
            },
            commit_interval: Duration::from_millis(self.commit_interval_ms),
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
            dead_letter_file: self.dead_letter_file.clone(),
        }
    }
}

impl IndexArgs {
    /// Builds the mapper, falling back to `default_key` when no column option is given.
    pub fn mapper_or(&self, default_key: Option<Vec<String>>) -> Result<Mapper> {
        let id_field = self.id_field.as_deref();
        let assignment = match default_key {
            Some(fields) if self.primary_key_fields.is_empty() && id_field.is_none() => {
                IdAssignment::from_options(&fields, None)
            }
            _ => IdAssignment::from_options(&self.primary_key_fields, id_field),
        }
        .context(ConfigSnafu {})?;

        let mapper = Mapper::new(assignment);
        Ok(match &self.pack_bools {
            Some(field) => mapper.with_packed_bools(field),
            None => mapper,
        })
    }

    pub fn mapper(&self) -> Result<Mapper> {
        self.mapper_or(None)
    }

    /// Connects to the index, creating it if needed.
    pub async fn sink(&self, mapper: &Mapper) -> Result<Arc<dyn Sink>> {
        if self.dry_run {
            info!("dry run, mutations are counted and discarded");
            return Ok(Arc::new(MemorySink::discarding()));
        }

        let column_keys = mapper.id_assignment().column_keys();
        let client = PilosaClient::new(&self.pilosa_host);
        let sink = PilosaSink::new(client, &self.index, column_keys);
        sink.ensure_index().await.context(PilosaSnafu {
            index: self.index.clone(),
        })?;

        info!(host = %self.pilosa_host, index = %self.index, column_keys, "importing into pilosa");
        Ok(Arc::new(sink))
    }
}

/// Logs the run report and fails if any frame could not be decoded or any
/// batch could not be applied.
pub fn finish(report: PipelineReport) -> Result<()> {
    info!(
        frames = report.frames,
        records = report.records,
        mutations = report.mutations,
        batches_applied = report.batches_applied,
        "run complete"
    );

    if report.malformed_records > 0 || report.mapping_errors > 0 {
        warn!(
            malformed_records = report.malformed_records,
            mapping_errors = report.mapping_errors,
            "some records were skipped"
        );
    }

    if report.schema_errors > 0 {
        return SchemaResolutionSnafu {
            count: report.schema_errors,
        }
        .fail();
    }

    if report.batches_dead_lettered > 0 {
        return DeadLetteredBatchesSnafu {
            count: report.batches_dead_lettered,
        }
        .fail();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CliError;

    #[test]
    fn test_finish_clean_run() {
        let report = PipelineReport {
            frames: 2,
            records: 10,
            malformed_records: 1,
            mutations: 40,
            batches_applied: 4,
            ..Default::default()
        };
        assert!(finish(report).is_ok());
    }

    #[test]
    fn test_finish_fails_on_dead_lettered_batches() {
        let report = PipelineReport {
            batches_applied: 3,
            batches_dead_lettered: 2,
            ..Default::default()
        };
        let err = finish(report).unwrap_err();
        assert!(matches!(err, CliError::DeadLetteredBatches { count: 2 }));
    }

    #[test]
    fn test_finish_fails_on_schema_errors() {
        let report = PipelineReport {
            schema_errors: 1,
            ..Default::default()
        };
        let err = finish(report).unwrap_err();
        assert!(matches!(err, CliError::SchemaResolution { count: 1 }));
    }
}
