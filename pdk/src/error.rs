use snafu::Snafu;

/// CLI error types.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CliError {
    #[snafu(display("Failed to initialize observability"))]
    Observability {
        source: pdk_observability::ObservabilityError,
    },
    #[snafu(display("Invalid {name} argument: {message}"))]
    InvalidArgument { name: &'static str, message: String },
    #[snafu(display("Invalid configuration"))]
    Config {
        source: pdk_ingestor_core::error::ConfigError,
    },
    #[snafu(display("Failed to load schema descriptor"))]
    Schema { source: pdk_schema::SchemaError },
    #[snafu(display("Failed to set up the source"))]
    Source {
        source: pdk_ingestor_core::error::SourceError,
    },
    #[snafu(display("Failed to set up index {index}"))]
    Pilosa {
        index: String,
        source: pdk_pilosa_client::PilosaError,
    },
    #[snafu(display("Pipeline failed"))]
    Pipeline {
        source: pdk_ingestor_core::PipelineError,
    },
    #[snafu(display("{count} frames failed schema resolution"))]
    SchemaResolution { count: u64 },
    #[snafu(display("{count} batches could not be applied"))]
    DeadLetteredBatches { count: u64 },
}

pub type Result<T, E = CliError> = std::result::Result<T, E>;
