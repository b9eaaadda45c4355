use std::path::PathBuf;

use pdk_registry::RegistryError;
use pdk_schema::LogicalType;
use reqwest::StatusCode;
use snafu::Snafu;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Invalid or conflicting options.
///
/// Reported before any worker starts.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    #[snafu(display("Invalid {name} option: {message}"))]
    InvalidOption { name: &'static str, message: String },
    #[snafu(display("Conflicting options: {message}"))]
    ConflictingOptions { message: String },
    #[snafu(display("Invalid schema"))]
    InvalidSchema { source: pdk_schema::SchemaError },
}

/// Errors raised while fetching frames.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SourceError {
    #[snafu(display("Failed to request {locator}"))]
    Http {
        locator: String,
        source: reqwest::Error,
    },
    #[snafu(display("Request to {locator} failed with status {status}"))]
    Status { locator: String, status: StatusCode },
    #[snafu(display("Failed to read {locator}"))]
    Io {
        locator: String,
        source: std::io::Error,
    },
    #[snafu(display("Failed to fetch {locator} after {attempts} attempts"))]
    Exhausted {
        locator: String,
        attempts: u32,
        #[snafu(source(from(SourceError, Box::new)))]
        source: Box<SourceError>,
    },
    #[snafu(display("Consumer error: {message}"))]
    Consumer { message: String },
    #[snafu(display("Failed to commit offsets: {message}"))]
    Commit { message: String },
}

/// Errors raised while decoding a frame.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum DecodeError {
    /// The frame or row cannot be decoded. Counted and skipped.
    #[snafu(display("Malformed record: {message}"))]
    Malformed { message: String },
    /// The schema of the frame cannot be resolved. Fails the whole frame.
    #[snafu(display("Failed to resolve schema {id}"))]
    Schema { id: u32, source: RegistryError },
    #[snafu(display("Failed to encode record: {message}"))]
    Encode { message: String },
}

/// A record that cannot be assigned a column. The record is dropped.
#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub))]
pub enum MalformedRecord {
    #[snafu(display("Key field {field} is missing or null"))]
    MissingKeyField { field: String },
    #[snafu(display("Key field {field} cannot be encoded from a {kind} value"))]
    UnencodableKey { field: String, kind: &'static str },
    #[snafu(display("Id field {field} holds {value}, expected a non-negative integer"))]
    InvalidColumnId { field: String, value: String },
}

/// A field that cannot be mapped. The field is dropped, the rest of the record is mapped.
#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub))]
pub enum MappingError {
    #[snafu(display("Field {field} expects {expected} values, found {found}"))]
    TypeMismatch {
        field: String,
        expected: LogicalType,
        found: &'static str,
    },
    #[snafu(display("Field {field} has negative row id {value}"))]
    NegativeRowId { field: String, value: i64 },
    #[snafu(display("Field {field} value {value} is outside [{min}, {max}]"))]
    OutOfRange {
        field: String,
        value: i64,
        min: i64,
        max: i64,
    },
    #[snafu(display("Field {field} holds {value}, expected a row id"))]
    InvalidRowId { field: String, value: String },
    #[snafu(display("Float field {field} has no scale"))]
    Unscaled { field: String },
    #[snafu(display("Field {field} value {value} overflows once scaled"))]
    ScaleOverflow { field: String, value: f64 },
    #[snafu(display("Field {field} holds invalid timestamp {value}"))]
    InvalidTimestamp { field: String, value: String },
}

/// Errors returned by a sink.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SinkError {
    #[snafu(display("Sink temporarily unavailable: {message}"))]
    Unavailable { message: String },
    #[snafu(display("Sink rejected batch: {message}"))]
    Rejected { message: String },
    #[snafu(display("Sink backend error"))]
    Backend { retryable: bool, source: BoxError },
}

/// Errors that end a pipeline run.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    #[snafu(display("Invalid configuration"))]
    Config { source: ConfigError },
    #[snafu(display("Source failed"))]
    Source { source: SourceError },
    #[snafu(display("Failed to open dead letter file {}", path.display()))]
    DeadLetterFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Pipeline did not drain within {timeout_ms} ms"))]
    ShutdownTimeout { timeout_ms: u128 },
    #[snafu(display("Pipeline task failed"))]
    Task { source: tokio::task::JoinError },
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

impl SourceError {
    /// Returns `true` if fetching the locator again may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SourceError::Http { source, .. } => {
                source.is_connect() || source.is_timeout() || source.is_request()
            }
            SourceError::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            SourceError::Io { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            SourceError::Consumer { .. } => true,
            SourceError::Exhausted { .. } | SourceError::Commit { .. } => false,
        }
    }
}

impl SinkError {
    /// Returns `true` if the batch may be applied when retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SinkError::Unavailable { .. } => true,
            SinkError::Rejected { .. } => false,
            SinkError::Backend { retryable, .. } => *retryable,
        }
    }
}

impl From<ConfigError> for PipelineError {
    fn from(source: ConfigError) -> Self {
        PipelineError::Config { source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_retryable() {
        let status = |status| SourceError::Status {
            locator: "http://host/a.csv".to_string(),
            status,
        };
        assert!(status(StatusCode::SERVICE_UNAVAILABLE).is_retryable());
        assert!(status(StatusCode::TOO_MANY_REQUESTS).is_retryable());
        assert!(!status(StatusCode::NOT_FOUND).is_retryable());
        assert!(!status(StatusCode::FORBIDDEN).is_retryable());
    }

    #[test]
    fn test_sink_retryable() {
        assert!(
            SinkError::Unavailable {
                message: "busy".to_string()
            }
            .is_retryable()
        );
        assert!(
            !SinkError::Rejected {
                message: "bad field".to_string()
            }
            .is_retryable()
        );
    }
}
