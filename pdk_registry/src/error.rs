use std::sync::Arc;

use reqwest::StatusCode;
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RegistryError {
    #[snafu(display("Schema {id} not found"))]
    NotFound { id: u32 },
    #[snafu(display("Registry request error"))]
    Request { source: reqwest::Error },
    #[snafu(display("Registry response error: status={status}, message={message}"))]
    Response { status: StatusCode, message: String },
    #[snafu(display("Schema {id} is not a valid Avro schema"))]
    InvalidSchema { id: u32, source: apache_avro::Error },
    #[snafu(display("Schema {id} cannot be mapped"))]
    Descriptor {
        id: u32,
        source: pdk_schema::SchemaError,
    },
    #[snafu(display("Internal error: {message}"))]
    Internal { message: String },
    /// A failed lookup shared by concurrent callers.
    #[snafu(display("{source}"))]
    Shared { source: Arc<RegistryError> },
}

pub type Result<T, E = RegistryError> = std::result::Result<T, E>;

impl RegistryError {
    /// Returns `true` if the request may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            RegistryError::Request { source } => source.is_connect() || source.is_timeout(),
            RegistryError::Response { status, .. } => status.is_server_error(),
            _ => false,
        }
    }

    /// Returns `true` if no schema is registered under the requested id.
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), RegistryError::NotFound { .. })
    }

    /// Returns the underlying error of a shared failure.
    pub fn root(&self) -> &RegistryError {
        match self {
            RegistryError::Shared { source } => source.root(),
            other => other,
        }
    }
}
