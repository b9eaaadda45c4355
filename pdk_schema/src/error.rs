use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SchemaError {
    #[snafu(display("Duplicate field {name}"))]
    DuplicateField { name: String },
    #[snafu(display("Invalid field {name}: {message}"))]
    InvalidField { name: String, message: String },
    #[snafu(display("Conversion error: {message}"))]
    Conversion { message: String },
    #[snafu(display("Failed to parse Avro schema"))]
    Avro { source: apache_avro::Error },
    #[snafu(display("Failed to parse schema descriptor"))]
    Json { source: serde_json::Error },
    #[snafu(display("Failed to read schema descriptor {path}"))]
    Io {
        path: String,
        source: std::io::Error,
    },
}

pub type Result<T, E = SchemaError> = std::result::Result<T, E>;
