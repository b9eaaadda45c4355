use reqwest::StatusCode;
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PilosaError {
    #[snafu(display("Request to {url} failed"))]
    Request { url: String, source: reqwest::Error },
    #[snafu(display("Request to {url} failed with status {status}: {message}"))]
    Response {
        url: String,
        status: StatusCode,
        message: String,
    },
}

pub type Result<T, E = PilosaError> = std::result::Result<T, E>;

impl PilosaError {
    /// Returns `true` if the request may succeed when sent again.
    pub fn is_retryable(&self) -> bool {
        match self {
            PilosaError::Request { source, .. } => {
                source.is_connect() || source.is_timeout() || source.is_request()
            }
            PilosaError::Response { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
        }
    }
}
