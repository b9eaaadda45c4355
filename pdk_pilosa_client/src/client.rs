use prost::Message;
use reqwest::{
    StatusCode,
    header::{ACCEPT, CONTENT_TYPE},
};
use serde::Serialize;
use serde_json::json;
use snafu::ResultExt;
use tracing::debug;

use crate::{
    error::{PilosaError, RequestSnafu, Result},
    proto::{ImportRequest, ImportValueRequest},
};

const CONTENT_TYPE_PROTOBUF: &str = "application/x-protobuf";

#[derive(Debug, Clone)]
pub struct PilosaClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexOptions {
    /// Columns are referenced by key.
    pub keys: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FieldOptions {
    Set {
        keys: bool,
    },
    Time {
        keys: bool,
        #[serde(rename = "timeQuantum")]
        time_quantum: String,
    },
    Int {
        min: i64,
        max: i64,
    },
}

impl PilosaClient {
    /// Creates a client for `host`, either `host:port` or a URL.
    pub fn new(host: &str) -> Self {
        Self::with_client(reqwest::Client::new(), host)
    }

    pub fn with_client(client: reqwest::Client, host: &str) -> Self {
        let host = host.trim_end_matches('/');
        let base_url = if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("http://{host}")
        };
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Creates an index. Succeeds if the index already exists.
    pub async fn create_index(&self, index: &str, options: &IndexOptions) -> Result<()> {
        let url = format!("{}/index/{index}", self.base_url);
        self.create(url, json!({ "options": options })).await
    }

    /// Creates a field. Succeeds if the field already exists.
    pub async fn create_field(&self, index: &str, field: &str, options: &FieldOptions) -> Result<()> {
        let url = format!("{}/index/{index}/field/{field}", self.base_url);
        self.create(url, json!({ "options": options })).await
    }

    pub async fn import(&self, request: &ImportRequest) -> Result<()> {
        let url = self.import_url(&request.index, &request.field);
        self.post_protobuf(url, request.encode_to_vec()).await
    }

    pub async fn import_values(&self, request: &ImportValueRequest) -> Result<()> {
        let url = self.import_url(&request.index, &request.field);
        self.post_protobuf(url, request.encode_to_vec()).await
    }

    fn import_url(&self, index: &str, field: &str) -> String {
        format!("{}/index/{index}/field/{field}/import", self.base_url)
    }

    async fn create(&self, url: String, body: serde_json::Value) -> Result<()> {
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context(RequestSnafu { url: url.clone() })?;

        if response.status() == StatusCode::CONFLICT {
            debug!(%url, "already exists");
            return Ok(());
        }

        check_status(url, response).await
    }

    async fn post_protobuf(&self, url: String, body: Vec<u8>) -> Result<()> {
        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, CONTENT_TYPE_PROTOBUF)
            .header(ACCEPT, CONTENT_TYPE_PROTOBUF)
            .body(body)
            .send()
            .await
            .context(RequestSnafu { url: url.clone() })?;

        check_status(url, response).await
    }
}

async fn check_status(url: String, response: reqwest::Response) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }

    let message = response
        .text()
        .await
        .context(RequestSnafu { url: url.clone() })?;

    Err(PilosaError::Response {
        url,
        status,
        message: message.trim().to_string(),
    })
}
