//! HTTP client for a Confluent-compatible schema registry.
use async_trait::async_trait;
use reqwest::{StatusCode, header::CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tracing::debug;

use crate::{
    SchemaRegistry,
    error::{RegistryError, RequestSnafu, Result},
};

const CONTENT_TYPE_REGISTRY: &str = "application/vnd.schemaregistry.v1+json";

#[derive(Debug, Clone)]
pub struct HttpSchemaRegistry {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SchemaBody {
    schema: String,
}

#[derive(Debug, Deserialize)]
struct IdBody {
    id: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

impl HttpSchemaRegistry {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl SchemaRegistry for HttpSchemaRegistry {
    async fn schema_by_id(&self, id: u32) -> Result<String> {
        let url = format!("{}/schemas/ids/{id}", self.base_url);
        debug!(%url, "fetching schema");

        let response = self.client.get(&url).send().await.context(RequestSnafu {})?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(RegistryError::NotFound { id });
        }

        let body: SchemaBody = check_status(response)
            .await?
            .json()
            .await
            .context(RequestSnafu {})?;
        Ok(body.schema)
    }

    async fn register(&self, subject: &str, schema: &str) -> Result<u32> {
        let url = format!("{}/subjects/{subject}/versions", self.base_url);
        let body = SchemaBody {
            schema: schema.to_string(),
        };

        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, CONTENT_TYPE_REGISTRY)
            .json(&body)
            .send()
            .await
            .context(RequestSnafu {})?;

        let body: IdBody = check_status(response)
            .await?
            .json()
            .await
            .context(RequestSnafu {})?;
        debug!(subject, id = body.id, "registered schema");
        Ok(body.id)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.context(RequestSnafu {})?;
    let message = serde_json::from_str::<ErrorBody>(&text)
        .map(|body| body.message)
        .unwrap_or(text);

    Err(RegistryError::Response { status, message })
}
