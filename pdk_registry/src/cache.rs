use std::{sync::Arc, time::Duration};

use tracing::debug;

use crate::{
    ResolvedSchema, ResolvedSchemaRef, SchemaRegistry,
    error::{RegistryError, Result},
};

/// Cache from schema id to resolved schema.
///
/// Registered schemas never change, so entries do not expire by default.
#[derive(Clone)]
pub struct SchemaCache {
    registry: Arc<dyn SchemaRegistry>,
    inner: moka::future::Cache<u32, ResolvedSchemaRef>,
}

pub struct CacheOptions {
    max_capacity: usize,
    time_to_idle: Option<Duration>,
}

impl SchemaCache {
    pub fn new(registry: Arc<dyn SchemaRegistry>) -> Self {
        Self::with_options(registry, CacheOptions::default())
    }

    pub fn with_options(registry: Arc<dyn SchemaRegistry>, options: CacheOptions) -> Self {
        let mut builder = moka::future::Cache::builder().max_capacity(options.max_capacity as u64);
        if let Some(time_to_idle) = options.time_to_idle {
            builder = builder.time_to_idle(time_to_idle);
        }

        Self {
            registry,
            inner: builder.build(),
        }
    }

    /// Returns the schema registered under `id`, fetching it on first use.
    ///
    /// Concurrent lookups of the same id share a single registry request.
    pub async fn get(&self, id: u32) -> Result<ResolvedSchemaRef> {
        let registry = self.registry.clone();
        let schema = self
            .inner
            .try_get_with(id, async move {
                debug!(id, "resolving schema");
                let document = registry.schema_by_id(id).await?;
                ResolvedSchema::parse(id, &document).map(Arc::new)
            })
            .await
            .map_err(|err| {
                Arc::try_unwrap(err).unwrap_or_else(|source| RegistryError::Shared { source })
            })?;
        Ok(schema)
    }

    pub fn registry(&self) -> &Arc<dyn SchemaRegistry> {
        &self.registry
    }
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_capacity(mut self, max_capacity: usize) -> Self {
        self.max_capacity = max_capacity;
        self
    }

    pub fn with_time_to_idle(mut self, time_to_idle: Duration) -> Self {
        self.time_to_idle = Some(time_to_idle);
        self
    }
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            max_capacity: 10_000,
            time_to_idle: None,
        }
    }
}
