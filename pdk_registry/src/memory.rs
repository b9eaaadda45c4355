//! In-memory schema registry.
//!
//! Ids are assigned sequentially starting from 1. All data is lost when the
//! registry is dropped.
use std::sync::RwLock;

use async_trait::async_trait;

use crate::{
    SchemaRegistry,
    error::{RegistryError, Result},
};

#[derive(Debug, Default)]
struct RegistryStore {
    /// Schema documents, the id of a schema is its position plus one.
    schemas: Vec<String>,
    /// Subjects and the ids registered under them.
    subjects: Vec<(String, u32)>,
}

#[derive(Debug, Default)]
pub struct InMemorySchemaRegistry {
    store: RwLock<RegistryStore>,
}

impl InMemorySchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the ids registered under `subject`, oldest first.
    pub fn versions(&self, subject: &str) -> Vec<u32> {
        let Ok(store) = self.store.read() else {
            return Vec::new();
        };

        store
            .subjects
            .iter()
            .filter(|(s, _)| s == subject)
            .map(|(_, id)| *id)
            .collect()
    }

    fn poisoned() -> RegistryError {
        RegistryError::Internal {
            message: "registry lock poisoned".to_string(),
        }
    }
}

#[async_trait]
impl SchemaRegistry for InMemorySchemaRegistry {
    async fn schema_by_id(&self, id: u32) -> Result<String> {
        let store = self.store.read().map_err(|_| Self::poisoned())?;
        id.checked_sub(1)
            .and_then(|index| store.schemas.get(index as usize))
            .cloned()
            .ok_or(RegistryError::NotFound { id })
    }

    async fn register(&self, subject: &str, schema: &str) -> Result<u32> {
        let mut store = self.store.write().map_err(|_| Self::poisoned())?;

        let id = match store.schemas.iter().position(|s| s == schema) {
            Some(index) => index as u32 + 1,
            None => {
                store.schemas.push(schema.to_string());
                store.schemas.len() as u32
            }
        };

        if !store.subjects.iter().any(|(s, i)| s == subject && *i == id) {
            store.subjects.push((subject.to_string(), id));
        }

        Ok(id)
    }
}
