//! Registry of model schemas keyed by store name.

use std::sync::Arc;

use dashmap::DashMap;

use crate::{error::Result, schema::ModelSchema, Error, StoreName};

/// Maps store names to their schemas.
///
/// Thread-safe and shared via `Arc` between local storage, the mutation
/// queue and the replicators.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    models: DashMap<StoreName, Arc<ModelSchema>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a schema under its store name.
    ///
    /// Registering the same schema twice is a no-op; a different schema
    /// under an existing store name is rejected.
    pub fn register(&self, schema: ModelSchema) -> Result<Arc<ModelSchema>> {
        let store = schema.store_name();
        if let Some(existing) = self.models.get(&store) {
            if **existing == schema {
                return Ok(Arc::clone(&existing));
            }
            return Err(Error::InvalidSchema(format!(
                "store {} is already registered with a different schema",
                store
            )));
        }

        let schema = Arc::new(schema);
        self.models.insert(store.clone(), Arc::clone(&schema));
        tracing::debug!(store = %store, "model registered");
        Ok(schema)
    }

    pub fn get(&self, store: &str) -> Option<Arc<ModelSchema>> {
        self.models.get(store).map(|entry| Arc::clone(entry.value()))
    }

    /// Schema for a store, or [`Error::StoreNotFound`].
    pub fn require(&self, store: &str) -> Result<Arc<ModelSchema>> {
        self.get(store)
            .ok_or_else(|| Error::StoreNotFound(store.to_string()))
    }

    pub fn primary_key_of(&self, store: &str) -> Result<String> {
        Ok(self.require(store)?.primary_key().to_string())
    }

    pub fn store_names(&self) -> Vec<StoreName> {
        let mut names: Vec<_> = self.models.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
