//! Plugin hooks around collection operations.
//!
//! Every hook has a pass-through default, so a plugin only implements the
//! ones it cares about. Before-hooks may rewrite their input or abort the
//! operation with an error. After-hook failures are logged and ignored unless
//! the store was built with `strict_plugins(true)`.
//!
//! # Example
//!
//! ```ignore
//! struct Stamp;
//!
//! #[async_trait::async_trait]
//! impl Plugin for Stamp {
//!     fn name(&self) -> &str {
//!         "stamp"
//!     }
//!
//!     async fn before_insert(&self, _collection: &str, mut document: Document) -> DocumentStoreResult<Document> {
//!         document.insert("createdBy", "stamp");
//!         Ok(document)
//!     }
//! }
//! ```

use async_trait::async_trait;
use serde_json::Value;
use std::{fmt, sync::Arc};

use crate::{
    collection::Collection,
    document::Document,
    error::DocumentStoreResult,
    store::DocumentStore,
};

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    async fn on_init(&self, _store: &DocumentStore) -> DocumentStoreResult<()> {
        Ok(())
    }

    async fn on_collection_create(&self, _collection: &Collection) -> DocumentStoreResult<()> {
        Ok(())
    }

    async fn before_insert(&self, _collection: &str, document: Document) -> DocumentStoreResult<Document> {
        Ok(document)
    }

    async fn after_insert(&self, _collection: &str, _document: &Document) -> DocumentStoreResult<()> {
        Ok(())
    }

    async fn before_update(
        &self,
        _collection: &str,
        query: Value,
        update: Value,
    ) -> DocumentStoreResult<(Value, Value)> {
        Ok((query, update))
    }

    /// Receives the new version of every rewritten document.
    async fn after_update(
        &self,
        _collection: &str,
        _query: &Value,
        _update: &Value,
        _documents: &[Document],
    ) -> DocumentStoreResult<()> {
        Ok(())
    }

    async fn before_delete(&self, _collection: &str, query: Value) -> DocumentStoreResult<Value> {
        Ok(query)
    }

    /// Receives the documents as they were before removal.
    async fn after_delete(&self, _collection: &str, _query: &Value, _documents: &[Document]) -> DocumentStoreResult<()> {
        Ok(())
    }

    async fn before_query(&self, _collection: &str, query: Value) -> DocumentStoreResult<Value> {
        Ok(query)
    }

    async fn after_query(
        &self,
        _collection: &str,
        _query: &Value,
        results: Vec<Document>,
    ) -> DocumentStoreResult<Vec<Document>> {
        Ok(results)
    }
}

/// Runs the registered plugins in registration order.
#[derive(Clone, Default)]
pub struct PluginHost {
    plugins: Vec<Arc<dyn Plugin>>,
    strict: bool,
}

impl fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginHost")
            .field("plugins", &self.plugins.iter().map(|p| p.name()).collect::<Vec<_>>())
            .field("strict", &self.strict)
            .finish()
    }
}

impl PluginHost {
    pub fn new(plugins: Vec<Arc<dyn Plugin>>, strict: bool) -> Self {
        Self { plugins, strict }
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|plugin| plugin.name()).collect()
    }

    /// Decides the fate of an after-hook error.
    fn settle(&self, plugin: &dyn Plugin, hook: &str, result: DocumentStoreResult<()>) -> DocumentStoreResult<()> {
        match result {
            Err(err) if !self.strict => {
                log::warn!("plugin {} failed in {}: {}", plugin.name(), hook, err);
                Ok(())
            }
            other => other,
        }
    }

    pub async fn on_init(&self, store: &DocumentStore) -> DocumentStoreResult<()> {
        for plugin in &self.plugins {
            plugin.on_init(store).await?;
        }
        Ok(())
    }

    pub async fn on_collection_create(&self, collection: &Collection) -> DocumentStoreResult<()> {
        for plugin in &self.plugins {
            let result = plugin.on_collection_create(collection).await;
            self.settle(plugin.as_ref(), "on_collection_create", result)?;
        }
        Ok(())
    }

    pub async fn before_insert(&self, collection: &str, mut document: Document) -> DocumentStoreResult<Document> {
        for plugin in &self.plugins {
            document = plugin.before_insert(collection, document).await?;
        }
        Ok(document)
    }

    pub async fn after_insert(&self, collection: &str, document: &Document) -> DocumentStoreResult<()> {
        for plugin in &self.plugins {
            let result = plugin.after_insert(collection, document).await;
            self.settle(plugin.as_ref(), "after_insert", result)?;
        }
        Ok(())
    }

    pub async fn before_update(
        &self,
        collection: &str,
        mut query: Value,
        mut update: Value,
    ) -> DocumentStoreResult<(Value, Value)> {
        for plugin in &self.plugins {
            (query, update) = plugin.before_update(collection, query, update).await?;
        }
        Ok((query, update))
    }

    pub async fn after_update(
        &self,
        collection: &str,
        query: &Value,
        update: &Value,
        documents: &[Document],
    ) -> DocumentStoreResult<()> {
        for plugin in &self.plugins {
            let result = plugin.after_update(collection, query, update, documents).await;
            self.settle(plugin.as_ref(), "after_update", result)?;
        }
        Ok(())
    }

    pub async fn before_delete(&self, collection: &str, mut query: Value) -> DocumentStoreResult<Value> {
        for plugin in &self.plugins {
            query = plugin.before_delete(collection, query).await?;
        }
        Ok(query)
    }

    pub async fn after_delete(&self, collection: &str, query: &Value, documents: &[Document]) -> DocumentStoreResult<()> {
        for plugin in &self.plugins {
            let result = plugin.after_delete(collection, query, documents).await;
            self.settle(plugin.as_ref(), "after_delete", result)?;
        }
        Ok(())
    }

    pub async fn before_query(&self, collection: &str, mut query: Value) -> DocumentStoreResult<Value> {
        for plugin in &self.plugins {
            query = plugin.before_query(collection, query).await?;
        }
        Ok(query)
    }

    /// Passes results through every plugin. A failing plugin is skipped (its
    /// input is kept) unless plugins are strict.
    pub async fn after_query(
        &self,
        collection: &str,
        query: &Value,
        mut results: Vec<Document>,
    ) -> DocumentStoreResult<Vec<Document>> {
        for plugin in &self.plugins {
            let input = results.clone();
            match plugin.after_query(collection, query, input).await {
                Ok(transformed) => results = transformed,
                Err(err) => self.settle(plugin.as_ref(), "after_query", Err(err))?,
            }
        }
        Ok(results)
    }
}
