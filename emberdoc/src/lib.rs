//! An embedded, schema-less JSON document database.
//!
//! This crate is the entry point for users of emberdoc. It re-exports the
//! engine from `emberdoc-core` and the in-memory backend from
//! `emberdoc-memory`.
//!
//! # Features
//!
//! - **Mongo-style queries** - `$eq`, `$gt`, `$in`, `$regex`, `$and`, `$or`, `$not` and friends
//! - **Update operators** - `$set`, `$unset`, `$inc`, `$push`, `$pull`
//! - **Indexes** - single-field, compound, unique and full-text
//! - **Query cache** - LRU with TTL, invalidated only for queries a write can affect
//! - **Compression** - zstd for large documents or selected fields
//! - **Live queries** - subscriptions notified after each commit, once per batch
//! - **Adaptive concurrency** - AIMD limiter for batch operations
//! - **Plugins** - hooks before and after every operation
//!
//! # Quick Start
//!
//! ```ignore
//! use emberdoc::{prelude::*, memory::InMemoryStore};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> DocumentStoreResult<()> {
//!     let store = DocumentStore::builder(InMemoryStore::new()).build().await?;
//!     let users = store.collection("users").await?;
//!
//!     users.insert(json!({ "name": "Alice", "age": 30 })).await?;
//!     users.insert(json!({ "name": "Bob", "age": 25 })).await?;
//!
//!     let older = users.find(json!({ "age": { "$gt": 26 } })).await?;
//!     println!("older users: {:?}", older);
//!
//!     users.update(json!({ "name": "Bob" }), json!({ "$set": { "age": 26 } })).await?;
//!     users.delete_one(json!({ "name": "Alice" })).await?;
//!
//!     store.shutdown().await
//! }
//! ```
//!
//! # Batches and subscriptions
//!
//! ```ignore
//! let id = users.subscribe(json!({ "active": true }), |documents| {
//!     println!("{} active users", documents.len());
//! })?;
//!
//! users.begin_batch().await;
//! users.insert(json!({ "name": "Carol", "active": true })).await?;
//! users.insert(json!({ "name": "Dave", "active": true })).await?;
//! users.end_batch().await; // the callback runs once, here
//!
//! users.unsubscribe(&id)?;
//! ```
//!
//! # Plugins
//!
//! ```ignore
//! struct Audit;
//!
//! #[emberdoc::async_trait]
//! impl Plugin for Audit {
//!     fn name(&self) -> &str {
//!         "audit"
//!     }
//!
//!     async fn after_delete(&self, collection: &str, query: &Value, deleted: &[Document]) -> DocumentStoreResult<()> {
//!         log::info!("{} documents deleted from {} by {}", deleted.len(), collection, query);
//!         Ok(())
//!     }
//! }
//!
//! let store = DocumentStore::builder(InMemoryStore::new()).plugin(Audit).build().await?;
//! ```
//!
//! # Backends
//!
//! - [`memory`] - in-process snapshot storage
//!
//! Other storage is plugged in by implementing
//! [`StoreBackend`](backend::StoreBackend).

pub mod prelude;

pub use emberdoc_core::{
    backend, cache, collection, compression, concurrency, document, error, index, matcher, page, plugin, query,
    store, subscription, update,
};

pub use emberdoc_core::{collection::Collection, document::Document, store::DocumentStore};

pub use async_trait::async_trait;
pub use serde_json;

/// In-memory storage backend implementations.
pub mod memory {
    pub use emberdoc_memory::{InMemoryStore, InMemoryStoreBuilder};
}
