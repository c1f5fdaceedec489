//! Core of the emberdoc embedded document database.
//!
//! Documents are schema-less JSON objects grouped into named collections and
//! kept in memory; a pluggable backend loads and saves whole snapshots.
//!
//! - **Documents** ([`document`]) - JSON objects with a string `id` and dotted-path access
//! - **Queries** ([`query`], [`matcher`]) - Mongo-style filters, parsed once and evaluated per document
//! - **Updates** ([`update`]) - `$set`, `$unset`, `$inc`, `$push` and `$pull`
//! - **Indexes** ([`index`]) - single, compound, unique and text indexes with a query planner
//! - **Compression** ([`compression`]) - zstd encoding of large documents or selected fields
//! - **Query cache** ([`cache`]) - LRU + TTL cache of find results, invalidated per document
//! - **Concurrency** ([`concurrency`]) - AIMD limiter for batch fan-out
//! - **Subscriptions** ([`subscription`]) - live queries notified after each commit
//! - **Collections** ([`collection`]) - the operations tying all of the above together
//! - **Store** ([`store`]) - collection registry, persistence and plugin wiring
//! - **Backends** ([`backend`]) and **plugins** ([`plugin`]) - the two extension points
//!
//! # Example
//!
//! ```ignore
//! use emberdoc_core::store::DocumentStore;
//! use serde_json::json;
//!
//! let store = DocumentStore::builder(backend).build().await?;
//! let users = store.collection("users").await?;
//!
//! users.insert(json!({ "name": "Alice", "age": 30 })).await?;
//! users.insert(json!({ "name": "Bob", "age": 25 })).await?;
//!
//! let older = users.find(json!({ "age": { "$gt": 26 } })).await?;
//! assert_eq!(older.len(), 1);
//! ```

#[allow(unused_extern_crates)]
extern crate self as emberdoc_core;

pub mod backend;
pub mod cache;
pub mod collection;
pub mod compression;
pub mod concurrency;
pub mod document;
pub mod error;
pub mod index;
pub mod matcher;
pub mod page;
pub mod plugin;
pub mod query;
pub mod store;
pub mod subscription;
pub mod update;
