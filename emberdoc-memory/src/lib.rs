//! In-memory storage backend for emberdoc.
//!
//! [`InMemoryStore`] implements the snapshot load/save contract without
//! touching disk. It is the default backend for tests and for applications
//! that only need a database for the lifetime of the process.
//!
//! # Quick Start
//!
//! ```ignore
//! use emberdoc::{DocumentStore, memory::InMemoryStore};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = DocumentStore::builder(InMemoryStore::new()).build().await?;
//!
//!     let users = store.collection("users").await?;
//!     users.insert(json!({ "name": "Alice" })).await?;
//!
//!     store.shutdown().await?;
//!     Ok(())
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as emberdoc_memory;

pub mod store;

pub use store::{InMemoryStore, InMemoryStoreBuilder};
