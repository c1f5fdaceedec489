//! Storage backend abstraction for the document store.
//!
//! The engine keeps every collection in memory. A backend is only asked to
//! hand over a full [`Snapshot`] when the store starts and to persist one when
//! the store saves, so implementing durable storage means implementing two
//! methods.
//!
//! # Traits
//!
//! - [`StoreBackend`]: the load/save contract
//! - [`DynStoreBackend`]: object-safe wrapper the store holds internally
//! - [`StoreBackendBuilder`]: factory trait for creating backend instances
//!
//! # Example
//!
//! ```ignore
//! use emberdoc::backend::{Snapshot, StoreBackend};
//!
//! #[derive(Debug)]
//! struct JsonFile(std::path::PathBuf);
//!
//! #[async_trait::async_trait]
//! impl StoreBackend for JsonFile {
//!     async fn load(&self) -> DocumentStoreResult<Snapshot> {
//!         let bytes = std::fs::read(&self.0).map_err(|e| DocumentStoreError::adapter("read", e))?;
//!         Ok(serde_json::from_slice(&bytes)?)
//!     }
//!
//!     async fn save(&self, snapshot: &Snapshot) -> DocumentStoreResult<()> {
//!         let bytes = serde_json::to_vec(snapshot)?;
//!         std::fs::write(&self.0, bytes).map_err(|e| DocumentStoreError::adapter("write", e))
//!     }
//! }
//! ```

use async_trait::async_trait;
use std::{any::Any, collections::BTreeMap, fmt::Debug};

use crate::{document::Document, error::DocumentStoreResult};

/// Every collection's documents, keyed by collection name, in insertion order.
pub type Snapshot = BTreeMap<String, Vec<Document>>;

/// Abstract interface for document storage backends.
///
/// Implementations must be thread-safe. Failures should be reported as
/// [`DocumentStoreError::Adapter`](crate::error::DocumentStoreError::Adapter)
/// carrying the underlying cause.
#[async_trait]
pub trait StoreBackend: Send + Sync + Debug {
    /// Returns the persisted state. An empty snapshot means a fresh database.
    async fn load(&self) -> DocumentStoreResult<Snapshot>;

    /// Persists the full state, replacing whatever was stored before.
    async fn save(&self, snapshot: &Snapshot) -> DocumentStoreResult<()>;

    /// Releases backend resources. The default implementation is a no-op.
    async fn shutdown(&self) -> DocumentStoreResult<()> {
        Ok(())
    }
}

/// Object-safe view of a [`StoreBackend`] that can be downcast back to the
/// concrete type.
#[async_trait]
pub trait DynStoreBackend: Send + Sync + Debug {
    async fn load(&self) -> DocumentStoreResult<Snapshot>;
    async fn save(&self, snapshot: &Snapshot) -> DocumentStoreResult<()>;
    async fn shutdown(&self) -> DocumentStoreResult<()>;

    fn as_any(&self) -> &dyn Any;
}

#[async_trait]
impl<B: StoreBackend + 'static> DynStoreBackend for B {
    async fn load(&self) -> DocumentStoreResult<Snapshot> {
        StoreBackend::load(self).await
    }

    async fn save(&self, snapshot: &Snapshot) -> DocumentStoreResult<()> {
        StoreBackend::save(self, snapshot).await
    }

    async fn shutdown(&self) -> DocumentStoreResult<()> {
        StoreBackend::shutdown(self).await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[async_trait]
pub trait StoreBackendBuilder {
    type Backend: StoreBackend;

    async fn build(self) -> DocumentStoreResult<Self::Backend>;
}
