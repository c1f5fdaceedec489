//! Snapshot storage held in process memory.
//!
//! The backend keeps the last saved [`Snapshot`] behind an async-aware
//! read-write lock. Clones share it, which lets a test keep one handle while a
//! [`DocumentStore`](emberdoc_core::store::DocumentStore) owns another, or
//! hand the same state to a second store to simulate a restart.

use async_trait::async_trait;
use mea::rwlock::RwLock;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use emberdoc_core::{
    backend::{Snapshot, StoreBackend, StoreBackendBuilder},
    document::Document,
    error::{DocumentStoreError, DocumentStoreResult},
};

/// Thread-safe in-memory storage backend.
///
/// # Example
///
/// ```ignore
/// use emberdoc_memory::InMemoryStore;
/// use emberdoc::DocumentStore;
///
/// let backend = InMemoryStore::new();
/// let store = DocumentStore::builder(backend.clone()).build().await?;
/// store.collection("users").await?.insert(json!({ "name": "Alice" })).await?;
/// store.save().await?;
///
/// assert_eq!(backend.snapshot().await["users"].len(), 1);
/// ```
#[derive(Default, Clone, Debug)]
pub struct InMemoryStore {
    snapshot: Arc<RwLock<Snapshot>>,
    saves: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> InMemoryStoreBuilder {
        InMemoryStoreBuilder::default()
    }

    /// A copy of the last saved state.
    pub async fn snapshot(&self) -> Snapshot {
        self.snapshot.read().await.clone()
    }

    /// How many times [`save`](StoreBackend::save) succeeded.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Reopens a backend after [`shutdown`](StoreBackend::shutdown), keeping
    /// its contents.
    pub fn reopen(&self) {
        self.closed.store(false, Ordering::Release);
    }

    fn ensure_open(&self, operation: &str) -> DocumentStoreResult<()> {
        if self.is_closed() {
            return Err(DocumentStoreError::Adapter {
                message: format!("cannot {} after shutdown", operation),
                source: None,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl StoreBackend for InMemoryStore {
    async fn load(&self) -> DocumentStoreResult<Snapshot> {
        self.ensure_open("load")?;
        Ok(self.snapshot.read().await.clone())
    }

    async fn save(&self, snapshot: &Snapshot) -> DocumentStoreResult<()> {
        self.ensure_open("save")?;
        *self.snapshot.write().await = snapshot.clone();
        let saves = self.saves.fetch_add(1, Ordering::AcqRel) + 1;
        log::debug!("in-memory snapshot saved ({} collections, save #{})", snapshot.len(), saves);
        Ok(())
    }

    async fn shutdown(&self) -> DocumentStoreResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Builds an [`InMemoryStore`], optionally pre-seeded with documents.
///
/// ```ignore
/// use emberdoc::backend::StoreBackendBuilder;
///
/// let backend = InMemoryStore::builder()
///     .collection("users", vec![Document::from_value(json!({ "id": "1", "name": "Bob" }))?])
///     .build()
///     .await?;
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStoreBuilder {
    seed: Snapshot,
}

impl InMemoryStoreBuilder {
    /// Seeds one collection. Repeated calls for the same name append.
    pub fn collection(mut self, name: impl Into<String>, documents: impl IntoIterator<Item = Document>) -> Self {
        self.seed.entry(name.into()).or_default().extend(documents);
        self
    }

    /// Replaces the whole seed.
    pub fn snapshot(mut self, snapshot: Snapshot) -> Self {
        self.seed = snapshot;
        self
    }
}

#[async_trait]
impl StoreBackendBuilder for InMemoryStoreBuilder {
    type Backend = InMemoryStore;

    async fn build(self) -> DocumentStoreResult<Self::Backend> {
        Ok(InMemoryStore {
            snapshot: Arc::new(RwLock::new(self.seed)),
            ..InMemoryStore::default()
        })
    }
}
