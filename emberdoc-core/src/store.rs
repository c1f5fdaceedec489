//! The database: a registry of collections bound to one storage backend.
//!
//! [`DocumentStore`] loads a [`Snapshot`] from its backend when it is built
//! and writes one back on [`save`](DocumentStore::save). Between the two,
//! collections live entirely in memory. Committed writes raise a shared
//! [`SaveSignal`]; the store never saves on its own, callers decide when with
//! [`save_if_dirty`](DocumentStore::save_if_dirty).
//!
//! # Example
//!
//! ```ignore
//! use emberdoc::{DocumentStore, memory::InMemoryStore};
//! use serde_json::json;
//!
//! let store = DocumentStore::builder(InMemoryStore::new()).build().await?;
//! let users = store.collection("users").await?;
//! users.insert(json!({ "name": "Alice" })).await?;
//!
//! store.save_if_dirty().await?;
//! ```

use indexmap::IndexMap;
use parking_lot::Mutex;
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use crate::{
    backend::{DynStoreBackend, Snapshot, StoreBackend},
    collection::{Collection, CollectionOptions},
    error::{DocumentStoreError, DocumentStoreResult},
    plugin::{Plugin, PluginHost},
};

/// Shared flag collections raise after every committed write outside a batch,
/// and once per outermost batch.
#[derive(Debug, Default)]
pub struct SaveSignal {
    dirty: AtomicBool,
    requests: AtomicU64,
}

impl SaveSignal {
    pub(crate) fn raise(&self) {
        self.dirty.store(true, Ordering::Release);
        self.requests.fetch_add(1, Ordering::AcqRel);
    }

    /// Clears the flag and returns its previous value.
    fn take(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    fn restore(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Number of save signals raised since the store was built.
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Acquire)
    }
}

fn backend_failure(context: &str, err: DocumentStoreError) -> DocumentStoreError {
    let err = match err {
        err @ DocumentStoreError::Adapter { .. } => err,
        other => DocumentStoreError::adapter(context, other),
    };
    log::error!("{}: {}", context, err);
    err
}

struct StoreInner {
    backend: Box<dyn DynStoreBackend>,
    collections: Mutex<IndexMap<String, Collection>>,
    signal: Arc<SaveSignal>,
    plugins: PluginHost,
}

/// An embedded document database.
///
/// Cloning is cheap; clones share collections and the backend.
#[derive(Clone)]
pub struct DocumentStore {
    inner: Arc<StoreInner>,
}

impl fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentStore")
            .field("backend", &self.inner.backend)
            .field("collections", &self.list_collections())
            .field("plugins", &self.inner.plugins)
            .finish()
    }
}

impl DocumentStore {
    pub fn builder(backend: impl StoreBackend + 'static) -> DocumentStoreBuilder {
        DocumentStoreBuilder {
            backend: Box::new(backend),
            plugins: Vec::new(),
            strict: false,
        }
    }

    /// The backend this store persists to.
    pub fn backend(&self) -> &dyn DynStoreBackend {
        self.inner.backend.as_ref()
    }

    /// Downcasts the backend to its concrete type.
    pub fn backend_as<B: StoreBackend + 'static>(&self) -> Option<&B> {
        self.inner.backend.as_any().downcast_ref::<B>()
    }

    /// Returns the named collection, creating it with default options if it
    /// does not exist.
    pub async fn collection(&self, name: &str) -> DocumentStoreResult<Collection> {
        let existing = self.inner.collections.lock().get(name).cloned();
        match existing {
            Some(collection) => Ok(collection),
            None => self.create_collection(name, CollectionOptions::default()).await,
        }
    }

    /// Creates the named collection with `options`, or reconfigures it if it
    /// already exists.
    pub async fn collection_with_options(&self, name: &str, options: CollectionOptions) -> DocumentStoreResult<Collection> {
        let existing = self.inner.collections.lock().get(name).cloned();
        match existing {
            Some(collection) => {
                collection.configure(options).await?;
                Ok(collection)
            }
            None => self.create_collection(name, options).await,
        }
    }

    async fn create_collection(&self, name: &str, options: CollectionOptions) -> DocumentStoreResult<Collection> {
        if name.is_empty() {
            return Err(DocumentStoreError::InvalidDocument("collection name must not be empty".into()));
        }

        let collection = self.new_collection(name, &options);
        collection.configure(options).await?;

        {
            let mut collections = self.inner.collections.lock();
            if let Some(existing) = collections.get(name) {
                return Ok(existing.clone());
            }
            collections.insert(name.to_string(), collection.clone());
        }

        log::debug!("created collection {}", name);
        self.inner.plugins.on_collection_create(&collection).await?;
        Ok(collection)
    }

    fn new_collection(&self, name: &str, options: &CollectionOptions) -> Collection {
        Collection::new(name, options, self.inner.plugins.clone(), self.inner.signal.clone())
    }

    /// Removes a collection and its documents. Handles held elsewhere keep
    /// working but are no longer persisted.
    pub fn drop_collection(&self, name: &str) -> DocumentStoreResult<()> {
        let collection = self
            .inner
            .collections
            .lock()
            .shift_remove(name)
            .ok_or_else(|| DocumentStoreError::NotFound(format!("collection {}", name)))?;

        collection.detach();
        self.inner.signal.raise();
        log::debug!("dropped collection {}", name);
        Ok(())
    }

    /// Reloads the named collection from the backend, discarding its unsaved
    /// changes. A collection the backend does not know about becomes empty.
    ///
    /// # Errors
    ///
    /// [`DocumentStoreError::NotFound`] for an unknown collection and
    /// [`DocumentStoreError::Adapter`] if the backend cannot load. Documents
    /// that fail validation leave the collection as it was.
    pub async fn refresh(&self, name: &str) -> DocumentStoreResult<()> {
        let collection = self
            .inner
            .collections
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| DocumentStoreError::NotFound(format!("collection {}", name)))?;

        let mut snapshot = self
            .inner
            .backend
            .load()
            .await
            .map_err(|err| backend_failure("loading snapshot", err))?;
        let documents = snapshot.remove(name).unwrap_or_default();

        log::debug!("refreshing collection {} ({} documents)", name, documents.len());
        collection.reload(documents).await
    }

    /// Reloads every registered collection from one backend snapshot.
    pub async fn refresh_all(&self) -> DocumentStoreResult<()> {
        let mut snapshot = self
            .inner
            .backend
            .load()
            .await
            .map_err(|err| backend_failure("loading snapshot", err))?;

        let collections: Vec<Collection> = self.inner.collections.lock().values().cloned().collect();
        for collection in collections {
            let documents = snapshot.remove(collection.name()).unwrap_or_default();
            collection.reload(documents).await?;
        }
        Ok(())
    }

    /// Collection names in creation order.
    pub fn list_collections(&self) -> Vec<String> {
        self.inner.collections.lock().keys().cloned().collect()
    }

    /// Writes every collection to the backend.
    ///
    /// The dirty flag is cleared up front and restored if the backend fails,
    /// so writes committed while the save runs are never forgotten.
    pub async fn save(&self) -> DocumentStoreResult<()> {
        let was_dirty = self.inner.signal.take();
        match self.write_snapshot().await {
            Ok(collections) => {
                log::debug!("saved {} collections", collections);
                Ok(())
            }
            Err(err) => {
                if was_dirty {
                    self.inner.signal.restore();
                }
                Err(err)
            }
        }
    }

    async fn write_snapshot(&self) -> DocumentStoreResult<usize> {
        let collections: Vec<Collection> = self.inner.collections.lock().values().cloned().collect();

        let mut snapshot = Snapshot::new();
        for collection in &collections {
            snapshot.insert(collection.name().to_string(), collection.export().await?);
        }

        self.inner
            .backend
            .save(&snapshot)
            .await
            .map_err(|err| backend_failure("saving snapshot", err))?;
        Ok(snapshot.len())
    }

    /// Saves only if something was written since the last successful save.
    /// Returns whether a save happened.
    pub async fn save_if_dirty(&self) -> DocumentStoreResult<bool> {
        if !self.is_dirty() {
            return Ok(false);
        }
        self.save().await?;
        Ok(true)
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.signal.is_dirty()
    }

    pub fn save_requests(&self) -> u64 {
        self.inner.signal.requests()
    }

    /// Saves pending changes, then shuts the backend down.
    pub async fn shutdown(&self) -> DocumentStoreResult<()> {
        self.save_if_dirty().await?;
        self.inner
            .backend
            .shutdown()
            .await
            .map_err(|err| backend_failure("shutting down backend", err))
    }
}

/// Builds a [`DocumentStore`] and loads its persisted state.
pub struct DocumentStoreBuilder {
    backend: Box<dyn DynStoreBackend>,
    plugins: Vec<Arc<dyn Plugin>>,
    strict: bool,
}

impl fmt::Debug for DocumentStoreBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentStoreBuilder")
            .field("backend", &self.backend)
            .field("plugins", &self.plugins.len())
            .field("strict", &self.strict)
            .finish()
    }
}

impl DocumentStoreBuilder {
    /// Registers a plugin. Hooks run in registration order.
    pub fn plugin(mut self, plugin: impl Plugin + 'static) -> Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    /// When set, after-hook failures are returned instead of logged.
    pub fn strict_plugins(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Loads the backend's snapshot, announces each loaded collection to the
    /// plugins and runs their `on_init` hooks.
    pub async fn build(self) -> DocumentStoreResult<DocumentStore> {
        let store = DocumentStore {
            inner: Arc::new(StoreInner {
                backend: self.backend,
                collections: Mutex::new(IndexMap::new()),
                signal: Arc::new(SaveSignal::default()),
                plugins: PluginHost::new(self.plugins, self.strict),
            }),
        };

        let snapshot = store
            .inner
            .backend
            .load()
            .await
            .map_err(|err| backend_failure("loading snapshot", err))?;

        let mut loaded = Vec::with_capacity(snapshot.len());
        for (name, documents) in snapshot {
            let collection = store.new_collection(&name, &CollectionOptions::default());
            collection.load(documents).await?;
            log::debug!("loaded collection {} ({} documents)", name, collection.len().await);
            store.inner.collections.lock().insert(name, collection.clone());
            loaded.push(collection);
        }

        for collection in &loaded {
            store.inner.plugins.on_collection_create(collection).await?;
        }
        store.inner.plugins.on_init(&store).await?;
        Ok(store)
    }
}
