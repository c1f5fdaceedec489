//! Collections: named sets of documents and the bookkeeping around them.
//!
//! A [`Collection`] is a cheap handle; clones share the same documents,
//! indexes, cache and subscriptions. Every write runs inside one section of
//! the collection's write lock, so a document, its index entries and the
//! cache are always updated together.
//!
//! # Example
//!
//! ```ignore
//! use serde_json::json;
//!
//! # async fn example(store: &emberdoc::DocumentStore) -> emberdoc::error::DocumentStoreResult<()> {
//! let users = store.collection("users").await?;
//! users.insert(json!({ "name": "Alice", "age": 30 })).await?;
//!
//! let adults = users.find(json!({ "age": { "$gte": 18 } })).await?;
//! users.update(json!({ "name": "Alice" }), json!({ "$inc": { "age": 1 } })).await?;
//! # Ok(()) }
//! ```

use futures::future::join_all;
use indexmap::IndexMap;
use mea::rwlock::RwLock;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, future::Future, mem, sync::Arc};
use uuid::Uuid;

use crate::{
    cache::{CacheStats, QueryCache, QueryCacheOptions},
    compression::{CompressionManager, CompressionOptions, CompressionStats, StoredDocument},
    concurrency::{ConcurrencyController, ConcurrencyOptions, ConcurrencyStats},
    document::Document,
    error::{DocumentStoreError, DocumentStoreResult},
    index::{IdSet, IndexDefinition, IndexManager},
    page::{Page, PaginationParams},
    plugin::PluginHost,
    query::{FindOptions, Query},
    store::SaveSignal,
    subscription::{Subscription, SubscriptionRegistry},
    update::Update,
};

const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Per-collection configuration. Every field has a default, so partial JSON
/// such as `{"queryCache": {"maxSize": 10}}` deserializes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CollectionOptions {
    /// Stored and exposed as-is; validation is left to plugins.
    pub schema: Option<Value>,
    pub indexes: Vec<IndexDefinition>,
    pub compression: CompressionOptions,
    pub query_cache: QueryCacheOptions,
    pub concurrency: ConcurrencyOptions,
}

/// What [`Collection::optimize`] reclaimed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptimizeStats {
    pub expired_cache_entries: usize,
    pub empty_index_buckets: usize,
}

#[derive(Debug, Default)]
struct CollectionState {
    documents: IndexMap<String, StoredDocument>,
    indexes: IndexManager,
    compression: CompressionManager,
    schema: Option<Value>,
    batch_depth: usize,
    /// Something was written while a batch was open.
    pending: bool,
}

impl CollectionState {
    fn all_documents(&self) -> DocumentStoreResult<Vec<Document>> {
        self.documents.values().map(StoredDocument::decode).collect()
    }

    /// Matching documents in insertion order, at most `limit` of them.
    fn resolve(&self, query: &Query, limit: Option<usize>) -> DocumentStoreResult<Vec<(String, Document)>> {
        let limit = limit.unwrap_or(usize::MAX);
        let mut found = Vec::new();
        if limit == 0 {
            return Ok(found);
        }

        let candidates: Box<dyn Iterator<Item = usize>> = match query.expr().id_equality() {
            Some(id) => Box::new(self.documents.get_index_of(id).into_iter()),
            None => match self.indexes.lookup(query) {
                Some(ids) => Box::new(self.positions(&ids).into_iter()),
                None => Box::new(0..self.documents.len()),
            },
        };

        for position in candidates {
            let Some((id, stored)) = self.documents.get_index(position) else {
                continue;
            };
            let document = stored.decode()?;
            if query.matches(&document) {
                found.push((id.clone(), document));
                if found.len() >= limit {
                    break;
                }
            }
        }

        Ok(found)
    }

    fn positions(&self, ids: &IdSet) -> Vec<usize> {
        let mut positions: Vec<usize> = ids
            .iter()
            .filter_map(|id| self.documents.get_index_of(id.as_str()))
            .collect();
        positions.sort_unstable();
        positions
    }

    fn insert_document(&mut self, cache: &mut QueryCache, collection: &str, document: Document) -> DocumentStoreResult<()> {
        let id = document
            .id()
            .map(str::to_string)
            .ok_or_else(|| DocumentStoreError::InvalidDocument("document has no id".into()))?;

        if self.documents.contains_key(&id) {
            return Err(DocumentStoreError::DuplicateKey(id, collection.to_string()));
        }
        self.indexes.check_unique(&id, &document)?;

        let stored = self.compression.encode(&document)?;
        self.documents.insert(id.clone(), stored);
        self.indexes.on_insert(&id, &document);
        cache.invalidate_document(None, Some(&document));
        Ok(())
    }

    fn replace_document(&mut self, cache: &mut QueryCache, id: &str, old: &Document, update: &Update) -> DocumentStoreResult<Document> {
        let new = update.apply(old)?;
        self.indexes.check_unique(id, &new)?;

        let stored = self.compression.encode(&new)?;
        self.documents.insert(id.to_string(), stored);
        self.indexes.on_update(id, old, &new);
        cache.invalidate_document(Some(old), Some(&new));
        Ok(new)
    }

    fn remove_document(&mut self, cache: &mut QueryCache, id: &str, old: &Document) -> bool {
        if self.documents.shift_remove(id).is_none() {
            return false;
        }
        self.indexes.on_delete(id, old);
        cache.invalidate_document(Some(old), None);
        true
    }

    /// Swaps in a new set of documents. If any of them is rejected the
    /// previous contents stay in place.
    fn replace_all(&mut self, cache: &mut QueryCache, collection: &str, documents: Vec<Document>) -> DocumentStoreResult<()> {
        let documents_before = mem::take(&mut self.documents);
        let indexes_before = self.indexes.clone();
        self.indexes.clear();
        cache.clear();

        let result = self.fill(cache, collection, documents);
        if result.is_err() {
            self.documents = documents_before;
            self.indexes = indexes_before;
        }
        result
    }

    fn fill(&mut self, cache: &mut QueryCache, collection: &str, documents: Vec<Document>) -> DocumentStoreResult<()> {
        for mut document in documents {
            document.validate_id()?;
            if document.id().is_none() {
                document.set_id(Uuid::new_v4().to_string());
            }
            self.insert_document(cache, collection, document)?;
        }
        Ok(())
    }

    fn create_index(&mut self, definition: IndexDefinition) -> DocumentStoreResult<()> {
        let documents = self
            .documents
            .iter()
            .map(|(id, stored)| Ok((id.clone(), stored.decode()?)))
            .collect::<DocumentStoreResult<Vec<_>>>()?;

        self.indexes
            .create_index(definition, documents.iter().map(|(id, document)| (id.as_str(), document)))
    }

    fn notifications(&self, subscriptions: &Mutex<SubscriptionRegistry>) -> Vec<(Subscription, Vec<Document>)> {
        let subscriptions = subscriptions.lock().snapshot();
        if subscriptions.is_empty() {
            return Vec::new();
        }

        let documents = match self.all_documents() {
            Ok(documents) => documents,
            Err(err) => {
                log::error!("could not decode documents for subscribers: {}", err);
                return Vec::new();
            }
        };

        subscriptions
            .into_iter()
            .map(|subscription| {
                let matched = documents
                    .iter()
                    .filter(|document| subscription.query().matches(document))
                    .cloned()
                    .collect();
                (subscription, matched)
            })
            .collect()
    }
}

/// Subscription callbacks gathered under the lock, run after it is released.
#[must_use]
#[derive(Default)]
struct Commit {
    notifications: Vec<(Subscription, Vec<Document>)>,
}

impl Commit {
    fn deliver(self) {
        for (subscription, documents) in self.notifications {
            subscription.notify(&documents);
        }
    }
}

struct CollectionInner {
    name: String,
    state: RwLock<CollectionState>,
    cache: Mutex<QueryCache>,
    subscriptions: Mutex<SubscriptionRegistry>,
    concurrency: ConcurrencyController,
    plugins: PluginHost,
    signal: Arc<SaveSignal>,
}

/// A named collection of documents.
#[derive(Clone)]
pub struct Collection {
    inner: Arc<CollectionInner>,
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection").field("name", &self.inner.name).finish_non_exhaustive()
    }
}

impl Collection {
    /// Creates an empty collection. Indexes listed in `options` are built by
    /// [`configure`](Collection::configure).
    pub(crate) fn new(name: impl Into<String>, options: &CollectionOptions, plugins: PluginHost, signal: Arc<SaveSignal>) -> Self {
        let state = CollectionState {
            compression: CompressionManager::new(options.compression.clone()),
            schema: options.schema.clone(),
            ..CollectionState::default()
        };

        Self {
            inner: Arc::new(CollectionInner {
                name: name.into(),
                state: RwLock::new(state),
                cache: Mutex::new(QueryCache::new(options.query_cache.clone())),
                subscriptions: Mutex::new(SubscriptionRegistry::new()),
                concurrency: ConcurrencyController::new(options.concurrency.clone()),
                plugins,
                signal,
            }),
        }
    }

    /// Returns the name of this collection.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Applies options to a live collection. Indexes that already exist by
    /// name are left alone; the schema is only replaced when one is given.
    pub async fn configure(&self, options: CollectionOptions) -> DocumentStoreResult<()> {
        let CollectionOptions {
            schema,
            indexes,
            compression,
            query_cache,
            concurrency,
        } = options;

        self.inner.concurrency.set_options(concurrency);
        self.inner.cache.lock().set_options(query_cache);

        let mut state = self.inner.state.write().await;
        state.compression.set_options(compression);
        if schema.is_some() {
            state.schema = schema;
        }
        for definition in indexes {
            if !state.indexes.has_index(&definition.name) {
                state.create_index(definition)?;
            }
        }
        Ok(())
    }

    pub async fn schema(&self) -> Option<Value> {
        self.inner.state.read().await.schema.clone()
    }

    /// Decides what a finished write triggers: nothing while a batch is
    /// open, otherwise a save signal and one notification per subscriber.
    fn finish_write(&self, state: &mut CollectionState, wrote: bool) -> Commit {
        if state.batch_depth > 0 {
            state.pending |= wrote;
            return Commit::default();
        }
        if !wrote {
            return Commit::default();
        }

        self.inner.signal.raise();
        Commit {
            notifications: state.notifications(&self.inner.subscriptions),
        }
    }

    /// Inserts a document, assigning a UUID `id` when it has none.
    ///
    /// # Errors
    ///
    /// [`DocumentStoreError::InvalidDocument`] for non-objects or non-string
    /// ids, [`DocumentStoreError::DuplicateKey`] when the id is taken, and
    /// [`DocumentStoreError::UniqueConstraint`] when a unique index rejects it.
    pub async fn insert(&self, document: impl Into<Value>) -> DocumentStoreResult<Document> {
        let document = Document::from_value(document.into())?;
        let mut document = self.inner.plugins.before_insert(self.name(), document).await?;
        document.validate_id()?;
        if document.id().is_none() {
            document.set_id(Uuid::new_v4().to_string());
        }

        let commit = {
            let mut state = self.inner.state.write().await;
            let mut cache = self.inner.cache.lock();
            state.insert_document(&mut cache, self.name(), document.clone())?;
            drop(cache);
            self.finish_write(&mut state, true)
        };
        commit.deliver();

        self.inner.plugins.after_insert(self.name(), &document).await?;
        Ok(document)
    }

    /// Inserts every document inside one implicit batch. All items are
    /// attempted; the first failure is returned afterwards.
    pub async fn insert_batch<I>(&self, documents: I) -> DocumentStoreResult<Vec<Document>>
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        let documents: Vec<Value> = documents.into_iter().map(Into::into).collect();

        self.begin_batch().await;
        let results = join_all(documents.into_iter().map(|document| async move {
            let _permit = self.inner.concurrency.acquire().await;
            self.insert(document).await
        }))
        .await;
        self.end_batch().await;

        first_error(self.name(), "insert_batch", results)
    }

    pub async fn find(&self, query: impl Into<Value>) -> DocumentStoreResult<Vec<Document>> {
        let raw = self.inner.plugins.before_query(self.name(), query.into()).await?;
        let query = Query::parse(&raw)?;
        let results = self.find_parsed(&query).await?;
        self.inner.plugins.after_query(self.name(), &raw, results).await
    }

    async fn find_parsed(&self, query: &Query) -> DocumentStoreResult<Vec<Document>> {
        let state = self.inner.state.read().await;
        if let Some(hit) = self.inner.cache.lock().get(query.fingerprint()) {
            return Ok(hit);
        }

        let results: Vec<Document> = state
            .resolve(query, None)?
            .into_iter()
            .map(|(_, document)| document)
            .collect();
        self.inner.cache.lock().put(query, results.clone());
        Ok(results)
    }

    pub async fn find_one(&self, query: impl Into<Value>) -> DocumentStoreResult<Option<Document>> {
        Ok(self.find(query).await?.into_iter().next())
    }

    /// Finds documents and applies sort, offset and limit.
    pub async fn find_with(&self, query: impl Into<Value>, options: &FindOptions) -> DocumentStoreResult<Vec<Document>> {
        Ok(options.apply(self.find(query).await?))
    }

    pub async fn find_page(&self, query: impl Into<Value>, params: &PaginationParams) -> DocumentStoreResult<Page<Document>> {
        Ok(params.paginate(self.find(query).await?))
    }

    pub async fn count(&self, query: impl Into<Value>) -> DocumentStoreResult<usize> {
        Ok(self.find(query).await?.len())
    }

    /// Fetches a document by id.
    pub async fn get(&self, id: &str) -> DocumentStoreResult<Option<Document>> {
        let state = self.inner.state.read().await;
        state.documents.get(id).map(StoredDocument::decode).transpose()
    }

    pub async fn len(&self) -> usize {
        self.inner.state.read().await.documents.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Applies `update` to every matching document and returns how many were
    /// rewritten.
    ///
    /// Documents are processed in insertion order. If one of them fails
    /// (type error, unique violation) the error is returned and the documents
    /// updated before it stay updated.
    pub async fn update(&self, query: impl Into<Value>, update: impl Into<Value>) -> DocumentStoreResult<usize> {
        self.update_where(query.into(), update.into(), None).await
    }

    /// Updates the first matching document only.
    pub async fn update_one(&self, query: impl Into<Value>, update: impl Into<Value>) -> DocumentStoreResult<bool> {
        Ok(self.update_where(query.into(), update.into(), Some(1)).await? > 0)
    }

    async fn update_where(&self, query: Value, update: Value, limit: Option<usize>) -> DocumentStoreResult<usize> {
        let (query, update) = self.inner.plugins.before_update(self.name(), query, update).await?;
        let parsed_query = Query::parse(&query)?;
        let parsed_update = Update::parse(&update)?;

        let (updated, failure, commit) = {
            let mut state = self.inner.state.write().await;
            let targets = state.resolve(&parsed_query, limit)?;

            let mut cache = self.inner.cache.lock();
            let mut updated = Vec::with_capacity(targets.len());
            let mut failure = None;
            for (id, old) in &targets {
                match state.replace_document(&mut cache, id, old, &parsed_update) {
                    Ok(new) => updated.push(new),
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }
            drop(cache);

            let commit = self.finish_write(&mut state, !updated.is_empty());
            (updated, failure, commit)
        };
        commit.deliver();

        if let Some(err) = failure {
            return Err(err);
        }
        self.inner.plugins.after_update(self.name(), &query, &update, &updated).await?;
        Ok(updated.len())
    }

    /// Runs `(query, update)` pairs inside one implicit batch and returns the
    /// total number of rewritten documents.
    pub async fn update_batch<Q, U>(&self, updates: impl IntoIterator<Item = (Q, U)>) -> DocumentStoreResult<usize>
    where
        Q: Into<Value>,
        U: Into<Value>,
    {
        let updates: Vec<(Value, Value)> = updates.into_iter().map(|(q, u)| (q.into(), u.into())).collect();

        self.begin_batch().await;
        let results = join_all(updates.into_iter().map(|(query, update)| async move {
            let _permit = self.inner.concurrency.acquire().await;
            self.update_where(query, update, None).await
        }))
        .await;
        self.end_batch().await;

        Ok(first_error(self.name(), "update_batch", results)?.into_iter().sum())
    }

    /// Deletes every matching document and returns how many were removed.
    pub async fn delete(&self, query: impl Into<Value>) -> DocumentStoreResult<usize> {
        self.delete_where(query.into(), None).await
    }

    pub async fn delete_one(&self, query: impl Into<Value>) -> DocumentStoreResult<bool> {
        Ok(self.delete_where(query.into(), Some(1)).await? > 0)
    }

    async fn delete_where(&self, query: Value, limit: Option<usize>) -> DocumentStoreResult<usize> {
        let query = self.inner.plugins.before_delete(self.name(), query).await?;
        let parsed = Query::parse(&query)?;

        let (deleted, commit) = {
            let mut state = self.inner.state.write().await;
            let targets = state.resolve(&parsed, limit)?;

            let mut cache = self.inner.cache.lock();
            let mut deleted = Vec::with_capacity(targets.len());
            for (id, old) in targets {
                if state.remove_document(&mut cache, &id, &old) {
                    deleted.push(old);
                }
            }
            drop(cache);

            let commit = self.finish_write(&mut state, !deleted.is_empty());
            (deleted, commit)
        };
        commit.deliver();

        self.inner.plugins.after_delete(self.name(), &query, &deleted).await?;
        Ok(deleted.len())
    }

    /// Runs several delete queries inside one implicit batch.
    pub async fn delete_batch<Q>(&self, queries: impl IntoIterator<Item = Q>) -> DocumentStoreResult<usize>
    where
        Q: Into<Value>,
    {
        let queries: Vec<Value> = queries.into_iter().map(Into::into).collect();

        self.begin_batch().await;
        let results = join_all(queries.into_iter().map(|query| async move {
            let _permit = self.inner.concurrency.acquire().await;
            self.delete_where(query, None).await
        }))
        .await;
        self.end_batch().await;

        Ok(first_error(self.name(), "delete_batch", results)?.into_iter().sum())
    }

    /// Opens a batch. Batches nest; notifications and the save signal wait
    /// until the outermost batch ends.
    pub async fn begin_batch(&self) {
        self.inner.state.write().await.batch_depth += 1;
    }

    /// Closes a batch. Closing the outermost batch notifies subscribers once
    /// and signals one save, provided something was written.
    pub async fn end_batch(&self) {
        let commit = {
            let mut state = self.inner.state.write().await;
            if state.batch_depth == 0 {
                log::warn!("end_batch on {} without a matching begin_batch", self.name());
                return;
            }

            state.batch_depth -= 1;
            if state.batch_depth > 0 || !mem::take(&mut state.pending) {
                return;
            }
            self.finish_write(&mut state, true)
        };
        commit.deliver();
    }

    /// Registers a live query. The callback is invoked with the full match
    /// set after every commit, never at registration.
    pub fn subscribe<F>(&self, query: impl Into<Value>, callback: F) -> DocumentStoreResult<String>
    where
        F: Fn(&[Document]) + Send + Sync + 'static,
    {
        let query = Query::parse(&query.into())?;
        Ok(self.inner.subscriptions.lock().subscribe(query, Arc::new(callback)))
    }

    pub fn unsubscribe(&self, id: &str) -> DocumentStoreResult<()> {
        self.inner.subscriptions.lock().unsubscribe(id)
    }

    pub async fn create_index(&self, definition: IndexDefinition) -> DocumentStoreResult<()> {
        self.inner.state.write().await.create_index(definition)
    }

    pub async fn drop_index(&self, name: &str) -> DocumentStoreResult<()> {
        self.inner.state.write().await.indexes.drop_index(name).map(|_| ())
    }

    pub async fn indexes(&self) -> Vec<IndexDefinition> {
        self.inner.state.read().await.indexes.list_indexes()
    }

    /// Ids of documents whose text-indexed `field` contains every word of `text`.
    pub async fn search_text(&self, field: &str, text: &str) -> DocumentStoreResult<Vec<Document>> {
        let state = self.inner.state.read().await;
        let ids = state.indexes.search_text(field, text)?;
        state
            .positions(&ids)
            .into_iter()
            .filter_map(|position| state.documents.get_index(position))
            .map(|(_, stored)| stored.decode())
            .collect()
    }

    pub async fn compression_options(&self) -> CompressionOptions {
        self.inner.state.read().await.compression.options().clone()
    }

    /// New options apply to subsequent writes; existing documents keep their
    /// stored form until [`recompress_all`](Collection::recompress_all).
    pub async fn set_compression_options(&self, options: CompressionOptions) {
        self.inner.state.write().await.compression.set_options(options);
    }

    /// Re-encodes every stored document under the current options and returns
    /// how many changed form.
    pub async fn recompress_all(&self) -> DocumentStoreResult<usize> {
        let mut state = self.inner.state.write().await;
        let CollectionState {
            documents, compression, ..
        } = &mut *state;

        let mut changed = 0;
        for stored in documents.values_mut() {
            let fresh = compression.encode(&stored.decode()?)?;
            if mem::discriminant(&fresh) != mem::discriminant(&*stored) {
                changed += 1;
            }
            *stored = fresh;
        }

        log::debug!("recompressed {}: {} documents changed form", self.name(), changed);
        Ok(changed)
    }

    pub async fn compression_stats(&self) -> DocumentStoreResult<CompressionStats> {
        let state = self.inner.state.read().await;
        state.compression.stats(state.documents.values())
    }

    pub fn concurrency_options(&self) -> ConcurrencyOptions {
        self.inner.concurrency.options()
    }

    pub fn set_concurrency_options(&self, options: ConcurrencyOptions) {
        self.inner.concurrency.set_options(options);
    }

    pub fn concurrency_stats(&self) -> ConcurrencyStats {
        self.inner.concurrency.stats()
    }

    pub fn query_cache_options(&self) -> QueryCacheOptions {
        self.inner.cache.lock().options().clone()
    }

    pub fn set_query_cache_options(&self, options: QueryCacheOptions) {
        self.inner.cache.lock().set_options(options);
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.lock().stats()
    }

    /// Purges expired cache entries, drops empty index buckets and releases
    /// spare storage capacity.
    pub async fn optimize(&self) -> OptimizeStats {
        let mut state = self.inner.state.write().await;
        let empty_index_buckets = state.indexes.compact();
        state.documents.shrink_to_fit();
        let expired_cache_entries = self.inner.cache.lock().purge_expired();

        let stats = OptimizeStats {
            expired_cache_entries,
            empty_index_buckets,
        };
        log::debug!("optimized {}: {:?}", self.name(), stats);
        stats
    }

    /// Feeds the collection to `f` chunk by chunk and collects its outputs.
    ///
    /// The id list is captured up front; documents deleted before their
    /// chunk is reached are skipped. A `chunk_size` of 0 means 1000.
    pub async fn process_in_chunks<F, Fut, R>(&self, chunk_size: usize, mut f: F) -> DocumentStoreResult<Vec<R>>
    where
        F: FnMut(Vec<Document>) -> Fut,
        Fut: Future<Output = DocumentStoreResult<R>>,
    {
        let chunk_size = if chunk_size == 0 { DEFAULT_CHUNK_SIZE } else { chunk_size };
        let ids: Vec<String> = self.inner.state.read().await.documents.keys().cloned().collect();

        let mut outputs = Vec::with_capacity(ids.len().div_ceil(chunk_size));
        for chunk in ids.chunks(chunk_size) {
            let documents = {
                let state = self.inner.state.read().await;
                chunk
                    .iter()
                    .filter_map(|id| state.documents.get(id))
                    .map(StoredDocument::decode)
                    .collect::<DocumentStoreResult<Vec<_>>>()?
            };
            outputs.push(f(documents).await?);
        }
        Ok(outputs)
    }

    /// Replaces the contents with a loaded snapshot, bypassing plugins and
    /// notifications.
    pub(crate) async fn load(&self, documents: Vec<Document>) -> DocumentStoreResult<()> {
        let mut state = self.inner.state.write().await;
        let mut cache = self.inner.cache.lock();
        state.replace_all(&mut cache, self.name(), documents)
    }

    /// Replaces the contents with `documents` and notifies subscribers. The
    /// save signal is left alone since the new contents came from storage.
    pub(crate) async fn reload(&self, documents: Vec<Document>) -> DocumentStoreResult<()> {
        let commit = {
            let mut state = self.inner.state.write().await;
            let mut cache = self.inner.cache.lock();
            state.replace_all(&mut cache, self.name(), documents)?;
            drop(cache);

            if state.batch_depth > 0 {
                state.pending = true;
                Commit::default()
            } else {
                Commit {
                    notifications: state.notifications(&self.inner.subscriptions),
                }
            }
        };
        commit.deliver();
        Ok(())
    }

    pub(crate) async fn export(&self) -> DocumentStoreResult<Vec<Document>> {
        self.inner.state.read().await.all_documents()
    }

    pub(crate) fn detach(&self) {
        self.inner.subscriptions.lock().clear();
        self.inner.cache.lock().clear();
    }
}

fn first_error<T>(collection: &str, operation: &str, results: Vec<DocumentStoreResult<T>>) -> DocumentStoreResult<Vec<T>> {
    let total = results.len();
    let mut values = Vec::with_capacity(total);
    let mut first = None;

    for result in results {
        match result {
            Ok(value) => values.push(value),
            Err(err) => {
                first.get_or_insert(err);
            }
        }
    }

    match first {
        Some(err) => {
            log::debug!("{} on {}: {} of {} items failed", operation, collection, total - values.len(), total);
            Err(err)
        }
        None => Ok(values),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{index::IndexKind, query::SortDirection};
    use serde_json::json;

    fn collection() -> (Collection, Arc<SaveSignal>) {
        collection_with(CollectionOptions::default())
    }

    fn collection_with(options: CollectionOptions) -> (Collection, Arc<SaveSignal>) {
        let signal = Arc::new(SaveSignal::default());
        let collection = Collection::new("users", &options, PluginHost::default(), signal.clone());
        (collection, signal)
    }

    fn names(documents: &[Document]) -> Vec<&str> {
        documents
            .iter()
            .filter_map(|document| document.get("name").and_then(Value::as_str))
            .collect()
    }

    #[tokio::test]
    async fn test_insert_assigns_id_and_rejects_duplicates() {
        let (users, _) = collection();

        let alice = users.insert(json!({ "name": "Alice" })).await.unwrap();
        let id = alice.id().unwrap().to_string();
        assert!(Uuid::parse_str(&id).is_ok());

        let err = users.insert(json!({ "id": id, "name": "Again" })).await.unwrap_err();
        assert!(matches!(err, DocumentStoreError::DuplicateKey(..)));

        assert!(matches!(
            users.insert(json!({ "id": 5 })).await,
            Err(DocumentStoreError::InvalidDocument(_))
        ));
        assert_eq!(users.len().await, 1);
    }

    #[tokio::test]
    async fn test_find_update_delete_scenario() {
        let (users, _) = collection();
        users.insert(json!({ "name": "Alice", "age": 30 })).await.unwrap();
        users.insert(json!({ "name": "Bob", "age": 25 })).await.unwrap();

        let older = users.find(json!({ "age": { "$gt": 26 } })).await.unwrap();
        assert_eq!(names(&older), vec!["Alice"]);

        assert_eq!(users.update(json!({ "name": "Bob" }), json!({ "$set": { "age": 26 } })).await.unwrap(), 1);

        let both = users.find(json!({ "age": { "$gt": 25 } })).await.unwrap();
        assert_eq!(names(&both), vec!["Alice", "Bob"]);

        assert!(users.delete_one(json!({ "name": "Alice" })).await.unwrap());
        assert_eq!(users.count(json!({})).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_update_one_and_noop_rewrites() {
        let (users, _) = collection();
        for name in ["a", "b", "c"] {
            users.insert(json!({ "name": name, "group": 1 })).await.unwrap();
        }

        assert!(users.update_one(json!({ "group": 1 }), json!({ "$set": { "first": true } })).await.unwrap());
        assert_eq!(users.count(json!({ "first": true })).await.unwrap(), 1);
        assert_eq!(
            users.find_one(json!({ "first": true })).await.unwrap().and_then(|d| d.get("name").cloned()),
            Some(json!("a"))
        );

        assert_eq!(users.update(json!({ "group": 1 }), json!({ "$set": { "group": 1 } })).await.unwrap(), 3);
        assert_eq!(users.update(json!({ "group": 2 }), json!({ "$set": { "x": 1 } })).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cache_is_never_stale() {
        let (users, _) = collection();
        users.insert(json!({ "name": "Alice", "age": 17 })).await.unwrap();

        let query = json!({ "age": { "$gte": 18 } });
        assert!(users.find(query.clone()).await.unwrap().is_empty());
        assert!(users.find(query.clone()).await.unwrap().is_empty());
        assert_eq!(users.cache_stats().hit_count, 1);

        users.update(json!({ "name": "Alice" }), json!({ "$inc": { "age": 1 } })).await.unwrap();
        assert_eq!(users.find(query).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_indexed_and_scanned_results_agree() {
        let (users, _) = collection();
        for (name, age, city) in [("a", 30, "Oslo"), ("b", 25, "Oslo"), ("c", 35, "Bergen"), ("d", 30, "Bergen")] {
            users.insert(json!({ "name": name, "age": age, "city": city })).await.unwrap();
        }

        let queries = [
            json!({ "age": 30 }),
            json!({ "age": { "$gte": 30 }, "city": "Oslo" }),
            json!({ "$or": [{ "age": 25 }, { "city": "Bergen" }] }),
        ];
        let mut scanned = Vec::new();
        for query in &queries {
            scanned.push(users.find(query.clone()).await.unwrap());
        }

        users.create_index(IndexDefinition::single("by_age", "age")).await.unwrap();
        users.create_index(IndexDefinition::single("by_city", "city")).await.unwrap();
        users.set_query_cache_options(QueryCacheOptions::disabled());

        for (query, expected) in queries.iter().zip(scanned) {
            assert_eq!(users.find(query.clone()).await.unwrap(), expected, "query {}", query);
        }
    }

    async fn assert_indexes_agree(users: &Collection, queries: &[Value]) {
        let everything = users.find(json!({})).await.unwrap();
        for query in queries {
            let parsed = Query::parse(query).unwrap();
            let expected: Vec<Document> = everything.iter().filter(|d| parsed.matches(d)).cloned().collect();
            assert_eq!(users.find(query.clone()).await.unwrap(), expected, "query {}", query);
        }
    }

    #[tokio::test]
    async fn test_indexes_follow_writes() {
        let (users, _) = collection_with(CollectionOptions {
            indexes: vec![
                IndexDefinition::single("by_age", "age"),
                IndexDefinition::compound("by_city_age", ["city", "age"]),
                IndexDefinition::unique("by_email", ["email"]),
                IndexDefinition::text("bio_text", ["bio"]),
            ],
            query_cache: QueryCacheOptions::disabled(),
            ..CollectionOptions::default()
        });
        let queries = [
            json!({ "age": { "$gt": 30 } }),
            json!({ "age": { "$lt": 31 } }),
            json!({ "age": { "$gte": 31, "$lte": 40 } }),
            json!({ "age": 31 }),
            json!({ "city": "Oslo", "age": { "$gt": 25 } }),
            json!({ "city": "Bergen" }),
            json!({ "age": { "$in": [26, 40] } }),
            json!({ "$or": [{ "age": 40 }, { "city": "Bergen" }] }),
            json!({ "bio": { "$regex": "rust" } }),
            json!({ "email": "a@example.com" }),
            json!({ "age": { "$gt": 9_007_199_254_740_992_u64 } }),
            json!({ "age": 9_007_199_254_740_993_u64 }),
        ];

        for (name, age, city, bio) in [
            ("a", json!(30), "Oslo", "rust and tea"),
            ("b", json!(25), "Oslo", "hiking"),
            ("c", json!(35.0), "Bergen", "rust meetups"),
            ("d", json!(9_007_199_254_740_992_u64), "Bergen", "maps"),
            ("e", json!(9_007_199_254_740_993_u64), "Oslo", "chess"),
            ("f", json!(31), "Bergen", "rust"),
        ] {
            let email = format!("{}@example.com", name);
            users
                .insert(json!({ "name": name, "age": age, "city": city, "email": email, "bio": bio }))
                .await
                .unwrap();
        }
        assert_indexes_agree(&users, &queries).await;

        users.update(json!({ "city": "Oslo" }), json!({ "$inc": { "age": 1 } })).await.unwrap();
        users
            .update(json!({ "name": "c" }), json!({ "$set": { "age": 40, "city": "Oslo", "bio": "tea" } }))
            .await
            .unwrap();
        users.update(json!({ "name": "d" }), json!({ "$unset": { "age": "" } })).await.unwrap();
        users
            .update(json!({ "name": "b" }), json!({ "$set": { "email": "moved@example.com", "bio": "Rust evenings" } }))
            .await
            .unwrap();
        assert_indexes_agree(&users, &queries).await;

        users.delete(json!({ "age": { "$lt": 31 } })).await.unwrap();
        users.delete_one(json!({ "name": "f" })).await.unwrap();
        users
            .insert(json!({ "name": "g", "age": 31, "city": "Bergen", "email": "b@example.com", "bio": "rust" }))
            .await
            .unwrap();
        assert_indexes_agree(&users, &queries).await;
        assert_eq!(names(&users.find(json!({ "email": "b@example.com" })).await.unwrap()), vec!["g"]);
    }

    #[tokio::test]
    async fn test_unique_index_separates_large_integers() {
        let (ledger, _) = collection_with(CollectionOptions {
            indexes: vec![IndexDefinition::unique("by_seq", ["seq"])],
            ..CollectionOptions::default()
        });

        ledger.insert(json!({ "seq": 9_007_199_254_740_992_u64 })).await.unwrap();
        ledger.insert(json!({ "seq": 9_007_199_254_740_993_u64 })).await.unwrap();
        assert!(matches!(
            ledger.insert(json!({ "seq": 9_007_199_254_740_992.0 })).await,
            Err(DocumentStoreError::UniqueConstraint { .. })
        ));

        let above = ledger.find(json!({ "seq": { "$gt": 9_007_199_254_740_992_u64 } })).await.unwrap();
        assert_eq!(above.len(), 1);
        assert_eq!(above[0].get("seq"), Some(&json!(9_007_199_254_740_993_u64)));
    }

    #[tokio::test]
    async fn test_rejected_reload_keeps_contents() {
        let (users, signal) = collection_with(CollectionOptions {
            indexes: vec![IndexDefinition::unique("by_email", ["email"])],
            ..CollectionOptions::default()
        });
        users.insert(json!({ "id": "a", "email": "a@example.com" })).await.unwrap();
        let requests = signal.requests();

        let clashing = [json!({ "id": "x", "email": "same" }), json!({ "id": "y", "email": "same" })]
            .into_iter()
            .map(|value| Document::from_value(value).unwrap())
            .collect();
        assert!(users.reload(clashing).await.is_err());
        assert_eq!(users.find(json!({ "email": "a@example.com" })).await.unwrap().len(), 1);
        assert_eq!(users.len().await, 1);

        let fresh = vec![Document::from_value(json!({ "id": "b", "email": "a@example.com" })).unwrap()];
        users.reload(fresh).await.unwrap();
        let found = users.find(json!({ "email": "a@example.com" })).await.unwrap();
        assert_eq!(found.iter().filter_map(Document::id).collect::<Vec<_>>(), vec!["b"]);
        assert!(users.get("a").await.unwrap().is_none());
        assert_eq!(signal.requests(), requests);
    }

    #[tokio::test]
    async fn test_unique_index_rejects_before_commit() {
        let (users, signal) = collection();
        users
            .configure(CollectionOptions {
                indexes: vec![IndexDefinition::unique("by_email", ["email"])],
                ..CollectionOptions::default()
            })
            .await
            .unwrap();

        users.insert(json!({ "email": "a@x" })).await.unwrap();
        let requests = signal.requests();

        let err = users.insert(json!({ "email": "a@x" })).await.unwrap_err();
        assert!(matches!(err, DocumentStoreError::UniqueConstraint { .. }));
        assert_eq!(users.len().await, 1);
        assert_eq!(signal.requests(), requests);

        let b = users.insert(json!({ "email": "b@x" })).await.unwrap();
        let err = users
            .update(json!({ "id": b.id() }), json!({ "$set": { "email": "a@x" } }))
            .await
            .unwrap_err();
        assert!(matches!(err, DocumentStoreError::UniqueConstraint { .. }));
        assert_eq!(users.count(json!({ "email": "b@x" })).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_batch_notifies_once() {
        let (users, signal) = collection();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        users
            .subscribe(json!({}), move |documents| sink.lock().push(documents.len()))
            .unwrap();

        users.begin_batch().await;
        users.insert(json!({ "name": "a" })).await.unwrap();
        users.insert(json!({ "name": "b" })).await.unwrap();
        assert!(calls.lock().is_empty());
        assert_eq!(signal.requests(), 0);
        users.end_batch().await;

        assert_eq!(*calls.lock(), vec![2]);
        assert_eq!(signal.requests(), 1);

        users.end_batch().await;
        assert_eq!(signal.requests(), 1);
    }

    #[tokio::test]
    async fn test_nested_and_empty_batches() {
        let (users, signal) = collection();

        users.begin_batch().await;
        users.begin_batch().await;
        users.insert(json!({ "name": "a" })).await.unwrap();
        users.end_batch().await;
        assert_eq!(signal.requests(), 0);
        users.end_batch().await;
        assert_eq!(signal.requests(), 1);

        users.begin_batch().await;
        users.end_batch().await;
        assert_eq!(signal.requests(), 1);
    }

    #[tokio::test]
    async fn test_subscription_sees_full_match_set() {
        let (users, _) = collection();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = users
            .subscribe(json!({ "active": true }), move |documents| {
                sink.lock().push(names(documents).into_iter().map(String::from).collect::<Vec<_>>())
            })
            .unwrap();

        users.insert(json!({ "name": "a", "active": true })).await.unwrap();
        users.insert(json!({ "name": "b", "active": false })).await.unwrap();
        users.unsubscribe(&id).unwrap();
        users.insert(json!({ "name": "c", "active": true })).await.unwrap();

        assert_eq!(*seen.lock(), vec![vec!["a".to_string()], vec!["a".to_string()]]);
        assert!(matches!(users.unsubscribe(&id), Err(DocumentStoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_batch_operations_report_first_error() {
        let (users, signal) = collection();

        let err = users
            .insert_batch([json!({ "id": "1" }), json!({ "id": "1" }), json!({ "id": "2" })])
            .await
            .unwrap_err();
        assert!(matches!(err, DocumentStoreError::DuplicateKey(..)));
        assert_eq!(users.len().await, 2);
        assert_eq!(signal.requests(), 1);

        let updated = users
            .update_batch([
                (json!({ "id": "1" }), json!({ "$set": { "n": 1 } })),
                (json!({ "id": "2" }), json!({ "$set": { "n": 2 } })),
            ])
            .await
            .unwrap();
        assert_eq!(updated, 2);

        let deleted = users.delete_batch([json!({ "n": 1 }), json!({ "n": 2 })]).await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(signal.requests(), 3);
    }

    #[tokio::test]
    async fn test_find_with_options_and_pages() {
        let (users, _) = collection();
        for (name, age) in [("a", 3), ("b", 1), ("c", 2), ("d", 5)] {
            users.insert(json!({ "name": name, "age": age })).await.unwrap();
        }
        users.insert(json!({ "name": "e" })).await.unwrap();

        let options = FindOptions::builder().sort("age", SortDirection::Desc).offset(1).limit(2).build();
        let sorted = users.find_with(json!({}), &options).await.unwrap();
        assert_eq!(names(&sorted), vec!["a", "c"]);

        let page = users.find_page(json!({}), &PaginationParams::new(2, 2)).await.unwrap();
        assert_eq!(names(&page.items), vec!["c", "d"]);
        assert_eq!(page.count, 5);
        assert_eq!(page.next_page, Some(3));
    }

    #[tokio::test]
    async fn test_compression_round_trip_and_recompress() {
        let (docs, _) = collection();
        let body = "x".repeat(4096);
        docs.insert(json!({ "id": "big", "body": body })).await.unwrap();
        assert_eq!(docs.compression_stats().await.unwrap().compressed, 0);

        docs.set_compression_options(CompressionOptions::enabled()).await;
        assert_eq!(docs.recompress_all().await.unwrap(), 1);
        assert_eq!(docs.compression_stats().await.unwrap().compressed, 1);

        let found = docs.find(json!({ "body": { "$regex": "^x+$" } })).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(docs.get("big").await.unwrap().and_then(|d| d.get("body").cloned()), Some(json!(body)));

        docs.set_compression_options(CompressionOptions::default()).await;
        assert_eq!(docs.get("big").await.unwrap().map(|d| d.len()), Some(2));
    }

    #[tokio::test]
    async fn test_search_text_and_optimize() {
        let (posts, _) = collection();
        posts.create_index(IndexDefinition::new("body_text", ["body"], IndexKind::Text)).await.unwrap();
        posts.insert(json!({ "name": "a", "body": "Rust and sqlite" })).await.unwrap();
        posts.insert(json!({ "name": "b", "body": "just rust" })).await.unwrap();
        posts.delete(json!({ "name": "a" })).await.unwrap();

        assert_eq!(names(&posts.search_text("body", "rust").await.unwrap()), vec!["b"]);
        assert!(posts.optimize().await.empty_index_buckets >= 2);
        assert_eq!(posts.indexes().await.len(), 1);
        posts.drop_index("body_text").await.unwrap();
        assert!(posts.indexes().await.is_empty());
    }

    #[tokio::test]
    async fn test_process_in_chunks() {
        let (users, _) = collection();
        users.insert_batch((0..7).map(|n| json!({ "n": n }))).await.unwrap();

        let sizes = users
            .process_in_chunks(3, |chunk| async move { Ok(chunk.len()) })
            .await
            .unwrap();
        assert_eq!(sizes, vec![3, 3, 1]);

        let all = users.process_in_chunks(0, |chunk| async move { Ok(chunk.len()) }).await.unwrap();
        assert_eq!(all, vec![7]);
    }

    #[tokio::test]
    async fn test_options_deserialize_from_partial_json() {
        let options: CollectionOptions = serde_json::from_value(json!({
            "indexes": [{ "name": "by_age", "fields": ["age"], "type": "single" }],
            "queryCache": { "maxSize": 5 },
            "concurrency": { "enabled": true, "maxConcurrency": 8 }
        }))
        .unwrap();

        assert_eq!(options.query_cache.max_size, 5);
        assert!(options.query_cache.enabled);
        assert_eq!(options.concurrency.max_concurrency, 8);
        assert_eq!(options.concurrency.initial_concurrency, 4);
        assert!(!options.compression.enabled);

        let (users, _) = collection_with(options.clone());
        users.configure(options).await.unwrap();
        assert_eq!(users.indexes().await.len(), 1);
        assert!(users.concurrency_stats().enabled);
    }
}
