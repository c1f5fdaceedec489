//! Live queries.
//!
//! A subscription pairs a query with a callback. After every commit the
//! collection asks the registry for the current subscribers and invokes each
//! callback with the full match set, outside of any lock.

use indexmap::IndexMap;
use std::{fmt, sync::Arc};
use uuid::Uuid;

use crate::{
    document::Document,
    error::{DocumentStoreError, DocumentStoreResult},
    query::Query,
};

/// Callback invoked with the current match set of a subscription.
pub type SubscriptionCallback = Arc<dyn Fn(&[Document]) + Send + Sync>;

#[derive(Clone)]
pub struct Subscription {
    id: String,
    query: Query,
    callback: SubscriptionCallback,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn notify(&self, documents: &[Document]) {
        (self.callback)(documents)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("query", &self.query.fingerprint())
            .finish_non_exhaustive()
    }
}

/// Subscriptions of one collection, in registration order.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    subscriptions: IndexMap<String, Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, query: Query, callback: SubscriptionCallback) -> String {
        let id = Uuid::new_v4().to_string();
        self.subscriptions.insert(
            id.clone(),
            Subscription {
                id: id.clone(),
                query,
                callback,
            },
        );
        id
    }

    pub fn unsubscribe(&mut self, id: &str) -> DocumentStoreResult<()> {
        self.subscriptions
            .shift_remove(id)
            .map(|_| ())
            .ok_or_else(|| DocumentStoreError::NotFound(format!("subscription {}", id)))
    }

    /// Cloned handles, so callbacks can run after the registry lock is gone.
    pub fn snapshot(&self) -> Vec<Subscription> {
        self.subscriptions.values().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.subscriptions.clear();
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let mut registry = SubscriptionRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let id = registry.subscribe(
            Query::all(),
            Arc::new(move |documents: &[Document]| sink.lock().push(documents.len())),
        );

        for subscription in registry.snapshot() {
            subscription.notify(&[Document::from_value(json!({ "id": "1" })).unwrap()]);
        }
        assert_eq!(*seen.lock(), vec![1]);

        registry.unsubscribe(&id).unwrap();
        assert!(registry.is_empty());
        assert!(matches!(registry.unsubscribe(&id), Err(DocumentStoreError::NotFound(_))));
    }
}
