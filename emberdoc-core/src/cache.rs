//! Query result cache keyed by query fingerprint.

use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::{
    num::NonZeroUsize,
    time::{Duration, Instant},
};

use crate::{document::Document, query::Query};

/// Query cache settings for a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueryCacheOptions {
    pub enabled: bool,
    pub max_size: usize,
    pub ttl_ms: u64,
}

impl Default for QueryCacheOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 100,
            ttl_ms: 60_000,
        }
    }
}

impl QueryCacheOptions {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    query: Query,
    documents: Vec<Document>,
    inserted: Instant,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub hit_count: u64,
    pub miss_count: u64,
    pub size: usize,
    pub capacity: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hit_count + self.miss_count;
        if total == 0 {
            0.0
        } else {
            self.hit_count as f64 / total as f64
        }
    }
}

/// LRU cache of query results with a time-to-live.
#[derive(Debug)]
pub struct QueryCache {
    options: QueryCacheOptions,
    entries: Option<LruCache<String, CacheEntry>>,
    hit_count: u64,
    miss_count: u64,
}

impl QueryCache {
    pub fn new(options: QueryCacheOptions) -> Self {
        let entries = Self::storage(&options);
        Self {
            options,
            entries,
            hit_count: 0,
            miss_count: 0,
        }
    }

    fn storage(options: &QueryCacheOptions) -> Option<LruCache<String, CacheEntry>> {
        if !options.enabled {
            return None;
        }
        NonZeroUsize::new(options.max_size).map(LruCache::new)
    }

    pub fn options(&self) -> &QueryCacheOptions {
        &self.options
    }

    /// Applies new options. Disabling drops every entry; shrinking evicts the
    /// least recently used ones.
    pub fn set_options(&mut self, options: QueryCacheOptions) {
        let capacity = NonZeroUsize::new(options.max_size).filter(|_| options.enabled);
        let resized = match (self.entries.as_mut(), capacity) {
            (Some(entries), Some(capacity)) => {
                entries.resize(capacity);
                true
            }
            _ => false,
        };
        if !resized {
            self.entries = Self::storage(&options);
        }
        self.options = options;
    }

    pub fn is_enabled(&self) -> bool {
        self.entries.is_some()
    }

    /// Returns the cached result for a fingerprint. Expired entries count as
    /// misses and are removed.
    pub fn get(&mut self, fingerprint: &str) -> Option<Vec<Document>> {
        let ttl = self.options.ttl();
        let entries = self.entries.as_mut()?;

        let expired = entries.peek(fingerprint).map(|entry| entry.inserted.elapsed() > ttl);
        let fresh = match expired {
            Some(false) => entries.get(fingerprint).map(|entry| entry.documents.clone()),
            Some(true) => {
                entries.pop(fingerprint);
                None
            }
            None => None,
        };

        match fresh {
            Some(documents) => {
                self.hit_count += 1;
                Some(documents)
            }
            None => {
                self.miss_count += 1;
                None
            }
        }
    }

    pub fn put(&mut self, query: &Query, documents: Vec<Document>) {
        if let Some(entries) = self.entries.as_mut() {
            entries.put(
                query.fingerprint().to_string(),
                CacheEntry {
                    query: query.clone(),
                    documents,
                    inserted: Instant::now(),
                },
            );
        }
    }

    /// Drops every entry whose query satisfies `affected`.
    pub fn invalidate(&mut self, affected: impl Fn(&Query) -> bool) -> usize {
        let Some(entries) = self.entries.as_mut() else {
            return 0;
        };

        let stale: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| affected(&entry.query))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &stale {
            entries.pop(key);
        }
        stale.len()
    }

    /// Drops entries whose result could change because a document moved
    /// from `old` to `new`.
    pub fn invalidate_document(&mut self, old: Option<&Document>, new: Option<&Document>) -> usize {
        self.invalidate(|query| {
            old.is_some_and(|document| query.matches(document)) || new.is_some_and(|document| query.matches(document))
        })
    }

    pub fn clear(&mut self) {
        if let Some(entries) = self.entries.as_mut() {
            entries.clear();
        }
    }

    /// Removes expired entries, returning how many were dropped.
    pub fn purge_expired(&mut self) -> usize {
        let ttl = self.options.ttl();
        let Some(entries) = self.entries.as_mut() else {
            return 0;
        };

        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.inserted.elapsed() > ttl)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, LruCache::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hit_count: self.hit_count,
            miss_count: self.miss_count,
            size: self.len(),
            capacity: if self.is_enabled() { self.options.max_size } else { 0 },
        }
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(QueryCacheOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn query(value: serde_json::Value) -> Query {
        Query::parse(&value).unwrap()
    }

    fn doc(value: serde_json::Value) -> Document {
        Document::from_value(value).unwrap()
    }

    #[test]
    fn test_hit_and_miss_counting() {
        let mut cache = QueryCache::default();
        let q = query(json!({ "name": "Alice" }));

        assert!(cache.get(q.fingerprint()).is_none());
        cache.put(&q, vec![doc(json!({ "id": "1", "name": "Alice" }))]);
        assert_eq!(cache.get(q.fingerprint()).map(|docs| docs.len()), Some(1));

        let stats = cache.stats();
        assert_eq!((stats.hit_count, stats.miss_count), (1, 1));
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[test]
    fn test_lru_eviction() {
        let mut cache = QueryCache::new(QueryCacheOptions {
            max_size: 2,
            ..QueryCacheOptions::default()
        });
        let (a, b, c) = (query(json!({ "a": 1 })), query(json!({ "b": 1 })), query(json!({ "c": 1 })));

        cache.put(&a, vec![]);
        cache.put(&b, vec![]);
        cache.get(a.fingerprint());
        cache.put(&c, vec![]);

        assert!(cache.get(a.fingerprint()).is_some());
        assert!(cache.get(b.fingerprint()).is_none());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_expired_entries_are_misses() {
        let mut cache = QueryCache::new(QueryCacheOptions {
            ttl_ms: 1,
            ..QueryCacheOptions::default()
        });
        let q = query(json!({}));

        cache.put(&q, vec![]);
        std::thread::sleep(Duration::from_millis(5));

        assert!(cache.get(q.fingerprint()).is_none());
        assert!(cache.is_empty());

        cache.put(&q, vec![]);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.purge_expired(), 1);
    }

    #[test]
    fn test_invalidate_document_is_exact() {
        let mut cache = QueryCache::default();
        let adults = query(json!({ "age": { "$gte": 18 } }));
        let oslo = query(json!({ "city": "Oslo" }));
        cache.put(&adults, vec![]);
        cache.put(&oslo, vec![]);

        let old = doc(json!({ "id": "1", "age": 17, "city": "Bergen" }));
        let new = doc(json!({ "id": "1", "age": 18, "city": "Bergen" }));

        assert_eq!(cache.invalidate_document(Some(&old), Some(&new)), 1);
        assert!(cache.get(oslo.fingerprint()).is_some());
        assert!(cache.get(adults.fingerprint()).is_none());
    }

    #[test]
    fn test_disabled_cache_stores_nothing() {
        let mut cache = QueryCache::new(QueryCacheOptions::disabled());
        let q = query(json!({}));
        cache.put(&q, vec![]);

        assert!(cache.get(q.fingerprint()).is_none());
        assert_eq!(cache.stats(), CacheStats::default());

        cache.set_options(QueryCacheOptions::default());
        cache.put(&q, vec![]);
        assert!(cache.get(q.fingerprint()).is_some());
    }
}
