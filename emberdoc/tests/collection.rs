use emberdoc::{memory::InMemoryStore, prelude::*};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;

async fn store() -> DocumentStore {
    DocumentStore::builder(InMemoryStore::new()).build().await.unwrap()
}

fn names(documents: &[Document]) -> Vec<String> {
    documents
        .iter()
        .filter_map(|document| document.get("name").and_then(Value::as_str).map(String::from))
        .collect()
}

#[tokio::test]
async fn test_alice_and_bob() {
    let store = store().await;
    let users = store.collection("users").await.unwrap();

    users.insert(json!({ "name": "Alice", "age": 30 })).await.unwrap();
    users.insert(json!({ "name": "Bob", "age": 25 })).await.unwrap();

    let older = users.find(json!({ "age": { "$gt": 26 } })).await.unwrap();
    assert_eq!(names(&older), vec!["Alice"]);

    let affected = users
        .update(json!({ "name": "Bob" }), json!({ "$set": { "age": 26 } }))
        .await
        .unwrap();
    assert_eq!(affected, 1);

    let both = users.find(json!({ "age": { "$gt": 25 } })).await.unwrap();
    assert_eq!(names(&both), vec!["Alice", "Bob"]);

    assert!(users.delete_one(json!({ "name": "Alice" })).await.unwrap());
    assert_eq!(users.count(json!({})).await.unwrap(), 1);
}

#[tokio::test]
async fn test_batch_notifies_and_signals_once() {
    let store = store().await;
    let items = store.collection("items").await.unwrap();

    let notifications = Arc::new(Mutex::new(Vec::new()));
    let sink = notifications.clone();
    items
        .subscribe(json!({}), move |documents| sink.lock().push(names(documents)))
        .unwrap();

    let before = store.save_requests();
    items.begin_batch().await;
    items.insert(json!({ "name": "a" })).await.unwrap();
    items.insert(json!({ "name": "b" })).await.unwrap();
    items.end_batch().await;

    assert_eq!(*notifications.lock(), vec![vec!["a".to_string(), "b".to_string()]]);
    assert_eq!(store.save_requests(), before + 1);
    assert!(store.is_dirty());
}

#[tokio::test]
async fn test_unique_index_keeps_one_document() {
    let store = store().await;
    let users = store
        .collection_with_options(
            "users",
            CollectionOptions {
                indexes: vec![IndexDefinition::unique("by_email", ["email"])],
                ..CollectionOptions::default()
            },
        )
        .await
        .unwrap();

    users.insert(json!({ "email": "a@example.com" })).await.unwrap();
    let err = users.insert(json!({ "email": "a@example.com" })).await.unwrap_err();

    assert!(matches!(err, DocumentStoreError::UniqueConstraint { ref index, .. } if index == "by_email"));
    assert_eq!(users.len().await, 1);
}

#[tokio::test]
async fn test_operator_free_equality_and_composition() {
    let store = store().await;
    let things = store.collection("things").await.unwrap();
    things.insert(json!({ "name": "x", "n": 1, "tags": ["red", "blue"] })).await.unwrap();
    things.insert(json!({ "name": "y", "n": 2, "tags": ["green"] })).await.unwrap();
    things.insert(json!({ "name": "z", "meta": { "n": 1 } })).await.unwrap();

    let implicit = things.find(json!({ "n": 1 })).await.unwrap();
    let explicit = things.find(json!({ "n": { "$eq": 1 } })).await.unwrap();
    assert_eq!(implicit, explicit);

    assert_eq!(names(&things.find(json!({ "tags": ["red", "blue"] })).await.unwrap()), vec!["x"]);
    assert_eq!(names(&things.find(json!({ "meta.n": 1 })).await.unwrap()), vec!["z"]);

    let negated = things.find(json!({ "$not": { "n": 1 } })).await.unwrap();
    assert_eq!(names(&negated), vec!["y", "z"]);

    let conjunction = things
        .find(json!({ "$and": [{ "n": { "$gte": 1 } }, { "name": { "$in": ["y", "q"] } }] }))
        .await
        .unwrap();
    assert_eq!(names(&conjunction), vec!["y"]);

    let typed = things.find(Filter::or([Filter::eq("n", 2), Filter::exists("meta")])).await.unwrap();
    assert_eq!(names(&typed), vec!["y", "z"]);
}

#[tokio::test]
async fn test_update_operators() {
    let store = store().await;
    let users = store.collection("users").await.unwrap();
    users
        .insert(json!({ "id": "u1", "name": "Ann", "tags": ["a", "b", "a"], "visits": 1, "tmp": true }))
        .await
        .unwrap();

    let update = Update::new()
        .set("profile.city", "Oslo")
        .unset("tmp")
        .inc("visits", 2)
        .push("log", "login")
        .pull("tags", "a");
    users.update(json!({ "id": "u1" }), update).await.unwrap();

    let ann = users.get("u1").await.unwrap().unwrap();
    assert_eq!(ann.get("profile.city"), Some(&json!("Oslo")));
    assert_eq!(ann.get("tmp"), None);
    assert_eq!(ann.get("visits"), Some(&json!(3)));
    assert_eq!(ann.get("log"), Some(&json!(["login"])));
    assert_eq!(ann.get("tags"), Some(&json!(["b"])));

    let once = json!({ "$set": { "name": "Anna" } });
    users.update(json!({ "id": "u1" }), once.clone()).await.unwrap();
    let first = users.get("u1").await.unwrap();
    users.update(json!({ "id": "u1" }), once).await.unwrap();
    assert_eq!(users.get("u1").await.unwrap(), first);

    let err = users
        .update(json!({ "id": "u1" }), json!({ "$inc": { "name": 1 } }))
        .await
        .unwrap_err();
    assert!(matches!(err, DocumentStoreError::Type(_)));

    let err = users
        .update(json!({ "id": "u1" }), json!({ "$set": { "id": "other" } }))
        .await
        .unwrap_err();
    assert!(matches!(err, DocumentStoreError::Query(_)));
}

#[tokio::test]
async fn test_malformed_queries_are_rejected() {
    let store = store().await;
    let users = store.collection("users").await.unwrap();

    assert!(matches!(
        users.find(json!({ "age": { "$between": [1, 2] } })).await,
        Err(DocumentStoreError::Query(_))
    ));
    assert!(matches!(users.find(json!([1, 2])).await, Err(DocumentStoreError::Query(_))));
    assert!(matches!(
        users.update(json!({}), json!({ "$rename": { "a": "b" } })).await,
        Err(DocumentStoreError::Query(_))
    ));
}

#[tokio::test]
async fn test_insert_batch_with_adaptive_concurrency() {
    let store = store().await;
    let events = store
        .collection_with_options(
            "events",
            CollectionOptions {
                concurrency: ConcurrencyOptions {
                    max_concurrency: 4,
                    ..ConcurrencyOptions::enabled()
                },
                ..CollectionOptions::default()
            },
        )
        .await
        .unwrap();

    let inserted = events
        .insert_batch((0..50).map(|n| json!({ "seq": n })))
        .await
        .unwrap();
    assert_eq!(inserted.len(), 50);
    assert_eq!(events.len().await, 50);

    let stats = events.concurrency_stats();
    assert!(stats.enabled);
    assert_eq!(stats.in_flight, 0);
    assert!((1..=4).contains(&stats.current_limit));

    let seqs: Vec<i64> = events
        .find_with(json!({}), &FindOptions::builder().sort("seq", SortDirection::Asc).limit(3).build())
        .await
        .unwrap()
        .iter()
        .filter_map(|document| document.get("seq").and_then(Value::as_i64))
        .collect();
    assert_eq!(seqs, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_cache_stats_track_hits() {
    let store = store().await;
    let users = store.collection("users").await.unwrap();
    users.insert(json!({ "name": "Alice" })).await.unwrap();

    for _ in 0..3 {
        users.find(json!({ "name": "Alice" })).await.unwrap();
    }
    let stats = users.cache_stats();
    assert_eq!(stats.miss_count, 1);
    assert_eq!(stats.hit_count, 2);

    users.insert(json!({ "name": "Alice" })).await.unwrap();
    assert_eq!(users.find(json!({ "name": "Alice" })).await.unwrap().len(), 2);
}
