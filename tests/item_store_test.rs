//! Content-addressed item store against the in-memory backend.

use std::sync::Arc;

use chartflow::identity::identity;
use chartflow::model::{Attributes, merge_attributes};
use chartflow::store::ItemStore;
use chartflow::store::memory::MemoryStore;
use serde_json::{Value, json};

fn attrs(value: Value) -> Attributes {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}

#[tokio::test]
async fn upsert_twice_creates_once() {
    let store = MemoryStore::new();
    let id = identity("Bohemian Rhapsody", "Queen");
    let a = attrs(json!({"title": "Bohemian Rhapsody", "artist": "Queen", "rank": 1}));

    let first = store.upsert_item(&id, &a).await.unwrap();
    let second = store.upsert_item(&id, &a).await.unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.item_id, id);
    assert_eq!(store.item_count(), 1);
}

#[tokio::test]
async fn normalized_variants_share_one_item() {
    let store = MemoryStore::new();
    let a = identity("Bohemian Rhapsody", "Queen");
    let b = identity("bohemian   rhapsody", "QUEEN");

    store
        .upsert_item(&a, &attrs(json!({"title": "Bohemian Rhapsody"})))
        .await
        .unwrap();
    let second = store
        .upsert_item(&b, &attrs(json!({"label": "EMI"})))
        .await
        .unwrap();

    assert!(!second.created);
    let item = store.get_item(&a).await.unwrap().unwrap();
    assert_eq!(item.attributes["title"], "Bohemian Rhapsody");
    assert_eq!(item.attributes["label"], "EMI");
}

#[tokio::test]
async fn empty_value_never_overwrites() {
    let store = MemoryStore::new();
    let id = identity("Let It Be", "The Beatles");

    store
        .upsert_item(&id, &attrs(json!({"youtube_video_id": "A"})))
        .await
        .unwrap();
    store
        .upsert_item(&id, &attrs(json!({"youtube_video_id": ""})))
        .await
        .unwrap();
    store
        .upsert_item(&id, &attrs(json!({"youtube_video_id": null})))
        .await
        .unwrap();

    let item = store.get_item(&id).await.unwrap().unwrap();
    assert_eq!(item.attributes["youtube_video_id"], "A");
}

#[tokio::test]
async fn whitespace_only_values_count_as_empty() {
    let store = MemoryStore::new();
    let id = identity("Avril 14th", "Aphex Twin");

    store
        .upsert_item(&id, &attrs(json!({"label": "\t\n", "genre": "Ambient"})))
        .await
        .unwrap();
    store
        .upsert_item(&id, &attrs(json!({"label": "Warp", "genre": "\t"})))
        .await
        .unwrap();

    let item = store.get_item(&id).await.unwrap().unwrap();
    assert_eq!(item.attributes["label"], "Warp");
    assert_eq!(item.attributes["genre"], "Ambient");
}

#[tokio::test]
async fn present_value_is_not_replaced() {
    let store = MemoryStore::new();
    let id = identity("Let It Be", "The Beatles");

    store
        .upsert_item(&id, &attrs(json!({"genre": "Rock"})))
        .await
        .unwrap();
    store
        .upsert_item(&id, &attrs(json!({"genre": "Pop", "label": "Apple"})))
        .await
        .unwrap();

    let item = store.get_item(&id).await.unwrap().unwrap();
    assert_eq!(item.attributes["genre"], "Rock");
    assert_eq!(item.attributes["label"], "Apple");
}

#[tokio::test]
async fn empty_stored_value_gets_filled() {
    let store = MemoryStore::new();
    let id = identity("Windowlicker", "Aphex Twin");

    store
        .upsert_item(&id, &attrs(json!({"title": "Windowlicker"})))
        .await
        .unwrap();
    let item = store.get_item(&id).await.unwrap().unwrap();
    assert!(!item.attributes.contains_key("youtube_video_id"));

    store
        .upsert_item(&id, &attrs(json!({"youtube_video_id": "5ZT3gTu4Sjw"})))
        .await
        .unwrap();
    let item = store.get_item(&id).await.unwrap().unwrap();
    assert_eq!(item.attributes["youtube_video_id"], "5ZT3gTu4Sjw");
    assert!(item.updated_at >= item.created_at);
}

#[tokio::test]
async fn get_unknown_item_is_none() {
    let store = MemoryStore::new();
    let missing = identity("Nothing", "Nobody");
    assert!(store.get_item(&missing).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_upserts_converge() {
    let store = Arc::new(MemoryStore::new());
    let id = identity("One More Time", "Daft Punk");

    let handles: Vec<_> = (0..12)
        .map(|n| {
            let store = Arc::clone(&store);
            let id = id.clone();
            tokio::spawn(async move {
                let mut a = attrs(json!({"title": "One More Time"}));
                a.insert(format!("field_{}", n % 4), json!(n));
                store.upsert_item(&id, &a).await.unwrap()
            })
        })
        .collect();

    let mut created = 0;
    for handle in handles {
        if handle.await.unwrap().created {
            created += 1;
        }
    }

    assert_eq!(created, 1);
    assert_eq!(store.item_count(), 1);
    let item = store.get_item(&id).await.unwrap().unwrap();
    for n in 0..4 {
        assert!(item.attributes.contains_key(&format!("field_{n}")));
    }
}

#[test]
fn merge_is_fill_only_and_reports_changes() {
    let mut stored = attrs(json!({"a": "kept", "b": "", "c": []}));
    let incoming = attrs(json!({"a": "new", "b": "filled", "c": [1], "d": {}}));

    assert!(merge_attributes(&mut stored, &incoming));
    assert_eq!(stored["a"], "kept");
    assert_eq!(stored["b"], "filled");
    assert_eq!(stored["c"], json!([1]));
    assert!(!stored.contains_key("d"));

    // Applying the same merge again changes nothing.
    assert!(!merge_attributes(&mut stored, &incoming));
}
