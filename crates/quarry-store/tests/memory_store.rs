#![cfg(feature = "memory")]

use bson::{Bson, doc};
use quarry_store::{
    ChangeStreamDocument, CreateOptions, DocumentAccess, MemoryAccess, MemoryStore, Namespace,
    Storage, StoreError, StreamOptions, Streamable, Writable, WriteOptions,
};

const COLL: &str = "items";

fn seeded() -> MemoryStore {
    let store = MemoryStore::new();
    store.create_collection(COLL, &CreateOptions::default()).unwrap();
    for i in 1..=4 {
        store
            .insert(COLL, doc! { "_id": i, "name": format!("item-{i}"), "qty": i * 10 })
            .unwrap();
    }
    store
}

fn collect(store: &MemoryStore, options: &StreamOptions) -> Vec<bson::Document> {
    store
        .stream(COLL, options)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

#[test]
fn insert_assigns_object_id_first() {
    let store = MemoryStore::new();
    let id = store.insert(COLL, doc! { "name": "no id" }).unwrap();
    assert!(matches!(id, Bson::ObjectId(_)));
    let docs = store.documents(COLL);
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].keys().next().map(String::as_str), Some("_id"));
}

#[test]
fn duplicate_insert_fails() {
    let store = seeded();
    let err = store.insert(COLL, doc! { "_id": 1 }).unwrap_err();
    assert!(matches!(err, StoreError::DuplicateKey { .. }));
    assert_eq!(err.code(), 11000);
    // Numeric width does not matter for identity.
    assert!(store.insert(COLL, doc! { "_id": 2.0 }).is_err());
}

#[test]
fn stream_in_natural_order() {
    let store = seeded();
    let docs = collect(&store, &StreamOptions::default());
    let ids: Vec<i32> = docs.iter().map(|d| d.get_i32("_id").unwrap()).collect();
    assert_eq!(ids, vec![1, 2, 3, 4]);
}

#[test]
fn replace_keeps_position() {
    let store = seeded();
    store.replace(COLL, &Bson::Int32(2), doc! { "name": "two" }).unwrap();
    let docs = collect(&store, &StreamOptions::default());
    assert_eq!(docs[1], doc! { "_id": 2, "name": "two" });
}

#[test]
fn replace_rejects_changed_id() {
    let store = seeded();
    let err = store
        .replace(COLL, &Bson::Int32(2), doc! { "_id": 3, "name": "x" })
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidDocument(_)));
}

#[test]
fn stream_by_ids_hint() {
    let store = seeded();
    let options = StreamOptions {
        document_ids: Some(vec![Bson::Int32(3), Bson::Int64(1), Bson::Int32(99)]),
        projection: None,
    };
    let ids: Vec<i32> = collect(&store, &options)
        .iter()
        .map(|d| d.get_i32("_id").unwrap())
        .collect();
    assert_eq!(ids, vec![1, 3]);
}

#[test]
fn stream_is_a_snapshot() {
    let store = seeded();
    let mut stream = store.stream(COLL, &StreamOptions::default()).unwrap();
    let first = stream.next().unwrap().unwrap();
    store.delete(COLL, &Bson::Int32(2)).unwrap();
    let rest: Vec<_> = stream.collect::<Result<Vec<_>, _>>().unwrap();
    assert_eq!(first.get_i32("_id").unwrap(), 1);
    assert_eq!(rest.len(), 3);
    assert_eq!(store.documents(COLL).len(), 3);
}

#[test]
fn missing_collection_streams_nothing() {
    let store = MemoryStore::new();
    assert_eq!(
        store
            .stream("nothing", &StreamOptions::default())
            .unwrap()
            .count(),
        0
    );
}

#[test]
fn create_and_drop_lifecycle() {
    let store = MemoryStore::new();
    let options = CreateOptions {
        options: doc! { "capped": false },
    };
    store.create_collection(COLL, &options).unwrap();
    assert!(matches!(
        store.create_collection(COLL, &options),
        Err(StoreError::CollectionExists(_))
    ));
    assert_eq!(store.collection_options(COLL), Some(doc! { "capped": false }));
    store.drop_collection(COLL).unwrap();
    assert!(!store.has_collection(COLL));
    assert!(matches!(
        store.drop_collection(COLL),
        Err(StoreError::CollectionNotFound(_))
    ));
}

#[test]
fn ordered_write_stops_at_first_error() {
    let store = seeded();
    let ns = Namespace::new("db", COLL);
    let changes = vec![
        ChangeStreamDocument::insert(ns.clone(), doc! { "_id": 1 }),
        ChangeStreamDocument::insert(ns.clone(), doc! { "_id": 5 }),
    ];
    let errors = store.write(&changes, WriteOptions { ordered: true }).unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].index, 0);
    assert!(!store.exists(COLL, &Bson::Int32(5)).unwrap());

    let errors = store.write(&changes, WriteOptions { ordered: false }).unwrap();
    assert_eq!(errors.len(), 1);
    assert!(store.exists(COLL, &Bson::Int32(5)).unwrap());
}

#[test]
fn write_applies_every_operation_type() {
    let store = seeded();
    let ns = Namespace::new("db", COLL);
    let changes = vec![
        ChangeStreamDocument::delete(ns.clone(), Bson::Int32(1)),
        ChangeStreamDocument::replace(ns.clone(), doc! { "_id": 2, "name": "replaced" }),
        ChangeStreamDocument::update(ns.clone(), doc! { "_id": 9, "name": "upserted" }),
    ];
    let errors = store.write(&changes, WriteOptions::default()).unwrap();
    assert!(errors.is_empty());
    let docs = store.documents(COLL);
    assert_eq!(docs.len(), 4);
    assert_eq!(docs[0], doc! { "_id": 2, "name": "replaced" });
    assert_eq!(docs[3], doc! { "_id": 9, "name": "upserted" });

    let errors = store
        .write(&[ChangeStreamDocument::drop(ns)], WriteOptions::default())
        .unwrap();
    assert!(errors.is_empty());
    assert!(!store.has_collection(COLL));
}

#[test]
fn access_creates_databases_on_demand() {
    let access = MemoryAccess::new();
    let storage = access.storage("shop").unwrap();
    storage.insert("orders", doc! { "_id": 1 }).unwrap();
    let stream = access.streamable("shop").unwrap();
    assert_eq!(
        stream
            .stream("orders", &StreamOptions::default())
            .unwrap()
            .count(),
        1
    );
    assert!(access.database("other").documents("orders").is_empty());
}
