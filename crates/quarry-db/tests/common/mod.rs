#![allow(dead_code)]

use std::sync::Arc;

use bson::{Bson, Document, doc};
use quarry_db::{Database, DatabaseConfig, Namespace};
use quarry_store::MemoryAccess;

pub const DB: &str = "bakery";
pub const COLLECTION: &str = "items";

pub fn open_db() -> Database {
    open_db_with(DatabaseConfig::default())
}

pub fn open_db_with(config: DatabaseConfig) -> Database {
    Database::open(Arc::new(MemoryAccess::new()), config)
}

/// A database plus direct access to its backend.
pub fn open_db_with_access() -> (Database, Arc<MemoryAccess>) {
    let access = Arc::new(MemoryAccess::new());
    let db = Database::open(access.clone(), DatabaseConfig::default());
    (db, access)
}

pub fn ns(coll: &str) -> Namespace {
    Namespace::new(DB, coll)
}

pub fn run(db: &Database, cmd: Document) -> Document {
    db.command(&ns(COLLECTION), cmd).unwrap()
}

pub fn insert(db: &Database, coll: &str, docs: Vec<Document>) -> Document {
    run(db, doc! { "insert": coll, "documents": docs, "ordered": true })
}

/// Four baked goods, two per category.
pub fn seed_items(db: &Database) {
    let reply = insert(
        db,
        COLLECTION,
        vec![
            doc! { "_id": 1, "name": "cheesecake", "category": "cake", "qty": 10, "price": 4.5 },
            doc! { "_id": 2, "name": "apple", "category": "pie", "qty": 20, "price": 3.0 },
            doc! { "_id": 3, "name": "sponge", "category": "cake", "qty": 5, "price": 2.5 },
            doc! { "_id": 4, "name": "cherry", "category": "pie", "qty": 15, "price": 3.5 },
        ],
    );
    assert_eq!(reply.get_i32("n").unwrap(), 4);
}

pub fn find_all(db: &Database, coll: &str) -> Vec<Document> {
    first_batch(&run(db, doc! { "find": coll, "batchSize": 1000 }))
}

fn batch(reply: &Document, key: &str) -> Vec<Document> {
    reply
        .get_document("cursor")
        .unwrap()
        .get_array(key)
        .unwrap()
        .iter()
        .map(|d| d.as_document().unwrap().clone())
        .collect()
}

pub fn first_batch(reply: &Document) -> Vec<Document> {
    batch(reply, "firstBatch")
}

pub fn next_batch(reply: &Document) -> Vec<Document> {
    batch(reply, "nextBatch")
}

pub fn cursor_id(reply: &Document) -> i64 {
    reply.get_document("cursor").unwrap().get_i64("id").unwrap()
}

pub fn ids(docs: &[Document]) -> Vec<Bson> {
    docs.iter().map(|d| d.get("_id").cloned().unwrap()).collect()
}

pub fn int_ids(docs: &[Document]) -> Vec<i32> {
    docs.iter().map(|d| d.get_i32("_id").unwrap()).collect()
}
