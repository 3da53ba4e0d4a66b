mod common;
use common::*;

use bson::{Bson, doc};
use quarry_db::{DbError, OperationType};

// ── Insert tests ────────────────────────────────────────────────

#[test]
fn insert_assigns_missing_ids_and_publishes() {
    let db = open_db();
    let changes = db.subscribe();

    let reply = run(
        &db,
        doc! { "insert": COLLECTION, "documents": [{ "name": "scone" }, { "_id": 7, "name": "roll" }] },
    );
    assert_eq!(reply, doc! { "n": 2, "ok": 1 });

    let docs = find_all(&db, COLLECTION);
    assert_eq!(docs.len(), 2);
    assert!(docs[0].get_object_id("_id").is_ok());
    assert_eq!(docs[1], doc! { "_id": 7, "name": "roll" });

    let first = changes.try_recv().unwrap();
    assert_eq!(first.operation_type, OperationType::Insert);
    assert_eq!(first.full_document.as_ref(), Some(&docs[0]));
    assert_eq!(first.ns, ns(COLLECTION));
    assert_eq!(changes.try_recv().unwrap().document_key, Some(Bson::Int32(7)));
    assert!(changes.try_recv().is_err());
}

#[test]
fn unordered_insert_continues_past_duplicates() {
    let db = open_db();
    insert(&db, COLLECTION, vec![doc! { "_id": 1 }]);

    let reply = run(
        &db,
        doc! {
            "insert": COLLECTION,
            "documents": [{ "_id": 1, "title": "foo" }, { "_id": 2, "title": "bar" }],
            "ordered": false,
        },
    );
    assert_eq!(reply.get_i32("n").unwrap(), 1);
    let errors = reply.get_array("writeErrors").unwrap();
    assert_eq!(errors.len(), 1);
    let error = errors[0].as_document().unwrap();
    assert_eq!(error.get_i64("index").unwrap(), 0);
    assert_eq!(error.get_i32("code").unwrap(), 11000);
    assert!(error.get_str("errMsg").unwrap().contains("duplicate key"));
    assert_eq!(int_ids(&find_all(&db, COLLECTION)), vec![1, 2]);
}

#[test]
fn ordered_insert_stops_at_the_first_error() {
    let db = open_db();
    insert(&db, COLLECTION, vec![doc! { "_id": 1 }]);

    let reply = run(
        &db,
        doc! {
            "insert": COLLECTION,
            "documents": [{ "_id": 1, "title": "foo" }, { "_id": 2, "title": "bar" }],
            "ordered": true,
        },
    );
    assert_eq!(reply.get_i32("n").unwrap(), 0);
    assert_eq!(reply.get_array("writeErrors").unwrap().len(), 1);
    assert_eq!(int_ids(&find_all(&db, COLLECTION)), vec![1]);
}

/// Inserts before the failing document stay committed, so this reports
/// `n: 1` with the error at index 1 rather than `n: 0` at index 0.
#[test]
fn ordered_insert_keeps_what_it_stored() {
    let db = open_db();
    let reply = run(
        &db,
        doc! {
            "insert": COLLECTION,
            "documents": [{ "_id": 1 }, { "_id": 1 }, { "_id": 2 }],
            "ordered": true,
        },
    );
    assert_eq!(reply.get_i32("n").unwrap(), 1);
    let errors = reply.get_array("writeErrors").unwrap();
    assert_eq!(errors[0].as_document().unwrap().get_i64("index").unwrap(), 1);
    assert_eq!(int_ids(&find_all(&db, COLLECTION)), vec![1]);
}

#[test]
fn ordered_defaults_to_false() {
    let db = open_db();
    let reply = run(
        &db,
        doc! { "insert": COLLECTION, "documents": [{ "_id": 1 }, { "_id": 1 }, { "_id": 2 }] },
    );
    assert_eq!(reply.get_i32("n").unwrap(), 2);

    let strict = open_db_with(quarry_db::DatabaseConfig {
        ordered_writes_by_default: true,
        ..Default::default()
    });
    let reply = strict
        .command(
            &ns(COLLECTION),
            doc! { "insert": COLLECTION, "documents": [{ "_id": 1 }, { "_id": 1 }, { "_id": 2 }] },
        )
        .unwrap();
    assert_eq!(reply.get_i32("n").unwrap(), 1);
}

// ── Delete tests ────────────────────────────────────────────────

#[test]
fn delete_one_or_all_matches() {
    let db = open_db();
    seed_items(&db);
    let changes = db.subscribe();

    let reply = run(
        &db,
        doc! { "delete": COLLECTION, "deletes": [{ "q": { "category": "cake" }, "limit": 1 }] },
    );
    assert_eq!(reply, doc! { "n": 1, "ok": 1 });
    assert_eq!(int_ids(&find_all(&db, COLLECTION)), vec![2, 3, 4]);

    let change = changes.try_recv().unwrap();
    assert_eq!(change.operation_type, OperationType::Delete);
    assert_eq!(change.document_key, Some(Bson::Int32(1)));
    assert!(change.full_document.is_none());

    let reply = run(
        &db,
        doc! { "delete": COLLECTION, "deletes": [{ "q": { "category": "pie" }, "limit": 0 }] },
    );
    assert_eq!(reply.get_i32("n").unwrap(), 2);
    assert_eq!(int_ids(&find_all(&db, COLLECTION)), vec![3]);
}

#[test]
fn delete_with_empty_filter_clears_the_collection() {
    let db = open_db();
    seed_items(&db);
    let reply = run(&db, doc! { "delete": COLLECTION, "deletes": [{ "q": {}, "limit": 0 }] });
    assert_eq!(reply.get_i32("n").unwrap(), 4);
    assert!(find_all(&db, COLLECTION).is_empty());
}

// ── Update tests ────────────────────────────────────────────────

#[test]
fn update_touches_one_match_unless_multi() {
    let db = open_db();
    seed_items(&db);

    let reply = run(
        &db,
        doc! {
            "update": COLLECTION,
            "updates": [{ "q": { "category": "cake" }, "u": { "$set": { "qty": 30 } } }],
        },
    );
    assert_eq!(reply, doc! { "n": 1, "nModified": 1, "ok": 1 });

    let reply = run(
        &db,
        doc! {
            "update": COLLECTION,
            "updates": [{ "q": { "category": "pie" }, "u": { "$set": { "qty": 30 } }, "multi": true }],
        },
    );
    assert_eq!(reply.get_i32("nModified").unwrap(), 2);

    let qty: Vec<i32> = find_all(&db, COLLECTION)
        .iter()
        .map(|d| d.get_i32("qty").unwrap())
        .collect();
    assert_eq!(qty, vec![30, 30, 5, 30]);
}

#[test]
fn update_operators_and_change_kinds() {
    let db = open_db();
    seed_items(&db);
    let changes = db.subscribe();

    run(
        &db,
        doc! {
            "update": COLLECTION,
            "updates": [{
                "q": { "_id": 2 },
                "u": { "$inc": { "qty": -5 }, "$push": { "tags": "seasonal" }, "$unset": { "price": 1 } },
            }],
        },
    );
    let change = changes.try_recv().unwrap();
    assert_eq!(change.operation_type, OperationType::Update);
    assert_eq!(
        change.full_document,
        Some(doc! { "_id": 2, "name": "apple", "category": "pie", "qty": 15, "tags": ["seasonal"] })
    );
}

#[test]
fn replacement_drops_unlisted_fields() {
    let db = open_db();
    seed_items(&db);
    let changes = db.subscribe();

    let reply = run(
        &db,
        doc! { "update": COLLECTION, "updates": [{ "q": { "_id": 3 }, "u": { "name": "victoria" } }] },
    );
    assert_eq!(reply.get_i32("nModified").unwrap(), 1);
    assert_eq!(find_all(&db, COLLECTION)[2], doc! { "_id": 3, "name": "victoria" });
    assert_eq!(changes.try_recv().unwrap().operation_type, OperationType::Replace);
}

#[test]
fn upsert_inserts_when_nothing_matches() {
    let db = open_db();
    seed_items(&db);

    let reply = run(
        &db,
        doc! {
            "update": COLLECTION,
            "updates": [{ "q": { "_id": 5 }, "u": { "_id": 5, "category": "candy" }, "upsert": true }],
        },
    );
    assert_eq!(
        reply,
        doc! { "n": 1, "nModified": 0, "upserted": [{ "index": 0_i64, "_id": 5 }], "ok": 1 }
    );
    let found = first_batch(&run(&db, doc! { "find": COLLECTION, "filter": { "_id": 5 } }));
    assert_eq!(found, vec![doc! { "_id": 5, "category": "candy" }]);
}

#[test]
fn upsert_with_operators_gets_a_fresh_id() {
    let db = open_db();
    let reply = run(
        &db,
        doc! {
            "update": COLLECTION,
            "updates": [{ "q": { "name": "eclair" }, "u": { "$inc": { "qty": 3 } }, "upsert": true }],
        },
    );
    let upserted = reply.get_array("upserted").unwrap();
    assert_eq!(upserted.len(), 1);
    let docs = find_all(&db, COLLECTION);
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].get_i32("qty").unwrap(), 3);
    assert!(docs[0].get_object_id("_id").is_ok());
}

#[test]
fn no_op_replace_still_counts() {
    let db = open_db();
    seed_items(&db);
    let reply = run(
        &db,
        doc! { "update": COLLECTION, "updates": [{ "q": { "_id": 1 }, "u": { "$set": { "qty": 10 } } }] },
    );
    assert_eq!(reply.get_i32("nModified").unwrap(), 1);
}

#[test]
fn pipeline_updates() {
    let db = open_db();
    seed_items(&db);
    run(
        &db,
        doc! {
            "update": COLLECTION,
            "updates": [{
                "q": { "category": "cake" },
                "u": [{ "$set": { "total": { "$multiply": ["$qty", "$price"] } } }],
                "multi": true,
            }],
        },
    );
    let totals: Vec<f64> = first_batch(&run(
        &db,
        doc! { "find": COLLECTION, "filter": { "category": "cake" } },
    ))
    .iter()
    .map(|d| d.get_f64("total").unwrap())
    .collect();
    assert_eq!(totals, vec![45.0, 12.5]);
}

#[test]
fn result_without_id_is_a_write_error() {
    let db = open_db();
    seed_items(&db);
    let reply = run(
        &db,
        doc! { "update": COLLECTION, "updates": [{ "q": { "_id": 1 }, "u": [{ "$unset": "_id" }] }] },
    );
    assert_eq!(reply.get_i32("n").unwrap(), 0);
    let error = reply.get_array("writeErrors").unwrap()[0].as_document().unwrap().clone();
    assert_eq!(error.get_i32("code").unwrap(), 9);
}

#[test]
fn invalid_updates_fail_the_command() {
    let db = open_db();
    seed_items(&db);
    for u in [
        Bson::Document(doc! { "$rename": { "qty": "quantity" } }),
        Bson::Document(doc! { "$inc": { "qty": "many" } }),
    ] {
        let err = db
            .command(
                &ns(COLLECTION),
                doc! { "update": COLLECTION, "updates": [{ "q": {}, "u": u }] },
            )
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidUpdate(_)));
        assert_eq!(err.code(), 9);
    }

    let err = db
        .command(
            &ns(COLLECTION),
            doc! { "update": COLLECTION, "updates": [{ "q": {}, "u": { "name": "x" }, "multi": true }] },
        )
        .unwrap_err();
    assert!(matches!(err, DbError::InvalidUpdate(_)));
}
