mod common;
use common::*;

use bson::{Document, doc};
use quarry_db::{AggregateInput, QueryAnalysis};
use quarry_query::Collation;

fn pipelines() -> Vec<Vec<Document>> {
    vec![
        vec![doc! { "$match": { "category": "cake" } }],
        vec![doc! { "$match": { "_id": { "$in": [4, 2] } } }, doc! { "$project": { "name": 1 } }],
        vec![doc! { "$match": { "_id": 3 } }, doc! { "$project": { "qty": 1 } }],
        vec![doc! { "$match": { "_id": 1 } }, doc! { "$project": { "_id": 0, "name": 1 } }],
        vec![
            doc! { "$match": { "_id": { "$in": [1, 4] } } },
            doc! { "$project": { "_id": false, "qty": 0 } },
        ],
        vec![doc! { "$sort": { "qty": -1 } }, doc! { "$skip": 1 }, doc! { "$limit": 2 }],
        vec![
            doc! { "$match": { "qty": { "$gt": 5 } } },
            doc! { "$sort": { "price": 1 } },
            doc! { "$limit": 3 },
            doc! { "$skip": 1 },
            doc! { "$project": { "_id": 0, "name": 1 } },
        ],
        vec![
            doc! { "$skip": 1 },
            doc! { "$sort": { "name": 1 } },
            doc! { "$match": { "category": "pie" } },
        ],
        vec![
            doc! { "$limit": 3 },
            doc! { "$project": { "qty": 1 } },
            doc! { "$project": { "_id": 1 } },
            doc! { "$group": { "_id": null, "n": { "$sum": 1 } } },
        ],
        vec![doc! { "$project": { "name": 1 } }, doc! { "$match": { "name": { "$exists": false } } }],
    ]
}

// ── Push-down tests ─────────────────────────────────────────────

#[test]
fn pushed_down_pipelines_match_in_process_evaluation() {
    let db = open_db();
    seed_items(&db);
    let source = find_all(&db, COLLECTION);

    for pipeline in pipelines() {
        let pushed = db
            .engine()
            .collect(
                &ns(COLLECTION),
                AggregateInput::Collection(COLLECTION.into()),
                pipeline.clone(),
                None,
            )
            .unwrap();
        let in_process = db
            .engine()
            .collect(
                &ns(COLLECTION),
                AggregateInput::Documents(source.clone()),
                pipeline.clone(),
                None,
            )
            .unwrap();
        assert_eq!(pushed, in_process, "pipeline {pipeline:?}");
    }
}

#[test]
fn find_by_id_without_returning_it() {
    let db = open_db();
    seed_items(&db);
    let reply = run(
        &db,
        doc! { "find": COLLECTION, "filter": { "_id": 1 }, "projection": { "_id": 0, "name": 1 } },
    );
    assert_eq!(first_batch(&reply), vec![doc! { "name": "cheesecake" }]);
}

#[test]
fn id_lookups_respect_case_folding() {
    let db = open_db();
    insert(
        &db,
        COLLECTION,
        vec![doc! { "_id": "Rye" }, doc! { "_id": "rye" }, doc! { "_id": "wheat" }],
    );
    let collation = Collation::from_document(&doc! { "locale": "en", "strength": 1 }).unwrap();

    let found = db
        .engine()
        .collect(
            &ns(COLLECTION),
            AggregateInput::Collection(COLLECTION.into()),
            vec![doc! { "$match": { "_id": "RYE" } }],
            Some(collation),
        )
        .unwrap();
    assert_eq!(found.len(), 2);
}

#[test]
fn analysis_splits_the_prefix() {
    let analysis = QueryAnalysis::new(
        DB,
        vec![
            doc! { "$match": { "a": 1 } },
            doc! { "$sort": { "b": 1 } },
            doc! { "$skip": 2 },
            doc! { "$limit": 5 },
            doc! { "$lookup": { "from": "other", "localField": "a", "foreignField": "a", "as": "o" } },
            doc! { "$merge": { "into": "target" } },
        ],
        None,
    )
    .unwrap();
    assert_eq!(analysis.pushed(), 4);
    assert_eq!(analysis.filter, Some(doc! { "a": 1 }));
    assert_eq!(analysis.sort, Some(doc! { "b": 1 }));
    assert_eq!(analysis.skip, Some(2));
    assert_eq!(analysis.limit, Some(5));
    assert_eq!(analysis.remaining().len(), 2);
    assert_eq!(analysis.foreign_inputs, vec![ns("other"), ns("target")]);
    assert_eq!(analysis.sink_target(), Some(ns("target")));
}
