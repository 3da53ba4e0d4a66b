use bson::{Bson, Document, doc};
use quarry_store::{ChangeStreamDocument, Namespace, Storage, WriteError, document_id};

use super::update::{UpdateKind, rewrite_update};
use super::{Delete, Insert, Update};
use crate::database::Database;
use crate::engine::AggregateInput;
use crate::error::DbError;
use crate::result::WriteResult;

/// Code reported when an update result has no `_id` to write back to.
const NO_ID: i32 = 9;

pub(crate) fn insert(db: &Database, name: &str, cmd: Insert) -> Result<Document, DbError> {
    let ns = Namespace::new(name, cmd.coll.as_str());
    db.ensure_writable(&ns)?;
    let ordered = cmd.ordered.unwrap_or(db.config().ordered_writes_by_default);
    let storage = db.storage(name)?;

    let mut result = WriteResult::default();
    for (index, doc) in cmd.documents.into_iter().enumerate() {
        match storage.insert(&ns.coll, doc.clone()) {
            Ok(id) => {
                result.n += 1;
                db.bus()
                    .publish(&ChangeStreamDocument::insert(ns.clone(), with_id(doc, id)));
            }
            Err(e) => {
                result.record_error(WriteError::new(index, &e), &ns);
                if ordered {
                    break;
                }
            }
        }
    }
    Ok(result.to_document())
}

pub(crate) fn delete(db: &Database, name: &str, cmd: Delete) -> Result<Document, DbError> {
    let ns = Namespace::new(name, cmd.coll.as_str());
    db.ensure_writable(&ns)?;
    let ordered = cmd.ordered.unwrap_or(db.config().ordered_writes_by_default);
    let storage = db.storage(name)?;

    let mut result = WriteResult::default();
    'statements: for (index, stmt) in cmd.deletes.into_iter().enumerate() {
        let mut pipeline = vec![doc! { "$match": stmt.q }];
        if stmt.limit == 1 {
            pipeline.push(doc! { "$limit": 1 });
        }
        pipeline.push(doc! { "$project": { "_id": 1 } });

        let matched = db.engine().collect(
            &ns,
            AggregateInput::Collection(ns.coll.clone()),
            pipeline,
            stmt.collation,
        )?;
        for doc in matched {
            let id = document_id(&doc).cloned().unwrap_or(Bson::Null);
            match storage.delete(&ns.coll, &id) {
                Ok(()) => {
                    result.n += 1;
                    db.bus().publish(&ChangeStreamDocument::delete(ns.clone(), id));
                }
                Err(e) => {
                    result.record_error(WriteError::new(index, &e), &ns);
                    if ordered {
                        break 'statements;
                    }
                }
            }
        }
    }
    Ok(result.to_document())
}

pub(crate) fn update(db: &Database, name: &str, cmd: Update) -> Result<Document, DbError> {
    let ns = Namespace::new(name, cmd.coll.as_str());
    db.ensure_writable(&ns)?;
    let ordered = cmd.ordered.unwrap_or(db.config().ordered_writes_by_default);
    let storage = db.storage(name)?;

    let mut result = WriteResult::default();
    let mut modified = 0;
    'statements: for (index, stmt) in cmd.updates.into_iter().enumerate() {
        let rewrite = rewrite_update(&stmt.u)?;
        if rewrite.kind == UpdateKind::Replace && stmt.multi {
            return Err(DbError::InvalidUpdate(
                "multi update is not supported for replacement-style update".into(),
            ));
        }

        let mut pipeline = vec![doc! { "$match": stmt.q }];
        if !stmt.multi {
            pipeline.push(doc! { "$limit": 1 });
        }
        pipeline.extend(rewrite.stages.iter().cloned());

        let mut updated = db.engine().collect(
            &ns,
            AggregateInput::Collection(ns.coll.clone()),
            pipeline,
            stmt.collation.clone(),
        )?;
        let seeded = updated.is_empty() && stmt.upsert;
        if seeded {
            updated = db.engine().collect(
                &ns,
                AggregateInput::Documents(vec![Document::new()]),
                rewrite.stages,
                stmt.collation,
            )?;
        }

        for doc in updated {
            let outcome = match document_id(&doc).cloned() {
                None if seeded => upsert(db, storage.as_ref(), &ns, index, doc, &mut result),
                None => Err(WriteError {
                    index,
                    code: NO_ID,
                    errmsg: "the updated document has no _id".into(),
                }),
                Some(id) => match storage.exists(&ns.coll, &id) {
                    Ok(false) if stmt.upsert => upsert(db, storage.as_ref(), &ns, index, doc, &mut result),
                    Ok(_) => match storage.replace(&ns.coll, &id, doc.clone()) {
                        Ok(()) => {
                            result.n += 1;
                            modified += 1;
                            let change = match rewrite.kind {
                                UpdateKind::Update => ChangeStreamDocument::update(ns.clone(), doc),
                                UpdateKind::Replace => ChangeStreamDocument::replace(ns.clone(), doc),
                            };
                            db.bus().publish(&change);
                            Ok(())
                        }
                        Err(e) => Err(WriteError::new(index, &e)),
                    },
                    Err(e) => Err(WriteError::new(index, &e)),
                },
            };
            if let Err(error) = outcome {
                result.record_error(error, &ns);
                if ordered {
                    break 'statements;
                }
            }
        }
    }
    result.n_modified = Some(modified);
    Ok(result.to_document())
}

fn upsert(
    db: &Database,
    storage: &dyn Storage,
    ns: &Namespace,
    index: usize,
    doc: Document,
    result: &mut WriteResult,
) -> Result<(), WriteError> {
    let id = storage
        .insert(&ns.coll, doc.clone())
        .map_err(|e| WriteError::new(index, &e))?;
    result.n += 1;
    result.upserted.push(doc! { "index": index as i64, "_id": id.clone() });
    db.bus()
        .publish(&ChangeStreamDocument::insert(ns.clone(), with_id(doc, id)));
    Ok(())
}

/// `doc` as stored: the assigned id goes first when the caller gave none.
fn with_id(doc: Document, id: Bson) -> Document {
    if doc.contains_key("_id") {
        return doc;
    }
    let mut stored = doc! { "_id": id };
    for (k, v) in doc {
        stored.insert(k, v);
    }
    stored
}
