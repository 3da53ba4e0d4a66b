use bson::{Bson, Document, doc};
use quarry_store::Namespace;

use super::{Aggregate, AggregateTarget, Count, Distinct, Find, GetMore, KillCursors};
use crate::database::Database;
use crate::engine::AggregateInput;
use crate::error::DbError;
use crate::result::{count as count_value, cursor_reply};

/// Namespace of cursors opened by `aggregate: 1`.
const DATABASE_AGGREGATE: &str = "$cmd.aggregate";

pub(crate) fn find(db: &Database, name: &str, cmd: Find) -> Result<Document, DbError> {
    let mut pipeline = Vec::new();
    if let Some(filter) = cmd.filter {
        pipeline.push(doc! { "$match": filter });
    }
    if let Some(sort) = cmd.sort.filter(|s| !s.is_empty()) {
        pipeline.push(doc! { "$sort": sort });
    }
    if let Some(skip) = cmd.skip.filter(|&s| s > 0) {
        pipeline.push(doc! { "$skip": skip as i64 });
    }
    if let Some(limit) = cmd.limit {
        pipeline.push(doc! { "$limit": limit as i64 });
    }
    if let Some(projection) = cmd.projection.filter(|p| !p.is_empty()) {
        pipeline.push(doc! { "$project": projection });
    }

    let ns = Namespace::new(name, cmd.coll.as_str());
    let id = db
        .engine()
        .aggregate(&ns, AggregateInput::Collection(cmd.coll), pipeline, cmd.collation)?;
    next_batch(db, id, cmd.batch_size, "firstBatch")
}

pub(crate) fn aggregate(db: &Database, name: &str, cmd: Aggregate) -> Result<Document, DbError> {
    let (ns, input, pipeline) = match cmd.target {
        AggregateTarget::Collection(coll) => (
            Namespace::new(name, coll.as_str()),
            AggregateInput::Collection(coll),
            cmd.pipeline,
        ),
        AggregateTarget::Database => {
            let mut pipeline = cmd.pipeline.into_iter();
            let docs = match pipeline.next() {
                Some(first) => literal_documents(&first)?,
                None => None,
            }
            .ok_or_else(|| {
                DbError::BadValue("aggregate: 1 needs a leading $documents stage".into())
            })?;
            (
                Namespace::new(name, DATABASE_AGGREGATE),
                AggregateInput::Documents(docs),
                pipeline.collect(),
            )
        }
    };
    let id = db.engine().aggregate(&ns, input, pipeline, cmd.collation)?;
    next_batch(db, id, cmd.batch_size, "firstBatch")
}

pub(crate) fn get_more(db: &Database, cmd: GetMore) -> Result<Document, DbError> {
    if !cmd.coll.is_empty() {
        let cursor = db.cursors().get_cursor(cmd.cursor_id)?;
        let cursor = cursor.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if cursor.ns().coll != cmd.coll {
            return Err(DbError::BadValue(format!(
                "cursor {} belongs to {}, not collection {}",
                cmd.cursor_id,
                cursor.ns(),
                cmd.coll
            )));
        }
    }
    next_batch(db, cmd.cursor_id, cmd.batch_size, "nextBatch")
}

pub(crate) fn kill_cursors(db: &Database, cmd: KillCursors) -> Result<Document, DbError> {
    let (killed, not_found): (Vec<i64>, Vec<i64>) = cmd
        .cursor_ids
        .into_iter()
        .partition(|&id| db.cursors().close_cursor(id));
    Ok(doc! {
        "cursorsKilled": killed,
        "cursorsNotFound": not_found,
        "ok": 1,
    })
}

pub(crate) fn count(db: &Database, name: &str, cmd: Count) -> Result<Document, DbError> {
    let mut pipeline = Vec::new();
    if let Some(query) = cmd.query {
        pipeline.push(doc! { "$match": query });
    }
    if let Some(skip) = cmd.skip.filter(|&s| s > 0) {
        pipeline.push(doc! { "$skip": skip as i64 });
    }
    if let Some(limit) = cmd.limit {
        pipeline.push(doc! { "$limit": limit as i64 });
    }
    pipeline.push(doc! { "$count": "count" });

    let ns = Namespace::new(name, cmd.coll.as_str());
    let id = db
        .engine()
        .aggregate(&ns, AggregateInput::Collection(cmd.coll), pipeline, cmd.collation)?;
    let n = match drain(db, id)?.first().and_then(|d| d.get("count")) {
        Some(Bson::Int32(n)) => count_value(*n as u64),
        Some(Bson::Int64(n)) => count_value(*n as u64),
        _ => Bson::Int32(0),
    };
    Ok(doc! { "n": n, "ok": 1 })
}

pub(crate) fn distinct(db: &Database, name: &str, cmd: Distinct) -> Result<Document, DbError> {
    let path = format!("${}", cmd.key);
    let pipeline = vec![
        doc! { "$match": cmd.query.unwrap_or_default() },
        doc! { "$unwind": path.as_str() },
        doc! { "$group": { "_id": path.as_str() } },
    ];

    let ns = Namespace::new(name, cmd.coll.as_str());
    let id = db
        .engine()
        .aggregate(&ns, AggregateInput::Collection(cmd.coll), pipeline, cmd.collation)?;
    let values: Vec<Bson> = drain(db, id)?
        .into_iter()
        .filter_map(|mut d| d.remove("_id"))
        .collect();
    Ok(doc! { "values": values, "ok": 1 })
}

// ── Cursor helpers ──────────────────────────────────────────────

/// Pulls one batch and closes the cursor once it reports exhaustion
/// (or fails), replying id 0 in that case.
fn next_batch(
    db: &Database,
    id: i64,
    requested: Option<usize>,
    batch_key: &str,
) -> Result<Document, DbError> {
    let size = db.config().batch_size(requested);
    let cursor = db.cursors().get_cursor(id)?;
    let (batch, ns, done) = {
        let mut cursor = cursor.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let batch = cursor.get_batch(Some(size));
        (batch, cursor.ns().clone(), cursor.is_done())
    };
    let batch = match batch {
        Ok(batch) => batch,
        Err(e) => {
            db.cursors().close_cursor(id);
            return Err(e);
        }
    };
    let reply_id = if done {
        db.cursors().close_cursor(id);
        0
    } else {
        id
    };
    Ok(cursor_reply(batch_key, batch, reply_id, &ns))
}

/// Reads a cursor to the end and closes it.
fn drain(db: &Database, id: i64) -> Result<Vec<Document>, DbError> {
    let cursor = db.cursors().get_cursor(id)?;
    let docs = cursor
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .to_array();
    db.cursors().close_cursor(id);
    docs
}

/// The documents of a `{$documents: [...]}` stage, or `None` for any
/// other stage.
fn literal_documents(stage: &Document) -> Result<Option<Vec<Document>>, DbError> {
    if stage.len() != 1 {
        return Ok(None);
    }
    match stage.get("$documents") {
        None => Ok(None),
        Some(Bson::Array(items)) => items
            .iter()
            .map(|item| match item {
                Bson::Document(doc) => Ok(doc.clone()),
                _ => Err(DbError::BadValue("$documents must only contain documents".into())),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
        Some(_) => Err(DbError::BadValue("$documents must be an array".into())),
    }
}
