mod admin;
mod read;
mod update;
mod write;

use bson::{Bson, Document};
use quarry_query::Collation;

use crate::database::Database;
use crate::error::DbError;

/// A parsed command document. The first key names the verb.
#[derive(Debug, Clone)]
pub(crate) enum Command {
    Find(Find),
    Aggregate(Aggregate),
    GetMore(GetMore),
    KillCursors(KillCursors),
    Count(Count),
    Distinct(Distinct),
    Insert(Insert),
    Delete(Delete),
    Update(Update),
    Create(Create),
    Drop(DropCollection),
}

#[derive(Debug, Clone)]
pub(crate) struct Find {
    pub coll: String,
    pub filter: Option<Document>,
    pub sort: Option<Document>,
    pub projection: Option<Document>,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
    pub batch_size: Option<usize>,
    pub collation: Option<Collation>,
}

#[derive(Debug, Clone)]
pub(crate) enum AggregateTarget {
    Collection(String),
    /// `aggregate: 1`, fed by a leading `$documents` stage.
    Database,
}

#[derive(Debug, Clone)]
pub(crate) struct Aggregate {
    pub target: AggregateTarget,
    pub pipeline: Vec<Document>,
    pub batch_size: Option<usize>,
    pub collation: Option<Collation>,
}

#[derive(Debug, Clone)]
pub(crate) struct GetMore {
    pub cursor_id: i64,
    pub coll: String,
    pub batch_size: Option<usize>,
}

#[derive(Debug, Clone)]
pub(crate) struct KillCursors {
    pub cursor_ids: Vec<i64>,
}

#[derive(Debug, Clone)]
pub(crate) struct Count {
    pub coll: String,
    pub query: Option<Document>,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
    pub collation: Option<Collation>,
}

#[derive(Debug, Clone)]
pub(crate) struct Distinct {
    pub coll: String,
    pub key: String,
    pub query: Option<Document>,
    pub collation: Option<Collation>,
}

#[derive(Debug, Clone)]
pub(crate) struct Insert {
    pub coll: String,
    pub documents: Vec<Document>,
    pub ordered: Option<bool>,
}

#[derive(Debug, Clone)]
pub(crate) struct DeleteStatement {
    pub q: Document,
    /// 0 deletes every match, 1 the first.
    pub limit: u64,
    pub collation: Option<Collation>,
}

#[derive(Debug, Clone)]
pub(crate) struct Delete {
    pub coll: String,
    pub deletes: Vec<DeleteStatement>,
    pub ordered: Option<bool>,
}

#[derive(Debug, Clone)]
pub(crate) struct UpdateStatement {
    pub q: Document,
    pub u: Bson,
    pub upsert: bool,
    pub multi: bool,
    pub collation: Option<Collation>,
}

#[derive(Debug, Clone)]
pub(crate) struct Update {
    pub coll: String,
    pub updates: Vec<UpdateStatement>,
    pub ordered: Option<bool>,
}

#[derive(Debug, Clone)]
pub(crate) struct Create {
    pub coll: String,
    pub view_on: Option<String>,
    pub pipeline: Vec<Document>,
    /// Remaining fields, handed to the backend for plain collections.
    pub options: Document,
}

#[derive(Debug, Clone)]
pub(crate) struct DropCollection {
    pub coll: String,
}

impl Command {
    pub(crate) fn parse(cmd: &Document) -> Result<Self, DbError> {
        let verb = cmd
            .keys()
            .next()
            .ok_or_else(|| DbError::BadValue("empty command document".into()))?;
        Ok(match verb.as_str() {
            "find" => Command::Find(Find {
                coll: collection(cmd, "find")?,
                filter: optional_document(cmd, "filter")?,
                sort: optional_document(cmd, "sort")?,
                projection: optional_document(cmd, "projection")?,
                skip: optional_count(cmd, "skip")?,
                limit: optional_limit(cmd, "limit")?,
                batch_size: optional_count(cmd, "batchSize")?.map(|n| n as usize),
                collation: optional_collation(cmd)?,
            }),
            "aggregate" => {
                let target = match cmd.get("aggregate") {
                    Some(Bson::String(coll)) => AggregateTarget::Collection(coll.clone()),
                    Some(Bson::Int32(1)) | Some(Bson::Int64(1)) => AggregateTarget::Database,
                    Some(Bson::Double(f)) if *f == 1.0 => AggregateTarget::Database,
                    _ => {
                        return Err(DbError::BadValue(
                            "aggregate needs a collection name or 1".into(),
                        ));
                    }
                };
                let batch_size = match optional_document(cmd, "cursor")? {
                    Some(cursor) => optional_count(&cursor, "batchSize")?.map(|n| n as usize),
                    None => None,
                };
                Command::Aggregate(Aggregate {
                    target,
                    pipeline: document_array(cmd, "pipeline")?,
                    batch_size,
                    collation: optional_collation(cmd)?,
                })
            }
            "getMore" => Command::GetMore(GetMore {
                cursor_id: integer(cmd.get("getMore"), "getMore")?,
                coll: optional_string(cmd, "collection")?.unwrap_or_default(),
                batch_size: optional_count(cmd, "batchSize")?.map(|n| n as usize),
            }),
            "killCursors" => Command::KillCursors(KillCursors {
                cursor_ids: match cmd.get("cursors") {
                    Some(Bson::Array(ids)) => ids
                        .iter()
                        .map(|id| integer(Some(id), "cursors"))
                        .collect::<Result<_, _>>()?,
                    _ => return Err(DbError::BadValue("killCursors needs a cursors array".into())),
                },
            }),
            "count" => Command::Count(Count {
                coll: collection(cmd, "count")?,
                query: optional_document(cmd, "query")?,
                skip: optional_count(cmd, "skip")?,
                limit: optional_limit(cmd, "limit")?,
                collation: optional_collation(cmd)?,
            }),
            "distinct" => Command::Distinct(Distinct {
                coll: collection(cmd, "distinct")?,
                key: match optional_string(cmd, "key")? {
                    Some(key) if !key.is_empty() && !key.starts_with('$') => key,
                    _ => return Err(DbError::BadValue("distinct needs a field name as key".into())),
                },
                query: optional_document(cmd, "query")?,
                collation: optional_collation(cmd)?,
            }),
            "insert" => Command::Insert(Insert {
                coll: collection(cmd, "insert")?,
                documents: document_array(cmd, "documents")?,
                ordered: optional_bool(cmd, "ordered")?,
            }),
            "delete" => Command::Delete(Delete {
                coll: collection(cmd, "delete")?,
                deletes: document_array(cmd, "deletes")?
                    .iter()
                    .map(parse_delete)
                    .collect::<Result<_, _>>()?,
                ordered: optional_bool(cmd, "ordered")?,
            }),
            "update" => Command::Update(Update {
                coll: collection(cmd, "update")?,
                updates: document_array(cmd, "updates")?
                    .iter()
                    .map(parse_update)
                    .collect::<Result<_, _>>()?,
                ordered: optional_bool(cmd, "ordered")?,
            }),
            "create" => Command::Create(Create {
                coll: collection(cmd, "create")?,
                view_on: optional_string(cmd, "viewOn")?,
                pipeline: match cmd.get("pipeline") {
                    None => Vec::new(),
                    Some(_) => document_array(cmd, "pipeline")?,
                },
                options: cmd
                    .iter()
                    .filter(|(k, _)| k.as_str() != "create")
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            }),
            "drop" => Command::Drop(DropCollection {
                coll: collection(cmd, "drop")?,
            }),
            other => return Err(DbError::UnsupportedCommand(other.to_string())),
        })
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Command::Find(_) => "find",
            Command::Aggregate(_) => "aggregate",
            Command::GetMore(_) => "getMore",
            Command::KillCursors(_) => "killCursors",
            Command::Count(_) => "count",
            Command::Distinct(_) => "distinct",
            Command::Insert(_) => "insert",
            Command::Delete(_) => "delete",
            Command::Update(_) => "update",
            Command::Create(_) => "create",
            Command::Drop(_) => "drop",
        }
    }

    pub(crate) fn execute(self, db: &Database, name: &str) -> Result<Document, DbError> {
        match self {
            Command::Find(cmd) => read::find(db, name, cmd),
            Command::Aggregate(cmd) => read::aggregate(db, name, cmd),
            Command::GetMore(cmd) => read::get_more(db, cmd),
            Command::KillCursors(cmd) => read::kill_cursors(db, cmd),
            Command::Count(cmd) => read::count(db, name, cmd),
            Command::Distinct(cmd) => read::distinct(db, name, cmd),
            Command::Insert(cmd) => write::insert(db, name, cmd),
            Command::Delete(cmd) => write::delete(db, name, cmd),
            Command::Update(cmd) => write::update(db, name, cmd),
            Command::Create(cmd) => admin::create(db, name, cmd),
            Command::Drop(cmd) => admin::drop(db, name, cmd),
        }
    }
}

fn parse_delete(spec: &Document) -> Result<DeleteStatement, DbError> {
    Ok(DeleteStatement {
        q: optional_document(spec, "q")?.unwrap_or_default(),
        limit: match optional_count(spec, "limit")? {
            None | Some(0) => 0,
            Some(1) => 1,
            Some(n) => {
                return Err(DbError::BadValue(format!(
                    "the limit field in delete objects must be 0 or 1, got {n}"
                )));
            }
        },
        collation: optional_collation(spec)?,
    })
}

fn parse_update(spec: &Document) -> Result<UpdateStatement, DbError> {
    Ok(UpdateStatement {
        q: optional_document(spec, "q")?.unwrap_or_default(),
        u: match spec.get("u") {
            Some(u @ (Bson::Document(_) | Bson::Array(_))) => u.clone(),
            _ => return Err(DbError::InvalidUpdate("u must be a document or a pipeline".into())),
        },
        upsert: optional_bool(spec, "upsert")?.unwrap_or(false),
        multi: optional_bool(spec, "multi")?.unwrap_or(false),
        collation: optional_collation(spec)?,
    })
}

// ── Field readers ───────────────────────────────────────────────

fn collection(cmd: &Document, verb: &str) -> Result<String, DbError> {
    match cmd.get(verb) {
        Some(Bson::String(coll)) if !coll.is_empty() => Ok(coll.clone()),
        _ => Err(DbError::BadValue(format!(
            "{verb} needs a non-empty collection name"
        ))),
    }
}

fn optional_string(cmd: &Document, key: &str) -> Result<Option<String>, DbError> {
    match cmd.get(key) {
        None | Some(Bson::Null) => Ok(None),
        Some(Bson::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(DbError::BadValue(format!("{key} must be a string"))),
    }
}

fn optional_document(cmd: &Document, key: &str) -> Result<Option<Document>, DbError> {
    match cmd.get(key) {
        None | Some(Bson::Null) => Ok(None),
        Some(Bson::Document(doc)) => Ok(Some(doc.clone())),
        Some(_) => Err(DbError::BadValue(format!("{key} must be a document"))),
    }
}

fn optional_bool(cmd: &Document, key: &str) -> Result<Option<bool>, DbError> {
    match cmd.get(key) {
        None | Some(Bson::Null) => Ok(None),
        Some(Bson::Boolean(b)) => Ok(Some(*b)),
        Some(_) => Err(DbError::BadValue(format!("{key} must be a boolean"))),
    }
}

fn integer(value: Option<&Bson>, key: &str) -> Result<i64, DbError> {
    match value {
        Some(Bson::Int32(n)) => Ok(i64::from(*n)),
        Some(Bson::Int64(n)) => Ok(*n),
        Some(Bson::Double(f)) if f.fract() == 0.0 && f.is_finite() => Ok(*f as i64),
        _ => Err(DbError::BadValue(format!("{key} must be an integer"))),
    }
}

fn optional_count(cmd: &Document, key: &str) -> Result<Option<u64>, DbError> {
    match cmd.get(key) {
        None | Some(Bson::Null) => Ok(None),
        value => match integer(value, key)? {
            n if n >= 0 => Ok(Some(n as u64)),
            _ => Err(DbError::BadValue(format!("{key} must be non-negative"))),
        },
    }
}

/// A negative limit means the same as its absolute value; 0 means none.
fn optional_limit(cmd: &Document, key: &str) -> Result<Option<u64>, DbError> {
    match cmd.get(key) {
        None | Some(Bson::Null) => Ok(None),
        value => Ok(match integer(value, key)?.unsigned_abs() {
            0 => None,
            n => Some(n),
        }),
    }
}

fn document_array(cmd: &Document, key: &str) -> Result<Vec<Document>, DbError> {
    match cmd.get(key) {
        Some(Bson::Array(items)) => items
            .iter()
            .map(|item| match item {
                Bson::Document(doc) => Ok(doc.clone()),
                _ => Err(DbError::BadValue(format!("{key} must only contain documents"))),
            })
            .collect(),
        _ => Err(DbError::BadValue(format!("{key} must be an array"))),
    }
}

fn optional_collation(cmd: &Document) -> Result<Option<Collation>, DbError> {
    match optional_document(cmd, "collation")? {
        Some(spec) => Ok(Some(Collation::from_document(&spec)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn verb_is_the_first_key() {
        let cmd = Command::parse(&doc! { "find": "items", "filter": { "a": 1 }, "limit": -2 }).unwrap();
        let Command::Find(find) = cmd else {
            panic!("expected find");
        };
        assert_eq!(find.coll, "items");
        assert_eq!(find.limit, Some(2));
        assert_eq!(find.filter, Some(doc! { "a": 1 }));
    }

    #[test]
    fn unknown_verbs_are_unsupported() {
        assert!(matches!(
            Command::parse(&doc! { "mapReduce": "items" }),
            Err(DbError::UnsupportedCommand(verb)) if verb == "mapReduce"
        ));
        assert!(Command::parse(&doc! {}).is_err());
    }

    #[test]
    fn aggregate_targets() {
        let Command::Aggregate(agg) =
            Command::parse(&doc! { "aggregate": 1, "pipeline": [], "cursor": { "batchSize": 5 } })
                .unwrap()
        else {
            panic!("expected aggregate");
        };
        assert!(matches!(agg.target, AggregateTarget::Database));
        assert_eq!(agg.batch_size, Some(5));
        assert!(Command::parse(&doc! { "aggregate": "c", "pipeline": {} }).is_err());
    }

    #[test]
    fn malformed_fields() {
        assert!(Command::parse(&doc! { "insert": "c", "documents": [1] }).is_err());
        assert!(Command::parse(&doc! { "delete": "c", "deletes": [{ "q": {}, "limit": 5 }] }).is_err());
        assert!(Command::parse(&doc! { "update": "c", "updates": [{ "q": {}, "u": 1 }] }).is_err());
        assert!(Command::parse(&doc! { "find": "c", "skip": -1 }).is_err());
        assert!(Command::parse(&doc! { "distinct": "c" }).is_err());
        assert!(Command::parse(&doc! { "find": "c", "collation": { "strength": 2 } }).is_err());
    }

    #[test]
    fn getmore_accepts_either_integer_width() {
        let Command::GetMore(more) = Command::parse(&doc! { "getMore": 7_i64, "collection": "c" }).unwrap()
        else {
            panic!("expected getMore");
        };
        assert_eq!(more.cursor_id, 7);
        assert!(Command::parse(&doc! { "getMore": 7, "collection": "c" }).is_ok());
    }
}
