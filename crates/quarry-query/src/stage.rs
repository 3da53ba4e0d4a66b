use std::collections::HashMap;
use std::sync::LazyLock;

use bson::{Bson, Document};

use crate::accumulator::Accumulator;
use crate::error::QueryError;
use crate::expr::Expr;
use crate::filter::{Filter, parse_filter};
use crate::projection::{Projection, flatten};
use crate::sort::{Sort, parse_sort};
use crate::value::as_i64;

/// One parsed pipeline stage.
#[derive(Debug, Clone)]
pub enum Stage {
    Match(Filter),
    Project(Projection),
    AddFields(Vec<(String, Expr)>),
    Unset(Vec<String>),
    Sort(Vec<Sort>),
    Skip(u64),
    Limit(u64),
    Count(String),
    Unwind(Unwind),
    Group(Group),
    Lookup(Lookup),
    ReplaceRoot(Expr),
    SortByCount(Expr),
    Out(OutSpec),
    Merge(MergeSpec),
}

#[derive(Debug, Clone)]
pub struct Unwind {
    pub path: String,
    pub include_array_index: Option<String>,
    pub preserve_null_and_empty_arrays: bool,
}

#[derive(Debug, Clone)]
pub struct Group {
    pub id: Expr,
    pub accumulators: Vec<(String, Accumulator)>,
}

#[derive(Debug, Clone)]
pub struct Lookup {
    pub from: String,
    pub local_field: String,
    pub foreign_field: String,
    pub as_field: String,
}

/// Target of `$out`. `db` defaults to the database the pipeline runs in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutSpec {
    pub db: Option<String>,
    pub coll: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhenMatched {
    Replace,
    KeepExisting,
    Merge,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhenNotMatched {
    Insert,
    Discard,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSpec {
    pub into: OutSpec,
    pub on: Vec<String>,
    pub when_matched: WhenMatched,
    pub when_not_matched: WhenNotMatched,
}

impl Stage {
    pub fn parse(spec: &Document) -> Result<Self, QueryError> {
        let name = stage_name(spec)?;
        let parser = STAGES
            .get(name)
            .ok_or_else(|| QueryError::UnknownStage(name.to_string()))?;
        let value = spec
            .get(name)
            .ok_or_else(|| QueryError::InvalidStage(format!("{name} has no value")))?;
        parser(value)
    }

    /// Stages that must see all input before producing output.
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            Stage::Sort(_) | Stage::Group(_) | Stage::Count(_) | Stage::SortByCount(_)
        )
    }

    /// `$out` and `$merge` write their input elsewhere instead of producing it.
    pub fn is_sink(&self) -> bool {
        matches!(self, Stage::Out(_) | Stage::Merge(_))
    }
}

/// The single key naming a stage document, e.g. `"$match"`.
pub fn stage_name(spec: &Document) -> Result<&str, QueryError> {
    let mut keys = spec.keys();
    match (keys.next(), keys.next()) {
        (Some(name), None) => Ok(name.as_str()),
        _ => Err(QueryError::InvalidStage(format!(
            "a pipeline stage specification object must contain exactly one field, found {}",
            spec.len()
        ))),
    }
}

// ── Registration ────────────────────────────────────────────────

type StageParser = fn(&Bson) -> Result<Stage, QueryError>;

static STAGE_TABLE: &[(&str, StageParser)] = &[
    ("$match", parse_match),
    ("$project", |v| Ok(Stage::Project(Projection::parse(document(v, "$project")?)?))),
    ("$addFields", |v| Ok(Stage::AddFields(parse_set_fields(document(v, "$addFields")?)?))),
    ("$set", |v| Ok(Stage::AddFields(parse_set_fields(document(v, "$set")?)?))),
    ("$unset", parse_unset),
    ("$sort", |v| Ok(Stage::Sort(parse_sort(document(v, "$sort")?)?))),
    ("$skip", |v| Ok(Stage::Skip(non_negative(v, "$skip")?))),
    ("$limit", parse_limit),
    ("$count", parse_count),
    ("$unwind", parse_unwind),
    ("$group", parse_group),
    ("$lookup", parse_lookup),
    ("$replaceRoot", parse_replace_root),
    ("$replaceWith", |v| Ok(Stage::ReplaceRoot(Expr::parse(v)?))),
    ("$sortByCount", parse_sort_by_count),
    ("$out", |v| Ok(Stage::Out(parse_namespace(v, "$out")?))),
    ("$merge", parse_merge),
];

static STAGES: LazyLock<HashMap<&'static str, StageParser>> =
    LazyLock::new(|| STAGE_TABLE.iter().copied().collect());

// ── Parsers ─────────────────────────────────────────────────────

fn document<'a>(value: &'a Bson, stage: &str) -> Result<&'a Document, QueryError> {
    match value {
        Bson::Document(doc) => Ok(doc),
        _ => Err(QueryError::InvalidStage(format!(
            "the {stage} stage specification must be an object"
        ))),
    }
}

fn string<'a>(value: Option<&'a Bson>, what: &str) -> Result<&'a str, QueryError> {
    match value {
        Some(Bson::String(s)) => Ok(s),
        _ => Err(QueryError::InvalidStage(format!("{what} must be a string"))),
    }
}

fn non_negative(value: &Bson, stage: &str) -> Result<u64, QueryError> {
    match as_i64(value) {
        Some(n) if n >= 0 => Ok(n as u64),
        _ => Err(QueryError::InvalidStage(format!(
            "{stage} needs a non-negative integer"
        ))),
    }
}

fn parse_match(value: &Bson) -> Result<Stage, QueryError> {
    Ok(Stage::Match(parse_filter(document(value, "$match")?)?))
}

fn parse_limit(value: &Bson) -> Result<Stage, QueryError> {
    match non_negative(value, "$limit")? {
        0 => Err(QueryError::InvalidStage("the limit must be positive".into())),
        n => Ok(Stage::Limit(n)),
    }
}

/// `$set` / `$addFields`: nested plain documents set their leaves, so
/// `{ a: { b: 1 } }` adds `a.b` without dropping the rest of `a`.
pub(crate) fn parse_set_fields(spec: &Document) -> Result<Vec<(String, Expr)>, QueryError> {
    let mut fields = Vec::new();
    flatten(spec, "", &mut fields)?;
    fields
        .into_iter()
        .map(|(path, value)| Ok((path, Expr::parse(value)?)))
        .collect()
}

fn parse_unset(value: &Bson) -> Result<Stage, QueryError> {
    let paths = match value {
        Bson::String(s) => vec![s.clone()],
        Bson::Array(items) if !items.is_empty() => items
            .iter()
            .map(|item| string(Some(item), "$unset field").map(str::to_string))
            .collect::<Result<_, _>>()?,
        _ => {
            return Err(QueryError::InvalidStage(
                "$unset specification must be a string or a non-empty array of strings".into(),
            ));
        }
    };
    Ok(Stage::Unset(paths))
}

fn parse_count(value: &Bson) -> Result<Stage, QueryError> {
    let field = string(Some(value), "the count field")?;
    if field.is_empty() || field.starts_with('$') || field.contains('.') {
        return Err(QueryError::InvalidStage(format!(
            "invalid $count field name: '{field}'"
        )));
    }
    Ok(Stage::Count(field.to_string()))
}

fn field_path(value: &str, what: &str) -> Result<String, QueryError> {
    match value.strip_prefix('$') {
        Some(path) if !path.is_empty() && !path.starts_with('$') => Ok(path.to_string()),
        _ => Err(QueryError::InvalidStage(format!(
            "{what} must be a field path prefixed with '$', got '{value}'"
        ))),
    }
}

fn parse_unwind(value: &Bson) -> Result<Stage, QueryError> {
    let unwind = match value {
        Bson::String(s) => Unwind {
            path: field_path(s, "$unwind path")?,
            include_array_index: None,
            preserve_null_and_empty_arrays: false,
        },
        Bson::Document(doc) => Unwind {
            path: field_path(string(doc.get("path"), "$unwind path")?, "$unwind path")?,
            include_array_index: match doc.get("includeArrayIndex") {
                None => None,
                Some(v) => Some(string(Some(v), "includeArrayIndex")?.to_string()),
            },
            preserve_null_and_empty_arrays: match doc.get("preserveNullAndEmptyArrays") {
                None => false,
                Some(Bson::Boolean(b)) => *b,
                Some(_) => {
                    return Err(QueryError::InvalidStage(
                        "preserveNullAndEmptyArrays must be a boolean".into(),
                    ));
                }
            },
        },
        _ => {
            return Err(QueryError::InvalidStage(
                "$unwind needs a field path or an options document".into(),
            ));
        }
    };
    Ok(Stage::Unwind(unwind))
}

fn parse_group(value: &Bson) -> Result<Stage, QueryError> {
    let spec = document(value, "$group")?;
    let id = spec
        .get("_id")
        .ok_or_else(|| QueryError::InvalidStage("a group specification must include an _id".into()))?;
    let accumulators = spec
        .iter()
        .filter(|(k, _)| k.as_str() != "_id")
        .map(|(k, v)| {
            if k.contains('.') {
                return Err(QueryError::InvalidStage(format!(
                    "the group aggregate field name '{k}' cannot contain '.'"
                )));
            }
            Ok((k.clone(), Accumulator::parse(k, v)?))
        })
        .collect::<Result<_, _>>()?;
    Ok(Stage::Group(Group {
        id: Expr::parse(id)?,
        accumulators,
    }))
}

fn parse_lookup(value: &Bson) -> Result<Stage, QueryError> {
    let spec = document(value, "$lookup")?;
    if spec.contains_key("pipeline") {
        return Err(QueryError::InvalidStage(
            "$lookup with a pipeline is not supported".into(),
        ));
    }
    Ok(Stage::Lookup(Lookup {
        from: string(spec.get("from"), "$lookup from")?.to_string(),
        local_field: string(spec.get("localField"), "$lookup localField")?.to_string(),
        foreign_field: string(spec.get("foreignField"), "$lookup foreignField")?.to_string(),
        as_field: string(spec.get("as"), "$lookup as")?.to_string(),
    }))
}

fn parse_replace_root(value: &Bson) -> Result<Stage, QueryError> {
    let spec = document(value, "$replaceRoot")?;
    let root = spec
        .get("newRoot")
        .ok_or_else(|| QueryError::InvalidStage("no newRoot specified for $replaceRoot".into()))?;
    Ok(Stage::ReplaceRoot(Expr::parse(root)?))
}

fn parse_sort_by_count(value: &Bson) -> Result<Stage, QueryError> {
    let expr = Expr::parse(value)?;
    match expr {
        Expr::Field(_) | Expr::Operator(..) => Ok(Stage::SortByCount(expr)),
        _ => Err(QueryError::InvalidStage(
            "$sortByCount needs a field path or an expression object".into(),
        )),
    }
}

fn parse_namespace(value: &Bson, stage: &str) -> Result<OutSpec, QueryError> {
    match value {
        Bson::String(coll) if !coll.is_empty() => Ok(OutSpec {
            db: None,
            coll: coll.clone(),
        }),
        Bson::Document(doc) => Ok(OutSpec {
            db: match doc.get("db") {
                None => None,
                Some(v) => Some(string(Some(v), &format!("{stage} db"))?.to_string()),
            },
            coll: string(doc.get("coll"), &format!("{stage} coll"))?.to_string(),
        }),
        _ => Err(QueryError::InvalidStage(format!(
            "{stage} needs a collection name or a {{db, coll}} document"
        ))),
    }
}

fn parse_merge(value: &Bson) -> Result<Stage, QueryError> {
    let spec = match value {
        Bson::String(_) => {
            return Ok(Stage::Merge(MergeSpec {
                into: parse_namespace(value, "$merge")?,
                on: vec!["_id".to_string()],
                when_matched: WhenMatched::Merge,
                when_not_matched: WhenNotMatched::Insert,
            }));
        }
        other => document(other, "$merge")?,
    };
    let into = parse_namespace(
        spec.get("into")
            .ok_or_else(|| QueryError::InvalidStage("$merge requires 'into'".into()))?,
        "$merge into",
    )?;
    let on = match spec.get("on") {
        None => vec!["_id".to_string()],
        Some(Bson::String(s)) => vec![s.clone()],
        Some(Bson::Array(items)) if !items.is_empty() => items
            .iter()
            .map(|item| string(Some(item), "$merge on field").map(str::to_string))
            .collect::<Result<_, _>>()?,
        Some(_) => {
            return Err(QueryError::InvalidStage(
                "$merge 'on' must be a string or a non-empty array of strings".into(),
            ));
        }
    };
    let when_matched = match spec.get("whenMatched") {
        None => WhenMatched::Merge,
        Some(v) => match string(Some(v), "$merge whenMatched")? {
            "replace" => WhenMatched::Replace,
            "keepExisting" => WhenMatched::KeepExisting,
            "merge" => WhenMatched::Merge,
            "fail" => WhenMatched::Fail,
            other => {
                return Err(QueryError::InvalidStage(format!(
                    "unsupported $merge whenMatched mode '{other}'"
                )));
            }
        },
    };
    let when_not_matched = match spec.get("whenNotMatched") {
        None => WhenNotMatched::Insert,
        Some(v) => match string(Some(v), "$merge whenNotMatched")? {
            "insert" => WhenNotMatched::Insert,
            "discard" => WhenNotMatched::Discard,
            "fail" => WhenNotMatched::Fail,
            other => {
                return Err(QueryError::InvalidStage(format!(
                    "unsupported $merge whenNotMatched mode '{other}'"
                )));
            }
        },
    };
    Ok(Stage::Merge(MergeSpec {
        into,
        on,
        when_matched,
        when_not_matched,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn parses_every_registered_stage() {
        let specs = [
            doc! { "$match": { "a": 1 } },
            doc! { "$project": { "a": 1 } },
            doc! { "$addFields": { "b": "$a" } },
            doc! { "$set": { "b": 1 } },
            doc! { "$unset": ["a", "b"] },
            doc! { "$sort": { "a": -1 } },
            doc! { "$skip": 2 },
            doc! { "$limit": 5 },
            doc! { "$count": "n" },
            doc! { "$unwind": "$tags" },
            doc! { "$group": { "_id": "$a", "n": { "$sum": 1 } } },
            doc! { "$lookup": { "from": "b", "localField": "x", "foreignField": "y", "as": "z" } },
            doc! { "$replaceRoot": { "newRoot": "$inner" } },
            doc! { "$replaceWith": "$inner" },
            doc! { "$sortByCount": "$tag" },
            doc! { "$out": "target" },
            doc! { "$merge": { "into": "target", "whenMatched": "replace" } },
        ];
        for spec in &specs {
            assert!(Stage::parse(spec).is_ok(), "failed to parse {spec}");
        }
    }

    #[test]
    fn unknown_stage() {
        assert!(matches!(
            Stage::parse(&doc! { "$bucketAuto": {} }),
            Err(QueryError::UnknownStage(name)) if name == "$bucketAuto"
        ));
        assert!(Stage::parse(&doc! { "$match": {}, "$limit": 1 }).is_err());
    }

    #[test]
    fn merge_defaults() {
        let Stage::Merge(spec) = Stage::parse(&doc! { "$merge": "target" }).unwrap() else {
            panic!("expected $merge");
        };
        assert_eq!(spec.on, vec!["_id".to_string()]);
        assert_eq!(spec.when_matched, WhenMatched::Merge);
        assert_eq!(spec.when_not_matched, WhenNotMatched::Insert);
        assert_eq!(spec.into, OutSpec { db: None, coll: "target".into() });
    }

    #[test]
    fn out_accepts_a_namespace_document() {
        let Stage::Out(spec) = Stage::parse(&doc! { "$out": { "db": "other", "coll": "t" } }).unwrap()
        else {
            panic!("expected $out");
        };
        assert_eq!(spec.db.as_deref(), Some("other"));
    }

    #[test]
    fn invalid_arguments() {
        assert!(Stage::parse(&doc! { "$limit": 0 }).is_err());
        assert!(Stage::parse(&doc! { "$skip": -1 }).is_err());
        assert!(Stage::parse(&doc! { "$count": "a.b" }).is_err());
        assert!(Stage::parse(&doc! { "$unwind": "tags" }).is_err());
        assert!(Stage::parse(&doc! { "$group": { "n": { "$sum": 1 } } }).is_err());
        assert!(Stage::parse(&doc! { "$sortByCount": 5 }).is_err());
    }

    #[test]
    fn blocking_and_sink_classification() {
        assert!(Stage::parse(&doc! { "$sort": { "a": 1 } }).unwrap().is_blocking());
        assert!(!Stage::parse(&doc! { "$limit": 1 }).unwrap().is_blocking());
        assert!(Stage::parse(&doc! { "$out": "x" }).unwrap().is_sink());
    }
}
