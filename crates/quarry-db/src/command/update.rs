use bson::{Bson, Document, doc};

use crate::error::DbError;

/// How a rewritten update reports each changed document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpdateKind {
    Update,
    Replace,
}

/// An update's `u`, expressed as pipeline stages applied to each match.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Rewrite {
    pub stages: Vec<Document>,
    pub kind: UpdateKind,
}

/// Classifies `u` as a pipeline, an operator document or a replacement.
pub(crate) fn rewrite_update(u: &Bson) -> Result<Rewrite, DbError> {
    match u {
        Bson::Array(stages) => Ok(Rewrite {
            stages: stages
                .iter()
                .map(|stage| match stage {
                    Bson::Document(doc) => Ok(doc.clone()),
                    _ => Err(DbError::InvalidUpdate(
                        "an update pipeline may only contain documents".into(),
                    )),
                })
                .collect::<Result<_, _>>()?,
            kind: UpdateKind::Update,
        }),
        Bson::Document(spec) if spec.keys().next().is_some_and(|k| k.starts_with('$')) => {
            Ok(Rewrite {
                stages: spec
                    .iter()
                    .map(|(op, fields)| rewrite_operator(op, fields))
                    .collect::<Result<_, _>>()?,
                kind: UpdateKind::Update,
            })
        }
        Bson::Document(replacement) => Ok(Rewrite {
            stages: replace_stages(replacement)?,
            kind: UpdateKind::Replace,
        }),
        _ => Err(DbError::InvalidUpdate("u must be a document or a pipeline".into())),
    }
}

/// Keep only `_id`, then set every top-level field of the replacement
/// verbatim.
fn replace_stages(replacement: &Document) -> Result<Vec<Document>, DbError> {
    let mut fields = Document::new();
    for (key, value) in replacement {
        if key.starts_with('$') {
            return Err(DbError::InvalidUpdate(format!(
                "the dollar ($) prefixed field '{key}' is not allowed in a replacement document"
            )));
        }
        fields.insert(key.clone(), literal(value));
    }
    let mut stages = vec![doc! { "$project": { "_id": 1 } }];
    if !fields.is_empty() {
        stages.push(doc! { "$set": fields });
    }
    Ok(stages)
}

fn rewrite_operator(op: &str, fields: &Bson) -> Result<Document, DbError> {
    let Bson::Document(fields) = fields else {
        return Err(DbError::InvalidUpdate(format!(
            "modifiers like {op} need a document argument"
        )));
    };
    if fields.is_empty() {
        return Err(DbError::InvalidUpdate(format!(
            "'{op}' is empty; you must specify a field like so: {{{op}: {{<field>: ...}}}}"
        )));
    }

    if op == "$unset" {
        let paths: Vec<Bson> = fields.keys().map(|k| Bson::String(k.clone())).collect();
        return Ok(doc! { "$unset": paths });
    }

    let mut set = Document::new();
    for (field, value) in fields {
        let current = Bson::String(format!("${field}"));
        let expr = match op {
            "$set" => literal(value),
            "$inc" => arithmetic("$add", op, field, current, value)?,
            "$mul" => arithmetic("$multiply", op, field, current, value)?,
            "$min" | "$max" => Bson::Document(doc! {
                op: [
                    { "$ifNull": [current, literal(value)] },
                    literal(value),
                ]
            }),
            "$push" => {
                let items = match value {
                    Bson::Document(each) if each.contains_key("$each") => match each.get("$each") {
                        Some(Bson::Array(items)) => items.iter().map(literal).collect(),
                        _ => {
                            return Err(DbError::InvalidUpdate(format!(
                                "the argument to $each in $push must be an array for field '{field}'"
                            )));
                        }
                    },
                    other => vec![literal(other)],
                };
                Bson::Document(doc! {
                    "$concatArrays": [ { "$ifNull": [current, []] }, items ]
                })
            }
            other => {
                return Err(DbError::InvalidUpdate(format!(
                    "unknown modifier: {other}"
                )));
            }
        };
        set.insert(field.clone(), expr);
    }
    Ok(doc! { "$set": set })
}

fn arithmetic(
    expr_op: &str,
    op: &str,
    field: &str,
    current: Bson,
    value: &Bson,
) -> Result<Bson, DbError> {
    if !matches!(value, Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_)) {
        return Err(DbError::InvalidUpdate(format!(
            "cannot apply {op} with a non-numeric argument to field '{field}'"
        )));
    }
    Ok(Bson::Document(doc! {
        expr_op: [ { "$ifNull": [current, 0] }, value.clone() ]
    }))
}

fn literal(value: &Bson) -> Bson {
    Bson::Document(doc! { "$literal": value.clone() })
}
