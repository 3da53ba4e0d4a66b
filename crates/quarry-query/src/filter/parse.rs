use bson::{Bson, Document};
use regex::Regex;

use super::{Condition, ElemMatch, Filter};
use crate::error::QueryError;

/// Parse a BSON filter document into a [`Filter`] tree.
///
/// Follows MongoDB query semantics:
/// - Top-level document is an implicit AND of all entries; `{}` matches all
/// - `{ "field": value }` is implicit `$eq`
/// - `{ "field": { "$gt": v } }` uses operator sub-documents
/// - `{ "$or": [...] }` / `{ "$and": [...] }` / `{ "$nor": [...] }` for logic
/// - `{ "field": { "$regex": "pattern", "$options": "i" } }` for regex
pub fn parse_filter(doc: &Document) -> Result<Filter, QueryError> {
    let mut children = Vec::new();

    for (key, value) in doc {
        match key.as_str() {
            "$and" => children.push(Filter::And(parse_logical_array(key, value)?)),
            "$or" => children.push(Filter::Or(parse_logical_array(key, value)?)),
            "$nor" => children.push(Filter::Nor(parse_logical_array(key, value)?)),
            k if k.starts_with('$') => {
                return Err(QueryError::InvalidFilter(format!(
                    "unknown top-level operator: {k}"
                )));
            }
            _ => children.push(Filter::Field(key.clone(), parse_field_condition(value)?)),
        }
    }

    if children.len() == 1 {
        Ok(children.remove(0))
    } else {
        Ok(Filter::And(children))
    }
}

fn parse_logical_array(op: &str, value: &Bson) -> Result<Vec<Filter>, QueryError> {
    let Bson::Array(items) = value else {
        return Err(QueryError::InvalidFilter(format!("{op} value must be an array")));
    };
    if items.is_empty() {
        return Err(QueryError::InvalidFilter(format!("{op} array must not be empty")));
    }
    items
        .iter()
        .map(|item| match item {
            Bson::Document(sub) => parse_filter(sub),
            _ => Err(QueryError::InvalidFilter(format!(
                "{op} array elements must be documents"
            ))),
        })
        .collect()
}

fn is_operator_doc(value: &Bson) -> Option<&Document> {
    match value {
        Bson::Document(sub) if sub.keys().next().is_some_and(|k| k.starts_with('$')) => Some(sub),
        _ => None,
    }
}

/// Either implicit `$eq` or an operator sub-document.
fn parse_field_condition(value: &Bson) -> Result<Condition, QueryError> {
    match is_operator_doc(value) {
        Some(sub) => parse_operator_doc(sub),
        None => Ok(Condition::Eq(value.clone())),
    }
}

/// Parse an operator sub-document like `{ "$gt": 21, "$lte": 100 }`.
fn parse_operator_doc(doc: &Document) -> Result<Condition, QueryError> {
    let mut conditions = Vec::new();
    let mut pattern: Option<&str> = None;
    let mut options: Option<&str> = None;

    for (op, value) in doc {
        let condition = match op.as_str() {
            "$eq" => Condition::Eq(value.clone()),
            "$ne" => Condition::Ne(value.clone()),
            "$gt" => Condition::Gt(value.clone()),
            "$gte" => Condition::Gte(value.clone()),
            "$lt" => Condition::Lt(value.clone()),
            "$lte" => Condition::Lte(value.clone()),
            "$in" => Condition::In(array_operand(op, value)?),
            "$nin" => Condition::Nin(array_operand(op, value)?),
            "$all" => Condition::All(array_operand(op, value)?),
            "$exists" => Condition::Exists(crate::value::is_truthy(value)),
            "$size" => match crate::value::as_i64(value) {
                Some(n) if n >= 0 => Condition::Size(n as usize),
                _ => {
                    return Err(QueryError::InvalidFilter(
                        "$size needs a non-negative integer".into(),
                    ));
                }
            },
            "$type" => Condition::Type(parse_type_names(value)?),
            "$elemMatch" => Condition::ElemMatch(parse_elem_match(value)?),
            "$not" => match is_operator_doc(value) {
                Some(sub) => Condition::Not(Box::new(parse_operator_doc(sub)?)),
                None => {
                    return Err(QueryError::InvalidFilter(
                        "$not needs an operator document".into(),
                    ));
                }
            },
            "$regex" => {
                pattern = Some(string_operand(op, value)?);
                continue;
            }
            "$options" => {
                options = Some(string_operand(op, value)?);
                continue;
            }
            k => {
                return Err(QueryError::InvalidFilter(format!(
                    "unknown field operator: {k}"
                )));
            }
        };
        conditions.push(condition);
    }

    match (pattern, options) {
        (Some(pat), opts) => conditions.push(Condition::Regex(build_regex(pat, opts)?)),
        (None, Some(_)) => {
            return Err(QueryError::InvalidFilter("$options without $regex".into()));
        }
        (None, None) => {}
    }

    match conditions.len() {
        0 => Err(QueryError::InvalidFilter("empty operator document".into())),
        1 => Ok(conditions.remove(0)),
        _ => Ok(Condition::And(conditions)),
    }
}

fn parse_elem_match(value: &Bson) -> Result<ElemMatch, QueryError> {
    if let Some(sub) = is_operator_doc(value)
        && !sub.keys().any(|k| matches!(k.as_str(), "$and" | "$or" | "$nor"))
    {
        return Ok(ElemMatch::Value(Box::new(parse_operator_doc(sub)?)));
    }
    match value {
        Bson::Document(sub) => Ok(ElemMatch::Document(Box::new(parse_filter(sub)?))),
        _ => Err(QueryError::InvalidFilter(
            "$elemMatch needs a document".into(),
        )),
    }
}

fn parse_type_names(value: &Bson) -> Result<Vec<String>, QueryError> {
    let names = match value {
        Bson::String(s) => vec![s.clone()],
        Bson::Array(items) => items
            .iter()
            .map(|item| match item {
                Bson::String(s) => Ok(s.clone()),
                _ => Err(QueryError::InvalidFilter("$type names must be strings".into())),
            })
            .collect::<Result<_, _>>()?,
        _ => {
            return Err(QueryError::InvalidFilter(
                "$type needs a type name or an array of names".into(),
            ));
        }
    };
    Ok(names)
}

fn array_operand(op: &str, value: &Bson) -> Result<Vec<Bson>, QueryError> {
    match value {
        Bson::Array(items) => Ok(items.clone()),
        _ => Err(QueryError::InvalidFilter(format!("{op} needs an array"))),
    }
}

fn string_operand<'a>(op: &str, value: &'a Bson) -> Result<&'a str, QueryError> {
    match value {
        Bson::String(s) => Ok(s),
        _ => Err(QueryError::InvalidFilter(format!("{op} value must be a string"))),
    }
}

fn build_regex(pattern: &str, options: Option<&str>) -> Result<Regex, QueryError> {
    let full_pattern = match options {
        Some(opts) if !opts.is_empty() => {
            let mut prefix = String::with_capacity(4 + opts.len() + pattern.len());
            prefix.push_str("(?");
            for ch in opts.chars() {
                match ch {
                    'i' | 's' | 'm' | 'x' => prefix.push(ch),
                    c => {
                        return Err(QueryError::InvalidFilter(format!(
                            "unknown regex option: {c}"
                        )));
                    }
                }
            }
            prefix.push(')');
            prefix.push_str(pattern);
            prefix
        }
        _ => pattern.to_string(),
    };
    Regex::new(&full_pattern)
        .map_err(|e| QueryError::InvalidFilter(format!("invalid regex pattern: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn single_condition_is_not_wrapped() {
        let f = parse_filter(&doc! { "a": 1 }).unwrap();
        assert!(matches!(f, Filter::Field(ref p, Condition::Eq(_)) if p == "a"));
    }

    #[test]
    fn multiple_operators_combine() {
        let f = parse_filter(&doc! { "a": { "$gt": 1, "$lt": 5 } }).unwrap();
        assert!(matches!(f, Filter::Field(_, Condition::And(ref c)) if c.len() == 2));
    }

    #[test]
    fn plain_subdocument_is_equality() {
        let f = parse_filter(&doc! { "a": { "b": 1 } }).unwrap();
        assert!(matches!(f, Filter::Field(_, Condition::Eq(Bson::Document(_)))));
    }

    #[test]
    fn rejects_unknown_operators() {
        assert!(parse_filter(&doc! { "$where": "x" }).is_err());
        assert!(parse_filter(&doc! { "a": { "$near": 1 } }).is_err());
        assert!(parse_filter(&doc! { "a": { "$options": "i" } }).is_err());
        assert!(parse_filter(&doc! { "$or": [] }).is_err());
        assert!(parse_filter(&doc! { "a": { "$in": 1 } }).is_err());
        assert!(parse_filter(&doc! { "a": { "$regex": "(" } }).is_err());
    }
}
