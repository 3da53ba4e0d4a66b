mod parse;

use std::cmp::Ordering;

use bson::{Bson, Document};
use regex::Regex;

use crate::collation::Collation;
use crate::path::leaf_values;
use crate::value::{compare_values, is_nullish, type_rank, values_equal};

pub use parse::parse_filter;

/// A parsed query filter.
#[derive(Debug, Clone)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Nor(Vec<Filter>),
    Field(String, Condition),
}

/// A condition on the values found at one field path.
#[derive(Debug, Clone)]
pub enum Condition {
    Eq(Bson),
    Ne(Bson),
    Gt(Bson),
    Gte(Bson),
    Lt(Bson),
    Lte(Bson),
    In(Vec<Bson>),
    Nin(Vec<Bson>),
    Exists(bool),
    Regex(Regex),
    Size(usize),
    All(Vec<Bson>),
    ElemMatch(ElemMatch),
    Type(Vec<String>),
    Not(Box<Condition>),
    And(Vec<Condition>),
}

/// `$elemMatch` either matches array elements as documents against a
/// nested filter, or as plain values against operator conditions.
#[derive(Debug, Clone)]
pub enum ElemMatch {
    Document(Box<Filter>),
    Value(Box<Condition>),
}

impl Filter {
    /// The filter matching every document.
    pub fn all() -> Self {
        Filter::And(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Filter::And(children) if children.is_empty())
    }

    pub fn matches(&self, doc: &Document, collation: Option<&Collation>) -> bool {
        match self {
            Filter::And(children) => children.iter().all(|c| c.matches(doc, collation)),
            Filter::Or(children) => children.iter().any(|c| c.matches(doc, collation)),
            Filter::Nor(children) => !children.iter().any(|c| c.matches(doc, collation)),
            Filter::Field(path, condition) => {
                let leaves = leaf_values(doc, path);
                condition.matches(&leaves, collation)
            }
        }
    }
}

impl Condition {
    /// Evaluate against the values found at a path. An empty slice means
    /// the field is missing.
    pub fn matches(&self, leaves: &[&Bson], collation: Option<&Collation>) -> bool {
        match self {
            Condition::Eq(target) => eq_matches(leaves, target, collation),
            Condition::Ne(target) => !eq_matches(leaves, target, collation),
            Condition::Gt(target)
            | Condition::Gte(target)
            | Condition::Lt(target)
            | Condition::Lte(target) => {
                let predicate: fn(Ordering) -> bool = match self {
                    Condition::Gt(_) => |o| o == Ordering::Greater,
                    Condition::Gte(_) => |o| o != Ordering::Less,
                    Condition::Lt(_) => |o| o == Ordering::Less,
                    _ => |o| o != Ordering::Greater,
                };
                expanded(leaves).any(|v| {
                    type_rank(v) == type_rank(target)
                        && predicate(compare_values(v, target, collation))
                })
            }
            Condition::In(targets) => targets.iter().any(|t| eq_matches(leaves, t, collation)),
            Condition::Nin(targets) => !targets.iter().any(|t| eq_matches(leaves, t, collation)),
            Condition::Exists(expected) => leaves.is_empty() != *expected,
            Condition::Regex(re) => expanded(leaves).any(|v| match v {
                Bson::String(s) => re.is_match(s),
                _ => false,
            }),
            Condition::Size(n) => leaves
                .iter()
                .any(|v| matches!(v, Bson::Array(items) if items.len() == *n)),
            Condition::All(targets) => {
                !targets.is_empty() && targets.iter().all(|t| eq_matches(leaves, t, collation))
            }
            Condition::ElemMatch(elem) => leaves.iter().any(|v| match v {
                Bson::Array(items) => items.iter().any(|item| elem.matches(item, collation)),
                _ => false,
            }),
            Condition::Type(names) => expanded(leaves).any(|v| {
                names.iter().any(|name| type_matches(v, name))
            }),
            Condition::Not(inner) => !inner.matches(leaves, collation),
            Condition::And(conditions) => conditions.iter().all(|c| c.matches(leaves, collation)),
        }
    }
}

impl ElemMatch {
    fn matches(&self, item: &Bson, collation: Option<&Collation>) -> bool {
        match self {
            ElemMatch::Document(filter) => match item {
                Bson::Document(d) => filter.matches(d, collation),
                _ => false,
            },
            ElemMatch::Value(condition) => condition.matches(&[item], collation),
        }
    }
}

/// Leaves plus the elements of any array leaf.
fn expanded<'a>(leaves: &'a [&'a Bson]) -> impl Iterator<Item = &'a Bson> + 'a {
    leaves.iter().flat_map(|&v| {
        let elements: &[Bson] = match v {
            Bson::Array(items) => items,
            _ => &[],
        };
        std::iter::once(v).chain(elements.iter())
    })
}

/// Equality: matches a leaf, an element of an array leaf, or (for a null
/// target) a missing field.
fn eq_matches(leaves: &[&Bson], target: &Bson, collation: Option<&Collation>) -> bool {
    if is_nullish(target) {
        return leaves.is_empty() || expanded(leaves).any(is_nullish);
    }
    expanded(leaves).any(|v| values_equal(v, target, collation))
}

fn type_matches(value: &Bson, name: &str) -> bool {
    match name {
        "double" => matches!(value, Bson::Double(_)),
        "string" => matches!(value, Bson::String(_)),
        "object" => matches!(value, Bson::Document(_)),
        "array" => matches!(value, Bson::Array(_)),
        "binData" => matches!(value, Bson::Binary(_)),
        "objectId" => matches!(value, Bson::ObjectId(_)),
        "bool" => matches!(value, Bson::Boolean(_)),
        "date" => matches!(value, Bson::DateTime(_)),
        "null" => matches!(value, Bson::Null),
        "regex" => matches!(value, Bson::RegularExpression(_)),
        "int" => matches!(value, Bson::Int32(_)),
        "timestamp" => matches!(value, Bson::Timestamp(_)),
        "long" => matches!(value, Bson::Int64(_)),
        "decimal" => matches!(value, Bson::Decimal128(_)),
        "number" => matches!(
            value,
            Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_)
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn check(filter: Document, doc: Document) -> bool {
        parse_filter(&filter).unwrap().matches(&doc, None)
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(check(doc! {}, doc! { "a": 1 }));
    }

    #[test]
    fn equality_reaches_into_arrays() {
        let d = doc! { "tags": ["red", "blue"], "n": 5 };
        assert!(check(doc! { "tags": "red" }, d.clone()));
        assert!(check(doc! { "tags": ["red", "blue"] }, d.clone()));
        assert!(!check(doc! { "tags": "green" }, d.clone()));
        assert!(check(doc! { "n": 5.0 }, d));
    }

    #[test]
    fn null_matches_missing() {
        assert!(check(doc! { "x": null }, doc! { "a": 1 }));
        assert!(check(doc! { "x": null }, doc! { "x": null }));
        assert!(!check(doc! { "x": null }, doc! { "x": 0 }));
        assert!(check(doc! { "x": { "$ne": null } }, doc! { "x": 0 }));
    }

    #[test]
    fn comparisons_stay_within_type() {
        let d = doc! { "v": "10" };
        assert!(!check(doc! { "v": { "$gt": 5 } }, d.clone()));
        assert!(check(doc! { "v": { "$gt": "1" } }, d));
        assert!(check(
            doc! { "qty": { "$gte": 10, "$lt": 20 } },
            doc! { "qty": 15 }
        ));
    }

    #[test]
    fn membership_and_logic() {
        let d = doc! { "status": "A", "qty": 30 };
        assert!(check(doc! { "status": { "$in": ["A", "D"] } }, d.clone()));
        assert!(check(doc! { "status": { "$nin": ["B"] } }, d.clone()));
        assert!(check(
            doc! { "$or": [ { "status": "B" }, { "qty": { "$lt": 40 } } ] },
            d.clone()
        ));
        assert!(!check(doc! { "$nor": [ { "status": "A" } ] }, d.clone()));
        assert!(check(doc! { "qty": { "$not": { "$gt": 50 } } }, d));
    }

    #[test]
    fn array_operators() {
        let d = doc! {
            "tags": ["a", "b", "c"],
            "results": [ { "product": "x", "score": 8 }, { "product": "y", "score": 3 } ],
            "scores": [1, 9],
        };
        assert!(check(doc! { "tags": { "$size": 3 } }, d.clone()));
        assert!(check(doc! { "tags": { "$all": ["a", "c"] } }, d.clone()));
        assert!(!check(doc! { "tags": { "$all": ["a", "z"] } }, d.clone()));
        assert!(check(
            doc! { "results": { "$elemMatch": { "product": "x", "score": { "$gte": 8 } } } },
            d.clone()
        ));
        assert!(!check(
            doc! { "results": { "$elemMatch": { "product": "y", "score": { "$gte": 8 } } } },
            d.clone()
        ));
        assert!(check(
            doc! { "scores": { "$elemMatch": { "$gt": 5, "$lt": 10 } } },
            d.clone()
        ));
        assert!(check(doc! { "results.score": 3 }, d));
    }

    #[test]
    fn regex_exists_and_type() {
        let d = doc! { "name": "Widget", "n": null };
        assert!(check(doc! { "name": { "$regex": "^wid", "$options": "i" } }, d.clone()));
        assert!(!check(doc! { "name": { "$regex": "^wid" } }, d.clone()));
        assert!(check(doc! { "n": { "$exists": true } }, d.clone()));
        assert!(check(doc! { "m": { "$exists": false } }, d.clone()));
        assert!(check(doc! { "name": { "$type": "string" } }, d.clone()));
        assert!(check(doc! { "n": { "$type": ["null", "int"] } }, d));
    }

    #[test]
    fn collation_applies_to_equality() {
        let ci = Collation {
            locale: "en".into(),
            strength: 1,
        };
        let filter = parse_filter(&doc! { "name": "widget" }).unwrap();
        assert!(filter.matches(&doc! { "name": "WIDGET" }, Some(&ci)));
        assert!(!filter.matches(&doc! { "name": "WIDGET" }, None));
    }
}
