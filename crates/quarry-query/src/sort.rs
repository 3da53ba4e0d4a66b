use std::cmp::Ordering;

use bson::{Bson, Document};

use crate::collation::Collation;
use crate::error::QueryError;
use crate::path::leaf_values;
use crate::value::compare_values;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sort {
    pub field: String,
    pub direction: SortDirection,
}

/// Parse `{ field: 1 | -1, ... }` into sort keys, in document order.
pub fn parse_sort(spec: &Document) -> Result<Vec<Sort>, QueryError> {
    if spec.is_empty() {
        return Err(QueryError::InvalidStage("$sort needs at least one key".into()));
    }
    spec.iter()
        .map(|(field, value)| {
            let direction = match crate::value::as_i64(value) {
                Some(1) => SortDirection::Asc,
                Some(-1) => SortDirection::Desc,
                _ => {
                    return Err(QueryError::InvalidStage(format!(
                        "$sort key ordering must be 1 or -1 for {field}"
                    )));
                }
            };
            Ok(Sort {
                field: field.clone(),
                direction,
            })
        })
        .collect()
}

/// Stable sort of `docs` by `keys`.
pub(crate) fn sort_documents(docs: &mut [Document], keys: &[Sort], collation: Option<&Collation>) {
    docs.sort_by(|a, b| compare_documents(a, b, keys, collation));
}

pub(crate) fn compare_documents(
    a: &Document,
    b: &Document,
    keys: &[Sort],
    collation: Option<&Collation>,
) -> Ordering {
    for key in keys {
        let va = sort_value(a, key, collation);
        let vb = sort_value(b, key, collation);
        let ord = compare_values(&va, &vb, collation);
        let ord = match key.direction {
            SortDirection::Asc => ord,
            SortDirection::Desc => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// The value a document sorts by: missing is null, an array sorts by its
/// smallest element ascending and its largest descending.
fn sort_value(doc: &Document, key: &Sort, collation: Option<&Collation>) -> Bson {
    let candidates: Vec<&Bson> = leaf_values(doc, &key.field)
        .into_iter()
        .flat_map(|v| match v {
            Bson::Array(items) if !items.is_empty() => items.iter().collect::<Vec<_>>(),
            other => vec![other],
        })
        .collect();
    let pick = match key.direction {
        SortDirection::Asc => candidates
            .into_iter()
            .min_by(|x, y| compare_values(x, y, collation)),
        SortDirection::Desc => candidates
            .into_iter()
            .max_by(|x, y| compare_values(x, y, collation)),
    };
    pick.cloned().unwrap_or(Bson::Null)
}
