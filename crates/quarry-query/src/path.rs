use bson::{Bson, Document};

/// Strict dotted lookup. Numeric segments index into arrays; no implicit
/// traversal of array elements.
pub fn lookup_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Bson::Document(d) => d.get(segment)?,
            Bson::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Expression-style resolution of `$a.b`: an array met along the path maps
/// the rest of the path over its elements and yields an array of the
/// results. `None` means the field is missing.
pub(crate) fn resolve_path(doc: &Document, path: &str) -> Option<Bson> {
    let segments: Vec<&str> = path.split('.').collect();
    resolve_in_document(doc, &segments)
}

fn resolve_in_document(doc: &Document, segments: &[&str]) -> Option<Bson> {
    let (first, rest) = segments.split_first()?;
    let value = doc.get(*first)?;
    resolve_in_value(value, rest)
}

fn resolve_in_value(value: &Bson, segments: &[&str]) -> Option<Bson> {
    if segments.is_empty() {
        return Some(value.clone());
    }
    match value {
        Bson::Document(d) => resolve_in_document(d, segments),
        Bson::Array(items) => Some(Bson::Array(
            items
                .iter()
                .filter_map(|item| match item {
                    Bson::Document(d) => resolve_in_document(d, segments),
                    Bson::Array(_) => resolve_in_value(item, segments),
                    _ => None,
                })
                .collect(),
        )),
        _ => None,
    }
}

/// Query-style resolution: every value reachable at `path`, descending
/// into array elements at intermediate segments. Arrays found at the end
/// of the path are returned whole; callers expand them as needed.
pub(crate) fn leaf_values<'a>(doc: &'a Document, path: &str) -> Vec<&'a Bson> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    if let Some((first, rest)) = segments.split_first()
        && let Some(value) = doc.get(*first)
    {
        collect_leaves(value, rest, &mut out);
    }
    out
}

fn collect_leaves<'a>(value: &'a Bson, segments: &[&str], out: &mut Vec<&'a Bson>) {
    let Some((segment, rest)) = segments.split_first() else {
        out.push(value);
        return;
    };
    match value {
        Bson::Document(d) => {
            if let Some(next) = d.get(*segment) {
                collect_leaves(next, rest, out);
            }
        }
        Bson::Array(items) => {
            if let Ok(index) = segment.parse::<usize>()
                && let Some(next) = items.get(index)
            {
                collect_leaves(next, rest, out);
            }
            for item in items {
                if let Bson::Document(d) = item
                    && let Some(next) = d.get(*segment)
                {
                    collect_leaves(next, rest, out);
                }
            }
        }
        _ => {}
    }
}

/// Set `value` at a dotted path, creating intermediate documents. A
/// non-document value in the way is replaced.
pub fn set_path(doc: &mut Document, path: &str, value: Bson) {
    match path.split_once('.') {
        None => {
            doc.insert(path, value);
        }
        Some((head, tail)) => {
            if !matches!(doc.get(head), Some(Bson::Document(_))) {
                doc.insert(head, Document::new());
            }
            if let Some(Bson::Document(child)) = doc.get_mut(head) {
                set_path(child, tail, value);
            }
        }
    }
}

/// Remove the field at a dotted path. Arrays of documents along the path
/// have the field removed from each element.
pub fn remove_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, tail)) => match doc.get_mut(head) {
            Some(Bson::Document(child)) => remove_path(child, tail),
            Some(Bson::Array(items)) => {
                for item in items.iter_mut() {
                    if let Bson::Document(child) = item {
                        remove_path(child, tail);
                    }
                }
            }
            _ => {}
        },
    }
}
