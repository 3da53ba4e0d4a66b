use bson::{Bson, Document};

use crate::collation::Collation;
use crate::error::QueryError;
use crate::expr::Expr;
use crate::path::{remove_path, set_path};
use crate::value::is_truthy;

/// A parsed `$project` specification (also used for `find` projections).
#[derive(Debug, Clone)]
pub enum Projection {
    /// Keep only the listed paths, then set computed fields.
    Include {
        tree: Vec<(String, Node)>,
        computed: Vec<(String, Expr)>,
    },
    /// Remove the listed paths.
    Exclude { paths: Vec<String> },
}

#[derive(Debug, Clone)]
pub enum Node {
    Leaf,
    Children(Vec<(String, Node)>),
}

impl Projection {
    pub fn parse(spec: &Document) -> Result<Self, QueryError> {
        let mut fields = Vec::new();
        flatten(spec, "", &mut fields)?;
        if fields.is_empty() {
            return Err(QueryError::InvalidStage(
                "projection specification must have at least one field".into(),
            ));
        }

        let mut included = Vec::new();
        let mut excluded = Vec::new();
        let mut computed = Vec::new();
        let mut keep_id = true;

        for (path, value) in fields {
            match value {
                Bson::Boolean(_) | Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) => {
                    if is_truthy(value) {
                        included.push(path);
                    } else if path == "_id" {
                        keep_id = false;
                    } else {
                        excluded.push(path);
                    }
                }
                other => {
                    if path == "_id" {
                        keep_id = false;
                    }
                    computed.push((path, Expr::parse(other)?));
                }
            }
        }

        if !excluded.is_empty() && (!included.is_empty() || !computed.is_empty()) {
            return Err(QueryError::InvalidStage(format!(
                "cannot do exclusion on field {} in inclusion projection",
                excluded[0]
            )));
        }

        if included.is_empty() && computed.is_empty() {
            if !keep_id {
                excluded.push("_id".to_string());
            }
            return Ok(Projection::Exclude { paths: excluded });
        }

        if keep_id && !included.iter().any(|p| p == "_id") {
            included.insert(0, "_id".to_string());
        }
        let mut tree = Vec::new();
        for path in &included {
            insert_path(&mut tree, path);
        }
        Ok(Projection::Include { tree, computed })
    }

    pub fn apply(&self, doc: &Document, collation: Option<&Collation>) -> Result<Document, QueryError> {
        match self {
            Projection::Include { tree, computed } => {
                let mut out = include(doc, tree);
                for (path, expr) in computed {
                    if let Some(v) = expr.eval(doc, collation)? {
                        set_path(&mut out, path, v);
                    }
                }
                Ok(out)
            }
            Projection::Exclude { paths } => {
                let mut out = doc.clone();
                for path in paths {
                    remove_path(&mut out, path);
                }
                Ok(out)
            }
        }
    }
}

/// Flatten nested field specs into dotted paths. Operator documents and
/// non-document values are leaves.
pub(crate) fn flatten<'a>(
    spec: &'a Document,
    prefix: &str,
    out: &mut Vec<(String, &'a Bson)>,
) -> Result<(), QueryError> {
    for (key, value) in spec {
        if key.starts_with('$') {
            return Err(QueryError::InvalidStage(format!(
                "field path {key} cannot start with '$'"
            )));
        }
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Bson::Document(sub) if sub.keys().next().is_some_and(|k| !k.starts_with('$')) => {
                flatten(sub, &path, out)?;
            }
            _ => out.push((path, value)),
        }
    }
    Ok(())
}

fn insert_path(tree: &mut Vec<(String, Node)>, path: &str) {
    let (head, tail) = match path.split_once('.') {
        Some((head, tail)) => (head, Some(tail)),
        None => (path, None),
    };
    let index = match tree.iter().position(|(k, _)| k == head) {
        Some(i) => i,
        None => {
            let node = match tail {
                Some(_) => Node::Children(Vec::new()),
                None => Node::Leaf,
            };
            tree.push((head.to_string(), node));
            tree.len() - 1
        }
    };
    match (tail, &mut tree[index].1) {
        (None, node) => *node = Node::Leaf,
        (Some(rest), Node::Children(children)) => insert_path(children, rest),
        // The whole parent is already kept.
        (Some(_), Node::Leaf) => {}
    }
}

fn include(doc: &Document, tree: &[(String, Node)]) -> Document {
    let mut out = Document::new();
    for (key, value) in doc {
        let Some((_, node)) = tree.iter().find(|(k, _)| k == key) else {
            continue;
        };
        match node {
            Node::Leaf => {
                out.insert(key.clone(), value.clone());
            }
            Node::Children(children) => {
                if let Some(v) = include_value(value, children) {
                    out.insert(key.clone(), v);
                }
            }
        }
    }
    out
}

fn include_value(value: &Bson, children: &[(String, Node)]) -> Option<Bson> {
    match value {
        Bson::Document(sub) => Some(Bson::Document(include(sub, children))),
        Bson::Array(items) => Some(Bson::Array(
            items
                .iter()
                .filter_map(|item| include_value(item, children))
                .collect(),
        )),
        _ => None,
    }
}
