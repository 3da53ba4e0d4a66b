use std::fmt;

use bson::oid::ObjectId;
use bson::{Bson, Document, doc};
use serde::{Deserialize, Serialize};

use crate::namespace::Namespace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Insert,
    Update,
    Replace,
    Delete,
    Drop,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Update => "update",
            OperationType::Replace => "replace",
            OperationType::Delete => "delete",
            OperationType::Drop => "drop",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One applied mutation, in MongoDB change-stream shape.
///
/// `id` is freshly generated for every event and is unrelated to the
/// affected document's `_id`, which lives in `document_key`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeStreamDocument {
    pub id: ObjectId,
    pub operation_type: OperationType,
    pub ns: Namespace,
    pub document_key: Option<Bson>,
    pub full_document: Option<Document>,
}

impl ChangeStreamDocument {
    fn with_document(operation_type: OperationType, ns: Namespace, doc: Document) -> Self {
        Self {
            id: ObjectId::new(),
            operation_type,
            ns,
            document_key: doc.get("_id").cloned(),
            full_document: Some(doc),
        }
    }

    pub fn insert(ns: Namespace, doc: Document) -> Self {
        Self::with_document(OperationType::Insert, ns, doc)
    }

    pub fn update(ns: Namespace, doc: Document) -> Self {
        Self::with_document(OperationType::Update, ns, doc)
    }

    pub fn replace(ns: Namespace, doc: Document) -> Self {
        Self::with_document(OperationType::Replace, ns, doc)
    }

    pub fn delete(ns: Namespace, id: Bson) -> Self {
        Self {
            id: ObjectId::new(),
            operation_type: OperationType::Delete,
            ns,
            document_key: Some(id),
            full_document: None,
        }
    }

    pub fn drop(ns: Namespace) -> Self {
        Self {
            id: ObjectId::new(),
            operation_type: OperationType::Drop,
            ns,
            document_key: None,
            full_document: None,
        }
    }

    pub fn to_document(&self) -> Document {
        let mut out = doc! {
            "_id": self.id,
            "operationType": self.operation_type.as_str(),
            "ns": self.ns.to_document(),
        };
        if let Some(key) = &self.document_key {
            out.insert("documentKey", doc! { "_id": key.clone() });
        }
        if let Some(full) = &self.full_document {
            out.insert("fullDocument", full.clone());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns() -> Namespace {
        Namespace::new("db", "items")
    }

    #[test]
    fn insert_carries_key_and_full_document() {
        let change = ChangeStreamDocument::insert(ns(), doc! { "_id": 7, "a": 1 });
        let doc = change.to_document();
        assert_eq!(doc.get_str("operationType").unwrap(), "insert");
        assert_eq!(doc.get_document("documentKey").unwrap(), &doc! { "_id": 7 });
        assert_eq!(doc.get_document("fullDocument").unwrap(), &doc! { "_id": 7, "a": 1 });
        assert_ne!(doc.get("_id"), Some(&Bson::Int32(7)));
    }

    #[test]
    fn delete_and_drop_omit_full_document() {
        let del = ChangeStreamDocument::delete(ns(), Bson::Int32(1)).to_document();
        assert!(del.get("fullDocument").is_none());
        assert!(del.get("documentKey").is_some());

        let dropped = ChangeStreamDocument::drop(ns()).to_document();
        assert!(dropped.get("fullDocument").is_none());
        assert!(dropped.get("documentKey").is_none());
        assert_eq!(
            dropped.get_document("ns").unwrap(),
            &doc! { "db": "db", "coll": "items" }
        );
    }

    #[test]
    fn event_ids_are_unique() {
        let a = ChangeStreamDocument::drop(ns());
        let b = ChangeStreamDocument::drop(ns());
        assert_ne!(a.id, b.id);
    }
}
