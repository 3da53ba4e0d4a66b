use std::sync::Arc;

use bson::{Bson, Document, doc};

use crate::change::ChangeStreamDocument;
use crate::error::StoreError;

/// A lazy, pull-based sequence of documents read from a backend.
pub type DocumentStream = Box<dyn Iterator<Item = Result<Document, StoreError>> + Send>;

/// Options passed through from a `create` command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateOptions {
    /// Command fields other than the verb, kept verbatim for the backend.
    pub options: Document,
}

/// Read hints. A backend may ignore either hint: callers re-apply the
/// full filter and projection on whatever it yields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamOptions {
    pub document_ids: Option<Vec<Bson>>,
    pub projection: Option<Document>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    pub ordered: bool,
}

/// A per-document write failure, reported rather than raised.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteError {
    pub index: usize,
    pub code: i32,
    pub errmsg: String,
}

impl WriteError {
    pub fn new(index: usize, err: &StoreError) -> Self {
        Self {
            index,
            code: err.code(),
            errmsg: err.to_string(),
        }
    }

    pub fn to_document(&self) -> Document {
        doc! {
            "index": self.index as i64,
            "code": self.code,
            "errMsg": self.errmsg.as_str(),
        }
    }
}

/// Per-document mutations on named collections of one database.
pub trait Storage: Send + Sync {
    fn create_collection(&self, collection: &str, options: &CreateOptions)
    -> Result<(), StoreError>;
    fn drop_collection(&self, collection: &str) -> Result<(), StoreError>;
    /// Stores `doc`, assigning an ObjectId `_id` when it has none.
    /// Returns the stored `_id`.
    fn insert(&self, collection: &str, doc: Document) -> Result<Bson, StoreError>;
    fn delete(&self, collection: &str, id: &Bson) -> Result<(), StoreError>;
    fn replace(&self, collection: &str, id: &Bson, doc: Document) -> Result<(), StoreError>;
    fn exists(&self, collection: &str, id: &Bson) -> Result<bool, StoreError>;
}

pub trait Streamable: Send + Sync {
    /// Streams a collection in natural order. A missing collection streams
    /// nothing.
    fn stream(&self, collection: &str, options: &StreamOptions)
    -> Result<DocumentStream, StoreError>;
}

pub trait Writable: Send + Sync {
    /// Applies change documents in order. With `ordered`, stops at the
    /// first failure; otherwise continues and reports every failure.
    fn write(
        &self,
        changes: &[ChangeStreamDocument],
        options: WriteOptions,
    ) -> Result<Vec<WriteError>, StoreError>;
}

/// Resolves a database name to its backend handles.
pub trait DocumentAccess: Send + Sync {
    fn storage(&self, db: &str) -> Result<Arc<dyn Storage>, StoreError>;
    fn streamable(&self, db: &str) -> Result<Arc<dyn Streamable>, StoreError>;
    fn writable(&self, db: &str) -> Result<Arc<dyn Writable>, StoreError>;
}
