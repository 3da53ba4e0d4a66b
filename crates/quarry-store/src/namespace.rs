use std::fmt;

use bson::{Document, doc};
use serde::{Deserialize, Serialize};

/// A `(db, coll)` pair identifying one collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }

    /// Same database, different collection.
    pub fn sibling(&self, coll: impl Into<String>) -> Self {
        Self::new(self.db.clone(), coll)
    }

    pub fn to_document(&self) -> Document {
        doc! { "db": self.db.as_str(), "coll": self.coll.as_str() }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}
