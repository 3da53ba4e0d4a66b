#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("duplicate key error collection: {collection} dup key: {{ _id: {id} }}")]
    DuplicateKey { collection: String, id: String },

    #[error("document not found in {collection}: {id}")]
    DocumentNotFound { collection: String, id: String },

    #[error("ns not found: {0}")]
    CollectionNotFound(String),

    #[error("collection already exists: {0}")]
    CollectionExists(String),

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    /// MongoDB-compatible error code, reported in `writeErrors`.
    pub fn code(&self) -> i32 {
        match self {
            StoreError::DuplicateKey { .. } => 11000,
            StoreError::DocumentNotFound { .. } => 47,
            StoreError::CollectionNotFound(_) => 26,
            StoreError::CollectionExists(_) => 48,
            StoreError::InvalidDocument(_) => 2,
            StoreError::Storage(_) => 1,
        }
    }
}
