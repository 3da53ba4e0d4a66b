use quarry_query::QueryError;
use quarry_store::{Namespace, StoreError};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DbError {
    #[error("no such command: '{0}'")]
    UnsupportedCommand(String),

    #[error("cursor id {0} not found")]
    InvalidCursor(i64),

    #[error("namespace {0} is a view, not a collection")]
    ViewReadOnly(Namespace),

    #[error("invalid update: {0}")]
    InvalidUpdate(String),

    #[error("{0}")]
    BadValue(String),

    #[error("a collection or view named {0} already exists")]
    NamespaceExists(Namespace),

    #[error("failed to write pipeline output to {ns}: {errmsg}")]
    SinkWrite { ns: Namespace, errmsg: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Query(#[from] QueryError),
}

impl DbError {
    /// MongoDB-compatible error code.
    pub fn code(&self) -> i32 {
        match self {
            DbError::UnsupportedCommand(_) => 59,
            DbError::InvalidCursor(_) => 43,
            DbError::ViewReadOnly(_) => 166,
            DbError::InvalidUpdate(_) => 9,
            DbError::BadValue(_) => 2,
            DbError::NamespaceExists(_) => 48,
            DbError::SinkWrite { .. } => 1,
            DbError::Store(e) => e.code(),
            DbError::Query(QueryError::UnknownStage(_)) => 40324,
            DbError::Query(QueryError::UnknownOperator(_)) => 168,
            DbError::Query(_) => 2,
        }
    }
}
