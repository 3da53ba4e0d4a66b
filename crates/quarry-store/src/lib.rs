mod apply;
mod change;
mod error;
mod id;
mod namespace;
mod store;

pub use apply::apply_changes;
pub use change::{ChangeStreamDocument, OperationType};
pub use error::StoreError;
pub use id::{document_id, id_key};
pub use namespace::Namespace;
pub use store::{
    CreateOptions, DocumentAccess, DocumentStream, Storage, StreamOptions, Streamable, Writable,
    WriteError, WriteOptions,
};

#[cfg(feature = "memory")]
mod memory;

#[cfg(feature = "memory")]
pub use memory::{MemoryAccess, MemoryStore};
