use bson::Bson;

use crate::change::{ChangeStreamDocument, OperationType};
use crate::error::StoreError;
use crate::store::{Storage, WriteError, WriteOptions};

/// Applies change documents through per-document [`Storage`] calls.
///
/// Backends without a native batch path implement [`crate::Writable`]
/// with this. `update`/`replace` of a missing document inserts it, so a
/// diff computed against a stale snapshot still converges.
pub fn apply_changes<S: Storage + ?Sized>(
    storage: &S,
    changes: &[ChangeStreamDocument],
    options: WriteOptions,
) -> Vec<WriteError> {
    let mut errors = Vec::new();
    for (index, change) in changes.iter().enumerate() {
        if let Err(e) = apply_one(storage, change) {
            errors.push(WriteError::new(index, &e));
            if options.ordered {
                break;
            }
        }
    }
    errors
}

fn apply_one<S: Storage + ?Sized>(
    storage: &S,
    change: &ChangeStreamDocument,
) -> Result<(), StoreError> {
    let coll = change.ns.coll.as_str();
    match change.operation_type {
        OperationType::Insert => {
            let doc = full_document(change)?;
            storage.insert(coll, doc.clone())?;
        }
        OperationType::Update | OperationType::Replace => {
            let doc = full_document(change)?;
            let id = document_key(change)?;
            if storage.exists(coll, id)? {
                storage.replace(coll, id, doc.clone())?;
            } else {
                storage.insert(coll, doc.clone())?;
            }
        }
        OperationType::Delete => {
            let id = document_key(change)?;
            storage.delete(coll, id)?;
        }
        OperationType::Drop => storage.drop_collection(coll)?,
    }
    Ok(())
}

fn full_document(change: &ChangeStreamDocument) -> Result<&bson::Document, StoreError> {
    change.full_document.as_ref().ok_or_else(|| {
        StoreError::InvalidDocument(format!("{} change without fullDocument", change.operation_type))
    })
}

fn document_key(change: &ChangeStreamDocument) -> Result<&Bson, StoreError> {
    change.document_key.as_ref().ok_or_else(|| {
        StoreError::InvalidDocument(format!("{} change without documentKey", change.operation_type))
    })
}
