use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bson::Document;
use quarry_query::DocumentIter;
use quarry_store::Namespace;

use crate::error::DbError;

/// A server-side result sequence handed out in batches.
///
/// `done` flips to true the first time the underlying sequence reports
/// exhaustion (or fails) and never flips back.
pub struct Cursor {
    id: i64,
    ns: Namespace,
    done: bool,
    iter: DocumentIter<DbError>,
}

impl Cursor {
    pub fn new(id: i64, ns: Namespace, iter: DocumentIter<DbError>) -> Self {
        Self {
            id,
            ns,
            done: false,
            iter,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn ns(&self) -> &Namespace {
        &self.ns
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Pulls up to `size` documents, or everything left with `None`.
    pub fn get_batch(&mut self, size: Option<usize>) -> Result<Vec<Document>, DbError> {
        let mut batch = Vec::new();
        while size.is_none_or(|n| batch.len() < n) {
            match self.next() {
                Some(doc) => batch.push(doc?),
                None => break,
            }
        }
        tracing::trace!(cursor_id = self.id, n = batch.len(), done = self.done, "cursor batch");
        Ok(batch)
    }

    pub fn to_array(&mut self) -> Result<Vec<Document>, DbError> {
        self.get_batch(None)
    }
}

impl Iterator for Cursor {
    type Item = Result<Document, DbError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.iter.next() {
            None => {
                self.done = true;
                None
            }
            Some(Err(e)) => {
                self.done = true;
                Some(Err(e))
            }
            Some(ok) => Some(ok),
        }
    }
}

// ── Registry ────────────────────────────────────────────────────

/// Open cursors by id. Ids start at 1 and are never reused.
pub struct CursorRegistry {
    next_id: AtomicI64,
    cursors: Mutex<HashMap<i64, Arc<Mutex<Cursor>>>>,
}

impl Default for CursorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CursorRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            cursors: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_cursor(&self, ns: Namespace, iter: DocumentIter<DbError>) -> i64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cursor = Arc::new(Mutex::new(Cursor::new(id, ns, iter)));
        self.lock().insert(id, cursor);
        id
    }

    pub fn get_cursor(&self, id: i64) -> Result<Arc<Mutex<Cursor>>, DbError> {
        self.lock()
            .get(&id)
            .cloned()
            .ok_or(DbError::InvalidCursor(id))
    }

    /// Returns whether the id was open.
    pub fn close_cursor(&self, id: i64) -> bool {
        self.lock().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, Arc<Mutex<Cursor>>>> {
        self.cursors.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
