use std::collections::HashMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use arc_swap::ArcSwap;
use bson::oid::ObjectId;
use bson::{Bson, Document};
use imbl::OrdMap;

use crate::apply::apply_changes;
use crate::change::ChangeStreamDocument;
use crate::error::StoreError;
use crate::id::id_key;
use crate::store::{
    CreateOptions, DocumentStream, Storage, StreamOptions, Streamable, Writable, WriteError,
    WriteOptions,
};

/// One collection: documents in natural (insertion) order plus an
/// `_id` → position index. Cloning is cheap thanks to structural sharing.
#[derive(Clone, Default)]
struct CollectionData {
    docs: OrdMap<u64, Document>,
    ids: imbl::HashMap<String, u64>,
    next_seq: u64,
    options: Document,
}

type CollectionCell = Arc<ArcSwap<CollectionData>>;

/// In-memory backend.
///
/// Readers take an immutable snapshot of a collection and stream from it
/// without holding any lock; writers serialize on `write_lock` and swap in
/// a modified copy.
pub struct MemoryStore {
    collections: RwLock<HashMap<String, CollectionCell>>,
    write_lock: Mutex<()>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn collection_names(&self) -> Vec<String> {
        let cells = self.collections.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = cells.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_collection(&self, name: &str) -> bool {
        let cells = self.collections.read().unwrap_or_else(PoisonError::into_inner);
        cells.contains_key(name)
    }

    /// Options the collection was created with, if it exists.
    pub fn collection_options(&self, name: &str) -> Option<Document> {
        self.snapshot(name).map(|data| data.options.clone())
    }

    /// All documents of a collection in natural order.
    pub fn documents(&self, name: &str) -> Vec<Document> {
        self.snapshot(name)
            .map(|data| data.docs.values().cloned().collect())
            .unwrap_or_default()
    }

    fn snapshot(&self, name: &str) -> Option<Arc<CollectionData>> {
        let cells = self.collections.read().unwrap_or_else(PoisonError::into_inner);
        cells.get(name).map(|cell| cell.load_full())
    }

    fn cell(&self, name: &str) -> Option<CollectionCell> {
        let cells = self.collections.read().unwrap_or_else(PoisonError::into_inner);
        cells.get(name).cloned()
    }

    fn cell_or_create(&self, name: &str) -> CollectionCell {
        if let Some(cell) = self.cell(name) {
            return cell;
        }
        let mut cells = self.collections.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            cells
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(ArcSwap::from_pointee(CollectionData::default()))),
        )
    }

    /// Run `f` against a private copy of the collection and publish it on success.
    fn mutate<T>(
        &self,
        cell: &CollectionCell,
        f: impl FnOnce(&mut CollectionData) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut data = (**cell.load()).clone();
        let out = f(&mut data)?;
        cell.store(Arc::new(data));
        Ok(out)
    }

    fn existing(&self, name: &str) -> Result<CollectionCell, StoreError> {
        self.cell(name)
            .ok_or_else(|| StoreError::CollectionNotFound(name.to_string()))
    }
}

impl Storage for MemoryStore {
    fn create_collection(&self, name: &str, options: &CreateOptions) -> Result<(), StoreError> {
        let mut cells = self.collections.write().unwrap_or_else(PoisonError::into_inner);
        if cells.contains_key(name) {
            return Err(StoreError::CollectionExists(name.to_string()));
        }
        let data = CollectionData {
            options: options.options.clone(),
            ..CollectionData::default()
        };
        cells.insert(name.to_string(), Arc::new(ArcSwap::from_pointee(data)));
        Ok(())
    }

    fn drop_collection(&self, name: &str) -> Result<(), StoreError> {
        let mut cells = self.collections.write().unwrap_or_else(PoisonError::into_inner);
        cells
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::CollectionNotFound(name.to_string()))
    }

    fn insert(&self, name: &str, doc: Document) -> Result<Bson, StoreError> {
        let doc = with_id(doc);
        let id = doc.get("_id").cloned().unwrap_or(Bson::Null);
        let key = id_key(&id);
        let cell = self.cell_or_create(name);
        self.mutate(&cell, |data| {
            if data.ids.contains_key(&key) {
                return Err(StoreError::DuplicateKey {
                    collection: name.to_string(),
                    id: id.to_string(),
                });
            }
            let seq = data.next_seq;
            data.next_seq += 1;
            data.ids.insert(key, seq);
            data.docs.insert(seq, doc);
            Ok(())
        })?;
        Ok(id)
    }

    fn delete(&self, name: &str, id: &Bson) -> Result<(), StoreError> {
        let cell = self.existing(name)?;
        let key = id_key(id);
        self.mutate(&cell, |data| match data.ids.remove(&key) {
            Some(seq) => {
                data.docs.remove(&seq);
                Ok(())
            }
            None => Err(StoreError::DocumentNotFound {
                collection: name.to_string(),
                id: id.to_string(),
            }),
        })
    }

    fn replace(&self, name: &str, id: &Bson, mut doc: Document) -> Result<(), StoreError> {
        let cell = self.existing(name)?;
        let key = id_key(id);
        match doc.get("_id").map(id_key) {
            Some(own) if own != key => {
                return Err(StoreError::InvalidDocument(format!(
                    "replacement for _id {id} carries a different _id"
                )));
            }
            Some(_) => {}
            None => {
                let mut keyed = Document::new();
                keyed.insert("_id", id.clone());
                for (k, v) in doc {
                    keyed.insert(k, v);
                }
                doc = keyed;
            }
        }
        self.mutate(&cell, |data| match data.ids.get(&key) {
            Some(seq) => {
                data.docs.insert(*seq, doc);
                Ok(())
            }
            None => Err(StoreError::DocumentNotFound {
                collection: name.to_string(),
                id: id.to_string(),
            }),
        })
    }

    fn exists(&self, name: &str, id: &Bson) -> Result<bool, StoreError> {
        Ok(self
            .snapshot(name)
            .is_some_and(|data| data.ids.contains_key(&id_key(id))))
    }
}

impl Streamable for MemoryStore {
    fn stream(&self, name: &str, options: &StreamOptions) -> Result<DocumentStream, StoreError> {
        let Some(data) = self.snapshot(name) else {
            return Ok(Box::new(std::iter::empty()));
        };
        let position = match &options.document_ids {
            Some(ids) => {
                let mut seqs: Vec<u64> = ids
                    .iter()
                    .filter_map(|id| data.ids.get(&id_key(id)).copied())
                    .collect();
                seqs.sort_unstable();
                seqs.dedup();
                Position::Ids(seqs.into_iter())
            }
            None => Position::Scan(None),
        };
        Ok(Box::new(SnapshotStream {
            data,
            position,
            projection: options.projection.clone(),
        }))
    }
}

impl Writable for MemoryStore {
    fn write(
        &self,
        changes: &[ChangeStreamDocument],
        options: WriteOptions,
    ) -> Result<Vec<WriteError>, StoreError> {
        Ok(apply_changes(self, changes, options))
    }
}

fn with_id(doc: Document) -> Document {
    if doc.contains_key("_id") {
        return doc;
    }
    let mut keyed = Document::new();
    keyed.insert("_id", ObjectId::new());
    for (k, v) in doc {
        keyed.insert(k, v);
    }
    keyed
}

// ── Streaming ───────────────────────────────────────────────────

enum Position {
    /// Natural-order scan; holds the last yielded sequence number.
    Scan(Option<u64>),
    Ids(std::vec::IntoIter<u64>),
}

/// Pulls one document at a time from an immutable snapshot.
struct SnapshotStream {
    data: Arc<CollectionData>,
    position: Position,
    projection: Option<Document>,
}

impl Iterator for SnapshotStream {
    type Item = Result<Document, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        let doc = match &mut self.position {
            Position::Scan(last) => {
                let lower = match *last {
                    Some(seq) => Bound::Excluded(seq),
                    None => Bound::Unbounded,
                };
                let (seq, doc) = self.data.docs.range((lower, Bound::Unbounded)).next()?;
                *last = Some(*seq);
                doc.clone()
            }
            Position::Ids(seqs) => loop {
                let seq = seqs.next()?;
                if let Some(doc) = self.data.docs.get(&seq) {
                    break doc.clone();
                }
            },
        };
        Some(Ok(match &self.projection {
            Some(projection) => project_top_level(doc, projection),
            None => doc,
        }))
    }
}

/// Best-effort top-level projection. Dotted paths keep their whole
/// top-level field and computed fields disable the hint entirely; the
/// engine applies the exact projection afterwards.
fn project_top_level(doc: Document, projection: &Document) -> Document {
    let mut include = Vec::new();
    let mut exclude = Vec::new();
    let mut keep_id = true;
    for (path, value) in projection {
        let top = path.split('.').next().unwrap_or(path.as_str());
        let flag = match value {
            Bson::Boolean(b) => *b,
            Bson::Int32(n) => *n != 0,
            Bson::Int64(n) => *n != 0,
            Bson::Double(f) => *f != 0.0,
            _ => return doc,
        };
        if top == "_id" && path == "_id" {
            keep_id = flag;
        } else if flag {
            include.push(top.to_string());
        } else if !path.contains('.') {
            exclude.push(top.to_string());
        }
    }
    if !include.is_empty() {
        doc.into_iter()
            .filter(|(k, _)| (k == "_id" && keep_id) || include.iter().any(|i| i == k))
            .collect()
    } else {
        doc.into_iter()
            .filter(|(k, _)| !(exclude.iter().any(|e| e == k) || (k == "_id" && !keep_id)))
            .collect()
    }
}
