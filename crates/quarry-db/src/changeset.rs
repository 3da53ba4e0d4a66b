use std::collections::HashSet;

use bson::oid::ObjectId;
use bson::Document;
use quarry_store::{
    ChangeStreamDocument, Namespace, Writable, WriteError, WriteOptions, document_id, id_key,
};

use crate::error::DbError;

/// The difference between two document sets, keyed by `_id`.
///
/// `incoming` is the new state and `outgoing` the old one. Documents are
/// never compared by content: an id present on both sides is a
/// replacement even when nothing changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    incoming: Vec<Document>,
    outgoing: Vec<Document>,
}

impl ChangeSet {
    pub fn new(incoming: Vec<Document>, outgoing: Vec<Document>) -> Self {
        Self { incoming, outgoing }
    }

    /// Changes that turn `before` into `after`.
    pub fn difference(before: Vec<Document>, after: Vec<Document>) -> Self {
        Self::new(after, before)
    }

    pub fn incoming(&self) -> &[Document] {
        &self.incoming
    }

    pub fn outgoing(&self) -> &[Document] {
        &self.outgoing
    }

    pub fn is_empty(&self) -> bool {
        self.incoming.is_empty() && self.outgoing.is_empty()
    }

    /// Incoming documents whose id is not outgoing.
    pub fn insertions(&self) -> Vec<&Document> {
        let outgoing = id_set(&self.outgoing);
        self.incoming
            .iter()
            .filter(|d| !contains(&outgoing, d))
            .collect()
    }

    /// Outgoing documents whose id is not incoming. An outgoing document
    /// without `_id` cannot be addressed and is never deleted.
    pub fn deletions(&self) -> Vec<&Document> {
        let incoming = id_set(&self.incoming);
        self.outgoing
            .iter()
            .filter(|d| document_id(d).is_some() && !contains(&incoming, d))
            .collect()
    }

    /// Incoming documents whose id is also outgoing.
    pub fn replacements(&self) -> Vec<&Document> {
        let outgoing = id_set(&self.outgoing);
        self.incoming
            .iter()
            .filter(|d| contains(&outgoing, d))
            .collect()
    }

    pub fn to_inverse(&self) -> ChangeSet {
        ChangeSet::new(self.outgoing.clone(), self.incoming.clone())
    }

    /// Change documents for `ns`: insertions, then deletions, then
    /// replacements.
    pub fn to_changes(&self, ns: &Namespace) -> Vec<ChangeStreamDocument> {
        let inserts = self
            .insertions()
            .into_iter()
            .map(|d| ChangeStreamDocument::insert(ns.clone(), d.clone()));
        let deletes = self
            .deletions()
            .into_iter()
            .filter_map(document_id)
            .map(|id| ChangeStreamDocument::delete(ns.clone(), id.clone()));
        let replaces = self
            .replacements()
            .into_iter()
            .map(|d| ChangeStreamDocument::replace(ns.clone(), d.clone()));
        inserts.chain(deletes).chain(replaces).collect()
    }

    /// Applies [`ChangeSet::to_changes`] through `writable`.
    pub fn write(
        &self,
        writable: &dyn Writable,
        ns: &Namespace,
        ordered: bool,
    ) -> Result<Vec<WriteError>, DbError> {
        let changes = self.to_changes(ns);
        if changes.is_empty() {
            return Ok(Vec::new());
        }
        Ok(writable.write(&changes, WriteOptions { ordered })?)
    }
}

/// Gives a document without `_id` a fresh ObjectId as its first field.
pub(crate) fn ensure_id(doc: Document) -> Document {
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

fn id_set(docs: &[Document]) -> HashSet<String> {
    docs.iter().filter_map(document_id).map(id_key).collect()
}

// A document without `_id` never matches anything.
fn contains(ids: &HashSet<String>, doc: &Document) -> bool {
    document_id(doc).is_some_and(|id| ids.contains(&id_key(id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{Bson, doc};
    use quarry_store::OperationType;

    fn ids(docs: Vec<&Document>) -> Vec<i32> {
        docs.iter().map(|d| d.get_i32("_id").unwrap()).collect()
    }

    fn sample() -> ChangeSet {
        ChangeSet::difference(
            vec![doc! { "_id": 1, "v": "a" }, doc! { "_id": 2, "v": "b" }],
            vec![doc! { "_id": 2, "v": "b" }, doc! { "_id": 3, "v": "c" }],
        )
    }

    #[test]
    fn partitions_by_id() {
        let set = sample();
        assert_eq!(ids(set.insertions()), vec![3]);
        assert_eq!(ids(set.deletions()), vec![1]);
        // Unchanged content still counts as a replacement.
        assert_eq!(ids(set.replacements()), vec![2]);
    }

    #[test]
    fn inverse_swaps_sides() {
        let inverse = sample().to_inverse();
        assert_eq!(ids(inverse.insertions()), vec![1]);
        assert_eq!(ids(inverse.deletions()), vec![3]);
        assert_eq!(ids(inverse.replacements()), vec![2]);
        assert_eq!(inverse.to_inverse(), sample());
    }

    #[test]
    fn numeric_ids_match_across_widths() {
        let set = ChangeSet::difference(vec![doc! { "_id": 1_i64 }], vec![doc! { "_id": 1 }]);
        assert!(set.insertions().is_empty());
        assert!(set.deletions().is_empty());
        assert_eq!(set.replacements().len(), 1);
    }

    #[test]
    fn changes_are_ordered_inserts_deletes_replaces() {
        let ns = Namespace::new("db", "c");
        let kinds: Vec<OperationType> = sample()
            .to_changes(&ns)
            .iter()
            .map(|c| c.operation_type)
            .collect();
        assert_eq!(
            kinds,
            vec![OperationType::Insert, OperationType::Delete, OperationType::Replace]
        );
    }

    #[test]
    fn outgoing_documents_without_id_are_not_deleted() {
        let set = ChangeSet::difference(
            vec![doc! { "v": "orphan" }, doc! { "_id": 1 }],
            vec![doc! { "v": "fresh" }],
        );
        assert_eq!(ids(set.deletions()), vec![1]);
        assert_eq!(set.insertions(), vec![&doc! { "v": "fresh" }]);

        let changes = set.to_changes(&Namespace::new("db", "c"));
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[1].operation_type, OperationType::Delete);
        assert_eq!(changes[1].document_key, Some(Bson::Int32(1)));
    }

    #[test]
    fn empty_sets() {
        let set = ChangeSet::default();
        assert!(set.is_empty());
        assert!(set.to_changes(&Namespace::new("db", "c")).is_empty());
    }
}
