use std::collections::HashSet;

use bson::{Document, doc};
use quarry_db::{ChangeSet, Namespace, OperationType};
use quarry_store::{MemoryStore, Streamable, StreamOptions};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Documents with unique ids drawn from `0..40`.
fn random_docs(rng: &mut StdRng) -> Vec<Document> {
    let mut docs = Vec::new();
    for id in 0..40 {
        if rng.gen_bool(0.5) {
            docs.push(doc! { "_id": id, "v": rng.gen_range(0..5) });
        }
    }
    docs
}

fn id_set(docs: &[&Document]) -> HashSet<i32> {
    docs.iter().map(|d| d.get_i32("_id").unwrap()).collect()
}

// ── Law tests ───────────────────────────────────────────────────

#[test]
fn every_id_lands_in_exactly_one_partition() {
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..200 {
        let before = random_docs(&mut rng);
        let after = random_docs(&mut rng);
        let set = ChangeSet::difference(before.clone(), after.clone());

        let inserted = id_set(&set.insertions());
        let deleted = id_set(&set.deletions());
        let replaced = id_set(&set.replacements());
        assert!(inserted.is_disjoint(&deleted));
        assert!(inserted.is_disjoint(&replaced));
        assert!(deleted.is_disjoint(&replaced));

        let all: HashSet<i32> = before
            .iter()
            .chain(&after)
            .map(|d| d.get_i32("_id").unwrap())
            .collect();
        let covered: HashSet<i32> = inserted
            .iter()
            .chain(&deleted)
            .chain(&replaced)
            .copied()
            .collect();
        assert_eq!(all, covered);
    }
}

#[test]
fn inverse_is_the_reverse_difference() {
    let mut rng = StdRng::seed_from_u64(11);
    for _ in 0..200 {
        let a = random_docs(&mut rng);
        let b = random_docs(&mut rng);
        assert_eq!(
            ChangeSet::difference(a.clone(), b.clone()).to_inverse(),
            ChangeSet::difference(b, a)
        );
    }
}

#[test]
fn writing_a_difference_reaches_the_new_state() {
    let mut rng = StdRng::seed_from_u64(23);
    let ns = Namespace::new("db", "c");
    for _ in 0..50 {
        let before = random_docs(&mut rng);
        let after = random_docs(&mut rng);
        let store = MemoryStore::new();
        ChangeSet::difference(Vec::new(), before.clone())
            .write(&store, &ns, true)
            .unwrap();

        let set = ChangeSet::difference(before, after.clone());
        let errors = set.write(&store, &ns, true).unwrap();
        assert!(errors.is_empty());

        let mut stored: Vec<Document> = store
            .stream("c", &StreamOptions::default())
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        stored.sort_by_key(|d| d.get_i32("_id").unwrap());
        assert_eq!(stored, after);
    }
}

#[test]
fn change_documents_follow_the_partition() {
    let ns = Namespace::new("db", "c");
    let set = ChangeSet::difference(
        vec![doc! { "_id": 1 }, doc! { "_id": 2, "v": 1 }],
        vec![doc! { "_id": 2, "v": 2 }, doc! { "_id": 3 }],
    );
    let changes = set.to_changes(&ns);
    let kinds: Vec<OperationType> = changes.iter().map(|c| c.operation_type).collect();
    assert_eq!(
        kinds,
        vec![OperationType::Insert, OperationType::Delete, OperationType::Replace]
    );
    assert_eq!(changes[2].full_document, Some(doc! { "_id": 2, "v": 2 }));
    assert!(changes.iter().all(|c| c.ns == ns));
}
