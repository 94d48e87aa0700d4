//! Revs-diff scenarios: the set-difference contract replication relies on.

use std::collections::{BTreeMap, BTreeSet};

use syncstore::{Datastore, DatastoreManager, DocumentBody, RevisionOffers};

fn open_store(dir: &tempfile::TempDir) -> Datastore {
    let manager = DatastoreManager::new(dir.path()).unwrap();
    manager.open("revsdiff").unwrap()
}

fn offers(pairs: &[(&str, &[&str])]) -> RevisionOffers {
    let mut map = BTreeMap::new();
    for (doc, revs) in pairs {
        let set: BTreeSet<String> = revs.iter().map(|r| r.to_string()).collect();
        map.insert(doc.to_string(), set);
    }
    map
}

fn body() -> DocumentBody {
    DocumentBody::new(br#"{"a":"doc body"}"#.to_vec())
}

#[test]
fn empty_input_returns_empty() {
    let dir = tempfile::tempdir().unwrap();
    let ds = open_store(&dir);
    let result = ds.revs_diff(&RevisionOffers::new()).unwrap();
    assert!(result.is_empty());
}

#[test]
fn known_revision_returns_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let ds = open_store(&dir);
    let rev = ds.create_document(body()).unwrap();

    let result = ds
        .revs_diff(&offers(&[(&rev.doc_id, &[rev.rev.as_str()])]))
        .unwrap();
    assert!(result.is_empty());
}

#[test]
fn unknown_revision_of_known_doc_returned() {
    let dir = tempfile::tempdir().unwrap();
    let ds = open_store(&dir);
    let rev = ds.create_document(body()).unwrap();

    let result = ds.revs_diff(&offers(&[(&rev.doc_id, &["2-a"])])).unwrap();
    assert_eq!(result.len(), 1);
    assert!(result.missing_for(&rev.doc_id).unwrap().contains("2-a"));
}

#[test]
fn all_revisions_of_updated_doc_known() {
    let dir = tempfile::tempdir().unwrap();
    let ds = open_store(&dir);
    let rev1 = ds.create_document(body()).unwrap();
    let rev2 = ds
        .update_document(&rev1.doc_id, &rev1.rev, DocumentBody::new(br#"{"b":1}"#.to_vec()))
        .unwrap();

    let result = ds
        .revs_diff(&offers(&[(
            &rev1.doc_id,
            &[rev1.rev.as_str(), rev2.rev.as_str()],
        )]))
        .unwrap();
    assert!(result.is_empty());
}

#[test]
fn two_docs_one_with_missing() {
    let dir = tempfile::tempdir().unwrap();
    let ds = open_store(&dir);
    let rev1 = ds.create_document(body()).unwrap();
    let rev2 = ds.create_document(body()).unwrap();

    let result = ds
        .revs_diff(&offers(&[
            (&rev1.doc_id, &[rev1.rev.as_str(), "2-a"]),
            (&rev2.doc_id, &[rev2.rev.as_str()]),
        ]))
        .unwrap();
    assert_eq!(result.len(), 1);
    assert!(result.missing_for(&rev1.doc_id).unwrap().contains("2-a"));
    assert!(result.missing_for(&rev2.doc_id).is_none());
}

#[test]
fn two_docs_both_with_missing() {
    let dir = tempfile::tempdir().unwrap();
    let ds = open_store(&dir);
    let rev1 = ds.create_document(body()).unwrap();
    let rev2 = ds.create_document(body()).unwrap();

    let result = ds
        .revs_diff(&offers(&[
            (&rev1.doc_id, &[rev1.rev.as_str(), "2-a"]),
            (&rev2.doc_id, &[rev2.rev.as_str(), "2-a"]),
        ]))
        .unwrap();
    assert_eq!(result.len(), 2);
    assert!(result.missing_for(&rev1.doc_id).unwrap().contains("2-a"));
    assert!(result.missing_for(&rev2.doc_id).unwrap().contains("2-a"));
}

#[test]
fn many_offered_revisions_only_missing_returned() {
    let dir = tempfile::tempdir().unwrap();
    let ds = open_store(&dir);

    // doc1 holds exactly 1-a; doc2 holds exactly 1-a.
    for doc in ["doc1", "doc2"] {
        let rev = syncstore::RevisionBuilder::new()
            .doc_id(doc)
            .rev(syncstore::RevisionId::parse("1-a").unwrap())
            .body(body())
            .build();
        ds.force_insert(rev, &[syncstore::RevisionId::parse("1-a").unwrap()], Vec::new())
            .unwrap();
    }

    let mut offered: BTreeSet<String> = BTreeSet::new();
    for generation in 1..=99_999u64 {
        offered.insert(format!("{generation}-a"));
    }
    let mut all = RevisionOffers::new();
    all.insert("doc1".to_string(), offered);
    all.insert(
        "doc2".to_string(),
        BTreeSet::from(["1-a".to_string()]),
    );

    let result = ds.revs_diff(&all).unwrap();
    assert_eq!(result.len(), 1);
    let missing = result.missing_for("doc1").unwrap();
    assert_eq!(missing.len(), 99_998);
    assert!(!missing.contains("1-a"));
    assert!(missing.contains("2-a"));
    assert!(missing.contains("499-a"));
    assert!(missing.contains("99999-a"));
    assert!(result.missing_for("doc2").is_none());
}

#[test]
fn result_is_subset_of_offers_and_unknown_locally() {
    let dir = tempfile::tempdir().unwrap();
    let ds = open_store(&dir);
    let rev = ds.create_document(body()).unwrap();

    let input = offers(&[(&rev.doc_id, &[rev.rev.as_str(), "7-zz", "9-q"])]);
    let result = ds.revs_diff(&input).unwrap();

    for (doc, missing) in result.iter() {
        let offered = input.get(doc).unwrap();
        for r in missing {
            assert!(offered.contains(r));
            assert!(ds.get_document_rev(doc, r).is_err());
        }
    }
}

#[test]
fn revs_diff_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let ds = open_store(&dir);
    let rev = ds.create_document(body()).unwrap();

    let input = offers(&[(&rev.doc_id, &[rev.rev.as_str(), "3-x"])]);
    let first = ds.revs_diff(&input).unwrap();
    let second = ds.revs_diff(&input).unwrap();
    assert_eq!(first, second);
}

#[test]
fn serializes_to_couch_revs_diff_shape() {
    let dir = tempfile::tempdir().unwrap();
    let ds = open_store(&dir);

    let result = ds.revs_diff(&offers(&[("doc1", &["2-a", "1-b"])])).unwrap();
    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(
        json,
        serde_json::json!({"doc1": {"missing": ["1-b", "2-a"]}})
    );
}
