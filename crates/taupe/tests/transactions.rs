//! Transaction semantics through the public API: snapshot isolation,
//! atomic batches, nested rollback, and the count invariants.

use bson::doc;
use taupe::{Database, DatabaseOptions, ErrorCode};

fn open(dir: &tempfile::TempDir) -> Database {
    let options = DatabaseOptions { map_size: 40 * 1024 * 1024, ..Default::default() };
    Database::open(dir.path(), options).unwrap()
}

#[test]
fn snapshots_pin_their_state() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);

    db.insert_one("c", doc! { "v": 1 }).unwrap();
    let before = db.read_txn().unwrap();

    db.insert_one("c", doc! { "v": 2 }).unwrap();
    let after = db.read_txn().unwrap();

    // A snapshot begun before the commit never sees it; one begun after
    // always does.
    assert_eq!(db.count_with(&before, "c", None).unwrap(), 1);
    assert_eq!(db.count_with(&after, "c", None).unwrap(), 2);
    assert_eq!(db.count("c", None).unwrap(), 2);
}

#[test]
fn insert_many_is_all_or_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);

    db.insert_one("c", doc! { "_id": 2, "seed": true }).unwrap();

    // The third document collides on `_id`; the whole batch must vanish.
    let err = db
        .insert_many(
            "c",
            vec![doc! { "_id": 0 }, doc! { "_id": 1 }, doc! { "_id": 2 }, doc! { "_id": 3 }],
        )
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::DuplicateKey);

    assert_eq!(db.count("c", None).unwrap(), 1);
    assert!(db.find_one("c", &doc! { "_id": 0 }, None).unwrap().is_none());
}

#[test]
fn explicit_transaction_composes_multiple_operations() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);

    let mut wtxn = db.write_txn().unwrap();
    db.insert_one_in(&mut wtxn, "a", doc! { "n": 1 }).unwrap();
    db.insert_one_in(&mut wtxn, "b", doc! { "n": 2 }).unwrap();
    db.delete_many_in(&mut wtxn, "a", &doc! {}).unwrap();
    wtxn.commit().unwrap();

    assert_eq!(db.count("a", None).unwrap(), 0);
    assert_eq!(db.count("b", None).unwrap(), 1);
}

#[test]
fn update_inside_a_transaction_observes_its_own_writes() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);

    let mut wtxn = db.write_txn().unwrap();
    let (id, _) = db.insert_one_in(&mut wtxn, "c", doc! { "n": 1 }).unwrap();
    let summary = db
        .update_one_in(&mut wtxn, "c", &doc! { "_id": id.clone() }, &doc! { "$inc": { "n": 9 } }, false)
        .unwrap();
    assert_eq!(summary.matched, 1);
    wtxn.commit().unwrap();

    let found = db.find_one("c", &doc! { "_id": id }, None).unwrap().unwrap();
    assert_eq!(found.get_i64("n").unwrap(), 10);
}

#[test]
fn delete_one_twice_returns_true_then_false() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);

    let id = db.insert_one("c", doc! { "v": 1 }).unwrap();
    assert!(db.delete_one("c", &doc! { "_id": id.clone() }).unwrap());
    assert!(!db.delete_one("c", &doc! { "_id": id }).unwrap());
    assert_eq!(db.count("c", None).unwrap(), 0);
}

#[test]
fn count_matches_primary_entries_after_mixed_writes() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);

    for i in 0..20i32 {
        db.insert_one("c", doc! { "i": i }).unwrap();
    }
    db.delete_many("c", &doc! { "i": { "$lt": 5 } }).unwrap();
    db.update_many("c", &doc! { "i": { "$gte": 15 } }, &doc! { "$set": { "hot": true } }, false)
        .unwrap();

    assert_eq!(db.count("c", None).unwrap(), 15);
    assert_eq!(db.count("c", Some(&doc! { "hot": true })).unwrap(), 5);

    // The filtered and unfiltered counts agree with a manual walk.
    let mut cursor = db.find("c", doc! {}, None).unwrap();
    let mut walked = 0;
    while cursor.next_document().unwrap().is_some() {
        walked += 1;
    }
    assert_eq!(walked, 15);
}

#[test]
fn writers_block_each_other_but_not_readers() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);
    db.insert_one("c", doc! { "v": 1 }).unwrap();

    let wtxn = db.write_txn().unwrap();
    // Reads proceed while the writer is open.
    assert_eq!(db.count("c", None).unwrap(), 1);
    drop(wtxn);

    // A second writer proceeds once the first is gone.
    let wtxn = db.write_txn().unwrap();
    drop(wtxn);
}

#[test]
fn resize_requires_quiescence() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);

    let rtxn = db.read_txn().unwrap();
    let err = db.resize(80 * 1024 * 1024).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidState);
    drop(rtxn);
    db.resize(80 * 1024 * 1024).unwrap();
}
