//! Query-path laws: the `_id` fast path, the index-assisted path, and the
//! filtered scan must be indistinguishable through the public API; the
//! cursor state machine enforces its transitions.

use bson::{doc, Bson, Document};
use taupe::{Database, DatabaseOptions, ErrorCode, IndexConfig};

fn open(dir: &tempfile::TempDir) -> Database {
    let options = DatabaseOptions { map_size: 40 * 1024 * 1024, ..Default::default() };
    Database::open(dir.path(), options).unwrap()
}

fn collect(db: &Database, collection: &str, filter: Document) -> Vec<Document> {
    let mut cursor = db.find(collection, filter, None).unwrap();
    let mut docs = Vec::new();
    while let Some(doc) = cursor.next_document().unwrap() {
        docs.push(doc);
    }
    docs
}

#[test]
fn indexed_and_unindexed_queries_return_identical_documents() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);

    for i in 0..50i32 {
        db.insert_one("items", doc! { "group": i % 5, "rank": i }).unwrap();
    }

    // Scan first, then create the index and query again: same documents.
    let scanned = collect(&db, "items", doc! { "group": 3 });
    assert_eq!(scanned.len(), 10);

    db.create_index("items", &doc! { "group": 1 }, None, IndexConfig::default()).unwrap();
    let indexed = collect(&db, "items", doc! { "group": 3 });
    assert_eq!(scanned, indexed);

    // The residual predicate is still applied on the fetched documents.
    let filtered = collect(&db, "items", doc! { "group": 3, "rank": { "$gte": 23 } });
    assert_eq!(
        filtered.iter().map(|d| d.get_i32("rank").unwrap()).collect::<Vec<_>>(),
        vec![23, 28, 33, 38, 43, 48],
    );
}

#[test]
fn id_fast_path_agrees_with_scan() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);

    let id = db.insert_one("items", doc! { "v": 7 }).unwrap();
    db.insert_one("items", doc! { "v": 8 }).unwrap();

    let fast = db.find_one("items", &doc! { "_id": id.clone() }, None).unwrap().unwrap();
    let scanned = collect(&db, "items", doc! { "v": 7 });
    assert_eq!(vec![fast], scanned);
}

#[test]
fn cursor_state_machine_enforces_transitions() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);
    db.insert_many("c", vec![doc! { "v": 1 }, doc! { "v": 2 }]).unwrap();

    let mut cursor = db.find("c", doc! {}, None).unwrap();
    cursor.set_skip(0).unwrap();
    cursor.set_limit(5).unwrap();

    assert!(cursor.next_document().unwrap().is_some());
    // Fresh-only configuration calls now fail.
    let err = cursor.set_limit(1).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidState);
    let err = cursor.set_sort(doc! { "v": 1 }).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidState);

    assert!(cursor.next_document().unwrap().is_some());
    assert!(cursor.next_document().unwrap().is_none());
    assert!(cursor.is_exhausted());
    // Exhausted yields false forever, without side effects.
    assert!(cursor.next_document().unwrap().is_none());
    assert!(!cursor.more().unwrap());
    assert_eq!(cursor.returned(), 2);
    cursor.destroy();
}

#[test]
fn sort_skip_limit_compose_in_that_order() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);

    for v in [5, 3, 1, 4, 2] {
        db.insert_one("nums", doc! { "v": v }).unwrap();
    }

    let mut cursor = db.find("nums", doc! {}, None).unwrap();
    cursor.set_sort(doc! { "v": -1 }).unwrap();
    cursor.set_skip(1).unwrap();
    cursor.set_limit(2).unwrap();

    let mut got = Vec::new();
    while let Some(doc) = cursor.next_document().unwrap() {
        got.push(doc.get_i32("v").unwrap());
    }
    assert_eq!(got, vec![4, 3]);
}

#[test]
fn sort_orders_across_numeric_widths_and_missing_fields() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);

    db.insert_one("m", doc! { "v": 2i64 }).unwrap();
    db.insert_one("m", doc! { "other": true }).unwrap();
    db.insert_one("m", doc! { "v": 1.5 }).unwrap();
    db.insert_one("m", doc! { "v": 3i32 }).unwrap();

    let mut cursor = db.find("m", doc! {}, None).unwrap();
    cursor.set_sort(doc! { "v": 1 }).unwrap();
    let mut got = Vec::new();
    while let Some(doc) = cursor.next_document().unwrap() {
        got.push(doc.get("v").cloned());
    }
    assert_eq!(
        got,
        vec![
            None,
            Some(Bson::Double(1.5)),
            Some(Bson::Int64(2)),
            Some(Bson::Int32(3)),
        ],
    );
}

#[test]
fn skip_and_limit_without_sort_stream_in_key_order() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);

    for i in 0..10i32 {
        db.insert_one("s", doc! { "i": i }).unwrap();
    }
    let mut cursor = db.find("s", doc! {}, None).unwrap();
    cursor.set_skip(7).unwrap();

    let mut got = Vec::new();
    while let Some(doc) = cursor.next_document().unwrap() {
        got.push(doc.get_i32("i").unwrap());
    }
    // Generated ids are monotonic, so key order is insertion order.
    assert_eq!(got, vec![7, 8, 9]);
    assert_eq!(cursor.position(), 10);
    assert_eq!(cursor.returned(), 3);
}

#[test]
fn find_on_a_missing_collection_is_empty_not_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);
    let mut cursor = db.find("ghost", doc! { "x": 1 }, None).unwrap();
    assert!(!cursor.more().unwrap());
    assert!(cursor.next_document().unwrap().is_none());
    assert!(db.find_one("ghost", &doc! {}, None).unwrap().is_none());
    assert_eq!(db.count("ghost", None).unwrap(), 0);
}

#[test]
fn distinct_collects_unique_values_in_first_encounter_order() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);

    db.insert_many(
        "tags",
        vec![
            doc! { "t": "b", "k": 1 },
            doc! { "t": "a", "k": 1 },
            doc! { "t": "b", "k": 2 },
            doc! { "t": "c", "k": 1 },
        ],
    )
    .unwrap();

    let values = db.distinct("tags", "t", &doc! {}).unwrap();
    assert_eq!(
        values,
        vec![Bson::String("b".into()), Bson::String("a".into()), Bson::String("c".into())]
    );

    let values = db.distinct("tags", "t", &doc! { "k": 1 }).unwrap();
    assert_eq!(values.len(), 3);
    let values = db.distinct("tags", "t", &doc! { "k": 2 }).unwrap();
    assert_eq!(values, vec![Bson::String("b".into())]);
}

#[test]
fn unknown_operators_are_rejected_with_the_argument_code() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);
    db.insert_one("c", doc! { "v": 1 }).unwrap();
    let err = db.find_one("c", &doc! { "v": { "$near": 3 } }, None).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
    assert_eq!(err.exit_status(), 2);
}
