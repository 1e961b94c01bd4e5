use terrier::{EnvOpenOptions, Error, MdbError, TreeFlags};

#[test]
fn map_full_is_recoverable_after_resize() {
    let dir = tempfile::tempdir().unwrap();
    // Deliberately tiny map so bulk inserts exhaust it.
    let env = EnvOpenOptions::new().map_size(256 * 1024).open(dir.path()).unwrap();

    let mut wtxn = env.write_txn().unwrap();
    let tree = env.tree_options().name("bulk").create(&mut wtxn).unwrap();
    wtxn.commit().unwrap();

    let value = vec![0xAB; 1024];
    let mut wtxn = env.write_txn().unwrap();
    let mut failed = None;
    for i in 0u32..1024 {
        match tree.put(&mut wtxn, &i.to_be_bytes(), &value) {
            Ok(()) => {}
            Err(e) => {
                failed = Some(e);
                break;
            }
        }
    }
    let err = failed.expect("a 256 KiB map cannot hold 1 MiB of values");
    assert!(matches!(err, Error::Mdb(MdbError::MapFull)), "unexpected error: {err}");
    assert!(err.is_recoverable());
    wtxn.abort();

    // Nothing from the failed attempt is visible.
    let rtxn = env.read_txn().unwrap();
    assert_eq!(tree.len(&rtxn).unwrap(), 0);
    drop(rtxn);

    // Grow the map and retry the whole batch.
    env.resize(16 * 1024 * 1024).unwrap();
    let mut wtxn = env.write_txn().unwrap();
    for i in 0u32..1024 {
        tree.put(&mut wtxn, &i.to_be_bytes(), &value).unwrap();
    }
    wtxn.commit().unwrap();

    let rtxn = env.read_txn().unwrap();
    assert_eq!(tree.len(&rtxn).unwrap(), 1024);
}

#[test]
fn zero_copy_reads_are_bounded_by_the_transaction() {
    let dir = tempfile::tempdir().unwrap();
    let env = EnvOpenOptions::new().map_size(10 * 1024 * 1024).open(dir.path()).unwrap();

    let mut wtxn = env.write_txn().unwrap();
    let tree = env.tree_options().name("t").create(&mut wtxn).unwrap();
    tree.put(&mut wtxn, b"k", b"value bytes").unwrap();
    wtxn.commit().unwrap();

    let rtxn = env.read_txn().unwrap();
    let value = tree.get(&rtxn, b"k").unwrap().unwrap();
    assert_eq!(value, b"value bytes");
    // `value` borrows `rtxn`; the snapshot cannot end while it is alive.
    // Copy out, then release the snapshot.
    let owned = value.to_vec();
    drop(rtxn);
    assert_eq!(owned, b"value bytes");
}

#[test]
fn multi_value_tree_keeps_values_sorted() {
    let dir = tempfile::tempdir().unwrap();
    let env = EnvOpenOptions::new().map_size(10 * 1024 * 1024).open(dir.path()).unwrap();

    let mut wtxn = env.write_txn().unwrap();
    let tree =
        env.tree_options().name("dups").flags(TreeFlags::MULTI_VALUE).create(&mut wtxn).unwrap();
    tree.put(&mut wtxn, b"k", b"c").unwrap();
    tree.put(&mut wtxn, b"k", b"a").unwrap();
    tree.put(&mut wtxn, b"k", b"b").unwrap();
    wtxn.commit().unwrap();

    let rtxn = env.read_txn().unwrap();
    let mut cursor = tree.ro_cursor(&rtxn).unwrap();
    let mut values = Vec::new();
    if let Some((_, data)) = cursor.move_on_key(b"k").unwrap() {
        values.push(data.to_vec());
        while let Some((_, data)) = cursor.move_on_next_dup().unwrap() {
            values.push(data.to_vec());
        }
    }
    assert_eq!(values, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
}

#[test]
fn stats_report_entries_and_depth() {
    let dir = tempfile::tempdir().unwrap();
    let env = EnvOpenOptions::new().map_size(10 * 1024 * 1024).open(dir.path()).unwrap();

    let mut wtxn = env.write_txn().unwrap();
    let tree = env.tree_options().name("t").create(&mut wtxn).unwrap();
    for i in 0u32..500 {
        tree.put(&mut wtxn, &i.to_be_bytes(), &[0u8; 64]).unwrap();
    }
    wtxn.commit().unwrap();

    let rtxn = env.read_txn().unwrap();
    let stat = tree.stat(&rtxn).unwrap();
    assert_eq!(stat.entries, 500);
    assert!(stat.depth >= 1);
    assert!(stat.page_size >= 4096);

    let info = env.info().unwrap();
    assert_eq!(info.map_size, 10 * 1024 * 1024);
}
