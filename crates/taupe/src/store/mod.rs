//! The index-aware tree: a primary sub-tree plus its secondary index
//! sub-trees, mutated together under one caller-supplied write transaction.
//! On any error the caller aborts; nothing here commits.

mod extract;

use std::collections::HashSet;

use bson::Document;
use terrier::{RoCursor, RoTxn, RwTxn, Tree};

pub use self::extract::{FieldPathExtractor, KeyExtractor};
use crate::catalog::IndexRecord;
use crate::codec;
use crate::error::{InternalError, UserError};
use crate::Result;

/// One registered secondary index: its catalog record, its sub-tree, and the
/// extractor that derives entries from documents. Non-unique index trees are
/// multi-value (the duplicate values are primary keys); unique index trees
/// are plain trees written with no-overwrite puts.
pub struct SecondaryIndex {
    pub record: IndexRecord,
    pub tree: Tree,
    pub extractor: Box<dyn KeyExtractor>,
}

impl SecondaryIndex {
    fn put_entry(&self, wtxn: &mut RwTxn<'_>, key: &[u8], primary_key: &[u8]) -> Result<()> {
        if self.record.config.unique {
            match self.tree.put_no_overwrite(wtxn, key, primary_key) {
                Ok(()) => Ok(()),
                Err(terrier::Error::Mdb(terrier::MdbError::KeyExist)) => {
                    Err(UserError::IndexConstraint { index: self.record.name.clone() }.into())
                }
                Err(e) => Err(e.into()),
            }
        } else {
            self.tree.put(wtxn, key, primary_key)?;
            Ok(())
        }
    }

    fn delete_entry(&self, wtxn: &mut RwTxn<'_>, key: &[u8], primary_key: &[u8]) -> Result<()> {
        if self.record.config.unique {
            self.tree.delete(wtxn, key)?;
        } else {
            self.tree.delete_one_value(wtxn, key, primary_key)?;
        }
        Ok(())
    }
}

/// A primary tree and the indexes maintained synchronously with it.
pub struct IndexedTree {
    pub primary: Tree,
    pub indexes: Vec<SecondaryIndex>,
}

impl IndexedTree {
    pub fn new(primary: Tree) -> IndexedTree {
        IndexedTree { primary, indexes: Vec::new() }
    }

    /// Number of live primary entries, O(1) from the tree statistic.
    pub fn len(&self, txn: &RoTxn) -> Result<u64> {
        Ok(self.primary.len(txn)?)
    }

    pub fn is_empty(&self, txn: &RoTxn) -> Result<bool> {
        self.len(txn).map(|len| len == 0)
    }

    fn index(&self, name: &str) -> Option<&SecondaryIndex> {
        self.indexes.iter().find(|index| index.record.name == name)
    }

    /// Whether a unique index already maps `entry` to a different primary
    /// key than `self_key`.
    fn index_conflicts(
        &self,
        txn: &RoTxn,
        index: &SecondaryIndex,
        entry: &[u8],
        self_key: &[u8],
    ) -> Result<bool> {
        match index.tree.get(txn, entry)? {
            Some(existing) => Ok(existing != self_key),
            None => Ok(false),
        }
    }

    /// Inserts a fresh entry and one entry per applicable index. Unique
    /// constraints are verified before anything is written, so a constraint
    /// error leaves the transaction clean.
    pub fn insert(
        &self,
        wtxn: &mut RwTxn<'_>,
        key: &[u8],
        doc: &Document,
        bytes: &[u8],
    ) -> Result<()> {
        let extracted: Vec<Option<Vec<u8>>> = self
            .indexes
            .iter()
            .map(|index| index.extractor.extract(doc))
            .collect::<Result<_>>()?;

        for (index, entry) in self.indexes.iter().zip(&extracted) {
            if let (true, Some(entry)) = (index.record.config.unique, entry) {
                if self.index_conflicts(wtxn, index, entry, key)? {
                    return Err(UserError::DuplicateKey {
                        index: Some(index.record.name.clone()),
                    }
                    .into());
                }
            }
        }

        match self.primary.put_no_overwrite(wtxn, key, bytes) {
            Ok(()) => {}
            Err(terrier::Error::Mdb(terrier::MdbError::KeyExist)) => {
                return Err(UserError::DuplicateKey { index: None }.into())
            }
            Err(e) => return Err(e.into()),
        }

        for (index, entry) in self.indexes.iter().zip(&extracted) {
            if let Some(entry) = entry {
                index.put_entry(wtxn, entry, key)?;
            }
        }
        Ok(())
    }

    /// Overwrites the entry at `key` with `new_doc`, rewriting every index
    /// entry whose extracted key changed.
    pub fn update(
        &self,
        wtxn: &mut RwTxn<'_>,
        key: &[u8],
        new_doc: &Document,
        new_bytes: &[u8],
    ) -> Result<()> {
        let old_doc = match self.primary.get(wtxn, key)? {
            Some(old_bytes) => codec::decode_document(old_bytes)?,
            None => return Err(UserError::DocumentNotFound.into()),
        };

        let changes: Vec<(Option<Vec<u8>>, Option<Vec<u8>>)> = self
            .indexes
            .iter()
            .map(|index| {
                Ok((index.extractor.extract(&old_doc)?, index.extractor.extract(new_doc)?))
            })
            .collect::<Result<_>>()?;

        for (index, (old_entry, new_entry)) in self.indexes.iter().zip(&changes) {
            if index.record.config.unique && new_entry != old_entry {
                if let Some(new_entry) = new_entry {
                    if self.index_conflicts(wtxn, index, new_entry, key)? {
                        return Err(UserError::IndexConstraint {
                            index: index.record.name.clone(),
                        }
                        .into());
                    }
                }
            }
        }

        for (index, (old_entry, new_entry)) in self.indexes.iter().zip(&changes) {
            if old_entry == new_entry {
                continue;
            }
            if let Some(old_entry) = old_entry {
                index.delete_entry(wtxn, old_entry, key)?;
            }
            if let Some(new_entry) = new_entry {
                index.put_entry(wtxn, new_entry, key)?;
            }
        }

        self.primary.put(wtxn, key, new_bytes)?;
        Ok(())
    }

    /// Deletes the entry at `key` and its index entries. Absence is not an
    /// error: returns whether a document was removed.
    pub fn delete(&self, wtxn: &mut RwTxn<'_>, key: &[u8]) -> Result<bool> {
        let old_doc = match self.primary.get(wtxn, key)? {
            Some(old_bytes) => codec::decode_document(old_bytes)?,
            None => return Ok(false),
        };

        for index in &self.indexes {
            if let Some(entry) = index.extractor.extract(&old_doc)? {
                index.delete_entry(wtxn, &entry, key)?;
            }
        }
        self.primary.delete(wtxn, key)?;
        Ok(true)
    }

    /// Fills a freshly created index from the existing primary entries, all
    /// under the caller's transaction. A unique violation aborts before any
    /// index entry is written.
    pub fn populate_index(&self, wtxn: &mut RwTxn<'_>, index: &SecondaryIndex) -> Result<()> {
        let mut entries = Vec::new();
        {
            let mut seen = HashSet::new();
            let mut cursor = self.primary.ro_cursor(wtxn)?;
            let mut entry = cursor.move_on_first()?;
            while let Some((key, bytes)) = entry {
                let doc = codec::decode_document(bytes)?;
                if let Some(extracted) = index.extractor.extract(&doc)? {
                    if index.record.config.unique && !seen.insert(extracted.clone()) {
                        return Err(UserError::IndexConstraint {
                            index: index.record.name.clone(),
                        }
                        .into());
                    }
                    entries.push((extracted, key.to_vec()));
                }
                entry = cursor.move_on_next()?;
            }
        }
        for (extracted, primary_key) in entries {
            index.put_entry(wtxn, &extracted, &primary_key)?;
        }
        Ok(())
    }

    /// A cursor over the named index, positioned at the first entry with the
    /// given extracted key; entry values are primary keys.
    pub fn index_seek<'t>(
        &self,
        txn: &'t RoTxn,
        index_name: &str,
        key: &[u8],
    ) -> Result<Option<RoCursor<'t>>> {
        let index = self.index(index_name).ok_or_else(|| UserError::IndexNotFound {
            collection: self
                .indexes
                .first()
                .map(|i| i.record.collection.clone())
                .unwrap_or_default(),
            index: index_name.to_string(),
        })?;
        let mut cursor = index.tree.ro_cursor(txn)?;
        match cursor.move_on_key(key)? {
            Some(_) => Ok(Some(cursor)),
            None => Ok(None),
        }
    }

    /// Dereferences an index entry's value back to the primary document.
    pub fn fetch(&self, txn: &RoTxn, primary_key: &[u8]) -> Result<Document> {
        match self.primary.get(txn, primary_key)? {
            Some(bytes) => codec::decode_document(bytes),
            None => Err(InternalError::DanglingIndexEntry.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bson::doc;
    use time::OffsetDateTime;

    use super::*;
    use crate::catalog::IndexConfig;
    use crate::query::DefaultMatcher;
    use crate::Error;

    fn secondary(
        env: &terrier::Env,
        wtxn: &mut RwTxn<'_>,
        name: &str,
        field: &str,
        config: IndexConfig,
    ) -> SecondaryIndex {
        let record = IndexRecord {
            name: name.to_string(),
            collection: "c".into(),
            keys: vec![(field.to_string(), 1)],
            config,
            created_at: OffsetDateTime::UNIX_EPOCH,
        };
        let mut options = env.tree_options().name(&format!("idx:c:{name}"));
        if !record.config.unique {
            options = options.flags(terrier::TreeFlags::MULTI_VALUE);
        }
        let tree = options.create(wtxn).unwrap();
        let extractor = Box::new(FieldPathExtractor::from_record(&record, Arc::new(DefaultMatcher)));
        SecondaryIndex { record, tree, extractor }
    }

    fn setup(unique: bool) -> (tempfile::TempDir, terrier::Env, IndexedTree) {
        let dir = tempfile::tempdir().unwrap();
        let env = terrier::EnvOpenOptions::new()
            .map_size(10 * 1024 * 1024)
            .open(dir.path())
            .unwrap();
        let mut wtxn = env.write_txn().unwrap();
        let primary = env.tree_options().name("col:c").create(&mut wtxn).unwrap();
        let index = secondary(
            &env,
            &mut wtxn,
            "v_1",
            "v",
            IndexConfig { unique, ..Default::default() },
        );
        wtxn.commit().unwrap();
        let mut tree = IndexedTree::new(primary);
        tree.indexes.push(index);
        (dir, env, tree)
    }

    fn put(tree: &IndexedTree, wtxn: &mut RwTxn<'_>, key: &[u8], doc: bson::Document) {
        let bytes = codec::encode_document(&doc).unwrap();
        tree.insert(wtxn, key, &doc, &bytes).unwrap();
    }

    #[test]
    fn insert_maintains_primary_and_index_together() {
        let (_dir, env, tree) = setup(false);
        let mut wtxn = env.write_txn().unwrap();
        put(&tree, &mut wtxn, b"k1", doc! { "v": 10 });
        put(&tree, &mut wtxn, b"k2", doc! { "v": 10 });
        wtxn.commit().unwrap();

        let rtxn = env.read_txn().unwrap();
        assert_eq!(tree.len(&rtxn).unwrap(), 2);
        assert_eq!(tree.indexes[0].tree.len(&rtxn).unwrap(), 2);

        let key = crate::key::encode_index_key(&[(Some(&bson::Bson::Int32(10)), false)]).unwrap();
        let mut cursor = tree.index_seek(&rtxn, "v_1", &key).unwrap().unwrap();
        let (_, primary_key) = cursor.current().unwrap().unwrap();
        let doc = tree.fetch(&rtxn, primary_key).unwrap();
        assert_eq!(doc.get_i32("v").unwrap(), 10);
    }

    #[test]
    fn unique_index_rejects_second_insert_with_no_side_effects() {
        let (_dir, env, tree) = setup(true);
        let mut wtxn = env.write_txn().unwrap();
        put(&tree, &mut wtxn, b"k1", doc! { "v": 1 });
        let doc = doc! { "v": 1 };
        let bytes = codec::encode_document(&doc).unwrap();
        let err = tree.insert(&mut wtxn, b"k2", &doc, &bytes).unwrap_err();
        assert!(matches!(err, Error::UserError(UserError::DuplicateKey { .. })));

        // The failed insert wrote nothing.
        assert_eq!(tree.len(&wtxn).unwrap(), 1);
        assert_eq!(tree.indexes[0].tree.len(&wtxn).unwrap(), 1);
        wtxn.commit().unwrap();
    }

    #[test]
    fn update_rewrites_only_changed_index_entries() {
        let (_dir, env, tree) = setup(false);
        let mut wtxn = env.write_txn().unwrap();
        put(&tree, &mut wtxn, b"k1", doc! { "v": 1 });

        let new_doc = doc! { "v": 2 };
        let new_bytes = codec::encode_document(&new_doc).unwrap();
        tree.update(&mut wtxn, b"k1", &new_doc, &new_bytes).unwrap();

        let old_key = crate::key::encode_index_key(&[(Some(&bson::Bson::Int32(1)), false)]).unwrap();
        let new_key = crate::key::encode_index_key(&[(Some(&bson::Bson::Int32(2)), false)]).unwrap();
        assert!(tree.index_seek(&wtxn, "v_1", &old_key).unwrap().is_none());
        assert!(tree.index_seek(&wtxn, "v_1", &new_key).unwrap().is_some());
        assert_eq!(tree.indexes[0].tree.len(&wtxn).unwrap(), 1);
        wtxn.abort();
    }

    #[test]
    fn update_missing_key_is_not_found() {
        let (_dir, env, tree) = setup(false);
        let mut wtxn = env.write_txn().unwrap();
        let doc = doc! { "v": 1 };
        let bytes = codec::encode_document(&doc).unwrap();
        let err = tree.update(&mut wtxn, b"nope", &doc, &bytes).unwrap_err();
        assert!(matches!(err, Error::UserError(UserError::DocumentNotFound)));
        wtxn.abort();
    }

    #[test]
    fn delete_is_idempotent_and_cleans_indexes() {
        let (_dir, env, tree) = setup(false);
        let mut wtxn = env.write_txn().unwrap();
        put(&tree, &mut wtxn, b"k1", doc! { "v": 1 });
        assert!(tree.delete(&mut wtxn, b"k1").unwrap());
        assert!(!tree.delete(&mut wtxn, b"k1").unwrap());
        assert_eq!(tree.len(&wtxn).unwrap(), 0);
        assert_eq!(tree.indexes[0].tree.len(&wtxn).unwrap(), 0);
        wtxn.commit().unwrap();
    }

    #[test]
    fn populate_after_the_fact_equals_incremental_maintenance() {
        let (_dir, env, mut tree) = setup(false);

        // Insert through the indexed tree, then rebuild the same index from
        // scratch and compare entry counts and positions.
        let mut wtxn = env.write_txn().unwrap();
        for i in 0..10i32 {
            put(&tree, &mut wtxn, format!("k{i}").as_bytes(), doc! { "v": i % 3 });
        }
        wtxn.commit().unwrap();

        let mut wtxn = env.write_txn().unwrap();
        let rebuilt = secondary(&env, &mut wtxn, "v_rebuilt", "v", IndexConfig::default());
        tree.populate_index(&mut wtxn, &rebuilt).unwrap();
        wtxn.commit().unwrap();

        let rtxn = env.read_txn().unwrap();
        let original = &tree.indexes[0];
        assert_eq!(original.tree.len(&rtxn).unwrap(), rebuilt.tree.len(&rtxn).unwrap());

        let mut left = original.tree.ro_cursor(&rtxn).unwrap();
        let mut right = rebuilt.tree.ro_cursor(&rtxn).unwrap();
        let mut l = left.move_on_first().unwrap();
        let mut r = right.move_on_first().unwrap();
        while let (Some(a), Some(b)) = (l, r) {
            assert_eq!(a, b);
            l = left.move_on_next().unwrap();
            r = right.move_on_next().unwrap();
        }
        assert!(l.is_none() && r.is_none());
        tree.indexes.push(rebuilt);
    }

    #[test]
    fn populate_unique_detects_existing_violation() {
        let (_dir, env, tree) = setup(false);
        let mut wtxn = env.write_txn().unwrap();
        put(&tree, &mut wtxn, b"k1", doc! { "v": 5 });
        put(&tree, &mut wtxn, b"k2", doc! { "v": 5 });
        wtxn.commit().unwrap();

        let mut wtxn = env.write_txn().unwrap();
        let unique = secondary(
            &env,
            &mut wtxn,
            "v_unique",
            "v",
            IndexConfig { unique: true, ..Default::default() },
        );
        let err = tree.populate_index(&mut wtxn, &unique).unwrap_err();
        assert!(matches!(err, Error::UserError(UserError::IndexConstraint { .. })));
        wtxn.abort();
    }
}
