//! A collection handle: its catalog record, its primary tree `col:<name>`,
//! and one `idx:<name>:<index>` sub-tree per secondary index, bundled as an
//! indexed tree. Handles are resolved per transaction from the catalog, so
//! they always agree with the snapshot they were resolved under.

use std::sync::Arc;

use bson::{Bson, Document};
use terrier::{Env, RoTxn, RwTxn, TreeFlags};

use crate::catalog::{CollectionRecord, IndexRecord};
use crate::codec;
use crate::error::UserError;
use crate::key;
use crate::query::Matcher;
use crate::store::{FieldPathExtractor, IndexedTree, SecondaryIndex};
use crate::Result;

pub(crate) fn primary_tree_name(collection: &str) -> String {
    format!("col:{collection}")
}

pub(crate) fn index_tree_name(collection: &str, index: &str) -> String {
    format!("idx:{collection}:{index}")
}

pub(crate) struct Collection {
    pub(crate) record: CollectionRecord,
    pub(crate) tree: IndexedTree,
    matcher: Arc<dyn Matcher>,
}

impl Collection {
    fn assemble(
        primary: terrier::Tree,
        record: CollectionRecord,
        indexes: Vec<(IndexRecord, terrier::Tree)>,
        matcher: Arc<dyn Matcher>,
    ) -> Collection {
        let mut tree = IndexedTree::new(primary);
        for (index_record, index_tree) in indexes {
            let extractor =
                Box::new(FieldPathExtractor::from_record(&index_record, matcher.clone()));
            tree.indexes.push(SecondaryIndex { record: index_record, tree: index_tree, extractor });
        }
        Collection { record, tree, matcher }
    }

    /// Creates (or opens) the collection's trees within a write transaction.
    pub(crate) fn create(
        env: &Env,
        wtxn: &mut RwTxn<'_>,
        record: CollectionRecord,
        index_records: Vec<IndexRecord>,
        matcher: Arc<dyn Matcher>,
    ) -> Result<Collection> {
        let primary = env.tree_options().name(&primary_tree_name(&record.name)).create(wtxn)?;
        let mut indexes = Vec::with_capacity(index_records.len());
        for index_record in index_records {
            let name = index_tree_name(&record.name, &index_record.name);
            let mut options = env.tree_options().name(&name);
            if !index_record.config.unique {
                options = options.flags(TreeFlags::MULTI_VALUE);
            }
            let tree = options.create(wtxn)?;
            indexes.push((index_record, tree));
        }
        Ok(Collection::assemble(primary, record, indexes, matcher))
    }

    /// Opens the collection's existing trees under a read transaction;
    /// `None` when the trees are not materialized in this snapshot.
    pub(crate) fn open_ro(
        env: &Env,
        txn: &RoTxn,
        record: CollectionRecord,
        index_records: Vec<IndexRecord>,
        matcher: Arc<dyn Matcher>,
    ) -> Result<Option<Collection>> {
        let primary = match env.tree_options().name(&primary_tree_name(&record.name)).open(txn)? {
            Some(primary) => primary,
            None => return Ok(None),
        };
        let mut indexes = Vec::with_capacity(index_records.len());
        for index_record in index_records {
            let name = index_tree_name(&record.name, &index_record.name);
            let mut options = env.tree_options().name(&name);
            if !index_record.config.unique {
                options = options.flags(TreeFlags::MULTI_VALUE);
            }
            match options.open(txn)? {
                Some(tree) => indexes.push((index_record, tree)),
                None => return Ok(None),
            }
        }
        Ok(Some(Collection::assemble(primary, record, indexes, matcher)))
    }

    pub(crate) fn name(&self) -> &str {
        &self.record.name
    }

    pub(crate) fn count(&self, txn: &RoTxn) -> Result<u64> {
        self.tree.len(txn)
    }

    fn check_validator(&self, doc: &Document) -> Result<()> {
        if let Some(validator) = &self.record.config.validator {
            if !self.matcher.matches(validator, doc)? {
                return Err(UserError::ValidationFailed(self.record.name.clone()).into());
            }
        }
        Ok(())
    }

    /// Assigns identity, validates, and inserts one document. Returns the
    /// `_id` and the encoded primary key.
    pub(crate) fn insert_in(
        &self,
        wtxn: &mut RwTxn<'_>,
        doc: Document,
    ) -> Result<(Bson, Vec<u8>)> {
        let (doc, id) = codec::assign_document_id(doc)?;
        self.check_validator(&doc)?;
        let primary_key = key::encode_primary_key(&id)?;
        let bytes = codec::encode_document(&doc)?;
        self.tree.insert(wtxn, &primary_key, &doc, &bytes)?;
        self.enforce_cap(wtxn)?;
        Ok((id, primary_key))
    }

    /// Validates and overwrites the document at `primary_key`, maintaining
    /// every index.
    pub(crate) fn update_in(
        &self,
        wtxn: &mut RwTxn<'_>,
        primary_key: &[u8],
        new_doc: &Document,
    ) -> Result<()> {
        self.check_validator(new_doc)?;
        let bytes = codec::encode_document(new_doc)?;
        self.tree.update(wtxn, primary_key, new_doc, &bytes)
    }

    pub(crate) fn delete_in(&self, wtxn: &mut RwTxn<'_>, primary_key: &[u8]) -> Result<bool> {
        self.tree.delete(wtxn, primary_key)
    }

    /// Capped collections evict their oldest entries (lowest primary key,
    /// which is creation order for generated ids) past the declared caps.
    /// `max_bytes` is enforced against the primary tree's page footprint.
    fn enforce_cap(&self, wtxn: &mut RwTxn<'_>) -> Result<u64> {
        if !self.record.config.capped {
            return Ok(0);
        }
        let mut evicted = 0;
        if let Some(max_docs) = self.record.config.max_docs {
            while self.tree.len(wtxn)? > max_docs {
                if !self.evict_oldest(wtxn)? {
                    break;
                }
                evicted += 1;
            }
        }
        if let Some(max_bytes) = self.record.config.max_bytes {
            loop {
                let stat = self.tree.primary.stat(wtxn)?;
                let pages = stat.branch_pages + stat.leaf_pages + stat.overflow_pages;
                let used = pages as u64 * stat.page_size as u64;
                if used <= max_bytes || stat.entries <= 1 {
                    break;
                }
                if !self.evict_oldest(wtxn)? {
                    break;
                }
                evicted += 1;
            }
        }
        Ok(evicted)
    }

    fn evict_oldest(&self, wtxn: &mut RwTxn<'_>) -> Result<bool> {
        let oldest = match self.tree.primary.first(wtxn)? {
            Some((key, _)) => key.to_vec(),
            None => return Ok(false),
        };
        self.tree.delete(wtxn, &oldest)
    }

    pub(crate) fn has_expiring_indexes(&self) -> bool {
        self.tree.indexes.iter().any(|index| Collection::sweepable(&index.record))
    }

    /// Only single-field ascending indexes are sweepable; compound or
    /// descending keys would need decoding the engine does not do.
    fn sweepable(record: &IndexRecord) -> bool {
        record.config.expire_after_seconds.is_some()
            && record.keys.len() == 1
            && record.keys.first().is_some_and(|(_, order)| *order > 0)
    }

    /// Removes every document whose indexed datetime is older than the
    /// index's `expire_after_seconds`. Entries of other types (including the
    /// Null of missing fields) never expire.
    pub(crate) fn purge_expired_in(&self, wtxn: &mut RwTxn<'_>, now: bson::DateTime) -> Result<u64> {
        let mut purged = 0;
        for index in &self.tree.indexes {
            let ttl_seconds = match index.record.config.expire_after_seconds {
                Some(secs) if Collection::sweepable(&index.record) => secs,
                _ => continue,
            };
            let cutoff_millis =
                now.timestamp_millis().saturating_sub(ttl_seconds.saturating_mul(1000) as i64);
            let bound = key::encode_datetime_bound(bson::DateTime::from_millis(cutoff_millis));

            let mut expired = Vec::new();
            {
                let mut cursor = index.tree.ro_cursor(wtxn)?;
                let mut entry = cursor.move_on_key_ge(&[key::TAG_DATE_TIME])?;
                while let Some((entry_key, primary_key)) = entry {
                    if entry_key.first() != Some(&key::TAG_DATE_TIME) || entry_key >= &bound[..] {
                        break;
                    }
                    expired.push(primary_key.to_vec());
                    entry = cursor.move_on_next()?;
                }
            }
            for primary_key in expired {
                if self.tree.delete(wtxn, &primary_key)? {
                    purged += 1;
                }
            }
        }
        Ok(purged)
    }
}
