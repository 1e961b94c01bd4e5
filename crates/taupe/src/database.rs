//! The database handle: the page-store environment, the catalog, the write
//! serialization lock, the read-transaction pool, and the document cache.
//! Every public operation resolves its collection from the catalog under its
//! own transaction, so handles always agree with the snapshot they run in.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bson::{Bson, Document};
use terrier::{Env, EnvFlags, EnvOpenOptions, RoTxn, RwTxn};
use time::OffsetDateTime;
use tracing::debug;

use crate::catalog::{
    Catalog, CollectionConfig, CollectionRecord, IndexConfig, IndexRecord,
};
use crate::codec;
use crate::collection::{index_tree_name, Collection};
use crate::cursor::{Cursor, SourceSpec};
use crate::error::UserError;
use crate::key;
use crate::query::{
    plan_query, DefaultMatcher, DefaultUpdateDriver, Matcher, Plan, UpdateDriver,
};
use crate::store::{FieldPathExtractor, SecondaryIndex};
use crate::txn_pool::TxnPool;
use crate::cache::DocumentCache;
use crate::Result;

/// How commits reach the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoMode {
    /// Flush data and meta pages on every commit.
    #[default]
    Sync,
    /// Skip the flush; a crash may lose the last commits but cannot corrupt
    /// committed state. `sync(force)` still flushes on demand.
    Async,
    /// Write through a writable memory mapping with asynchronous flushes.
    MappedWrite,
}

impl IoMode {
    fn env_flags(self) -> EnvFlags {
        match self {
            IoMode::Sync => EnvFlags::empty(),
            IoMode::Async => EnvFlags::NO_SYNC,
            IoMode::MappedWrite => EnvFlags::WRITE_MAP | EnvFlags::MAP_ASYNC,
        }
    }
}

/// Options of [`Database::open`].
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    /// Virtual map size in bytes; also the hard bound on database growth.
    pub map_size: usize,
    /// Maximum number of named sub-trees (collections plus indexes).
    pub max_sub_trees: u32,
    pub max_readers: u32,
    pub max_collections: usize,
    pub io_mode: IoMode,
    /// Idle read transactions kept for point reads.
    pub txn_pool_size: usize,
    /// Document cache caps; zero items or zero bytes disables it.
    pub cache_max_items: usize,
    pub cache_max_bytes: usize,
    pub cache_ttl_ms: u64,
    /// User blob stored as the database metadata on first open.
    pub metadata: Option<Document>,
}

impl Default for DatabaseOptions {
    fn default() -> DatabaseOptions {
        DatabaseOptions {
            map_size: 1024 * 1024 * 1024,
            max_sub_trees: 256,
            max_readers: 126,
            max_collections: 128,
            io_mode: IoMode::Sync,
            txn_pool_size: 4,
            cache_max_items: 1024,
            cache_max_bytes: 32 * 1024 * 1024,
            cache_ttl_ms: 30_000,
            metadata: None,
        }
    }
}

/// Outcome of the update family of operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateSummary {
    pub matched: u64,
    pub modified: u64,
    pub upserted_id: Option<Bson>,
}

/// What `find_and_modify` does with the matched document.
#[derive(Debug, Clone)]
pub enum ModifyAction {
    Update(Document),
    Remove,
}

#[derive(Debug, Clone)]
pub struct DatabaseStats {
    pub map_size: usize,
    pub last_txn_id: u64,
    pub page_size: u32,
    pub collections: Vec<CollectionStats>,
}

#[derive(Debug, Clone)]
pub struct CollectionStats {
    pub name: String,
    pub documents: u64,
    pub indexes: usize,
}

struct DatabaseInner {
    env: Env,
    catalog: Catalog,
    /// Serializes the write API and catalog edits on top of the page
    /// store's own writer lock.
    write_lock: Mutex<()>,
    pool: Arc<TxnPool>,
    cache: DocumentCache,
    matcher: Arc<dyn Matcher>,
    updater: Arc<dyn UpdateDriver>,
    max_collections: usize,
}

/// An embedded document database in one directory. Cheap to clone and
/// shareable across threads; the environment closes when the last clone and
/// the last outstanding transaction are gone.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Opens (creating files as needed) the database at `path`, an existing
    /// directory. Committed state from previous opens is recovered as-is.
    pub fn open<P: AsRef<Path>>(path: P, options: DatabaseOptions) -> Result<Database> {
        Database::open_with(
            path,
            options,
            Arc::new(DefaultMatcher),
            Arc::new(DefaultUpdateDriver),
        )
    }

    /// Like [`Database::open`] with caller-supplied matcher and update
    /// engines.
    pub fn open_with<P: AsRef<Path>>(
        path: P,
        options: DatabaseOptions,
        matcher: Arc<dyn Matcher>,
        updater: Arc<dyn UpdateDriver>,
    ) -> Result<Database> {
        let env = EnvOpenOptions::new()
            .map_size(options.map_size)
            .max_trees(options.max_sub_trees)
            .max_readers(options.max_readers)
            .flags(options.io_mode.env_flags())
            .open(path.as_ref())?;

        let mut wtxn = env.write_txn()?;
        let catalog = Catalog::create(&env, &mut wtxn)?;
        if let Some(metadata) = &options.metadata {
            if catalog.db_metadata(&wtxn)?.is_none() {
                catalog.put_db_metadata(&mut wtxn, metadata)?;
            }
        }
        wtxn.commit()?;

        debug!(path = %path.as_ref().display(), "database opened");
        Ok(Database {
            inner: Arc::new(DatabaseInner {
                pool: Arc::new(TxnPool::new(env.clone(), options.txn_pool_size)),
                cache: DocumentCache::new(
                    options.cache_max_items,
                    options.cache_max_bytes,
                    Duration::from_millis(options.cache_ttl_ms),
                ),
                env,
                catalog,
                write_lock: Mutex::new(()),
                matcher,
                updater,
                max_collections: options.max_collections,
            }),
        })
    }

    /// Closes the handle. The environment itself closes once every clone,
    /// cursor, and transaction is gone.
    pub fn close(self) {}

    /// Flushes buffered pages; with `force`, synchronously even in the
    /// async I/O modes. Errors surface but do not invalidate the handle.
    pub fn sync(&self, force: bool) -> Result<()> {
        Ok(self.inner.env.sync(force)?)
    }

    /// Grows (or shrinks) the virtual map. No transaction may be live.
    pub fn resize(&self, new_map_size: usize) -> Result<()> {
        Ok(self.inner.env.resize(new_map_size)?)
    }

    /// Writes a consistent backup of the whole database to `path`.
    pub fn copy_to_path<P: AsRef<Path>>(&self, path: P, compact: bool) -> Result<()> {
        Ok(self.inner.env.copy_to_path(path, compact)?)
    }

    pub fn stats(&self) -> Result<DatabaseStats> {
        let txn = self.inner.pool.take()?;
        let result = (|| -> Result<DatabaseStats> {
            let info = self.inner.env.info()?;
            let stat = self.inner.env.stat()?;
            let mut collections = Vec::new();
            for record in self.inner.catalog.collections(&txn)? {
                let indexes = self.inner.catalog.indexes(&txn, &record.name)?;
                let documents = match self.resolve_ro(&txn, &record.name)? {
                    Some(col) => col.count(&txn)?,
                    None => 0,
                };
                collections.push(CollectionStats {
                    name: record.name,
                    documents,
                    indexes: indexes.len(),
                });
            }
            Ok(DatabaseStats {
                map_size: info.map_size,
                last_txn_id: info.last_txn_id,
                page_size: stat.page_size,
                collections,
            })
        })();
        self.inner.pool.give(txn);
        result
    }

    /// A read snapshot for composing point reads with the `_with` variants.
    pub fn read_txn(&self) -> Result<RoTxn> {
        Ok(self.inner.env.read_txn()?)
    }

    /// The exclusive write transaction for composing the `_in` variants.
    /// Dropping it rolls everything back; `commit` publishes atomically.
    pub fn write_txn(&self) -> Result<RwTxn<'static>> {
        Ok(self.inner.env.write_txn()?)
    }

    /* collection management */

    pub fn create_collection(&self, name: &str, config: CollectionConfig) -> Result<()> {
        let _guard = self.inner.write_lock.lock().unwrap();
        let mut wtxn = self.inner.env.write_txn()?;
        if self.inner.catalog.collection(&wtxn, name)?.is_none() {
            self.create_collection_in(&mut wtxn, name, config)?;
            wtxn.commit()?;
            debug!(collection = name, "collection created");
        }
        Ok(())
    }

    /// Creates the collection inside a caller transaction; a no-op when it
    /// already exists.
    pub fn create_collection_in(
        &self,
        wtxn: &mut RwTxn<'_>,
        name: &str,
        config: CollectionConfig,
    ) -> Result<()> {
        if self.inner.catalog.collection(wtxn, name)?.is_some() {
            return Ok(());
        }
        validate_collection_name(name)?;
        if self.inner.catalog.collections(wtxn)?.len() >= self.inner.max_collections {
            return Err(UserError::MaxCollectionsReached(self.inner.max_collections).into());
        }
        let now = OffsetDateTime::now_utc();
        let record =
            CollectionRecord { name: name.to_string(), config, created_at: now, updated_at: now };
        self.inner.catalog.put_collection(wtxn, &record)?;
        Collection::create(&self.inner.env, wtxn, record, vec![], self.inner.matcher.clone())?;
        Ok(())
    }

    /// Drops the collection, every one of its index sub-trees, and their
    /// catalog rows. Returns whether the collection existed.
    pub fn drop_collection(&self, name: &str) -> Result<bool> {
        let _guard = self.inner.write_lock.lock().unwrap();
        let mut wtxn = self.inner.env.write_txn()?;
        let col = match self.resolve_in(&mut wtxn, name, false) {
            Ok(col) => col,
            Err(crate::Error::UserError(UserError::CollectionNotFound(_))) => return Ok(false),
            Err(e) => return Err(e),
        };
        for index in &col.tree.indexes {
            index.tree.destroy(&mut wtxn)?;
            self.inner.catalog.delete_index(&mut wtxn, name, &index.record.name)?;
        }
        col.tree.primary.destroy(&mut wtxn)?;
        self.inner.catalog.delete_collection(&mut wtxn, name)?;
        wtxn.commit()?;
        self.invalidate_collection(name);
        debug!(collection = name, "collection dropped");
        Ok(true)
    }

    pub fn collection_exists(&self, name: &str) -> Result<bool> {
        let txn = self.inner.pool.take()?;
        let result = self.inner.catalog.collection(&txn, name).map(|r| r.is_some());
        self.inner.pool.give(txn);
        result
    }

    pub fn list_collections(&self) -> Result<Vec<String>> {
        let txn = self.inner.pool.take()?;
        let result = self
            .inner
            .catalog
            .collections(&txn)
            .map(|records| records.into_iter().map(|record| record.name).collect());
        self.inner.pool.give(txn);
        result
    }

    /// Number of documents matching `filter`; `None` or an empty filter is
    /// answered in O(1) from the primary tree statistic.
    pub fn count(&self, name: &str, filter: Option<&Document>) -> Result<u64> {
        let txn = self.inner.pool.take()?;
        let result = self.count_with(&txn, name, filter);
        self.inner.pool.give(txn);
        result
    }

    pub fn count_with(&self, txn: &RoTxn, name: &str, filter: Option<&Document>) -> Result<u64> {
        let col = match self.resolve_ro(txn, name)? {
            Some(col) => col,
            None => return Ok(0),
        };
        match filter {
            None => col.count(txn),
            Some(filter) if filter.is_empty() => col.count(txn),
            Some(filter) => {
                let matches = self.collect_matches(txn, &col, filter, None)?;
                Ok(matches.len() as u64)
            }
        }
    }

    pub fn collection_metadata(&self, name: &str) -> Result<Option<Document>> {
        let txn = self.inner.pool.take()?;
        let result = self
            .inner
            .catalog
            .collection(&txn, name)
            .map(|record| record.and_then(|record| record.config.metadata));
        self.inner.pool.give(txn);
        result
    }

    pub fn set_collection_metadata(&self, name: &str, metadata: Document) -> Result<()> {
        let _guard = self.inner.write_lock.lock().unwrap();
        let mut wtxn = self.inner.env.write_txn()?;
        let mut record = self
            .inner
            .catalog
            .collection(&wtxn, name)?
            .ok_or_else(|| UserError::CollectionNotFound(name.to_string()))?;
        record.config.metadata = Some(metadata);
        record.updated_at = OffsetDateTime::now_utc();
        self.inner.catalog.put_collection(&mut wtxn, &record)?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn db_metadata(&self) -> Result<Option<Document>> {
        let txn = self.inner.pool.take()?;
        let result = self.inner.catalog.db_metadata(&txn);
        self.inner.pool.give(txn);
        result
    }

    pub fn set_db_metadata(&self, metadata: Document) -> Result<()> {
        let _guard = self.inner.write_lock.lock().unwrap();
        let mut wtxn = self.inner.env.write_txn()?;
        self.inner.catalog.put_db_metadata(&mut wtxn, &metadata)?;
        wtxn.commit()?;
        Ok(())
    }

    /* index management */

    /// Declares an index over `keys` (`{"field": 1 | -1, …}`), creating and
    /// populating its sub-tree atomically under one write transaction.
    /// Returns `false` when an index of that name already exists.
    pub fn create_index(
        &self,
        collection: &str,
        keys: &Document,
        name: Option<&str>,
        config: IndexConfig,
    ) -> Result<bool> {
        let parsed_keys = parse_index_keys(keys)?;
        let index_name = match name {
            Some(name) => name.to_string(),
            None => IndexRecord::default_name(&parsed_keys),
        };

        let _guard = self.inner.write_lock.lock().unwrap();
        let mut wtxn = self.inner.env.write_txn()?;
        if self.inner.catalog.index(&wtxn, collection, &index_name)?.is_some() {
            return Ok(false);
        }
        let col = self.resolve_in(&mut wtxn, collection, true)?;
        let record = IndexRecord {
            name: index_name.clone(),
            collection: collection.to_string(),
            keys: parsed_keys,
            config,
            created_at: OffsetDateTime::now_utc(),
        };

        let tree_name = index_tree_name(collection, &index_name);
        let mut options = self.inner.env.tree_options().name(&tree_name);
        if !record.config.unique {
            options = options.flags(terrier::TreeFlags::MULTI_VALUE);
        }
        let tree = options.create(&mut wtxn)?;
        let extractor =
            Box::new(FieldPathExtractor::from_record(&record, self.inner.matcher.clone()));
        let index = SecondaryIndex { record: record.clone(), tree, extractor };
        col.tree.populate_index(&mut wtxn, &index)?;
        self.inner.catalog.put_index(&mut wtxn, &record)?;
        wtxn.commit()?;
        self.invalidate_collection(collection);
        debug!(collection, index = index_name.as_str(), "index created and populated");
        Ok(true)
    }

    /// Deletes the index sub-tree and its catalog row. Returns whether the
    /// index existed.
    pub fn drop_index(&self, collection: &str, name: &str) -> Result<bool> {
        let _guard = self.inner.write_lock.lock().unwrap();
        let mut wtxn = self.inner.env.write_txn()?;
        if self.inner.catalog.index(&wtxn, collection, name)?.is_none() {
            return Ok(false);
        }
        let tree_name = index_tree_name(collection, name);
        if let Some(tree) = self.inner.env.tree_options().name(&tree_name).open(&wtxn)? {
            tree.destroy(&mut wtxn)?;
        }
        self.inner.catalog.delete_index(&mut wtxn, collection, name)?;
        wtxn.commit()?;
        self.invalidate_collection(collection);
        debug!(collection, index = name, "index dropped");
        Ok(true)
    }

    pub fn list_indexes(&self, collection: &str) -> Result<Vec<IndexRecord>> {
        let txn = self.inner.pool.take()?;
        let result = self.inner.catalog.indexes(&txn, collection);
        self.inner.pool.give(txn);
        result
    }

    /* document writes */

    /// Inserts one document, assigning a fresh object identifier when `_id`
    /// is absent. Returns the `_id`.
    pub fn insert_one(&self, collection: &str, doc: Document) -> Result<Bson> {
        let _guard = self.inner.write_lock.lock().unwrap();
        let mut wtxn = self.inner.env.write_txn()?;
        let (id, primary_key) = self.insert_one_in(&mut wtxn, collection, doc)?;
        wtxn.commit()?;
        self.invalidate_key(collection, &primary_key);
        Ok(id)
    }

    /// The caller-transaction form of [`Database::insert_one`]; also returns
    /// the encoded primary key.
    pub fn insert_one_in(
        &self,
        wtxn: &mut RwTxn<'_>,
        collection: &str,
        doc: Document,
    ) -> Result<(Bson, Vec<u8>)> {
        let col = self.resolve_in(wtxn, collection, true)?;
        if col.has_expiring_indexes() {
            col.purge_expired_in(wtxn, bson::DateTime::now())?;
        }
        col.insert_in(wtxn, doc)
    }

    /// Inserts a batch under one transaction: all documents commit or none.
    pub fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<Vec<Bson>> {
        let _guard = self.inner.write_lock.lock().unwrap();
        let mut wtxn = self.inner.env.write_txn()?;
        let ids = self.insert_many_in(&mut wtxn, collection, docs)?;
        wtxn.commit()?;
        self.invalidate_collection(collection);
        Ok(ids)
    }

    pub fn insert_many_in(
        &self,
        wtxn: &mut RwTxn<'_>,
        collection: &str,
        docs: Vec<Document>,
    ) -> Result<Vec<Bson>> {
        let col = self.resolve_in(wtxn, collection, true)?;
        if col.has_expiring_indexes() {
            col.purge_expired_in(wtxn, bson::DateTime::now())?;
        }
        let mut ids = Vec::with_capacity(docs.len());
        for doc in docs {
            let (id, _) = col.insert_in(wtxn, doc)?;
            ids.push(id);
        }
        Ok(ids)
    }

    pub fn update_one(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> Result<UpdateSummary> {
        self.update(collection, filter, update, false, upsert)
    }

    pub fn update_many(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> Result<UpdateSummary> {
        self.update(collection, filter, update, true, upsert)
    }

    /// Replaces the first matching document with `replacement` (which must
    /// keep or omit `_id`).
    pub fn replace_one(
        &self,
        collection: &str,
        filter: &Document,
        replacement: &Document,
        upsert: bool,
    ) -> Result<UpdateSummary> {
        if replacement.keys().any(|key| key.starts_with('$')) {
            return Err(UserError::InvalidArgument(
                "replacement documents cannot contain update operators".into(),
            )
            .into());
        }
        self.update(collection, filter, replacement, false, upsert)
    }

    fn update(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
        multi: bool,
        upsert: bool,
    ) -> Result<UpdateSummary> {
        let _guard = self.inner.write_lock.lock().unwrap();
        let mut wtxn = self.inner.env.write_txn()?;
        let summary = self.update_in(&mut wtxn, collection, filter, update, multi, upsert)?;
        wtxn.commit()?;
        self.invalidate_collection(collection);
        Ok(summary)
    }

    pub fn update_one_in(
        &self,
        wtxn: &mut RwTxn<'_>,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> Result<UpdateSummary> {
        let summary = self.update_in(wtxn, collection, filter, update, false, upsert)?;
        self.invalidate_collection(collection);
        Ok(summary)
    }

    pub fn update_many_in(
        &self,
        wtxn: &mut RwTxn<'_>,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> Result<UpdateSummary> {
        let summary = self.update_in(wtxn, collection, filter, update, true, upsert)?;
        self.invalidate_collection(collection);
        Ok(summary)
    }

    fn update_in(
        &self,
        wtxn: &mut RwTxn<'_>,
        collection: &str,
        filter: &Document,
        update: &Document,
        multi: bool,
        upsert: bool,
    ) -> Result<UpdateSummary> {
        let col = match self.resolve_in(wtxn, collection, upsert) {
            Ok(col) => col,
            // Updating a collection that does not exist matches nothing.
            Err(crate::Error::UserError(UserError::CollectionNotFound(_))) => {
                return Ok(UpdateSummary::default())
            }
            Err(e) => return Err(e),
        };
        if col.has_expiring_indexes() {
            col.purge_expired_in(wtxn, bson::DateTime::now())?;
        }
        let limit = if multi { None } else { Some(1) };
        let matches = self.collect_matches(wtxn, &col, filter, limit)?;

        if matches.is_empty() {
            if !upsert {
                return Ok(UpdateSummary::default());
            }
            let base = self.inner.updater.build_upsert(filter, update)?;
            let (id, _) = col.insert_in(wtxn, base)?;
            return Ok(UpdateSummary { matched: 0, modified: 0, upserted_id: Some(id) });
        }

        let mut summary = UpdateSummary { matched: matches.len() as u64, ..Default::default() };
        for (primary_key, old_doc) in matches {
            let new_doc = self.inner.updater.apply(update, &old_doc)?;
            if new_doc == old_doc {
                continue;
            }
            col.update_in(wtxn, &primary_key, &new_doc)?;
            summary.modified += 1;
        }
        Ok(summary)
    }

    /// Atomically finds one document and updates or removes it, returning
    /// the pre-image (or the post-image with `return_new`).
    pub fn find_and_modify(
        &self,
        collection: &str,
        filter: &Document,
        action: ModifyAction,
        return_new: bool,
        upsert: bool,
    ) -> Result<Option<Document>> {
        let _guard = self.inner.write_lock.lock().unwrap();
        let mut wtxn = self.inner.env.write_txn()?;
        let upsert = upsert && matches!(action, ModifyAction::Update(_));
        let col = match self.resolve_in(&mut wtxn, collection, upsert) {
            Ok(col) => col,
            Err(crate::Error::UserError(UserError::CollectionNotFound(_))) => return Ok(None),
            Err(e) => return Err(e),
        };
        let matches = self.collect_matches(&wtxn, &col, filter, Some(1))?;

        let result = match (matches.into_iter().next(), action) {
            (None, ModifyAction::Update(update)) if upsert => {
                let base = self.inner.updater.build_upsert(filter, &update)?;
                let (_, primary_key) = col.insert_in(&mut wtxn, base)?;
                let inserted = col.tree.fetch(&wtxn, &primary_key)?;
                return_new.then_some(inserted)
            }
            (None, _) => None,
            (Some((primary_key, old_doc)), ModifyAction::Update(update)) => {
                let new_doc = self.inner.updater.apply(&update, &old_doc)?;
                if new_doc != old_doc {
                    col.update_in(&mut wtxn, &primary_key, &new_doc)?;
                }
                Some(if return_new { new_doc } else { old_doc })
            }
            (Some((primary_key, old_doc)), ModifyAction::Remove) => {
                col.delete_in(&mut wtxn, &primary_key)?;
                (!return_new).then_some(old_doc)
            }
        };
        wtxn.commit()?;
        self.invalidate_collection(collection);
        Ok(result)
    }

    pub fn delete_one(&self, collection: &str, filter: &Document) -> Result<bool> {
        let _guard = self.inner.write_lock.lock().unwrap();
        let mut wtxn = self.inner.env.write_txn()?;
        let deleted = self.delete_in(&mut wtxn, collection, filter, Some(1))?;
        wtxn.commit()?;
        self.invalidate_collection(collection);
        Ok(deleted > 0)
    }

    pub fn delete_many(&self, collection: &str, filter: &Document) -> Result<u64> {
        let _guard = self.inner.write_lock.lock().unwrap();
        let mut wtxn = self.inner.env.write_txn()?;
        let deleted = self.delete_in(&mut wtxn, collection, filter, None)?;
        wtxn.commit()?;
        self.invalidate_collection(collection);
        Ok(deleted)
    }

    pub fn delete_one_in(
        &self,
        wtxn: &mut RwTxn<'_>,
        collection: &str,
        filter: &Document,
    ) -> Result<bool> {
        let deleted = self.delete_in(wtxn, collection, filter, Some(1))?;
        self.invalidate_collection(collection);
        Ok(deleted > 0)
    }

    pub fn delete_many_in(
        &self,
        wtxn: &mut RwTxn<'_>,
        collection: &str,
        filter: &Document,
    ) -> Result<u64> {
        let deleted = self.delete_in(wtxn, collection, filter, None)?;
        self.invalidate_collection(collection);
        Ok(deleted)
    }

    fn delete_in(
        &self,
        wtxn: &mut RwTxn<'_>,
        collection: &str,
        filter: &Document,
        limit: Option<usize>,
    ) -> Result<u64> {
        let col = match self.resolve_ro(wtxn, collection)? {
            Some(col) => col,
            None => return Ok(0),
        };
        let matches = self.collect_matches(wtxn, &col, filter, limit)?;
        let mut deleted = 0;
        for (primary_key, _) in matches {
            if col.delete_in(wtxn, &primary_key)? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Removes documents whose TTL-indexed datetimes have expired.
    pub fn purge_expired(&self, collection: &str) -> Result<u64> {
        let _guard = self.inner.write_lock.lock().unwrap();
        let mut wtxn = self.inner.env.write_txn()?;
        let col = match self.resolve_ro(&wtxn, collection)? {
            Some(col) => col,
            None => return Ok(0),
        };
        let purged = col.purge_expired_in(&mut wtxn, bson::DateTime::now())?;
        wtxn.commit()?;
        if purged > 0 {
            self.invalidate_collection(collection);
        }
        Ok(purged)
    }

    /* document reads */

    /// The first matching document, or `None`. Borrows a pooled read
    /// transaction for the duration of the call.
    pub fn find_one(
        &self,
        collection: &str,
        filter: &Document,
        projection: Option<&Document>,
    ) -> Result<Option<Document>> {
        let txn = self.inner.pool.take()?;
        let result = self.find_one_with(&txn, collection, filter, projection);
        self.inner.pool.give(txn);
        result
    }

    /// The caller-snapshot form of [`Database::find_one`]. Cached documents
    /// are served only when they are no newer than the snapshot.
    pub fn find_one_with(
        &self,
        txn: &RoTxn,
        collection: &str,
        filter: &Document,
        projection: Option<&Document>,
    ) -> Result<Option<Document>> {
        let col = match self.resolve_ro(txn, collection)? {
            Some(col) => col,
            None => return Ok(None),
        };
        let doc = match plan_query(filter, &col.index_records())? {
            Plan::IdLookup(id) => {
                let primary_key = key::encode_primary_key(&id)?;
                match self.fetch_cached(txn, &col, &primary_key)? {
                    Some(doc) if self.inner.matcher.matches(filter, &doc)? => Some(doc),
                    _ => None,
                }
            }
            Plan::IndexEq { index, prefix } => {
                self.first_index_match(txn, &col, &index, &prefix, filter)?
            }
            Plan::Scan => {
                let mut found = None;
                let mut cursor = col.tree.primary.ro_cursor(txn)?;
                let mut entry = cursor.move_on_first()?;
                while let Some((_, bytes)) = entry {
                    let doc = codec::decode_document(bytes)?;
                    if self.inner.matcher.matches(filter, &doc)? {
                        found = Some(doc);
                        break;
                    }
                    entry = cursor.move_on_next()?;
                }
                found
            }
        };
        match (doc, projection) {
            (Some(doc), Some(projection)) => {
                Ok(Some(crate::cursor::apply_projection(projection, doc)?))
            }
            (doc, _) => Ok(doc),
        }
    }

    /// A cursor over every matching document. The cursor owns a dedicated
    /// read snapshot until destroyed.
    pub fn find(
        &self,
        collection: &str,
        filter: Document,
        projection: Option<Document>,
    ) -> Result<Cursor> {
        let txn = self.inner.pool.take()?;
        let col = match self.resolve_ro(&txn, collection)? {
            Some(col) => col,
            None => {
                self.inner.pool.give(txn);
                return Cursor::new(
                    SourceSpec::Empty,
                    filter,
                    projection,
                    self.inner.matcher.clone(),
                    self.inner.pool.clone(),
                );
            }
        };
        let spec = match plan_query(&filter, &col.index_records())? {
            Plan::IdLookup(id) => SourceSpec::Point {
                key: key::encode_primary_key(&id)?,
                cur: col.tree.primary.owning_cursor(txn)?,
            },
            Plan::IndexEq { index, prefix } => {
                let index_tree = col
                    .tree
                    .indexes
                    .iter()
                    .find(|candidate| candidate.record.name == index)
                    .map(|candidate| candidate.tree)
                    .ok_or(crate::InternalError::DanglingIndexEntry)?;
                SourceSpec::IndexEq {
                    cur: index_tree.owning_cursor(txn)?,
                    primary: col.tree.primary,
                    prefix,
                }
            }
            Plan::Scan => SourceSpec::Scan { cur: col.tree.primary.owning_cursor(txn)? },
        };
        Cursor::new(spec, filter, projection, self.inner.matcher.clone(), self.inner.pool.clone())
    }

    /// Distinct values of `field` across the matching documents, in first
    /// encounter order.
    pub fn distinct(
        &self,
        collection: &str,
        field: &str,
        filter: &Document,
    ) -> Result<Vec<Bson>> {
        let txn = self.inner.pool.take()?;
        let result = (|| -> Result<Vec<Bson>> {
            let col = match self.resolve_ro(&txn, collection)? {
                Some(col) => col,
                None => return Ok(Vec::new()),
            };
            let matches = self.collect_matches(&txn, &col, filter, None)?;
            let mut seen = HashSet::new();
            let mut values = Vec::new();
            for (_, doc) in matches {
                if let Some(value) = crate::query::matcher::lookup_path(&doc, field) {
                    let fingerprint = key::encode_primary_key(value)
                        .unwrap_or_else(|_| codec::value_to_json(value).into_bytes());
                    if seen.insert(fingerprint) {
                        values.push(value.clone());
                    }
                }
            }
            Ok(values)
        })();
        self.inner.pool.give(txn);
        result
    }

    /* internals */

    /// Resolves a collection under a write transaction, optionally creating
    /// it (the write API auto-creates, like the document model implies).
    fn resolve_in(
        &self,
        wtxn: &mut RwTxn<'_>,
        name: &str,
        auto_create: bool,
    ) -> Result<Collection> {
        match self.inner.catalog.collection(wtxn, name)? {
            Some(record) => {
                let indexes = self.inner.catalog.indexes(wtxn, name)?;
                Collection::create(
                    &self.inner.env,
                    wtxn,
                    record,
                    indexes,
                    self.inner.matcher.clone(),
                )
            }
            None if auto_create => {
                self.create_collection_in(wtxn, name, CollectionConfig::default())?;
                let record = self
                    .inner
                    .catalog
                    .collection(wtxn, name)?
                    .ok_or_else(|| crate::InternalError::CatalogMissingEntry {
                        key: crate::catalog::catalog_key::collection(name),
                    })?;
                Collection::create(
                    &self.inner.env,
                    wtxn,
                    record,
                    vec![],
                    self.inner.matcher.clone(),
                )
            }
            None => Err(UserError::CollectionNotFound(name.to_string()).into()),
        }
    }

    /// Resolves a collection under a read snapshot; `None` when absent.
    fn resolve_ro(&self, txn: &RoTxn, name: &str) -> Result<Option<Collection>> {
        let record = match self.inner.catalog.collection(txn, name)? {
            Some(record) => record,
            None => return Ok(None),
        };
        let indexes = self.inner.catalog.indexes(txn, name)?;
        Collection::open_ro(&self.inner.env, txn, record, indexes, self.inner.matcher.clone())
    }

    /// Runs the planner and collects matching `(primary key, document)`
    /// pairs, up to `limit`. Used by the write paths, which must materialize
    /// their match set before mutating.
    fn collect_matches(
        &self,
        txn: &RoTxn,
        col: &Collection,
        filter: &Document,
        limit: Option<usize>,
    ) -> Result<Vec<(Vec<u8>, Document)>> {
        let mut matches = Vec::new();
        let full = |matches: &Vec<(Vec<u8>, Document)>| {
            limit.is_some_and(|limit| matches.len() >= limit)
        };
        match plan_query(filter, &col.index_records())? {
            Plan::IdLookup(id) => {
                let primary_key = key::encode_primary_key(&id)?;
                if let Some(bytes) = col.tree.primary.get(txn, &primary_key)? {
                    let doc = codec::decode_document(bytes)?;
                    if self.inner.matcher.matches(filter, &doc)? {
                        matches.push((primary_key, doc));
                    }
                }
            }
            Plan::IndexEq { index, prefix } => {
                let index_tree = col
                    .tree
                    .indexes
                    .iter()
                    .find(|candidate| candidate.record.name == index)
                    .map(|candidate| candidate.tree)
                    .ok_or(crate::InternalError::DanglingIndexEntry)?;
                let mut cursor = index_tree.ro_cursor(txn)?;
                let mut entry = cursor.move_on_key_ge(&prefix)?;
                while let Some((entry_key, primary_key)) = entry {
                    if !entry_key.starts_with(&prefix) || full(&matches) {
                        break;
                    }
                    let primary_key = primary_key.to_vec();
                    let bytes = col
                        .tree
                        .primary
                        .get(txn, &primary_key)?
                        .ok_or(crate::InternalError::DanglingIndexEntry)?;
                    let doc = codec::decode_document(bytes)?;
                    if self.inner.matcher.matches(filter, &doc)? {
                        matches.push((primary_key, doc));
                    }
                    entry = cursor.move_on_next()?;
                }
            }
            Plan::Scan => {
                let mut cursor = col.tree.primary.ro_cursor(txn)?;
                let mut entry = cursor.move_on_first()?;
                while let Some((primary_key, bytes)) = entry {
                    if full(&matches) {
                        break;
                    }
                    let doc = codec::decode_document(bytes)?;
                    if self.inner.matcher.matches(filter, &doc)? {
                        matches.push((primary_key.to_vec(), doc));
                    }
                    entry = cursor.move_on_next()?;
                }
            }
        }
        Ok(matches)
    }

    fn first_index_match(
        &self,
        txn: &RoTxn,
        col: &Collection,
        index: &str,
        prefix: &[u8],
        filter: &Document,
    ) -> Result<Option<Document>> {
        let index_tree = col
            .tree
            .indexes
            .iter()
            .find(|candidate| candidate.record.name == index)
            .map(|candidate| candidate.tree)
            .ok_or(crate::InternalError::DanglingIndexEntry)?;
        let mut cursor = index_tree.ro_cursor(txn)?;
        let mut entry = cursor.move_on_key_ge(prefix)?;
        while let Some((entry_key, primary_key)) = entry {
            if !entry_key.starts_with(prefix) {
                break;
            }
            let primary_key = primary_key.to_vec();
            let doc = self
                .fetch_cached(txn, col, &primary_key)?
                .ok_or(crate::InternalError::DanglingIndexEntry)?;
            if self.inner.matcher.matches(filter, &doc)? {
                return Ok(Some(doc));
            }
            entry = cursor.move_on_next()?;
        }
        Ok(None)
    }

    /// The post-index fetch, short-circuited by the document cache.
    fn fetch_cached(
        &self,
        txn: &RoTxn,
        col: &Collection,
        primary_key: &[u8],
    ) -> Result<Option<Document>> {
        if let Some(doc) = self.inner.cache.get(col.name(), primary_key, txn.id()) {
            return Ok(Some(doc));
        }
        match col.tree.primary.get(txn, primary_key)? {
            Some(bytes) => {
                let doc = codec::decode_document(bytes)?;
                self.inner.cache.put(col.name(), primary_key, doc.clone(), bytes.len(), txn.id());
                Ok(Some(doc))
            }
            None => Ok(None),
        }
    }

    fn watermark(&self) -> u64 {
        self.inner.env.info().map(|info| info.last_txn_id + 1).unwrap_or(0)
    }

    fn invalidate_key(&self, collection: &str, primary_key: &[u8]) {
        self.inner.cache.invalidate(collection, primary_key, self.watermark());
    }

    fn invalidate_collection(&self, collection: &str) {
        self.inner.cache.invalidate_collection(collection, self.watermark());
    }
}

fn validate_collection_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.len() > 120
        || name.starts_with("__")
        || name.contains(':')
        || name.contains('\0')
    {
        return Err(UserError::InvalidArgument(format!("invalid collection name `{name}`")).into());
    }
    Ok(())
}

fn parse_index_keys(keys: &Document) -> Result<Vec<(String, i32)>> {
    if keys.is_empty() {
        return Err(UserError::InvalidArgument("index keys cannot be empty".into()).into());
    }
    keys.iter()
        .map(|(field, order)| {
            match order.as_i32().map(i64::from).or_else(|| order.as_i64()) {
                Some(1) => Ok((field.clone(), 1)),
                Some(-1) => Ok((field.clone(), -1)),
                _ => Err(UserError::InvalidArgument(format!(
                    "index order for `{field}` must be 1 or -1"
                ))
                .into()),
            }
        })
        .collect()
}

impl Collection {
    pub(crate) fn index_records(&self) -> Vec<IndexRecord> {
        self.tree.indexes.iter().map(|index| index.record.clone()).collect()
    }
}
