//! The `__catalog__` sub-tree: one record per collection, one per index,
//! plus the database-wide user metadata blob. Records are serde-JSON values
//! keyed `col:<name>` / `idx:<collection>:<index>` / `db:metadata`.

use bson::Document;
use serde::{Deserialize, Serialize};
use terrier::{RoTxn, RwTxn, Tree};
use time::OffsetDateTime;

use crate::error::InternalError;
use crate::Result;

pub(crate) const CATALOG_TREE_NAME: &str = "__catalog__";

pub(crate) mod catalog_key {
    pub const DB_METADATA: &str = "db:metadata";
    pub const COLLECTION_PREFIX: &str = "col:";

    pub fn collection(name: &str) -> String {
        format!("{COLLECTION_PREFIX}{name}")
    }

    pub fn index(collection: &str, index: &str) -> String {
        format!("idx:{collection}:{index}")
    }

    pub fn index_prefix(collection: &str) -> String {
        format!("idx:{collection}:")
    }
}

/// Declared options of a collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Evict oldest documents once past `max_docs`/`max_bytes`.
    #[serde(default)]
    pub capped: bool,
    #[serde(default)]
    pub max_docs: Option<u64>,
    #[serde(default)]
    pub max_bytes: Option<u64>,
    /// A filter document every stored document must satisfy.
    #[serde(default)]
    pub validator: Option<Document>,
    /// Opaque user blob.
    #[serde(default)]
    pub metadata: Option<Document>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionRecord {
    pub name: String,
    #[serde(default)]
    pub config: CollectionConfig,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Declared options of a secondary index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default)]
    pub unique: bool,
    /// Skip documents in which every indexed field is absent.
    #[serde(default)]
    pub sparse: bool,
    /// Reserved; index builds are always foreground.
    #[serde(default)]
    pub background: bool,
    /// Entries whose single ascending datetime key is older than this many
    /// seconds are eligible for expiry sweeps.
    #[serde(default)]
    pub expire_after_seconds: Option<u64>,
    /// Only documents matching this filter are indexed.
    #[serde(default)]
    pub partial_filter: Option<Document>,
    /// Opaque user blob.
    #[serde(default)]
    pub metadata: Option<Document>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexRecord {
    pub name: String,
    pub collection: String,
    /// Field paths with their sort order, `1` ascending, `-1` descending.
    pub keys: Vec<(String, i32)>,
    #[serde(default)]
    pub config: IndexConfig,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl IndexRecord {
    /// The conventional auto-generated name, `field_1` / `field_-1` joined
    /// with underscores.
    pub fn default_name(keys: &[(String, i32)]) -> String {
        keys.iter()
            .map(|(field, order)| format!("{field}_{order}"))
            .collect::<Vec<_>>()
            .join("_")
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Catalog {
    pub(crate) tree: Tree,
}

impl Catalog {
    pub(crate) fn create(env: &terrier::Env, wtxn: &mut RwTxn<'_>) -> Result<Catalog> {
        let tree = env.tree_options().name(CATALOG_TREE_NAME).create(wtxn)?;
        Ok(Catalog { tree })
    }

    fn get<T: for<'de> Deserialize<'de>>(&self, txn: &RoTxn, key: &str) -> Result<Option<T>> {
        match self.tree.get(txn, key.as_bytes())? {
            Some(bytes) => {
                let record = serde_json::from_slice(bytes).map_err(InternalError::from)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn put<T: Serialize>(&self, wtxn: &mut RwTxn<'_>, key: &str, record: &T) -> Result<()> {
        let bytes = serde_json::to_vec(record).map_err(InternalError::from)?;
        self.tree.put(wtxn, key.as_bytes(), &bytes)?;
        Ok(())
    }

    fn list_prefix<T: for<'de> Deserialize<'de>>(
        &self,
        txn: &RoTxn,
        prefix: &str,
    ) -> Result<Vec<T>> {
        let mut records = Vec::new();
        let mut cursor = self.tree.ro_cursor(txn)?;
        let mut entry = cursor.move_on_key_ge(prefix.as_bytes())?;
        while let Some((key, value)) = entry {
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            records.push(serde_json::from_slice(value).map_err(InternalError::from)?);
            entry = cursor.move_on_next()?;
        }
        Ok(records)
    }

    pub(crate) fn collection(&self, txn: &RoTxn, name: &str) -> Result<Option<CollectionRecord>> {
        self.get(txn, &catalog_key::collection(name))
    }

    pub(crate) fn put_collection(
        &self,
        wtxn: &mut RwTxn<'_>,
        record: &CollectionRecord,
    ) -> Result<()> {
        self.put(wtxn, &catalog_key::collection(&record.name), record)
    }

    pub(crate) fn delete_collection(&self, wtxn: &mut RwTxn<'_>, name: &str) -> Result<bool> {
        Ok(self.tree.delete(wtxn, catalog_key::collection(name).as_bytes())?)
    }

    pub(crate) fn collections(&self, txn: &RoTxn) -> Result<Vec<CollectionRecord>> {
        self.list_prefix(txn, catalog_key::COLLECTION_PREFIX)
    }

    pub(crate) fn index(
        &self,
        txn: &RoTxn,
        collection: &str,
        name: &str,
    ) -> Result<Option<IndexRecord>> {
        self.get(txn, &catalog_key::index(collection, name))
    }

    pub(crate) fn put_index(&self, wtxn: &mut RwTxn<'_>, record: &IndexRecord) -> Result<()> {
        self.put(wtxn, &catalog_key::index(&record.collection, &record.name), record)
    }

    pub(crate) fn delete_index(
        &self,
        wtxn: &mut RwTxn<'_>,
        collection: &str,
        name: &str,
    ) -> Result<bool> {
        Ok(self.tree.delete(wtxn, catalog_key::index(collection, name).as_bytes())?)
    }

    /// Index records of one collection, in creation order: records carry
    /// their creation stamp, and listings sort by it so planner tie-breaks
    /// follow declaration order.
    pub(crate) fn indexes(&self, txn: &RoTxn, collection: &str) -> Result<Vec<IndexRecord>> {
        let mut records: Vec<IndexRecord> =
            self.list_prefix(txn, &catalog_key::index_prefix(collection))?;
        records.sort_by_key(|record| record.created_at);
        Ok(records)
    }

    pub(crate) fn db_metadata(&self, txn: &RoTxn) -> Result<Option<Document>> {
        self.get(txn, catalog_key::DB_METADATA)
    }

    pub(crate) fn put_db_metadata(
        &self,
        wtxn: &mut RwTxn<'_>,
        metadata: &Document,
    ) -> Result<()> {
        self.put(wtxn, catalog_key::DB_METADATA, metadata)
    }
}
