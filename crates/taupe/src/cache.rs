//! A bounded LRU cache of parsed documents keyed by (collection, primary
//! key), short-circuiting the post-index fetch. Strictly an optimization:
//! every write invalidates the touched keys, and multi-document writes drop
//! the whole collection.
//!
//! Entries are only admitted when the reader's snapshot is at least as new
//! as the collection's invalidation watermark, so a reader holding an old
//! snapshot can never re-introduce a document version a later transaction
//! already rewrote.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bson::Document;

type Key = (String, Vec<u8>);

struct Entry {
    doc: Document,
    size: usize,
    seq: u64,
    /// The snapshot the document was read under; readers on older
    /// snapshots must not be served a possibly newer version.
    snapshot_id: u64,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<Key, Entry>,
    /// Access order: lowest sequence number is the least recently used.
    order: BTreeMap<u64, Key>,
    /// Per collection: the transaction id of the last invalidating write.
    watermarks: HashMap<String, u64>,
    bytes: usize,
    tick: u64,
}

pub(crate) struct DocumentCache {
    max_items: usize,
    max_bytes: usize,
    ttl: Duration,
    inner: Mutex<Inner>,
}

impl DocumentCache {
    pub(crate) fn new(max_items: usize, max_bytes: usize, ttl: Duration) -> DocumentCache {
        DocumentCache { max_items, max_bytes, ttl, inner: Mutex::new(Inner::default()) }
    }

    fn enabled(&self) -> bool {
        self.max_items > 0 && self.max_bytes > 0
    }

    /// Serves the cached document, provided it is visible to a reader on
    /// `reader_snapshot_id`: the entry must not be newer than the snapshot.
    pub(crate) fn get(
        &self,
        collection: &str,
        primary_key: &[u8],
        reader_snapshot_id: u64,
    ) -> Option<Document> {
        if !self.enabled() {
            return None;
        }
        let mut inner = self.inner.lock().unwrap();
        let key = (collection.to_string(), primary_key.to_vec());
        let expired = match inner.entries.get(&key) {
            Some(entry) if entry.snapshot_id > reader_snapshot_id => return None,
            Some(entry) => entry.expires_at <= Instant::now(),
            None => return None,
        };
        if expired {
            remove(&mut inner, &key);
            return None;
        }
        inner.tick += 1;
        let tick = inner.tick;
        let entry = inner.entries.get_mut(&key).expect("entry present");
        let old_seq = std::mem::replace(&mut entry.seq, tick);
        let doc = entry.doc.clone();
        inner.order.remove(&old_seq);
        inner.order.insert(tick, key);
        Some(doc)
    }

    /// Admits a document read under `snapshot_id`. Rejected when a write
    /// newer than the snapshot already invalidated the collection.
    pub(crate) fn put(
        &self,
        collection: &str,
        primary_key: &[u8],
        doc: Document,
        size: usize,
        snapshot_id: u64,
    ) {
        if !self.enabled() || size > self.max_bytes {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.watermarks.get(collection).is_some_and(|mark| snapshot_id < *mark) {
            return;
        }
        let key = (collection.to_string(), primary_key.to_vec());
        remove(&mut inner, &key);

        inner.tick += 1;
        let seq = inner.tick;
        inner.bytes += size;
        inner.order.insert(seq, key.clone());
        inner.entries.insert(
            key,
            Entry { doc, size, seq, snapshot_id, expires_at: Instant::now() + self.ttl },
        );

        while inner.entries.len() > self.max_items || inner.bytes > self.max_bytes {
            let victim = match inner.order.iter().next() {
                Some((_, key)) => key.clone(),
                None => break,
            };
            remove(&mut inner, &victim);
        }
    }

    /// Drops one key; `watermark` is the invalidating transaction's id.
    pub(crate) fn invalidate(&self, collection: &str, primary_key: &[u8], watermark: u64) {
        if !self.enabled() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        raise_watermark(&mut inner, collection, watermark);
        let key = (collection.to_string(), primary_key.to_vec());
        remove(&mut inner, &key);
    }

    /// Drops every key of one collection; used by multi-document writes,
    /// drops, and index edits.
    pub(crate) fn invalidate_collection(&self, collection: &str, watermark: u64) {
        if !self.enabled() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        raise_watermark(&mut inner, collection, watermark);
        let victims: Vec<Key> = inner
            .entries
            .keys()
            .filter(|(owner, _)| owner == collection)
            .cloned()
            .collect();
        for key in victims {
            remove(&mut inner, &key);
        }
    }
}

fn raise_watermark(inner: &mut Inner, collection: &str, watermark: u64) {
    let mark = inner.watermarks.entry(collection.to_string()).or_insert(0);
    *mark = (*mark).max(watermark);
}

fn remove(inner: &mut Inner, key: &Key) {
    if let Some(entry) = inner.entries.remove(key) {
        inner.order.remove(&entry.seq);
        inner.bytes -= entry.size;
    }
}
