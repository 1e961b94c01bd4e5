//! The client-visible query cursor: `Fresh → Running → Exhausted`, with
//! limit/skip/sort configurable only while fresh. The cursor owns a read
//! snapshot (through an owning page-store cursor) until it is destroyed;
//! destroy returns the snapshot to the database's transaction pool.

use std::sync::Arc;

use bson::{Bson, Document};
use terrier::{OwningCursor, Tree};

use crate::codec;
use crate::error::UserError;
use crate::key;
use crate::query::Matcher;
use crate::txn_pool::TxnPool;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Fresh,
    Running,
    Exhausted,
}

enum Source {
    /// One point lookup on the primary tree.
    Point { cur: OwningCursor, key: Vec<u8>, done: bool },
    /// Walk the whole primary tree.
    Scan { cur: OwningCursor, started: bool },
    /// Walk the index entries whose key starts with `prefix`, fetching each
    /// referenced document from the primary tree under the same snapshot.
    IndexEq { cur: OwningCursor, primary: Tree, prefix: Vec<u8>, started: bool },
    /// Sorted results, already materialized; the snapshot has been released.
    Buffered(std::vec::IntoIter<Document>),
    /// No source at all: a query on a collection that does not exist.
    Empty,
}

pub struct Cursor {
    state: State,
    source: Source,
    filter: Document,
    projection: Option<Projection>,
    matcher: Arc<dyn Matcher>,
    pool: Arc<TxnPool>,
    limit: u64,
    skip: u64,
    sort: Option<Document>,
    skipped: u64,
    position: u64,
    returned: u64,
    pending: Option<Document>,
}

impl Cursor {
    pub(crate) fn new(
        source_for: SourceSpec,
        filter: Document,
        projection: Option<Document>,
        matcher: Arc<dyn Matcher>,
        pool: Arc<TxnPool>,
    ) -> Result<Cursor> {
        let projection = projection.map(Projection::compile).transpose()?;
        let source = match source_for {
            SourceSpec::Point { cur, key } => Source::Point { cur, key, done: false },
            SourceSpec::Scan { cur } => Source::Scan { cur, started: false },
            SourceSpec::IndexEq { cur, primary, prefix } => {
                Source::IndexEq { cur, primary, prefix, started: false }
            }
            SourceSpec::Empty => Source::Empty,
        };
        Ok(Cursor {
            state: State::Fresh,
            source,
            filter,
            projection,
            matcher,
            pool,
            limit: 0,
            skip: 0,
            sort: None,
            skipped: 0,
            position: 0,
            returned: 0,
            pending: None,
        })
    }

    /// Caps the number of returned documents; zero means unbounded.
    /// Valid only before the first `next`.
    pub fn set_limit(&mut self, limit: u64) -> Result<()> {
        self.ensure_fresh("set_limit")?;
        self.limit = limit;
        Ok(())
    }

    /// Skips the first `skip` matching documents. Valid only before the
    /// first `next`.
    pub fn set_skip(&mut self, skip: u64) -> Result<()> {
        self.ensure_fresh("set_skip")?;
        self.skip = skip;
        Ok(())
    }

    /// Orders results by the given sort document (`1` ascending, `-1`
    /// descending per field). Forces the cursor to buffer every match on
    /// first use. Valid only before the first `next`.
    pub fn set_sort(&mut self, sort: Document) -> Result<()> {
        self.ensure_fresh("set_sort")?;
        for (field, order) in &sort {
            match order.as_i32().map(i64::from).or_else(|| order.as_i64()) {
                Some(1) | Some(-1) => {}
                _ => {
                    return Err(UserError::InvalidArgument(format!(
                        "sort order for `{field}` must be 1 or -1"
                    ))
                    .into())
                }
            }
        }
        self.sort = Some(sort);
        Ok(())
    }

    fn ensure_fresh(&self, what: &str) -> Result<()> {
        if self.state != State::Fresh {
            return Err(UserError::InvalidState(format!(
                "{what} is only valid before iteration starts"
            ))
            .into());
        }
        Ok(())
    }

    /// Documents matched so far (before skip/limit accounting).
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Documents returned so far.
    pub fn returned(&self) -> u64 {
        self.returned
    }

    pub fn is_exhausted(&self) -> bool {
        self.state == State::Exhausted
    }

    /// The next matching document, or `None` once exhausted. The first call
    /// leaves the fresh state; an exhausted cursor yields `None` forever.
    pub fn next_document(&mut self) -> Result<Option<Document>> {
        if self.state == State::Exhausted {
            return Ok(None);
        }
        self.state = State::Running;
        if let Some(doc) = self.pending.take() {
            return Ok(Some(doc));
        }
        self.advance()
    }

    /// Whether another document is available, prefetching it if needed.
    pub fn more(&mut self) -> Result<bool> {
        if self.pending.is_some() {
            return Ok(true);
        }
        if self.state == State::Exhausted {
            return Ok(false);
        }
        self.state = State::Running;
        self.pending = self.advance()?;
        Ok(self.pending.is_some())
    }

    /// Destroys the cursor, releasing its snapshot back to the pool. Drop
    /// does the same; this form just makes the intent explicit.
    pub fn destroy(self) {}

    fn advance(&mut self) -> Result<Option<Document>> {
        if self.sort.is_some() && !matches!(self.source, Source::Buffered(_) | Source::Empty) {
            self.buffer_sorted()?;
        }
        loop {
            if self.limit > 0 && self.returned >= self.limit {
                self.exhaust();
                return Ok(None);
            }
            let candidate = match self.next_candidate()? {
                Some(candidate) => candidate,
                None => {
                    self.exhaust();
                    return Ok(None);
                }
            };
            if !self.matcher.matches(&self.filter, &candidate)? {
                continue;
            }
            self.position += 1;
            if self.skipped < self.skip {
                self.skipped += 1;
                continue;
            }
            self.returned += 1;
            let projected = match &self.projection {
                Some(projection) => projection.apply(candidate),
                None => candidate,
            };
            return Ok(Some(projected));
        }
    }

    /// Pulls every match into memory, sorts it, and swaps the source for
    /// the buffer. The snapshot is released immediately: the buffer owns
    /// plain documents.
    fn buffer_sorted(&mut self) -> Result<()> {
        let sort = self.sort.clone().expect("buffer_sorted requires a sort document");
        let mut matches = Vec::new();
        loop {
            let candidate = match self.next_candidate()? {
                Some(candidate) => candidate,
                None => break,
            };
            if self.matcher.matches(&self.filter, &candidate)? {
                matches.push(candidate);
            }
        }
        matches.sort_by(|a, b| {
            for (field, order) in &sort {
                let av = crate::query::matcher::lookup_path(a, field);
                let bv = crate::query::matcher::lookup_path(b, field);
                let ordering = match (av, bv) {
                    (Some(av), Some(bv)) => key::canonical_cmp(av, bv),
                    (None, Some(_)) => std::cmp::Ordering::Less,
                    (Some(_), None) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                };
                let descending = matches!(order.as_i32(), Some(-1)) || matches!(order.as_i64(), Some(-1));
                let ordering = if descending { ordering.reverse() } else { ordering };
                if ordering != std::cmp::Ordering::Equal {
                    return ordering;
                }
            }
            std::cmp::Ordering::Equal
        });
        self.recycle();
        self.source = Source::Buffered(matches.into_iter());
        Ok(())
    }

    fn next_candidate(&mut self) -> Result<Option<Document>> {
        match &mut self.source {
            Source::Empty => Ok(None),
            Source::Buffered(docs) => Ok(docs.next()),
            Source::Point { cur, key, done } => {
                if *done {
                    return Ok(None);
                }
                *done = true;
                match cur.move_on_key(key)? {
                    Some((_, bytes)) => Ok(Some(codec::decode_document(bytes)?)),
                    None => Ok(None),
                }
            }
            Source::Scan { cur, started } => {
                let entry = if *started { cur.move_on_next()? } else { cur.move_on_first()? };
                *started = true;
                match entry {
                    Some((_, bytes)) => Ok(Some(codec::decode_document(bytes)?)),
                    None => Ok(None),
                }
            }
            Source::IndexEq { cur, primary, prefix, started } => {
                let primary_key = {
                    let entry =
                        if *started { cur.move_on_next()? } else { cur.move_on_key_ge(prefix)? };
                    *started = true;
                    match entry {
                        Some((entry_key, primary_key)) if entry_key.starts_with(prefix) => {
                            Some(primary_key.to_vec())
                        }
                        _ => None,
                    }
                };
                match primary_key {
                    Some(primary_key) => match primary.get(cur.txn(), &primary_key)? {
                        Some(bytes) => Ok(Some(codec::decode_document(bytes)?)),
                        None => Err(crate::InternalError::DanglingIndexEntry.into()),
                    },
                    None => Ok(None),
                }
            }
        }
    }

    fn exhaust(&mut self) {
        self.state = State::Exhausted;
        self.recycle();
    }

    /// Hands the snapshot back to the pool and drops any buffered state.
    fn recycle(&mut self) {
        match std::mem::replace(&mut self.source, Source::Empty) {
            Source::Point { cur, .. } | Source::Scan { cur, .. } | Source::IndexEq { cur, .. } => {
                self.pool.give(cur.into_txn());
            }
            Source::Buffered(_) | Source::Empty => {}
        }
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.recycle();
    }
}

/// Applies a projection document outside a cursor (point reads).
pub(crate) fn apply_projection(spec: &Document, doc: Document) -> Result<Document> {
    Ok(Projection::compile(spec.clone())?.apply(doc))
}

pub(crate) enum SourceSpec {
    Point { cur: OwningCursor, key: Vec<u8> },
    Scan { cur: OwningCursor },
    IndexEq { cur: OwningCursor, primary: Tree, prefix: Vec<u8> },
    Empty,
}

/// A compiled projection: either an inclusion or an exclusion of top-level
/// fields. `_id` is kept by inclusions unless excluded explicitly.
struct Projection {
    include: bool,
    fields: Vec<String>,
    keep_id: bool,
}

impl Projection {
    fn compile(spec: Document) -> Result<Projection> {
        let mut include = None;
        let mut fields = Vec::new();
        let mut keep_id = true;
        for (field, flag) in &spec {
            let keep = match flag.as_i64().or_else(|| flag.as_i32().map(i64::from)) {
                Some(0) => false,
                Some(_) => true,
                None => matches!(flag, Bson::Boolean(true)),
            };
            if field == "_id" {
                keep_id = keep;
                continue;
            }
            match include {
                None => include = Some(keep),
                Some(mode) if mode != keep => {
                    return Err(UserError::InvalidArgument(
                        "projections cannot mix inclusion and exclusion".into(),
                    )
                    .into())
                }
                Some(_) => {}
            }
            fields.push(field.clone());
        }
        Ok(Projection { include: include.unwrap_or(false), fields, keep_id })
    }

    fn apply(&self, doc: Document) -> Document {
        let mut out = Document::new();
        for (field, value) in doc {
            let keep = if field == "_id" {
                self.keep_id
            } else if self.include {
                self.fields.contains(&field)
            } else {
                !self.fields.contains(&field)
            };
            if keep {
                out.insert(field, value);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;

    #[test]
    fn projection_inclusion_keeps_id_by_default() {
        let projection = Projection::compile(doc! { "name": 1 }).unwrap();
        let out = projection.apply(doc! { "_id": 1, "name": "a", "age": 3 });
        assert_eq!(out, doc! { "_id": 1, "name": "a" });
    }

    #[test]
    fn projection_exclusion_and_id_suppression() {
        let projection = Projection::compile(doc! { "age": 0, "_id": 0 }).unwrap();
        let out = projection.apply(doc! { "_id": 1, "name": "a", "age": 3 });
        assert_eq!(out, doc! { "name": "a" });
    }

    #[test]
    fn mixed_projection_is_rejected() {
        assert!(Projection::compile(doc! { "a": 1, "b": 0 }).is_err());
    }
}
