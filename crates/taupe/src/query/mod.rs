//! Query planning: given a filter document and the collection's index set,
//! choose the ID fast path, an index-assisted path, or a filtered scan.
//! Deterministic given (filter, index set); ties break toward unique
//! indexes, then catalog declaration order.

pub mod matcher;
pub mod update;

use bson::{Bson, Document};

pub use self::matcher::{DefaultMatcher, Matcher};
pub use self::update::{DefaultUpdateDriver, UpdateDriver};
use self::matcher::is_operator_document;
use crate::catalog::IndexRecord;
use crate::key;
use crate::Result;

/// The access path chosen for one query.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Plan {
    /// `{_id: <literal>}`: one primary-tree point lookup.
    IdLookup(Bson),
    /// Equality on the first declared field of `index`: iterate the index
    /// entries whose key starts with `prefix`, re-checking the full filter
    /// on each fetched document.
    IndexEq { index: String, prefix: Vec<u8> },
    /// Walk the primary tree, evaluating the filter on every document.
    Scan,
}

/// The single equality constraint a field carries, if any: a top-level
/// literal or an explicit `$eq`.
fn equality_constraint<'f>(condition: &'f Bson) -> Option<&'f Bson> {
    if is_operator_document(condition) {
        match condition {
            Bson::Document(operators) if operators.len() == 1 => operators.get("$eq"),
            _ => None,
        }
    } else {
        Some(condition)
    }
}

pub(crate) fn plan_query(filter: &Document, indexes: &[IndexRecord]) -> Result<Plan> {
    // ID fast path: the filter is exactly one equality on `_id`.
    if filter.len() == 1 {
        if let Some(condition) = filter.get("_id") {
            if let Some(id) = equality_constraint(condition) {
                return Ok(Plan::IdLookup(id.clone()));
            }
        }
    }

    // Index path: some index's first declared field carries an equality.
    // Unique indexes win ties; declaration order decides the rest, which is
    // the iteration order of the catalog records handed in.
    let mut candidate: Option<(&IndexRecord, &Bson)> = None;
    for index in indexes {
        if index.config.partial_filter.is_some() {
            // A partial index may lack entries for matching documents.
            continue;
        }
        let (first_field, _) = match index.keys.first() {
            Some(first) => first,
            None => continue,
        };
        let value = match filter.get(first_field).and_then(equality_constraint) {
            Some(value) => value,
            None => continue,
        };
        if index.config.sparse && matches!(value, Bson::Null) {
            // A sparse index holds no entry for documents missing the field,
            // yet `{field: null}` must match exactly those documents.
            continue;
        }
        let better = match &candidate {
            None => true,
            Some((current, _)) => index.config.unique && !current.config.unique,
        };
        if better {
            candidate = Some((index, value));
        }
    }

    if let Some((index, value)) = candidate {
        let descending = index.keys.first().map(|(_, order)| *order < 0).unwrap_or(false);
        let prefix = key::encode_index_key(&[(Some(value), descending)])?;
        return Ok(Plan::IndexEq { index: index.name.clone(), prefix });
    }

    Ok(Plan::Scan)
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;
    use crate::catalog::{IndexConfig, IndexRecord};

    fn index(name: &str, field: &str, unique: bool) -> IndexRecord {
        IndexRecord {
            name: name.to_string(),
            collection: "c".to_string(),
            keys: vec![(field.to_string(), 1)],
            config: IndexConfig { unique, ..Default::default() },
            created_at: time::OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn exact_id_filter_takes_the_fast_path() {
        let plan = plan_query(&doc! { "_id": 7 }, &[]).unwrap();
        assert_eq!(plan, Plan::IdLookup(Bson::Int32(7)));

        let plan = plan_query(&doc! { "_id": { "$eq": 7 } }, &[]).unwrap();
        assert_eq!(plan, Plan::IdLookup(Bson::Int32(7)));

        // A range on `_id` is not the fast path.
        let plan = plan_query(&doc! { "_id": { "$gt": 7 } }, &[]).unwrap();
        assert_eq!(plan, Plan::Scan);
    }

    #[test]
    fn equality_on_indexed_field_picks_the_index() {
        let indexes = vec![index("a_1", "a", false), index("b_1", "b", false)];
        let plan = plan_query(&doc! { "b": 3, "x": { "$gt": 1 } }, &indexes).unwrap();
        assert!(matches!(plan, Plan::IndexEq { index, .. } if index == "b_1"));
    }

    #[test]
    fn unique_index_wins_ties() {
        let indexes = vec![index("a_1", "a", false), index("a_unique", "a", true)];
        let plan = plan_query(&doc! { "a": 3 }, &indexes).unwrap();
        assert!(matches!(plan, Plan::IndexEq { index, .. } if index == "a_unique"));
    }

    #[test]
    fn declaration_order_breaks_remaining_ties() {
        let indexes = vec![index("first", "a", false), index("second", "a", false)];
        let plan = plan_query(&doc! { "a": 3 }, &indexes).unwrap();
        assert!(matches!(plan, Plan::IndexEq { index, .. } if index == "first"));
    }

    #[test]
    fn no_usable_index_means_scan() {
        let indexes = vec![index("a_1", "a", false)];
        assert_eq!(plan_query(&doc! { "a": { "$gt": 1 } }, &indexes).unwrap(), Plan::Scan);
        assert_eq!(plan_query(&doc! { "other": 1 }, &indexes).unwrap(), Plan::Scan);
        assert_eq!(plan_query(&doc! {}, &indexes).unwrap(), Plan::Scan);
    }

    #[test]
    fn sparse_index_is_skipped_for_null_equality() {
        let mut sparse = index("a_sparse", "a", false);
        sparse.config.sparse = true;
        let plan = plan_query(&doc! { "a": Bson::Null }, &[sparse.clone()]).unwrap();
        assert_eq!(plan, Plan::Scan);

        let plan = plan_query(&doc! { "a": 1 }, &[sparse]).unwrap();
        assert!(matches!(plan, Plan::IndexEq { .. }));
    }
}
