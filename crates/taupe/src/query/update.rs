//! The update-operator engine: produces a new document from an old one given
//! an update specification. Reached through the [`UpdateDriver`] trait only.

use bson::{Bson, Document};

use crate::error::UserError;
use crate::query::matcher::{compare_values, is_operator_document, values_equal};
use crate::Result;

/// Applies update specifications and synthesizes upsert base documents.
pub trait UpdateDriver: Send + Sync {
    /// Produces the post-image of `doc` under `update`. Never mutates `_id`.
    fn apply(&self, update: &Document, doc: &Document) -> Result<Document>;

    /// Builds the initial document of an upsert from the equality fragments
    /// of `filter`, then applies `update` (including `$setOnInsert`).
    fn build_upsert(&self, filter: &Document, update: &Document) -> Result<Document>;
}

#[derive(Debug, Default)]
pub struct DefaultUpdateDriver;

impl UpdateDriver for DefaultUpdateDriver {
    fn apply(&self, update: &Document, doc: &Document) -> Result<Document> {
        if is_replacement(update) {
            return replace(update, doc);
        }
        let mut result = doc.clone();
        apply_operators(update, &mut result, false)?;
        Ok(result)
    }

    fn build_upsert(&self, filter: &Document, update: &Document) -> Result<Document> {
        if is_replacement(update) {
            let mut result = update.clone();
            // A replacement upsert may still inherit `_id` from the filter.
            if !result.contains_key("_id") {
                if let Some(id) = filter.get("_id").filter(|id| !is_operator_document(id)) {
                    let mut with_id = Document::new();
                    with_id.insert("_id", id.clone());
                    with_id.extend(result);
                    result = with_id;
                }
            }
            return Ok(result);
        }

        let mut result = Document::new();
        for (path, condition) in filter {
            if path.starts_with('$') {
                // Logical fragments contribute nothing to the base document.
                continue;
            }
            let equality = if is_operator_document(condition) {
                match condition {
                    Bson::Document(operators) => operators.get("$eq").cloned(),
                    _ => None,
                }
            } else {
                Some(condition.clone())
            };
            if let Some(value) = equality {
                set_path(&mut result, path, value)?;
            }
        }
        apply_operators(update, &mut result, true)?;
        Ok(result)
    }
}

/// An update document with no `$`-prefixed keys replaces the document.
fn is_replacement(update: &Document) -> bool {
    !update.keys().any(|k| k.starts_with('$'))
}

fn replace(update: &Document, doc: &Document) -> Result<Document> {
    match (update.get("_id"), doc.get("_id")) {
        (Some(new_id), Some(old_id)) if !values_equal(new_id, old_id) => {
            Err(UserError::InvalidArgument("a replacement cannot change `_id`".into()).into())
        }
        (_, old_id) => {
            let mut result = Document::new();
            if let Some(old_id) = old_id {
                result.insert("_id", old_id.clone());
            }
            for (key, value) in update {
                if key != "_id" {
                    result.insert(key.clone(), value.clone());
                }
            }
            Ok(result)
        }
    }
}

fn apply_operators(update: &Document, doc: &mut Document, inserting: bool) -> Result<()> {
    for (op, spec) in update {
        let spec = match spec {
            Bson::Document(spec) => spec,
            _ => {
                return Err(UserError::InvalidArgument(format!(
                    "update operator {op} takes a document"
                ))
                .into())
            }
        };
        for (path, operand) in spec {
            if path == "_id" && op != "$setOnInsert" {
                return Err(
                    UserError::InvalidArgument("updates cannot target `_id`".into()).into()
                );
            }
            match op.as_str() {
                "$set" => set_path(doc, path, operand.clone())?,
                "$setOnInsert" => {
                    if inserting {
                        set_path(doc, path, operand.clone())?;
                    }
                }
                "$unset" => {
                    unset_path(doc, path);
                }
                "$inc" => arithmetic(doc, path, operand, |old, delta| old + delta)?,
                "$mul" => arithmetic(doc, path, operand, |old, factor| old * factor)?,
                "$min" => clamp(doc, path, operand, std::cmp::Ordering::Less)?,
                "$max" => clamp(doc, path, operand, std::cmp::Ordering::Greater)?,
                "$rename" => {
                    let target = match operand {
                        Bson::String(target) => target,
                        _ => {
                            return Err(UserError::InvalidArgument(
                                "$rename takes a string target path".into(),
                            )
                            .into())
                        }
                    };
                    if let Some(value) = unset_path(doc, path) {
                        set_path(doc, target, value)?;
                    }
                }
                "$push" => {
                    match lookup_path_mut(doc, path, true)? {
                        Some(Bson::Array(items)) => items.push(operand.clone()),
                        Some(slot @ Bson::Null) => *slot = Bson::Array(vec![operand.clone()]),
                        Some(_) => {
                            return Err(UserError::InvalidArgument(format!(
                                "$push target `{path}` is not an array"
                            ))
                            .into())
                        }
                        None => set_path(doc, path, Bson::Array(vec![operand.clone()]))?,
                    }
                }
                "$pop" => {
                    let from_front = matches!(operand.as_i32(), Some(-1))
                        || matches!(operand.as_i64(), Some(-1));
                    if let Some(Bson::Array(items)) = lookup_path_mut(doc, path, false)? {
                        if !items.is_empty() {
                            if from_front {
                                items.remove(0);
                            } else {
                                items.pop();
                            }
                        }
                    }
                }
                other => return Err(UserError::UnknownUpdateOperator(other.to_string()).into()),
            }
        }
    }
    Ok(())
}

fn numeric(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(*n as f64),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}

/// Preserves integer storage classes when both operands are integers.
fn arithmetic(
    doc: &mut Document,
    path: &str,
    operand: &Bson,
    combine: impl Fn(f64, f64) -> f64,
) -> Result<()> {
    if numeric(operand).is_none() {
        return Err(UserError::InvalidArgument(format!(
            "numeric update on `{path}` takes a number"
        ))
        .into());
    }
    match lookup_path_mut(doc, path, true)? {
        // Missing or null target: $inc seeds from zero, $mul yields zero.
        None => set_path(doc, path, combine_as_bson(operand, &Bson::Int32(0), &combine)),
        Some(slot @ Bson::Null) => {
            *slot = combine_as_bson(operand, &Bson::Int32(0), &combine);
            Ok(())
        }
        Some(slot) => {
            let old = slot.clone();
            if numeric(&old).is_none() {
                return Err(UserError::InvalidArgument(format!(
                    "numeric update on non-numeric field `{path}`"
                ))
                .into());
            }
            *slot = combine_as_bson(operand, &old, &combine);
            Ok(())
        }
    }
}

fn combine_as_bson(operand: &Bson, old: &Bson, combine: &impl Fn(f64, f64) -> f64) -> Bson {
    let result = combine(numeric(old).unwrap_or(0.0), numeric(operand).unwrap_or(0.0));
    let integral = !matches!(old, Bson::Double(_)) && !matches!(operand, Bson::Double(_));
    if integral && result.fract() == 0.0 && result.abs() < (i64::MAX as f64) {
        Bson::Int64(result as i64)
    } else {
        Bson::Double(result)
    }
}

fn clamp(
    doc: &mut Document,
    path: &str,
    operand: &Bson,
    replace_when: std::cmp::Ordering,
) -> Result<()> {
    match lookup_path_mut(doc, path, true)? {
        Some(slot @ Bson::Null) => *slot = operand.clone(),
        Some(slot) => {
            if compare_values(operand, slot) == Some(replace_when) {
                *slot = operand.clone();
            }
        }
        None => set_path(doc, path, operand.clone())?,
    }
    Ok(())
}

/// Writes `value` at a dotted `path`, creating intermediate documents.
fn set_path(doc: &mut Document, path: &str, value: Bson) -> Result<()> {
    match path.split_once('.') {
        None => {
            doc.insert(path, value);
            Ok(())
        }
        Some((head, rest)) => {
            match doc.get(head) {
                None => {
                    doc.insert(head, Bson::Document(Document::new()));
                }
                Some(Bson::Document(_)) => {}
                Some(_) => {
                    return Err(UserError::InvalidArgument(format!(
                        "path `{path}` traverses a non-document field"
                    ))
                    .into())
                }
            }
            match doc.get_mut(head) {
                Some(Bson::Document(nested)) => set_path(nested, rest, value),
                _ => Err(UserError::InvalidArgument(format!(
                    "path `{path}` traverses a non-document field"
                ))
                .into()),
            }
        }
    }
}

/// Removes the value at `path`, returning it.
fn unset_path(doc: &mut Document, path: &str) -> Option<Bson> {
    match path.split_once('.') {
        None => doc.remove(path),
        Some((head, rest)) => match doc.get_mut(head) {
            Some(Bson::Document(nested)) => unset_path(nested, rest),
            _ => None,
        },
    }
}

/// Mutable dotted-path lookup; with `create`, intermediate documents are
/// materialized and the leaf slot is still reported as `None` when absent.
fn lookup_path_mut<'d>(
    doc: &'d mut Document,
    path: &str,
    create: bool,
) -> Result<Option<&'d mut Bson>> {
    match path.split_once('.') {
        None => Ok(doc.get_mut(path)),
        Some((head, rest)) => {
            if doc.get(head).is_none() {
                if !create {
                    return Ok(None);
                }
                doc.insert(head, Bson::Document(Document::new()));
            }
            match doc.get_mut(head) {
                Some(Bson::Document(nested)) => lookup_path_mut(nested, rest, create),
                Some(_) => Err(UserError::InvalidArgument(format!(
                    "path `{path}` traverses a non-document field"
                ))
                .into()),
                None => Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;

    fn apply(update: Document, doc: Document) -> Document {
        DefaultUpdateDriver.apply(&update, &doc).unwrap()
    }

    #[test]
    fn set_and_unset() {
        let doc = doc! { "_id": 1, "a": 1, "b": 2 };
        let out = apply(doc! { "$set": { "a": 10, "c.d": true }, "$unset": { "b": "" } }, doc);
        assert_eq!(out, doc! { "_id": 1, "a": 10, "c": { "d": true } });
    }

    #[test]
    fn inc_preserves_integer_class_and_seeds_missing() {
        let out = apply(doc! { "$inc": { "age": 1 } }, doc! { "_id": 1, "age": 30 });
        assert_eq!(out.get("age"), Some(&Bson::Int64(31)));

        let out = apply(doc! { "$inc": { "hits": 5 } }, doc! { "_id": 1 });
        assert_eq!(out.get("hits"), Some(&Bson::Int64(5)));

        let out = apply(doc! { "$inc": { "score": 0.5 } }, doc! { "_id": 1, "score": 1 });
        assert_eq!(out.get("score"), Some(&Bson::Double(1.5)));
    }

    #[test]
    fn inc_applied_k_times_equals_inc_by_k() {
        let mut doc = doc! { "_id": 1, "n": 0 };
        for _ in 0..7 {
            doc = apply(doc! { "$inc": { "n": 1 } }, doc);
        }
        let direct = apply(doc! { "$inc": { "n": 7 } }, doc! { "_id": 1, "n": 0 });
        assert_eq!(doc.get("n"), direct.get("n"));
    }

    #[test]
    fn min_max_and_mul() {
        let doc = doc! { "_id": 1, "lo": 5, "hi": 5, "x": 3 };
        let out = apply(
            doc! { "$min": { "lo": 2 }, "$max": { "hi": 9, "untouched": 1 }, "$mul": { "x": 2 } },
            doc,
        );
        assert_eq!(out.get("lo"), Some(&Bson::Int32(2)));
        assert_eq!(out.get("hi"), Some(&Bson::Int32(9)));
        assert_eq!(out.get("untouched"), Some(&Bson::Int32(1)));
        assert_eq!(out.get("x"), Some(&Bson::Int64(6)));
    }

    #[test]
    fn rename_push_pop() {
        let doc = doc! { "_id": 1, "old": "v", "tags": ["a"] };
        let out = apply(
            doc! { "$rename": { "old": "new" }, "$push": { "tags": "b" } },
            doc,
        );
        assert_eq!(out.get("new"), Some(&Bson::String("v".into())));
        assert!(out.get("old").is_none());
        assert_eq!(out.get_array("tags").unwrap().len(), 2);

        let out = apply(doc! { "$pop": { "tags": 1 } }, out);
        assert_eq!(out.get_array("tags").unwrap().len(), 1);
    }

    #[test]
    fn replacement_keeps_id_and_rejects_id_change() {
        let doc = doc! { "_id": 7, "a": 1 };
        let out = apply(doc! { "b": 2 }, doc.clone());
        assert_eq!(out, doc! { "_id": 7, "b": 2 });

        let err = DefaultUpdateDriver.apply(&doc! { "_id": 8, "b": 2 }, &doc).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::UserError(UserError::InvalidArgument(_))
        ));
    }

    #[test]
    fn updates_cannot_target_id() {
        let err = DefaultUpdateDriver
            .apply(&doc! { "$set": { "_id": 9 } }, &doc! { "_id": 1 })
            .unwrap_err();
        assert!(matches!(err, crate::Error::UserError(UserError::InvalidArgument(_))));
    }

    #[test]
    fn upsert_base_merges_equalities_and_set() {
        let base = DefaultUpdateDriver
            .build_upsert(
                &doc! { "user": "u1", "n": { "$gt": 5 }, "k": { "$eq": 2 } },
                &doc! { "$set": { "v": 1 }, "$setOnInsert": { "seeded": true }, "$inc": { "c": 1 } },
            )
            .unwrap();
        assert_eq!(base.get("user"), Some(&Bson::String("u1".into())));
        // Non-equality operators contribute nothing.
        assert!(base.get("n").is_none());
        assert_eq!(base.get("k"), Some(&Bson::Int32(2)));
        assert_eq!(base.get("v"), Some(&Bson::Int32(1)));
        assert_eq!(base.get("seeded"), Some(&Bson::Boolean(true)));
        assert_eq!(base.get("c"), Some(&Bson::Int64(1)));
    }

    #[test]
    fn unknown_update_operator_is_rejected() {
        let err = DefaultUpdateDriver
            .apply(&doc! { "$bitwise": { "a": 1 } }, &doc! { "_id": 1 })
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::UserError(UserError::UnknownUpdateOperator(_))
        ));
    }
}
