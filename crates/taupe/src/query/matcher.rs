//! The query matcher: a pure predicate evaluator over a parsed document
//! given a filter document. The engine only calls through the [`Matcher`]
//! trait, so hosts can substitute their own evaluator.

use std::cmp::Ordering;

use bson::{Bson, Document};

use crate::error::UserError;
use crate::Result;

/// Evaluates a filter document against a parsed document.
pub trait Matcher: Send + Sync {
    fn matches(&self, filter: &Document, doc: &Document) -> Result<bool>;
}

/// The stock matcher: implicit conjunction of field conditions, with the
/// comparison, membership, existence, and logical operator families.
#[derive(Debug, Default)]
pub struct DefaultMatcher;

impl Matcher for DefaultMatcher {
    fn matches(&self, filter: &Document, doc: &Document) -> Result<bool> {
        for (key, condition) in filter {
            let holds = match key.as_str() {
                "$and" => logical_list(self, condition, doc)?.iter().all(|m| *m),
                "$or" => logical_list(self, condition, doc)?.iter().any(|m| *m),
                "$nor" => !logical_list(self, condition, doc)?.iter().any(|m| *m),
                "$comment" => true,
                key if key.starts_with('$') => {
                    return Err(UserError::UnknownOperator(key.to_string()).into())
                }
                path => field_condition(path, condition, doc)?,
            };
            if !holds {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn logical_list(matcher: &DefaultMatcher, condition: &Bson, doc: &Document) -> Result<Vec<bool>> {
    let clauses = match condition {
        Bson::Array(clauses) if !clauses.is_empty() => clauses,
        _ => {
            return Err(UserError::InvalidArgument(
                "logical operators take a non-empty array of filters".into(),
            )
            .into())
        }
    };
    clauses
        .iter()
        .map(|clause| match clause {
            Bson::Document(filter) => matcher.matches(filter, doc),
            _ => Err(UserError::InvalidArgument("logical clauses must be documents".into()).into()),
        })
        .collect()
}

/// Whether `condition` is an operator document (`{"$gte": 2}`) as opposed to
/// a literal to compare for equality.
pub(crate) fn is_operator_document(condition: &Bson) -> bool {
    match condition {
        Bson::Document(doc) => doc.keys().next().is_some_and(|k| k.starts_with('$')),
        _ => false,
    }
}

fn field_condition(path: &str, condition: &Bson, doc: &Document) -> Result<bool> {
    let value = lookup_path(doc, path);
    if is_operator_document(condition) {
        let operators = match condition {
            Bson::Document(operators) => operators,
            _ => unreachable!("checked by is_operator_document"),
        };
        for (op, operand) in operators {
            if !apply_operator(op, operand, value)? {
                return Ok(false);
            }
        }
        Ok(true)
    } else {
        Ok(equality_matches(value, condition))
    }
}

/// Literal equality: a `null` literal also matches a missing field.
fn equality_matches(value: Option<&Bson>, literal: &Bson) -> bool {
    match value {
        Some(value) => values_equal(value, literal),
        None => matches!(literal, Bson::Null),
    }
}

fn apply_operator(op: &str, operand: &Bson, value: Option<&Bson>) -> Result<bool> {
    match op {
        "$eq" => Ok(equality_matches(value, operand)),
        "$ne" => Ok(!equality_matches(value, operand)),
        "$gt" => Ok(ordered(value, operand, |o| o == Ordering::Greater)),
        "$gte" => Ok(ordered(value, operand, |o| o != Ordering::Less)),
        "$lt" => Ok(ordered(value, operand, |o| o == Ordering::Less)),
        "$lte" => Ok(ordered(value, operand, |o| o != Ordering::Greater)),
        "$in" => {
            let candidates = operand_array(op, operand)?;
            Ok(value.is_some_and(|v| candidates.iter().any(|c| values_equal(v, c))))
        }
        "$nin" => {
            let candidates = operand_array(op, operand)?;
            // Like `$ne`, absence satisfies the exclusion.
            Ok(!value.is_some_and(|v| candidates.iter().any(|c| values_equal(v, c))))
        }
        "$exists" => {
            let expected = match operand {
                Bson::Boolean(b) => *b,
                Bson::Int32(n) => *n != 0,
                Bson::Int64(n) => *n != 0,
                _ => {
                    return Err(UserError::InvalidArgument(
                        "$exists takes a boolean operand".into(),
                    )
                    .into())
                }
            };
            Ok(value.is_some() == expected)
        }
        "$not" => match operand {
            Bson::Document(inner)
                if inner.keys().next().is_some_and(|key| key.starts_with('$')) =>
            {
                for (op, operand) in inner {
                    if apply_operator(op, operand, value)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            _ => Err(UserError::InvalidArgument("$not takes an operator document".into()).into()),
        },
        "$size" => {
            let expected = operand
                .as_i64()
                .or_else(|| operand.as_i32().map(i64::from))
                .ok_or_else(|| UserError::InvalidArgument("$size takes an integer".into()))?;
            Ok(matches!(value, Some(Bson::Array(items)) if items.len() as i64 == expected))
        }
        other => Err(UserError::UnknownOperator(other.to_string()).into()),
    }
}

fn operand_array<'a>(op: &str, operand: &'a Bson) -> Result<&'a Vec<Bson>> {
    match operand {
        Bson::Array(candidates) => Ok(candidates),
        _ => Err(UserError::InvalidArgument(format!("{op} takes an array operand")).into()),
    }
}

fn ordered(value: Option<&Bson>, operand: &Bson, accept: impl Fn(Ordering) -> bool) -> bool {
    match value.and_then(|v| compare_values(v, operand)) {
        Some(ordering) => accept(ordering),
        // Values of incomparable types never satisfy a range operator.
        None => false,
    }
}

fn numeric(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(*n as f64),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}

/// Equality with numeric bridging across Int32/Int64/Double.
pub(crate) fn values_equal(a: &Bson, b: &Bson) -> bool {
    if let (Some(a), Some(b)) = (numeric(a), numeric(b)) {
        return a == b;
    }
    match (a, b) {
        (Bson::Array(a), Bson::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(a, b)| values_equal(a, b))
        }
        (Bson::Document(a), Bson::Document(b)) => {
            a.len() == b.len()
                && a.iter().zip(b.iter()).all(|((ka, va), (kb, vb))| ka == kb && values_equal(va, vb))
        }
        _ => a == b,
    }
}

/// Ordering comparison between same-kind values; `None` when the kinds are
/// incomparable (different type ranks, other than mixed numeric widths).
pub(crate) fn compare_values(a: &Bson, b: &Bson) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (numeric(a), numeric(b)) {
        return a.partial_cmp(&b);
    }
    if crate::key::type_rank(a) != crate::key::type_rank(b) {
        return None;
    }
    Some(crate::key::canonical_cmp(a, b))
}

/// Resolves a dotted field path; numeric path elements index into arrays.
pub(crate) fn lookup_path<'d>(doc: &'d Document, path: &str) -> Option<&'d Bson> {
    let mut current: Option<&Bson> = None;
    for element in path.split('.') {
        let next = match current {
            None => doc.get(element),
            Some(Bson::Document(nested)) => nested.get(element),
            Some(Bson::Array(items)) => element.parse::<usize>().ok().and_then(|i| items.get(i)),
            Some(_) => None,
        };
        current = Some(next?);
    }
    current
}
