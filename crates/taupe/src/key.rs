//! Order-preserving key encoding.
//!
//! Primary keys and index keys are byte strings compared lexicographically
//! by the page store, so every value is encoded as a type-rank tag followed
//! by an order-preserving payload. Numbers of every width share one rank and
//! one `f64` payload, mirroring cross-type numeric comparison in filters.
//! Descending index fields flip the bits of their whole segment.

use std::cmp::Ordering;

use bson::Bson;

use crate::error::UserError;
use crate::Result;

pub(crate) const TAG_MIN_KEY: u8 = 0x02;
pub(crate) const TAG_NULL: u8 = 0x08;
pub(crate) const TAG_NUMBER: u8 = 0x10;
pub(crate) const TAG_STRING: u8 = 0x18;
pub(crate) const TAG_DOCUMENT: u8 = 0x20;
pub(crate) const TAG_ARRAY: u8 = 0x28;
pub(crate) const TAG_BINARY: u8 = 0x30;
pub(crate) const TAG_OBJECT_ID: u8 = 0x38;
pub(crate) const TAG_BOOLEAN: u8 = 0x40;
pub(crate) const TAG_DATE_TIME: u8 = 0x48;
pub(crate) const TAG_TIMESTAMP: u8 = 0x50;
pub(crate) const TAG_REGEX: u8 = 0x58;
pub(crate) const TAG_MAX_KEY: u8 = 0x60;

/// Rank of a value in the canonical cross-type ordering.
pub(crate) fn type_rank(value: &Bson) -> u8 {
    match value {
        Bson::MinKey => TAG_MIN_KEY,
        Bson::Null | Bson::Undefined => TAG_NULL,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) => TAG_NUMBER,
        Bson::String(_) | Bson::Symbol(_) => TAG_STRING,
        Bson::Document(_) => TAG_DOCUMENT,
        Bson::Array(_) => TAG_ARRAY,
        Bson::Binary(_) => TAG_BINARY,
        Bson::ObjectId(_) => TAG_OBJECT_ID,
        Bson::Boolean(_) => TAG_BOOLEAN,
        Bson::DateTime(_) => TAG_DATE_TIME,
        Bson::Timestamp(_) => TAG_TIMESTAMP,
        Bson::RegularExpression(_) => TAG_REGEX,
        Bson::MaxKey => TAG_MAX_KEY,
        Bson::Decimal128(_)
        | Bson::JavaScriptCode(_)
        | Bson::JavaScriptCodeWithScope(_)
        | Bson::DbPointer(_) => TAG_MAX_KEY,
    }
}

fn unsupported(value: &Bson) -> crate::Error {
    UserError::InvalidArgument(format!(
        "values of element type 0x{:02x} cannot be encoded as keys",
        value.element_type() as u8
    ))
    .into()
}

/// `f64` bit pattern rewritten so unsigned byte order equals numeric order.
fn append_f64(buf: &mut Vec<u8>, value: f64) {
    let bits = value.to_bits();
    let bits = if bits & (1 << 63) != 0 { !bits } else { bits ^ (1 << 63) };
    buf.extend_from_slice(&bits.to_be_bytes());
}

fn append_i64_shifted(buf: &mut Vec<u8>, value: i64) {
    buf.extend_from_slice(&((value as u64) ^ (1 << 63)).to_be_bytes());
}

/// Appends bytes with `0x00` escaped as `0x00 0xFF` and a `0x00 0x00`
/// terminator, so embedded NULs and prefixes order correctly.
fn append_escaped(buf: &mut Vec<u8>, bytes: &[u8]) {
    for &byte in bytes {
        buf.push(byte);
        if byte == 0x00 {
            buf.push(0xFF);
        }
    }
    buf.push(0x00);
    buf.push(0x00);
}

fn numeric_value(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(*n as f64),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}

/// Appends the tagged, order-preserving encoding of one value.
pub(crate) fn append_element(buf: &mut Vec<u8>, value: &Bson) -> Result<()> {
    buf.push(type_rank(value));
    match value {
        Bson::MinKey | Bson::MaxKey | Bson::Null | Bson::Undefined => {}
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) => {
            // All three widths share the rank; the payload is the f64 value.
            let n = numeric_value(value).expect("checked numeric");
            append_f64(buf, n);
        }
        Bson::String(s) => append_escaped(buf, s.as_bytes()),
        Bson::Symbol(s) => append_escaped(buf, s.as_bytes()),
        Bson::Document(doc) => {
            for (key, value) in doc {
                buf.push(0x01);
                append_escaped(buf, key.as_bytes());
                append_element(buf, value)?;
            }
            buf.push(0x00);
        }
        Bson::Array(values) => {
            for value in values {
                buf.push(0x01);
                append_element(buf, value)?;
            }
            buf.push(0x00);
        }
        Bson::Binary(binary) => append_escaped(buf, &binary.bytes),
        Bson::ObjectId(oid) => buf.extend_from_slice(&oid.bytes()),
        Bson::Boolean(b) => buf.push(*b as u8),
        Bson::DateTime(dt) => append_i64_shifted(buf, dt.timestamp_millis()),
        Bson::Timestamp(ts) => {
            buf.extend_from_slice(&ts.time.to_be_bytes());
            buf.extend_from_slice(&ts.increment.to_be_bytes());
        }
        Bson::RegularExpression(regex) => {
            append_escaped(buf, regex.pattern.as_bytes());
            append_escaped(buf, regex.options.as_bytes());
        }
        Bson::Decimal128(_)
        | Bson::JavaScriptCode(_)
        | Bson::JavaScriptCodeWithScope(_)
        | Bson::DbPointer(_) => return Err(unsupported(value)),
    }
    Ok(())
}

/// Encodes a document `_id` as a primary key. Object identifiers keep their
/// big-endian layout, so primary keys of generated ids sort by creation time.
pub(crate) fn encode_primary_key(id: &Bson) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(16);
    append_element(&mut buf, id)?;
    Ok(buf)
}

/// Encodes the extracted values of an index's fields, in declaration order.
/// A missing field encodes as Null; a descending field's segment is
/// bit-flipped so the byte order inverts.
pub(crate) fn encode_index_key(values: &[(Option<&Bson>, bool)]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(16 * values.len());
    for (value, descending) in values {
        let start = buf.len();
        match value {
            Some(value) => append_element(&mut buf, value)?,
            None => buf.push(TAG_NULL),
        }
        if *descending {
            for byte in &mut buf[start..] {
                *byte = !*byte;
            }
        }
    }
    Ok(buf)
}

/// The encoded form of an ascending datetime segment, used as an exclusive
/// upper bound when sweeping expired index entries.
pub(crate) fn encode_datetime_bound(cutoff: bson::DateTime) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9);
    buf.push(TAG_DATE_TIME);
    append_i64_shifted(&mut buf, cutoff.timestamp_millis());
    buf
}

/// Total order over values: type rank first, then the per-type comparison
/// the key encoding realizes in bytes. Drives `sort` documents.
pub fn canonical_cmp(a: &Bson, b: &Bson) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        _ if numeric_value(a).is_some() && numeric_value(b).is_some() => {
            let a = numeric_value(a).expect("checked numeric");
            let b = numeric_value(b).expect("checked numeric");
            a.partial_cmp(&b).unwrap_or_else(|| a.is_nan().cmp(&b.is_nan()))
        }
        (Bson::String(a), Bson::String(b)) => a.cmp(b),
        (Bson::Symbol(a), Bson::Symbol(b)) => a.cmp(b),
        (Bson::String(a), Bson::Symbol(b)) => a.as_str().cmp(b.as_str()),
        (Bson::Symbol(a), Bson::String(b)) => a.as_str().cmp(b.as_str()),
        (Bson::Document(a), Bson::Document(b)) => {
            let pairs_a: Vec<_> = a.iter().collect();
            let pairs_b: Vec<_> = b.iter().collect();
            for ((ka, va), (kb, vb)) in pairs_a.iter().zip(&pairs_b) {
                let key = ka.as_str().cmp(kb.as_str());
                if key != Ordering::Equal {
                    return key;
                }
                let value = canonical_cmp(va, vb);
                if value != Ordering::Equal {
                    return value;
                }
            }
            pairs_a.len().cmp(&pairs_b.len())
        }
        (Bson::Array(a), Bson::Array(b)) => {
            for (va, vb) in a.iter().zip(b) {
                let value = canonical_cmp(va, vb);
                if value != Ordering::Equal {
                    return value;
                }
            }
            a.len().cmp(&b.len())
        }
        (Bson::Binary(a), Bson::Binary(b)) => a.bytes.cmp(&b.bytes),
        (Bson::ObjectId(a), Bson::ObjectId(b)) => a.bytes().cmp(&b.bytes()),
        (Bson::Boolean(a), Bson::Boolean(b)) => a.cmp(b),
        (Bson::DateTime(a), Bson::DateTime(b)) => {
            a.timestamp_millis().cmp(&b.timestamp_millis())
        }
        (Bson::Timestamp(a), Bson::Timestamp(b)) => {
            a.time.cmp(&b.time).then(a.increment.cmp(&b.increment))
        }
        (Bson::RegularExpression(a), Bson::RegularExpression(b)) => {
            a.pattern.cmp(&b.pattern).then_with(|| a.options.cmp(&b.options))
        }
        _ => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use bson::oid::ObjectId;
    use bson::{doc, Bson};

    use super::*;

    fn encode(value: &Bson) -> Vec<u8> {
        encode_primary_key(value).unwrap()
    }

    #[test]
    fn encoding_order_agrees_with_canonical_order() {
        let values = vec![
            Bson::MinKey,
            Bson::Null,
            Bson::Double(-1e9),
            Bson::Int32(-7),
            Bson::Int32(0),
            Bson::Double(0.5),
            Bson::Int64(3),
            Bson::Double(1e12),
            Bson::String(String::new()),
            Bson::String("a".into()),
            Bson::String("a\0b".into()),
            Bson::String("ab".into()),
            Bson::String("b".into()),
            Bson::ObjectId(ObjectId::from_bytes([0; 12])),
            Bson::ObjectId(ObjectId::from_bytes([0xFF; 12])),
            Bson::Boolean(false),
            Bson::Boolean(true),
            Bson::DateTime(bson::DateTime::from_millis(-1000)),
            Bson::DateTime(bson::DateTime::from_millis(1_700_000_000_000)),
            Bson::MaxKey,
        ];

        for window in values.windows(2) {
            let (a, b) = (&window[0], &window[1]);
            assert_eq!(canonical_cmp(a, b), std::cmp::Ordering::Less, "{a:?} !< {b:?}");
            assert!(encode(a) < encode(b), "encoding out of order: {a:?} vs {b:?}");
        }
    }

    #[test]
    fn numeric_widths_encode_identically() {
        assert_eq!(encode(&Bson::Int32(42)), encode(&Bson::Int64(42)));
        assert_eq!(encode(&Bson::Int64(42)), encode(&Bson::Double(42.0)));
    }

    #[test]
    fn string_prefix_orders_before_extension() {
        // The escaped terminator must keep "a" < "a\0" < "ab".
        let a = encode(&Bson::String("a".into()));
        let a_nul = encode(&Bson::String("a\0".into()));
        let ab = encode(&Bson::String("ab".into()));
        assert!(a < a_nul && a_nul < ab);
    }

    #[test]
    fn descending_segment_inverts_order() {
        let low = Bson::Int32(1);
        let high = Bson::Int32(2);
        let asc_low = encode_index_key(&[(Some(&low), false)]).unwrap();
        let asc_high = encode_index_key(&[(Some(&high), false)]).unwrap();
        let desc_low = encode_index_key(&[(Some(&low), true)]).unwrap();
        let desc_high = encode_index_key(&[(Some(&high), true)]).unwrap();
        assert!(asc_low < asc_high);
        assert!(desc_low > desc_high);
    }

    #[test]
    fn compound_keys_compare_field_by_field() {
        let a = doc! { "x": 1, "y": "b" };
        let b = doc! { "x": 1, "y": "a" };
        let key = |d: &bson::Document| {
            encode_index_key(&[(d.get("x"), false), (d.get("y"), true)]).unwrap()
        };
        // Same x; descending y puts "b" before "a".
        assert!(key(&a) < key(&b));
    }

    #[test]
    fn missing_field_encodes_as_null() {
        let missing = encode_index_key(&[(None, false)]).unwrap();
        let null = encode_index_key(&[(Some(&Bson::Null), false)]).unwrap();
        assert_eq!(missing, null);
    }

    #[test]
    fn unsupported_types_are_rejected() {
        let code = Bson::JavaScriptCode("1".into());
        assert!(encode_primary_key(&code).is_err());
    }
}
