//! Narrow interface to the external document codec.
//!
//! Documents are self-describing binary BSON; everything the engine needs
//! from the codec goes through this module so the backing library stays an
//! implementation detail of one file.

use bson::oid::ObjectId;
use bson::{Bson, Document};

use crate::error::UserError;
use crate::Result;

/// Parses the binary form of a document.
pub fn decode_document(mut bytes: &[u8]) -> Result<Document> {
    let doc = Document::from_reader(&mut bytes).map_err(crate::InternalError::from)?;
    Ok(doc)
}

/// Serializes a document to its binary form.
pub fn encode_document(doc: &Document) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    doc.to_writer(&mut bytes).map_err(crate::InternalError::from)?;
    Ok(bytes)
}

/// Returns the `_id` of a document, if any.
pub fn document_id(doc: &Document) -> Option<&Bson> {
    doc.get("_id")
}

/// Ensures the document carries a usable `_id`, generating a fresh object
/// identifier when the field is absent. The identifier ends up first in the
/// stored document. Returns the (possibly rewritten) document and its id.
pub fn assign_document_id(doc: Document) -> Result<(Document, Bson)> {
    match doc.get("_id") {
        Some(id) => {
            reject_unusable_id(id)?;
            let id = id.clone();
            Ok((doc, id))
        }
        None => {
            let id = Bson::ObjectId(ObjectId::new());
            let mut rewritten = Document::new();
            rewritten.insert("_id", id.clone());
            rewritten.extend(doc);
            Ok((rewritten, id))
        }
    }
}

fn reject_unusable_id(id: &Bson) -> Result<()> {
    match id {
        Bson::Null | Bson::Undefined => Err(UserError::InvalidDocumentId("null").into()),
        Bson::Array(_) => Err(UserError::InvalidDocumentId("array").into()),
        Bson::RegularExpression(_) => Err(UserError::InvalidDocumentId("regex").into()),
        Bson::MinKey => Err(UserError::InvalidDocumentId("minKey").into()),
        Bson::MaxKey => Err(UserError::InvalidDocumentId("maxKey").into()),
        _ => Ok(()),
    }
}

/// Parses a JSON object string into a document.
pub fn document_from_json(json: &str) -> Result<Document> {
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(crate::InternalError::from)?;
    if !value.is_object() {
        return Err(UserError::InvalidArgument("expected a JSON object".into()).into());
    }
    let bson = bson::to_bson(&value).map_err(crate::InternalError::from)?;
    match bson {
        Bson::Document(doc) => Ok(doc),
        _ => Err(UserError::InvalidArgument("expected a JSON object".into()).into()),
    }
}

/// Renders a document as a relaxed extended-JSON string.
pub fn document_to_json(doc: &Document) -> String {
    Bson::Document(doc.clone()).into_relaxed_extjson().to_string()
}

/// Renders any value as a relaxed extended-JSON string.
pub fn value_to_json(value: &Bson) -> String {
    value.clone().into_relaxed_extjson().to_string()
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;

    #[test]
    fn binary_roundtrip_preserves_field_order() {
        let doc = doc! { "b": 2i32, "a": 1i32, "nested": { "x": true } };
        let bytes = encode_document(&doc).unwrap();
        let back = decode_document(&bytes).unwrap();
        assert_eq!(doc, back);
        assert_eq!(back.keys().collect::<Vec<_>>(), vec!["b", "a", "nested"]);
    }

    #[test]
    fn assign_puts_generated_id_first() {
        let (doc, id) = assign_document_id(doc! { "name": "Alice" }).unwrap();
        assert_eq!(doc.keys().next().map(String::as_str), Some("_id"));
        assert_eq!(doc.get("_id"), Some(&id));
        let oid = match id {
            Bson::ObjectId(oid) => oid,
            other => panic!("expected an object id, got {other:?}"),
        };
        assert_eq!(oid.bytes().len(), 12);
    }

    #[test]
    fn explicit_id_is_kept_verbatim() {
        let (doc, id) = assign_document_id(doc! { "_id": 42i64, "name": "Bob" }).unwrap();
        assert_eq!(id, Bson::Int64(42));
        assert_eq!(doc.get("_id"), Some(&Bson::Int64(42)));
    }

    #[test]
    fn null_and_array_ids_are_rejected() {
        assert!(assign_document_id(doc! { "_id": Bson::Null }).is_err());
        assert!(assign_document_id(doc! { "_id": [1, 2] }).is_err());
    }

    #[test]
    fn json_bridge() {
        let doc = document_from_json(r#"{"name":"Alice","age":30}"#).unwrap();
        assert_eq!(doc.get_str("name").unwrap(), "Alice");
        assert_eq!(doc.get_i64("age").unwrap_or_else(|_| doc.get_i32("age").unwrap() as i64), 30);

        let json = document_to_json(&doc);
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["name"], "Alice");

        assert!(document_from_json("[1,2,3]").is_err());
    }
}
