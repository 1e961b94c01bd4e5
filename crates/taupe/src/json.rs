//! JSON string variants of the document API: filters, updates, and
//! documents come in as JSON object strings and results leave as relaxed
//! extended-JSON strings, through the codec's bridge.

use bson::Document;

use crate::codec;
use crate::database::{Database, UpdateSummary};
use crate::error::UserError;
use crate::Result;

fn parse_optional(json: Option<&str>) -> Result<Option<Document>> {
    json.map(codec::document_from_json).transpose()
}

impl Database {
    /// Inserts one JSON document; returns the `_id` as a JSON string.
    pub fn insert_one_json(&self, collection: &str, doc: &str) -> Result<String> {
        let doc = codec::document_from_json(doc)?;
        let id = self.insert_one(collection, doc)?;
        Ok(codec::value_to_json(&id))
    }

    /// Inserts a JSON array of documents under one transaction; returns the
    /// ids as JSON strings.
    pub fn insert_many_json(&self, collection: &str, docs: &str) -> Result<Vec<String>> {
        let value: serde_json::Value =
            serde_json::from_str(docs).map_err(crate::InternalError::from)?;
        let items = match value {
            serde_json::Value::Array(items) => items,
            _ => {
                return Err(
                    UserError::InvalidArgument("expected a JSON array of objects".into()).into()
                )
            }
        };
        let docs = items
            .into_iter()
            .map(|item| codec::document_from_json(&item.to_string()))
            .collect::<Result<Vec<_>>>()?;
        let ids = self.insert_many(collection, docs)?;
        Ok(ids.iter().map(codec::value_to_json).collect())
    }

    pub fn find_one_json(
        &self,
        collection: &str,
        filter: &str,
        projection: Option<&str>,
    ) -> Result<Option<String>> {
        let filter = codec::document_from_json(filter)?;
        let projection = parse_optional(projection)?;
        let doc = self.find_one(collection, &filter, projection.as_ref())?;
        Ok(doc.as_ref().map(codec::document_to_json))
    }

    /// Materializes every match as a JSON string, in cursor order.
    pub fn find_json(
        &self,
        collection: &str,
        filter: &str,
        projection: Option<&str>,
    ) -> Result<Vec<String>> {
        let filter = codec::document_from_json(filter)?;
        let projection = parse_optional(projection)?;
        let mut cursor = self.find(collection, filter, projection)?;
        let mut results = Vec::new();
        while let Some(doc) = cursor.next_document()? {
            results.push(codec::document_to_json(&doc));
        }
        Ok(results)
    }

    pub fn update_one_json(
        &self,
        collection: &str,
        filter: &str,
        update: &str,
        upsert: bool,
    ) -> Result<UpdateSummary> {
        let filter = codec::document_from_json(filter)?;
        let update = codec::document_from_json(update)?;
        self.update_one(collection, &filter, &update, upsert)
    }

    pub fn update_many_json(
        &self,
        collection: &str,
        filter: &str,
        update: &str,
        upsert: bool,
    ) -> Result<UpdateSummary> {
        let filter = codec::document_from_json(filter)?;
        let update = codec::document_from_json(update)?;
        self.update_many(collection, &filter, &update, upsert)
    }

    pub fn delete_one_json(&self, collection: &str, filter: &str) -> Result<bool> {
        let filter = codec::document_from_json(filter)?;
        self.delete_one(collection, &filter)
    }

    pub fn delete_many_json(&self, collection: &str, filter: &str) -> Result<u64> {
        let filter = codec::document_from_json(filter)?;
        self.delete_many(collection, &filter)
    }

    pub fn count_json(&self, collection: &str, filter: Option<&str>) -> Result<u64> {
        let filter = parse_optional(filter)?;
        self.count(collection, filter.as_ref())
    }
}
