//! Index key extraction: from a parsed document to the encoded index key,
//! or nothing when the index's sparse/partial rules skip the document.

use std::sync::Arc;

use bson::Document;

use crate::catalog::IndexRecord;
use crate::key;
use crate::query::matcher::{lookup_path, Matcher};
use crate::Result;

/// Produces the encoded index key of one document, `None` meaning "do not
/// index this document".
pub trait KeyExtractor: Send + Sync {
    fn extract(&self, doc: &Document) -> Result<Option<Vec<u8>>>;
}

/// The stock extractor: walks the declared field paths, applies the partial
/// filter through the matcher seam, encodes in declaration order with
/// descending fields bit-flipped. Missing fields index as Null unless the
/// index is sparse and every field is missing.
pub struct FieldPathExtractor {
    keys: Vec<(String, bool)>,
    sparse: bool,
    partial_filter: Option<Document>,
    matcher: Arc<dyn Matcher>,
}

impl FieldPathExtractor {
    pub fn from_record(record: &IndexRecord, matcher: Arc<dyn Matcher>) -> FieldPathExtractor {
        FieldPathExtractor {
            keys: record.keys.iter().map(|(field, order)| (field.clone(), *order < 0)).collect(),
            sparse: record.config.sparse,
            partial_filter: record.config.partial_filter.clone(),
            matcher,
        }
    }
}

impl KeyExtractor for FieldPathExtractor {
    fn extract(&self, doc: &Document) -> Result<Option<Vec<u8>>> {
        if let Some(filter) = &self.partial_filter {
            if !self.matcher.matches(filter, doc)? {
                return Ok(None);
            }
        }

        let values: Vec<_> = self
            .keys
            .iter()
            .map(|(path, descending)| (lookup_path(doc, path), *descending))
            .collect();

        if self.sparse && values.iter().all(|(value, _)| value.is_none()) {
            return Ok(None);
        }

        key::encode_index_key(&values).map(Some)
    }
}
