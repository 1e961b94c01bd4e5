//! An embedded document database: collections of BSON documents addressed
//! by object identifiers, with synchronously maintained secondary indexes,
//! on top of the `terrier` memory-mapped page store.
//!
//! A [`Database`] opens a directory, names collections, and routes every
//! mutation through one write transaction so a document and its index
//! entries always land together. Queries take the `_id` fast path, an
//! index-assisted path, or a filtered scan, and stream through a [`Cursor`]
//! that owns its read snapshot.

mod cache;
mod catalog;
mod codec;
mod collection;
mod cursor;
mod database;
mod error;
mod json;
pub mod key;
pub mod query;
pub mod store;
mod txn_pool;

#[cfg(test)]
mod test_database;

pub use bson::{self, doc, Bson, Document};
pub use terrier;

pub use self::catalog::{CollectionConfig, CollectionRecord, IndexConfig, IndexRecord};
pub use self::codec::{document_from_json, document_to_json};
pub use self::cursor::Cursor;
pub use self::database::{
    CollectionStats, Database, DatabaseOptions, DatabaseStats, IoMode, ModifyAction,
    UpdateSummary,
};
pub use self::error::{Error, ErrorCode, ErrorRecord, InternalError, UserError, LIBRARY_TAG};
pub use self::key::canonical_cmp;
pub use self::query::{DefaultMatcher, DefaultUpdateDriver, Matcher, UpdateDriver};
pub use self::store::KeyExtractor;

pub type Result<T> = std::result::Result<T, Error>;

/// The crate version as a `(major, minor, patch)` triple.
pub fn version() -> (u32, u32, u32) {
    let parse = |s: &str| s.parse().unwrap_or(0);
    (
        parse(env!("CARGO_PKG_VERSION_MAJOR")),
        parse(env!("CARGO_PKG_VERSION_MINOR")),
        parse(env!("CARGO_PKG_VERSION_PATCH")),
    )
}

#[cfg(test)]
mod tests {
    #[test]
    fn version_triple_matches_the_manifest() {
        let (major, minor, patch) = super::version();
        assert_eq!(
            format!("{major}.{minor}.{patch}"),
            env!("CARGO_PKG_VERSION"),
        );
    }
}
