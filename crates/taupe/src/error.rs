use std::io;
use std::path::PathBuf;

use terrier::MdbError;
use thiserror::Error;

/// Library tag carried by every error record.
pub const LIBRARY_TAG: &str = "taupe";

/// Maximum length of a formatted error message in an [`ErrorRecord`].
const MAX_MESSAGE_LEN: usize = 512;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    UserError(#[from] UserError),
    #[error("internal: {0}.")]
    InternalError(#[from] InternalError),
    #[error(transparent)]
    IoError(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum UserError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unknown query operator `{0}`")]
    UnknownOperator(String),
    #[error("unknown update operator `{0}`")]
    UnknownUpdateOperator(String),
    #[error("collection `{0}` does not exist")]
    CollectionNotFound(String),
    #[error("no document with the requested key")]
    DocumentNotFound,
    #[error("index `{index}` does not exist on collection `{collection}`")]
    IndexNotFound { collection: String, index: String },
    #[error("{}", match .index {
        Some(index) => format!("duplicate key violates unique index \"{index}\""),
        None => "duplicate `_id` key".to_string(),
    })]
    DuplicateKey { index: Option<String> },
    #[error("unique constraint of index \"{index}\" violated during index maintenance")]
    IndexConstraint { index: String },
    #[error("maximum database size has been reached")]
    MaxDatabaseSizeReached,
    #[error("the write transaction accumulated too many dirty pages")]
    TransactionTooLarge,
    #[error("the memory map was resized; abort and retry")]
    MapResized,
    #[error("the database file is in an invalid state")]
    InvalidStoreFile,
    #[error("an environment is already opened at `{0}`")]
    EnvAlreadyOpened(PathBuf),
    #[error("database path `{0}` is not an existing directory")]
    InvalidPath(PathBuf),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("document failed the validator of collection `{0}`")]
    ValidationFailed(String),
    #[error("document `_id` of type {0} cannot be used as a primary key")]
    InvalidDocumentId(&'static str),
    #[error("maximum number of collections ({0}) reached")]
    MaxCollectionsReached(usize),
}

#[derive(Error, Debug)]
pub enum InternalError {
    #[error(transparent)]
    Store(MdbError),
    #[error("the key order of sub-tree `{0}` changed across opens")]
    TreeOrderChanged(String),
    #[error("missing `{key}` in the catalog sub-tree")]
    CatalogMissingEntry { key: String },
    #[error("stored index entry does not reference a live document")]
    DanglingIndexEntry,
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    BsonSerialization(#[from] bson::ser::Error),
    #[error(transparent)]
    BsonDeserialization(#[from] bson::de::Error),
}

impl From<terrier::Error> for Error {
    fn from(error: terrier::Error) -> Error {
        use self::Error::*;

        match error {
            terrier::Error::Io(e) => IoError(e),
            terrier::Error::Mdb(MdbError::MapFull) => UserError(self::UserError::MaxDatabaseSizeReached),
            terrier::Error::Mdb(MdbError::TxnFull) => UserError(self::UserError::TransactionTooLarge),
            terrier::Error::Mdb(MdbError::MapResized) => UserError(self::UserError::MapResized),
            terrier::Error::Mdb(MdbError::Invalid | MdbError::VersionMismatch | MdbError::Corrupted) => {
                UserError(self::UserError::InvalidStoreFile)
            }
            terrier::Error::Mdb(e) => InternalError(self::InternalError::Store(e)),
            terrier::Error::EnvAlreadyOpened(path) => UserError(self::UserError::EnvAlreadyOpened(path)),
            terrier::Error::InvalidPath(path) => UserError(self::UserError::InvalidPath(path)),
            terrier::Error::InvalidTreeName => {
                UserError(self::UserError::InvalidArgument("sub-tree names must not contain NUL bytes".into()))
            }
            terrier::Error::TreeOrderMismatch(name) => {
                InternalError(self::InternalError::TreeOrderChanged(name))
            }
            terrier::Error::LiveTransactions => UserError(self::UserError::InvalidState(
                "the operation requires that no transaction is live".into(),
            )),
        }
    }
}

/// Stable numeric codes of the error taxonomy, as exposed to hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    InvalidArgument = 101,
    NotFound = 102,
    DuplicateKey = 103,
    IndexConstraint = 104,
    MapFull = 105,
    TxnFull = 106,
    Io = 107,
    InvalidState = 108,
    OutOfMemory = 109,
    Internal = 110,
}

/// The uniform error record handed across the API boundary: stable code,
/// library tag, bounded human message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    pub code: i32,
    pub library: &'static str,
    pub message: String,
}

impl std::fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.library, self.message)
    }
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::IoError(_) => ErrorCode::Io,
            Error::InternalError(_) => ErrorCode::Internal,
            Error::UserError(e) => match e {
                UserError::InvalidArgument(_)
                | UserError::UnknownOperator(_)
                | UserError::UnknownUpdateOperator(_)
                | UserError::EnvAlreadyOpened(_)
                | UserError::InvalidPath(_)
                | UserError::InvalidStoreFile
                | UserError::ValidationFailed(_)
                | UserError::InvalidDocumentId(_)
                | UserError::MaxCollectionsReached(_) => ErrorCode::InvalidArgument,
                UserError::CollectionNotFound(_)
                | UserError::DocumentNotFound
                | UserError::IndexNotFound { .. } => ErrorCode::NotFound,
                UserError::DuplicateKey { .. } => ErrorCode::DuplicateKey,
                UserError::IndexConstraint { .. } => ErrorCode::IndexConstraint,
                UserError::MaxDatabaseSizeReached | UserError::MapResized => ErrorCode::MapFull,
                UserError::TransactionTooLarge => ErrorCode::TxnFull,
                UserError::InvalidState(_) => ErrorCode::InvalidState,
            },
        }
    }

    /// Whether aborting, optionally resizing the map, and retrying the whole
    /// transaction may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::UserError(
                UserError::MaxDatabaseSizeReached
                    | UserError::TransactionTooLarge
                    | UserError::MapResized
            )
        )
    }

    /// The uniform record for hosts: `(code, "taupe", message)`, message
    /// truncated at a fixed length.
    pub fn record(&self) -> ErrorRecord {
        let mut message = self.to_string();
        if message.len() > MAX_MESSAGE_LEN {
            let mut end = MAX_MESSAGE_LEN;
            while !message.is_char_boundary(end) {
                end -= 1;
            }
            message.truncate(end);
        }
        ErrorRecord { code: self.code() as i32, library: LIBRARY_TAG, message }
    }

    /// Exit status for command-line hosts.
    pub fn exit_status(&self) -> i32 {
        match self.code() {
            ErrorCode::Io => 1,
            ErrorCode::InvalidArgument => 2,
            _ => 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_key_message_mentions_the_index() {
        let err = Error::UserError(UserError::DuplicateKey { index: Some("name_1".into()) });
        assert!(err.to_string().contains("name_1"));
        assert_eq!(err.code(), ErrorCode::DuplicateKey);
        assert_eq!(err.record().code, 103);
        assert_eq!(err.record().library, "taupe");
    }

    #[test]
    fn recoverable_classes() {
        let map_full: Error = terrier::Error::Mdb(MdbError::MapFull).into();
        assert!(map_full.is_recoverable());
        assert_eq!(map_full.code(), ErrorCode::MapFull);

        let txn_full: Error = terrier::Error::Mdb(MdbError::TxnFull).into();
        assert!(txn_full.is_recoverable());

        let io: Error = terrier::Error::Io(io::Error::other("boom")).into();
        assert!(!io.is_recoverable());
        assert_eq!(io.exit_status(), 1);
    }

    #[test]
    fn record_truncates_long_messages() {
        let err = Error::UserError(UserError::InvalidArgument("x".repeat(2000)));
        assert!(err.record().message.len() <= 512);
        assert_eq!(err.exit_status(), 2);
    }
}
