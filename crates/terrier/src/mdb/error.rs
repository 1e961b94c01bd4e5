use libc::c_int;
use thiserror::Error;

use super::ffi;

/// An error reported by the underlying B+-tree engine, one variant per
/// return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MdbError {
    /// The key/value pair already exists.
    #[error("key/data pair already exists")]
    KeyExist,
    /// The requested key was not found.
    #[error("no matching key/data pair found")]
    NotFound,
    #[error("requested page not found")]
    PageNotFound,
    #[error("data file is corrupted")]
    Corrupted,
    #[error("environment had a fatal error, must be shut down")]
    Panic,
    #[error("environment version mismatch")]
    VersionMismatch,
    #[error("file is not a valid data file")]
    Invalid,
    /// The memory map is full. Recoverable: abort, resize, retry.
    #[error("environment map size limit reached")]
    MapFull,
    #[error("environment sub-tree limit reached")]
    DbsFull,
    #[error("environment reader slots limit reached")]
    ReadersFull,
    #[error("thread-local storage keys exhausted")]
    TlsFull,
    /// Too many dirty pages in one write transaction. Recoverable after abort.
    #[error("transaction has too many dirty pages")]
    TxnFull,
    #[error("internal cursor stack limit reached")]
    CursorFull,
    #[error("internal page has no more room")]
    PageFull,
    /// The map was resized by another actor. Recoverable: abort, reopen, retry.
    #[error("map was resized beyond this environment's map size")]
    MapResized,
    #[error("operation and sub-tree are incompatible")]
    Incompatible,
    #[error("invalid reuse of a reader slot")]
    BadRslot,
    #[error("transaction must abort, has a child, or is invalid")]
    BadTxn,
    #[error("key or value size is unsupported")]
    BadValSize,
    #[error("sub-tree handle changed unexpectedly")]
    BadDbi,
    #[error("unknown storage error code {0}")]
    Other(i32),
}

impl MdbError {
    pub fn from_err_code(code: c_int) -> MdbError {
        match code {
            ffi::MDB_KEYEXIST => MdbError::KeyExist,
            ffi::MDB_NOTFOUND => MdbError::NotFound,
            ffi::MDB_PAGE_NOTFOUND => MdbError::PageNotFound,
            ffi::MDB_CORRUPTED => MdbError::Corrupted,
            ffi::MDB_PANIC => MdbError::Panic,
            ffi::MDB_VERSION_MISMATCH => MdbError::VersionMismatch,
            ffi::MDB_INVALID => MdbError::Invalid,
            ffi::MDB_MAP_FULL => MdbError::MapFull,
            ffi::MDB_DBS_FULL => MdbError::DbsFull,
            ffi::MDB_READERS_FULL => MdbError::ReadersFull,
            ffi::MDB_TLS_FULL => MdbError::TlsFull,
            ffi::MDB_TXN_FULL => MdbError::TxnFull,
            ffi::MDB_CURSOR_FULL => MdbError::CursorFull,
            ffi::MDB_PAGE_FULL => MdbError::PageFull,
            ffi::MDB_MAP_RESIZED => MdbError::MapResized,
            ffi::MDB_INCOMPATIBLE => MdbError::Incompatible,
            ffi::MDB_BAD_RSLOT => MdbError::BadRslot,
            ffi::MDB_BAD_TXN => MdbError::BadTxn,
            ffi::MDB_BAD_VALSIZE => MdbError::BadValSize,
            ffi::MDB_BAD_DBI => MdbError::BadDbi,
            other => MdbError::Other(other),
        }
    }

    /// Whether the caller is expected to abort, possibly grow the map, and
    /// retry the whole transaction.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, MdbError::MapFull | MdbError::TxnFull | MdbError::MapResized)
    }
}

/// Converts a raw return code into a result, mapping system error codes to
/// `io::Error` through the crate error type at the call sites.
pub fn mdb_result(code: c_int) -> Result<(), MdbError> {
    if code == 0 {
        Ok(())
    } else {
        Err(MdbError::from_err_code(code))
    }
}
