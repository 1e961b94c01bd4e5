use std::io;
use std::path::PathBuf;

use libc::c_int;
use thiserror::Error;

pub use crate::mdb::error::MdbError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Mdb(MdbError),
    #[error("environment path `{0}` is not an existing directory")]
    InvalidPath(PathBuf),
    #[error("an environment is already opened at `{0}`")]
    EnvAlreadyOpened(PathBuf),
    #[error("sub-tree `{0}` is already open with a different key order")]
    TreeOrderMismatch(String),
    #[error("sub-tree names must not contain NUL bytes")]
    InvalidTreeName,
    #[error("the operation requires that no transaction is live on the environment")]
    LiveTransactions,
}

impl Error {
    /// `MapFull`, `TxnFull` and `MapResized` are contract-level recoverable:
    /// abort the transaction, optionally resize, retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Mdb(e) if e.is_recoverable())
    }
}

impl From<MdbError> for Error {
    fn from(e: MdbError) -> Error {
        // LMDB surfaces OS failures as raw errno values.
        match e {
            MdbError::Other(code) => Error::Io(io::Error::from_raw_os_error(code)),
            _ => Error::Mdb(e),
        }
    }
}

/// Converts a raw return code, routing system errno values to `Io`.
pub(crate) fn mdb_result(code: c_int) -> Result<()> {
    crate::mdb::error::mdb_result(code).map_err(Error::from)
}
