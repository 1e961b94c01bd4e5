use std::ops::Deref;

use tempfile::TempDir;

use crate::{Database, DatabaseOptions};

/// A database in a temporary directory, for tests.
pub(crate) struct TempDatabase {
    pub inner: Database,
    _tempdir: TempDir,
}

impl Deref for TempDatabase {
    type Target = Database;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl TempDatabase {
    pub fn new_with_options(options: DatabaseOptions) -> Self {
        let _tempdir = TempDir::new().unwrap();
        let inner = Database::open(_tempdir.path(), options).unwrap();
        Self { inner, _tempdir }
    }

    /// A database with a 40 MiB map, enough for most tests.
    pub fn new() -> Self {
        let options = DatabaseOptions { map_size: 40 * 1024 * 1024, ..Default::default() };
        Self::new_with_options(options)
    }
}
