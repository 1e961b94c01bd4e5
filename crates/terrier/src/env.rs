use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use crate::error::{mdb_result, Error, Result};
use crate::mdb::ffi;
use crate::tree::TreeOpenOptions;
use crate::txn::{RoTxn, RwTxn};

/// One environment per canonicalized path per process. Two live handles on
/// the same files would let both write meta pages independently.
static OPENED_ENVS: Lazy<Mutex<HashSet<PathBuf>>> = Lazy::new(|| Mutex::new(HashSet::new()));

bitflags::bitflags! {
    /// Environment I/O flags. The default regime syncs data and meta pages
    /// on every commit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EnvFlags: u32 {
        /// Don't fsync after commit; a crash may lose the last transactions
        /// but cannot corrupt committed state.
        const NO_SYNC = ffi::MDB_NOSYNC;
        /// Don't fsync the meta page after commit.
        const NO_META_SYNC = ffi::MDB_NOMETASYNC;
        /// Use a writable memory map.
        const WRITE_MAP = ffi::MDB_WRITEMAP;
        /// With `WRITE_MAP`, flush asynchronously.
        const MAP_ASYNC = ffi::MDB_MAPASYNC;
        /// Open the environment read-only.
        const READ_ONLY = ffi::MDB_RDONLY;
        /// Disable OS readahead; helps random-access loads larger than RAM.
        const NO_READ_AHEAD = ffi::MDB_NORDAHEAD;
        /// Don't zero-initialize malloc'd buffers before writing them out.
        const NO_MEM_INIT = ffi::MDB_NOMEMINIT;
    }
}

/// Builder for opening an [`Env`].
#[derive(Debug, Clone)]
pub struct EnvOpenOptions {
    map_size: usize,
    max_trees: u32,
    max_readers: u32,
    flags: EnvFlags,
}

impl Default for EnvOpenOptions {
    fn default() -> EnvOpenOptions {
        EnvOpenOptions {
            map_size: 1024 * 1024 * 1024,
            max_trees: 256,
            max_readers: 126,
            flags: EnvFlags::empty(),
        }
    }
}

impl EnvOpenOptions {
    pub fn new() -> EnvOpenOptions {
        EnvOpenOptions::default()
    }

    /// Virtual size of the memory map, in bytes. Also the hard bound on the
    /// total size of the data file.
    pub fn map_size(&mut self, size: usize) -> &mut Self {
        self.map_size = size;
        self
    }

    /// Maximum number of named sub-trees.
    pub fn max_trees(&mut self, trees: u32) -> &mut Self {
        self.max_trees = trees;
        self
    }

    /// Maximum number of simultaneous read snapshots.
    pub fn max_readers(&mut self, readers: u32) -> &mut Self {
        self.max_readers = readers;
        self
    }

    pub fn flags(&mut self, flags: EnvFlags) -> &mut Self {
        self.flags = flags;
        self
    }

    /// Opens (creating the data files if needed) the environment at `path`,
    /// which must be an existing directory.
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<Env> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Err(Error::InvalidPath(path.to_owned()));
        }
        let path = path.canonicalize()?;

        let mut opened = OPENED_ENVS.lock().unwrap();
        if opened.contains(&path) {
            return Err(Error::EnvAlreadyOpened(path));
        }

        let mut env: *mut ffi::MDB_env = ptr::null_mut();
        unsafe { mdb_result(ffi::mdb_env_create(&mut env))? };

        let result = (|| -> Result<()> {
            unsafe { mdb_result(ffi::mdb_env_set_mapsize(env, self.map_size))? };
            unsafe { mdb_result(ffi::mdb_env_set_maxdbs(env, self.max_trees))? };
            unsafe { mdb_result(ffi::mdb_env_set_maxreaders(env, self.max_readers))? };
            let c_path = CString::new(path.as_os_str().as_bytes())
                .map_err(|_| Error::InvalidPath(path.clone()))?;
            // NOTLS always: read snapshots must be movable across threads so
            // they can be pooled and reset/renewed.
            let flags = self.flags.bits() | ffi::MDB_NOTLS;
            unsafe { mdb_result(ffi::mdb_env_open(env, c_path.as_ptr(), flags, 0o600))? };
            Ok(())
        })();

        match result {
            Ok(()) => {
                opened.insert(path.clone());
                Ok(Env {
                    inner: Arc::new(EnvInner {
                        env,
                        path,
                        live_txns: AtomicUsize::new(0),
                        tree_orders: Mutex::new(HashMap::new()),
                    }),
                })
            }
            Err(e) => {
                unsafe { ffi::mdb_env_close(env) };
                Err(e)
            }
        }
    }
}

pub(crate) struct EnvInner {
    pub(crate) env: *mut ffi::MDB_env,
    pub(crate) path: PathBuf,
    /// Read and write transactions currently live on this environment;
    /// `resize` refuses to run while this is non-zero.
    pub(crate) live_txns: AtomicUsize,
    /// Key orders installed on named sub-trees during this process lifetime,
    /// used to reject re-opening a tree under a different order.
    pub(crate) tree_orders: Mutex<HashMap<String, TypeId>>,
}

unsafe impl Send for EnvInner {}
unsafe impl Sync for EnvInner {}

impl Drop for EnvInner {
    fn drop(&mut self) {
        // Transactions hold an `Env` clone, so reaching this point means no
        // transaction is live.
        let mut opened = OPENED_ENVS.lock().unwrap();
        opened.remove(&self.path);
        unsafe { ffi::mdb_env_close(self.env) };
    }
}

/// A handle to an opened environment. Cheap to clone; the files close when
/// the last clone (including the ones held by live transactions) drops.
#[derive(Clone)]
pub struct Env {
    pub(crate) inner: Arc<EnvInner>,
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Env").field("path", &self.inner.path).finish_non_exhaustive()
    }
}

impl Env {
    /// Begins a read snapshot of the last committed state.
    pub fn read_txn(&self) -> Result<RoTxn> {
        RoTxn::new(self)
    }

    /// Begins the exclusive write transaction; blocks while another write
    /// transaction is active. Beginning a second write transaction on the
    /// same thread deadlocks, as the engine's writer lock is not reentrant.
    pub fn write_txn(&self) -> Result<RwTxn<'static>> {
        RwTxn::new(self)
    }

    /// Options builder for opening or creating a named sub-tree.
    pub fn tree_options(&self) -> TreeOpenOptions<'_> {
        TreeOpenOptions::new(self)
    }

    /// Flushes buffered pages to disk. With `force`, performs a synchronous
    /// flush even under `NO_SYNC`/`MAP_ASYNC` regimes.
    pub fn sync(&self, force: bool) -> Result<()> {
        unsafe { mdb_result(ffi::mdb_env_sync(self.inner.env, force as libc::c_int)) }
    }

    /// Changes the virtual map size. Requires that no transaction is live on
    /// this environment.
    pub fn resize(&self, new_map_size: usize) -> Result<()> {
        if self.inner.live_txns.load(Ordering::SeqCst) != 0 {
            return Err(Error::LiveTransactions);
        }
        unsafe { mdb_result(ffi::mdb_env_set_mapsize(self.inner.env, new_map_size)) }
    }

    /// Statistics of the unnamed root sub-tree, which also carries the
    /// environment-wide page size.
    pub fn stat(&self) -> Result<Stat> {
        let mut stat = std::mem::MaybeUninit::uninit();
        unsafe { mdb_result(ffi::mdb_env_stat(self.inner.env, stat.as_mut_ptr()))? };
        Ok(Stat::from_ffi(unsafe { stat.assume_init() }))
    }

    pub fn info(&self) -> Result<EnvInfo> {
        let mut info = std::mem::MaybeUninit::uninit();
        unsafe { mdb_result(ffi::mdb_env_info(self.inner.env, info.as_mut_ptr()))? };
        let info: ffi::MDB_envinfo = unsafe { info.assume_init() };
        Ok(EnvInfo {
            map_size: info.me_mapsize,
            last_page_number: info.me_last_pgno,
            last_txn_id: info.me_last_txnid as u64,
            max_readers: info.me_maxreaders,
            num_readers: info.me_numreaders,
        })
    }

    /// Writes a consistent copy of the environment to `path`, optionally
    /// compacting free pages away.
    pub fn copy_to_path<P: AsRef<Path>>(&self, path: P, compact: bool) -> Result<()> {
        let c_path = CString::new(path.as_ref().as_os_str().as_bytes())
            .map_err(|_| Error::InvalidPath(path.as_ref().to_owned()))?;
        let flags = if compact { ffi::MDB_CP_COMPACT } else { 0 };
        unsafe { mdb_result(ffi::mdb_env_copy2(self.inner.env, c_path.as_ptr(), flags)) }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Number of transactions currently live on this environment.
    pub fn live_transactions(&self) -> usize {
        self.inner.live_txns.load(Ordering::SeqCst)
    }
}

/// B+-tree statistics for the environment or one sub-tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub page_size: u32,
    pub depth: u32,
    pub branch_pages: usize,
    pub leaf_pages: usize,
    pub overflow_pages: usize,
    pub entries: usize,
}

impl Stat {
    pub(crate) fn from_ffi(stat: ffi::MDB_stat) -> Stat {
        Stat {
            page_size: stat.ms_psize,
            depth: stat.ms_depth,
            branch_pages: stat.ms_branch_pages,
            leaf_pages: stat.ms_leaf_pages,
            overflow_pages: stat.ms_overflow_pages,
            entries: stat.ms_entries,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvInfo {
    pub map_size: usize,
    pub last_page_number: usize,
    pub last_txn_id: u64,
    pub max_readers: u32,
    pub num_readers: u32,
}
