//! The only module allowed to name raw LMDB symbols. Everything else in the
//! crate goes through these aliases, so a bindings bump touches one file.

use lmdb_master_sys as raw;

pub use raw::{
    mdb_cursor_close, mdb_cursor_del, mdb_cursor_get, mdb_cursor_open, mdb_dbi_open, mdb_del,
    mdb_drop, mdb_env_close, mdb_env_copy2, mdb_env_create, mdb_env_info, mdb_env_open,
    mdb_env_set_mapsize, mdb_env_set_maxdbs, mdb_env_set_maxreaders, mdb_env_stat, mdb_env_sync,
    mdb_get, mdb_put, mdb_set_compare, mdb_stat, mdb_txn_abort, mdb_txn_begin, mdb_txn_commit,
    mdb_txn_id, mdb_txn_renew, mdb_txn_reset, MDB_cursor, MDB_dbi, MDB_env, MDB_envinfo,
    MDB_stat, MDB_txn, MDB_val,
};

pub use raw::{
    MDB_BAD_DBI, MDB_BAD_RSLOT, MDB_BAD_TXN, MDB_BAD_VALSIZE, MDB_CORRUPTED, MDB_CURSOR_FULL,
    MDB_DBS_FULL, MDB_INCOMPATIBLE, MDB_INVALID, MDB_KEYEXIST, MDB_MAP_FULL, MDB_MAP_RESIZED,
    MDB_NOTFOUND, MDB_PAGE_FULL, MDB_PAGE_NOTFOUND, MDB_PANIC, MDB_READERS_FULL, MDB_TLS_FULL,
    MDB_TXN_FULL, MDB_VERSION_MISMATCH,
};

pub use raw::{
    MDB_CP_COMPACT, MDB_CREATE, MDB_DUPSORT, MDB_MAPASYNC, MDB_NODUPDATA, MDB_NOMEMINIT,
    MDB_NOMETASYNC, MDB_NOOVERWRITE, MDB_NORDAHEAD, MDB_NOSYNC, MDB_NOTLS, MDB_RDONLY,
    MDB_REVERSEKEY, MDB_WRITEMAP,
};

/// Cursor positioning operations, gathered under one roof like heed does.
pub mod cursor_op {
    use super::raw::{self, MDB_cursor_op};

    pub const MDB_FIRST: MDB_cursor_op = raw::MDB_FIRST;
    pub const MDB_GET_CURRENT: MDB_cursor_op = raw::MDB_GET_CURRENT;
    pub const MDB_LAST: MDB_cursor_op = raw::MDB_LAST;
    pub const MDB_NEXT: MDB_cursor_op = raw::MDB_NEXT;
    pub const MDB_NEXT_DUP: MDB_cursor_op = raw::MDB_NEXT_DUP;
    pub const MDB_PREV: MDB_cursor_op = raw::MDB_PREV;
    pub const MDB_SET_KEY: MDB_cursor_op = raw::MDB_SET_KEY;
    pub const MDB_SET_RANGE: MDB_cursor_op = raw::MDB_SET_RANGE;
}

/// Wraps a byte slice into an `MDB_val` for the duration of a call.
pub fn to_val(bytes: &[u8]) -> MDB_val {
    MDB_val { mv_size: bytes.len(), mv_data: bytes.as_ptr() as *mut libc::c_void }
}

/// An `MDB_val` whose content will be written by LMDB.
pub fn out_val() -> MDB_val {
    MDB_val { mv_size: 0, mv_data: std::ptr::null_mut() }
}

/// Reinterprets an `MDB_val` filled by LMDB as a byte slice.
///
/// # Safety
///
/// The caller must bound the returned lifetime by the transaction the value
/// was read under; the slice points into the memory map.
pub unsafe fn from_val<'a>(val: MDB_val) -> &'a [u8] {
    if val.mv_size == 0 {
        &[]
    } else {
        std::slice::from_raw_parts(val.mv_data as *const u8, val.mv_size)
    }
}
