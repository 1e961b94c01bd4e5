use std::any::TypeId;
use std::ffi::CString;
use std::ptr;

use libc::c_int;

use crate::comparator::{compare_trampoline, KeyOrder};
use crate::cursor::{OwningCursor, RoCursor, RwCursor};
use crate::env::Stat;
use crate::error::{mdb_result, Error, MdbError, Result};
use crate::mdb::ffi;
use crate::txn::{RoTxn, RwTxn};
use crate::Env;

bitflags::bitflags! {
    /// Flags declared when a sub-tree is opened.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TreeFlags: u32 {
        /// Allow duplicate keys; duplicates are kept sorted by value.
        const MULTI_VALUE = ffi::MDB_DUPSORT;
        /// Compare keys as reversed byte strings.
        const REVERSE_KEY = ffi::MDB_REVERSEKEY;
    }
}

#[derive(Clone, Copy)]
struct OrderSpec {
    type_id: TypeId,
    cmp: unsafe extern "C" fn(*const ffi::MDB_val, *const ffi::MDB_val) -> c_int,
}

/// Builder for opening or creating a named sub-tree, in the spirit of the
/// environment open options.
pub struct TreeOpenOptions<'e> {
    env: &'e Env,
    name: Option<String>,
    flags: TreeFlags,
    order: Option<OrderSpec>,
}

impl<'e> TreeOpenOptions<'e> {
    pub(crate) fn new(env: &'e Env) -> TreeOpenOptions<'e> {
        TreeOpenOptions { env, name: None, flags: TreeFlags::empty(), order: None }
    }

    /// Names the sub-tree. Without a name the unnamed root tree is opened.
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_owned());
        self
    }

    pub fn flags(mut self, flags: TreeFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Installs a custom total order over keys. Must be passed identically
    /// at every open of this sub-tree; within one process, opening an
    /// already-ordered tree under a different order type is rejected.
    pub fn key_order<O: KeyOrder + 'static>(mut self) -> Self {
        self.order = Some(OrderSpec { type_id: TypeId::of::<O>(), cmp: compare_trampoline::<O> });
        self
    }

    /// Opens the sub-tree, creating it if absent. Requires a write
    /// transaction; the creation is part of that transaction.
    pub fn create(&self, wtxn: &mut RwTxn<'_>) -> Result<Tree> {
        match self.open_raw(wtxn.ptr(), true)? {
            Some(tree) => Ok(tree),
            None => Err(Error::Mdb(MdbError::NotFound)),
        }
    }

    /// Opens the sub-tree if it exists.
    pub fn open(&self, txn: &RoTxn) -> Result<Option<Tree>> {
        self.open_raw(txn.ptr(), false)
    }

    fn open_raw(&self, txn: *mut ffi::MDB_txn, create: bool) -> Result<Option<Tree>> {
        let c_name = match &self.name {
            Some(name) => {
                Some(CString::new(name.as_bytes()).map_err(|_| Error::InvalidTreeName)?)
            }
            None => None,
        };

        if let (Some(name), Some(order)) = (&self.name, &self.order) {
            let mut orders = self.env.inner.tree_orders.lock().unwrap();
            match orders.get(name) {
                Some(installed) if *installed != order.type_id => {
                    return Err(Error::TreeOrderMismatch(name.clone()));
                }
                _ => {
                    orders.insert(name.clone(), order.type_id);
                }
            }
        }

        let mut dbi: ffi::MDB_dbi = 0;
        let flags = self.flags.bits() | if create { ffi::MDB_CREATE } else { 0 };
        let name_ptr = c_name.as_ref().map_or(ptr::null(), |n| n.as_ptr());
        let code = unsafe { ffi::mdb_dbi_open(txn, name_ptr, flags, &mut dbi) };
        match crate::mdb::error::mdb_result(code) {
            Ok(()) => {}
            Err(MdbError::NotFound) if !create => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        if let Some(order) = &self.order {
            unsafe { mdb_result(ffi::mdb_set_compare(txn, dbi, Some(order.cmp)))? };
        }

        Ok(Some(Tree { dbi, multi_value: self.flags.contains(TreeFlags::MULTI_VALUE) }))
    }
}

/// A named, ordered sub-tree of opaque byte-string keys and values.
/// The handle is shareable across transactions of its environment.
#[derive(Debug, Clone, Copy)]
pub struct Tree {
    pub(crate) dbi: ffi::MDB_dbi,
    pub(crate) multi_value: bool,
}

impl Tree {
    /// Returns the value of `key`, a zero-copy slice valid for the lifetime
    /// of the transaction borrow. For multi-value trees this is the first
    /// duplicate in value order.
    pub fn get<'t>(&self, txn: &'t RoTxn, key: &[u8]) -> Result<Option<&'t [u8]>> {
        let mut key_val = ffi::to_val(key);
        let mut data_val = ffi::out_val();
        let code = unsafe { ffi::mdb_get(txn.ptr(), self.dbi, &mut key_val, &mut data_val) };
        match crate::mdb::error::mdb_result(code) {
            Ok(()) => Ok(Some(unsafe { ffi::from_val(data_val) })),
            Err(MdbError::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Inserts `key → data`, overwriting an existing entry (for multi-value
    /// trees, adding a duplicate instead).
    pub fn put(&self, txn: &mut RwTxn<'_>, key: &[u8], data: &[u8]) -> Result<()> {
        self.put_with_flags(txn, key, data, 0)
    }

    /// Inserts `key → data`, failing with `KeyExist` if the key is present.
    pub fn put_no_overwrite(&self, txn: &mut RwTxn<'_>, key: &[u8], data: &[u8]) -> Result<()> {
        self.put_with_flags(txn, key, data, ffi::MDB_NOOVERWRITE)
    }

    fn put_with_flags(
        &self,
        txn: &mut RwTxn<'_>,
        key: &[u8],
        data: &[u8],
        flags: u32,
    ) -> Result<()> {
        let mut key_val = ffi::to_val(key);
        let mut data_val = ffi::to_val(data);
        unsafe {
            mdb_result(ffi::mdb_put(txn.ptr(), self.dbi, &mut key_val, &mut data_val, flags))
        }
    }

    /// Deletes `key` (every duplicate for multi-value trees). Absence is not
    /// an error: returns whether an entry was removed.
    pub fn delete(&self, txn: &mut RwTxn<'_>, key: &[u8]) -> Result<bool> {
        let mut key_val = ffi::to_val(key);
        let code =
            unsafe { ffi::mdb_del(txn.ptr(), self.dbi, &mut key_val, ptr::null_mut()) };
        match crate::mdb::error::mdb_result(code) {
            Ok(()) => Ok(true),
            Err(MdbError::NotFound) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes one specific `key → data` duplicate of a multi-value tree.
    pub fn delete_one_value(&self, txn: &mut RwTxn<'_>, key: &[u8], data: &[u8]) -> Result<bool> {
        let mut key_val = ffi::to_val(key);
        let mut data_val = ffi::to_val(data);
        let code = unsafe { ffi::mdb_del(txn.ptr(), self.dbi, &mut key_val, &mut data_val) };
        match crate::mdb::error::mdb_result(code) {
            Ok(()) => Ok(true),
            Err(MdbError::NotFound) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes every entry, keeping the sub-tree itself.
    pub fn clear(&self, txn: &mut RwTxn<'_>) -> Result<()> {
        unsafe { mdb_result(ffi::mdb_drop(txn.ptr(), self.dbi, 0)) }
    }

    /// Deletes the sub-tree and its name from the environment. The recorded
    /// key order of the name, if any, stays pinned for the process lifetime.
    pub fn destroy(self, txn: &mut RwTxn<'_>) -> Result<()> {
        unsafe { mdb_result(ffi::mdb_drop(txn.ptr(), self.dbi, 1)) }
    }

    /// Number of live entries, read from the B+-tree page headers in O(1)
    /// and consistent with the transaction's snapshot.
    pub fn len(&self, txn: &RoTxn) -> Result<u64> {
        self.stat(txn).map(|stat| stat.entries as u64)
    }

    pub fn is_empty(&self, txn: &RoTxn) -> Result<bool> {
        self.len(txn).map(|len| len == 0)
    }

    pub fn stat(&self, txn: &RoTxn) -> Result<Stat> {
        let mut stat = std::mem::MaybeUninit::uninit();
        unsafe { mdb_result(ffi::mdb_stat(txn.ptr(), self.dbi, stat.as_mut_ptr()))? };
        Ok(Stat::from_ffi(unsafe { stat.assume_init() }))
    }

    /// First entry in key order.
    pub fn first<'t>(&self, txn: &'t RoTxn) -> Result<Option<(&'t [u8], &'t [u8])>> {
        self.ro_cursor(txn)?.move_on_first()
    }

    /// Last entry in key order.
    pub fn last<'t>(&self, txn: &'t RoTxn) -> Result<Option<(&'t [u8], &'t [u8])>> {
        self.ro_cursor(txn)?.move_on_last()
    }

    pub fn ro_cursor<'t>(&self, txn: &'t RoTxn) -> Result<RoCursor<'t>> {
        RoCursor::new(txn, self.dbi)
    }

    pub fn rw_cursor<'t>(&self, txn: &'t mut RwTxn<'_>) -> Result<RwCursor<'t>> {
        RwCursor::new(txn, self.dbi)
    }

    /// A cursor bundled with the read transaction it iterates under, for
    /// consumers that outlive the current scope (query cursors).
    pub fn owning_cursor(&self, txn: RoTxn) -> Result<OwningCursor> {
        OwningCursor::new(txn, self.dbi)
    }
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use super::*;
    use crate::EnvOpenOptions;

    fn tmp_env() -> (tempfile::TempDir, Env) {
        let dir = tempfile::tempdir().unwrap();
        let env = EnvOpenOptions::new().map_size(10 * 1024 * 1024).open(dir.path()).unwrap();
        (dir, env)
    }

    #[test]
    fn put_get_delete_roundtrip() {
        let (_dir, env) = tmp_env();
        let mut wtxn = env.write_txn().unwrap();
        let tree = env.tree_options().name("t").create(&mut wtxn).unwrap();

        tree.put(&mut wtxn, b"hello", b"world").unwrap();
        assert_eq!(tree.get(&wtxn, b"hello").unwrap(), Some(&b"world"[..]));
        assert_eq!(tree.len(&wtxn).unwrap(), 1);

        assert!(tree.delete(&mut wtxn, b"hello").unwrap());
        assert!(!tree.delete(&mut wtxn, b"hello").unwrap());
        assert_eq!(tree.len(&wtxn).unwrap(), 0);
        wtxn.commit().unwrap();
    }

    #[test]
    fn multi_value_duplicates() {
        let (_dir, env) = tmp_env();
        let mut wtxn = env.write_txn().unwrap();
        let tree = env
            .tree_options()
            .name("dups")
            .flags(TreeFlags::MULTI_VALUE)
            .create(&mut wtxn)
            .unwrap();

        tree.put(&mut wtxn, b"k", b"a").unwrap();
        tree.put(&mut wtxn, b"k", b"b").unwrap();
        tree.put(&mut wtxn, b"k", b"c").unwrap();
        assert_eq!(tree.len(&wtxn).unwrap(), 3);

        assert!(tree.delete_one_value(&mut wtxn, b"k", b"b").unwrap());
        assert!(!tree.delete_one_value(&mut wtxn, b"k", b"b").unwrap());
        assert_eq!(tree.len(&wtxn).unwrap(), 2);

        // Deleting the key removes the remaining duplicates at once.
        assert!(tree.delete(&mut wtxn, b"k").unwrap());
        assert_eq!(tree.len(&wtxn).unwrap(), 0);
        wtxn.abort();
    }

    enum EvenOddOrder {}

    impl KeyOrder for EvenOddOrder {
        // Even-length keys before odd-length keys, lexicographic within.
        fn compare(a: &[u8], b: &[u8]) -> Ordering {
            (a.len() % 2).cmp(&(b.len() % 2)).then_with(|| a.cmp(b))
        }
    }

    #[test]
    fn custom_key_order_is_applied_and_pinned() {
        let (_dir, env) = tmp_env();
        let mut wtxn = env.write_txn().unwrap();
        let tree = env
            .tree_options()
            .name("ordered")
            .key_order::<EvenOddOrder>()
            .create(&mut wtxn)
            .unwrap();

        tree.put(&mut wtxn, b"abc", b"").unwrap();
        tree.put(&mut wtxn, b"ab", b"").unwrap();
        tree.put(&mut wtxn, b"a", b"").unwrap();
        assert_eq!(tree.first(&wtxn).unwrap().map(|(k, _)| k), Some(&b"ab"[..]));
        wtxn.commit().unwrap();

        // Re-opening under another order type is rejected.
        let mut wtxn = env.write_txn().unwrap();
        let err = env
            .tree_options()
            .name("ordered")
            .key_order::<crate::comparator::LexicographicOrder>()
            .create(&mut wtxn)
            .unwrap_err();
        assert!(matches!(err, Error::TreeOrderMismatch(_)));
        wtxn.abort();
    }

    #[test]
    fn open_absent_tree_returns_none() {
        let (_dir, env) = tmp_env();
        let rtxn = env.read_txn().unwrap();
        assert!(env.tree_options().name("missing").open(&rtxn).unwrap().is_none());
    }
}
