use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ptr::{self, NonNull};

use crate::error::{mdb_result, MdbError, Result};
use crate::mdb::ffi::{self, cursor_op};
use crate::txn::{RoTxn, RwTxn};

/// Positions the cursor and reinterprets the result.
///
/// # Safety
///
/// The caller chooses `'a`; it must not outlive the transaction the cursor
/// was opened under.
unsafe fn raw_cursor_get<'a>(
    cursor: *mut ffi::MDB_cursor,
    key: Option<&[u8]>,
    op: u32,
) -> Result<Option<(&'a [u8], &'a [u8])>> {
    let mut key_val = match key {
        Some(key) => ffi::to_val(key),
        None => ffi::out_val(),
    };
    let mut data_val = ffi::out_val();
    let code = unsafe { ffi::mdb_cursor_get(cursor, &mut key_val, &mut data_val, op) };
    match crate::mdb::error::mdb_result(code) {
        Ok(()) => Ok(Some(unsafe { (ffi::from_val(key_val), ffi::from_val(data_val)) })),
        Err(MdbError::NotFound) => Ok(None),
        // An unpositioned cursor reports EINVAL on GET_CURRENT.
        Err(MdbError::Other(code)) if code == libc::EINVAL => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn open_cursor(txn: *mut ffi::MDB_txn, dbi: ffi::MDB_dbi) -> Result<NonNull<ffi::MDB_cursor>> {
    let mut cursor: *mut ffi::MDB_cursor = ptr::null_mut();
    unsafe { mdb_result(ffi::mdb_cursor_open(txn, dbi, &mut cursor))? };
    Ok(NonNull::new(cursor).expect("non-null cursor"))
}

/// A read cursor over one sub-tree, bounded by its transaction's lifetime.
/// Every returned slice is zero-copy into the memory map and lives as long
/// as the transaction borrow.
pub struct RoCursor<'t> {
    cursor: NonNull<ffi::MDB_cursor>,
    _marker: PhantomData<&'t ()>,
}

impl<'t> RoCursor<'t> {
    pub(crate) fn new(txn: &'t RoTxn, dbi: ffi::MDB_dbi) -> Result<RoCursor<'t>> {
        Ok(RoCursor { cursor: open_cursor(txn.ptr(), dbi)?, _marker: PhantomData })
    }

    pub fn move_on_first(&mut self) -> Result<Option<(&'t [u8], &'t [u8])>> {
        unsafe { raw_cursor_get(self.cursor.as_ptr(), None, cursor_op::MDB_FIRST) }
    }

    pub fn move_on_last(&mut self) -> Result<Option<(&'t [u8], &'t [u8])>> {
        unsafe { raw_cursor_get(self.cursor.as_ptr(), None, cursor_op::MDB_LAST) }
    }

    /// Positions on `key` exactly, or returns `None`.
    pub fn move_on_key(&mut self, key: &[u8]) -> Result<Option<(&'t [u8], &'t [u8])>> {
        unsafe { raw_cursor_get(self.cursor.as_ptr(), Some(key), cursor_op::MDB_SET_KEY) }
    }

    /// Positions on the first entry with key `>= key`.
    pub fn move_on_key_ge(&mut self, key: &[u8]) -> Result<Option<(&'t [u8], &'t [u8])>> {
        unsafe { raw_cursor_get(self.cursor.as_ptr(), Some(key), cursor_op::MDB_SET_RANGE) }
    }

    pub fn move_on_next(&mut self) -> Result<Option<(&'t [u8], &'t [u8])>> {
        unsafe { raw_cursor_get(self.cursor.as_ptr(), None, cursor_op::MDB_NEXT) }
    }

    /// Next duplicate of the current key of a multi-value tree.
    pub fn move_on_next_dup(&mut self) -> Result<Option<(&'t [u8], &'t [u8])>> {
        unsafe { raw_cursor_get(self.cursor.as_ptr(), None, cursor_op::MDB_NEXT_DUP) }
    }

    pub fn move_on_prev(&mut self) -> Result<Option<(&'t [u8], &'t [u8])>> {
        unsafe { raw_cursor_get(self.cursor.as_ptr(), None, cursor_op::MDB_PREV) }
    }

    /// The entry under the cursor, `None` if unpositioned or past the end.
    pub fn current(&mut self) -> Result<Option<(&'t [u8], &'t [u8])>> {
        unsafe { raw_cursor_get(self.cursor.as_ptr(), None, cursor_op::MDB_GET_CURRENT) }
    }
}

impl Drop for RoCursor<'_> {
    fn drop(&mut self) {
        unsafe { ffi::mdb_cursor_close(self.cursor.as_ptr()) }
    }
}

/// A cursor over one sub-tree within a write transaction; adds deletion.
pub struct RwCursor<'t> {
    inner: RoCursor<'t>,
}

impl<'t> RwCursor<'t> {
    pub(crate) fn new(txn: &'t mut RwTxn<'_>, dbi: ffi::MDB_dbi) -> Result<RwCursor<'t>> {
        Ok(RwCursor {
            inner: RoCursor { cursor: open_cursor(txn.ptr(), dbi)?, _marker: PhantomData },
        })
    }

    /// Deletes the entry under the cursor; the cursor then rests on the
    /// following entry, or becomes unpositioned at the end of the tree.
    pub fn delete_current(&mut self) -> Result<()> {
        unsafe { mdb_result(ffi::mdb_cursor_del(self.inner.cursor.as_ptr(), 0)) }
    }
}

impl<'t> std::ops::Deref for RwCursor<'t> {
    type Target = RoCursor<'t>;

    fn deref(&self) -> &RoCursor<'t> {
        &self.inner
    }
}

impl<'t> std::ops::DerefMut for RwCursor<'t> {
    fn deref_mut(&mut self) -> &mut RoCursor<'t> {
        &mut self.inner
    }
}

/// A cursor that owns the read transaction it iterates under, for long-lived
/// consumers. Returned slices borrow from `self`, which pins the snapshot.
///
/// The transaction object lives on the engine's heap; moving this wrapper
/// does not move it, so the raw cursor stays valid for the wrapper's life.
pub struct OwningCursor {
    cursor: NonNull<ffi::MDB_cursor>,
    txn: ManuallyDrop<RoTxn>,
}

unsafe impl Send for OwningCursor {}

impl OwningCursor {
    pub(crate) fn new(txn: RoTxn, dbi: ffi::MDB_dbi) -> Result<OwningCursor> {
        let cursor = open_cursor(txn.ptr(), dbi)?;
        Ok(OwningCursor { cursor, txn: ManuallyDrop::new(txn) })
    }

    pub fn txn(&self) -> &RoTxn {
        &self.txn
    }

    pub fn move_on_first(&mut self) -> Result<Option<(&[u8], &[u8])>> {
        unsafe { raw_cursor_get(self.cursor.as_ptr(), None, cursor_op::MDB_FIRST) }
    }

    pub fn move_on_key(&mut self, key: &[u8]) -> Result<Option<(&[u8], &[u8])>> {
        unsafe { raw_cursor_get(self.cursor.as_ptr(), Some(key), cursor_op::MDB_SET_KEY) }
    }

    pub fn move_on_key_ge(&mut self, key: &[u8]) -> Result<Option<(&[u8], &[u8])>> {
        unsafe { raw_cursor_get(self.cursor.as_ptr(), Some(key), cursor_op::MDB_SET_RANGE) }
    }

    pub fn move_on_next(&mut self) -> Result<Option<(&[u8], &[u8])>> {
        unsafe { raw_cursor_get(self.cursor.as_ptr(), None, cursor_op::MDB_NEXT) }
    }

    pub fn move_on_next_dup(&mut self) -> Result<Option<(&[u8], &[u8])>> {
        unsafe { raw_cursor_get(self.cursor.as_ptr(), None, cursor_op::MDB_NEXT_DUP) }
    }

    /// Closes the cursor and hands the read transaction back, typically to a
    /// transaction pool.
    pub fn into_txn(mut self) -> RoTxn {
        unsafe { ffi::mdb_cursor_close(self.cursor.as_ptr()) };
        let txn = unsafe { ManuallyDrop::take(&mut self.txn) };
        std::mem::forget(self);
        txn
    }
}

impl Drop for OwningCursor {
    fn drop(&mut self) {
        unsafe {
            ffi::mdb_cursor_close(self.cursor.as_ptr());
            ManuallyDrop::drop(&mut self.txn);
        }
    }
}
