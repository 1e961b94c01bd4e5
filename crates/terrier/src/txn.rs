use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::atomic::Ordering;

use crate::error::{mdb_result, Result};
use crate::mdb::ffi;
use crate::Env;

/// A read snapshot: observes the state committed when it began and ignores
/// later writes. Multiple read snapshots coexist with one writer.
///
/// Holds a clone of the [`Env`] handle, so an environment can never close
/// under a live snapshot. Movable across threads (the environment always
/// runs in the no-TLS reader regime), but single-owner.
pub struct RoTxn {
    txn: Option<NonNull<ffi::MDB_txn>>,
    pub(crate) env: Env,
}

unsafe impl Send for RoTxn {}

impl RoTxn {
    pub(crate) fn new(env: &Env) -> Result<RoTxn> {
        let mut txn: *mut ffi::MDB_txn = ptr::null_mut();
        unsafe {
            mdb_result(ffi::mdb_txn_begin(
                env.inner.env,
                ptr::null_mut(),
                ffi::MDB_RDONLY,
                &mut txn,
            ))?
        };
        env.inner.live_txns.fetch_add(1, Ordering::SeqCst);
        Ok(RoTxn { txn: NonNull::new(txn), env: env.clone() })
    }

    pub(crate) fn ptr(&self) -> *mut ffi::MDB_txn {
        // The option is only emptied by the consuming reset/commit paths.
        self.txn.map(NonNull::as_ptr).unwrap_or(ptr::null_mut())
    }

    /// The identifier of the committed state this snapshot observes.
    pub fn id(&self) -> u64 {
        unsafe { ffi::mdb_txn_id(self.ptr()) as u64 }
    }

    /// Releases the snapshot but keeps the transaction object for a cheap
    /// [`DormantRoTxn::renew`]. No read is possible until renewal; the type
    /// state makes that unrepresentable rather than a runtime error.
    pub fn reset(mut self) -> DormantRoTxn {
        let txn = self.txn.take().expect("live read transaction");
        unsafe { ffi::mdb_txn_reset(txn.as_ptr()) };
        self.env.inner.live_txns.fetch_sub(1, Ordering::SeqCst);
        DormantRoTxn { txn: Some(txn), env: self.env.clone() }
    }
}

impl Drop for RoTxn {
    fn drop(&mut self) {
        if let Some(txn) = self.txn.take() {
            unsafe { ffi::mdb_txn_abort(txn.as_ptr()) };
            self.env.inner.live_txns.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// A reset read transaction: holds no snapshot, costs no reader slot, and
/// can be renewed into a fresh [`RoTxn`] without reallocation.
pub struct DormantRoTxn {
    txn: Option<NonNull<ffi::MDB_txn>>,
    env: Env,
}

unsafe impl Send for DormantRoTxn {}

impl DormantRoTxn {
    /// Re-acquires a snapshot of the current committed state.
    pub fn renew(mut self) -> Result<RoTxn> {
        let txn = self.txn.take().expect("dormant read transaction");
        match unsafe { mdb_result(ffi::mdb_txn_renew(txn.as_ptr())) } {
            Ok(()) => {
                self.env.inner.live_txns.fetch_add(1, Ordering::SeqCst);
                Ok(RoTxn { txn: Some(txn), env: self.env.clone() })
            }
            Err(e) => {
                unsafe { ffi::mdb_txn_abort(txn.as_ptr()) };
                Err(e)
            }
        }
    }
}

impl Drop for DormantRoTxn {
    fn drop(&mut self) {
        if let Some(txn) = self.txn.take() {
            unsafe { ffi::mdb_txn_abort(txn.as_ptr()) };
        }
    }
}

/// The exclusive write transaction. Observes its own uncommitted mutations;
/// commit atomically publishes them, drop aborts. [`RwTxn::nested`] spawns a
/// child transaction that can commit into or be discarded from this one.
///
/// Derefs to [`RoTxn`] so every read API accepts it.
pub struct RwTxn<'p> {
    pub(crate) txn: RoTxn,
    /// Tied to the mutable borrow of the parent for nested transactions;
    /// also suppresses auto-`Send`: the writer lock must be released on the
    /// thread that acquired it.
    _parent: PhantomData<(&'p mut (), *mut ())>,
}

impl<'p> RwTxn<'p> {
    pub(crate) fn new(env: &Env) -> Result<RwTxn<'static>> {
        let mut txn: *mut ffi::MDB_txn = ptr::null_mut();
        unsafe { mdb_result(ffi::mdb_txn_begin(env.inner.env, ptr::null_mut(), 0, &mut txn))? };
        env.inner.live_txns.fetch_add(1, Ordering::SeqCst);
        Ok(RwTxn {
            txn: RoTxn { txn: NonNull::new(txn), env: env.clone() },
            _parent: PhantomData,
        })
    }

    /// Begins a nested write transaction. The parent is mutably borrowed for
    /// the child's lifetime: it observes parent uncommitted state, commit
    /// merges into the parent, abort leaves the parent untouched.
    pub fn nested(&mut self) -> Result<RwTxn<'_>> {
        let env = self.txn.env.clone();
        let mut txn: *mut ffi::MDB_txn = ptr::null_mut();
        unsafe { mdb_result(ffi::mdb_txn_begin(env.inner.env, self.txn.ptr(), 0, &mut txn))? };
        env.inner.live_txns.fetch_add(1, Ordering::SeqCst);
        Ok(RwTxn { txn: RoTxn { txn: NonNull::new(txn), env }, _parent: PhantomData })
    }

    pub fn commit(mut self) -> Result<()> {
        let txn = self.txn.txn.take().expect("live write transaction");
        self.txn.env.inner.live_txns.fetch_sub(1, Ordering::SeqCst);
        unsafe { mdb_result(ffi::mdb_txn_commit(txn.as_ptr())) }
    }

    /// Discards every mutation of this transaction. Never fails; dropping
    /// the transaction does the same.
    pub fn abort(self) {}
}

impl<'p> std::ops::Deref for RwTxn<'p> {
    type Target = RoTxn;

    fn deref(&self) -> &RoTxn {
        &self.txn
    }
}
