//! A transactional, ordered key/value store over a memory-mapped
//! copy-on-write B+-tree environment.
//!
//! An [`Env`] maps a database directory into the process address space and
//! exposes named sub-trees ([`Tree`]) of opaque byte-string keys and values.
//! Readers take MVCC snapshots ([`RoTxn`]) and no locks; writers serialize
//! behind one exclusive [`RwTxn`] whose commit atomically swaps the root
//! pointer, so readers always observe either the pre- or post-transaction
//! tree. Write transactions nest; reads are zero-copy slices bounded by
//! their transaction's lifetime.
//!
//! Multi-process access to one directory is unsupported.

mod comparator;
mod cursor;
mod env;
mod error;
mod mdb;
mod tree;
mod txn;

pub use self::comparator::{KeyOrder, LexicographicOrder};
pub use self::cursor::{OwningCursor, RoCursor, RwCursor};
pub use self::env::{Env, EnvFlags, EnvInfo, EnvOpenOptions, Stat};
pub use self::error::{Error, MdbError, Result};
pub use self::tree::{Tree, TreeFlags, TreeOpenOptions};
pub use self::txn::{DormantRoTxn, RoTxn, RwTxn};
