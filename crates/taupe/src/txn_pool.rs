//! A small pool of idle read transactions. Beginning a snapshot allocates a
//! reader slot and a transaction object; reset/renew recycles both, so point
//! reads borrow a pooled transaction instead of paying the setup cost.

use std::sync::Mutex;

use terrier::{DormantRoTxn, Env, RoTxn};

use crate::Result;

pub(crate) struct TxnPool {
    env: Env,
    capacity: usize,
    idle: Mutex<Vec<DormantRoTxn>>,
}

impl TxnPool {
    pub(crate) fn new(env: Env, capacity: usize) -> TxnPool {
        TxnPool { env, capacity, idle: Mutex::new(Vec::new()) }
    }

    /// A snapshot of the current committed state: a renewed pooled
    /// transaction when one is idle, a fresh one otherwise.
    pub(crate) fn take(&self) -> Result<RoTxn> {
        let dormant = self.idle.lock().unwrap().pop();
        match dormant {
            Some(dormant) => match dormant.renew() {
                Ok(txn) => Ok(txn),
                // A failed renewal consumed the object; fall back to fresh.
                Err(_) => Ok(self.env.read_txn()?),
            },
            None => Ok(self.env.read_txn()?),
        }
    }

    /// Releases a snapshot back to the pool, dropping it when full.
    pub(crate) fn give(&self, txn: RoTxn) {
        let dormant = txn.reset();
        let mut idle = self.idle.lock().unwrap();
        if idle.len() < self.capacity {
            idle.push(dormant);
        }
    }
}
