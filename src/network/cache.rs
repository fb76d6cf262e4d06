//! Replies awaited by wallet-style queries
//!
//! `Send*` messages land here; a query sends its `Get*` request and then
//! blocks on the cache until the matching reply arrives or the wait times
//! out.

use crate::core::{Block, TxOutPoint, UnspentTxOut};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Longest wait for a reply
pub const MAX_MSG_AWAIT_TIME_SECS: u64 = 60;

#[derive(Debug, Default)]
struct Slots {
    active_chain: Option<Vec<Block>>,
    mempool: Option<Vec<String>>,
    utxos: Option<Vec<(TxOutPoint, UnspentTxOut)>>,
}

/// Latest reply of each kind
#[derive(Debug)]
pub struct MsgCache {
    slots: Mutex<Slots>,
    arrived: Condvar,
    timeout: Duration,
}

impl Default for MsgCache {
    fn default() -> Self {
        Self::with_timeout(Duration::from_secs(MAX_MSG_AWAIT_TIME_SECS))
    }
}

impl MsgCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            slots: Mutex::new(Slots::default()),
            arrived: Condvar::new(),
            timeout,
        }
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn store(&self, fill: impl FnOnce(&mut Slots)) {
        fill(&mut self.slots());
        self.arrived.notify_all();
    }

    /// Take a reply, waiting up to the timeout for one to arrive
    fn take<T>(&self, slot: impl Fn(&mut Slots) -> &mut Option<T>) -> Option<T> {
        let guard = self.slots();
        let (mut guard, _) = self
            .arrived
            .wait_timeout_while(guard, self.timeout, |slots| slot(slots).is_none())
            .unwrap_or_else(PoisonError::into_inner);
        slot(&mut guard).take()
    }

    pub fn store_active_chain(&self, blocks: Vec<Block>) {
        self.store(|slots| slots.active_chain = Some(blocks));
    }

    pub fn store_mempool(&self, tx_ids: Vec<String>) {
        self.store(|slots| slots.mempool = Some(tx_ids));
    }

    pub fn store_utxos(&self, utxos: Vec<(TxOutPoint, UnspentTxOut)>) {
        self.store(|slots| slots.utxos = Some(utxos));
    }

    /// Drop stale replies before sending a new request
    pub fn clear(&self) {
        *self.slots() = Slots::default();
    }

    pub fn take_active_chain(&self) -> Option<Vec<Block>> {
        self.take(|slots| &mut slots.active_chain)
    }

    pub fn take_mempool(&self) -> Option<Vec<String>> {
        self.take(|slots| &mut slots.mempool)
    }

    pub fn take_utxos(&self) -> Option<Vec<(TxOutPoint, UnspentTxOut)>> {
        self.take(|slots| &mut slots.utxos)
    }
}
