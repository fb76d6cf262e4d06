//! Shared ledger state
//!
//! The chain, mempool and UTXO index each sit behind their own mutex. Any
//! operation touching more than one takes them together through
//! [`LedgerState::lock`], always in the order chain, mempool, UTXO index.

use crate::core::block::Block;
use crate::core::chain::ChainState;
use crate::core::params::ChainParams;
use crate::core::transaction::Tx;
use crate::core::utxo::UtxoSet;
use crate::mining::mempool::{Mempool, MempoolAdmission, MempoolPolicy};
use log::info;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Chain, mempool and UTXO index of one node
pub struct LedgerState {
    params: ChainParams,
    chain: Mutex<ChainState>,
    mempool: Mutex<Mempool>,
    utxos: Mutex<UtxoSet>,
    /// Set whenever the active tip changes; polled by mining workers
    mine_interrupt: AtomicBool,
    initial_sync_complete: AtomicBool,
}

/// All three ledger locks, held for the duration of one operation
pub struct LedgerGuard<'a> {
    pub(crate) params: &'a ChainParams,
    pub(crate) chain: MutexGuard<'a, ChainState>,
    pub(crate) mempool: MutexGuard<'a, Mempool>,
    pub(crate) utxos: MutexGuard<'a, UtxoSet>,
    pub(crate) interrupt: &'a AtomicBool,
}

impl LedgerState {
    pub fn new(params: ChainParams) -> Self {
        Self::with_mempool_policy(params, MempoolPolicy::default())
    }

    pub fn with_mempool_policy(params: ChainParams, policy: MempoolPolicy) -> Self {
        let genesis = Block::genesis(&params);
        let mut utxos = UtxoSet::new();
        seed_genesis_outputs(&genesis, &mut utxos);

        Self {
            params,
            chain: Mutex::new(ChainState::new(genesis)),
            mempool: Mutex::new(Mempool::with_policy(policy)),
            utxos: Mutex::new(utxos),
            mine_interrupt: AtomicBool::new(false),
            initial_sync_complete: AtomicBool::new(false),
        }
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    /// Acquire chain, mempool and UTXO locks in order
    pub fn lock(&self) -> LedgerGuard<'_> {
        let chain = lock_or_recover(&self.chain);
        let mempool = lock_or_recover(&self.mempool);
        let utxos = lock_or_recover(&self.utxos);
        LedgerGuard {
            params: &self.params,
            chain,
            mempool,
            utxos,
            interrupt: &self.mine_interrupt,
        }
    }

    /// Connect a block received from a peer or the local miner
    pub fn connect_block(&self, block: Block) -> Option<usize> {
        self.lock().connect_block(block, false)
    }

    pub fn add_tx_to_mempool(&self, tx: Tx) -> MempoolAdmission {
        self.lock().add_tx_to_mempool(tx)
    }

    /// Drop everything but genesis
    pub fn reset(&self) {
        self.lock().reset();
    }

    pub fn mine_interrupt(&self) -> &AtomicBool {
        &self.mine_interrupt
    }

    pub fn is_initial_sync_complete(&self) -> bool {
        self.initial_sync_complete.load(Ordering::SeqCst)
    }

    pub fn set_initial_sync_complete(&self, complete: bool) {
        self.initial_sync_complete.store(complete, Ordering::SeqCst);
    }

    /// Number of blocks in the active chain
    pub fn height(&self) -> usize {
        lock_or_recover(&self.chain).height()
    }

    pub fn tip_id(&self) -> String {
        lock_or_recover(&self.chain).tip().id()
    }

    pub fn tip(&self) -> Block {
        lock_or_recover(&self.chain).tip().clone()
    }

    /// Copy of the active chain
    pub fn active_chain(&self) -> Vec<Block> {
        lock_or_recover(&self.chain).active_chain().to_vec()
    }

    pub fn mempool_tx_ids(&self) -> Vec<String> {
        lock_or_recover(&self.mempool).tx_ids()
    }

    pub fn balance(&self, address: &str) -> u64 {
        lock_or_recover(&self.utxos).balance(address)
    }

    pub fn utxos_snapshot(&self) -> UtxoSet {
        lock_or_recover(&self.utxos).clone()
    }
}

impl LedgerGuard<'_> {
    pub fn params(&self) -> &ChainParams {
        self.params
    }

    pub fn chain(&self) -> &ChainState {
        &self.chain
    }

    pub fn mempool(&self) -> &Mempool {
        &self.mempool
    }

    pub fn utxos(&self) -> &UtxoSet {
        &self.utxos
    }

    pub(crate) fn reset(&mut self) {
        let genesis = Block::genesis(self.params);
        self.utxos.clear();
        seed_genesis_outputs(&genesis, &mut self.utxos);
        self.mempool.clear();
        *self.chain = ChainState::new(genesis);
        info!("Ledger reset to genesis");
    }
}

fn seed_genesis_outputs(genesis: &Block, utxos: &mut UtxoSet) {
    for tx in &genesis.txs {
        let tx_id = tx.id();
        for (index, tx_out) in tx.outputs.iter().enumerate() {
            utxos.add(tx_out.clone(), &tx_id, index as i64, tx.is_coinbase(), 1);
        }
    }
}
