//! Chain state machine
//!
//! A block lives in exactly one place:
//! - the active chain (branch index 0), whose tip the UTXO index reflects
//! - one side branch (index 1..), forking off an interior active block
//! - the orphan pool, until its parent shows up
//!
//! `ChainState` is plain data. The operations that move blocks between those
//! places also touch the mempool and UTXO index, so they are implemented on
//! [`LedgerGuard`], which holds all three locks for the whole operation.

use crate::core::block::Block;
use crate::core::ledger::LedgerGuard;
use crate::core::params::ACTIVE_CHAIN_INDEX;
use crate::core::transaction::{
    Tx, TxIn, TxOut, TxValidationError, ValidateRequest, ValidationContext,
};
use crate::core::utxo::output_at;
use crate::mining::mempool::MempoolAdmission;
use crate::mining::pow::{block_subsidy, calculate_fees, next_required_difficulty};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use thiserror::Error;

/// Maximum number of orphan blocks waiting for a parent
pub const MAX_ORPHAN_BLOCKS: usize = 100;

// =============================================================================
// Error Types
// =============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BlockValidationError {
    #[error("Block has no transactions")]
    NoTransactions,
    #[error("Block timestamp {0} too far in the future")]
    TimestampInFuture(i64),
    #[error("Block header does not satisfy difficulty {0}")]
    InsufficientWork(u8),
    #[error("First transaction must be coinbase")]
    MissingCoinbase,
    #[error("Multiple coinbase transactions")]
    MultipleCoinbase,
    #[error("Transaction {tx_id} failed to validate: {source}")]
    InvalidTx {
        tx_id: String,
        #[source]
        source: TxValidationError,
    },
    #[error("Merkle hash invalid")]
    MerkleMismatch,
    #[error("Timestamp {timestamp} not after median time past {median}")]
    TimestampTooOld { timestamp: i64, median: i64 },
    #[error("Block has no previous block")]
    MissingParent,
    #[error("Previous block {prev} not found in any chain, orphaning block")]
    Orphan { prev: String, block: Box<Block> },
    /// The parent sits inside a side branch but is not its tip
    ///
    /// Side branches only grow at their tip. A new fork is opened only off a
    /// block of the active chain, so a branch never forks again.
    #[error("Previous block {0} is inside a side branch")]
    ForkOfSideBranch(String),
    #[error("Bits {actual} incorrect, expected {required}")]
    BadDifficulty { actual: u8, required: u8 },
    #[error("Coinbase pays {paid}, at most {allowed} allowed")]
    CoinbaseValueTooHigh { paid: u64, allowed: u64 },
}

impl BlockValidationError {
    /// The block to keep as an orphan, if this error carries one
    pub fn into_orphan(self) -> Option<Block> {
        match self {
            BlockValidationError::Orphan { block, .. } => Some(*block),
            _ => None,
        }
    }
}

// =============================================================================
// Lookups
// =============================================================================

/// Where a block sits: branch index and position inside that branch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLocation {
    pub branch: usize,
    pub position: usize,
}

/// A spent output recovered from the active chain
#[derive(Debug, Clone, PartialEq)]
pub struct FoundTxOut {
    pub tx_out: TxOut,
    pub is_coinbase: bool,
    /// Active-chain length once the creating block was connected
    pub height: i64,
}

// =============================================================================
// Chain State
// =============================================================================

/// Active chain, side branches and orphan blocks
#[derive(Debug, Clone)]
pub struct ChainState {
    active: Vec<Block>,
    side_branches: Vec<Vec<Block>>,
    orphan_blocks: Vec<Block>,
}

impl ChainState {
    pub fn new(genesis: Block) -> Self {
        Self {
            active: vec![genesis],
            side_branches: Vec::new(),
            orphan_blocks: Vec::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn from_blocks(blocks: Vec<Block>) -> Self {
        Self {
            active: blocks,
            side_branches: Vec::new(),
            orphan_blocks: Vec::new(),
        }
    }

    pub fn active_chain(&self) -> &[Block] {
        &self.active
    }

    pub fn side_branches(&self) -> &[Vec<Block>] {
        &self.side_branches
    }

    pub fn orphan_blocks(&self) -> &[Block] {
        &self.orphan_blocks
    }

    /// Number of blocks in the active chain, genesis included
    pub fn height(&self) -> usize {
        self.active.len()
    }

    /// Index of the active tip
    pub fn tip_height(&self) -> usize {
        self.active.len().saturating_sub(1)
    }

    pub fn tip(&self) -> &Block {
        // the active chain always holds genesis
        &self.active[self.active.len() - 1]
    }

    pub fn genesis(&self) -> &Block {
        &self.active[0]
    }

    /// Blocks of a branch by index, `0` being the active chain
    pub fn branch(&self, index: usize) -> Option<&[Block]> {
        if index == ACTIVE_CHAIN_INDEX {
            Some(&self.active)
        } else {
            self.side_branches.get(index - 1).map(Vec::as_slice)
        }
    }

    pub fn locate_block_in_active_chain(&self, block_id: &str) -> Option<(&Block, usize)> {
        self.active
            .iter()
            .enumerate()
            .find(|(_, block)| block.id() == block_id)
            .map(|(height, block)| (block, height))
    }

    /// Search the active chain first, then every side branch in order
    pub fn locate_block_in_all_chains(&self, block_id: &str) -> Option<(&Block, BlockLocation)> {
        std::iter::once(&self.active)
            .chain(self.side_branches.iter())
            .enumerate()
            .find_map(|(branch, blocks)| {
                blocks
                    .iter()
                    .position(|block| block.id() == block_id)
                    .map(|position| (&blocks[position], BlockLocation { branch, position }))
            })
    }

    /// Active-chain index of the block a side branch forks from
    pub fn fork_index(&self, branch: &[Block]) -> Option<usize> {
        let first = branch.first()?;
        self.locate_block_in_active_chain(first.prev_block_hash())
            .map(|(_, height)| height)
    }

    /// Height counted from genesis, for a block on any branch
    pub fn absolute_height(&self, location: BlockLocation) -> Option<usize> {
        if location.branch == ACTIVE_CHAIN_INDEX {
            return Some(location.position);
        }
        let branch = self.branch(location.branch)?;
        let fork = self.fork_index(branch)?;
        Some(fork + 1 + location.position)
    }

    /// Block at an absolute height, following `branch` above its fork point
    pub fn block_at(&self, branch: usize, height: usize) -> Option<&Block> {
        if branch == ACTIVE_CHAIN_INDEX {
            return self.active.get(height);
        }
        let blocks = self.branch(branch)?;
        let fork = self.fork_index(blocks)?;
        if height <= fork {
            self.active.get(height)
        } else {
            blocks.get(height - fork - 1)
        }
    }

    /// Median timestamp of the last `n` active blocks, `0` if there are
    /// fewer than `n`
    pub fn median_time_past(&self, n: usize) -> i64 {
        let len = self.active.len();
        if n == 0 || n > len {
            return 0;
        }

        let first = len - n;
        let mut mid = first + n / 2;
        if n % 2 == 0 {
            mid -= 1;
        }
        self.active[mid].header.timestamp
    }

    /// Locate the output `txin` spends in a block of the active chain
    pub fn find_tx_out_for_tx_in_in_active_chain(&self, txin: &TxIn) -> Option<FoundTxOut> {
        let to_spend = txin.to_spend.as_ref()?;
        self.active.iter().enumerate().find_map(|(height, block)| {
            block
                .txs
                .iter()
                .find(|tx| tx.id() == to_spend.tx_id)
                .and_then(|tx| {
                    output_at(tx, to_spend.output_index).map(|tx_out| FoundTxOut {
                        tx_out: tx_out.clone(),
                        is_coinbase: tx.is_coinbase(),
                        height: height as i64 + 1,
                    })
                })
        })
    }

    /// Whether a block id is known, on the active chain only or anywhere
    pub fn contains_block(&self, block_id: &str, active_only: bool) -> bool {
        if active_only {
            self.locate_block_in_active_chain(block_id).is_some()
        } else {
            self.locate_block_in_all_chains(block_id).is_some()
        }
    }

    fn push_orphan_block(&mut self, block: Block) {
        let block_id = block.id();
        if self.orphan_blocks.iter().any(|b| b.id() == block_id) {
            return;
        }
        if self.orphan_blocks.len() >= MAX_ORPHAN_BLOCKS {
            let evicted = self.orphan_blocks.remove(0);
            debug!("Orphan block pool full, evicting {}", evicted.id());
        }
        self.orphan_blocks.push(block);
    }

    fn append_to_branch(&mut self, branch_index: usize, block: Block) {
        if branch_index == ACTIVE_CHAIN_INDEX {
            self.active.push(block);
        } else if branch_index > self.side_branches.len() {
            self.side_branches.push(vec![block]);
        } else {
            self.side_branches[branch_index - 1].push(block);
        }
    }
}

// =============================================================================
// Chain Operations
// =============================================================================

impl LedgerGuard<'_> {
    /// Check a block and decide which branch it extends
    pub fn validate_block(&self, block: &Block) -> Result<usize, BlockValidationError> {
        let params = self.params;
        let header = &block.header;

        if block.txs.is_empty() {
            return Err(BlockValidationError::NoTransactions);
        }

        let now = chrono::Utc::now().timestamp();
        if header.timestamp - now > params.max_future_block_time_secs {
            return Err(BlockValidationError::TimestampInFuture(header.timestamp));
        }

        if !block.is_valid_pow() {
            return Err(BlockValidationError::InsufficientWork(header.bits));
        }

        if !block.txs[0].is_coinbase() {
            return Err(BlockValidationError::MissingCoinbase);
        }
        if block.txs[1..].iter().any(|tx| tx.is_coinbase()) {
            return Err(BlockValidationError::MultipleCoinbase);
        }

        for (i, tx) in block.txs.iter().enumerate() {
            tx.validate_basics(i == 0, params)
                .map_err(|source| BlockValidationError::InvalidTx {
                    tx_id: tx.id(),
                    source,
                })?;
        }

        if block.calculate_merkle_hash() != header.merkle_hash {
            return Err(BlockValidationError::MerkleMismatch);
        }

        let median = self.chain.median_time_past(params.median_time_past_blocks);
        if header.timestamp <= median {
            return Err(BlockValidationError::TimestampTooOld {
                timestamp: header.timestamp,
                median,
            });
        }

        let prev = block.prev_block_hash();
        if prev.is_empty() {
            return Err(BlockValidationError::MissingParent);
        }

        let location = match self.chain.locate_block_in_all_chains(prev) {
            Some((_, location)) => location,
            None => {
                return Err(BlockValidationError::Orphan {
                    prev: prev.to_string(),
                    block: Box::new(block.clone()),
                })
            }
        };

        let branch_index = if location.branch != ACTIVE_CHAIN_INDEX {
            let branch_len = self.chain.branch(location.branch).map_or(0, <[Block]>::len);
            if location.position + 1 != branch_len {
                return Err(BlockValidationError::ForkOfSideBranch(prev.to_string()));
            }
            location.branch
        } else if location.position == self.chain.tip_height() {
            ACTIVE_CHAIN_INDEX
        } else {
            self.chain.side_branches().len() + 1
        };

        let required = next_required_difficulty(&self.chain, params, prev);
        if header.bits != required {
            return Err(BlockValidationError::BadDifficulty {
                actual: header.bits,
                required,
            });
        }

        if branch_index == ACTIVE_CHAIN_INDEX {
            self.validate_block_txs(block)?;
        }

        Ok(branch_index)
    }

    /// Full validation of the transactions of a block extending the tip
    ///
    /// A transaction may spend outputs of the transactions before it in the
    /// block, never those after it.
    fn validate_block_txs(&self, block: &Block) -> Result<(), BlockValidationError> {
        let height = self.chain.height() as i64;
        let ctx = ValidationContext {
            utxos: &self.utxos,
            mempool: None,
            current_height: height,
            params: self.params,
        };

        let mut spent = HashSet::new();
        for (i, tx) in block.txs.iter().enumerate().skip(1) {
            let invalid = |source| BlockValidationError::InvalidTx {
                tx_id: tx.id(),
                source,
            };

            for point in tx.inputs.iter().filter_map(|txin| txin.to_spend.as_ref()) {
                if !spent.insert(point) {
                    return Err(invalid(TxValidationError::DoubleSpend(point.clone())));
                }
            }

            let req = ValidateRequest {
                siblings_in_block: &block.txs[1..i],
                ..ValidateRequest::default()
            };
            tx.validate(&ctx, &req).map_err(invalid)?;
        }

        let allowed = block_subsidy(self.params, height)
            .saturating_add(calculate_fees(block, &self.utxos));
        let paid = block.txs[0].output_value().unwrap_or(u64::MAX);
        if paid > allowed {
            return Err(BlockValidationError::CoinbaseValueTooHigh { paid, allowed });
        }

        Ok(())
    }

    /// Validate and attach a block
    ///
    /// Returns the branch the block landed on, or `None` if it was already
    /// known, rejected or orphaned. During a reorg replay a block that does
    /// not extend the active tip is refused.
    pub fn connect_block(&mut self, block: Block, is_reorg: bool) -> Option<usize> {
        let block_id = block.id();

        if self.chain.contains_block(&block_id, is_reorg) {
            debug!("Ignoring block already seen: {}", block_id);
            return None;
        }

        let branch_index = match self.validate_block(&block) {
            Ok(index) => index,
            Err(err) => {
                warn!("Block {} failed validation: {}", block_id, err);
                if let Some(orphan) = err.into_orphan() {
                    info!("Saw orphan block {}", block_id);
                    self.chain.push_orphan_block(orphan);
                }
                return None;
            }
        };

        if is_reorg && branch_index != ACTIVE_CHAIN_INDEX {
            info!("Reorg replay of block {} did not extend the active chain", block_id);
            return None;
        }

        info!("Connecting block {} to chain {}", block_id, branch_index);
        if branch_index == ACTIVE_CHAIN_INDEX {
            self.apply_block(&block);
        }
        self.chain.append_to_branch(branch_index, block);

        let reorged = !is_reorg && self.reorg_if_necessary();
        let tip_changed = reorged || branch_index == ACTIVE_CHAIN_INDEX;
        if tip_changed {
            info!("Block accepted, height {}", self.chain.tip_height());
            self.interrupt.store(true, Ordering::SeqCst);
        }

        if !is_reorg {
            self.process_orphan_blocks(&block_id);
            if tip_changed {
                self.reprocess_orphan_txs();
            }
        }

        Some(branch_index)
    }

    /// Move a block's effects into the mempool and UTXO index; the block is
    /// about to become the active tip
    fn apply_block(&mut self, block: &Block) {
        let height = self.chain.height() as i64 + 1;

        for tx in &block.txs {
            let tx_id = tx.id();
            self.mempool.remove(&tx_id);

            if !tx.is_coinbase() {
                for point in tx.inputs.iter().filter_map(|txin| txin.to_spend.as_ref()) {
                    self.utxos.remove(&point.tx_id, point.output_index);
                    if let Some(conflict) = self.mempool.spender_of(point).map(str::to_string) {
                        debug!("Evicting {} from mempool, {} spent by block", conflict, point);
                        self.mempool.remove(&conflict);
                    }
                }
            }

            for (index, tx_out) in tx.outputs.iter().enumerate() {
                self.utxos
                    .add(tx_out.clone(), &tx_id, index as i64, tx.is_coinbase(), height);
            }
        }
    }

    /// Pop the active tip, undoing its UTXO changes
    ///
    /// # Panics
    ///
    /// If `block` is not the active tip.
    pub fn disconnect_block(&mut self, block: &Block) -> Block {
        let block_id = block.id();
        assert_eq!(
            block_id,
            self.chain.tip().id(),
            "disconnect_block called on a block that is not the active tip"
        );

        for tx in block.txs.iter().rev() {
            let tx_id = tx.id();

            if !tx.is_coinbase() {
                self.mempool.insert(tx.clone());

                for txin in &tx.inputs {
                    let Some(point) = &txin.to_spend else {
                        continue;
                    };
                    let found = self
                        .chain
                        .find_tx_out_for_tx_in_in_active_chain(txin)
                        .unwrap_or_else(|| {
                            panic!("output {} spent by {} is not in the active chain", point, tx_id)
                        });
                    self.utxos.add(
                        found.tx_out,
                        &point.tx_id,
                        point.output_index,
                        found.is_coinbase,
                        found.height,
                    );
                }
            }

            for index in 0..tx.outputs.len() {
                self.utxos.remove(&tx_id, index as i64);
            }
        }

        info!("Block {} disconnected", block_id);
        self.chain
            .active
            .pop()
            .unwrap_or_else(|| panic!("active chain emptied while disconnecting {}", block_id))
    }

    /// Disconnect until `fork_id` is the tip; the blocks come back oldest first
    pub fn disconnect_to_fork(&mut self, fork_id: &str) -> Vec<Block> {
        assert!(
            self.chain.contains_block(fork_id, true),
            "fork block {} is not in the active chain",
            fork_id
        );

        let mut disconnected = Vec::new();
        while self.chain.tip().id() != fork_id {
            let tip = self.chain.tip().clone();
            disconnected.push(self.disconnect_block(&tip));
        }
        disconnected.reverse();
        disconnected
    }

    /// Switch to any side branch that has outgrown the active chain
    pub fn reorg_if_necessary(&mut self) -> bool {
        let mut reorged = false;
        let mut branch_index = 1;

        while branch_index <= self.chain.side_branches.len() {
            let branch = &self.chain.side_branches[branch_index - 1];
            let Some(fork_index) = self.chain.fork_index(branch) else {
                branch_index += 1;
                continue;
            };

            // index of the branch tip against the active chain length
            let branch_height = fork_index + branch.len();
            if branch_height > self.chain.height() && self.try_reorg(branch_index, fork_index)
            {
                reorged = true;
                branch_index = 1;
                continue;
            }
            branch_index += 1;
        }

        reorged
    }

    fn try_reorg(&mut self, branch_index: usize, fork_index: usize) -> bool {
        let branch = self.chain.side_branches[branch_index - 1].clone();
        let fork_id = self.chain.active[fork_index].id();
        info!(
            "Attempting reorg of side branch {} at fork height {}",
            branch_index, fork_index
        );

        let old_active = self.disconnect_to_fork(&fork_id);
        assert_eq!(
            branch[0].prev_block_hash(),
            self.chain.tip().id(),
            "side branch does not start at the fork block"
        );

        for block in branch {
            let block_id = block.id();
            if self.connect_block(block, true) != Some(ACTIVE_CHAIN_INDEX) {
                warn!("Reorg of side branch {} failed at block {}", branch_index, block_id);
                self.rollback_reorg(old_active, &fork_id, branch_index);
                return false;
            }
        }

        self.chain.side_branches.remove(branch_index - 1);
        if !old_active.is_empty() {
            self.chain.side_branches.push(old_active);
        }

        info!(
            "Chain reorganized to side branch {}, new height {}",
            branch_index,
            self.chain.tip_height()
        );
        true
    }

    /// Restore the active suffix replaced by a failed reorg
    ///
    /// # Panics
    ///
    /// If a block of the old suffix no longer reconnects.
    fn rollback_reorg(&mut self, old_active: Vec<Block>, fork_id: &str, branch_index: usize) {
        info!("Rolling back reorg of side branch {}", branch_index);
        self.disconnect_to_fork(fork_id);

        for block in old_active {
            let block_id = block.id();
            let landed = self.connect_block(block, true);
            assert_eq!(
                landed,
                Some(ACTIVE_CHAIN_INDEX),
                "block {} failed to reconnect during reorg rollback",
                block_id
            );
        }
    }

    fn process_orphan_blocks(&mut self, parent_id: &str) {
        let (ready, waiting): (Vec<Block>, Vec<Block>) = std::mem::take(&mut self.chain.orphan_blocks)
            .into_iter()
            .partition(|block| block.prev_block_hash() == parent_id);
        self.chain.orphan_blocks = waiting;

        for block in ready {
            debug!("Retrying orphan block {}", block.id());
            self.connect_block(block, false);
        }
    }

    /// Admit a transaction against the current tip
    pub fn add_tx_to_mempool(&mut self, tx: Tx) -> MempoolAdmission {
        let height = self.chain.height() as i64;
        let params = self.params;
        let utxos = &*self.utxos;
        self.mempool.add(tx, utxos, height, params)
    }

    fn reprocess_orphan_txs(&mut self) {
        let orphans = self.mempool.take_orphans();
        if orphans.is_empty() {
            return;
        }
        debug!("Retrying {} orphan transactions", orphans.len());
        for tx in orphans {
            self.add_tx_to_mempool(tx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ledger::LedgerState;
    use crate::core::params::ChainParams;
    use crate::core::transaction::TxOutPoint;
    use crate::crypto::KeyPair;
    use crate::test_utils::{build_block, next_block, signed_spend};

    fn chain_with_timestamps(timestamps: &[i64]) -> ChainState {
        let blocks = timestamps
            .iter()
            .map(|&ts| Block::new(0, String::new(), ts, 0, 0, vec![Tx::create_coinbase("a", 1, ts)]))
            .collect();
        ChainState::from_blocks(blocks)
    }

    fn utxo_ids(ledger: &LedgerState) -> Vec<String> {
        let guard = ledger.lock();
        let mut ids: Vec<String> = guard.utxos.iter().map(|u| u.tx_out_point.tx_id.clone()).collect();
        ids.sort();
        ids
    }

    fn coinbase_ids(blocks: &[Block]) -> Vec<String> {
        let mut ids: Vec<String> = blocks.iter().map(|b| b.txs[0].id()).collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_median_time_past() {
        let chain = chain_with_timestamps(&[1, 30, 60, 90, 400]);
        assert_eq!(chain.median_time_past(1), 400);
        assert_eq!(chain.median_time_past(2), 90);
        assert_eq!(chain.median_time_past(3), 90);
        assert_eq!(chain.median_time_past(5), 60);
        assert_eq!(chain.median_time_past(10), 0);
        assert_eq!(chain.median_time_past(0), 0);
    }

    #[test]
    fn test_connect_extends_active_chain() {
        let ledger = LedgerState::new(ChainParams::regtest());
        let block = next_block(&ledger, "miner", 1);
        let coinbase_id = block.txs[0].id();

        assert_eq!(ledger.connect_block(block.clone()), Some(ACTIVE_CHAIN_INDEX));
        assert_eq!(ledger.height(), 2);
        assert!(ledger.mine_interrupt().load(Ordering::SeqCst));

        let guard = ledger.lock();
        let utxo = guard.utxos.find(&TxOutPoint::new(coinbase_id, 0)).unwrap();
        assert!(utxo.is_coinbase);
        assert_eq!(utxo.height, 2);
        drop(guard);

        // a second delivery is a no-op
        assert_eq!(ledger.connect_block(block), None);
        assert_eq!(ledger.height(), 2);
    }

    #[test]
    fn test_tampered_nonce_rejected_without_mutation() {
        let ledger = LedgerState::new(ChainParams::regtest());
        let mut block = next_block(&ledger, "miner", 1);
        while block.is_valid_pow() {
            block.header.nonce = block.header.nonce.wrapping_add(1);
        }

        let utxos_before = utxo_ids(&ledger);
        assert_eq!(ledger.connect_block(block), None);

        let guard = ledger.lock();
        assert_eq!(guard.chain.height(), 1);
        assert!(guard.chain.side_branches().is_empty());
        assert!(guard.chain.orphan_blocks().is_empty());
        assert!(guard.mempool.is_empty());
        drop(guard);
        assert_eq!(utxo_ids(&ledger), utxos_before);
    }

    #[test]
    fn test_orphan_block_connects_after_parent() {
        let ledger = LedgerState::new(ChainParams::regtest());
        let genesis_id = ledger.tip_id();
        let first = build_block(&ledger, &genesis_id, "a", 1, 1);

        let other = LedgerState::new(ChainParams::regtest());
        other.connect_block(first.clone());
        let second = next_block(&other, "b", 2);

        assert_eq!(ledger.connect_block(second.clone()), None);
        assert_eq!(ledger.lock().chain.orphan_blocks().len(), 1);

        assert_eq!(ledger.connect_block(first), Some(ACTIVE_CHAIN_INDEX));
        assert_eq!(ledger.height(), 3);
        assert_eq!(ledger.tip_id(), second.id());
        assert!(ledger.lock().chain.orphan_blocks().is_empty());
    }

    #[test]
    fn test_reorg_to_taller_branch() {
        let params = ChainParams::regtest();
        let ledger_a = LedgerState::new(params.clone());
        let ledger_b = LedgerState::new(params.clone());

        let mut chain_a = Vec::new();
        for i in 1..=2 {
            let block = next_block(&ledger_a, "chain-a", i);
            assert_eq!(ledger_a.connect_block(block.clone()), Some(ACTIVE_CHAIN_INDEX));
            chain_a.push(block);
        }
        let mut chain_b = Vec::new();
        for i in 1..=4 {
            let block = next_block(&ledger_b, "chain-b", 100 + i);
            assert_eq!(ledger_b.connect_block(block.clone()), Some(ACTIVE_CHAIN_INDEX));
            chain_b.push(block);
        }

        let ledger = LedgerState::new(params);
        let genesis = ledger.lock().chain.genesis().clone();
        for block in &chain_a {
            ledger.connect_block(block.clone());
        }

        let mut active_a = vec![genesis.clone()];
        active_a.extend(chain_a.iter().cloned());
        assert_eq!(utxo_ids(&ledger), coinbase_ids(&active_a));

        // B grows as a side branch until its tip index passes A's length
        for (i, block) in chain_b.iter().take(3).enumerate() {
            assert_eq!(ledger.connect_block(block.clone()), Some(1));
            let guard = ledger.lock();
            assert_eq!(guard.chain.height(), 3);
            assert_eq!(guard.chain.tip().id(), chain_a[1].id());
            assert_eq!(guard.chain.side_branches().len(), 1);
            assert_eq!(guard.chain.side_branches()[0].len(), i + 1);
            assert!(guard.mempool.is_empty());
            drop(guard);
            assert_eq!(utxo_ids(&ledger), coinbase_ids(&active_a));
        }

        assert_eq!(ledger.connect_block(chain_b[3].clone()), Some(1));
        {
            let guard = ledger.lock();
            assert_eq!(guard.chain.height(), 5);
            assert_eq!(guard.chain.tip().id(), chain_b[3].id());
            assert_eq!(guard.chain.side_branches().len(), 1);
            let side: Vec<String> = guard.chain.side_branches()[0].iter().map(Block::id).collect();
            let expected: Vec<String> = chain_a.iter().map(Block::id).collect();
            assert_eq!(side, expected);
            assert!(guard.mempool.is_empty());
        }
        let mut active_b = vec![genesis];
        active_b.extend(chain_b.iter().cloned());
        assert_eq!(utxo_ids(&ledger), coinbase_ids(&active_b));
    }

    #[test]
    fn test_failed_reorg_rolls_back() {
        let params = ChainParams::regtest();
        let ledger = LedgerState::new(params.clone());
        let genesis = ledger.lock().chain.genesis().clone();
        for i in 1..=2 {
            ledger.connect_block(next_block(&ledger, "chain-a", i));
        }
        let tip_before = ledger.tip_id();
        let utxos_before = utxo_ids(&ledger);

        // B's third block spends the genesis output with the wrong key
        let ledger_b = LedgerState::new(params.clone());
        let mut chain_b = Vec::new();
        for i in 1..=2 {
            let block = next_block(&ledger_b, "chain-b", 100 + i);
            ledger_b.connect_block(block.clone());
            chain_b.push(block);
        }
        let theft = signed_spend(
            &KeyPair::generate(),
            TxOutPoint::new(genesis.txs[0].id(), 0),
            vec![TxOut::new(1, "thief")],
        );
        let mut bad = build_block(&ledger_b, &chain_b[1].id(), "chain-b", 103, params.initial_subsidy);
        bad.txs.push(theft.clone());
        bad.update_merkle_hash();
        crate::test_utils::solve(&mut bad);
        let after_bad = build_block(&ledger_b, &bad.id(), "chain-b", 104, params.initial_subsidy);
        chain_b.push(bad);
        chain_b.push(after_bad);

        for block in &chain_b {
            assert_eq!(ledger.connect_block(block.clone()), Some(1));
        }

        let guard = ledger.lock();
        assert_eq!(guard.chain.height(), 3);
        assert_eq!(guard.chain.tip().id(), tip_before);
        assert_eq!(guard.chain.side_branches().len(), 1);
        assert_eq!(guard.chain.side_branches()[0].len(), 4);
        assert!(guard.mempool.is_empty());
        assert!(!guard.mempool.contains(&theft.id()));
        drop(guard);
        assert_eq!(utxo_ids(&ledger), utxos_before);
    }

    #[test]
    fn test_reorg_returns_spends_to_mempool() {
        let params = ChainParams::regtest();
        let ledger = LedgerState::new(params.clone());
        let ledger_b = LedgerState::new(params.clone());
        let owner = KeyPair::generate();

        let funding = next_block(&ledger, &owner.address(), 1);
        let point = TxOutPoint::new(funding.txs[0].id(), 0);
        ledger.connect_block(funding.clone());
        ledger_b.connect_block(funding);
        for i in 2..=3 {
            let block = next_block(&ledger, "filler", i);
            ledger.connect_block(block.clone());
            ledger_b.connect_block(block);
        }

        let spend = signed_spend(
            &owner,
            point.clone(),
            vec![TxOut::new(params.initial_subsidy - 10, "bob")],
        );
        assert!(ledger.add_tx_to_mempool(spend.clone()).is_accepted());
        let with_spend = next_block(&ledger, "filler", 4);
        assert_eq!(with_spend.txs.len(), 2);
        ledger.connect_block(with_spend.clone());
        assert!(ledger.lock().mempool.is_empty());
        assert!(!ledger.lock().utxos.contains(&point));

        // a competing suffix off block 3 that never includes the spend
        let mut chain_b = Vec::new();
        for i in 1..=3 {
            let block = next_block(&ledger_b, "chain-b", 100 + i);
            ledger_b.connect_block(block.clone());
            chain_b.push(block);
        }
        for block in &chain_b {
            assert_eq!(ledger.connect_block(block.clone()), Some(1));
        }

        let guard = ledger.lock();
        assert_eq!(guard.chain.height(), 7);
        assert_eq!(guard.chain.tip().id(), chain_b[2].id());
        let side: Vec<String> = guard.chain.side_branches()[0].iter().map(Block::id).collect();
        assert_eq!(side, vec![with_spend.id()]);

        assert!(guard.mempool.contains(&spend.id()));
        assert!(!guard.mempool.contains(&with_spend.txs[0].id()));
        assert!(guard.utxos.contains(&point));
        assert!(!guard.utxos.contains(&TxOutPoint::new(spend.id(), 0)));
    }

    #[test]
    fn test_fork_of_side_branch_rejected() {
        let params = ChainParams::regtest();
        let ledger = LedgerState::new(params.clone());
        for i in 1..=2 {
            ledger.connect_block(next_block(&ledger, "chain-a", i));
        }

        let ledger_b = LedgerState::new(params.clone());
        let mut chain_b = Vec::new();
        for i in 1..=2 {
            let block = next_block(&ledger_b, "chain-b", 100 + i);
            ledger_b.connect_block(block.clone());
            assert_eq!(ledger.connect_block(block.clone()), Some(1));
            chain_b.push(block);
        }

        let fork = build_block(&ledger, &chain_b[0].id(), "chain-c", 200, params.initial_subsidy);
        let err = ledger.lock().validate_block(&fork).unwrap_err();
        assert!(matches!(err, BlockValidationError::ForkOfSideBranch(ref prev) if *prev == chain_b[0].id()));

        assert_eq!(ledger.connect_block(fork), None);
        let guard = ledger.lock();
        assert_eq!(guard.chain.side_branches().len(), 1);
        assert_eq!(guard.chain.side_branches()[0].len(), 2);
        assert!(guard.chain.orphan_blocks().is_empty());
    }

    #[test]
    fn test_spend_of_later_sibling_rejected() {
        let params = ChainParams::regtest();
        let ledger = LedgerState::new(params.clone());
        let owner = KeyPair::generate();
        let relay = KeyPair::generate();

        let funding = next_block(&ledger, &owner.address(), 1);
        let point = TxOutPoint::new(funding.txs[0].id(), 0);
        ledger.connect_block(funding);
        for i in 2..=3 {
            ledger.connect_block(next_block(&ledger, "filler", i));
        }

        let parent = signed_spend(&owner, point, vec![TxOut::new(100, relay.address())]);
        let child = signed_spend(&relay, TxOutPoint::new(parent.id(), 0), vec![TxOut::new(90, "bob")]);

        let tip = ledger.tip_id();
        let mut block = build_block(&ledger, &tip, "filler", 4, params.initial_subsidy);
        block.txs.push(child.clone());
        block.txs.push(parent.clone());
        block.update_merkle_hash();
        crate::test_utils::solve(&mut block);

        let err = ledger.lock().validate_block(&block).unwrap_err();
        assert!(matches!(
            err,
            BlockValidationError::InvalidTx {
                ref tx_id,
                source: TxValidationError::Orphan { .. },
            } if *tx_id == child.id()
        ));

        block.txs.swap(1, 2);
        block.update_merkle_hash();
        crate::test_utils::solve(&mut block);
        assert!(ledger.lock().validate_block(&block).is_ok());
    }

    #[test]
    fn test_disconnect_restores_spent_outputs() {
        let params = ChainParams::regtest();
        let ledger = LedgerState::new(params.clone());
        let owner = KeyPair::generate();

        let funding = next_block(&ledger, &owner.address(), 1);
        let coinbase_id = funding.txs[0].id();
        ledger.connect_block(funding);
        for i in 2..=3 {
            let block = next_block(&ledger, "filler", i);
            ledger.connect_block(block);
        }

        let spend = signed_spend(
            &owner,
            TxOutPoint::new(coinbase_id.clone(), 0),
            vec![TxOut::new(params.initial_subsidy - 10, "bob")],
        );
        assert!(ledger.add_tx_to_mempool(spend.clone()).is_accepted());

        let block = next_block(&ledger, "filler", 4);
        assert_eq!(block.txs.len(), 2);
        ledger.connect_block(block.clone());
        assert!(ledger.lock().mempool.is_empty());

        let mut guard = ledger.lock();
        assert!(!guard.utxos.contains(&TxOutPoint::new(coinbase_id.clone(), 0)));
        let popped = guard.disconnect_block(&block);
        assert_eq!(popped.id(), block.id());

        let restored = guard.utxos.find(&TxOutPoint::new(coinbase_id, 0)).unwrap();
        assert!(restored.is_coinbase);
        assert_eq!(restored.height, 2);
        assert!(!guard.utxos.contains(&TxOutPoint::new(spend.id(), 0)));
        assert!(guard.mempool.contains(&spend.id()));
        assert!(!guard.mempool.contains(&block.txs[0].id()));
    }

    #[test]
    #[should_panic(expected = "not the active tip")]
    fn test_disconnect_non_tip_panics() {
        let ledger = LedgerState::new(ChainParams::regtest());
        let block = next_block(&ledger, "miner", 1);
        ledger.connect_block(block);
        let genesis = ledger.lock().chain.genesis().clone();
        ledger.lock().disconnect_block(&genesis);
    }

    #[test]
    fn test_bad_coinbase_value_rejected() {
        let params = ChainParams::regtest();
        let ledger = LedgerState::new(params.clone());
        let genesis_id = ledger.tip_id();
        let block = build_block(&ledger, &genesis_id, "greedy", 1, params.initial_subsidy + 1);

        let err = ledger.lock().validate_block(&block).unwrap_err();
        assert!(matches!(err, BlockValidationError::CoinbaseValueTooHigh { .. }));
    }

    #[test]
    fn test_in_block_double_spend_rejected() {
        let params = ChainParams::regtest();
        let ledger = LedgerState::new(params.clone());
        let owner = KeyPair::generate();

        let funding = next_block(&ledger, &owner.address(), 1);
        let point = TxOutPoint::new(funding.txs[0].id(), 0);
        ledger.connect_block(funding);
        for i in 2..=3 {
            ledger.connect_block(next_block(&ledger, "filler", i));
        }

        let first = signed_spend(&owner, point.clone(), vec![TxOut::new(1, "bob")]);
        let second = signed_spend(&owner, point, vec![TxOut::new(2, "carol")]);
        let tip = ledger.tip_id();
        let mut block = build_block(&ledger, &tip, "filler", 4, params.initial_subsidy);
        block.txs.push(first);
        block.txs.push(second);
        block.update_merkle_hash();
        crate::test_utils::solve(&mut block);

        let err = ledger.lock().validate_block(&block).unwrap_err();
        assert!(matches!(
            err,
            BlockValidationError::InvalidTx {
                source: TxValidationError::DoubleSpend(_),
                ..
            }
        ));
    }
}
